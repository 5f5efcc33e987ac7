//! Pivid plays timed, composited video by driving a display's atomic
//! mode-setting interface with hardware-decoded, zero-copy frames.
//!
//! The playback core is a time-driven scheduler:
//!
//! - a declarative [`script::Script`] says what each screen shows at each
//!   wall-clock moment, with cubic Bézier curves animating layer parameters;
//! - the [`play::ScriptRunner`] evaluates the script every tick and builds a
//!   [`play::Timeline`] of upcoming vsyncs per screen;
//! - a [`play::FramePlayer`] per screen presents the newest eligible frame
//!   through a [`display::DisplayDriver`], skipping late frames gracefully;
//! - the [`media::cache::FrameCache`] pulls decoded frames just in time and
//!   keeps memory bounded with explicit eviction.
//!
//! The kernel ioctl layer and the codec internals stay outside this crate:
//! the core defines what it requires of a display driver and a media decoder,
//! ships a headless driver and an ffmpeg-subprocess decoder, and injects
//! clocks so tests can drive time by hand.

#![forbid(unsafe_code)]

pub mod display;
pub mod foundation;
pub mod media;
pub mod play;
pub mod script;

pub use foundation::clock::{Clock, FakeClock, Flag, SystemClock};
pub use foundation::error::{ErrorKind, PividError, PividResult};
pub use foundation::time::{MediaTime, SteadyTime, WallTime};
pub use foundation::{Point, Rect};
