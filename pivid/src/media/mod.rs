//! Media decoding: the decoder contract, the ffmpeg backend, and the
//! decoded-frame cache that feeds the script runner.

pub mod cache;
pub mod ffmpeg;

use std::fmt;

use crate::display::FrameBuffer;
use crate::foundation::error::PividResult;
use crate::foundation::time::MediaTime;

/// Metadata of an opened media file.
#[derive(Clone, Debug, PartialEq)]
pub struct MediaInfo {
    pub width: u32,
    pub height: u32,
    /// Source pixel format as reported by the container, e.g. "yuv420p".
    pub pixel_format: String,
    pub codec: String,
    pub frame_rate: f64,
    /// Stream duration in seconds, when the container knows it.
    pub duration: Option<f64>,
    pub bit_rate: Option<u64>,
}

impl MediaInfo {
    /// Seconds of one frame at the nominal rate.
    pub fn frame_period(&self) -> f64 {
        if self.frame_rate > 0.0 {
            1.0 / self.frame_rate
        } else {
            1.0 / 30.0
        }
    }
}

/// One decoded frame: its presentation time and the scanout buffer.
#[derive(Clone)]
pub struct DecodedFrame {
    /// Presentation timestamp from the stream origin.
    pub pts: MediaTime,
    pub buffer: FrameBuffer,
}

impl fmt::Debug for DecodedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DecodedFrame({:.3}s, {:?})", self.pts.as_secs_f64(), self.buffer)
    }
}

/// A running decode pipeline for one media stream.
///
/// `next_frame` is a non-blocking pull: `Ok(None)` means the decoder is
/// working but has nothing ready yet; end of stream is reported through
/// `at_eof`. Outside of seeks, frames arrive with non-decreasing pts.
pub trait MediaDecoder: Send {
    fn info(&self) -> &MediaInfo;

    /// Reposition so the next frame is a keyframe at or before `ts`.
    fn seek_before(&mut self, ts: MediaTime) -> PividResult<()>;

    fn next_frame(&mut self) -> PividResult<Option<DecodedFrame>>;

    /// True once the stream is exhausted and the queue drained.
    fn at_eof(&self) -> bool;
}

/// Capability to open media below a fixed root.
///
/// The cache and runner depend only on this; the production implementation is
/// [`ffmpeg::FfmpegOpener`].
pub trait MediaOpener: Send + Sync {
    /// Synchronously read metadata without starting a decode pipeline.
    fn probe(&self, path: &str) -> PividResult<MediaInfo>;

    /// Start decoding `path` from `seek`.
    fn open(&self, path: &str, seek: MediaTime) -> PividResult<Box<dyn MediaDecoder>>;
}
