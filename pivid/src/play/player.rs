//! The per-screen frame player.
//!
//! One thread per active screen owns the screen's timeline and presents the
//! newest eligible frame at each wakeup: frames whose scheduled time passed
//! unseen are counted and logged as skipped, never shown out of order. The
//! thread blocks on its wakeup flag between frames and while the previous
//! flip has not retired.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use smallvec::SmallVec;

use crate::display::{ConnectorId, DisplayDriver, DisplayFrame, DisplayMode};
use crate::foundation::clock::{Clock, Flag};
use crate::foundation::error::ErrorKind;
use crate::foundation::lock;
use crate::foundation::time::SteadyTime;
use crate::play::timeline::{Timeline, same_keys};

/// Poll interval while the previous commit has not retired.
const FLIP_RETRY_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlayerStats {
    pub presented: u64,
    pub skipped: u64,
}

struct PlayerState {
    timeline: Timeline,
    shown: Option<SteadyTime>,
    presented: u64,
    skipped: u64,
    /// Plane count the driver last accepted after an `Unsupported` commit.
    plane_floor: Option<usize>,
    shutdown: bool,
}

struct PlayerShared {
    clock: Arc<dyn Clock>,
    driver: Arc<dyn DisplayDriver>,
    connector: ConnectorId,
    mode: DisplayMode,
    state: Mutex<PlayerState>,
    wakeup: Flag,
}

pub struct FramePlayer {
    shared: Arc<PlayerShared>,
    thread: Option<JoinHandle<()>>,
}

impl FramePlayer {
    pub fn start(
        clock: Arc<dyn Clock>,
        driver: Arc<dyn DisplayDriver>,
        connector: ConnectorId,
        mode: DisplayMode,
    ) -> Self {
        let wakeup = Flag::new(Arc::clone(&clock));
        let shared = Arc::new(PlayerShared {
            clock,
            driver,
            connector,
            mode,
            state: Mutex::new(PlayerState {
                timeline: Timeline::new(),
                shown: None,
                presented: 0,
                skipped: 0,
                plane_floor: None,
                shutdown: false,
            }),
            wakeup,
        });
        tracing::debug!(connector, mode = %shared.mode, "launching frame player");
        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::spawn(move || player_thread(thread_shared));
        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Replace the whole timeline atomically.
    ///
    /// When the key schedule is unchanged the frames are refreshed in place
    /// and the player thread is left asleep.
    pub fn set_timeline(&self, timeline: Timeline) {
        let same;
        {
            let mut st = lock(&self.shared.state);
            same = same_keys(&timeline, &st.timeline);
            if tracing::enabled!(tracing::Level::TRACE) {
                match (timeline.first_key_value(), timeline.last_key_value()) {
                    (Some((first, _)), Some((last, _))) => tracing::trace!(
                        connector = self.shared.connector,
                        frames = timeline.len(),
                        "set timeline {first}~{last} {}",
                        if same { "[same]" } else { "[diff]" }
                    ),
                    _ => tracing::trace!(
                        connector = self.shared.connector,
                        "set timeline empty"
                    ),
                }
            }
            st.timeline = timeline;
            if st.timeline.is_empty() || same {
                return;
            }
        }
        self.shared.wakeup.set();
    }

    pub fn last_shown(&self) -> Option<SteadyTime> {
        lock(&self.shared.state).shown
    }

    pub fn stats(&self) -> PlayerStats {
        let st = lock(&self.shared.state);
        PlayerStats {
            presented: st.presented,
            skipped: st.skipped,
        }
    }

    /// Plane count the hardware proved it can take, when a commit has been
    /// refused before. The runner pre-simplifies frames to this.
    pub fn plane_floor(&self) -> Option<usize> {
        lock(&self.shared.state).plane_floor
    }

    pub fn mode(&self) -> &DisplayMode {
        &self.shared.mode
    }

    pub fn connector(&self) -> ConnectorId {
        self.shared.connector
    }
}

impl Drop for FramePlayer {
    fn drop(&mut self) {
        tracing::debug!(connector = self.shared.connector, "stopping frame player");
        lock(&self.shared.state).shutdown = true;
        self.shared.wakeup.set();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn player_thread(shared: Arc<PlayerShared>) {
    tracing::debug!(connector = shared.connector, "frame player thread running");
    let mut st = lock(&shared.state);
    while !st.shutdown {
        if st.timeline.is_empty() {
            drop(st);
            shared.wakeup.wait();
            st = lock(&shared.state);
            continue;
        }

        let now = shared.clock.steady_time();

        // Newest key whose time has come and that has not been shown yet.
        let show = st
            .timeline
            .range(..=now)
            .next_back()
            .map(|(k, v)| (*k, Arc::clone(v)))
            .filter(|(k, _)| st.shown.is_none_or(|shown| *k > shown));

        let Some((show_at, frame)) = show else {
            // Everything eligible was already presented; sleep to the next
            // future key (or until a new timeline arrives).
            let next = st
                .timeline
                .range(..)
                .map(|(k, _)| *k)
                .find(|k| *k > now);
            drop(st);
            match next {
                Some(at) => {
                    shared.wakeup.wait_until(at);
                }
                None => shared.wakeup.wait(),
            }
            st = lock(&shared.state);
            continue;
        };

        // Frames between the last shown and the one we are about to show
        // missed their slot: a graceful drop under overload.
        let skipped: Vec<SteadyTime> = st
            .timeline
            .range(..show_at)
            .map(|(k, _)| *k)
            .filter(|k| st.shown.is_none_or(|shown| *k > shown))
            .collect();
        for key in skipped {
            tracing::warn!(
                connector = shared.connector,
                sched = %key,
                age_ms = (now - key).as_millis() as u64,
                "skip frame"
            );
            st.skipped += 1;
            st.shown = Some(key);
        }

        let done = match shared.driver.update_done_yet(shared.connector) {
            Ok(done) => done,
            Err(e) => {
                tracing::warn!(connector = shared.connector, "update_done_yet: {e}");
                true
            }
        };
        if !done {
            drop(st);
            shared.wakeup.wait_until(now + FLIP_RETRY_INTERVAL);
            st = lock(&shared.state);
            continue;
        }

        present(&shared, &mut st, &frame);
        st.shown = Some(show_at);
        tracing::debug!(
            connector = shared.connector,
            sched = %show_at,
            lag_ms = (now - show_at).as_millis() as u64,
            "show frame"
        );
    }
    tracing::debug!(connector = shared.connector, "frame player thread ending");
}

/// Submit `frame`, dropping lowest-z planes while the driver refuses it.
fn present(shared: &Arc<PlayerShared>, st: &mut PlayerState, frame: &Arc<DisplayFrame>) {
    let mut dropped = 0usize;
    loop {
        let attempt;
        let submit: &DisplayFrame = if dropped == 0 {
            frame
        } else {
            attempt = DisplayFrame {
                layers: frame
                    .layers
                    .iter()
                    .skip(dropped)
                    .cloned()
                    .collect::<SmallVec<_>>(),
            };
            &attempt
        };

        match shared.driver.update(shared.connector, &shared.mode, submit) {
            Ok(()) => {
                st.presented += 1;
                if dropped > 0 {
                    st.plane_floor = Some(submit.layers.len());
                    tracing::warn!(
                        connector = shared.connector,
                        dropped,
                        "commit accepted after dropping planes"
                    );
                }
                return;
            }
            Err(e) if e.kind() == ErrorKind::Unsupported && dropped < frame.layers.len() => {
                dropped += 1;
            }
            Err(e) => {
                tracing::warn!(connector = shared.connector, "commit failed: {e}");
                return;
            }
        }
    }
}
