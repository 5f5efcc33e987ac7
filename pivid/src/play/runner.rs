//! The script runner: the main loop that turns a posted script into
//! per-screen timelines.
//!
//! Each tick evaluates every visible layer at the upcoming vsync instants,
//! asks the frame cache for the frames those instants need, hands the
//! assembled timelines to the per-screen players, and prunes the cache below
//! the oldest pts still referenced. Posting a script swaps it under the
//! runner lock and wakes the loop; frames already committed play out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use smallvec::SmallVec;

use crate::display::{DisplayDriver, DisplayFrame, DisplayLayer, DisplayMode, Screen};
use crate::foundation::clock::{Clock, Flag};
use crate::foundation::error::{PividError, PividResult};
use crate::foundation::lock;
use crate::foundation::time::{MediaTime, SteadyTime, WallTime, media_time_from_secs};
use crate::media::MediaOpener;
use crate::media::cache::{CacheOptions, Coverage, FrameCache, MediaKey};
use crate::play::player::{FramePlayer, PlayerStats};
use crate::play::timeline::Timeline;
use crate::script::{LayerPlacement, LayerPlan, ModeHint, Script, ZeroTime};

/// One screen of the active script, resolved against the scanned hardware.
struct ScreenPlan {
    name: String,
    connector: crate::display::ConnectorId,
    mode: DisplayMode,
    layers: Vec<LayerPlan>,
}

/// A posted script anchored to the clocks at post time.
struct ActiveScript {
    script: Arc<Script>,
    screens: Vec<ScreenPlan>,
    zero_wall: WallTime,
    epoch_steady: SteadyTime,
    epoch_wall: WallTime,
}

impl ActiveScript {
    /// Script-relative seconds at a steady instant.
    fn rel_secs(&self, at: SteadyTime) -> f64 {
        let wall = self.epoch_wall + (at - self.epoch_steady).as_secs_f64();
        wall - self.zero_wall
    }
}

struct RunnerState {
    active: Option<Arc<ActiveScript>>,
    shutdown: bool,
}

pub struct ScriptRunner {
    clock: Arc<dyn Clock>,
    driver: Arc<dyn DisplayDriver>,
    cache: FrameCache,
    state: Mutex<RunnerState>,
    wakeup: Flag,
    players: Mutex<HashMap<String, FramePlayer>>,
}

impl ScriptRunner {
    pub fn new(
        clock: Arc<dyn Clock>,
        driver: Arc<dyn DisplayDriver>,
        opener: Arc<dyn MediaOpener>,
        cache_opts: CacheOptions,
    ) -> Self {
        let cache = FrameCache::new(Arc::clone(&clock), opener, cache_opts);
        let wakeup = Flag::new(Arc::clone(&clock));
        Self {
            clock,
            driver,
            cache,
            state: Mutex::new(RunnerState {
                active: None,
                shutdown: false,
            }),
            wakeup,
            players: Mutex::new(HashMap::new()),
        }
    }

    /// Validate a script against the scanned hardware and make it active.
    ///
    /// On any error the previous script stays in effect. The new script is
    /// picked up on the next tick.
    pub fn post_script(&self, script: Script) -> PividResult<()> {
        script.validate()?;
        let screens = self.driver.scan_screens()?;

        let mut plans = Vec::new();
        for (name, cfg) in &script.screens {
            let screen = screens
                .iter()
                .find(|s| &s.connector == name)
                .ok_or_else(|| PividError::invalid(format!("unknown screen \"{name}\"")))?;
            if !screen.detected {
                tracing::warn!(screen = %name, "screen not connected, skipping");
                continue;
            }
            let mode = resolve_mode(screen, cfg.mode)?;
            let layers = cfg
                .layers
                .iter()
                .map(|l| l.compile())
                .collect::<PividResult<Vec<_>>>()?;
            plans.push(ScreenPlan {
                name: name.clone(),
                connector: screen.id,
                mode,
                layers,
            });
        }

        let epoch_steady = self.clock.steady_time();
        let epoch_wall = self.clock.wall_time();
        let zero_wall = match script.zero_time {
            ZeroTime::Now => epoch_wall,
            ZeroTime::At(secs) => WallTime(secs),
        };
        tracing::info!(
            screens = plans.len(),
            zero = zero_wall.seconds(),
            "script posted"
        );

        let active = Arc::new(ActiveScript {
            script: Arc::new(script),
            screens: plans,
            zero_wall,
            epoch_steady,
            epoch_wall,
        });
        lock(&self.state).active = Some(active);
        self.wakeup.set();
        Ok(())
    }

    /// Request a graceful stop; `run` drains players and returns.
    pub fn shutdown(&self) {
        lock(&self.state).shutdown = true;
        self.wakeup.set();
    }

    /// The blocking main loop. Returns after [`ScriptRunner::shutdown`].
    pub fn run(&self) {
        tracing::info!("script runner running");
        loop {
            let tick_start = self.clock.steady_time();
            let active = {
                let st = lock(&self.state);
                if st.shutdown {
                    break;
                }
                st.active.clone()
            };
            match active {
                None => self.wakeup.wait(),
                Some(active) => {
                    self.tick(&active);
                    let period = Duration::from_secs_f64(1.0 / active.script.main_loop_hz);
                    self.wakeup.wait_until(tick_start + period);
                }
            }
        }
        lock(&self.players).clear();
        tracing::info!("script runner stopped");
    }

    pub fn cache(&self) -> &FrameCache {
        &self.cache
    }

    pub fn player_stats(&self, screen: &str) -> Option<PlayerStats> {
        lock(&self.players).get(screen).map(FramePlayer::stats)
    }

    pub fn last_shown(&self, screen: &str) -> Option<SteadyTime> {
        lock(&self.players).get(screen).and_then(FramePlayer::last_shown)
    }

    fn tick(&self, active: &ActiveScript) {
        let now = self.clock.steady_time();
        let mut players = lock(&self.players);
        players.retain(|name, _| active.screens.iter().any(|s| &s.name == name));

        let mut keep: HashMap<MediaKey, MediaTime> = HashMap::new();
        for plan in &active.screens {
            let stale = players
                .get(&plan.name)
                .is_some_and(|p| p.mode() != &plan.mode);
            if stale {
                // A mode change restarts the player; its first commit after
                // restart is the modeset.
                players.remove(&plan.name);
            }
            let player = players.entry(plan.name.clone()).or_insert_with(|| {
                FramePlayer::start(
                    Arc::clone(&self.clock),
                    Arc::clone(&self.driver),
                    plan.connector,
                    plan.mode.clone(),
                )
            });

            let timeline = build_timeline(
                &self.cache,
                active,
                plan,
                player.plane_floor(),
                now,
                &mut keep,
            );
            player.set_timeline(timeline);
        }
        drop(players);

        // Referenced keys shrink to their oldest wanted pts; keys no script
        // layer references any more are emptied outright.
        for key in self.cache.keys() {
            match keep.get(&key) {
                Some(lo) => self.cache.prune(&key, *lo),
                None => self.cache.prune(&key, MediaTime::MAX),
            }
        }
    }
}

impl Drop for ScriptRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Pick the concrete mode for a screen: the hint if the hardware offers it,
/// otherwise whatever is already active.
fn resolve_mode(screen: &Screen, hint: Option<ModeHint>) -> PividResult<DisplayMode> {
    match hint {
        Some(ModeHint(w, h, hz)) => screen
            .modes
            .iter()
            .find(|m| m.width == w && m.height == h && (m.nominal_hz - hz).abs() < 0.5)
            .cloned()
            .ok_or_else(|| {
                PividError::invalid(format!(
                    "screen \"{}\" has no mode {w}x{h}@{hz}",
                    screen.connector
                ))
            }),
        None => screen.active_mode.clone().ok_or_else(|| {
            PividError::invalid(format!(
                "screen \"{}\" is idle and the script names no mode",
                screen.connector
            ))
        }),
    }
}

/// Vsync-aligned instants in `(now, now + lookahead]`.
fn vsync_grid(now: SteadyTime, period: Duration, lookahead: Duration) -> Vec<SteadyTime> {
    let period_ns = period.as_nanos().max(1);
    let mut idx = now.since_origin().as_nanos() / period_ns + 1;
    let end = now + lookahead;
    let mut grid = Vec::new();
    loop {
        let at = SteadyTime::from_origin(Duration::from_nanos((idx * period_ns) as u64));
        if at > end {
            return grid;
        }
        grid.push(at);
        idx += 1;
    }
}

struct LayerCells {
    placements: Vec<Option<LayerPlacement>>,
    coverage: Coverage,
}

fn build_timeline(
    cache: &FrameCache,
    active: &ActiveScript,
    plan: &ScreenPlan,
    plane_floor: Option<usize>,
    now: SteadyTime,
    keep: &mut HashMap<MediaKey, MediaTime>,
) -> Timeline {
    let vsync = plan.mode.refresh_period();
    let lookahead =
        Duration::from_secs_f64((2.0 / active.script.main_loop_hz).max(1.0));
    let grid = vsync_grid(now, vsync, lookahead);
    let mut timeline = Timeline::new();
    if grid.is_empty() {
        return timeline;
    }

    let mut cells: Vec<LayerCells> = Vec::with_capacity(plan.layers.len());
    for layer in &plan.layers {
        let culled = LayerCells {
            placements: vec![None; grid.len()],
            coverage: Coverage::default(),
        };
        let info = match cache.media_info(&layer.media) {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(media = %layer.media, "media unavailable: {e}");
                cells.push(culled);
                continue;
            }
        };
        let ctx = crate::script::LayerEvalContext {
            screen_size: (plan.mode.width as f64, plan.mode.height as f64),
            media_size: (info.width as f64, info.height as f64),
            media_duration: info.duration,
        };
        let placements: Vec<Option<LayerPlacement>> = grid
            .iter()
            .map(|g| layer.evaluate(active.rel_secs(*g), &ctx))
            .collect();

        let mut wanted = placements.iter().flatten().map(|p| p.media_pts);
        let Some(first) = wanted.next() else {
            cells.push(culled);
            continue;
        };
        let (mut min_pts, mut max_pts) = (first, first);
        for pts in wanted {
            min_pts = min_pts.min(pts);
            max_pts = max_pts.max(pts);
        }

        let opts = active.script.media_options(&layer.media);
        let key = MediaKey::new(layer.media.clone(), media_time_from_secs(opts.seek));
        // Reach slightly below the oldest wanted pts so "newest frame at or
        // before" has a candidate even between frame times.
        let lo = media_time_from_secs(min_pts - 2.0 * info.frame_period());
        let hi = media_time_from_secs(max_pts + opts.buffer_ahead);
        let coverage = cache.frames_in(&key, lo, hi);
        keep.entry(key)
            .and_modify(|k| *k = (*k).min(lo))
            .or_insert(lo);
        cells.push(LayerCells {
            placements,
            coverage,
        });
    }

    'instant: for (i, at) in grid.iter().enumerate() {
        let mut layers: SmallVec<[DisplayLayer; 4]> = SmallVec::new();
        for cell in &cells {
            let Some(placement) = cell.placements[i] else {
                continue;
            };
            let wanted_pts = media_time_from_secs(placement.media_pts);
            match cell.coverage.best_at_or_before(wanted_pts) {
                Some(frame) => layers.push(DisplayLayer {
                    buffer: frame.buffer.clone(),
                    from: placement.media_rect,
                    to: placement.screen_rect,
                    alpha: placement.alpha,
                }),
                None => {
                    if cell.coverage.at_eof && cell.coverage.frames.is_empty() {
                        // This media will never contribute here; the other
                        // layers still play.
                        continue;
                    }
                    // Not decoded yet: leave the instant out, the player
                    // repeats its previous frame.
                    continue 'instant;
                }
            }
        }
        if let Some(floor) = plane_floor {
            if layers.len() > floor {
                // Drop low-z planes first, as on an Unsupported commit.
                let excess = layers.len() - floor;
                layers.drain(..excess);
            }
        }
        timeline.insert(*at, Arc::new(DisplayFrame { layers }));
    }
    timeline
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::headless::{HeadlessDriver, HeadlessOptions, VirtualScreen};
    use crate::display::{FrameBuffer, Image, PixelFormat};
    use crate::foundation::clock::FakeClock;
    use crate::foundation::error::ErrorKind;
    use crate::media::{DecodedFrame, MediaDecoder, MediaInfo};

    struct OneFrameDecoder {
        info: MediaInfo,
        emitted: bool,
    }

    impl MediaDecoder for OneFrameDecoder {
        fn info(&self) -> &MediaInfo {
            &self.info
        }

        fn seek_before(&mut self, _ts: MediaTime) -> PividResult<()> {
            Ok(())
        }

        fn next_frame(&mut self) -> PividResult<Option<DecodedFrame>> {
            if self.emitted {
                return Ok(None);
            }
            self.emitted = true;
            Ok(Some(DecodedFrame {
                pts: MediaTime::ZERO,
                buffer: FrameBuffer::from_image(Image {
                    format: PixelFormat::Rgba8,
                    width: 4,
                    height: 4,
                    bytes: vec![0u8; 64],
                }),
            }))
        }

        fn at_eof(&self) -> bool {
            self.emitted
        }
    }

    struct StillOpener;

    impl MediaOpener for StillOpener {
        fn probe(&self, _path: &str) -> PividResult<MediaInfo> {
            Ok(MediaInfo {
                width: 4,
                height: 4,
                pixel_format: "rgba".into(),
                codec: "png".into(),
                frame_rate: 0.0,
                duration: None,
                bit_rate: None,
            })
        }

        fn open(&self, _path: &str, _seek: MediaTime) -> PividResult<Box<dyn MediaDecoder>> {
            Ok(Box::new(OneFrameDecoder {
                info: self.probe("")?,
                emitted: false,
            }))
        }
    }

    fn runner_fixture() -> (Arc<FakeClock>, Arc<HeadlessDriver>, Arc<ScriptRunner>) {
        let clock = FakeClock::new();
        let mode = DisplayMode::new(64, 36, 60.0);
        let driver = Arc::new(HeadlessDriver::new(
            clock.clone(),
            vec![VirtualScreen {
                connector: "HDMI-1".into(),
                detected: true,
                modes: vec![mode],
                active: None,
            }],
            HeadlessOptions::default(),
        ));
        let runner = Arc::new(ScriptRunner::new(
            clock.clone(),
            driver.clone(),
            Arc::new(StillOpener),
            CacheOptions::default(),
        ));
        (clock, driver, runner)
    }

    fn still_script() -> Script {
        Script::from_json(
            r#"{
                "screens": {
                    "HDMI-1": {
                        "mode": [64, 36, 60.0],
                        "layers": [{"media": "card.png"}]
                    }
                }
            }"#,
        )
        .expect("valid script")
    }

    #[test]
    fn unknown_screen_is_rejected_as_invalid() {
        let (_clock, _driver, runner) = runner_fixture();
        let script = Script::from_json(
            r#"{"screens": {"DP-9": {"layers": [{"media": "card.png"}]}}}"#,
        )
        .expect("parses");
        let err = runner.post_script(script).expect_err("rejected");
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[test]
    fn unavailable_mode_hint_is_rejected_as_invalid() {
        let (_clock, _driver, runner) = runner_fixture();
        let script = Script::from_json(
            r#"{"screens": {"HDMI-1": {"mode": [3840, 2160, 60.0],
                "layers": [{"media": "card.png"}]}}}"#,
        )
        .expect("parses");
        let err = runner.post_script(script).expect_err("rejected");
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[test]
    fn rejecting_a_script_keeps_the_previous_one_active() {
        let (_clock, _driver, runner) = runner_fixture();
        runner.post_script(still_script()).expect("first accepted");
        let bad = Script::from_json(
            r#"{"screens": {"DP-9": {"layers": [{"media": "x.png"}]}}}"#,
        )
        .expect("parses");
        runner.post_script(bad).expect_err("rejected");
        let st = lock(&runner.state);
        let active = st.active.as_ref().expect("still active");
        assert!(active.script.screens.contains_key("HDMI-1"));
    }

    #[test]
    fn vsync_grid_is_aligned_and_bounded() {
        let now = SteadyTime::from_origin(Duration::from_millis(1_005));
        let grid = vsync_grid(now, Duration::from_millis(10), Duration::from_millis(50));
        assert_eq!(grid.len(), 5);
        assert_eq!(grid[0], SteadyTime::from_origin(Duration::from_millis(1_010)));
        assert!(grid.windows(2).all(|w| w[1] - w[0] == Duration::from_millis(10)));
        assert!(*grid.last().expect("non-empty") <= now + Duration::from_millis(50));
    }

    #[test]
    fn still_image_playback_does_modeset_then_flips() {
        let (clock, driver, runner) = runner_fixture();
        runner.post_script(still_script()).expect("accepted");

        let loop_runner = runner.clone();
        let handle = std::thread::spawn(move || loop_runner.run());

        // Half a second of fake time, stepped so the threads keep up.
        for _ in 0..125 {
            clock.advance(Duration::from_millis(4));
            std::thread::sleep(Duration::from_millis(1));
        }

        runner.shutdown();
        handle.join().expect("runner thread");

        let (modesets, flips) = driver.commit_counts(1);
        assert_eq!(modesets, 1, "exactly one modeset");
        assert!(flips >= 10, "flips kept coming, got {flips}");
    }
}
