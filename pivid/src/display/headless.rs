//! A display driver without hardware: virtual connectors, simulated vblank.
//!
//! Used by tests and the CLI dry-run. Commits follow the same rules as the
//! kernel driver — one in flight per connector, blocking modesets, flips that
//! retire one refresh period after submission on the injected clock — and are
//! recorded in a per-connector journal.

use std::sync::{Arc, Mutex, Weak};

use crate::foundation::clock::Clock;
use crate::foundation::error::{PividError, PividResult};
use crate::foundation::lock;
use crate::foundation::time::SteadyTime;

use super::{
    ConnectorId, DisplayDriver, DisplayFrame, DisplayMode, FrameBuffer, Image, Screen,
};

#[derive(Clone, Debug)]
pub struct HeadlessOptions {
    /// Planes accepted per commit before `Unsupported`.
    pub plane_limit: usize,
    /// Byte budget for imported buffers; `None` means unbounded.
    pub import_budget: Option<usize>,
}

impl Default for HeadlessOptions {
    fn default() -> Self {
        Self {
            plane_limit: 8,
            import_budget: None,
        }
    }
}

/// A connector the headless driver exposes.
#[derive(Clone, Debug)]
pub struct VirtualScreen {
    pub connector: String,
    pub detected: bool,
    pub modes: Vec<DisplayMode>,
    /// Index into `modes` of the mode active at startup.
    pub active: Option<usize>,
}

impl VirtualScreen {
    /// A connected screen already running its first listed mode.
    pub fn connected(connector: impl Into<String>, modes: Vec<DisplayMode>) -> Self {
        Self {
            connector: connector.into(),
            detected: true,
            active: if modes.is_empty() { None } else { Some(0) },
            modes,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitKind {
    Modeset,
    Flip,
}

#[derive(Clone, Debug)]
pub struct CommitRecord {
    pub kind: CommitKind,
    pub submitted: SteadyTime,
    pub mode: DisplayMode,
    pub layer_count: usize,
}

struct InFlight {
    frame: DisplayFrame,
    retire_at: SteadyTime,
}

struct ConnectorState {
    connector: String,
    detected: bool,
    modes: Vec<DisplayMode>,
    committed_mode: Option<DisplayMode>,
    in_flight: Option<InFlight>,
    on_screen: Option<DisplayFrame>,
    journal: Vec<CommitRecord>,
}

struct DriverState {
    connectors: Vec<ConnectorState>,
    imports: Vec<Weak<super::FrameBufferData>>,
}

pub struct HeadlessDriver {
    clock: Arc<dyn Clock>,
    opts: HeadlessOptions,
    state: Mutex<DriverState>,
}

impl HeadlessDriver {
    pub fn new(clock: Arc<dyn Clock>, screens: Vec<VirtualScreen>, opts: HeadlessOptions) -> Self {
        let connectors = screens
            .into_iter()
            .map(|s| ConnectorState {
                committed_mode: s.active.and_then(|i| s.modes.get(i).cloned()),
                connector: s.connector,
                detected: s.detected,
                modes: s.modes,
                in_flight: None,
                on_screen: None,
                journal: Vec::new(),
            })
            .collect();
        Self {
            clock,
            opts,
            state: Mutex::new(DriverState {
                connectors,
                imports: Vec::new(),
            }),
        }
    }

    /// Commit journal for a connector, oldest first.
    pub fn commits(&self, connector: ConnectorId) -> Vec<CommitRecord> {
        let state = lock(&self.state);
        connector_ref(&state, connector)
            .map(|c| c.journal.clone())
            .unwrap_or_default()
    }

    /// `(modesets, flips)` submitted so far for a connector.
    pub fn commit_counts(&self, connector: ConnectorId) -> (usize, usize) {
        let journal = self.commits(connector);
        let modesets = journal
            .iter()
            .filter(|c| c.kind == CommitKind::Modeset)
            .count();
        (modesets, journal.len() - modesets)
    }

    /// The frame currently scanning out, if any.
    pub fn on_screen(&self, connector: ConnectorId) -> Option<DisplayFrame> {
        let mut state = lock(&self.state);
        let now = self.clock.steady_time();
        let c = connector_mut(&mut state, connector)?;
        retire_due(c, now);
        c.on_screen.clone()
    }

    fn live_import_bytes(state: &mut DriverState) -> usize {
        state.imports.retain(|w| w.strong_count() > 0);
        state
            .imports
            .iter()
            .filter_map(Weak::upgrade)
            .map(|data| FrameBuffer { data }.size_bytes())
            .sum()
    }
}

fn connector_ref(state: &DriverState, id: ConnectorId) -> Option<&ConnectorState> {
    state.connectors.get(id.checked_sub(1)? as usize)
}

fn connector_mut(state: &mut DriverState, id: ConnectorId) -> Option<&mut ConnectorState> {
    state.connectors.get_mut(id.checked_sub(1)? as usize)
}

/// Move a due in-flight commit onto the screen.
fn retire_due(c: &mut ConnectorState, now: SteadyTime) {
    let due = matches!(&c.in_flight, Some(f) if now >= f.retire_at);
    if due {
        if let Some(done) = c.in_flight.take() {
            c.on_screen = Some(done.frame);
        }
    }
}

impl DisplayDriver for HeadlessDriver {
    fn scan_screens(&self) -> PividResult<Vec<Screen>> {
        let state = lock(&self.state);
        Ok(state
            .connectors
            .iter()
            .enumerate()
            .map(|(i, c)| Screen {
                id: (i + 1) as ConnectorId,
                connector: c.connector.clone(),
                detected: c.detected,
                active_mode: c.committed_mode.clone(),
                modes: c.modes.clone(),
            })
            .collect())
    }

    fn load_image(&self, image: Image) -> PividResult<FrameBuffer> {
        let expected = image.format.frame_bytes(image.width, image.height);
        if image.bytes.len() != expected {
            return Err(PividError::format(format!(
                "image is {} bytes, {:?} {}x{} needs {expected}",
                image.bytes.len(),
                image.format,
                image.width,
                image.height
            )));
        }

        let mut state = lock(&self.state);
        if let Some(budget) = self.opts.import_budget {
            let live = Self::live_import_bytes(&mut state);
            if live + expected > budget {
                return Err(PividError::out_of_memory(format!(
                    "import budget exhausted ({live} of {budget} bytes in use)"
                )));
            }
        }
        let buffer = FrameBuffer::from_image(image);
        state.imports.push(buffer.downgrade());
        Ok(buffer)
    }

    fn update(
        &self,
        connector: ConnectorId,
        mode: &DisplayMode,
        frame: &DisplayFrame,
    ) -> PividResult<()> {
        let now = self.clock.steady_time();
        let mut state = lock(&self.state);
        let Some(c) = connector_mut(&mut state, connector) else {
            return Err(PividError::invalid(format!("unknown connector {connector}")));
        };

        retire_due(c, now);
        if c.in_flight.is_some() {
            return Err(PividError::busy(format!(
                "connector {connector} still has a commit in flight"
            )));
        }
        if frame.layers.len() > self.opts.plane_limit {
            return Err(PividError::unsupported(format!(
                "{} planes submitted, hardware limit is {}",
                frame.layers.len(),
                self.opts.plane_limit
            )));
        }
        if !c.modes.contains(mode) {
            return Err(PividError::unsupported(format!(
                "mode {mode} not offered by connector {connector}"
            )));
        }

        let modeset = c.committed_mode.as_ref() != Some(mode);
        c.journal.push(CommitRecord {
            kind: if modeset {
                CommitKind::Modeset
            } else {
                CommitKind::Flip
            },
            submitted: now,
            mode: mode.clone(),
            layer_count: frame.layers.len(),
        });

        if modeset {
            // Modesets block until complete; the frame is on screen when the
            // call returns.
            c.committed_mode = Some(mode.clone());
            c.on_screen = Some(frame.clone());
            tracing::debug!(connector, %mode, "modeset commit");
        } else {
            c.in_flight = Some(InFlight {
                frame: frame.clone(),
                retire_at: now + mode.refresh_period(),
            });
            tracing::trace!(connector, layers = frame.layers.len(), "flip commit");
        }
        Ok(())
    }

    fn update_done_yet(&self, connector: ConnectorId) -> PividResult<bool> {
        let now = self.clock.steady_time();
        let mut state = lock(&self.state);
        let Some(c) = connector_mut(&mut state, connector) else {
            return Err(PividError::invalid(format!("unknown connector {connector}")));
        };
        retire_due(c, now);
        Ok(c.in_flight.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::{DisplayLayer, PixelFormat};
    use crate::foundation::clock::FakeClock;
    use kurbo::Rect;

    fn rgba_image(width: u32, height: u32) -> Image {
        Image {
            format: PixelFormat::Rgba8,
            width,
            height,
            bytes: vec![0u8; (width * height * 4) as usize],
        }
    }

    fn full_frame(buffer: FrameBuffer, mode: &DisplayMode) -> DisplayFrame {
        let to = Rect::new(0.0, 0.0, mode.width as f64, mode.height as f64);
        let from = Rect::new(0.0, 0.0, buffer.width() as f64, buffer.height() as f64);
        DisplayFrame::new([DisplayLayer {
            buffer,
            from,
            to,
            alpha: 1.0,
        }])
    }

    fn driver_with_one_screen(
        clock: Arc<FakeClock>,
        opts: HeadlessOptions,
    ) -> (HeadlessDriver, DisplayMode) {
        let mode = DisplayMode::new(64, 36, 60.0);
        let driver = HeadlessDriver::new(
            clock,
            vec![VirtualScreen::connected("HDMI-1", vec![mode.clone()])],
            opts,
        );
        (driver, mode)
    }

    #[test]
    fn first_commit_is_a_modeset_when_mode_differs() {
        let clock = FakeClock::new();
        let mode = DisplayMode::new(64, 36, 60.0);
        let other = DisplayMode::new(32, 18, 30.0);
        let driver = HeadlessDriver::new(
            clock.clone(),
            vec![VirtualScreen {
                connector: "HDMI-1".into(),
                detected: true,
                modes: vec![mode.clone(), other.clone()],
                active: Some(0),
            }],
            HeadlessOptions::default(),
        );

        let buffer = driver.load_image(rgba_image(32, 18)).unwrap();
        driver.update(1, &other, &full_frame(buffer, &other)).unwrap();
        let journal = driver.commits(1);
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].kind, CommitKind::Modeset);
        // Modeset blocks, so the connector is immediately idle again.
        assert!(driver.update_done_yet(1).unwrap());
    }

    #[test]
    fn flip_retires_one_refresh_period_later() {
        let clock = FakeClock::new();
        let (driver, mode) = driver_with_one_screen(clock.clone(), HeadlessOptions::default());
        let buffer = driver.load_image(rgba_image(64, 36)).unwrap();

        driver
            .update(1, &mode, &full_frame(buffer.clone(), &mode))
            .unwrap();
        assert!(!driver.update_done_yet(1).unwrap());

        clock.advance(mode.refresh_period());
        assert!(driver.update_done_yet(1).unwrap());
        assert!(FrameBuffer::same_buffer(
            &driver.on_screen(1).unwrap().layers[0].buffer,
            &buffer
        ));
    }

    #[test]
    fn double_update_is_busy() {
        let clock = FakeClock::new();
        let (driver, mode) = driver_with_one_screen(clock.clone(), HeadlessOptions::default());
        let buffer = driver.load_image(rgba_image(64, 36)).unwrap();
        let frame = full_frame(buffer, &mode);

        driver.update(1, &mode, &frame).unwrap();
        let err = driver.update(1, &mode, &frame).expect_err("must be busy");
        assert_eq!(err.kind(), crate::foundation::error::ErrorKind::Busy);
    }

    #[test]
    fn plane_limit_is_unsupported() {
        let clock = FakeClock::new();
        let (driver, mode) = driver_with_one_screen(
            clock.clone(),
            HeadlessOptions {
                plane_limit: 1,
                import_budget: None,
            },
        );
        let b1 = driver.load_image(rgba_image(64, 36)).unwrap();
        let b2 = driver.load_image(rgba_image(64, 36)).unwrap();
        let mut frame = full_frame(b1, &mode);
        frame.layers.extend(full_frame(b2, &mode).layers);

        let err = driver.update(1, &mode, &frame).expect_err("too many planes");
        assert_eq!(err.kind(), crate::foundation::error::ErrorKind::Unsupported);
    }

    #[test]
    fn import_budget_reports_out_of_memory_until_buffers_drop() {
        let clock = FakeClock::new();
        let (driver, _mode) = driver_with_one_screen(
            clock.clone(),
            HeadlessOptions {
                plane_limit: 8,
                import_budget: Some(64 * 36 * 4),
            },
        );

        let first = driver.load_image(rgba_image(64, 36)).unwrap();
        let err = driver.load_image(rgba_image(64, 36)).expect_err("budget");
        assert_eq!(
            err.kind(),
            crate::foundation::error::ErrorKind::OutOfMemory
        );

        drop(first);
        driver.load_image(rgba_image(64, 36)).expect("space freed");
    }

    #[test]
    fn driver_holds_buffer_refs_until_replaced() {
        let clock = FakeClock::new();
        let (driver, mode) = driver_with_one_screen(clock.clone(), HeadlessOptions::default());
        let buffer = driver.load_image(rgba_image(64, 36)).unwrap();

        driver
            .update(1, &mode, &full_frame(buffer.clone(), &mode))
            .unwrap();
        clock.advance(mode.refresh_period());
        assert!(driver.update_done_yet(1).unwrap());
        // On-screen frame still references the buffer.
        assert!(buffer.handle_count() >= 2);

        let replacement = driver.load_image(rgba_image(64, 36)).unwrap();
        driver
            .update(1, &mode, &full_frame(replacement, &mode))
            .unwrap();
        clock.advance(mode.refresh_period());
        assert!(driver.update_done_yet(1).unwrap());
        assert_eq!(buffer.handle_count(), 1);
    }
}
