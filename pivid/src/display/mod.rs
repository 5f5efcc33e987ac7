//! Display types and the atomic-commit driver contract.
//!
//! The playback core talks to screens through [`DisplayDriver`]: enumerate
//! connectors, import scanout buffers, submit one atomic commit at a time per
//! connector, and poll for retirement. The kernel mode-setting backend lives
//! behind this trait as an external collaborator; [`headless::HeadlessDriver`]
//! is the in-tree implementation used for development and tests.

pub mod headless;

use std::fmt;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use kurbo::Rect;
use smallvec::SmallVec;

use crate::foundation::error::PividResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgba8,
    Bgra8,
    Nv12,
}

impl PixelFormat {
    /// Bytes of one full frame at `width` x `height`.
    pub fn frame_bytes(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            Self::Rgba8 | Self::Bgra8 => pixels * 4,
            Self::Nv12 => pixels * 3 / 2,
        }
    }
}

/// Raw pixels ready to be imported for scanout.
#[derive(Clone)]
pub struct Image {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Image({:?} {}x{}, {} bytes)",
            self.format,
            self.width,
            self.height,
            self.bytes.len()
        )
    }
}

enum BufferStorage {
    Cpu(Vec<u8>),
    /// A dma-buf shared with the decode hardware; never copied.
    Dma(OwnedFd),
}

struct FrameBufferData {
    format: PixelFormat,
    width: u32,
    height: u32,
    storage: BufferStorage,
}

/// Reference-counted handle to an imported scanout buffer.
///
/// Clones share the underlying buffer; dropping the last handle returns it to
/// its allocator. The playback core never copies pixel data between handles.
#[derive(Clone)]
pub struct FrameBuffer {
    data: Arc<FrameBufferData>,
}

impl FrameBuffer {
    pub fn from_image(image: Image) -> Self {
        Self {
            data: Arc::new(FrameBufferData {
                format: image.format,
                width: image.width,
                height: image.height,
                storage: BufferStorage::Cpu(image.bytes),
            }),
        }
    }

    pub fn from_dma(format: PixelFormat, width: u32, height: u32, fd: OwnedFd) -> Self {
        Self {
            data: Arc::new(FrameBufferData {
                format,
                width,
                height,
                storage: BufferStorage::Dma(fd),
            }),
        }
    }

    pub fn format(&self) -> PixelFormat {
        self.data.format
    }

    pub fn width(&self) -> u32 {
        self.data.width
    }

    pub fn height(&self) -> u32 {
        self.data.height
    }

    pub fn size_bytes(&self) -> usize {
        match &self.data.storage {
            BufferStorage::Cpu(bytes) => bytes.len(),
            BufferStorage::Dma(_) => self.data.format.frame_bytes(self.data.width, self.data.height),
        }
    }

    /// CPU pixels, when this buffer is not a dma-buf import.
    pub fn cpu_bytes(&self) -> Option<&[u8]> {
        match &self.data.storage {
            BufferStorage::Cpu(bytes) => Some(bytes),
            BufferStorage::Dma(_) => None,
        }
    }

    /// Live handles to this buffer, including this one.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }

    pub fn same_buffer(a: &FrameBuffer, b: &FrameBuffer) -> bool {
        Arc::ptr_eq(&a.data, &b.data)
    }

    fn downgrade(&self) -> std::sync::Weak<FrameBufferData> {
        Arc::downgrade(&self.data)
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FrameBuffer({:?} {}x{})",
            self.data.format, self.data.width, self.data.height
        )
    }
}

/// One display timing; compared structurally.
#[derive(Clone, Debug, PartialEq)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    pub nominal_hz: f64,
    pub pixel_clock_khz: u32,
    pub name: String,
}

impl DisplayMode {
    pub fn new(width: u32, height: u32, nominal_hz: f64) -> Self {
        // Rough CVT-style blanking overhead for the synthetic pixel clock.
        let pixel_clock_khz =
            (width as f64 * height as f64 * nominal_hz * 1.25 / 1000.0).round() as u32;
        Self {
            width,
            height,
            nominal_hz,
            pixel_clock_khz,
            name: format!("{width}x{height}@{nominal_hz}"),
        }
    }

    pub fn refresh_period(&self) -> Duration {
        if self.nominal_hz > 0.0 {
            Duration::from_secs_f64(1.0 / self.nominal_hz)
        } else {
            Duration::from_millis(100)
        }
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Stable connector identifier within one process run.
pub type ConnectorId = u32;

#[derive(Clone, Debug)]
pub struct Screen {
    pub id: ConnectorId,
    pub connector: String,
    pub detected: bool,
    pub active_mode: Option<DisplayMode>,
    pub modes: Vec<DisplayMode>,
}

/// One plane of a composited output frame.
#[derive(Clone, Debug)]
pub struct DisplayLayer {
    pub buffer: FrameBuffer,
    /// Source rectangle in media pixels; may be fractional.
    pub from: Rect,
    /// Destination rectangle in screen pixels.
    pub to: Rect,
    pub alpha: f64,
}

/// Immutable plane list for one screen at one instant, bottom to top.
#[derive(Clone, Debug, Default)]
pub struct DisplayFrame {
    pub layers: SmallVec<[DisplayLayer; 4]>,
}

impl DisplayFrame {
    pub fn new(layers: impl IntoIterator<Item = DisplayLayer>) -> Self {
        Self {
            layers: layers.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

/// Atomic mode-setting capability.
///
/// At most one commit may be in flight per connector: `update` must only be
/// called after `update_done_yet` reports true (or before the first commit).
/// The driver holds references to every buffer of a submitted frame until the
/// commit retires and the frame leaves the screen.
pub trait DisplayDriver: Send + Sync {
    /// Live connector state; idempotent, may be called repeatedly.
    fn scan_screens(&self) -> PividResult<Vec<Screen>>;

    /// Import pixels into a buffer the hardware can scan out.
    ///
    /// Fails with `OutOfMemory` when the scanout allocator is exhausted;
    /// callers evict and retry.
    fn load_image(&self, image: Image) -> PividResult<FrameBuffer>;

    /// Schedule an atomic commit for `connector`.
    ///
    /// A commit with a changed mode is a blocking modeset; otherwise it is a
    /// flip that completes at the next vblank. `Busy` means the one-in-flight
    /// rule was violated; `Unsupported` means the frame needs simplification.
    fn update(
        &self,
        connector: ConnectorId,
        mode: &DisplayMode,
        frame: &DisplayFrame,
    ) -> PividResult<()>;

    /// True iff the previously submitted commit has retired on hardware.
    fn update_done_yet(&self, connector: ConnectorId) -> PividResult<bool>;
}
