//! Shared fixtures for the playback integration tests.

use std::sync::Arc;
use std::time::Duration;

use pivid::display::{FrameBuffer, Image, PixelFormat};
use pivid::foundation::clock::FakeClock;
use pivid::media::{DecodedFrame, MediaDecoder, MediaInfo, MediaOpener};
use pivid::{MediaTime, PividResult};

/// A synthetic media library: every path decodes to `frame_count` frames at
/// `fps`, each tagged with its frame index in the first pixel byte so tests
/// can tell which frame (and which media) reached the screen.
pub struct SynthOpener {
    pub frame_count: u64,
    pub fps: f64,
    pub tag: u8,
}

impl SynthOpener {
    pub fn new(frame_count: u64, fps: f64, tag: u8) -> Arc<Self> {
        Arc::new(Self {
            frame_count,
            fps,
            tag,
        })
    }
}

impl MediaOpener for SynthOpener {
    fn probe(&self, _path: &str) -> PividResult<MediaInfo> {
        Ok(MediaInfo {
            width: 8,
            height: 8,
            pixel_format: "rgba".into(),
            codec: "synthetic".into(),
            frame_rate: self.fps,
            duration: Some(self.frame_count as f64 / self.fps.max(1.0)),
            bit_rate: None,
        })
    }

    fn open(&self, path: &str, seek: MediaTime) -> PividResult<Box<dyn MediaDecoder>> {
        // Paths under "empty/" decode to nothing: end of stream before the
        // first frame.
        let frame_count = if path.starts_with("empty/") {
            0
        } else {
            self.frame_count
        };
        let start = (seek.as_secs_f64() * self.fps).floor() as u64;
        Ok(Box::new(SynthDecoder {
            info: self.probe("")?,
            fps: self.fps,
            tag: self.tag,
            next: start.min(frame_count),
            frame_count,
        }))
    }
}

pub struct SynthDecoder {
    info: MediaInfo,
    fps: f64,
    tag: u8,
    next: u64,
    frame_count: u64,
}

impl MediaDecoder for SynthDecoder {
    fn info(&self) -> &MediaInfo {
        &self.info
    }

    fn seek_before(&mut self, ts: MediaTime) -> PividResult<()> {
        self.next = ((ts.as_secs_f64() * self.fps).floor() as u64).min(self.frame_count);
        Ok(())
    }

    fn next_frame(&mut self) -> PividResult<Option<DecodedFrame>> {
        if self.next >= self.frame_count {
            return Ok(None);
        }
        let index = self.next;
        self.next += 1;

        let mut bytes = vec![0u8; 8 * 8 * 4];
        bytes[0] = self.tag;
        bytes[1] = index as u8;
        Ok(Some(DecodedFrame {
            // A zero rate marks a still image; its one frame sits at pts 0.
            pts: Duration::from_secs_f64(index as f64 / self.fps.max(1.0)),
            buffer: FrameBuffer::from_image(Image {
                format: PixelFormat::Rgba8,
                width: 8,
                height: 8,
                bytes,
            }),
        }))
    }

    fn at_eof(&self) -> bool {
        self.next >= self.frame_count
    }
}

/// Advance fake time in small steps with real pauses in between, so the
/// player, runner, and decoder threads keep pace with the clock.
pub fn advance_interleaved(clock: &Arc<FakeClock>, total: Duration, step: Duration) {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        let this = remaining.min(step);
        clock.advance(this);
        remaining -= this;
        std::thread::sleep(Duration::from_millis(3));
    }
}

/// Spin (in real time) until `probe` holds, failing after a few seconds.
pub fn wait_for(mut probe: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if probe() {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("condition not reached within four seconds");
}
