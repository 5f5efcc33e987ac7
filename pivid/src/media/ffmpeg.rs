//! Media decoding through the system `ffmpeg`/`ffprobe` binaries.
//!
//! `ffprobe` supplies metadata; a spawned `ffmpeg` streams raw RGBA frames
//! over a pipe, and a reader thread keeps a short output queue filled so
//! `next_frame` can return without blocking. Seeking respawns the pipeline at
//! the new origin, which lands on the container's preceding sync point.

use std::collections::VecDeque;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::display::{FrameBuffer, Image, PixelFormat};
use crate::foundation::error::{PividError, PividResult};
use crate::foundation::lock;
use crate::foundation::time::MediaTime;
use crate::media::{DecodedFrame, MediaDecoder, MediaInfo, MediaOpener};

/// Opens media files below a fixed root directory.
pub struct FfmpegOpener {
    root: PathBuf,
}

impl FfmpegOpener {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl MediaOpener for FfmpegOpener {
    fn probe(&self, path: &str) -> PividResult<MediaInfo> {
        probe_media(&self.resolve(path))
    }

    fn open(&self, path: &str, seek: MediaTime) -> PividResult<Box<dyn MediaDecoder>> {
        let file = self.resolve(path);
        let info = probe_media(&file)?;
        Ok(Box::new(FfmpegDecoder::spawn(file, info, seek)?))
    }
}

/// Probe `file` with `ffprobe` and extract the video stream facts.
pub fn probe_media(file: &Path) -> PividResult<MediaInfo> {
    #[derive(serde::Deserialize)]
    struct ProbeStream {
        codec_type: Option<String>,
        codec_name: Option<String>,
        pix_fmt: Option<String>,
        width: Option<u32>,
        height: Option<u32>,
        avg_frame_rate: Option<String>,
        duration: Option<String>,
    }
    #[derive(serde::Deserialize)]
    struct ProbeFormat {
        duration: Option<String>,
        bit_rate: Option<String>,
    }
    #[derive(serde::Deserialize)]
    struct ProbeOut {
        streams: Vec<ProbeStream>,
        format: Option<ProbeFormat>,
    }

    let out = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(file)
        .output()
        .map_err(|e| PividError::io(format!("failed to run ffprobe: {e}")))?;
    if !out.status.success() {
        return Err(PividError::format(format!(
            "ffprobe failed for '{}': {}",
            file.display(),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }

    let parsed: ProbeOut = serde_json::from_slice(&out.stdout)
        .map_err(|e| PividError::format(format!("ffprobe json parse failed: {e}")))?;
    let video = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| {
            PividError::format(format!("no video stream in '{}'", file.display()))
        })?;

    let width = video
        .width
        .ok_or_else(|| PividError::format("ffprobe reported no video width"))?;
    let height = video
        .height
        .ok_or_else(|| PividError::format("ffprobe reported no video height"))?;
    let frame_rate = video
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rational)
        .unwrap_or(0.0);
    let duration = video
        .duration
        .as_deref()
        .or(parsed
            .format
            .as_ref()
            .and_then(|f| f.duration.as_deref()))
        .and_then(|d| d.parse::<f64>().ok());
    let bit_rate = parsed
        .format
        .as_ref()
        .and_then(|f| f.bit_rate.as_deref())
        .and_then(|b| b.parse::<u64>().ok());

    Ok(MediaInfo {
        width,
        height,
        pixel_format: video.pix_fmt.clone().unwrap_or_default(),
        codec: video.codec_name.clone().unwrap_or_default(),
        frame_rate,
        duration,
        bit_rate,
    })
}

fn parse_rational(text: &str) -> Option<f64> {
    match text.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den > 0.0 { Some(num / den) } else { None }
        }
        None => text.parse().ok(),
    }
}

/// Frames buffered between the reader thread and `next_frame`.
const OUTPUT_QUEUE_DEPTH: usize = 4;

struct OutputQueue {
    state: Mutex<OutputState>,
    space: Condvar,
}

struct OutputState {
    frames: VecDeque<DecodedFrame>,
    eof: bool,
    error: Option<PividError>,
}

pub struct FfmpegDecoder {
    file: PathBuf,
    info: MediaInfo,
    queue: Arc<OutputQueue>,
    stop: Arc<AtomicBool>,
    child: Option<Child>,
    reader: Option<std::thread::JoinHandle<()>>,
    stderr_drain: Option<std::thread::JoinHandle<()>>,
}

impl FfmpegDecoder {
    pub fn spawn(file: PathBuf, info: MediaInfo, seek: MediaTime) -> PividResult<Self> {
        let mut decoder = Self {
            file,
            info,
            queue: Arc::new(OutputQueue {
                state: Mutex::new(OutputState {
                    frames: VecDeque::new(),
                    eof: false,
                    error: None,
                }),
                space: Condvar::new(),
            }),
            stop: Arc::new(AtomicBool::new(false)),
            child: None,
            reader: None,
            stderr_drain: None,
        };
        decoder.start_pipeline(seek)?;
        Ok(decoder)
    }

    fn start_pipeline(&mut self, origin: MediaTime) -> PividResult<()> {
        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-v", "error"]);
        if origin > Duration::ZERO {
            cmd.args(["-ss", &format!("{:.6}", origin.as_secs_f64())]);
        }
        cmd.arg("-i")
            .arg(&self.file)
            .args(["-f", "rawvideo", "-pix_fmt", "rgba", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| PividError::io(format!("failed to spawn ffmpeg: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PividError::io("ffmpeg stdout missing"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PividError::io("ffmpeg stderr missing"))?;

        let file = self.file.clone();
        self.stderr_drain = Some(std::thread::spawn(move || {
            let mut text = String::new();
            let mut stderr = stderr;
            if stderr.read_to_string(&mut text).is_ok() && !text.trim().is_empty() {
                tracing::warn!(file = %file.display(), "ffmpeg: {}", text.trim());
            }
        }));

        let queue = Arc::clone(&self.queue);
        let stop = Arc::clone(&self.stop);
        let width = self.info.width;
        let height = self.info.height;
        let frame_period = self.info.frame_period();
        self.reader = Some(std::thread::spawn(move || {
            read_frames(stdout, queue, stop, width, height, origin, frame_period);
        }));
        self.child = Some(child);
        Ok(())
    }

    fn stop_pipeline(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.queue.space.notify_all();
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        if let Some(drain) = self.stderr_drain.take() {
            let _ = drain.join();
        }
        self.stop.store(false, Ordering::SeqCst);
    }
}

fn read_frames(
    mut stdout: impl Read,
    queue: Arc<OutputQueue>,
    stop: Arc<AtomicBool>,
    width: u32,
    height: u32,
    origin: MediaTime,
    frame_period: f64,
) {
    let frame_bytes = PixelFormat::Rgba8.frame_bytes(width, height);
    let mut index: u64 = 0;
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let mut bytes = vec![0u8; frame_bytes];
        match read_full(&mut stdout, &mut bytes) {
            Ok(true) => {}
            Ok(false) => break, // clean end of stream
            Err(e) => {
                let mut state = lock(&queue.state);
                state.error = Some(PividError::decode(format!("ffmpeg pipe read: {e}")));
                state.eof = true;
                return;
            }
        }

        let pts = origin + Duration::from_secs_f64(index as f64 * frame_period);
        index += 1;
        let frame = DecodedFrame {
            pts,
            buffer: FrameBuffer::from_image(Image {
                format: PixelFormat::Rgba8,
                width,
                height,
                bytes,
            }),
        };

        let mut state = lock(&queue.state);
        while state.frames.len() >= OUTPUT_QUEUE_DEPTH {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            let (guard, _) = queue
                .space
                .wait_timeout(state, Duration::from_millis(20))
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state = guard;
        }
        state.frames.push_back(frame);
    }

    let mut state = lock(&queue.state);
    state.eof = true;
}

/// Fill `buf` completely. `Ok(false)` on a clean EOF at a frame boundary;
/// a partial frame is an error.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("truncated frame ({filled} of {} bytes)", buf.len()),
            ));
        }
        filled += n;
    }
    Ok(true)
}

impl MediaDecoder for FfmpegDecoder {
    fn info(&self) -> &MediaInfo {
        &self.info
    }

    fn seek_before(&mut self, ts: MediaTime) -> PividResult<()> {
        self.stop_pipeline();
        {
            let mut state = lock(&self.queue.state);
            state.frames.clear();
            state.eof = false;
            state.error = None;
        }
        self.start_pipeline(ts)
    }

    fn next_frame(&mut self) -> PividResult<Option<DecodedFrame>> {
        let mut state = lock(&self.queue.state);
        if let Some(err) = state.error.take() {
            return Err(err);
        }
        let frame = state.frames.pop_front();
        drop(state);
        if frame.is_some() {
            self.queue.space.notify_all();
        }
        Ok(frame)
    }

    fn at_eof(&self) -> bool {
        let state = lock(&self.queue.state);
        state.eof && state.frames.is_empty()
    }
}

impl Drop for FfmpegDecoder {
    fn drop(&mut self) {
        self.stop_pipeline();
    }
}
