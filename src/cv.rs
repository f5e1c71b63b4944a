use std::io::{Error, ErrorKind, Read, Result};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// ffprobe's `r_frame_rate` comes as a fraction ("30000/1001").
fn parse_frame_rate(s: &str) -> f64 {
    match s.split_once('/') {
        Some((num, den)) => {
            let num = num.trim().parse::<f64>().unwrap_or(0.0);
            let den = den.trim().parse::<f64>().unwrap_or(0.0);
            if den > 0.0 { num / den } else { 0.0 }
        }
        None => s.trim().parse::<f64>().unwrap_or(0.0),
    }
}

fn parse_probe_output(stdout: &str) -> Result<StreamInfo> {
    let json: serde_json::Value = serde_json::from_str(stdout)
        .map_err(|e| Error::new(ErrorKind::InvalidData, e.to_string()))?;
    let streams = json["streams"].as_array().ok_or_else(|| {
        Error::new(ErrorKind::InvalidData, "No streams in ffprobe output")
    })?;

    for stream in streams {
        if stream["codec_type"].as_str() != Some("video") {
            continue;
        }
        let width = stream["width"].as_u64().unwrap_or(0) as u32;
        let height = stream["height"].as_u64().unwrap_or(0) as u32;
        let fps = stream["r_frame_rate"]
            .as_str()
            .map(parse_frame_rate)
            .unwrap_or(0.0);
        return Ok(StreamInfo { width, height, fps });
    }
    Err(Error::new(
        ErrorKind::InvalidData,
        "No video stream in ffprobe output",
    ))
}

/// Asks ffprobe for the native dimensions and frame rate of a source.
pub fn probe_stream(url: &str) -> Result<StreamInfo> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            url,
        ])
        .output()?;
    if !output.status.success() {
        error!("ffprobe failed for {url}");
        return Err(Error::new(ErrorKind::InvalidData, "ffprobe failed"));
    }
    parse_probe_output(&String::from_utf8_lossy(&output.stdout))
}

fn extractor_args(url: &str, width: u32, height: u32) -> Vec<String> {
    vec![
        "-nostdin".into(),
        "-loglevel".into(),
        "error".into(),
        "-i".into(),
        url.into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgb24".into(),
        "-s".into(),
        format!("{width}x{height}"),
        "pipe:1".into(),
    ]
}

/// Pulls RGB24 frames at a fixed size out of an ffmpeg child decoding the
/// source URL. Scaling happens in the child, so every frame read here is
/// exactly `width * height * 3` bytes.
pub struct FrameExtractor {
    child: Arc<Mutex<Child>>,
    stdout: ChildStdout,
    frame_len: usize,
}

impl FrameExtractor {
    /// frame_size: \[width, height\]
    pub fn new(url: &str, frame_size: [u32; 2]) -> Result<Self> {
        let [width, height] = frame_size;
        let mut child = Command::new("ffmpeg")
            .args(extractor_args(url, width, height))
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| {
            Error::new(ErrorKind::BrokenPipe, "ffmpeg stdout unavailable")
        })?;
        info!("Decoding {url} at {width}x{height}");
        Ok(Self {
            child: Arc::new(Mutex::new(child)),
            stdout,
            frame_len: width as usize * height as usize * 3,
        })
    }

    /// Blocks for the next frame. `Ok(None)` means the stream ended.
    pub fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; self.frame_len];
        match self.stdout.read_exact(&mut buf) {
            Ok(()) => Ok(Some(buf)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn stop(&self) {
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn child_handle(&self) -> Arc<Mutex<Child>> {
        self.child.clone()
    }
}

/// Background capture with a last-write-wins frame slot: a reader thread
/// keeps overwriting the latest frame and the render path takes whatever is
/// current. No queueing.
pub struct AsyncFrameSource {
    latest: Arc<Mutex<Option<Vec<u8>>>>,
    running: Arc<AtomicBool>,
    child: Arc<Mutex<Child>>,
    handle: Option<JoinHandle<()>>,
}

impl AsyncFrameSource {
    /// frame_size: \[width, height\]
    pub fn new(url: &str, frame_size: [u32; 2]) -> Result<Self> {
        let mut extractor = FrameExtractor::new(url, frame_size)?;
        let child = extractor.child_handle();
        let latest = Arc::new(Mutex::new(None));
        let running = Arc::new(AtomicBool::new(true));

        let slot = latest.clone();
        let flag = running.clone();
        let src = url.to_string();
        let handle = std::thread::spawn(move || {
            while flag.load(Ordering::Relaxed) {
                match extractor.read_frame() {
                    Ok(Some(frame)) => {
                        if let Ok(mut latest) = slot.lock() {
                            *latest = Some(frame);
                        }
                    }
                    Ok(None) => {
                        warn!("Stream ended: {src}");
                        break;
                    }
                    Err(e) => {
                        if flag.load(Ordering::Relaxed) {
                            error!("Frame read failed for {src}: {e}");
                        }
                        break;
                    }
                }
            }
            flag.store(false, Ordering::Relaxed);
        });

        Ok(Self {
            latest,
            running,
            child,
            handle: Some(handle),
        })
    }

    /// Clone of the most recent frame, if any arrived yet.
    pub fn read(&self) -> Option<Vec<u8>> {
        self.latest.lock().ok().and_then(|g| g.clone())
    }

    pub fn alive(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AsyncFrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}
