use std::fs;
use std::io::{BufRead, BufReader, ErrorKind, Result, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;

use tracing::{debug, info};

/// Filesystem-safe directory name for a stream URL: scheme stripped,
/// everything outside `[a-z0-9]` collapsed to underscores.
pub fn safe_stream_name(url: &str) -> String {
    let stripped = url.split_once("://").map_or(url, |(_, rest)| rest);
    stripped
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Argument list for the pipe-fed raw-frame publisher.
pub fn publisher_args(width: u32, height: u32, fps: u32, playlist: &str) -> Vec<String> {
    vec![
        "-y".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgb24".into(),
        "-s".into(),
        format!("{width}x{height}"),
        "-r".into(),
        fps.to_string(),
        "-i".into(),
        "-".into(),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        "ultrafast".into(),
        "-tune".into(),
        "zerolatency".into(),
        "-g".into(),
        fps.to_string(),
        "-sc_threshold".into(),
        "0".into(),
        "-f".into(),
        "hls".into(),
        "-hls_time".into(),
        "1".into(),
        "-hls_list_size".into(),
        "10".into(),
        "-hls_flags".into(),
        "delete_segments+independent_segments".into(),
        playlist.into(),
    ]
}

/// Argument list for the copy-codec relay that repackages a live source
/// as local HLS without re-encoding.
pub fn ingest_args(url: &str, playlist: &str) -> Vec<String> {
    vec![
        "-i".into(),
        url.into(),
        "-fflags".into(),
        "nobuffer".into(),
        "-flags".into(),
        "low_delay".into(),
        "-c:v".into(),
        "copy".into(),
        "-preset".into(),
        "ultrafast".into(),
        "-f".into(),
        "hls".into(),
        "-hls_time".into(),
        "1".into(),
        "-hls_list_size".into(),
        "10".into(),
        "-hls_delete_threshold".into(),
        "5".into(),
        "-hls_flags".into(),
        "delete_segments+independent_segments".into(),
        "-master_pl_name".into(),
        "output.m3u8".into(),
        playlist.into(),
    ]
}

fn drain_stderr(child: &mut Child, tag: String) {
    if let Some(stderr) = child.stderr.take() {
        thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines().map_while(std::result::Result::ok) {
                debug!("{tag}: {line}");
            }
        });
    }
}

/// Encoder process fed annotated raw frames over its stdin, writing a
/// rolling HLS playlist under `out_dir`.
pub struct HlsPublisher {
    child: Child,
    stdin: ChildStdin,
}

impl HlsPublisher {
    pub fn new(width: u32, height: u32, fps: u32, out_dir: &Path) -> Result<Self> {
        fs::create_dir_all(out_dir)?;
        let playlist = out_dir.join("output.m3u8");
        let mut child = Command::new("ffmpeg")
            .args(publisher_args(
                width,
                height,
                fps,
                &playlist.to_string_lossy(),
            ))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        drain_stderr(&mut child, "publisher".to_string());
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("Failed to open encoder stdin"))?;
        info!("Publishing {width}x{height}@{fps} to {}", playlist.display());
        Ok(Self { child, stdin })
    }

    /// Writes one raw frame. Returns false once the encoder has gone
    /// away so the caller can wind down instead of erroring per frame.
    pub fn write_frame(&mut self, frame: &[u8]) -> Result<bool> {
        match self.stdin.write_all(frame) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Closes stdin and lets the encoder flush its last segments.
    pub fn finish(self) -> Result<()> {
        let Self { mut child, stdin } = self;
        drop(stdin);
        child.wait()?;
        Ok(())
    }

    pub fn stop(mut self) -> Result<()> {
        let _ = self.child.kill();
        self.child.wait()?;
        Ok(())
    }
}

/// Copy-codec process mirroring one live source into a per-stream HLS
/// directory named after the sanitized URL.
pub struct IngestRelay {
    name: String,
    child: Child,
}

impl IngestRelay {
    pub fn new(url: &str, hls_root: &Path) -> Result<Self> {
        let name = safe_stream_name(url);
        let dir = hls_root.join(&name);
        fs::create_dir_all(&dir)?;
        let playlist = dir.join("output.m3u8");
        let mut child = Command::new("ffmpeg")
            .args(ingest_args(url, &playlist.to_string_lossy()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        drain_stderr(&mut child, name.clone());
        info!("Relaying {url} into {}", dir.display());
        Ok(Self { name, child })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    pub fn stop(&mut self) -> Result<()> {
        let _ = self.child.kill();
        self.child.wait()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_names_are_sanitized() {
        assert_eq!(
            safe_stream_name("ws://camera.local:8080/feed"),
            "camera_local_8080_feed"
        );
        assert_eq!(
            safe_stream_name("https://Example.COM/Cam-1"),
            "example_com_cam_1"
        );
        assert_eq!(safe_stream_name("plain name"), "plain_name");
    }

    #[test]
    fn publisher_args_match_encoder_contract() {
        let args = publisher_args(960, 520, 15, "output/output.m3u8");
        let expected: Vec<String> = [
            "-y",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgb24",
            "-s",
            "960x520",
            "-r",
            "15",
            "-i",
            "-",
            "-c:v",
            "libx264",
            "-preset",
            "ultrafast",
            "-tune",
            "zerolatency",
            "-g",
            "15",
            "-sc_threshold",
            "0",
            "-f",
            "hls",
            "-hls_time",
            "1",
            "-hls_list_size",
            "10",
            "-hls_flags",
            "delete_segments+independent_segments",
            "output/output.m3u8",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(args, expected);
    }

    #[test]
    fn ingest_args_copy_without_reencoding() {
        let args = ingest_args("http://cam/live", "hls/cam_live/output.m3u8");
        assert_eq!(args[0], "-i");
        assert_eq!(args[1], "http://cam/live");
        assert!(args.contains(&"copy".to_string()));
        assert!(args.contains(&"-master_pl_name".to_string()));
        assert_eq!(args.last().unwrap(), "hls/cam_live/output.m3u8");
        assert!(!args.contains(&"libx264".to_string()));
    }
}
