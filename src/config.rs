use std::io::{Error, ErrorKind, Result};
use std::path::Path;
use std::{fs, io};

use serde::Deserialize;
use tracing::info;

use crate::draw::LightCycle;
use crate::upload::UploadConfig;

/// Full application configuration. Every field has a working default so
/// a missing or partial `config.toml` still yields a runnable setup.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Live sources to monitor, one worker per entry.
    pub streams: Vec<String>,
    /// Raw sources the ingest mode repackages into local HLS.
    pub ingest_urls: Vec<String>,
    pub port: u16,
    pub model: String,
    pub labels: String,
    pub monitor_width: u32,
    pub monitor_height: u32,
    pub publish_width: u32,
    pub publish_height: u32,
    pub fps: u32,
    pub frame_skip: u32,
    pub jpeg_quality: u8,
    pub box_scale: f32,
    pub light: LightCycle,
    pub stop_zone: Vec<[f32; 2]>,
    pub stop_zone_ref: [f32; 2],
    pub hls_root: String,
    pub stream_name: String,
    pub upload: Option<UploadConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            streams: (1..=4)
                .map(|n| format!("http://localhost:3000/hls/output{n}.m3u8"))
                .collect(),
            ingest_urls: Vec::new(),
            port: 3000,
            model: "model/safety_hat.onnx".to_string(),
            labels: "model/safety_hat.txt".to_string(),
            monitor_width: 426,
            monitor_height: 240,
            publish_width: 960,
            publish_height: 520,
            fps: 15,
            frame_skip: 3,
            jpeg_quality: 85,
            box_scale: 0.84,
            light: LightCycle::default(),
            stop_zone: vec![
                [200.0, 210.0],
                [590.0, 320.0],
                [572.0, 370.0],
                [165.0, 245.0],
            ],
            stop_zone_ref: [960.0, 520.0],
            hls_root: "hls".to_string(),
            stream_name: "helmet_pnm".to_string(),
            upload: None,
        }
    }
}

impl AppConfig {
    /// Loads a config file, falling back to defaults when it does not
    /// exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        toml::from_str::<AppConfig>(&raw)
            .map_err(|e| Error::new(ErrorKind::InvalidData, format!("{}: {e}", path.display())))
    }

    /// Playlist path of the published stream, as served over HTTP.
    pub fn published_playlist(&self) -> String {
        format!("/hls/{}/output.m3u8", self.stream_name)
    }
}

/// Reads the label file, one class per line. A missing file falls back
/// to the generic vehicle classes so the pipeline still runs.
pub fn load_labels(path: &Path) -> Vec<String> {
    match crate::read_lines(path) {
        Ok(lines) => {
            let labels: Vec<String> = lines
                .map_while(io::Result::ok)
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect();
            if labels.is_empty() {
                fallback_labels()
            } else {
                labels
            }
        }
        Err(_) => {
            info!(
                "Label file {} not found, using fallback classes",
                path.display()
            );
            fallback_labels()
        }
    }
}

fn fallback_labels() -> Vec<String> {
    ["person", "bicycle", "car", "motorcycle", "helmet"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_yields_defaults() {
        let cfg: AppConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.streams.len(), 4);
        assert_eq!(cfg.streams[0], "http://localhost:3000/hls/output1.m3u8");
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.fps, 15);
        assert_eq!(cfg.frame_skip, 3);
        assert_eq!(cfg.jpeg_quality, 85);
        assert!((cfg.box_scale - 0.84).abs() < f32::EPSILON);
        assert_eq!(cfg.light.green, 90);
        assert_eq!(cfg.light.yellow, 5);
        assert_eq!(cfg.light.red, 60);
        assert_eq!(cfg.stop_zone.len(), 4);
        assert!(cfg.upload.is_none());
    }

    #[test]
    fn partial_config_overrides_only_named_fields() {
        let cfg: AppConfig = toml::from_str(
            r#"
            port = 8080
            fps = 30
            streams = ["http://cam/one.m3u8"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.fps, 30);
        assert_eq!(cfg.streams, vec!["http://cam/one.m3u8".to_string()]);
        assert_eq!(cfg.frame_skip, 3);
        assert_eq!(cfg.publish_width, 960);
    }

    #[test]
    fn upload_section_is_optional_and_renamed() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [upload]
            device = "gate-cam"
            name = "operator"
            pwd = "secret"
            postUrlPrefix = "http://backend/api/"
            "#,
        )
        .unwrap();
        let up = cfg.upload.expect("upload section should parse");
        assert_eq!(up.device_name, "gate-cam");
        assert_eq!(up.api_prefix, "http://backend/api/");
    }

    #[test]
    fn light_cycle_partial_override() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [light]
            green = 30
            "#,
        )
        .unwrap();
        assert_eq!(cfg.light.green, 30);
        assert_eq!(cfg.light.yellow, 5);
        assert_eq!(cfg.light.red, 60);
    }

    #[test]
    fn published_playlist_path() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.published_playlist(), "/hls/helmet_pnm/output.m3u8");
    }
}
