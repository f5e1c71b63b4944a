use std::convert::Infallible;
use std::io::{Cursor, Error, ErrorKind, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use axum::{
    body::{Body, Bytes},
    extract::{Path as UrlPath, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde_json::json;
use tower_http::{cors::CorsLayer, services::ServeDir};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::cv::AsyncFrameSource;
use crate::draw::{scale_zone, Annotator, LightPhase};
use crate::hls::safe_stream_name;
use crate::od::unhelmeted_riders;
use crate::pipeline::{FrameGate, InferenceWorker};
use crate::upload::UploaderWorker;

const MJPEG_BOUNDARY: &str = "multipart/x-mixed-replace; boundary=frame";

/// One monitored stream: its frame source, its inference worker, and a
/// pump thread feeding sampled frames from the former to the latter.
pub struct StreamHub {
    pub url: String,
    source: Arc<AsyncFrameSource>,
    worker: Arc<InferenceWorker>,
    running: Arc<AtomicBool>,
    pump: Option<thread::JoinHandle<()>>,
}

impl StreamHub {
    pub fn new(url: &str, cfg: &AppConfig, labels: Vec<String>) -> Result<Self> {
        let width = cfg.monitor_width;
        let height = cfg.monitor_height;
        let source = Arc::new(AsyncFrameSource::new(url, [width, height])?);
        let worker = Arc::new(InferenceWorker::new(&cfg.model, labels, [width, height])?);

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let src = source.clone();
        let wrk = worker.clone();
        let uploader = cfg
            .upload
            .clone()
            .map(|up| UploaderWorker::new(up, &safe_stream_name(url)));
        let mut gate = FrameGate::new(cfg.frame_skip as u64, None);
        let period = Duration::from_millis(1000 / cfg.fps.max(1) as u64);
        let stream_tag = url.to_string();
        let pump = thread::spawn(move || {
            let mut seen_seq = 0u64;
            while flag.load(Ordering::Relaxed) {
                thread::sleep(period);
                if !src.alive() {
                    warn!("Frame source stopped, ending pump");
                    break;
                }
                let Some(frame) = src.read() else { continue };
                if gate.admit() {
                    wrk.submit(frame);
                }

                let seq = wrk.result_seq();
                if seq == seen_seq {
                    continue;
                }
                seen_seq = seq;
                let Some(results) = wrk.latest() else { continue };
                let violations = unhelmeted_riders(&results);
                if violations.is_empty() {
                    continue;
                }
                warn!("{} unhelmeted rider(s) on {stream_tag}", violations.len());
                if let Some(up) = &uploader {
                    if let Err(e) = up.upload_odres(&violations) {
                        warn!("Upload dropped: {e:?}");
                    }
                }
            }
        });

        Ok(Self {
            url: url.to_string(),
            source,
            worker,
            running,
            pump: Some(pump),
        })
    }
}

impl Drop for StreamHub {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.pump.take() {
            let _ = handle.join();
        }
    }
}

pub struct AppState {
    pub config: AppConfig,
    pub hubs: Vec<StreamHub>,
    pub annotator: Annotator,
    pub started: Instant,
}

pub type SharedState = Arc<AppState>;

pub fn router(state: SharedState) -> Router {
    let mut app = Router::new()
        .route("/api/health", get(health))
        .route("/hls/*path", get(serve_hls))
        .with_state(state.clone());

    for i in 0..state.hubs.len() {
        let st = state.clone();
        app = app.route(&format!("/video{}", i + 1), get(move || mjpeg_feed(st, i)));
    }

    app.fallback_service(ServeDir::new("public"))
        .layer(CorsLayer::permissive())
}

pub async fn serve(state: SharedState) -> Result<()> {
    let addr = format!("0.0.0.0:{}", state.config.port);
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {addr}");
    axum::serve(listener, app).await
}

async fn health(State(st): State<SharedState>) -> Json<serde_json::Value> {
    Json(health_payload(&st.config))
}

fn health_payload(cfg: &AppConfig) -> serde_json::Value {
    json!({
        "status": "ok",
        "hls": cfg.published_playlist(),
    })
}

async fn serve_hls(State(st): State<SharedState>, UrlPath(path): UrlPath<String>) -> Response {
    if !hls_path_allowed(&path) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let full = PathBuf::from(&st.config.hls_root).join(&path);
    match tokio::fs::read(&full).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, content_type_for(&path)),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            bytes,
        )
            .into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

fn hls_path_allowed(path: &str) -> bool {
    !path.split('/').any(|seg| seg == "..") && !path.starts_with('/')
}

fn content_type_for(path: &str) -> &'static str {
    if path.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else if path.ends_with(".ts") {
        "video/mp2t"
    } else {
        "application/octet-stream"
    }
}

/// Endless multipart response of the latest annotated frame. Nothing is
/// emitted for a stream until its first inference result lands, matching
/// the monitor's start-up behavior.
async fn mjpeg_feed(state: SharedState, index: usize) -> Response {
    let period = Duration::from_millis(1000 / state.config.fps.max(1) as u64);
    let frames = futures::stream::unfold(state, move |st| async move {
        loop {
            tokio::time::sleep(period).await;
            if let Some(part) = next_part(&st, index) {
                return Some((Ok::<Bytes, Infallible>(Bytes::from(part)), st));
            }
        }
    });

    Response::builder()
        .header(header::CONTENT_TYPE, MJPEG_BOUNDARY)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(frames))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn next_part(st: &AppState, index: usize) -> Option<Vec<u8>> {
    let hub = st.hubs.get(index)?;
    let raw = hub.source.read()?;
    let results = hub.worker.latest()?;

    let width = st.config.monitor_width;
    let height = st.config.monitor_height;
    let mut img = RgbImage::from_raw(width, height, raw)?;
    st.annotator.draw_detections(&mut img, &results);

    // Traffic light and stop zone ride on the first stream only.
    if index == 0 {
        let phase = LightPhase::at(st.started.elapsed().as_secs(), &st.config.light);
        let zone = scale_zone(&st.config.stop_zone, st.config.stop_zone_ref, width, height);
        st.annotator.draw_stop_zone(&mut img, &zone, phase);
    }

    let jpeg = encode_jpeg(&img, st.config.jpeg_quality).ok()?;
    Some(jpeg_part(&jpeg))
}

pub fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut buf), quality);
    img.write_with_encoder(encoder)
        .map_err(|e| Error::new(ErrorKind::InvalidData, e.to_string()))?;
    Ok(buf)
}

fn jpeg_part(jpeg: &[u8]) -> Vec<u8> {
    let mut part = Vec::with_capacity(jpeg.len() + 64);
    part.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}
