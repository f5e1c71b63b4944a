use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use image::RgbImage;
use tracing::{error, info, warn};

use hlsod::config::{load_labels, AppConfig};
use hlsod::cv::{probe_stream, AsyncFrameSource};
use hlsod::draw::{scale_zone, AnnotationStyle, Annotator, LightPhase};
use hlsod::hls::{HlsPublisher, IngestRelay};
use hlsod::od::{associate_riders, unhelmeted_riders};
use hlsod::pipeline::{FrameGate, InferenceWorker};
use hlsod::server::{self, AppState, StreamHub};
use hlsod::upload::{OdResults, UploaderWorker};
use hlsod::yolov8::OnnxAppContext;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run detection on a single image and save the annotated copy
    Detect {
        /// Model to use
        #[arg(short, long)]
        model: String,

        /// Path to the Image for inference
        #[arg(short, long)]
        image: String,

        /// Where to write the annotated image
        #[arg(short, long, default_value = "detected.jpg")]
        output: String,

        /// Label file, one class name per line
        #[arg(short, long, default_value = "model/safety_hat.txt")]
        labels: String,
    },
    /// Watch the configured streams and serve annotated MJPEG previews
    Monitor {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Publish one annotated stream as HLS
    Publish {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Source URL, defaults to the first configured stream
        #[arg(short, long)]
        stream: Option<String>,
    },
    /// Repackage raw sources into locally served HLS
    Ingest {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .compact()
        .without_time()
        .with_target(false)
        .init();

    let args = Args::parse();
    match args.command {
        Command::Detect {
            model,
            image,
            output,
            labels,
        } => run_detect(&model, &image, &output, &labels),
        Command::Monitor { config } => run_monitor(&config),
        Command::Publish { config, stream } => run_publish(&config, stream),
        Command::Ingest { config } => run_ingest(&config),
    }
}

fn run_detect(model: &str, image: &str, output: &str, labels_path: &str) -> io::Result<()> {
    let labels = load_labels(Path::new(labels_path));
    let mut app_ctx = OnnxAppContext::new();
    app_ctx.init_model(model)?;

    let od_results = app_ctx.inference_image(image)?;
    let results: OdResults = od_results
        .get_results()
        .into_iter()
        .map(|(id, prop, f_box)| {
            let label = labels
                .get(id as usize)
                .cloned()
                .unwrap_or_else(|| format!("class_{id}"));
            (label, prop, f_box)
        })
        .collect();
    info!("results: {results:?}");

    for verdict in associate_riders(&results) {
        info!(
            "rider at {:?}: helmeted={} ({:.2})",
            verdict.rect.xyxy(),
            verdict.helmeted,
            verdict.prop
        );
    }

    let mut img = image::open(image)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
        .to_rgb8();
    let annotator = Annotator::new(AnnotationStyle::Publish, 1.0)?;
    annotator.draw_detections(&mut img, &results);
    img.save(output)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    info!("Annotated image written to {output}");
    Ok(())
}

fn run_monitor(config_path: &Path) -> io::Result<()> {
    let cfg = AppConfig::load(config_path)?;
    let labels = load_labels(Path::new(&cfg.labels));

    let mut hubs = Vec::new();
    for url in &cfg.streams {
        match StreamHub::new(url, &cfg, labels.clone()) {
            Ok(hub) => hubs.push(hub),
            Err(e) => error!("Skipping {url}: {e}"),
        }
    }
    if hubs.is_empty() {
        error!("No streams available");
        return Err(io::Error::other("no streams available"));
    }
    info!("Monitoring {} streams on port {}", hubs.len(), cfg.port);

    let annotator = Annotator::new(AnnotationStyle::Monitor, cfg.box_scale)?;
    let state = Arc::new(AppState {
        config: cfg,
        hubs,
        annotator,
        started: Instant::now(),
    });

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(async {
        tokio::select! {
            res = server::serve(state.clone()) => res,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                Ok(())
            }
        }
    })
}

fn run_publish(config_path: &Path, stream: Option<String>) -> io::Result<()> {
    let cfg = AppConfig::load(config_path)?;
    let labels = load_labels(Path::new(&cfg.labels));
    let url = stream
        .or_else(|| cfg.streams.first().cloned())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "No stream to publish"))?;

    let native = probe_stream(&url)?;
    info!(
        "Source {url} reports {}x{} at {:.1} fps",
        native.width, native.height, native.fps
    );

    let width = cfg.publish_width;
    let height = cfg.publish_height;
    let frame_size = [width, height];
    let source = AsyncFrameSource::new(&url, frame_size)?;
    let worker = InferenceWorker::new(&cfg.model, labels, frame_size)?;
    let annotator = Annotator::new(AnnotationStyle::Publish, cfg.box_scale)?;
    let out_dir = Path::new(&cfg.hls_root).join(&cfg.stream_name);
    let mut publisher = HlsPublisher::new(width, height, cfg.fps, &out_dir)?;
    let uploader = cfg
        .upload
        .clone()
        .map(|up| UploaderWorker::new(up, &cfg.stream_name));

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    std::thread::spawn(move || {
        rt.block_on(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down");
                flag.store(false, Ordering::Relaxed);
            }
        })
    });

    // Every frame goes out at the publish rate; only every skip-th frame
    // is handed to the model, the rest reuse the cached result.
    let mut gate = FrameGate::new(cfg.frame_skip as u64, None);
    let zone = scale_zone(&cfg.stop_zone, cfg.stop_zone_ref, width, height);
    let period = Duration::from_millis(1000 / cfg.fps.max(1) as u64);
    let started = Instant::now();
    let mut seen_seq = 0u64;

    while running.load(Ordering::Relaxed) && source.alive() {
        std::thread::sleep(period);
        let Some(frame) = source.read() else { continue };
        if gate.admit() {
            worker.submit(frame.clone());
        }

        let Some(mut img) = RgbImage::from_raw(width, height, frame) else {
            continue;
        };
        if let Some(results) = worker.latest() {
            annotator.draw_detections(&mut img, &results);
            let seq = worker.result_seq();
            if seq != seen_seq {
                seen_seq = seq;
                let violations = unhelmeted_riders(&results);
                for (label, prop, f_box) in &violations {
                    warn!("Unhelmeted rider {label} at {f_box:?} ({prop:.2})");
                }
                if let Some(up) = &uploader {
                    if let Err(e) = up.upload_odres(&violations) {
                        warn!("Upload dropped: {e:?}");
                    }
                }
            }
        }
        let phase = LightPhase::at(started.elapsed().as_secs(), &cfg.light);
        annotator.draw_stop_zone(&mut img, &zone, phase);

        if !publisher.write_frame(img.as_raw())? {
            warn!("Encoder exited, stopping publisher");
            break;
        }
    }

    publisher.finish()?;
    Ok(())
}

fn run_ingest(config_path: &Path) -> io::Result<()> {
    let cfg = AppConfig::load(config_path)?;
    if cfg.ingest_urls.is_empty() {
        error!("No ingest_urls configured");
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no ingest_urls configured",
        ));
    }

    let hls_root = Path::new(&cfg.hls_root);
    let mut relays = Vec::new();
    for url in &cfg.ingest_urls {
        match IngestRelay::new(url, hls_root) {
            Ok(relay) => relays.push(relay),
            Err(e) => error!("Failed to start relay for {url}: {e}"),
        }
    }
    if relays.is_empty() {
        return Err(io::Error::other("no relays started"));
    }

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    let watchdog = std::thread::spawn(move || {
        while flag.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_secs(5));
            for relay in relays.iter_mut() {
                if !relay.alive() {
                    warn!("Relay {} exited", relay.name());
                }
            }
        }
        for relay in relays.iter_mut() {
            let _ = relay.stop();
        }
    });

    let annotator = Annotator::new(AnnotationStyle::Publish, 1.0)?;
    let state = Arc::new(AppState {
        config: cfg,
        hubs: Vec::new(),
        annotator,
        started: Instant::now(),
    });

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let res = rt.block_on(async {
        tokio::select! {
            res = server::serve(state) => res,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                Ok(())
            }
        }
    });

    running.store(false, Ordering::Relaxed);
    let _ = watchdog.join();
    res
}
