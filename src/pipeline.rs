use std::io::Result;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::upload::OdResults;
use crate::yolov8::OnnxAppContext;

/// Background inference over a single-frame slot. `submit` overwrites the
/// pending frame; the worker runs the model on whatever is pending and
/// caches the labeled result. Readers always get the latest cached result,
/// stale or not.
pub struct InferenceWorker {
    pending: Arc<Mutex<Option<Vec<u8>>>>,
    results: Arc<Mutex<Option<OdResults>>>,
    seq: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl InferenceWorker {
    /// frame_size: \[width, height\]
    pub fn new(model_path: &str, labels: Vec<String>, frame_size: [u32; 2]) -> Result<Self> {
        let mut app_ctx = OnnxAppContext::new();
        app_ctx.init_model(model_path)?;

        let pending: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
        let results: Arc<Mutex<Option<OdResults>>> = Arc::new(Mutex::new(None));
        let seq = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));

        let [width, height] = frame_size;
        let pending_slot = pending.clone();
        let results_slot = results.clone();
        let seq_counter = seq.clone();
        let flag = running.clone();
        let handle = std::thread::spawn(move || {
            while flag.load(Ordering::Relaxed) {
                let frame = pending_slot.lock().ok().and_then(|mut g| g.take());
                let Some(frame) = frame else {
                    std::thread::sleep(Duration::from_millis(1));
                    continue;
                };

                match app_ctx.inference_model(&frame, width, height) {
                    Ok(list) => {
                        let labeled = list
                            .get_results()
                            .into_iter()
                            .map(|(id, prop, f_box)| {
                                let label = labels
                                    .get(id as usize)
                                    .cloned()
                                    .unwrap_or_else(|| format!("class_{id}"));
                                (label, prop, f_box)
                            })
                            .collect::<OdResults>();
                        if let Ok(mut slot) = results_slot.lock() {
                            *slot = Some(labeled);
                        }
                        seq_counter.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!("Inference failed: {e}");
                        if let Ok(mut slot) = results_slot.lock() {
                            *slot = None;
                        }
                    }
                }
            }
        });

        Ok(Self {
            pending,
            results,
            seq,
            running,
            handle: Some(handle),
        })
    }

    pub fn submit(&self, frame: Vec<u8>) {
        if let Ok(mut slot) = self.pending.lock() {
            *slot = Some(frame);
        }
    }

    pub fn latest(&self) -> Option<OdResults> {
        self.results.lock().ok().and_then(|g| g.clone())
    }

    /// Bumped once per completed inference, so callers reacting to fresh
    /// results (violation reporting) can skip results they already saw.
    pub fn result_seq(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for InferenceWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Frame pacing: process every `frame_skip`th frame, optionally refusing
/// frames younger than `1/fps` since the last admitted one.
pub struct FrameGate {
    count: u64,
    frame_skip: u64,
    min_interval: Option<Duration>,
    last_emit: Option<Instant>,
}

impl FrameGate {
    pub fn new(frame_skip: u64, fps: Option<f64>) -> Self {
        let min_interval = fps
            .filter(|f| *f > 0.0)
            .map(|f| Duration::from_secs_f64(1.0 / f));
        Self {
            count: 0,
            frame_skip: frame_skip.max(1),
            min_interval,
            last_emit: None,
        }
    }

    pub fn admit(&mut self) -> bool {
        self.admit_at(Instant::now())
    }

    fn admit_at(&mut self, now: Instant) -> bool {
        self.count += 1;
        if self.count % self.frame_skip != 0 {
            return false;
        }
        if let Some(min) = self.min_interval {
            if let Some(last) = self.last_emit {
                if now.duration_since(last) < min {
                    return false;
                }
            }
            self.last_emit = Some(now);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_admits_every_third_frame() {
        let mut gate = FrameGate::new(3, None);
        let admitted = (1..=9).map(|_| gate.admit()).collect::<Vec<_>>();
        assert_eq!(
            admitted,
            vec![false, false, true, false, false, true, false, false, true]
        );
    }

    #[test]
    fn gate_without_skip_admits_everything() {
        let mut gate = FrameGate::new(1, None);
        assert!(gate.admit());
        assert!(gate.admit());
        let mut zero = FrameGate::new(0, None);
        assert!(zero.admit());
    }

    #[test]
    fn gate_throttles_to_fps() {
        let mut gate = FrameGate::new(1, Some(15.0));
        let t0 = Instant::now();
        assert!(gate.admit_at(t0));
        // 10ms later is inside the 1/15s window.
        assert!(!gate.admit_at(t0 + Duration::from_millis(10)));
        assert!(gate.admit_at(t0 + Duration::from_millis(70)));
    }

    #[test]
    fn gate_combines_skip_and_throttle() {
        let mut gate = FrameGate::new(3, Some(1000.0));
        let t0 = Instant::now();
        assert!(!gate.admit_at(t0));
        assert!(!gate.admit_at(t0));
        assert!(gate.admit_at(t0));
        // Next multiple of three arrives immediately, throttled out.
        assert!(!gate.admit_at(t0 + Duration::from_micros(100)));
        assert!(!gate.admit_at(t0 + Duration::from_micros(200)));
        assert!(!gate.admit_at(t0 + Duration::from_micros(300)));
    }
}
