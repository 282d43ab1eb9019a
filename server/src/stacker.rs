//! Live Stacker (spec.md §4.6). Runs in its own worker context so frame
//! ingestion never blocks capture, following the same worker-thread-owns-
//! its-own-runtime pattern as the teacher's `DetectEngine` (CPU-bound
//! image math kept off the shared async runtime).
//!
//! Per §9's redesign note on "Callback coroutines via thread-pool": the
//! stacker depends on the telemetry bus only through an injected
//! `Publisher` closure, never a direct handle to it — the scheduler is the
//! only thing that knows the bus exists.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use canonical_error::CanonicalError;
use nightloop_elements::align::{self, Shift};
use nightloop_elements::fits::{self, Frame};
use nightloop_elements::stacking;
use serde_json::json;
use tracing::warn;

pub type Publisher = Arc<dyn Fn(&str, serde_json::Value) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct StackerConfig {
    pub sigma_threshold: f64,
    pub max_history: usize,
    pub target_width: usize,
    pub master_dark: Option<Frame>,
    pub simple_reject_factor: f64,
    pub max_align_shift: i32,
    pub preview_dir: PathBuf,
}

impl Default for StackerConfig {
    fn default() -> Self {
        StackerConfig {
            sigma_threshold: 4.0,
            max_history: 7,
            target_width: 0,
            master_dark: None,
            simple_reject_factor: 1.0,
            max_align_shift: 12,
            preview_dir: std::env::temp_dir(),
        }
    }
}

struct StackerState {
    queue: VecDeque<PathBuf>,
    reference: Option<Frame>,
    master: Option<Frame>,
    history: VecDeque<Frame>,
    frames_processed: u64,
    outlier_fraction_window: VecDeque<f64>,
    sigma_threshold: f64,
    stop_request: bool,
    restacked: bool,
}

/// Inbound frame ingestion and outbound master publication for one
/// observation item. A new target creates a new `LiveStacker` (§9's
/// resolved "reset per item" lifecycle).
pub struct LiveStacker {
    config: StackerConfig,
    state: Arc<Mutex<StackerState>>,
    worker_thread: Option<std::thread::JoinHandle<()>>,
    worker_done: Arc<AtomicBool>,
    publish: Publisher,
}

impl Drop for LiveStacker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl LiveStacker {
    pub fn new(config: StackerConfig, publish: Publisher) -> Self {
        LiveStacker {
            state: Arc::new(Mutex::new(StackerState {
                queue: VecDeque::new(),
                reference: None,
                master: None,
                history: VecDeque::new(),
                frames_processed: 0,
                outlier_fraction_window: VecDeque::new(),
                sigma_threshold: config.sigma_threshold,
                stop_request: false,
                restacked: false,
            })),
            config,
            worker_thread: None,
            worker_done: Arc::new(AtomicBool::new(false)),
            publish,
        }
    }

    /// `processNewImage(path)` (spec.md §4.6): enqueues; may be called
    /// faster than the stacker drains. Starts the worker on first call.
    pub fn process_new_image(&mut self, path: PathBuf) {
        self.state.lock().unwrap().queue.push_back(path);
        if self.worker_thread.is_none() || self.worker_done.load(Ordering::Relaxed) {
            self.worker_done.store(false, Ordering::Relaxed);
            self.spawn_worker();
        }
    }

    pub fn current_master(&self) -> Option<Frame> {
        self.state.lock().unwrap().master.clone()
    }

    fn spawn_worker(&mut self) {
        let state = self.state.clone();
        let done = self.worker_done.clone();
        let config = self.config.clone();
        let publish = self.publish.clone();
        self.worker_thread = Some(std::thread::spawn(move || {
            worker_loop(state, config, publish);
            done.store(true, Ordering::Relaxed);
        }));
    }

    /// Flushes the queue and publishes the final master (spec.md §4.6
    /// "Reset semantics"), then joins the worker with a 5-second timeout
    /// per §5's cancellation contract.
    pub fn stop(&mut self) {
        self.state.lock().unwrap().stop_request = true;
        if let Some(handle) = self.worker_thread.take() {
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while !handle.is_finished() && std::time::Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("stacker worker did not exit within 5s of stop()");
            }
        }
    }
}

fn worker_loop(state: Arc<Mutex<StackerState>>, config: StackerConfig, publish: Publisher) {
    loop {
        let path = {
            let mut s = state.lock().unwrap();
            if s.stop_request && s.queue.is_empty() {
                return;
            }
            s.queue.pop_front()
        };
        let Some(path) = path else {
            std::thread::sleep(Duration::from_millis(20));
            continue;
        };
        match process_one_frame(&state, &config, &path) {
            Ok(master) => {
                publish("NEWIMAGE", json!({ "path": path }));
                let _ = master; // published via state; kept for clarity at call site.
            }
            Err(e) => {
                warn!("stacker: frame {:?} skipped: {}", path, e);
                publish("STATUS", json!({ "error": "Alignment failed", "path": path }));
            }
        }
    }
}

fn process_one_frame(state: &Arc<Mutex<StackerState>>, config: &StackerConfig, path: &PathBuf) -> Result<(), CanonicalError> {
    // Step 1: load, debayer, normalize.
    let bayer_algo = Some(fits::DebayerAlgorithm::Bilinear);
    let mut frame = fits::load(path, config.master_dark.as_ref(), bayer_algo, true)?;

    // Step 3: downscale toward target width.
    if config.target_width > 0 && frame.width > config.target_width {
        let k = frame.width / config.target_width;
        if k >= 2 {
            frame = fits::bin(&frame, k)?;
        }
    }

    let mut state = state.lock().unwrap();

    if state.reference.is_none() {
        // Step 4: first frame becomes reference and initial master.
        state.reference = Some(frame.clone());
        state.master = Some(frame.clone());
        state.history.push_back(frame);
        state.frames_processed = 1;
        return Ok(());
    }

    // Step 5: align to reference (luminance plane for color).
    let reference = state.reference.clone().unwrap();
    let (ref_luma, frame_luma) = if frame.is_color() {
        (fits::luminance_709(&reference)?, fits::luminance_709(&frame)?)
    } else {
        (reference.clone(), frame.clone())
    };
    let shift = align::estimate_shift(&ref_luma, &frame_luma, config.max_align_shift)
        .map_err(|e| canonical_error::internal_error(&e.to_string()))?;
    let aligned = if shift == (Shift { dx: 0, dy: 0 }) { frame } else { align::apply_shift(&frame, shift) };

    let n = state.frames_processed + 1;
    let master = state.master.clone().unwrap();

    let (processed, outlier_frac) = if state.frames_processed < config.max_history as u64 {
        // Step 6a: winsorized sigma clipping against bounded history.
        let clipped = winsorize_against_history(&aligned, &state.history, state.sigma_threshold);
        state.history.push_back(aligned.clone());
        if state.history.len() > config.max_history {
            state.history.pop_front();
        }
        clipped
    } else if !state.restacked {
        // Step 6b: one-shot re-stack over the bounded history.
        let restacked_master = restack_history(&state.history, state.sigma_threshold);
        state.master = Some(restacked_master);
        state.restacked = true;
        simple_reject(&aligned, state.master.as_ref().unwrap(), config.simple_reject_factor)
    } else {
        // Step 6c: simple outlier rejection against the current master.
        simple_reject(&aligned, &master, config.simple_reject_factor)
    };

    // Step 7: incremental weighted mean merge.
    let merged = merge_running_mean(&master, &processed, n);
    state.master = Some(merged);
    state.frames_processed = n;

    // Adaptive sigma (spec.md §4.6 "Adaptive σ").
    state.outlier_fraction_window.push_back(outlier_frac);
    if state.outlier_fraction_window.len() > config.max_history {
        state.outlier_fraction_window.pop_front();
    }
    if state.outlier_fraction_window.len() >= 4 {
        let mean: f64 = state.outlier_fraction_window.iter().sum::<f64>() / state.outlier_fraction_window.len() as f64;
        if mean > 0.30 {
            state.sigma_threshold = (state.sigma_threshold * 1.2).min(5.0);
        } else if mean < 0.05 {
            state.sigma_threshold *= 0.9;
        }
    }

    Ok(())
}

fn winsorize_against_history(frame: &Frame, history: &VecDeque<Frame>, sigma_threshold: f64) -> (Frame, f64) {
    if history.is_empty() {
        return (frame.clone(), 0.0);
    }
    let (w, h, c) = (frame.width, frame.height, frame.channels);
    let mut out = frame.data.clone();
    let mut total_clipped = 0usize;
    let total_pixels = w * h * c;
    let mut sigma_map = vec![0f64; total_pixels];
    let mut medians = vec![0f64; total_pixels];

    for idx in 0..total_pixels {
        let mut values: Vec<f64> = history.iter().map(|f| f.data[idx] as f64).collect();
        values.push(frame.data[idx] as f64);
        let (median, sigma) = stacking::pixel_center_scale(&values);
        medians[idx] = median;
        sigma_map[idx] = sigma;
    }
    stacking::floor_sigma_map(&mut sigma_map);

    for idx in 0..total_pixels {
        let v = frame.data[idx] as f64;
        let lo = medians[idx] - sigma_threshold * sigma_map[idx];
        let hi = medians[idx] + sigma_threshold * sigma_map[idx];
        if v < lo || v > hi {
            total_clipped += 1;
        }
    }
    let fraction = stacking::outlier_fraction(total_clipped, total_pixels);
    if fraction < 0.40 {
        for idx in 0..total_pixels {
            let v = frame.data[idx] as f64;
            let lo = medians[idx] - sigma_threshold * sigma_map[idx];
            let hi = medians[idx] + sigma_threshold * sigma_map[idx];
            out[idx] = if v < lo || v > hi { medians[idx] as f32 } else { frame.data[idx] };
        }
    }
    (Frame { data: out, ..frame.clone() }, fraction)
}

fn restack_history(history: &VecDeque<Frame>, sigma_threshold: f64) -> Frame {
    let template = history.back().expect("history non-empty when restacking");
    let (w, h, c) = (template.width, template.height, template.channels);
    let total_pixels = w * h * c;
    let mut out = vec![0f32; total_pixels];
    for idx in 0..total_pixels {
        let values: Vec<f64> = history.iter().map(|f| f.data[idx] as f64).collect();
        let (median, sigma) = stacking::pixel_center_scale(&values);
        let mut clamped = values;
        stacking::winsorize(&mut clamped, median, sigma, sigma_threshold);
        out[idx] = (clamped.iter().sum::<f64>() / clamped.len() as f64) as f32;
    }
    Frame { data: out, ..template.clone() }
}

fn simple_reject(frame: &Frame, master: &Frame, threshold_factor: f64) -> (Frame, f64) {
    let deviations: Vec<f64> = frame.data.iter().zip(master.data.iter()).map(|(&f, &m)| (f - m).abs() as f64).collect();
    let mut sorted = deviations.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let idx = ((sorted.len() - 1) as f64 * 0.95).round() as usize;
    let threshold = sorted[idx] * threshold_factor;

    let mut out = frame.data.clone();
    let mut clipped = 0usize;
    for (i, &d) in deviations.iter().enumerate() {
        if d > threshold {
            out[i] = master.data[i];
            clipped += 1;
        }
    }
    let fraction = stacking::outlier_fraction(clipped, deviations.len());
    (Frame { data: out, ..frame.clone() }, fraction)
}

fn merge_running_mean(master: &Frame, frame: &Frame, n: u64) -> Frame {
    let mut out = master.data.clone();
    for (m, f) in out.iter_mut().zip(frame.data.iter()) {
        *m = stacking::running_mean_update(*m as f64, *f as f64, n) as f32;
    }
    Frame { data: out, ..master.clone() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn flat_frame(value: f32, w: usize, h: usize) -> Frame {
        Frame::new_mono(w, h, vec![value; w * h])
    }

    #[test]
    fn test_merge_running_mean_matches_simple_average() {
        let a = flat_frame(2.0, 2, 2);
        let b = flat_frame(6.0, 2, 2);
        let merged = merge_running_mean(&a, &b, 2);
        assert!(merged.data.iter().all(|&v| (v - 4.0).abs() < 1e-4));
    }

    #[test]
    fn test_simple_reject_replaces_outlier_pixels() {
        let mut frame_data = vec![10.0; 16];
        frame_data[0] = 500.0;
        let frame = Frame::new_mono(4, 4, frame_data);
        let master = flat_frame(10.0, 4, 4);
        let (out, fraction) = simple_reject(&frame, &master, 1.0);
        assert_eq!(out.data[0], 10.0);
        assert!(fraction > 0.0);
    }

    #[test]
    fn test_publisher_invoked_on_successful_frame() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let publisher: Publisher = Arc::new(move |_msg, _data| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        publisher("NEWIMAGE", json!({}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
