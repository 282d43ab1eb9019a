//! Plan Scheduler (spec.md §4.7). The top-level orchestrator: one worker
//! owns the mount/camera serially and drives each `Observation` through
//! the state machine in §4.7. Grounded in the teacher's
//! `DetectEngine`/`Calibrator` pattern for cooperative-cancellation loops,
//! generalized from a single repeating measurement to a time-ordered plan.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use canonical_error::CanonicalError;
use chrono::{DateTime, Utc};
use nightloop_elements::astro_util;
use nightloop_elements::fits;
use nightloop_elements::focus::{self, FocusCurveSample};
use tracing::{info, warn};

use crate::dark_manager::DarkLibraryManager;
use crate::device::Rig;
use crate::history::{HistoryRecorder, Observation};
use crate::solver::{self, SolverConfig};
use crate::stacker::{LiveStacker, StackerConfig};
use crate::state::{FocusMethodTag, LastFocus, TelescopeState};
use crate::telemetry::{Sender, TelemetryBus};

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub slew_retry_budget: u32,
    pub acceptable_angular_error_deg: f64,
    pub capture_root: PathBuf,
    pub focus_search_range: i32,
    pub focus_step: i32,
    pub focus_images_per_position: u32,
    pub min_focus_stars: usize,
    pub solver: SolverConfig,
    pub stacker_target_width: usize,
    /// Camera set-point commanded once before the plan's first item, if the
    /// camera is cooled (spec.md §4.7's `set_temperature` step). `None`
    /// skips the step entirely.
    pub target_temperature_c: Option<f64>,
}

pub struct Scheduler {
    rig: Arc<Rig>,
    bus: Arc<TelemetryBus>,
    history: Arc<Mutex<HistoryRecorder>>,
    dark_manager: Arc<DarkLibraryManager>,
    state: Arc<TelescopeState>,
    config: SchedulerConfig,
    stop_request: Arc<AtomicBool>,
    camera_name: String,
}

impl Scheduler {
    pub fn new(
        rig: Arc<Rig>,
        bus: Arc<TelemetryBus>,
        history: Arc<Mutex<HistoryRecorder>>,
        dark_manager: Arc<DarkLibraryManager>,
        state: Arc<TelescopeState>,
        config: SchedulerConfig,
        camera_name: String,
    ) -> Self {
        Scheduler { rig, bus, history, dark_manager, state, config, stop_request: Arc::new(AtomicBool::new(false)), camera_name }
    }

    pub fn request_stop(&self) {
        self.stop_request.store(true, Ordering::Relaxed);
    }

    fn stop_requested(&self) -> bool {
        self.stop_request.load(Ordering::Relaxed)
    }

    /// Runs the full plan. Guarantees `planActive=false` on every exit
    /// path (spec.md §4.7/§8), whether the plan completes, is stopped, or
    /// a step fails outright.
    pub async fn run(&self, plan: Vec<Observation>) -> Result<(), CanonicalError> {
        self.stop_request.store(false, Ordering::Relaxed);
        self.state.set_plan_active(true);
        let result = self.run_inner(plan).await;
        self.state.set_plan_active(false);
        if let Err(ref e) = result {
            warn!("scheduler exited with error: {}", e.message);
        }
        result
    }

    async fn run_inner(&self, plan: Vec<Observation>) -> Result<(), CanonicalError> {
        let base_index = {
            let mut history = self.history.lock().unwrap();
            let base = history.entries().len();
            history.append_from_plan(&plan);
            base
        };

        let cooler_turned_on_by_us = self.set_temperature().await;

        // Scheduler execution order = lexicographic (start, original
        // index) after day-wrap normalization (spec.md §8).
        let mut ordered: Vec<(usize, Observation)> = plan.into_iter().enumerate().collect();
        ordered.sort_by(|a, b| a.1.start.partial_cmp(&b.1.start).unwrap().then(a.0.cmp(&b.0)));

        // Resolved up front (rather than incrementally inside the loop
        // below) so each item's capture_loop can be told when the next
        // item's start arrives and cut its own captures short (spec.md
        // §4.7).
        let mut target_starts = Vec::with_capacity(ordered.len());
        let mut previous_start: Option<DateTime<Utc>> = None;
        for (_, observation) in &ordered {
            let target_start = astro_util::resolve_start_time(observation.start, Utc::now(), previous_start);
            target_starts.push(target_start);
            previous_start = Some(target_start);
        }

        for (i, (original_index, observation)) in ordered.iter().enumerate() {
            if self.stop_requested() {
                break;
            }
            self.wait_for_start(target_starts[i]).await;
            if self.stop_requested() {
                break;
            }
            let next_start = target_starts.get(i + 1).copied();

            let history_index = base_index + original_index;
            self.history.lock().unwrap().mark_started(history_index)?;
            self.run_item(observation, next_start).await;
            self.history.lock().unwrap().mark_ended()?;
            self.bus.broadcast_sync(Sender::Scheduler, "REFRESHINFO", None);
        }

        if cooler_turned_on_by_us {
            self.rig.camera.set_cooler(false).await;
        }
        self.history.lock().unwrap().save()?;
        Ok(())
    }

    /// Commands the camera to `config.target_temperature_c` once before the
    /// plan's first item and polls until within tolerance, emitting
    /// TEMPERATURE events (spec.md §4.7's optional `set_temperature` step,
    /// matching §4.5's identical stabilization pattern in the dark
    /// manager). Returns whether this call turned the cooler on.
    async fn set_temperature(&self) -> bool {
        let Some(target) = self.config.target_temperature_c else { return false };
        if self.rig.camera.get_ccd_temperature().await.is_none() {
            warn!("camera does not report temperature; skipping stabilization");
            return false;
        }
        self.bus.status(Sender::Scheduler, "set_temperature");
        self.rig.camera.set_cooler(true).await;
        self.rig.camera.set_ccd_temperature(target).await;
        loop {
            if self.stop_requested() {
                return true;
            }
            let actual = self.rig.camera.get_ccd_temperature().await.unwrap_or(target);
            self.bus.broadcast_sync(
                Sender::Scheduler,
                "TEMPERATURE",
                Some(serde_json::json!({ "actual": actual, "target": target })),
            );
            if (actual - target).abs() < crate::dark_manager::DARK_TEMP_TOLERANCE_C {
                return true;
            }
            tokio::time::sleep(crate::dark_manager::DARK_TEMP_POLL_INTERVAL).await;
        }
    }

    /// Polls the stop flag once a second while waiting (spec.md §4.7).
    async fn wait_for_start(&self, target: DateTime<Utc>) {
        self.bus.status(Sender::Scheduler, "waiting_for_start");
        loop {
            if self.stop_requested() {
                return;
            }
            let now = Utc::now();
            if now >= target {
                return;
            }
            let remaining = (target - now).num_milliseconds().max(0) as u64;
            tokio::time::sleep(Duration::from_millis(remaining.min(1000))).await;
        }
    }

    async fn run_item(&self, observation: &Observation, next_start: Option<DateTime<Utc>>) {
        if self.stop_requested() {
            return;
        }

        self.bus.status(Sender::Scheduler, "changing_filter");
        if !self.rig.wheel.change_filter(&observation.filter).await {
            warn!("filter change to {} failed; continuing with current filter", observation.filter);
        }

        if observation.focus || !*self.state.focused.read().unwrap() {
            self.run_autofocus(observation).await;
        }
        if self.stop_requested() {
            return;
        }

        match self.slew_and_solve(observation).await {
            SlewSolveOutcome::Stopped => return,
            SlewSolveOutcome::Failed => {
                self.bus.broadcast_sync(
                    Sender::Scheduler,
                    "STATUS",
                    Some(serde_json::json!({ "status": "solve_failed_skipping", "object": observation.object })),
                );
                return;
            }
            SlewSolveOutcome::Solved => {}
        }

        self.bus.status(Sender::Scheduler, "tracking_on");
        self.rig.mount.set_tracking(1.0).await;

        self.capture_loop(observation, next_start).await;
    }

    /// Autofocus (spec.md §4.4): offsets declination to find an
    /// empty-enough field, then sweeps the focuser.
    async fn run_autofocus(&self, observation: &Observation) {
        // Offset declination slightly so autofocus doesn't disturb the
        // target frame's own star field registration.
        let focus_dec = (observation.dec + 2.0).min(89.0);
        let _ = self.rig.mount.slew_to(observation.ra, focus_dec).await;
        self.sweep_and_focus().await;
    }

    /// Run from `/focuser/autofocus` outside of any plan: sweeps the
    /// focuser at wherever the mount currently points.
    pub async fn run_autofocus_standalone(&self) -> bool {
        self.sweep_and_focus().await
    }

    /// Samples `[cur-R, cur+R)` by `S`, `N` images per position, and drives
    /// the focuser to the fitted best position. Returns whether a best
    /// position was found and applied.
    async fn sweep_and_focus(&self) -> bool {
        *self.state.focusing.write().unwrap() = true;
        self.bus.status(Sender::Focuser, "focusing");

        let Some(current) = self.rig.focuser.position().await else {
            *self.state.focusing.write().unwrap() = false;
            return false;
        };

        let mut samples = Vec::new();
        let mut position = current - self.config.focus_search_range;
        let end = current + self.config.focus_search_range;
        while position < end {
            if self.stop_requested() {
                break;
            }
            if !self.rig.focuser.move_to(position).await {
                position += self.config.focus_step;
                continue;
            }
            let mut best_sample: Option<FocusCurveSample> = None;
            for _ in 0..self.config.focus_images_per_position.max(1) {
                if let Ok(frame) = self.rig.camera.capture_frame(2.0, true).await {
                    let mono = if frame.is_color() { frame.channel_plane(0) } else { frame };
                    let sample = focus::measure_stars(&mono, 5.0, 200);
                    if best_sample.as_ref().map(|b| sample.fwhm < b.fwhm).unwrap_or(true) {
                        best_sample = Some(sample);
                    }
                }
            }
            if let Some(mut sample) = best_sample {
                sample.position = position;
                if sample.star_count < self.config.min_focus_stars {
                    sample.valid = false;
                }
                samples.push(sample);
            }
            position += self.config.focus_step;
        }

        let found = if let Some((pos, method, quality)) = focus::calculate_best_focus(&samples) {
            let rounded = pos.round() as i32;
            let applied = self.rig.focuser.move_to(rounded).await;
            if applied {
                *self.state.focused.write().unwrap() = true;
                *self.state.last_focus.write().unwrap() = Some(LastFocus {
                    position: rounded,
                    method: FocusMethodTag::from(method),
                    quality,
                });
                info!(rounded, ?method, quality, "autofocus complete");
            }
            applied
        } else {
            warn!("autofocus produced no valid samples");
            false
        };
        *self.state.focusing.write().unwrap() = false;
        found
    }

    /// Up to `R` attempts: slew, short light capture, solve, sync on
    /// success within tolerance (spec.md §4.7). A solve that never
    /// succeeds within the retry budget skips the item entirely, per the
    /// state diagram's `fail: retry <= R else skip` transition.
    async fn slew_and_solve(&self, observation: &Observation) -> SlewSolveOutcome {
        for attempt in 0..self.config.slew_retry_budget.max(1) {
            if self.stop_requested() {
                return SlewSolveOutcome::Stopped;
            }
            self.bus.status(Sender::Scheduler, "slewing");
            *self.state.slewing.write().unwrap() = true;
            self.rig.mount.slew_to(observation.ra, observation.dec).await;
            *self.state.slewing.write().unwrap() = false;

            self.bus.status(Sender::Scheduler, "plate_solving");
            let Ok(frame) = self.rig.camera.capture_frame(3.0, true).await else {
                continue;
            };
            let temp_path = self.config.capture_root.join("solve_attempt.fits");
            if fits::save_fits(&frame, &temp_path, &Default::default()).is_err() {
                continue;
            }

            let result = solver::solve(&self.config.solver, &temp_path, Some(observation.ra), observation.dec, 15.0);
            let Ok(result) = result else { continue };

            if result.error == 0 {
                let error_deg = astro_util::naive_angular_error_deg(observation.ra, observation.dec, result.ra, result.dec);
                let is_last_attempt = attempt + 1 == self.config.slew_retry_budget.max(1);
                if error_deg < self.config.acceptable_angular_error_deg || is_last_attempt {
                    if error_deg >= self.config.acceptable_angular_error_deg {
                        warn!(error_deg, "plate-solve residual error exceeds threshold on final retry; continuing anyway");
                    }
                    self.rig.mount.sync_to(result.ra, result.dec).await;
                    return SlewSolveOutcome::Solved;
                }
            }
        }
        SlewSolveOutcome::Failed
    }

    async fn capture_loop(&self, observation: &Observation, next_start: Option<DateTime<Utc>>) {
        *self.state.capturing.write().unwrap() = true;
        self.bus.status(Sender::Scheduler, "capturing");

        let master_dark = self.dark_manager.select(&self.camera_name, observation.expo, observation.gain, None).and_then(|d| {
            fits::load(&d.filename, None, None, true).ok()
        });

        let bus = self.bus.clone();
        let publish: crate::stacker::Publisher = Arc::new(move |message, data| {
            bus.broadcast_sync(Sender::Scheduler, message, Some(data));
        });
        let mut stacker_config = StackerConfig { target_width: self.config.stacker_target_width, ..StackerConfig::default() };
        stacker_config.master_dark = master_dark;
        let mut stacker = LiveStacker::new(stacker_config, publish);

        let dir = self.config.capture_root.join(format!("{}-{}", Utc::now().format("%Y-%m-%d"), observation.object));
        let _ = std::fs::create_dir_all(&dir);

        self.rig.camera.set_gain(observation.gain).await;

        for _ in 0..observation.count {
            if self.stop_requested() {
                break;
            }
            if let Some(next_start) = next_start {
                if Utc::now() >= next_start {
                    break;
                }
            }
            let Ok(frame) = self.rig.camera.capture_frame(observation.expo, true).await else {
                continue;
            };
            self.state.publish_raw_frame(frame.clone());

            let filename = dir.join(format!("capture-{}-{}-{}.fits", observation.object, observation.filter, Utc::now().timestamp()));
            let mut headers = fits::HeaderMap::new();
            headers.insert("EXPTIME".into(), fits::HeaderValue::Float(observation.expo));
            headers.insert("GAIN".into(), fits::HeaderValue::Int(observation.gain as i64));
            headers.insert("RA".into(), fits::HeaderValue::Float(observation.ra));
            headers.insert("DEC".into(), fits::HeaderValue::Float(observation.dec));
            if fits::save_fits(&frame, &filename, &headers).is_err() {
                continue;
            }

            stacker.process_new_image(filename.clone());
            if let Err(e) = self.history.lock().unwrap().increment_capture_count() {
                warn!("failed to record capture: {}", e.message);
            }
            if let Some(master) = stacker.current_master() {
                self.state.publish_stacked_preview(master.clone());
                let preview_path = dir.join(format!("preview-{}.jpg", Utc::now().timestamp()));
                if crate::image_settings::render_preview(&master, self.state.image_settings(), &preview_path).is_ok() {
                    let _ = self.history.lock().unwrap().attach_preview_path(preview_path);
                }
            }
        }

        stacker.stop();
        *self.state.capturing.write().unwrap() = false;
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SlewSolveOutcome {
    Stopped,
    Solved,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_order_is_lexicographic_start_then_index() {
        let obs = vec![
            Observation { start: 5.0, expo: 1.0, count: 1, ra: 0.0, dec: 0.0, filter: "L".into(), object: "a".into(), focus: false, gain: 0 },
            Observation { start: 1.0, expo: 1.0, count: 1, ra: 0.0, dec: 0.0, filter: "L".into(), object: "b".into(), focus: false, gain: 0 },
            Observation { start: 1.0, expo: 1.0, count: 1, ra: 0.0, dec: 0.0, filter: "L".into(), object: "c".into(), focus: false, gain: 0 },
        ];
        let mut ordered: Vec<(usize, Observation)> = obs.into_iter().enumerate().collect();
        ordered.sort_by(|a, b| a.1.start.partial_cmp(&b.1.start).unwrap().then(a.0.cmp(&b.0)));
        let names: Vec<&str> = ordered.iter().map(|(_, o)| o.object.as_str()).collect();
        assert_eq!(names, vec!["b", "c", "a"]);
    }
}
