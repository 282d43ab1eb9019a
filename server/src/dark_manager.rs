//! Dark Library Manager (spec.md §4.5). Background automation analogous
//! to the scheduler but simpler: no slewing, solving or filter changes —
//! just temperature stabilization, gain, and repeated dark captures
//! accumulated into a mean.
//!
//! Mutual exclusion with the scheduler (spec.md §4.5 "Dark manager and
//! scheduler are mutually exclusive") is enforced by the caller
//! (`EngineState`'s single `ActiveAutomation` slot), not by this module.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use canonical_error::{internal_error, CanonicalError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::device::Camera;
use crate::telemetry::{Sender, TelemetryBus};

pub const DARK_TEMP_TOLERANCE_C: f64 = 1.0;
pub const DARK_TEMP_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Deserialize)]
pub struct DarkPlanItem {
    pub gain: i32,
    pub temperature: Option<f64>,
    pub exposition: f64,
    pub count: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DarkDescriptor {
    pub camera: String,
    pub gain: i32,
    pub temperature: f64,
    pub exposition: f64,
    pub count: u32,
    pub date: chrono::DateTime<Utc>,
    pub filename: PathBuf,
}

#[derive(Default, Serialize, Deserialize)]
struct DarkIndex {
    #[serde(default)]
    by_camera: HashMap<String, Vec<DarkDescriptor>>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct DarkProgress {
    pub captured: u32,
    pub total: u32,
    pub eta_seconds: Option<f64>,
}

pub struct DarkLibraryManager {
    dark_root: PathBuf,
    index_path: PathBuf,
    index: Mutex<DarkIndex>,
    stop_request: Arc<AtomicBool>,
    progress: Arc<Mutex<Option<DarkProgress>>>,
}

impl DarkLibraryManager {
    pub fn open(dark_root: PathBuf) -> Result<Self, CanonicalError> {
        let index_path = dark_root.join("config.json");
        let index = if index_path.exists() {
            let raw = std::fs::read_to_string(&index_path)
                .map_err(|e| internal_error(&format!("reading dark index: {e}")))?;
            serde_json::from_str(&raw).map_err(|e| internal_error(&format!("parsing dark index: {e}")))?
        } else {
            DarkIndex::default()
        };
        Ok(DarkLibraryManager {
            dark_root,
            index_path,
            index: Mutex::new(index),
            stop_request: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(Mutex::new(None)),
        })
    }

    /// Dark selection (spec.md §4.5/§8): a total function returning exactly
    /// one descriptor or none, deterministic for a fixed library. Matches
    /// `exposition`+`gain` exactly; matches `temperature` exactly only when
    /// a target temperature was specified, else takes the first
    /// `(exposition, gain)` match in library order.
    pub fn select(&self, camera: &str, exposition: f64, gain: i32, temperature: Option<f64>) -> Option<DarkDescriptor> {
        let index = self.index.lock().unwrap();
        let candidates = index.by_camera.get(camera)?;
        candidates
            .iter()
            .find(|d| {
                d.exposition == exposition
                    && d.gain == gain
                    && temperature.map(|t| (d.temperature - t).abs() < 1e-9).unwrap_or(true)
            })
            .cloned()
    }

    pub fn list(&self, camera: &str) -> Vec<DarkDescriptor> {
        self.index.lock().unwrap().by_camera.get(camera).cloned().unwrap_or_default()
    }

    pub fn progress(&self) -> Option<DarkProgress> {
        self.progress.lock().unwrap().clone()
    }

    pub fn request_stop(&self) {
        self.stop_request.store(true, Ordering::Relaxed);
    }

    /// Runs `plan` to completion or until stopped. Cooperative: the stop
    /// flag is checked between frames and between items (spec.md §4.5
    /// "Stop policy").
    pub async fn run(
        &self,
        camera_name: &str,
        camera: &dyn Camera,
        plan: &[DarkPlanItem],
        bus: &TelemetryBus,
    ) -> Result<(), CanonicalError> {
        self.stop_request.store(false, Ordering::Relaxed);
        let mut cooler_was_turned_on_by_us = false;

        for item in plan {
            if self.stop_request.load(Ordering::Relaxed) {
                break;
            }

            if let Some(target) = item.temperature {
                if !camera.get_ccd_temperature().await.map(|_| true).unwrap_or(false) {
                    warn!("camera does not report temperature; skipping stabilization");
                } else {
                    camera.set_cooler(true).await;
                    cooler_was_turned_on_by_us = true;
                    camera.set_ccd_temperature(target).await;
                    loop {
                        if self.stop_request.load(Ordering::Relaxed) {
                            break;
                        }
                        let actual = camera.get_ccd_temperature().await.unwrap_or(target);
                        bus.broadcast_sync(
                            Sender::DarkManager,
                            "TEMPERATURE",
                            Some(serde_json::json!({ "actual": actual, "target": target })),
                        );
                        if (actual - target).abs() < DARK_TEMP_TOLERANCE_C {
                            break;
                        }
                        tokio::time::sleep(DARK_TEMP_POLL_INTERVAL).await;
                    }
                }
            }
            if self.stop_request.load(Ordering::Relaxed) {
                break;
            }

            camera.set_gain(item.gain).await;

            let mut sum: Option<nightloop_elements::fits::Frame> = None;
            let mut captured = 0u32;
            *self.progress.lock().unwrap() = Some(DarkProgress { captured: 0, total: item.count, eta_seconds: None });

            for _ in 0..item.count {
                if self.stop_request.load(Ordering::Relaxed) {
                    break;
                }
                let frame = camera.capture_frame(item.exposition, false).await?;
                sum = Some(match sum {
                    None => scale_frame(&frame, 1.0 / item.count as f32),
                    Some(acc) => add_scaled(&acc, &frame, 1.0 / item.count as f32),
                });
                captured += 1;
                bus.broadcast_sync(Sender::DarkManager, "NEWIMAGE", Some(serde_json::json!({ "captured": captured })));
                *self.progress.lock().unwrap() = Some(DarkProgress {
                    captured,
                    total: item.count,
                    eta_seconds: Some((item.count - captured) as f64 * item.exposition),
                });
            }

            if let Some(mean_frame) = sum {
                let actual_temp = camera.get_ccd_temperature().await.unwrap_or(item.temperature.unwrap_or(0.0));
                let filename = self.dark_root.join(camera_name).join(format!(
                    "dark_{}_{}_{}.fits",
                    item.exposition as i64, item.gain, actual_temp as i64
                ));
                if let Some(parent) = filename.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| internal_error(&format!("creating dark dir: {e}")))?;
                }
                nightloop_elements::fits::save_fits(&mean_frame, &filename, &Default::default())?;

                let descriptor = DarkDescriptor {
                    camera: camera_name.to_string(),
                    gain: item.gain,
                    temperature: actual_temp,
                    exposition: item.exposition,
                    count: captured,
                    date: Utc::now(),
                    filename,
                };
                self.append_descriptor(descriptor);
                self.save_index()?;
            }
            info!(captured, requested = item.count, "dark item complete");
        }

        if cooler_was_turned_on_by_us {
            camera.set_cooler(false).await;
        }
        *self.progress.lock().unwrap() = None;
        Ok(())
    }

    fn append_descriptor(&self, descriptor: DarkDescriptor) {
        let mut index = self.index.lock().unwrap();
        index.by_camera.entry(descriptor.camera.clone()).or_default().push(descriptor);
    }

    fn save_index(&self) -> Result<(), CanonicalError> {
        let index = self.index.lock().unwrap();
        let raw = serde_json::to_string_pretty(&*index).map_err(|e| internal_error(&format!("serializing dark index: {e}")))?;
        std::fs::create_dir_all(&self.dark_root).map_err(|e| internal_error(&format!("creating dark root: {e}")))?;
        std::fs::write(&self.index_path, raw).map_err(|e| internal_error(&format!("writing dark index: {e}")))
    }

    pub fn remove(&self, camera_name: &str, date: chrono::DateTime<Utc>) -> Result<(), CanonicalError> {
        let mut index = self.index.lock().unwrap();
        if let Some(list) = index.by_camera.get_mut(camera_name) {
            list.retain(|d| d.date != date);
        }
        drop(index);
        self.save_index()
    }
}

fn scale_frame(frame: &nightloop_elements::fits::Frame, factor: f32) -> nightloop_elements::fits::Frame {
    let data = frame.data.iter().map(|&v| v * factor).collect();
    nightloop_elements::fits::Frame { data, ..frame.clone() }
}

fn add_scaled(acc: &nightloop_elements::fits::Frame, frame: &nightloop_elements::fits::Frame, factor: f32) -> nightloop_elements::fits::Frame {
    let data = acc.data.iter().zip(frame.data.iter()).map(|(&a, &f)| a + f * factor).collect();
    nightloop_elements::fits::Frame { data, ..acc.clone() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_matches_exact_temperature_when_specified() {
        let manager = DarkLibraryManager::open(std::env::temp_dir().join(format!("nightloop-dark-test-{}", std::process::id()))).unwrap();
        manager.append_descriptor(DarkDescriptor {
            camera: "cam0".into(),
            gain: 100,
            temperature: -10.0,
            exposition: 30.0,
            count: 10,
            date: Utc::now(),
            filename: PathBuf::from("a.fits"),
        });
        manager.append_descriptor(DarkDescriptor {
            camera: "cam0".into(),
            gain: 100,
            temperature: -15.0,
            exposition: 30.0,
            count: 10,
            date: Utc::now(),
            filename: PathBuf::from("b.fits"),
        });

        let exact = manager.select("cam0", 30.0, 100, Some(-15.0)).unwrap();
        assert_eq!(exact.filename, PathBuf::from("b.fits"));

        let first_match = manager.select("cam0", 30.0, 100, None).unwrap();
        assert_eq!(first_match.filename, PathBuf::from("a.fits"));

        assert!(manager.select("cam0", 30.0, 100, Some(-99.0)).is_none());
    }
}
