//! History Recorder (spec.md §4.9 / §3 `PlanExecution`). Per §9's "no
//! outbound dependency" note, this module depends on nothing else in the
//! crate; the scheduler calls into it, never the reverse.

use std::path::{Path, PathBuf};

use canonical_error::{internal_error, CanonicalError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Observation {
    pub start: f64,
    pub expo: f64,
    pub count: u32,
    pub ra: f64,
    pub dec: f64,
    pub filter: String,
    pub object: String,
    pub focus: bool,
    pub gain: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanExecution {
    pub observation: Observation,
    pub real_start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub images: u32,
    pub jpg: Option<PathBuf>,
}

impl PlanExecution {
    fn from_observation(observation: Observation) -> Self {
        PlanExecution { observation, real_start: None, end: None, images: 0, jpg: None }
    }
}

/// Persisted list of `PlanExecution`, one file per server instance (the
/// filesystem layout itself is out of this core's scope per spec.md §1 —
/// `path` is handed in by the caller).
pub struct HistoryRecorder {
    path: PathBuf,
    entries: Vec<PlanExecution>,
    /// Index of the entry currently being executed, if any.
    current: Option<usize>,
}

impl HistoryRecorder {
    /// Loads `path` if it exists, otherwise starts with an empty history.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CanonicalError> {
        let path = path.into();
        let entries = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| internal_error(&format!("reading history file: {e}")))?;
            serde_json::from_str(&raw).map_err(|e| internal_error(&format!("parsing history file: {e}")))?
        } else {
            Vec::new()
        };
        Ok(HistoryRecorder { path, entries, current: None })
    }

    pub fn entries(&self) -> &[PlanExecution] {
        &self.entries
    }

    pub fn entry(&self, index: usize) -> Option<&PlanExecution> {
        self.entries.get(index)
    }

    /// Converts each plan `Observation` to a `PlanExecution` and appends
    /// them, without starting any of them yet.
    pub fn append_from_plan(&mut self, plan: &[Observation]) {
        self.entries.extend(plan.iter().cloned().map(PlanExecution::from_observation));
    }

    pub fn mark_started(&mut self, index: usize) -> Result<(), CanonicalError> {
        let entry = self
            .entries
            .get_mut(index)
            .ok_or_else(|| internal_error("mark_started: index out of range"))?;
        entry.real_start = Some(Utc::now());
        self.current = Some(index);
        Ok(())
    }

    pub fn increment_capture_count(&mut self) -> Result<(), CanonicalError> {
        let idx = self.current.ok_or_else(|| internal_error("increment_capture_count: no active item"))?;
        self.entries[idx].images += 1;
        Ok(())
    }

    pub fn attach_preview_path(&mut self, path: PathBuf) -> Result<(), CanonicalError> {
        let idx = self.current.ok_or_else(|| internal_error("attach_preview_path: no active item"))?;
        self.entries[idx].jpg = Some(path);
        Ok(())
    }

    pub fn mark_ended(&mut self) -> Result<(), CanonicalError> {
        let idx = self.current.ok_or_else(|| internal_error("mark_ended: no active item"))?;
        self.entries[idx].end = Some(Utc::now());
        self.current = None;
        Ok(())
    }

    pub fn save(&self) -> Result<(), CanonicalError> {
        let raw = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| internal_error(&format!("serializing history: {e}")))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| internal_error(&format!("creating history dir: {e}")))?;
        }
        std::fs::write(&self.path, raw).map_err(|e| internal_error(&format!("writing history file: {e}")))
    }
}

pub fn observations_from_json(path: &Path) -> Result<Vec<Observation>, CanonicalError> {
    let raw = std::fs::read_to_string(path).map_err(|e| internal_error(&format!("reading plan: {e}")))?;
    serde_json::from_str(&raw).map_err(|e| internal_error(&format!("parsing plan: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_observation() -> Observation {
        Observation {
            start: 20.5,
            expo: 5.0,
            count: 3,
            ra: 10.684,
            dec: 41.269,
            filter: "L".into(),
            object: "M31".into(),
            focus: false,
            gain: 100,
        }
    }

    #[test]
    fn test_lifecycle_marks_started_captures_and_ends() {
        let dir = std::env::temp_dir().join(format!("nightloop-history-test-{}", std::process::id()));
        let path = dir.join("history.json");
        let mut recorder = HistoryRecorder::open(&path).unwrap();
        recorder.append_from_plan(&[sample_observation()]);
        recorder.mark_started(0).unwrap();
        recorder.increment_capture_count().unwrap();
        recorder.increment_capture_count().unwrap();
        recorder.attach_preview_path(PathBuf::from("/tmp/x.jpg")).unwrap();
        recorder.mark_ended().unwrap();

        assert_eq!(recorder.entries()[0].images, 2);
        assert!(recorder.entries()[0].real_start.is_some());
        assert!(recorder.entries()[0].end.is_some());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_operations_without_active_item_fail() {
        let dir = std::env::temp_dir().join(format!("nightloop-history-test2-{}", std::process::id()));
        let mut recorder = HistoryRecorder::open(dir.join("history.json")).unwrap();
        assert!(recorder.increment_capture_count().is_err());
        assert!(recorder.mark_ended().is_err());
    }
}
