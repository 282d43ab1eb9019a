//! Configuration (spec.md §6 "Config files"). Out of the core's scope per
//! §1 ("on-disk JSON config files" is an external collaborator), so this
//! module is the thin adapter the core consumes through: read at startup,
//! polled for changes on a background interval, no filesystem-layout
//! conventions assumed beyond what the caller points us at.
//!
//! The teacher has no analogous module (its config travels over
//! protobuf/prost, not files); `serde`/`serde_json` is the ecosystem
//! substitute, matching how `cosmic-utils-camera` and `RReverser-alpaca-
//! dslr`'s `ascom-alpaca-rs` use `serde` for their own JSON surfaces.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use canonical_error::{internal_error, CanonicalError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct GlobalConfig {
    pub bind_address: Option<String>,
    pub history_path: Option<PathBuf>,
    pub dark_root: Option<PathBuf>,
    pub capture_root: Option<PathBuf>,
    pub solver_executable: Option<PathBuf>,
    pub solver_catalog: Option<PathBuf>,
    pub slew_retry_budget: Option<u32>,
    pub acceptable_angular_error_deg: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ObservatoryConfig {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub elevation_m: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct TelescopeConfig {
    pub focal_length_mm: f64,
    pub aperture_mm: f64,
    pub max_focuser_step: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct CameraConfig {
    pub name: String,
    pub sensor_width_px: u32,
    pub sensor_height_px: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct FilterWheelConfig {
    pub names: Vec<String>,
}

/// A named category of equipment config, e.g. `cameras.json` holding many
/// `CameraConfig` entries keyed by name, with `default.json` naming which
/// one is active (§6's CRUD-over-equipment-configs endpoints).
pub struct ConfigCategory<T> {
    path: PathBuf,
    default_path: PathBuf,
    pub entries: HashMap<String, T>,
    pub default: Option<String>,
}

impl<T: Serialize + for<'de> Deserialize<'de> + Clone> ConfigCategory<T> {
    pub fn load(dir: &Path, filename: &str) -> Result<Self, CanonicalError> {
        let path = dir.join(filename);
        let entries = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|e| internal_error(&format!("reading {filename}: {e}")))?;
            serde_json::from_str(&raw).map_err(|e| internal_error(&format!("parsing {filename}: {e}")))?
        } else {
            HashMap::new()
        };
        let default_path = dir.join("default.json");
        let default = if default_path.exists() {
            let raw = std::fs::read_to_string(&default_path).ok();
            raw.and_then(|r| serde_json::from_str::<HashMap<String, String>>(&r).ok())
                .and_then(|m| m.get(filename.trim_end_matches(".json")).cloned())
        } else {
            None
        };
        Ok(ConfigCategory { path, default_path, entries, default })
    }

    pub fn save(&self) -> Result<(), CanonicalError> {
        let raw = serde_json::to_string_pretty(&self.entries).map_err(|e| internal_error(&format!("serializing config: {e}")))?;
        std::fs::write(&self.path, raw).map_err(|e| internal_error(&format!("writing config: {e}")))
    }

    pub fn current(&self) -> Option<&T> {
        self.default.as_ref().and_then(|name| self.entries.get(name))
    }

    fn category_key(&self) -> String {
        self.path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string()
    }

    /// Persists `self.default` into the shared `default.json`, preserving
    /// whatever other categories already recorded there.
    pub fn save_default(&self) -> Result<(), CanonicalError> {
        let mut map: HashMap<String, String> = if self.default_path.exists() {
            let raw = std::fs::read_to_string(&self.default_path)
                .map_err(|e| internal_error(&format!("reading default.json: {e}")))?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };
        match &self.default {
            Some(name) => {
                map.insert(self.category_key(), name.clone());
            }
            None => {
                map.remove(&self.category_key());
            }
        }
        let raw = serde_json::to_string_pretty(&map).map_err(|e| internal_error(&format!("serializing default.json: {e}")))?;
        std::fs::write(&self.default_path, raw).map_err(|e| internal_error(&format!("writing default.json: {e}")))
    }

    /// Raw contents of this category's `*schema.json`, for the `/schema`
    /// read-only endpoints. `Ok(Value::Null)` when no schema file exists.
    pub fn load_schema(&self) -> Result<Value, CanonicalError> {
        let Some(dir) = self.path.parent() else { return Ok(Value::Null) };
        let schema_path = dir.join(format!("{}schema.json", self.category_key()));
        if !schema_path.exists() {
            return Ok(Value::Null);
        }
        let raw = std::fs::read_to_string(&schema_path).map_err(|e| internal_error(&format!("reading schema: {e}")))?;
        serde_json::from_str(&raw).map_err(|e| internal_error(&format!("parsing schema: {e}")))
    }
}

/// Validates `value` against a schema document loaded from
/// `{filename}schema.json`, checking only that every key the schema
/// declares `required` is present — a structural subset of JSON Schema,
/// sufficient for the "typed validation" §6 names without pulling in a
/// full validator for a config surface outside this core's scope.
pub fn validate_against_schema(dir: &Path, filename: &str, value: &Value) -> Result<(), CanonicalError> {
    let schema_path = dir.join(format!("{filename}schema.json"));
    if !schema_path.exists() {
        return Ok(());
    }
    let raw = std::fs::read_to_string(&schema_path).map_err(|e| internal_error(&format!("reading schema: {e}")))?;
    let schema: Value = serde_json::from_str(&raw).map_err(|e| internal_error(&format!("parsing schema: {e}")))?;
    let Some(required) = schema.get("required").and_then(|r| r.as_array()) else {
        return Ok(());
    };
    for key in required {
        let Some(key) = key.as_str() else { continue };
        if value.get(key).is_none() {
            return Err(internal_error(&format!("config missing required field `{key}`")));
        }
    }
    Ok(())
}

/// Polls `path` for mtime changes every `interval`, invoking `on_change`
/// with the freshly-read contents whenever it differs from the last
/// observed mtime. Runs until the process exits; simple polling over
/// inotify plumbing, matching a headless/embedded deployment's preference
/// for fewer moving parts.
pub async fn poll_for_changes(
    path: PathBuf,
    interval: std::time::Duration,
    mut on_change: impl FnMut(String) + Send + 'static,
) {
    let mut last_modified: Option<SystemTime> = None;
    loop {
        tokio::time::sleep(interval).await;
        let Ok(metadata) = std::fs::metadata(&path) else { continue };
        let Ok(modified) = metadata.modified() else { continue };
        if Some(modified) != last_modified {
            last_modified = Some(modified);
            match std::fs::read_to_string(&path) {
                Ok(contents) => {
                    info!(?path, "config file changed, reloading");
                    on_change(contents);
                }
                Err(e) => warn!(?path, "failed to reload changed config: {e}"),
            }
        }
    }
}

/// Spawns a background task that reloads a config category's `RwLock`
/// whenever its backing file's mtime changes (§6 "polled on change").
/// Parse failures are logged and the previous in-memory value is kept.
pub fn spawn_category_poller<T>(
    dir: PathBuf,
    filename: &'static str,
    interval: std::time::Duration,
    store: std::sync::Arc<std::sync::RwLock<ConfigCategory<T>>>,
) where
    T: Serialize + for<'de> Deserialize<'de> + Clone + Send + Sync + 'static,
{
    let path = dir.join(filename);
    tokio::spawn(poll_for_changes(path, interval, move |_contents| match ConfigCategory::<T>::load(&dir, filename) {
        Ok(fresh) => *store.write().unwrap() = fresh,
        Err(e) => warn!("failed to reload {filename}: {e}"),
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_against_schema_passes_when_no_schema_file() {
        let dir = std::env::temp_dir();
        let value = serde_json::json!({ "a": 1 });
        assert!(validate_against_schema(&dir, "nonexistent_config", &value).is_ok());
    }

    #[test]
    fn test_validate_against_schema_rejects_missing_required_field() {
        let dir = std::env::temp_dir().join(format!("nightloop-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("camerasschema.json"), r#"{"required": ["name"]}"#).unwrap();
        let value = serde_json::json!({ "other": 1 });
        assert!(validate_against_schema(&dir, "cameras", &value).is_err());
        let valid = serde_json::json!({ "name": "asi2600" });
        assert!(validate_against_schema(&dir, "cameras", &valid).is_ok());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
