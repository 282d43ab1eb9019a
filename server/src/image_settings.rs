//! Image Settings & Preview (spec.md §4.10): process-wide stretch/black-
//! point state, mutated via HTTP and read by every preview render.

use std::path::Path;
use std::sync::RwLock;

use canonical_error::CanonicalError;
use nightloop_elements::fits::{self, Frame, StretchAlgorithm};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ImageSettings {
    pub stretch: f64,
    pub black_point: i32,
}

impl Default for ImageSettings {
    fn default() -> Self {
        ImageSettings { stretch: 0.25, black_point: 0 }
    }
}

pub struct ImageSettingsStore {
    settings: RwLock<ImageSettings>,
}

impl Default for ImageSettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageSettingsStore {
    pub fn new() -> Self {
        ImageSettingsStore { settings: RwLock::new(ImageSettings::default()) }
    }

    pub fn get(&self) -> ImageSettings {
        *self.settings.read().unwrap()
    }

    pub fn set(&self, settings: ImageSettings) {
        *self.settings.write().unwrap() = settings;
    }
}

/// `normalize -> autoStretch(linear-percentile, strength=stretch) ->
/// replaceLowestPercentByZero(blackPoint) -> encode JPEG` (spec.md §4.10).
/// This is the fixed pipeline used by every `*image*` endpoint; the other
/// two stretch algorithms remain available (see
/// [`nightloop_elements::fits::auto_stretch`]) for the one-shot focusing
/// aid endpoints, which call into `elements::fits` directly instead of
/// through this fixed pipeline.
pub fn render_preview(frame: &Frame, settings: ImageSettings, out_path: &Path) -> Result<(), CanonicalError> {
    fits::save_preview(
        frame,
        out_path,
        StretchAlgorithm::LinearPercentile,
        settings.stretch,
        settings.black_point as f64,
        false,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let store = ImageSettingsStore::new();
        let s = store.get();
        assert_eq!(s.black_point, 0);
    }

    #[test]
    fn test_set_then_get_roundtrips() {
        let store = ImageSettingsStore::new();
        store.set(ImageSettings { stretch: 0.5, black_point: 3 });
        let s = store.get();
        assert_eq!(s.stretch, 0.5);
        assert_eq!(s.black_point, 3);
    }
}
