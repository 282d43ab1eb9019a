//! Process-wide `TelescopeState` (spec.md §3/§9). A single record owned
//! by the server and mutated only by the currently-active automation
//! (scheduler or dark manager); HTTP/WS handlers read it only. Fields that
//! may be read concurrently while being replaced (`last_raw_frame`,
//! `last_stacked_preview`) are swapped as whole `Arc` values so readers
//! never observe a partially-updated frame (spec.md §5 "reference-swap"
//! policy), re-expressing the teacher's process-wide-state pattern per
//! §9's redesign note rather than exposing raw mutable globals.

use std::sync::{Arc, RwLock};

use nightloop_elements::fits::Frame;
use nightloop_elements::focus::FocusFitMethod;
use serde::Serialize;

use crate::image_settings::ImageSettings;

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct ConnectedFlags {
    pub mount: bool,
    pub camera: bool,
    pub wheel: bool,
    pub focuser: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct LastFocus {
    pub position: i32,
    pub method: FocusMethodTag,
    pub quality: f64,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub enum FocusMethodTag {
    Parabolic,
    Hyperbolic,
    RawMinimum,
}

impl From<FocusFitMethod> for FocusMethodTag {
    fn from(m: FocusFitMethod) -> Self {
        match m {
            FocusFitMethod::Parabolic => FocusMethodTag::Parabolic,
            FocusFitMethod::Hyperbolic => FocusMethodTag::Hyperbolic,
            FocusFitMethod::RawMinimum => FocusMethodTag::RawMinimum,
        }
    }
}

pub struct TelescopeState {
    pub slewing: RwLock<bool>,
    pub capturing: RwLock<bool>,
    pub focusing: RwLock<bool>,
    pub focused: RwLock<bool>,
    pub connected: RwLock<ConnectedFlags>,
    pub plan_active: RwLock<bool>,
    pub last_raw_frame: RwLock<Option<Arc<Frame>>>,
    pub last_stacked_preview: RwLock<Option<Arc<Frame>>>,
    pub last_focus: RwLock<Option<LastFocus>>,
    pub image_settings: crate::image_settings::ImageSettingsStore,
}

impl Default for TelescopeState {
    fn default() -> Self {
        TelescopeState {
            slewing: RwLock::new(false),
            capturing: RwLock::new(false),
            focusing: RwLock::new(false),
            focused: RwLock::new(false),
            connected: RwLock::new(ConnectedFlags::default()),
            plan_active: RwLock::new(false),
            last_raw_frame: RwLock::new(None),
            last_stacked_preview: RwLock::new(None),
            last_focus: RwLock::new(None),
            image_settings: crate::image_settings::ImageSettingsStore::new(),
        }
    }
}

impl TelescopeState {
    pub fn set_plan_active(&self, active: bool) {
        *self.plan_active.write().unwrap() = active;
    }

    pub fn plan_active(&self) -> bool {
        *self.plan_active.read().unwrap()
    }

    pub fn publish_raw_frame(&self, frame: Frame) {
        *self.last_raw_frame.write().unwrap() = Some(Arc::new(frame));
    }

    pub fn publish_stacked_preview(&self, frame: Frame) {
        *self.last_stacked_preview.write().unwrap() = Some(Arc::new(frame));
    }

    pub fn raw_frame(&self) -> Option<Arc<Frame>> {
        self.last_raw_frame.read().unwrap().clone()
    }

    pub fn stacked_preview(&self) -> Option<Arc<Frame>> {
        self.last_stacked_preview.read().unwrap().clone()
    }

    pub fn image_settings(&self) -> ImageSettings {
        self.image_settings.get()
    }
}
