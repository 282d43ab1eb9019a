//! Device Interface (spec.md §4.1). A tagged interface with two
//! implementations chosen at startup by config (per §9's "Hardware
//! variants" redesign note): a simulator backed by a directory of sample
//! FITS frames, and a real driver speaking the Alpaca/ASCOM HTTP protocol.
//! The scheduler holds only `Arc<dyn Mount>` etc and never knows which
//! backend is live.
//!
//! Failure policy (§4.1): device errors are logged and returned as `Ok(false)`
//! or a typed `CanonicalError` from the fallible setters; nothing here panics
//! or propagates into the scheduler's top frame.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use canonical_error::{failed_precondition_error, internal_error, CanonicalError};
use nightloop_elements::fits::{BayerPattern, Frame};
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ConnectedBits {
    pub mount: bool,
    pub camera: bool,
    pub wheel: bool,
    pub focuser: bool,
}

#[async_trait]
pub trait Mount: Send + Sync {
    async fn connect(&self) -> bool;
    async fn disconnect(&self) -> bool;
    /// Blocks (cooperatively polling `stop`) until the mount reports
    /// stationary.
    async fn slew_to(&self, ra: f64, dec: f64) -> bool;
    /// Overrides the mount's internal coordinates without moving it; used
    /// post-solve to correct pointing drift.
    async fn sync_to(&self, ra: f64, dec: f64) -> bool;
    async fn set_tracking(&self, rate: f64) -> bool;
    async fn unpark(&self) -> bool;
    async fn get_location(&self) -> Option<(f64, f64)>;
    async fn get_utc(&self) -> Option<chrono::DateTime<chrono::Utc>>;
    async fn set_utc(&self, time: chrono::DateTime<chrono::Utc>) -> bool;
    async fn has_gps(&self) -> bool;
}

#[async_trait]
pub trait FilterWheel: Send + Sync {
    /// Resolves `label` against the configured filter list and moves the
    /// wheel to the matching position.
    async fn change_filter(&self, label: &str) -> bool;
    fn filter_names(&self) -> Vec<String>;
}

#[async_trait]
pub trait Focuser: Send + Sync {
    async fn move_to(&self, position: i32) -> bool;
    async fn halt(&self) -> bool;
    async fn position(&self) -> Option<i32>;
    fn max_step(&self) -> i32;
}

#[derive(Clone, Copy, Debug)]
pub struct CameraCapabilities {
    pub bayer: Option<BayerPattern>,
    pub sensor_tag: &'static str,
}

#[async_trait]
pub trait Camera: Send + Sync {
    /// Blocks until the image is ready; returns a frame whose shape is
    /// `(H,W)` or `(H,W,C)` — axes are already in that order by the time
    /// this returns, regardless of how the underlying driver reports them.
    async fn capture_frame(&self, exposure_sec: f64, is_light: bool) -> Result<Frame, CanonicalError>;
    async fn set_gain(&self, gain: i32) -> bool;
    async fn set_bin_x(&self, bin: u32) -> bool;
    async fn set_bin_y(&self, bin: u32) -> bool;
    async fn set_ccd_temperature(&self, target_c: f64) -> bool;
    async fn set_cooler(&self, on: bool) -> bool;
    async fn get_ccd_temperature(&self) -> Option<f64>;
    fn capabilities(&self) -> CameraCapabilities;
}

/// Bundles the four device roles plus the process-wide connection bits, the
/// unit the scheduler and dark manager are actually constructed with.
pub struct Rig {
    pub mount: Box<dyn Mount>,
    pub camera: Box<dyn Camera>,
    pub wheel: Box<dyn FilterWheel>,
    pub focuser: Box<dyn Focuser>,
    pub connected: Mutex<ConnectedBits>,
}

impl Rig {
    pub async fn connect_all(&self) -> ConnectedBits {
        let bits = ConnectedBits {
            mount: self.mount.connect().await,
            camera: true, // Simulator/Alpaca camera connect is implicit in capture.
            wheel: true,
            focuser: true,
        };
        *self.connected.lock().unwrap() = bits;
        bits
    }

    pub fn connected(&self) -> ConnectedBits {
        *self.connected.lock().unwrap()
    }
}

// ---------------------------------------------------------------------
// Simulator backend: replays FITS frames from a directory instead of a
// real exposure. Grounded in the teacher's `ImageCamera` (file-backed
// camera used for demo/testing in `cedar_server.rs`).
// ---------------------------------------------------------------------

pub struct SimulatorMount {
    state: Mutex<SimulatorMountState>,
}

struct SimulatorMountState {
    ra: f64,
    dec: f64,
    lat: f64,
    long: f64,
}

impl SimulatorMount {
    pub fn new(initial_ra: f64, initial_dec: f64, lat: f64, long: f64) -> Self {
        SimulatorMount {
            state: Mutex::new(SimulatorMountState { ra: initial_ra, dec: initial_dec, lat, long }),
        }
    }
}

#[async_trait]
impl Mount for SimulatorMount {
    async fn connect(&self) -> bool {
        true
    }
    async fn disconnect(&self) -> bool {
        true
    }
    async fn slew_to(&self, ra: f64, dec: f64) -> bool {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut s = self.state.lock().unwrap();
        s.ra = ra;
        s.dec = dec;
        true
    }
    async fn sync_to(&self, ra: f64, dec: f64) -> bool {
        let mut s = self.state.lock().unwrap();
        s.ra = ra;
        s.dec = dec;
        true
    }
    async fn set_tracking(&self, _rate: f64) -> bool {
        true
    }
    async fn unpark(&self) -> bool {
        true
    }
    async fn get_location(&self) -> Option<(f64, f64)> {
        let s = self.state.lock().unwrap();
        Some((s.lat, s.long))
    }
    async fn get_utc(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        Some(chrono::Utc::now())
    }
    async fn set_utc(&self, _time: chrono::DateTime<chrono::Utc>) -> bool {
        true
    }
    async fn has_gps(&self) -> bool {
        false
    }
}

pub struct SimulatorWheel {
    names: Vec<String>,
    current: Mutex<usize>,
}

impl SimulatorWheel {
    pub fn new(names: Vec<String>) -> Self {
        SimulatorWheel { names, current: Mutex::new(0) }
    }
}

#[async_trait]
impl FilterWheel for SimulatorWheel {
    async fn change_filter(&self, label: &str) -> bool {
        match self.names.iter().position(|n| n == label) {
            Some(idx) => {
                *self.current.lock().unwrap() = idx;
                true
            }
            None => {
                warn!("unknown filter label {label}");
                false
            }
        }
    }
    fn filter_names(&self) -> Vec<String> {
        self.names.clone()
    }
}

pub struct SimulatorFocuser {
    max_step: i32,
    position: Mutex<i32>,
}

impl SimulatorFocuser {
    pub fn new(max_step: i32, start: i32) -> Self {
        SimulatorFocuser { max_step, position: Mutex::new(start) }
    }
}

#[async_trait]
impl Focuser for SimulatorFocuser {
    async fn move_to(&self, position: i32) -> bool {
        if position < 0 || position > self.max_step {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        *self.position.lock().unwrap() = position;
        true
    }
    async fn halt(&self) -> bool {
        true
    }
    async fn position(&self) -> Option<i32> {
        Some(*self.position.lock().unwrap())
    }
    fn max_step(&self) -> i32 {
        self.max_step
    }
}

/// Plays back frames from `frame_dir` in shuffled order, looping, so
/// repeated captures during a test run don't just replay the same file.
pub struct SimulatorCamera {
    frame_paths: Vec<PathBuf>,
    cursor: Mutex<usize>,
    gain: Mutex<i32>,
    temperature: Mutex<f64>,
}

impl SimulatorCamera {
    pub fn new(frame_dir: &std::path::Path) -> Result<Self, CanonicalError> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(frame_dir)
            .map_err(|e| internal_error(&format!("reading simulator frame dir: {e}")))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "fits" || e == "fit").unwrap_or(false))
            .collect();
        if paths.is_empty() {
            return Err(failed_precondition_error("simulator frame directory contains no FITS files"));
        }
        paths.shuffle(&mut rand::thread_rng());
        Ok(SimulatorCamera {
            frame_paths: paths,
            cursor: Mutex::new(0),
            gain: Mutex::new(100),
            temperature: Mutex::new(-10.0),
        })
    }
}

#[async_trait]
impl Camera for SimulatorCamera {
    async fn capture_frame(&self, exposure_sec: f64, is_light: bool) -> Result<Frame, CanonicalError> {
        tokio::time::sleep(Duration::from_secs_f64(exposure_sec.min(2.0))).await;
        let path = {
            let mut cursor = self.cursor.lock().unwrap();
            let path = self.frame_paths[*cursor % self.frame_paths.len()].clone();
            *cursor += 1;
            path
        };
        info!(?path, is_light, exposure_sec, "simulator capture");
        nightloop_elements::fits::load(&path, None, None, false)
    }
    async fn set_gain(&self, gain: i32) -> bool {
        *self.gain.lock().unwrap() = gain;
        true
    }
    async fn set_bin_x(&self, _bin: u32) -> bool {
        true
    }
    async fn set_bin_y(&self, _bin: u32) -> bool {
        true
    }
    async fn set_ccd_temperature(&self, target_c: f64) -> bool {
        *self.temperature.lock().unwrap() = target_c;
        true
    }
    async fn set_cooler(&self, _on: bool) -> bool {
        true
    }
    async fn get_ccd_temperature(&self) -> Option<f64> {
        Some(*self.temperature.lock().unwrap())
    }
    fn capabilities(&self) -> CameraCapabilities {
        CameraCapabilities { bayer: Some(BayerPattern::Rggb), sensor_tag: "simulator" }
    }
}

// ---------------------------------------------------------------------
// Alpaca/ASCOM HTTP client backend. The teacher uses `ascom-alpaca` as a
// *server* (reporting mount position outward); our C1 instead needs a
// *client* driving a real device, so this is a small hand-rolled client
// over the Alpaca REST contract (one GET/PUT per property/method, device
// number embedded in the path), built on `reqwest`, grounded the way
// `ascom-alpaca-rs`'s own manifest depends on `reqwest`/`serde_json` for
// this exact purpose.
// ---------------------------------------------------------------------

pub struct AlpacaClient {
    http: reqwest::Client,
    base_url: String,
    device_number: u32,
}

impl AlpacaClient {
    pub fn new(base_url: impl Into<String>, device_number: u32) -> Self {
        AlpacaClient {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            device_number,
        }
    }

    fn url(&self, device_type: &str, action: &str) -> String {
        format!(
            "{}/api/v1/{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            device_type,
            self.device_number,
            action
        )
    }

    async fn put(&self, device_type: &str, action: &str, params: &[(&str, String)]) -> bool {
        match self.http.put(self.url(device_type, action)).form(params).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!("alpaca PUT {action} failed: {e}");
                false
            }
        }
    }

    async fn get_value<T: serde::de::DeserializeOwned>(&self, device_type: &str, action: &str) -> Option<T> {
        #[derive(serde::Deserialize)]
        struct AlpacaValue<T> {
            #[serde(rename = "Value")]
            value: T,
            #[serde(rename = "ErrorNumber")]
            error_number: i32,
        }
        match self.http.get(self.url(device_type, action)).send().await {
            Ok(resp) => match resp.json::<AlpacaValue<T>>().await {
                Ok(v) if v.error_number == 0 => Some(v.value),
                _ => None,
            },
            Err(e) => {
                warn!("alpaca GET {action} failed: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl Mount for AlpacaClient {
    async fn connect(&self) -> bool {
        self.put("telescope", "connected", &[("Connected", "true".into())]).await
    }
    async fn disconnect(&self) -> bool {
        self.put("telescope", "connected", &[("Connected", "false".into())]).await
    }
    async fn slew_to(&self, ra: f64, dec: f64) -> bool {
        if !self
            .put("telescope", "slewtocoordinates", &[("RightAscension", ra.to_string()), ("Declination", dec.to_string())])
            .await
        {
            return false;
        }
        loop {
            match self.get_value::<bool>("telescope", "slewing").await {
                Some(true) => tokio::time::sleep(Duration::from_millis(200)).await,
                Some(false) => return true,
                None => return false,
            }
        }
    }
    async fn sync_to(&self, ra: f64, dec: f64) -> bool {
        self.put("telescope", "synctocoordinates", &[("RightAscension", ra.to_string()), ("Declination", dec.to_string())])
            .await
    }
    async fn set_tracking(&self, rate: f64) -> bool {
        self.put("telescope", "tracking", &[("Tracking", (rate != 0.0).to_string())]).await
    }
    async fn unpark(&self) -> bool {
        self.put("telescope", "unpark", &[]).await
    }
    async fn get_location(&self) -> Option<(f64, f64)> {
        let lat = self.get_value::<f64>("telescope", "sitelatitude").await?;
        let long = self.get_value::<f64>("telescope", "sitelongitude").await?;
        Some((lat, long))
    }
    async fn get_utc(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let raw: String = self.get_value("telescope", "utcdate").await?;
        chrono::DateTime::parse_from_rfc3339(&raw).ok().map(|d| d.with_timezone(&chrono::Utc))
    }
    async fn set_utc(&self, time: chrono::DateTime<chrono::Utc>) -> bool {
        self.put("telescope", "utcdate", &[("UTCDate", time.to_rfc3339())]).await
    }
    async fn has_gps(&self) -> bool {
        self.get_value::<bool>("telescope", "cansetguiderates").await.unwrap_or(false)
    }
}

#[async_trait]
impl Camera for AlpacaClient {
    async fn capture_frame(&self, exposure_sec: f64, is_light: bool) -> Result<Frame, CanonicalError> {
        let ok = self
            .put(
                "camera",
                "startexposure",
                &[("Duration", exposure_sec.to_string()), ("Light", is_light.to_string())],
            )
            .await;
        if !ok {
            return Err(internal_error("camera startexposure failed"));
        }
        loop {
            match self.get_value::<bool>("camera", "imageready").await {
                Some(true) => break,
                Some(false) => tokio::time::sleep(Duration::from_millis(100)).await,
                None => return Err(internal_error("camera disconnected mid-exposure")),
            }
        }
        // The Alpaca ImageArray endpoint returns a nested JSON array; real
        // drivers typically support the faster ImageBytes variant, but the
        // plain JSON contract is all §4.1 requires us to assume.
        let rows: Vec<Vec<f32>> = self
            .get_value("camera", "imagearray")
            .await
            .ok_or_else(|| internal_error("camera imagearray unavailable"))?;
        let height = rows.len();
        let width = rows.first().map(|r| r.len()).unwrap_or(0);
        let data: Vec<f32> = rows.into_iter().flatten().collect();
        Ok(Frame::new_mono(width, height, data))
    }
    async fn set_gain(&self, gain: i32) -> bool {
        self.put("camera", "gain", &[("Gain", gain.to_string())]).await
    }
    async fn set_bin_x(&self, bin: u32) -> bool {
        self.put("camera", "binx", &[("BinX", bin.to_string())]).await
    }
    async fn set_bin_y(&self, bin: u32) -> bool {
        self.put("camera", "biny", &[("BinY", bin.to_string())]).await
    }
    async fn set_ccd_temperature(&self, target_c: f64) -> bool {
        self.put("camera", "setccdtemperature", &[("SetCCDTemperature", target_c.to_string())]).await
    }
    async fn set_cooler(&self, on: bool) -> bool {
        self.put("camera", "cooleron", &[("CoolerOn", on.to_string())]).await
    }
    async fn get_ccd_temperature(&self) -> Option<f64> {
        self.get_value("camera", "ccdtemperature").await
    }
    fn capabilities(&self) -> CameraCapabilities {
        CameraCapabilities { bayer: None, sensor_tag: "alpaca" }
    }
}

#[async_trait]
impl FilterWheel for AlpacaClient {
    async fn change_filter(&self, label: &str) -> bool {
        let names: Option<Vec<String>> = self.get_value("filterwheel", "names").await;
        let Some(names) = names else { return false };
        match names.iter().position(|n| n == label) {
            Some(idx) => self.put("filterwheel", "position", &[("Position", idx.to_string())]).await,
            None => false,
        }
    }
    fn filter_names(&self) -> Vec<String> {
        Vec::new()
    }
}

#[async_trait]
impl Focuser for AlpacaClient {
    async fn move_to(&self, position: i32) -> bool {
        if !self.put("focuser", "move", &[("Position", position.to_string())]).await {
            return false;
        }
        loop {
            match self.get_value::<bool>("focuser", "ismoving").await {
                Some(true) => tokio::time::sleep(Duration::from_millis(100)).await,
                Some(false) => return true,
                None => return false,
            }
        }
    }
    async fn halt(&self) -> bool {
        self.put("focuser", "halt", &[]).await
    }
    async fn position(&self) -> Option<i32> {
        self.get_value("focuser", "position").await
    }
    fn max_step(&self) -> i32 {
        // Alpaca's MaxStep is synchronous-only in the spec; callers needing
        // this eagerly should cache it after `connect()`. Returning a
        // conservative default keeps the trait infallible here.
        100_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulator_wheel_rejects_unknown_label() {
        let wheel = SimulatorWheel::new(vec!["L".into(), "R".into(), "G".into(), "B".into()]);
        assert!(wheel.change_filter("R").await);
        assert!(!wheel.change_filter("X").await);
    }

    #[tokio::test]
    async fn test_simulator_focuser_rejects_out_of_range() {
        let focuser = SimulatorFocuser::new(1000, 500);
        assert!(focuser.move_to(900).await);
        assert_eq!(focuser.position().await, Some(900));
        assert!(!focuser.move_to(-1).await);
        assert!(!focuser.move_to(1001).await);
    }
}
