//! REST + WebSocket transport (spec.md §6). Out of the core's own scope
//! per §1 ("REST/WebSocket transport layer" is an external collaborator),
//! so this module is the thin adapter: it has no business logic of its
//! own, only request parsing/dispatch onto the C1-C10 modules and
//! response encoding. Router layout follows the teacher's device-grouped
//! gRPC service surface (`cedar_server.rs`), re-expressed as REST paths
//! since this core speaks plain JSON over HTTP rather than protobuf, with
//! axum idioms grounded in `ascom-alpaca-rs`'s router (the only other
//! axum user in the corpus).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use canonical_error::{aborted_error, failed_precondition_error, internal_error, not_found_error};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::warn;

use nightloop_elements::fits::Frame;
use nightloop_elements::focus;

use crate::config::{CameraConfig, ConfigCategory, FilterWheelConfig, ObservatoryConfig, TelescopeConfig};
use crate::dark_manager::{DarkLibraryManager, DarkPlanItem};
use crate::device::Rig;
use crate::errors::{ApiError, ApiResult};
use crate::history::{HistoryRecorder, Observation};
use crate::image_settings::{self, ImageSettings};
use crate::scheduler::Scheduler;
use crate::state::TelescopeState;
use crate::telemetry::TelemetryBus;

#[derive(Clone)]
pub struct AppState {
    pub rig: Arc<Rig>,
    pub telescope: Arc<TelescopeState>,
    pub bus: Arc<TelemetryBus>,
    pub history: Arc<Mutex<HistoryRecorder>>,
    pub dark_manager: Arc<DarkLibraryManager>,
    pub scheduler: Arc<Scheduler>,
    pub camera_name: String,
}

pub struct ConfigStores {
    pub cameras: Arc<RwLock<ConfigCategory<CameraConfig>>>,
    pub telescopes: Arc<RwLock<ConfigCategory<TelescopeConfig>>>,
    pub observatories: Arc<RwLock<ConfigCategory<ObservatoryConfig>>>,
    pub filterwheels: Arc<RwLock<ConfigCategory<FilterWheelConfig>>>,
}

pub fn build_router(state: AppState, config_stores: ConfigStores) -> Router {
    let observation = Router::new()
        .route("/start", post(observation_start))
        .route("/stop", post(observation_stop))
        .route("/is_running", get(observation_is_running))
        .route("/last_image", get(last_image))
        .route("/last_stacked_image", get(last_stacked_image))
        .route("/history", get(observation_history))
        .route("/history/:index", get(observation_history_image))
        .route("/image_settings", get(get_image_settings).put(set_image_settings))
        .route("/capture", post(one_shot_capture))
        .route("/fwhm", get(fwhm_of_buffered_capture))
        .with_state(state.clone());

    let focuser = Router::new()
        .route("/", get(focuser_position).post(focuser_move_body))
        .route("/:pos", post(focuser_move_path))
        .route("/max", get(focuser_max))
        .route("/stop", post(focuser_halt))
        .route("/autofocus", post(focuser_autofocus))
        .with_state(state.clone());

    let status = Router::new()
        .route("/is_connected", get(status_is_connected))
        .route("/connect_hardware", post(status_connect_hardware))
        .route("/set_telescope_date", post(status_set_telescope_date))
        .with_state(state.clone());

    let dark = Router::new()
        .route("/:camera", get(dark_list).put(dark_start))
        .route("/:camera/:date", axum::routing::delete(dark_remove))
        .route("/stop", post(dark_stop))
        .route("/current_process", get(dark_current_process))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1/observation", observation)
        .nest("/api/v1/focuser", focuser)
        .nest("/api/v1/status", status)
        .nest("/api/v1/dark", dark)
        .nest("/api/v1/cameras", category_router(config_stores.cameras))
        .nest("/api/v1/telescopes", category_router(config_stores.telescopes))
        .nest("/api/v1/observatories", category_router(config_stores.observatories))
        .nest("/api/v1/filterwheels", category_router(config_stores.filterwheels))
        .route("/ws/observation", get(ws_observation))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

// ---------------------------------------------------------------------
// Observation (scheduler)
// ---------------------------------------------------------------------

async fn observation_start(State(state): State<AppState>, Json(plan): Json<Vec<Observation>>) -> ApiResult<Json<Value>> {
    if state.telescope.plan_active() {
        return Err(ApiError(aborted_error("a plan is already running")));
    }
    if state.dark_manager.progress().is_some() {
        return Err(ApiError(aborted_error("cannot start an observation plan while a dark capture is active")));
    }
    let scheduler = state.scheduler.clone();
    tokio::spawn(async move {
        if let Err(e) = scheduler.run(plan).await {
            warn!("plan execution ended with error: {}", e.message);
        }
    });
    Ok(Json(json!({ "started": true })))
}

async fn observation_stop(State(state): State<AppState>) -> impl IntoResponse {
    state.scheduler.request_stop();
    Json(json!({ "stopping": true }))
}

async fn observation_is_running(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.telescope.plan_active())
}

async fn last_image(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let frame = state.telescope.raw_frame().unwrap_or_else(fallback_frame);
    encode_preview(&frame, state.telescope.image_settings())
}

async fn last_stacked_image(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let frame = state.telescope.stacked_preview().unwrap_or_else(fallback_frame);
    encode_preview(&frame, state.telescope.image_settings())
}

/// Flat gray placeholder served by the image endpoints before any frame
/// has been captured (spec.md §4.10 "a fallback asset is returned when no
/// frame exists").
fn fallback_frame() -> Frame {
    Frame::new_mono(64, 64, vec![0.2; 64 * 64])
}

async fn observation_history(State(state): State<AppState>) -> impl IntoResponse {
    let history = state.history.lock().unwrap();
    Json(history.entries().to_vec())
}

async fn observation_history_image(State(state): State<AppState>, Path(index): Path<usize>) -> ApiResult<impl IntoResponse> {
    let jpg_path = {
        let history = state.history.lock().unwrap();
        history
            .entry(index)
            .ok_or_else(|| not_found_error("no history entry at that index"))?
            .jpg
            .clone()
            .ok_or_else(|| not_found_error("history entry has no stored preview"))?
    };
    let bytes = std::fs::read(&jpg_path).map_err(|e| internal_error(&format!("reading history preview: {e}")))?;
    Ok(([(axum::http::header::CONTENT_TYPE, "image/jpeg")], bytes))
}

fn encode_preview(frame: &Frame, settings: ImageSettings) -> ApiResult<impl IntoResponse> {
    let path = std::env::temp_dir().join(format!("nightloop-preview-{}-{}.jpg", std::process::id(), rand_suffix()));
    image_settings::render_preview(frame, settings, &path)?;
    let bytes = std::fs::read(&path).map_err(|e| internal_error(&format!("reading rendered preview: {e}")))?;
    let _ = std::fs::remove_file(&path);
    Ok(([(axum::http::header::CONTENT_TYPE, "image/jpeg")], bytes))
}

/// Distinguishes concurrent requests' scratch files; process id alone
/// collides when two requests race within the same process.
fn rand_suffix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.subsec_nanos() as u64).unwrap_or(0)
}

#[derive(Deserialize)]
struct ImageSettingsBody {
    stretch: f64,
    black_point: i32,
}

async fn get_image_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.telescope.image_settings())
}

async fn set_image_settings(State(state): State<AppState>, Json(body): Json<ImageSettingsBody>) -> impl IntoResponse {
    state
        .telescope
        .image_settings
        .set(ImageSettings { stretch: body.stretch, black_point: body.black_point });
    Json(json!({ "ok": true }))
}

#[derive(Deserialize)]
struct CaptureBody {
    exposition: f64,
}

/// One-shot light capture held as the "buffered capture" for the focusing
/// aid endpoints (spec.md §6), not passed through the scheduler or stacker.
async fn one_shot_capture(State(state): State<AppState>, Json(body): Json<CaptureBody>) -> ApiResult<impl IntoResponse> {
    let frame = state.rig.camera.capture_frame(body.exposition, true).await?;
    state.telescope.publish_raw_frame(frame);
    Ok(Json(json!({ "ok": true })))
}

async fn fwhm_of_buffered_capture(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let frame = state.telescope.raw_frame().ok_or_else(|| not_found_error("no buffered capture; call /capture first"))?;
    let mono = if frame.is_color() { frame.channel_plane(0) } else { (*frame).clone() };
    let sample = focus::measure_stars(&mono, 5.0, 200);
    Ok(Json(json!({
        "fwhm": sample.fwhm,
        "starCount": sample.star_count,
        "valid": sample.valid,
    })))
}

// ---------------------------------------------------------------------
// Focuser (direct device access, outside of a running plan)
// ---------------------------------------------------------------------

async fn focuser_position(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "position": state.rig.focuser.position().await }))
}

#[derive(Deserialize)]
struct FocuserMoveBody {
    position: i32,
}

async fn focuser_move_body(State(state): State<AppState>, Json(body): Json<FocuserMoveBody>) -> impl IntoResponse {
    let ok = state.rig.focuser.move_to(body.position).await;
    Json(json!({ "ok": ok }))
}

async fn focuser_move_path(State(state): State<AppState>, Path(pos): Path<i32>) -> impl IntoResponse {
    let ok = state.rig.focuser.move_to(pos).await;
    Json(json!({ "ok": ok }))
}

async fn focuser_max(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "max": state.rig.focuser.max_step() }))
}

async fn focuser_halt(State(state): State<AppState>) -> impl IntoResponse {
    let ok = state.rig.focuser.halt().await;
    Json(json!({ "ok": ok }))
}

async fn focuser_autofocus(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    if state.telescope.plan_active() {
        return Err(ApiError(failed_precondition_error("cannot autofocus standalone while a plan is active")));
    }
    let found = state.scheduler.run_autofocus_standalone().await;
    Ok(Json(json!({ "found": found })))
}

// ---------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------

async fn status_is_connected(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.rig.connected())
}

async fn status_connect_hardware(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.rig.connect_all().await)
}

async fn status_set_telescope_date(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    if state.rig.mount.has_gps().await {
        return Ok(Json(json!({ "synced": false, "reason": "mount has GPS" })));
    }
    let ok = state.rig.mount.set_utc(Utc::now()).await;
    Ok(Json(json!({ "synced": ok })))
}

// ---------------------------------------------------------------------
// Dark library
// ---------------------------------------------------------------------

async fn dark_list(State(state): State<AppState>, Path(camera): Path<String>) -> impl IntoResponse {
    Json(state.dark_manager.list(&camera))
}

async fn dark_start(State(state): State<AppState>, Path(camera): Path<String>, Json(plan): Json<Vec<DarkPlanItem>>) -> ApiResult<Json<Value>> {
    if state.telescope.plan_active() {
        return Err(ApiError(aborted_error(
            "cannot run dark capture while an observation plan is active",
        )));
    }
    if state.dark_manager.progress().is_some() {
        return Err(ApiError(aborted_error("a dark capture is already running")));
    }
    let dark_manager = state.dark_manager.clone();
    let rig = state.rig.clone();
    let bus = state.bus.clone();
    tokio::spawn(async move {
        if let Err(e) = dark_manager.run(&camera, rig.camera.as_ref(), &plan, &bus).await {
            warn!("dark capture ended with error: {}", e.message);
        }
    });
    Ok(Json(json!({ "started": true })))
}

async fn dark_remove(State(state): State<AppState>, Path((camera, date)): Path<(String, chrono::DateTime<Utc>)>) -> ApiResult<Json<Value>> {
    state.dark_manager.remove(&camera, date)?;
    Ok(Json(json!({ "ok": true })))
}

async fn dark_stop(State(state): State<AppState>) -> impl IntoResponse {
    state.dark_manager.request_stop();
    Json(json!({ "stopping": true }))
}

async fn dark_current_process(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.dark_manager.progress())
}

// ---------------------------------------------------------------------
// WebSocket telemetry fan-out (spec.md §6 `/ws/observation`)
// ---------------------------------------------------------------------

async fn ws_observation(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_loop(socket, state))
}

async fn ws_loop(mut socket: WebSocket, state: AppState) {
    let mut events = state.bus.subscribe();
    let mut keepalive = tokio::time::interval(crate::telemetry::KEEPALIVE_INTERVAL);
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(text) = serde_json::to_string(&event) else { continue };
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = keepalive.tick() => {
                let ping = json!({ "sender": "system", "message": "ping", "data": Value::Null });
                if socket.send(Message::Text(ping.to_string())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

// ---------------------------------------------------------------------
// Equipment config CRUD (spec.md §6, generic over the four config kinds)
// ---------------------------------------------------------------------

fn category_router<T>(store: Arc<RwLock<ConfigCategory<T>>>) -> Router
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/", get(list_category::<T>).post(upsert_category_entry::<T>))
        .route("/current", get(get_current::<T>).post(set_current::<T>))
        .route("/schema", get(get_schema::<T>))
        .with_state(store)
}

async fn list_category<T>(State(store): State<Arc<RwLock<ConfigCategory<T>>>>) -> Json<HashMap<String, T>>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    Json(store.read().unwrap().entries.clone())
}

#[derive(Deserialize)]
struct NamedEntry<T> {
    name: String,
    config: T,
}

async fn upsert_category_entry<T>(
    State(store): State<Arc<RwLock<ConfigCategory<T>>>>,
    Json(entry): Json<NamedEntry<T>>,
) -> ApiResult<Json<Value>>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    let mut store = store.write().unwrap();
    store.entries.insert(entry.name, entry.config);
    store.save()?;
    Ok(Json(json!({ "ok": true })))
}

async fn get_current<T>(State(store): State<Arc<RwLock<ConfigCategory<T>>>>) -> Json<Value>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    let store = store.read().unwrap();
    Json(json!({ "default": store.default, "value": store.current() }))
}

#[derive(Deserialize)]
struct SetCurrentBody {
    name: Option<String>,
}

async fn set_current<T>(State(store): State<Arc<RwLock<ConfigCategory<T>>>>, Json(body): Json<SetCurrentBody>) -> ApiResult<Json<Value>>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    let mut store = store.write().unwrap();
    store.default = body.name;
    store.save_default()?;
    Ok(Json(json!({ "ok": true })))
}

async fn get_schema<T>(State(store): State<Arc<RwLock<ConfigCategory<T>>>>) -> ApiResult<Json<Value>>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    Ok(Json(store.read().unwrap().load_schema()?))
}
