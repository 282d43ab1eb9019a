//! Scenario 1 (spec.md §8): an empty plan completes immediately and
//! leaves history/plan-active state untouched.

use std::sync::{Arc, Mutex};

use nightloop_elements::fits::{self, Frame};
use nightloop_server::dark_manager::DarkLibraryManager;
use nightloop_server::device::{Rig, SimulatorCamera, SimulatorFocuser, SimulatorMount, SimulatorWheel};
use nightloop_server::history::HistoryRecorder;
use nightloop_server::scheduler::{Scheduler, SchedulerConfig};
use nightloop_server::solver::SolverConfig;
use nightloop_server::state::TelescopeState;
use nightloop_server::telemetry::TelemetryBus;

fn scratch_dir(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("nightloop-test-{name}-{}", std::process::id()))
}

fn seed_frame_dir(dir: &std::path::Path) {
    std::fs::create_dir_all(dir).unwrap();
    let frame = Frame::new_mono(8, 8, vec![1000.0; 64]);
    fits::save_fits(&frame, &dir.join("seed.fits"), &Default::default()).unwrap();
}

#[tokio::test]
async fn empty_plan_leaves_history_and_plan_active_untouched() {
    let frame_dir = scratch_dir("empty-plan-frames");
    seed_frame_dir(&frame_dir);

    let rig = Arc::new(Rig {
        mount: Box::new(SimulatorMount::new(0.0, 0.0, 0.0, 0.0)),
        camera: Box::new(SimulatorCamera::new(&frame_dir).unwrap()),
        wheel: Box::new(SimulatorWheel::new(vec!["L".into()])),
        focuser: Box::new(SimulatorFocuser::new(10_000, 5_000)),
        connected: Default::default(),
    });
    let bus = Arc::new(TelemetryBus::new());
    let history = Arc::new(Mutex::new(HistoryRecorder::open(scratch_dir("empty-plan-history").join("history.json")).unwrap()));
    let dark_manager = Arc::new(DarkLibraryManager::open(scratch_dir("empty-plan-darks")).unwrap());
    let state = Arc::new(TelescopeState::default());
    let config = SchedulerConfig {
        slew_retry_budget: 3,
        acceptable_angular_error_deg: 0.2,
        capture_root: scratch_dir("empty-plan-captures"),
        focus_search_range: 100,
        focus_step: 50,
        focus_images_per_position: 1,
        min_focus_stars: 5,
        target_temperature_c: None,
        solver: SolverConfig {
            executable: "solve-field-does-not-exist".into(),
            catalog_path: "".into(),
            max_stars: 200,
            downsample: 2,
            debug_keep_temp_files: false,
        },
        stacker_target_width: 0,
    };
    let scheduler = Scheduler::new(rig, bus, history.clone(), dark_manager, state.clone(), config, "cam0".into());

    scheduler.run(vec![]).await.unwrap();

    assert!(!state.plan_active());
    assert!(history.lock().unwrap().entries().is_empty());
}
