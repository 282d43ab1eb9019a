//! Scenario 6 (spec.md §8) plus the dark-capture run itself: runs a dark
//! plan against the simulator camera, then checks the recorded descriptor
//! is selectable by exact match and by library order.

use std::sync::Arc;

use nightloop_elements::fits::{self, Frame};
use nightloop_server::dark_manager::{DarkLibraryManager, DarkPlanItem};
use nightloop_server::device::{Camera, SimulatorCamera};
use nightloop_server::telemetry::TelemetryBus;

fn scratch_dir(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("nightloop-test-{name}-{}", std::process::id()))
}

fn seed_frame_dir(dir: &std::path::Path) {
    std::fs::create_dir_all(dir).unwrap();
    for i in 0..3 {
        let frame = Frame::new_mono(8, 8, vec![500.0; 64]);
        fits::save_fits(&frame, &dir.join(format!("f{i}.fits")), &Default::default()).unwrap();
    }
}

#[tokio::test]
async fn dark_run_records_a_selectable_descriptor() {
    let frame_dir = scratch_dir("dark-frames");
    seed_frame_dir(&frame_dir);
    let camera: Box<dyn Camera> = Box::new(SimulatorCamera::new(&frame_dir).unwrap());

    let manager = DarkLibraryManager::open(scratch_dir("dark-root")).unwrap();
    let bus = TelemetryBus::new();
    let plan = vec![DarkPlanItem { gain: 100, temperature: Some(-10.0), exposition: 0.01, count: 3 }];

    manager.run("cam0", camera.as_ref(), &plan, &bus).await.unwrap();

    let recorded = manager.list("cam0");
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].count, 3);
    assert_eq!(recorded[0].exposition, 0.01);

    let exact = manager.select("cam0", 0.01, 100, Some(-10.0));
    assert!(exact.is_some());
    let by_order = manager.select("cam0", 0.01, 100, None);
    assert_eq!(by_order.unwrap().filename, exact.unwrap().filename);
    assert!(manager.select("cam0", 0.01, 100, Some(-99.0)).is_none());
}
