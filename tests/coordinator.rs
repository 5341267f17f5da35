mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{wait_until, RecordingSink};
use multicam::camera::LifecycleState;
use multicam::capture::synthetic::{Behavior, SyntheticCamera, SyntheticPlatform};
use multicam::capture::{Facing, FpsRange};
use multicam::error::PreviewError;
use multicam::{CameraCoordinator, CoordinatorOptions, Resolution, NONE_ID};

const VGA: Resolution = Resolution::new(640, 480);

fn coordinator(
    platform: SyntheticPlatform,
    options: CoordinatorOptions,
) -> (CameraCoordinator, Arc<SyntheticPlatform>, Arc<RecordingSink>) {
    let platform = Arc::new(platform);
    let sink = RecordingSink::new();
    let coordinator = CameraCoordinator::new(platform.clone(), sink.clone(), options);
    (coordinator, platform, sink)
}

fn requests(ids: &[&str]) -> HashMap<String, Resolution> {
    ids.iter().map(|id| (id.to_string(), VGA)).collect()
}

fn three_cameras(middle: Behavior) -> SyntheticPlatform {
    SyntheticPlatform::new()
        .with_camera(SyntheticCamera::new("A", Facing::Rear))
        .with_camera(SyntheticCamera::new("B", Facing::Rear).behavior(middle))
        .with_camera(SyntheticCamera::new("C", Facing::Front))
}

#[test]
fn all_cameras_start_and_register() {
    let (mut coordinator, _, sink) =
        coordinator(SyntheticPlatform::rear_and_front(), CoordinatorOptions::default());

    let results = coordinator.initialize(&["1", "0"], 3, false, false);
    assert_eq!(results, HashMap::from([("0".into(), true), ("1".into(), true)]));
    // rear camera registered first
    assert_eq!(
        sink.registered(),
        vec![("0".to_owned(), 3, true), ("1".to_owned(), 3, false)]
    );

    coordinator.start_preview(&requests(&["0", "1"])).unwrap();
    assert!(coordinator.is_previewing());
    assert!(wait_until(Duration::from_secs(3), || {
        sink.count_for("0") > 0 && sink.count_for("1") > 0
    }));

    coordinator.stop_preview(&["0", "1"]);
    assert!(!coordinator.is_previewing());
    for id in ["0", "1"] {
        let device = coordinator.device(id).unwrap();
        assert!(wait_until(Duration::from_secs(3), || device.state() == LifecycleState::Closed));
    }
}

#[test]
fn partial_failure_names_only_the_failed_camera() {
    let failing = Behavior {
        session_failure: Some("stream configuration rejected".into()),
        ..Behavior::default()
    };
    let (mut coordinator, platform, _) = coordinator(three_cameras(failing), CoordinatorOptions::default());
    let results = coordinator.initialize(&["A", "B", "C"], 4, false, false);
    assert!(results.values().all(|ok| *ok));

    let err = coordinator.start_preview(&requests(&["A", "B", "C"])).unwrap_err();
    assert_eq!(err.failed_ids(), vec!["B"]);
    assert!(err.to_string().contains("Cameras that failed to preview: B"));
    assert!(!coordinator.is_previewing());

    for id in ["A", "C"] {
        let device = coordinator.device(id).unwrap();
        assert!(device.is_configured(), "{id} should keep streaming");
        assert_eq!(device.state(), LifecycleState::Streaming);
    }
    let failed = coordinator.device("B").unwrap();
    assert!(!failed.is_configured());
    assert_eq!(failed.state(), LifecycleState::Closed);
    assert_eq!(platform.stats("B").unwrap().device_closes.load(Ordering::Relaxed), 1);
}

#[test]
fn stalled_camera_hits_the_deadline() {
    let stalled = Behavior {
        stall: true,
        ..Behavior::default()
    };
    let options = CoordinatorOptions {
        readiness_deadline: Duration::from_millis(400),
        ..CoordinatorOptions::default()
    };
    let (mut coordinator, _, _) = coordinator(three_cameras(stalled), options);
    coordinator.initialize(&["A", "B", "C"], 4, false, false);

    let started = Instant::now();
    let err = coordinator.start_preview(&requests(&["A", "B", "C"])).unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));

    match err {
        PreviewError::Failed {
            failed,
            unresponsive,
        } => {
            assert!(failed.is_empty());
            assert_eq!(unresponsive, vec!["B"]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(coordinator.device("A").unwrap().is_configured());
    assert_eq!(
        coordinator.device("B").unwrap().state(),
        LifecycleState::Opening
    );
}

#[test]
fn default_deadline_bounds_the_wait() {
    let stalled = Behavior {
        stall: true,
        ..Behavior::default()
    };
    let platform = SyntheticPlatform::new()
        .with_camera(SyntheticCamera::new("0", Facing::Rear).behavior(stalled));
    let (mut coordinator, _, _) = coordinator(platform, CoordinatorOptions::default());
    coordinator.initialize(&["0"], 4, false, false);

    let started = Instant::now();
    assert!(coordinator.start_preview(&requests(&["0"])).is_err());
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(5));
    assert!(elapsed < Duration::from_secs(7));
}

#[test]
fn cameras_open_concurrently() {
    let slow = || Behavior {
        open_delay: Duration::from_millis(800),
        ..Behavior::default()
    };
    let platform = SyntheticPlatform::new()
        .with_camera(SyntheticCamera::new("A", Facing::Rear).behavior(slow()))
        .with_camera(SyntheticCamera::new("B", Facing::Rear).behavior(slow()))
        .with_camera(SyntheticCamera::new("C", Facing::Front).behavior(slow()));
    let (mut coordinator, _, _) = coordinator(platform, CoordinatorOptions::default());
    coordinator.initialize(&["A", "B", "C"], 4, false, false);

    let started = Instant::now();
    coordinator.start_preview(&requests(&["A", "B", "C"])).unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(800));
    assert!(elapsed < Duration::from_millis(1600), "took {elapsed:?}");
    coordinator.shutdown();
}

#[test]
fn held_permit_does_not_outlast_the_deadline() {
    let stalled = Behavior {
        stall: true,
        ..Behavior::default()
    };
    let platform = SyntheticPlatform::new()
        .with_camera(SyntheticCamera::new("0", Facing::Rear).behavior(stalled));
    let options = CoordinatorOptions {
        readiness_deadline: Duration::from_millis(300),
        ..CoordinatorOptions::default()
    };
    let (mut coordinator, _, _) = coordinator(platform, options);
    coordinator.initialize(&["0"], 4, false, false);

    // leaves the camera opening with its permit held
    assert!(coordinator.start_preview(&requests(&["0"])).is_err());
    assert_eq!(coordinator.device("0").unwrap().state(), LifecycleState::Opening);

    let started = Instant::now();
    let err = coordinator.start_preview(&requests(&["0"])).unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
    assert_eq!(err.failed_ids(), vec!["0"]);
}

#[test]
fn reinitialize_replaces_the_device() {
    let (mut coordinator, platform, _) =
        coordinator(SyntheticPlatform::rear_and_front(), CoordinatorOptions::default());
    coordinator.initialize(&["0"], 4, false, false);
    coordinator.start_preview(&requests(&["0"])).unwrap();

    let results = coordinator.initialize(&["0", NONE_ID], 4, false, false);
    assert_eq!(results.get("0"), Some(&true));
    assert_eq!(results.get(NONE_ID), Some(&false));

    let stats = platform.stats("0").unwrap();
    assert_eq!(stats.session_closes.load(Ordering::Relaxed), 1);
    assert_eq!(coordinator.device("0").unwrap().state(), LifecycleState::Closed);
    assert_eq!(coordinator.camera_ids(), vec!["0"]);
}

#[test]
fn high_speed_only_where_supported() {
    let platform = SyntheticPlatform::new()
        .with_camera(
            SyntheticCamera::new("0", Facing::Rear)
                .high_speed(vec![FpsRange::fixed(120)], vec![Resolution::new(1280, 720)]),
        )
        .with_camera(SyntheticCamera::new("1", Facing::Rear));
    let (mut coordinator, _, _) = coordinator(platform, CoordinatorOptions::default());

    let listed = coordinator.enumerate(&[Facing::Rear], true).unwrap();
    let sizes: HashMap<_, _> = listed.into_iter().collect();
    assert_eq!(sizes["0"], vec![Resolution::new(1280, 720)]);
    assert!(sizes["1"].contains(&VGA));

    coordinator.initialize(&["0", "1"], 4, true, false);
    assert_eq!(coordinator.device("0").unwrap().strategy_name(), "high-speed");
    assert_eq!(coordinator.device("1").unwrap().strategy_name(), "standard");
}

#[test]
fn shutdown_stops_everything() {
    let (mut coordinator, platform, _) =
        coordinator(SyntheticPlatform::rear_and_front(), CoordinatorOptions::default());
    coordinator.initialize(&["0", "1"], 4, false, false);
    coordinator.start_preview(&requests(&["0", "1"])).unwrap();

    coordinator.shutdown();
    assert!(coordinator.camera_ids().is_empty());
    for id in ["0", "1"] {
        let stats = platform.stats(id).unwrap();
        assert_eq!(stats.session_closes.load(Ordering::Relaxed), 1);
        assert_eq!(stats.device_closes.load(Ordering::Relaxed), 1);
    }
}
