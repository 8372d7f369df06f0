//! Integration tests for the calibration workflow
//!
//! These tests validate calibration sessions through the public API:
//! - Phase progression and the thresholds derived from trial peaks
//! - Cancellation and restart
//! - Manual stage advance
//! - Failure reasons carrying stable error codes

use std::sync::Arc;
use std::time::Duration;

use eyedrops::calibration::CalibrationController;
use eyedrops::config::{CalibrationConfig, LinkConfig, QueueConfig};
use eyedrops::error::CalibrationErrorCodes;
use eyedrops::link::{Device, DeviceId, DeviceLink, DisconnectReason, LinkState, SimulatedTransport};
use eyedrops::{CalibrationError, CalibrationPhase, ErrorCode, EventBus, ProfileStore};

fn sensor() -> Device {
    Device {
        id: DeviceId::new("C0:FF:EE:00:00:02"),
        name: "eyeDrops".to_string(),
        rssi: -55,
    }
}

struct Fixture {
    transport: Arc<SimulatedTransport>,
    link: DeviceLink,
    store: Arc<ProfileStore>,
    controller: CalibrationController,
}

fn fixture(trials: u8) -> Fixture {
    let transport = Arc::new(SimulatedTransport::with_device(sensor()));
    let events = EventBus::new(64);
    let link = DeviceLink::new(
        transport.clone(),
        LinkConfig {
            connect_timeout_ms: 200,
            jitter: false,
            ..LinkConfig::default()
        },
        QueueConfig::default(),
        events.clone(),
    );
    let store = Arc::new(ProfileStore::with_events(events.clone()));
    let controller = CalibrationController::new(
        link.clone(),
        store.clone(),
        CalibrationConfig {
            baseline_duration_ms: 20,
            trial_window_ms: 10,
            trials,
            safety_margin: 0.5,
            stage_timeout_ms: 1_000,
            ..CalibrationConfig::default()
        },
        events,
    );
    Fixture {
        transport,
        link,
        store,
        controller,
    }
}

async fn wait_for<F>(controller: &CalibrationController, predicate: F) -> CalibrationPhase
where
    F: Fn(&CalibrationPhase) -> bool,
{
    let mut rx = controller.subscribe_phase();
    let phase = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|p| predicate(p)))
        .await
        .unwrap_or_else(|_| panic!("timed out in phase {:?}", controller.phase()))
        .unwrap()
        .clone();
    phase
}

/// Test a three-trial session with a noisy baseline
///
/// Baseline averages 0; the weakest positive peak is 60 and the weakest
/// negative peak is -40, so a 0.5 margin yields +30 / -20.
#[tokio::test]
async fn test_three_trial_session_uses_weakest_peaks() {
    let f = fixture(3);
    f.controller.start(&sensor().id).unwrap();
    wait_for(&f.controller, |p| *p == CalibrationPhase::CollectingBaseline).await;

    let mut clock = f.transport.push_samples(0, 1_000, &[-2, 2, -1, 1, 0, 0, 3, -3, 1, -1].repeat(2));
    for peak in [80, 60, 70, -50, -40, -90] {
        let mut trial = [0i16; 10];
        trial[4] = peak;
        clock = f.transport.push_samples(clock, 1_000, &trial);
    }
    f.transport.push_sample(clock, 0);

    let phase = wait_for(&f.controller, |p| matches!(p, CalibrationPhase::Ready(_))).await;
    let CalibrationPhase::Ready(profile) = phase else {
        unreachable!()
    };
    assert_eq!(profile.baseline, 0);
    assert_eq!(profile.positive_threshold, 30);
    assert_eq!(profile.negative_threshold, -20);
    assert!(f.store.is_empty().unwrap(), "nothing stored before commit");

    let committed = f.controller.commit("carol").unwrap();
    assert_eq!(f.store.get("carol").unwrap(), Some(committed));
}

/// Test cancellation mid-session followed by a clean restart
#[tokio::test]
async fn test_cancel_then_restart() {
    let f = fixture(1);
    f.controller.start(&sensor().id).unwrap();
    wait_for(&f.controller, |p| *p == CalibrationPhase::CollectingBaseline).await;

    f.controller.cancel().await;
    assert_eq!(f.controller.phase(), CalibrationPhase::Cancelled);
    assert_eq!(
        f.link.state(),
        LinkState::Disconnected(DisconnectReason::UserRequested)
    );

    f.controller.reset();
    assert_eq!(f.controller.phase(), CalibrationPhase::Idle);

    f.controller.start(&sensor().id).unwrap();
    wait_for(&f.controller, |p| *p == CalibrationPhase::CollectingBaseline).await;
    assert_eq!(f.link.state(), LinkState::Streaming);
    f.controller.cancel().await;
}

/// Test that advancing every stage by hand without peaks fails validation
#[tokio::test]
async fn test_manual_advance_without_signal_is_invalid() {
    let f = fixture(1);
    f.controller.start(&sensor().id).unwrap();
    wait_for(&f.controller, |p| *p == CalibrationPhase::CollectingBaseline).await;
    f.transport.push_samples(0, 1_000, &[5; 3]);

    let stages = [
        CalibrationPhase::CollectingPositive { trial: 1 },
        CalibrationPhase::CollectingNegative { trial: 1 },
    ];
    for expected in stages {
        assert!(f.controller.advance());
        wait_for(&f.controller, |p| *p == expected).await;
    }
    assert!(f.controller.advance());

    let phase = wait_for(&f.controller, CalibrationPhase::is_terminal).await;
    match phase {
        CalibrationPhase::Failed(err) => {
            assert!(matches!(err, CalibrationError::InvalidCalibration { .. }));
            assert_eq!(err.code(), CalibrationErrorCodes::INVALID_CALIBRATION);
        }
        other => panic!("Expected Failed, got {:?}", other),
    }
}

/// Test that an unreachable sensor fails the session with a link code
#[tokio::test]
async fn test_unreachable_sensor() {
    let f = fixture(1);
    f.transport.vanish(&sensor().id);
    f.controller.start(&sensor().id).unwrap();

    let phase = wait_for(&f.controller, CalibrationPhase::is_terminal).await;
    let CalibrationPhase::Failed(err) = phase else {
        panic!("Expected Failed, got {:?}", phase)
    };
    assert_eq!(err.code(), CalibrationErrorCodes::DEVICE_UNAVAILABLE);
}
