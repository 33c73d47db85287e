//! Capture workflow: policy engine and device sessions feeding one telemetry runtime.

use std::sync::{Arc, Mutex};

use sensor_gate::metadata::{
    encode_klv, find_klv_item, parse_klv, sync_metadata, MetadataBuffer, UAS_DATALINK_LS,
};
use sensor_gate::session::StubFrameSource;
use sensor_gate::telemetry::{CallbackSink, SinkSpec};
use sensor_gate::{
    ClearanceLevel, DeviceSession, ErrorKind, Event, EventEmitter, EventKind, FixedClearance,
    GateError, PolicyEngine, ProfileRegistry, Severity, Telemetry, TelemetryConfig,
    TelemetryProfile, TempestState, ThreatLevel,
};

fn runtime() -> (Arc<Telemetry>, Arc<Mutex<Vec<Event>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = seen.clone();
    let telemetry = Arc::new(Telemetry::new());
    telemetry
        .init(TelemetryConfig {
            background: false,
            ..TelemetryConfig::with_profile(TelemetryProfile::Exercise).sink(SinkSpec::Custom(
                Box::new(CallbackSink::new(move |batch| {
                    sink_seen.lock().unwrap().extend_from_slice(batch.events);
                    Ok(())
                })),
            ))
        })
        .unwrap();
    (telemetry, seen)
}

#[test]
fn threat_escalation_locks_down_open_sessions() {
    let (telemetry, seen) = runtime();
    let emitter: Arc<dyn EventEmitter> = telemetry.clone();
    let engine = Arc::new(PolicyEngine::new(
        emitter.clone(),
        Box::new(FixedClearance(ClearanceLevel::Secret)),
    ));
    let registry = ProfileRegistry::builtin();

    let mut cam = DeviceSession::open(
        "/dev/video0",
        registry.find_by_role("generic_webcam").unwrap(),
        Box::new(StubFrameSource::default()),
        engine.clone(),
        emitter.clone(),
    )
    .unwrap();
    cam.start_stream().unwrap();
    for _ in 0..5 {
        cam.capture_frame().unwrap().unwrap();
    }

    engine.set_threat_level(ThreatLevel::Emergency);
    assert_eq!(cam.tempest_state(), TempestState::Lockdown);
    let err = cam.capture_frame().err().unwrap();
    assert_eq!(
        err.downcast_ref::<GateError>().unwrap().kind(),
        ErrorKind::AccessDenied
    );

    engine.set_threat_level(ThreatLevel::Normal);
    cam.capture_frame().unwrap().unwrap();
    cam.close().unwrap();

    telemetry.flush().unwrap();
    let events = seen.lock().unwrap().clone();
    let count = |kind: EventKind| events.iter().filter(|e| e.kind == kind).count();
    assert_eq!(count(EventKind::DeviceOpen), 1);
    assert_eq!(count(EventKind::FrameAcquired), 6);
    assert_eq!(count(EventKind::TempestTransition), 2);
    assert_eq!(count(EventKind::PolicyViolation), 1);
    assert_eq!(count(EventKind::DeviceClose), 1);

    let lockdown = events
        .iter()
        .find(|e| e.kind == EventKind::TempestTransition)
        .unwrap();
    assert_eq!(lockdown.severity, Severity::Critical);

    // Timestamps are monotonic in drain order.
    assert!(events.windows(2).all(|w| w[0].timestamp_ns <= w[1].timestamp_ns));
    telemetry.shutdown().unwrap();
}

#[test]
fn denied_clearance_is_audited_without_a_session() {
    let (telemetry, seen) = runtime();
    let emitter: Arc<dyn EventEmitter> = telemetry.clone();
    let engine = Arc::new(PolicyEngine::new(
        emitter.clone(),
        Box::new(FixedClearance(ClearanceLevel::Unclassified)),
    ));
    let iris = ProfileRegistry::builtin().find_by_role("iris_scanner").unwrap();
    let res = DeviceSession::open(
        "/dev/video2",
        iris,
        Box::new(StubFrameSource::default()),
        engine,
        emitter,
    );
    assert!(res.is_err());
    telemetry.shutdown().unwrap();

    let events = seen.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::PolicyViolation);
    assert_eq!(events[0].severity, Severity::High);
}

#[test]
fn metadata_stream_is_aligned_and_parsed() {
    let payload: Vec<u8> = (0u8..8).collect();
    let klv = encode_klv([(&UAS_DATALINK_LS, &payload[..])]);
    assert_eq!(klv.len(), 25);

    let buffers = vec![
        MetadataBuffer {
            timestamp_ns: 1_000_000_000,
            sequence: 0,
            data: Vec::new(),
        },
        MetadataBuffer {
            timestamp_ns: 1_100_000_000,
            sequence: 1,
            data: klv,
        },
        MetadataBuffer {
            timestamp_ns: 1_200_000_000,
            sequence: 2,
            data: Vec::new(),
        },
    ];
    let idx = sync_metadata(1_150_000_000, &buffers).unwrap();
    assert_eq!(idx, 1);

    let items = parse_klv(&buffers[idx].data).unwrap();
    assert_eq!(items.len(), 1);
    let item = find_klv_item(&items, &UAS_DATALINK_LS).unwrap();
    assert_eq!(item.value, &payload[..]);
    assert_eq!(buffers[idx].klv_items().unwrap().len(), 1);
}
