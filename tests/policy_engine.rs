use std::sync::{Arc, Mutex};

use sensor_gate::policy::{layer_policy, tempest_for_threat, ControlDescriptor};
use sensor_gate::{
    ClearanceLevel, ErrorKind, Event, EventEmitter, EventKind, FixedClearance, PayloadView,
    PolicyEngine, Severity, TempestState, ThreatLevel, NO_DEVICE,
};

#[derive(Default)]
struct Recorder(Mutex<Vec<Event>>);

impl EventEmitter for Recorder {
    fn emit_event(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }
}

impl Recorder {
    fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

fn engine(clearance: ClearanceLevel) -> (PolicyEngine, Arc<Recorder>) {
    let rec = Arc::new(Recorder::default());
    let engine = PolicyEngine::new(rec.clone(), Box::new(FixedClearance(clearance)));
    (engine, rec)
}

#[test]
fn every_threat_level_maps_to_the_fixed_tempest_state() {
    let expected = [
        (ThreatLevel::Normal, TempestState::Disabled),
        (ThreatLevel::Alpha, TempestState::Low),
        (ThreatLevel::Bravo, TempestState::Low),
        (ThreatLevel::Charlie, TempestState::High),
        (ThreatLevel::Delta, TempestState::High),
        (ThreatLevel::Emergency, TempestState::Lockdown),
    ];
    let (engine, _rec) = engine(ClearanceLevel::Secret);
    engine.register_device(1);
    for (level, state) in expected {
        assert_eq!(tempest_for_threat(level), state);
        engine.set_threat_level(level);
        assert_eq!(engine.get_threat_level(), level);
        assert_eq!(engine.get_tempest_state(1), state);
    }
}

#[test]
fn repeated_threat_level_emits_nothing() {
    let (engine, rec) = engine(ClearanceLevel::Secret);
    engine.register_device(4);
    engine.set_threat_level(ThreatLevel::Charlie);
    engine.set_threat_level(ThreatLevel::Charlie);
    let events = rec.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::TempestTransition);
    assert_eq!(
        events[0].payload.view(),
        PayloadView::Transition {
            old: TempestState::Disabled,
            new: TempestState::High
        }
    );

    // ALPHA -> BRAVO changes the level but not the state.
    engine.set_threat_level(ThreatLevel::Alpha);
    rec.take();
    engine.set_threat_level(ThreatLevel::Bravo);
    assert!(rec.take().is_empty());
}

#[test]
fn capture_is_denied_only_in_lockdown() {
    let (engine, rec) = engine(ClearanceLevel::Unclassified);
    engine.register_device(2);
    for level in ThreatLevel::ALL {
        engine.set_threat_level(level);
        rec.take();
        let res = engine.check_capture_allowed(2, "capture_frame");
        if level == ThreatLevel::Emergency {
            assert_eq!(res.unwrap_err().kind(), ErrorKind::AccessDenied);
            let events = rec.take();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].kind, EventKind::PolicyViolation);
            assert_eq!(events[0].severity, Severity::Critical);
            assert_eq!(
                events[0].payload.view(),
                PayloadView::Context("capture_frame".to_string())
            );
        } else {
            res.unwrap();
            assert!(rec.take().is_empty());
        }
    }
}

#[test]
fn manual_escalation_cannot_undercut_emergency() {
    let (engine, rec) = engine(ClearanceLevel::TopSecret);
    engine.register_device(3);
    engine.set_tempest_state(3, TempestState::High).unwrap();
    assert_eq!(engine.get_tempest_state(3), TempestState::High);

    engine.set_threat_level(ThreatLevel::Emergency);
    rec.take();
    for state in [TempestState::Disabled, TempestState::Low, TempestState::High] {
        let err = engine.set_tempest_state(3, state).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(engine.get_tempest_state(3), TempestState::Lockdown);
    }
    let events = rec.take();
    assert_eq!(events.len(), 3);
    assert!(events
        .iter()
        .all(|e| e.kind == EventKind::PolicyViolation && e.severity == Severity::High));

    assert_eq!(
        engine.set_tempest_state(99, TempestState::Lockdown).unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[test]
fn clearance_checks_follow_the_hierarchy() {
    let (engine, rec) = engine(ClearanceLevel::Confidential);
    engine.check_clearance("generic_webcam", "UNCLASSIFIED").unwrap();
    engine.check_clearance("ir_sensor", "CONFIDENTIAL").unwrap();
    assert!(rec.take().is_empty());

    let err = engine.check_clearance("iris_scanner", "SECRET_BIOMETRIC").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    let events = rec.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].device_id, NO_DEVICE);
    assert_eq!(events[0].severity, Severity::High);

    assert_eq!(
        engine.check_clearance("", "SECRET").unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    assert_eq!(
        engine.check_clearance("iris_scanner", "").unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    assert!(rec.take().is_empty());
}

#[test]
fn default_clearance_denies_secret_biometric() {
    let (engine, _rec) = engine(ClearanceLevel::default());
    assert_eq!(
        engine
            .check_clearance("iris_scanner", "SECRET_BIOMETRIC")
            .unwrap_err()
            .kind(),
        ErrorKind::PermissionDenied
    );
}

#[test]
fn layer_policies_tighten_with_layer_number() {
    let (engine, _rec) = engine(ClearanceLevel::Unclassified);
    let mut prev = TempestState::Disabled;
    for layer in 0..=8 {
        let p = engine.get_layer_policy(layer).unwrap();
        assert!(p.min_tempest >= prev);
        prev = p.min_tempest;
    }
    assert!(engine.get_layer_policy(7).unwrap().min_tempest >= TempestState::High);
    assert!(engine.get_layer_policy(8).unwrap().min_tempest >= TempestState::High);
    assert_eq!(layer_policy(9).unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(engine.get_layer_policy(9).unwrap_err().kind(), ErrorKind::NotFound);
}

#[test]
fn tempest_control_discovery_is_first_match_in_device_order() {
    let (engine, _rec) = engine(ClearanceLevel::Unclassified);
    let controls = vec![
        ControlDescriptor::new(10, "Exposure"),
        ControlDescriptor::new(11, "Status LED"),
        ControlDescriptor::new(12, "Privacy"),
    ];
    assert_eq!(engine.discover_tempest_control(controls.clone()).unwrap(), 11);
    assert_eq!(engine.discover_tempest_control(controls).unwrap(), 11);
    let none = vec![ControlDescriptor::new(1, "Gain")];
    assert_eq!(
        engine.discover_tempest_control(none).unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[test]
fn concurrent_readers_observe_only_mapped_states() {
    let (engine, _rec) = engine(ClearanceLevel::Unclassified);
    let engine = Arc::new(engine);
    engine.register_device(7);
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            std::thread::spawn(move || {
                for _ in 0..2000 {
                    let state = engine.get_tempest_state(7);
                    let _ = engine.check_capture_allowed(7, "reader");
                    assert!(state <= TempestState::Lockdown);
                }
            })
        })
        .collect();
    for round in 0..200 {
        engine.set_threat_level(ThreatLevel::ALL[round % 6]);
    }
    for r in readers {
        r.join().unwrap();
    }
    engine.set_threat_level(ThreatLevel::Emergency);
    assert_eq!(engine.get_tempest_state(7), TempestState::Lockdown);
}
