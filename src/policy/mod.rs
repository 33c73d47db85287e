//! Mandatory-access-control policy for sensor capture.
//!
//! The engine maps the site-wide threat level onto a per-device TEMPEST
//! (emission suppression) state and is the single gate every capture attempt
//! passes through. Every security-relevant denial it makes is recorded as an
//! event; successful capture checks are deliberately silent so the hot path
//! does not flood the audit log.
//!
//! Invariants:
//! - The threat -> TEMPEST mapping is a fixed table; EMERGENCY maps to LOCKDOWN.
//! - While the threat level is EMERGENCY no device can hold a state other than
//!   LOCKDOWN (manual requests below the threat floor are refused).
//! - LOCKDOWN denies every capture regardless of clearance.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock};

use crate::error::{GateError, GateResult};
use crate::event::{Event, EventEmitter, EventKind, EventPayload, Severity, NO_DEVICE};

pub mod clearance;
pub mod layer;
pub mod tempest;

pub use clearance::{
    Classification, ClearanceLevel, ClearanceSource, EnvClearance, FixedClearance,
};
pub use layer::{layer_policy, LayerPolicy, MAX_LAYER};
pub use tempest::{discover_tempest_control, ControlDescriptor, TempestControl};

// -------------------- States --------------------

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum TempestState {
    #[default]
    Disabled = 0,
    Low = 1,
    High = 2,
    Lockdown = 3,
}

impl TempestState {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(TempestState::Disabled),
            1 => Some(TempestState::Low),
            2 => Some(TempestState::High),
            3 => Some(TempestState::Lockdown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TempestState::Disabled => "DISABLED",
            TempestState::Low => "LOW",
            TempestState::High => "HIGH",
            TempestState::Lockdown => "LOCKDOWN",
        }
    }
}

impl FromStr for TempestState {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DISABLED" => Ok(TempestState::Disabled),
            "LOW" => Ok(TempestState::Low),
            "HIGH" => Ok(TempestState::High),
            "LOCKDOWN" => Ok(TempestState::Lockdown),
            other => Err(GateError::invalid(format!(
                "unknown TEMPEST state '{}'",
                other
            ))),
        }
    }
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ThreatLevel {
    #[default]
    Normal = 0,
    Alpha = 1,
    Bravo = 2,
    Charlie = 3,
    Delta = 4,
    Emergency = 5,
}

impl ThreatLevel {
    pub const ALL: [ThreatLevel; 6] = [
        ThreatLevel::Normal,
        ThreatLevel::Alpha,
        ThreatLevel::Bravo,
        ThreatLevel::Charlie,
        ThreatLevel::Delta,
        ThreatLevel::Emergency,
    ];

    pub fn from_u8(raw: u8) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::Normal => "NORMAL",
            ThreatLevel::Alpha => "ALPHA",
            ThreatLevel::Bravo => "BRAVO",
            ThreatLevel::Charlie => "CHARLIE",
            ThreatLevel::Delta => "DELTA",
            ThreatLevel::Emergency => "EMERGENCY",
        }
    }
}

impl FromStr for ThreatLevel {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("THREATCON_").unwrap_or(&upper);
        match name {
            "NORMAL" => Ok(ThreatLevel::Normal),
            "ALPHA" => Ok(ThreatLevel::Alpha),
            "BRAVO" => Ok(ThreatLevel::Bravo),
            "CHARLIE" => Ok(ThreatLevel::Charlie),
            "DELTA" => Ok(ThreatLevel::Delta),
            "EMERGENCY" => Ok(ThreatLevel::Emergency),
            other => Err(GateError::invalid(format!(
                "unknown threat level '{}'",
                other
            ))),
        }
    }
}

/// Fixed threat -> TEMPEST table, indexed by `ThreatLevel as usize`.
const THREAT_TO_TEMPEST: [TempestState; 6] = [
    TempestState::Disabled, // NORMAL
    TempestState::Low,      // ALPHA
    TempestState::Low,      // BRAVO
    TempestState::High,     // CHARLIE
    TempestState::High,     // DELTA
    TempestState::Lockdown, // EMERGENCY
];

pub fn tempest_for_threat(level: ThreatLevel) -> TempestState {
    THREAT_TO_TEMPEST[level as usize]
}

// -------------------- Engine --------------------

const NO_OVERRIDE: u8 = u8::MAX;

/// Cached state plus any operator escalation above the threat floor. Both are
/// written only under the engine's threat lock.
struct DeviceTempest {
    state: AtomicU8,
    escalation: AtomicU8,
}

impl DeviceTempest {
    fn new(state: TempestState) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
            escalation: AtomicU8::new(NO_OVERRIDE),
        }
    }

    fn load(&self) -> TempestState {
        TempestState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(TempestState::Lockdown)
    }

    fn store(&self, state: TempestState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn escalation(&self) -> Option<TempestState> {
        TempestState::from_u8(self.escalation.load(Ordering::Acquire))
    }

    fn set_escalation(&self, state: Option<TempestState>) {
        let raw = state.map(|s| s as u8).unwrap_or(NO_OVERRIDE);
        self.escalation.store(raw, Ordering::Release);
    }

    /// State the device should hold under `floor`.
    fn resolve(&self, floor: TempestState) -> TempestState {
        self.escalation().map_or(floor, |held| held.max(floor))
    }
}

/// Policy state for one principal session.
///
/// Writers (threat changes, manual TEMPEST requests) serialize on the threat
/// lock; readers use atomic loads and never wait on a writer. Events are emitted
/// after locks are released.
pub struct PolicyEngine {
    threat_lock: Mutex<ThreatLevel>,
    threat_now: AtomicU8,
    devices: RwLock<HashMap<u32, Arc<DeviceTempest>>>,
    clearance_source: Box<dyn ClearanceSource>,
    clearance: OnceLock<ClearanceLevel>,
    events: Arc<dyn EventEmitter>,
}

impl PolicyEngine {
    pub fn new(events: Arc<dyn EventEmitter>, clearance_source: Box<dyn ClearanceSource>) -> Self {
        Self::with_threat_level(events, clearance_source, ThreatLevel::Normal)
    }

    pub fn with_threat_level(
        events: Arc<dyn EventEmitter>,
        clearance_source: Box<dyn ClearanceSource>,
        initial: ThreatLevel,
    ) -> Self {
        Self {
            threat_lock: Mutex::new(initial),
            threat_now: AtomicU8::new(initial as u8),
            devices: RwLock::new(HashMap::new()),
            clearance_source,
            clearance: OnceLock::new(),
            events,
        }
    }

    /// Track a device so threat changes recompute its cached state.
    pub fn register_device(&self, device_id: u32) -> TempestState {
        let threat = lock(&self.threat_lock);
        let state = tempest_for_threat(*threat);
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        devices
            .entry(device_id)
            .or_insert_with(|| Arc::new(DeviceTempest::new(state)))
            .load()
    }

    pub fn unregister_device(&self, device_id: u32) {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        devices.remove(&device_id);
    }

    pub fn set_threat_level(&self, level: ThreatLevel) {
        let transitions = {
            let mut current = lock(&self.threat_lock);
            if *current == level {
                return;
            }
            log::info!("threat level {} -> {}", current.as_str(), level.as_str());
            *current = level;
            self.threat_now.store(level as u8, Ordering::Release);

            let floor = tempest_for_threat(level);
            let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
            let mut transitions = Vec::new();
            for (id, device) in devices.iter() {
                let old = device.load();
                let new = device.resolve(floor);
                if old != new {
                    device.store(new);
                    transitions.push((*id, old, new));
                }
            }
            transitions
        };

        for (device_id, old, new) in transitions {
            self.emit_transition(device_id, old, new);
        }
    }

    pub fn get_threat_level(&self) -> ThreatLevel {
        ThreatLevel::from_u8(self.threat_now.load(Ordering::Acquire))
            .unwrap_or(ThreatLevel::Emergency)
    }

    /// Cached state of a registered device; unregistered devices report the
    /// floor of the current threat level.
    pub fn get_tempest_state(&self, device_id: u32) -> TempestState {
        let cached = {
            let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
            devices.get(&device_id).map(|d| d.load())
        };
        cached.unwrap_or_else(|| tempest_for_threat(self.get_threat_level()))
    }

    /// Raise a registered device's suppression above the threat floor.
    ///
    /// The escalation holds across threat changes in both directions: the
    /// device sits at the higher of the escalated state and the threat floor
    /// until it is set back to the floor, which clears the escalation.
    pub fn set_tempest_state(&self, device_id: u32, target: TempestState) -> GateResult<()> {
        let outcome = {
            let threat = lock(&self.threat_lock);
            let floor = tempest_for_threat(*threat);
            let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
            let device = devices
                .get(&device_id)
                .ok_or_else(|| GateError::NotFound(format!("device {}", device_id)))?;
            if target < floor {
                Err((threat.as_str(), floor))
            } else {
                device.set_escalation((target > floor).then_some(target));
                let old = device.load();
                if old != target {
                    device.store(target);
                }
                Ok(old)
            }
        };

        match outcome {
            Ok(old) => {
                if old != target {
                    self.emit_transition(device_id, old, target);
                }
                Ok(())
            }
            Err((threat, floor)) => {
                self.events.emit_event(Event::new(
                    device_id,
                    EventKind::PolicyViolation,
                    Severity::High,
                    EventPayload::context("tempest_below_floor"),
                ));
                Err(GateError::PermissionDenied(format!(
                    "TEMPEST {} is below the {} floor for threat level {}",
                    target.as_str(),
                    floor.as_str(),
                    threat
                )))
            }
        }
    }

    /// Clearance of the calling principal, read once from the source.
    pub fn caller_clearance(&self) -> ClearanceLevel {
        *self
            .clearance
            .get_or_init(|| self.clearance_source.clearance())
    }

    pub fn check_clearance(&self, role: &str, classification: &str) -> GateResult<()> {
        if role.trim().is_empty() {
            return Err(GateError::invalid("role is required"));
        }
        if classification.trim().is_empty() {
            return Err(GateError::invalid("classification is required"));
        }
        let required = Classification::parse(classification)?;
        let caller = self.caller_clearance();
        if caller < required.level {
            self.events.emit_event(Event::new(
                NO_DEVICE,
                EventKind::PolicyViolation,
                Severity::High,
                EventPayload::context(role.trim()),
            ));
            log::warn!(
                "clearance denied: role={} requires {}, caller holds {}",
                role.trim(),
                required,
                caller.as_str()
            );
            return Err(GateError::PermissionDenied(format!(
                "role '{}' requires {}, caller holds {}",
                role.trim(),
                required,
                caller.as_str()
            )));
        }
        Ok(())
    }

    /// The gate every capture call passes first. Only denials are recorded.
    pub fn check_capture_allowed(&self, device_id: u32, context_label: &str) -> GateResult<()> {
        if self.get_tempest_state(device_id) == TempestState::Lockdown {
            self.events.emit_event(Event::new(
                device_id,
                EventKind::PolicyViolation,
                Severity::Critical,
                EventPayload::context(context_label),
            ));
            return Err(GateError::AccessDenied(format!(
                "device {} is in TEMPEST LOCKDOWN ({})",
                device_id, context_label
            )));
        }
        Ok(())
    }

    pub fn get_layer_policy(&self, layer: u32) -> GateResult<&'static LayerPolicy> {
        layer_policy(layer)
    }

    pub fn discover_tempest_control<I>(&self, controls: I) -> GateResult<u32>
    where
        I: IntoIterator<Item = ControlDescriptor>,
    {
        discover_tempest_control(controls)
    }

    fn emit_transition(&self, device_id: u32, old: TempestState, new: TempestState) {
        let severity = if new == TempestState::Lockdown {
            Severity::Critical
        } else {
            Severity::Medium
        };
        log::info!(
            "device {} TEMPEST {} -> {}",
            device_id,
            old.as_str(),
            new.as_str()
        );
        self.events.emit_event(Event::new(
            device_id,
            EventKind::TempestTransition,
            severity,
            EventPayload::transition(old, new),
        ));
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
