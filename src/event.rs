//! Audit event schema shared by the policy engine, the capture path and telemetry.
//!
//! Events are small `Copy` records so that a ring slot can be written in place
//! without allocation. The persisted form is a fixed-size little-endian record:
//!
//! ```text
//! offset  size  field
//!      0     4  device_id
//!      4     4  kind
//!      8     1  severity
//!      9     7  reserved (zero)
//!     16     8  timestamp_ns (monotonic)
//!     24    32  payload (zero-padded)
//! ```

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Instant;

use crate::error::{GateError, GateResult};
use crate::policy::TempestState;

pub const PAYLOAD_LEN: usize = 32;
pub const RECORD_LEN: usize = 56;

/// Device id used for events that have no device context (clearance checks).
pub const NO_DEVICE: u32 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum EventKind {
    DeviceOpen = 1,
    DeviceClose = 2,
    CaptureStart = 3,
    CaptureStop = 4,
    FrameAcquired = 5,
    FrameDropped = 6,
    TempestTransition = 7,
    TempestQuery = 8,
    TempestLockdown = 9,
    FormatChange = 10,
    Error = 11,
    PolicyViolation = 12,
}

impl EventKind {
    pub fn from_u32(raw: u32) -> Option<Self> {
        let kind = match raw {
            1 => EventKind::DeviceOpen,
            2 => EventKind::DeviceClose,
            3 => EventKind::CaptureStart,
            4 => EventKind::CaptureStop,
            5 => EventKind::FrameAcquired,
            6 => EventKind::FrameDropped,
            7 => EventKind::TempestTransition,
            8 => EventKind::TempestQuery,
            9 => EventKind::TempestLockdown,
            10 => EventKind::FormatChange,
            11 => EventKind::Error,
            12 => EventKind::PolicyViolation,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::DeviceOpen => "DEVICE_OPEN",
            EventKind::DeviceClose => "DEVICE_CLOSE",
            EventKind::CaptureStart => "CAPTURE_START",
            EventKind::CaptureStop => "CAPTURE_STOP",
            EventKind::FrameAcquired => "FRAME_ACQUIRED",
            EventKind::FrameDropped => "FRAME_DROPPED",
            EventKind::TempestTransition => "TEMPEST_TRANSITION",
            EventKind::TempestQuery => "TEMPEST_QUERY",
            EventKind::TempestLockdown => "TEMPEST_LOCKDOWN",
            EventKind::FormatChange => "FORMAT_CHANGE",
            EventKind::Error => "ERROR",
            EventKind::PolicyViolation => "POLICY_VIOLATION",
        }
    }
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Severity {
    #[default]
    Debug = 0,
    Info = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl Severity {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Severity::Debug),
            1 => Some(Severity::Info),
            2 => Some(Severity::Medium),
            3 => Some(Severity::High),
            4 => Some(Severity::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

const TAG_NONE: u8 = 0;
const TAG_TRANSITION: u8 = 1;
const TAG_CONTEXT: u8 = 2;
const TAG_AUX: u8 = 3;

/// Maximum label bytes a context payload can carry (tag + length prefix take two).
pub const MAX_CONTEXT_LABEL: usize = PAYLOAD_LEN - 2;

/// Fixed-size event payload. The first byte tags the layout.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventPayload([u8; PAYLOAD_LEN]);

/// Decoded view of an [`EventPayload`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PayloadView {
    None,
    Transition {
        old: TempestState,
        new: TempestState,
    },
    Context(String),
    Aux(u32),
    Raw([u8; PAYLOAD_LEN]),
}

impl EventPayload {
    pub const fn none() -> Self {
        Self([0u8; PAYLOAD_LEN])
    }

    pub fn transition(old: TempestState, new: TempestState) -> Self {
        let mut bytes = [0u8; PAYLOAD_LEN];
        bytes[0] = TAG_TRANSITION;
        bytes[1] = old as u8;
        bytes[2] = new as u8;
        Self(bytes)
    }

    /// Context label, truncated on a UTF-8 boundary to fit the payload.
    pub fn context(label: &str) -> Self {
        let mut end = label.len().min(MAX_CONTEXT_LABEL);
        while !label.is_char_boundary(end) {
            end -= 1;
        }
        let mut bytes = [0u8; PAYLOAD_LEN];
        bytes[0] = TAG_CONTEXT;
        bytes[1] = end as u8;
        bytes[2..2 + end].copy_from_slice(&label.as_bytes()[..end]);
        Self(bytes)
    }

    pub fn aux(value: u32) -> Self {
        let mut bytes = [0u8; PAYLOAD_LEN];
        bytes[0] = TAG_AUX;
        bytes[4..8].copy_from_slice(&value.to_le_bytes());
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; PAYLOAD_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PAYLOAD_LEN] {
        &self.0
    }

    pub fn view(&self) -> PayloadView {
        let b = &self.0;
        match b[0] {
            TAG_NONE if b.iter().all(|x| *x == 0) => PayloadView::None,
            TAG_TRANSITION => match (TempestState::from_u8(b[1]), TempestState::from_u8(b[2])) {
                (Some(old), Some(new)) => PayloadView::Transition { old, new },
                _ => PayloadView::Raw(*b),
            },
            TAG_CONTEXT => {
                let len = (b[1] as usize).min(MAX_CONTEXT_LABEL);
                match std::str::from_utf8(&b[2..2 + len]) {
                    Ok(s) => PayloadView::Context(s.to_string()),
                    Err(_) => PayloadView::Raw(*b),
                }
            }
            TAG_AUX => PayloadView::Aux(u32::from_le_bytes([b[4], b[5], b[6], b[7]])),
            _ => PayloadView::Raw(*b),
        }
    }
}

impl Default for EventPayload {
    fn default() -> Self {
        Self::none()
    }
}

impl std::fmt::Debug for EventPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventPayload({:?})", self.view())
    }
}

/// Immutable audit record. Created at the moment of a decision, never mutated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    pub device_id: u32,
    pub kind: EventKind,
    pub severity: Severity,
    pub timestamp_ns: u64,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(device_id: u32, kind: EventKind, severity: Severity, payload: EventPayload) -> Self {
        Self {
            device_id,
            kind,
            severity,
            timestamp_ns: now_ns(),
            payload,
        }
    }

    pub fn to_record(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[0..4].copy_from_slice(&self.device_id.to_le_bytes());
        out[4..8].copy_from_slice(&(self.kind as u32).to_le_bytes());
        out[8] = self.severity as u8;
        out[16..24].copy_from_slice(&self.timestamp_ns.to_le_bytes());
        out[24..RECORD_LEN].copy_from_slice(self.payload.as_bytes());
        out
    }

    pub fn from_record(bytes: &[u8]) -> GateResult<Self> {
        if bytes.len() != RECORD_LEN {
            return Err(GateError::malformed(format!(
                "event record must be {} bytes, got {}",
                RECORD_LEN,
                bytes.len()
            )));
        }
        let device_id = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let raw_kind = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let kind = EventKind::from_u32(raw_kind)
            .ok_or_else(|| GateError::malformed(format!("unknown event kind {}", raw_kind)))?;
        let severity = Severity::from_u8(bytes[8])
            .ok_or_else(|| GateError::malformed(format!("unknown severity {}", bytes[8])))?;
        if bytes[9..16].iter().any(|b| *b != 0) {
            return Err(GateError::malformed("event record reserved bytes must be zero"));
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[16..24]);
        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&bytes[24..RECORD_LEN]);
        Ok(Self {
            device_id,
            kind,
            severity,
            timestamp_ns: u64::from_le_bytes(ts),
            payload: EventPayload::from_bytes(payload),
        })
    }
}

/// Anything that accepts audit events without blocking the caller.
pub trait EventEmitter: Send + Sync {
    fn emit_event(&self, event: Event);
}

/// Monotonic nanoseconds since the first call in this process.
pub fn now_ns() -> u64 {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    let anchor = ANCHOR.get_or_init(Instant::now);
    u64::try_from(anchor.elapsed().as_nanos()).unwrap_or(u64::MAX)
}
