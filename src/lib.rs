//! Sensor Gate
//!
//! Mandatory-access-control gate and audit trail for sensor hardware
//! (cameras, iris scanners, thermal sensors).
//!
//! # Architecture
//!
//! - `policy`: threat level -> TEMPEST state mapping, clearance checks and the
//!   capture gate every frame acquisition passes through.
//! - `telemetry`: bounded, non-blocking event intake drained by a background
//!   worker into file, SQLite, MQTT or in-process sinks, optionally as signed,
//!   hash-chained chunks.
//! - `metadata`: KLV parsing over untrusted bytes, metadata/frame timestamp
//!   alignment and radiometric decoding.
//! - `profile` / `session`: device profiles and the per-device session that
//!   wires the policy engine and telemetry around an external frame source.
//! - `config`: layered file + environment configuration.
//!
//! # Invariants
//!
//! 1. **EMERGENCY is LOCKDOWN**: no code path leaves a device outside LOCKDOWN
//!    while the threat level is EMERGENCY.
//! 2. **LOCKDOWN denies capture**, regardless of clearance.
//! 3. **Every denial is audited**: policy denials return an error and emit one
//!    event.
//! 4. **Telemetry never blocks capture**: a full ring drops the new event and
//!    counts it.
//! 5. **Parsers are total**: malformed input yields `MalformedInput`, never a
//!    panic or an out-of-bounds read.

pub mod config;
pub mod error;
pub mod event;
pub mod metadata;
pub mod policy;
pub mod profile;
pub mod session;
pub mod telemetry;

pub use config::GateConfig;
pub use error::{ErrorKind, GateError, GateResult};
pub use event::{Event, EventEmitter, EventKind, EventPayload, PayloadView, Severity, NO_DEVICE};
pub use metadata::{
    decode_ir_radiometric, encode_klv, find_klv_item, parse_klv, sync_metadata, KlvItem,
    MetadataBuffer, RadiometricCalibration, TemperatureMap, UniversalLabel,
};
pub use policy::{
    ClearanceLevel, ClearanceSource, EnvClearance, FixedClearance, LayerPolicy, PolicyEngine,
    TempestState, ThreatLevel,
};
pub use profile::{DeviceProfile, ProfileRegistry};
pub use session::{
    CaptureFormat, DeviceSession, FrameClass, FrameDescriptor, FrameSource, MetadataStream,
    ProfileApplied,
};
pub use telemetry::{
    StatsSnapshot, Telemetry, TelemetryConfig, TelemetryProfile,
};
