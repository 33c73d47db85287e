//! Telemetry runtime: bounded non-blocking event intake, asynchronous drain to
//! durable sinks, optional chunk signing.
//!
//! Producers call [`Telemetry::emit`] from any thread. The call reserves a ring
//! slot or counts a drop; it never waits on I/O. A dedicated worker drains the
//! ring every `flush_interval` or as soon as occupancy crosses the high-water
//! mark. Sink failures are counted in [`StatsSnapshot::sink_errors`] and logged;
//! they never reach the producer.

pub mod chunk;
pub mod pipeline;
pub mod ring;
pub mod sink;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::error::{GateError, GateResult};
use crate::event::{Event, EventEmitter, EventKind, EventPayload, Severity};

pub use chunk::{ChunkSigner, Ed25519ChunkSigner, SIGNATURE_LEN};
pub use pipeline::FlushReport;
pub use ring::DEFAULT_CAPACITY;
pub use sink::{
    CallbackSink, EventBatch, EventSink, FileSink, MqttSink, MqttSinkConfig, SqliteSink,
};

use pipeline::{Pipeline, PipelineParts};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Retention profile.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryProfile {
    /// Nothing is buffered.
    Off,
    #[default]
    Ops,
    Exercise,
    /// Requires a signing backend.
    Forensic,
}

impl TelemetryProfile {
    /// Lowest severity delivered to sinks; `None` disables intake.
    pub fn min_severity(&self) -> Option<Severity> {
        match self {
            TelemetryProfile::Off => None,
            TelemetryProfile::Ops => Some(Severity::Info),
            TelemetryProfile::Exercise | TelemetryProfile::Forensic => Some(Severity::Debug),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryProfile::Off => "off",
            TelemetryProfile::Ops => "ops",
            TelemetryProfile::Exercise => "exercise",
            TelemetryProfile::Forensic => "forensic",
        }
    }
}

impl FromStr for TelemetryProfile {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(TelemetryProfile::Off),
            "ops" => Ok(TelemetryProfile::Ops),
            "exercise" => Ok(TelemetryProfile::Exercise),
            "forensic" => Ok(TelemetryProfile::Forensic),
            other => Err(GateError::invalid(format!(
                "unknown telemetry profile '{}'",
                other
            ))),
        }
    }
}

/// Sink selection for one pipeline.
pub enum SinkSpec {
    File(PathBuf),
    Sqlite(String),
    Mqtt(MqttSinkConfig),
    Custom(Box<dyn EventSink>),
}

impl std::fmt::Debug for SinkSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkSpec::File(p) => f.debug_tuple("File").field(p).finish(),
            SinkSpec::Sqlite(p) => f.debug_tuple("Sqlite").field(p).finish(),
            SinkSpec::Mqtt(c) => f.debug_tuple("Mqtt").field(c).finish(),
            SinkSpec::Custom(s) => f.debug_tuple("Custom").field(&s.name()).finish(),
        }
    }
}

impl SinkSpec {
    fn open(self) -> anyhow::Result<Box<dyn EventSink>> {
        Ok(match self {
            SinkSpec::File(path) => Box::new(FileSink::open(path)?),
            SinkSpec::Sqlite(path) => Box::new(SqliteSink::open(&path)?),
            SinkSpec::Mqtt(cfg) => Box::new(MqttSink::connect(&cfg)?),
            SinkSpec::Custom(sink) => sink,
        })
    }
}

pub struct TelemetryConfig {
    pub profile: TelemetryProfile,
    pub flush_interval: Duration,
    /// Run the background flush worker. Without it only explicit `flush` drains.
    pub background: bool,
    /// Frame batches as chunks even without a signer (zero-filled signature).
    pub chunked: bool,
    pub sinks: Vec<SinkSpec>,
    pub signer: Option<Arc<dyn ChunkSigner>>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            profile: TelemetryProfile::default(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            background: true,
            chunked: false,
            sinks: Vec::new(),
            signer: None,
        }
    }
}

impl TelemetryConfig {
    pub fn with_profile(profile: TelemetryProfile) -> Self {
        Self {
            profile,
            ..Self::default()
        }
    }

    pub fn sink(mut self, spec: SinkSpec) -> Self {
        self.sinks.push(spec);
        self
    }
}

#[derive(Debug, Default)]
pub(crate) struct Stats {
    pub events_emitted: AtomicU64,
    pub events_dropped: AtomicU64,
    pub events_flushed: AtomicU64,
    pub events_filtered: AtomicU64,
    pub sink_errors: AtomicU64,
    pub buffer_capacity: AtomicUsize,
}

impl Stats {
    fn reset(&self, capacity: usize) {
        self.events_emitted.store(0, Ordering::Relaxed);
        self.events_dropped.store(0, Ordering::Relaxed);
        self.events_flushed.store(0, Ordering::Relaxed);
        self.events_filtered.store(0, Ordering::Relaxed);
        self.sink_errors.store(0, Ordering::Relaxed);
        self.buffer_capacity.store(capacity, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the counters. Each field is read atomically; the set
/// as a whole is not.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub events_emitted: u64,
    pub events_dropped: u64,
    pub events_flushed: u64,
    pub events_filtered: u64,
    pub sink_errors: u64,
    pub buffer_usage: usize,
    pub buffer_capacity: usize,
}

/// Lifecycle owner of at most one running pipeline.
pub struct Telemetry {
    pipeline: RwLock<Option<Arc<Pipeline>>>,
    stats: Arc<Stats>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            pipeline: RwLock::new(None),
            stats: Arc::new(Stats::default()),
        }
    }

    /// Allocate the ring, open sinks and start the flush worker.
    pub fn init(&self, config: TelemetryConfig) -> GateResult<()> {
        let mut slot = self.pipeline.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(GateError::AlreadyInitialized(
                "telemetry runtime is already running".to_string(),
            ));
        }
        if config.flush_interval.is_zero() {
            return Err(GateError::invalid("flush interval must be non-zero"));
        }
        if config.profile == TelemetryProfile::Forensic && config.signer.is_none() {
            return Err(GateError::invalid(
                "forensic profile requires a signing backend",
            ));
        }

        let mut sinks = Vec::with_capacity(config.sinks.len());
        for spec in config.sinks {
            let label = format!("{:?}", spec);
            let sink = spec.open().map_err(|e| {
                GateError::invalid(format!("failed to open sink {}: {:#}", label, e))
            })?;
            sinks.push(sink);
        }

        self.stats.reset(DEFAULT_CAPACITY);
        let parts = PipelineParts {
            profile: config.profile,
            flush_interval: config.flush_interval,
            background: config.background,
            chunked: config.chunked,
            sinks,
            signer: config.signer,
        };
        let pipeline = Pipeline::start(parts, self.stats.clone())
            .map_err(|e| GateError::invalid(format!("failed to start telemetry: {:#}", e)))?;
        *slot = Some(pipeline);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.pipeline
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Record an event. Never blocks on I/O and never fails; a full ring or a
    /// stopped runtime counts the event as dropped.
    pub fn emit(&self, device_id: u32, kind: EventKind, severity: Severity, payload: EventPayload) {
        self.submit(Event::new(device_id, kind, severity, payload));
    }

    pub fn submit(&self, event: Event) {
        let guard = self.pipeline.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(pipeline) => pipeline.submit(event),
            None => {
                self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Drain everything readable now to the sinks.
    pub fn flush(&self) -> GateResult<FlushReport> {
        Ok(self.running()?.drain(None))
    }

    /// Best-effort drain bounded by `budget`; a partial drain is not an error.
    pub fn flush_within(&self, budget: Duration) -> GateResult<FlushReport> {
        Ok(self.running()?.drain(Some(Instant::now() + budget)))
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        let usage = self
            .pipeline
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|p| p.usage())
            .unwrap_or(0);
        StatsSnapshot {
            events_emitted: self.stats.events_emitted.load(Ordering::Relaxed),
            events_dropped: self.stats.events_dropped.load(Ordering::Relaxed),
            events_flushed: self.stats.events_flushed.load(Ordering::Relaxed),
            events_filtered: self.stats.events_filtered.load(Ordering::Relaxed),
            sink_errors: self.stats.sink_errors.load(Ordering::Relaxed),
            buffer_usage: usage,
            buffer_capacity: self.stats.buffer_capacity.load(Ordering::Relaxed),
        }
    }

    /// Stop the worker, run a final drain and release the ring.
    pub fn shutdown(&self) -> GateResult<FlushReport> {
        // Taking the write lock waits out in-flight emits, so none is torn.
        let pipeline = self
            .pipeline
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| {
                GateError::NotInitialized("telemetry runtime is not running".to_string())
            })?;
        Ok(pipeline.stop())
    }

    fn running(&self) -> GateResult<Arc<Pipeline>> {
        self.pipeline
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| GateError::NotInitialized("telemetry runtime is not running".to_string()))
    }
}

impl EventEmitter for Telemetry {
    fn emit_event(&self, event: Event) {
        self.submit(event);
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if self.is_initialized() {
            let _ = self.shutdown();
        }
    }
}

/// Process-wide runtime shared by the capture path and the policy engine.
pub fn global() -> Arc<Telemetry> {
    static GLOBAL: OnceLock<Arc<Telemetry>> = OnceLock::new();
    GLOBAL.get_or_init(|| Arc::new(Telemetry::new())).clone()
}
