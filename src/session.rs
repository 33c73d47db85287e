//! Device session: one open sensor, gated by the policy engine and audited
//! through the telemetry emitter.
//!
//! Raw device I/O stays behind [`FrameSource`]. The session never owns a file
//! descriptor or a mapped buffer; it only decides whether an operation may run
//! and records what happened.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::GateError;
use crate::event::{Event, EventEmitter, EventKind, EventPayload, Severity};
use crate::policy::{ControlDescriptor, LayerPolicy, PolicyEngine, TempestState};
use crate::profile::{DeviceProfile, MetadataFormat};

/// Frame classification carried alongside each descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameClass {
    Generic,
    Biometric,
}

/// A frame as handed back by the device layer; borrows the device buffer.
#[derive(Clone, Copy, Debug)]
pub struct RawFrame<'a> {
    pub data: &'a [u8],
    pub timestamp_ns: u64,
    pub sequence: u32,
}

/// Non-owning view of a captured frame.
#[derive(Clone, Copy, Debug)]
pub struct FrameDescriptor<'a> {
    pub data: &'a [u8],
    pub timestamp_ns: u64,
    pub sequence: u32,
    pub width: u32,
    pub height: u32,
    pub class: FrameClass,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureFormat {
    pub fourcc: u32,
    pub width: u32,
    pub height: u32,
}

/// Companion metadata node named by the profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetadataStream<'a> {
    pub path: Option<&'a str>,
    pub format: MetadataFormat,
}

/// What [`DeviceSession::apply_profile`] managed to configure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProfileApplied {
    pub format: Option<CaptureFormat>,
    pub framerate: Option<(u32, u32)>,
    pub controls_applied: usize,
    pub controls_failed: usize,
    /// TEMPEST control id resolved from the profile mapping, if any.
    pub tempest_control: Option<u32>,
}

/// The device I/O layer a session drives.
pub trait FrameSource: Send {
    /// Controls in the device's native enumeration order.
    fn controls(&self) -> Vec<ControlDescriptor>;
    fn set_control(&mut self, id: u32, value: i32) -> Result<()>;
    fn set_format(&mut self, format: CaptureFormat) -> Result<()>;
    fn set_framerate(&mut self, fps_num: u32, fps_den: u32) -> Result<()>;
    /// Size the capture buffer queue; called before every stream start.
    fn request_buffers(&mut self, count: u32) -> Result<()>;
    fn start_stream(&mut self) -> Result<()>;
    fn stop_stream(&mut self) -> Result<()>;
    /// Next frame, or `None` when the device dropped one.
    fn dequeue(&mut self) -> Result<Option<RawFrame<'_>>>;
}

static NEXT_DEVICE_ID: AtomicU32 = AtomicU32::new(1);

pub struct DeviceSession {
    device_id: u32,
    path: String,
    profile: DeviceProfile,
    class: FrameClass,
    layer: &'static LayerPolicy,
    format: Option<CaptureFormat>,
    profile_applied: bool,
    streaming: bool,
    closed: bool,
    source: Box<dyn FrameSource>,
    policy: Arc<PolicyEngine>,
    events: Arc<dyn EventEmitter>,
}

impl DeviceSession {
    /// Validate the profile, check the caller's clearance for its role and
    /// register the device with the policy engine.
    pub fn open(
        path: &str,
        profile: DeviceProfile,
        source: Box<dyn FrameSource>,
        policy: Arc<PolicyEngine>,
        events: Arc<dyn EventEmitter>,
    ) -> Result<Self> {
        if path.trim().is_empty() {
            return Err(GateError::invalid("device path must not be empty").into());
        }
        profile.validate()?;
        policy.check_clearance(&profile.role, &profile.classification)?;
        let layer = policy.get_layer_policy(profile.layer)?;
        let class = if profile.is_biometric() {
            FrameClass::Biometric
        } else {
            FrameClass::Generic
        };

        let device_id = NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed);
        let state = policy.register_device(device_id);
        log::info!(
            "device {} opened at {} (role={}, layer=L{}, tempest={})",
            device_id,
            path,
            profile.role,
            layer.layer,
            state.as_str()
        );
        events.emit_event(Event::new(
            device_id,
            EventKind::DeviceOpen,
            Severity::Info,
            EventPayload::context(path),
        ));

        Ok(Self {
            device_id,
            path: path.to_string(),
            profile,
            class,
            layer,
            format: None,
            profile_applied: false,
            streaming: false,
            closed: false,
            source,
            policy,
            events,
        })
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn frame_class(&self) -> FrameClass {
        self.class
    }

    pub fn layer(&self) -> &'static LayerPolicy {
        self.layer
    }

    pub fn format(&self) -> Option<CaptureFormat> {
        self.format
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn metadata_stream(&self) -> Option<MetadataStream<'_>> {
        self.profile.meta_format.map(|format| MetadataStream {
            path: self.profile.meta_device_path.as_deref(),
            format,
        })
    }

    pub fn tempest_state(&self) -> TempestState {
        self.policy.get_tempest_state(self.device_id)
    }

    pub fn get_controls(&self) -> Vec<ControlDescriptor> {
        self.source.controls()
    }

    /// Control id and value the device layer should write for the current
    /// TEMPEST state. The write itself is up to the device layer.
    pub fn tempest_control_value(&self) -> Result<(u32, i32)> {
        let mapping = &self.profile.tempest_control;
        let id = mapping.resolve(self.source.controls())?;
        Ok((id, mapping.value_for(self.tempest_state())))
    }

    pub fn discover_tempest_control(&self) -> Result<u32> {
        Ok(self.policy.discover_tempest_control(self.source.controls())?)
    }

    /// Negotiate a format within the layer's resolution ceiling and TEMPEST floor.
    pub fn set_format(&mut self, format: CaptureFormat) -> Result<()> {
        if format.width == 0 || format.height == 0 {
            return Err(GateError::invalid("format dimensions must be non-zero").into());
        }
        if !self.layer.allows_resolution(format.width, format.height) {
            self.violation("resolution_above_layer");
            return Err(GateError::PermissionDenied(format!(
                "{}x{} exceeds layer L{} ceiling {}x{}",
                format.width,
                format.height,
                self.layer.layer,
                self.layer.max_width,
                self.layer.max_height
            ))
            .into());
        }
        let state = self.tempest_state();
        if !self.layer.allows_tempest(state) {
            self.violation("tempest_below_layer");
            return Err(GateError::PermissionDenied(format!(
                "layer L{} requires TEMPEST {} or stricter, device is {}",
                self.layer.layer,
                self.layer.min_tempest.as_str(),
                state.as_str()
            ))
            .into());
        }
        self.source.set_format(format)?;
        self.format = Some(format);
        // Packed as width << 16 | height.
        let packed = (format.width.min(0xFFFF) << 16) | format.height.min(0xFFFF);
        self.emit(EventKind::FormatChange, Severity::Info, EventPayload::aux(packed));
        Ok(())
    }

    /// Apply the profile's preferred format, if it names one.
    pub fn apply_profile_format(&mut self) -> Result<Option<CaptureFormat>> {
        let (fourcc, width, height) = match self.profile.fourcc() {
            Some(fourcc) if self.profile.width > 0 && self.profile.height > 0 => {
                (fourcc, self.profile.width, self.profile.height)
            }
            _ => return Ok(None),
        };
        let format = CaptureFormat {
            fourcc,
            width,
            height,
        };
        self.set_format(format)?;
        Ok(Some(format))
    }

    /// Apply the profile's format, framerate and control presets.
    ///
    /// Format negotiation goes through [`DeviceSession::set_format`] and its
    /// policy checks, so a denial fails the call. Framerate and control presets
    /// are best effort: devices that reject them are logged and skipped.
    pub fn apply_profile(&mut self) -> Result<ProfileApplied> {
        let format = self.apply_profile_format()?;
        let mut applied = self.apply_profile_settings();
        applied.format = format;
        Ok(applied)
    }

    fn apply_profile_settings(&mut self) -> ProfileApplied {
        let mut applied = ProfileApplied::default();
        if let Some((num, den)) = self.profile.framerate() {
            match self.source.set_framerate(num, den) {
                Ok(()) => applied.framerate = Some((num, den)),
                Err(e) => log::debug!(
                    "device {} framerate {}/{} not applied: {:#}",
                    self.device_id,
                    num,
                    den,
                    e
                ),
            }
        }
        for preset in &self.profile.controls {
            match self.source.set_control(preset.id, preset.value) {
                Ok(()) => applied.controls_applied += 1,
                Err(e) => {
                    applied.controls_failed += 1;
                    log::debug!(
                        "device {} control {:#x}={} not applied: {:#}",
                        self.device_id,
                        preset.id,
                        preset.value,
                        e
                    );
                }
            }
        }
        applied.tempest_control = self
            .profile
            .tempest_control
            .resolve(self.source.controls())
            .ok();
        self.profile_applied = true;
        applied
    }

    pub fn start_stream(&mut self) -> Result<()> {
        if self.streaming {
            return Ok(());
        }
        self.policy
            .check_capture_allowed(self.device_id, "start_stream")?;
        if self.format.is_none() {
            self.apply_profile_format()?;
        }
        if !self.profile_applied {
            self.apply_profile_settings();
        }
        self.source.request_buffers(self.profile.buffer_count)?;
        self.source.start_stream()?;
        self.streaming = true;
        self.emit(EventKind::CaptureStart, Severity::Info, EventPayload::none());
        Ok(())
    }

    pub fn stop_stream(&mut self) -> Result<()> {
        if !self.streaming {
            return Ok(());
        }
        let res = self.source.stop_stream();
        self.streaming = false;
        self.emit(EventKind::CaptureStop, Severity::Info, EventPayload::none());
        res
    }

    /// Gate, dequeue and log one frame. `Ok(None)` means the device dropped it.
    pub fn capture_frame(&mut self) -> Result<Option<FrameDescriptor<'_>>> {
        self.policy
            .check_capture_allowed(self.device_id, "capture_frame")?;
        if !self.streaming {
            return Err(GateError::invalid("capture requires an active stream").into());
        }
        let (width, height) = self
            .format
            .map(|f| (f.width, f.height))
            .unwrap_or((0, 0));
        match self.source.dequeue() {
            Ok(Some(raw)) => {
                self.events.emit_event(Event::new(
                    self.device_id,
                    EventKind::FrameAcquired,
                    Severity::Debug,
                    EventPayload::aux(raw.sequence),
                ));
                Ok(Some(FrameDescriptor {
                    data: raw.data,
                    timestamp_ns: raw.timestamp_ns,
                    sequence: raw.sequence,
                    width,
                    height,
                    class: self.class,
                }))
            }
            Ok(None) => {
                self.events.emit_event(Event::new(
                    self.device_id,
                    EventKind::FrameDropped,
                    Severity::Medium,
                    EventPayload::none(),
                ));
                Ok(None)
            }
            Err(e) => {
                self.events.emit_event(Event::new(
                    self.device_id,
                    EventKind::Error,
                    Severity::High,
                    EventPayload::context("dequeue_failed"),
                ));
                Err(e)
            }
        }
    }

    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let res = self.stop_stream();
        self.policy.unregister_device(self.device_id);
        self.emit(EventKind::DeviceClose, Severity::Info, EventPayload::none());
        log::info!("device {} closed", self.device_id);
        res
    }

    fn emit(&self, kind: EventKind, severity: Severity, payload: EventPayload) {
        self.events
            .emit_event(Event::new(self.device_id, kind, severity, payload));
    }

    fn violation(&self, label: &str) {
        self.emit(
            EventKind::PolicyViolation,
            Severity::High,
            EventPayload::context(label),
        );
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("device {} close failed: {:#}", self.device_id, e);
        }
    }
}

// -------------------- Stub source --------------------

/// Settings a [`StubFrameSource`] has accepted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StubSettings {
    pub framerate: Option<(u32, u32)>,
    pub controls: Vec<(u32, i32)>,
    pub buffers: Option<u32>,
}

/// Synthetic device for tests and dry runs.
pub struct StubFrameSource {
    controls: Vec<ControlDescriptor>,
    settings: Arc<Mutex<StubSettings>>,
    buffer: Vec<u8>,
    streaming: bool,
    sequence: u32,
    drop_every: Option<u32>,
}

impl Default for StubFrameSource {
    fn default() -> Self {
        Self::new(vec![
            ControlDescriptor::new(0x0098_0900, "Brightness"),
            ControlDescriptor::new(0x0098_0901, "Contrast"),
            ControlDescriptor::new(0x009a_0910, "Privacy"),
        ])
    }
}

impl StubFrameSource {
    pub fn new(controls: Vec<ControlDescriptor>) -> Self {
        Self {
            controls,
            settings: Arc::new(Mutex::new(StubSettings::default())),
            buffer: vec![0u8; 64],
            streaming: false,
            sequence: 0,
            drop_every: None,
        }
    }

    /// Report every `n`th frame as dropped.
    pub fn drop_every(mut self, n: u32) -> Self {
        self.drop_every = (n > 0).then_some(n);
        self
    }

    /// Shared view of accepted settings; stays valid after the source is boxed.
    pub fn settings(&self) -> Arc<Mutex<StubSettings>> {
        self.settings.clone()
    }

    fn record(&self, f: impl FnOnce(&mut StubSettings)) {
        f(&mut self.settings.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

impl FrameSource for StubFrameSource {
    fn controls(&self) -> Vec<ControlDescriptor> {
        self.controls.clone()
    }

    fn set_control(&mut self, id: u32, value: i32) -> Result<()> {
        if !self.controls.iter().any(|c| c.id == id) {
            return Err(anyhow!("control {:#x} not supported", id));
        }
        self.record(|s| s.controls.push((id, value)));
        Ok(())
    }

    fn set_framerate(&mut self, fps_num: u32, fps_den: u32) -> Result<()> {
        if fps_den == 0 {
            return Err(anyhow!("framerate denominator must be non-zero"));
        }
        self.record(|s| s.framerate = Some((fps_num, fps_den)));
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> Result<()> {
        if self.streaming {
            return Err(anyhow!("cannot resize buffers while streaming"));
        }
        self.record(|s| s.buffers = Some(count));
        Ok(())
    }

    fn set_format(&mut self, format: CaptureFormat) -> Result<()> {
        if self.streaming {
            return Err(anyhow!("cannot change format while streaming"));
        }
        let len = (format.width as usize)
            .checked_mul(format.height as usize)
            .ok_or_else(|| anyhow!("frame size overflow"))?;
        self.buffer = vec![0u8; len.min(1 << 20)];
        Ok(())
    }

    fn start_stream(&mut self) -> Result<()> {
        self.streaming = true;
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<()> {
        self.streaming = false;
        Ok(())
    }

    fn dequeue(&mut self) -> Result<Option<RawFrame<'_>>> {
        if !self.streaming {
            return Err(anyhow!("stream not started"));
        }
        self.sequence = self.sequence.wrapping_add(1);
        if let Some(n) = self.drop_every {
            if self.sequence % n == 0 {
                return Ok(None);
            }
        }
        let fill = self.sequence as u8;
        self.buffer.iter_mut().for_each(|b| *b = fill);
        Ok(Some(RawFrame {
            data: &self.buffer,
            timestamp_ns: crate::event::now_ns(),
            sequence: self.sequence,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{ClearanceLevel, FixedClearance, ThreatLevel};
    use crate::profile::ProfileRegistry;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Event>>);

    impl EventEmitter for Recorder {
        fn emit_event(&self, event: Event) {
            self.0.lock().unwrap().push(event);
        }
    }

    impl Recorder {
        fn kinds(&self) -> Vec<EventKind> {
            self.0.lock().unwrap().iter().map(|e| e.kind).collect()
        }
    }

    fn setup(clearance: ClearanceLevel) -> (Arc<PolicyEngine>, Arc<Recorder>) {
        let rec = Arc::new(Recorder::default());
        let engine = Arc::new(PolicyEngine::new(
            rec.clone(),
            Box::new(FixedClearance(clearance)),
        ));
        (engine, rec)
    }

    fn open(role: &str, engine: &Arc<PolicyEngine>, rec: &Arc<Recorder>) -> Result<DeviceSession> {
        let profile = ProfileRegistry::builtin().find_by_role(role).unwrap();
        DeviceSession::open(
            "/dev/video0",
            profile,
            Box::new(StubFrameSource::default().drop_every(3)),
            engine.clone(),
            rec.clone(),
        )
    }

    #[test]
    fn webcam_lifecycle_emits_expected_events() {
        let (engine, rec) = setup(ClearanceLevel::Unclassified);
        let mut s = open("generic_webcam", &engine, &rec).unwrap();
        assert_eq!(s.frame_class(), FrameClass::Generic);
        s.start_stream().unwrap();
        let f1 = s.capture_frame().unwrap().unwrap();
        assert_eq!((f1.width, f1.height), (1280, 720));
        assert!(s.capture_frame().unwrap().is_some());
        assert!(s.capture_frame().unwrap().is_none());
        s.close().unwrap();
        assert_eq!(
            rec.kinds(),
            vec![
                EventKind::DeviceOpen,
                EventKind::FormatChange,
                EventKind::CaptureStart,
                EventKind::FrameAcquired,
                EventKind::FrameAcquired,
                EventKind::FrameDropped,
                EventKind::CaptureStop,
                EventKind::DeviceClose,
            ]
        );
        assert_eq!(engine.get_tempest_state(9_999), TempestState::Disabled);
    }

    #[test]
    fn insufficient_clearance_blocks_open() {
        let (engine, rec) = setup(ClearanceLevel::Unclassified);
        let err = open("iris_scanner", &engine, &rec).err().unwrap();
        let gate = err.downcast_ref::<GateError>().unwrap();
        assert_eq!(gate.kind(), crate::ErrorKind::PermissionDenied);
        assert_eq!(rec.kinds(), vec![EventKind::PolicyViolation]);
    }

    #[test]
    fn biometric_frames_are_tagged_and_layer_floor_enforced() {
        let (engine, rec) = setup(ClearanceLevel::TopSecret);
        let mut s = open("iris_scanner", &engine, &rec).unwrap();
        assert_eq!(s.frame_class(), FrameClass::Biometric);
        // Layer 3 needs LOW; NORMAL threat gives DISABLED.
        let err = s.start_stream().unwrap_err();
        assert!(err.downcast_ref::<GateError>().unwrap().is_denial());
        engine.set_threat_level(ThreatLevel::Alpha);
        s.start_stream().unwrap();
        let frame = s.capture_frame().unwrap().unwrap();
        assert_eq!(frame.class, FrameClass::Biometric);
        assert_eq!(s.tempest_control_value().unwrap(), (0x009a_0910, 1));
    }

    #[test]
    fn lockdown_denies_capture_but_keeps_session() {
        let (engine, rec) = setup(ClearanceLevel::Unclassified);
        let mut s = open("generic_webcam", &engine, &rec).unwrap();
        s.start_stream().unwrap();
        engine.set_threat_level(ThreatLevel::Emergency);
        let err = s.capture_frame().err().unwrap();
        assert_eq!(
            err.downcast_ref::<GateError>().unwrap().kind(),
            crate::ErrorKind::AccessDenied
        );
        engine.set_threat_level(ThreatLevel::Normal);
        assert!(s.capture_frame().unwrap().is_some());
    }

    #[test]
    fn profile_settings_reach_the_device() {
        let (engine, rec) = setup(ClearanceLevel::TopSecret);
        engine.set_threat_level(ThreatLevel::Alpha);
        let mut profile = ProfileRegistry::builtin().find_by_role("iris_scanner").unwrap();
        profile.fps_num = 15;
        profile.buffer_count = 6;
        profile.controls.push(crate::profile::ControlPreset {
            id: 0x0098_0900,
            value: 40,
        });
        let source = StubFrameSource::new(vec![
            ControlDescriptor::new(0x0098_0900, "Brightness"),
            ControlDescriptor::new(0x009a_0910, "Privacy"),
        ]);
        let settings = source.settings();
        let mut s = DeviceSession::open(
            "/dev/video2",
            profile,
            Box::new(source),
            engine.clone(),
            rec.clone(),
        )
        .unwrap();

        let applied = s.apply_profile().unwrap();
        assert_eq!(applied.format.map(|f| (f.width, f.height)), Some((640, 480)));
        assert_eq!(applied.framerate, Some((15, 1)));
        // The stub has no auto exposure control; the brightness preset still lands.
        assert_eq!(applied.controls_failed, 1);
        assert_eq!(applied.controls_applied, 1);
        assert_eq!(applied.tempest_control, Some(0x009a_0910));

        s.start_stream().unwrap();
        let seen = settings.lock().unwrap().clone();
        assert_eq!(seen.framerate, Some((15, 1)));
        assert_eq!(seen.controls, vec![(0x0098_0900, 40)]);
        assert_eq!(seen.buffers, Some(6));
    }

    #[test]
    fn start_stream_applies_profile_once() {
        let (engine, rec) = setup(ClearanceLevel::Unclassified);
        let mut profile = ProfileRegistry::builtin()
            .find_by_role("generic_webcam")
            .unwrap();
        profile.controls.push(crate::profile::ControlPreset {
            id: 0x0098_0901,
            value: 3,
        });
        let source = StubFrameSource::default();
        let settings = source.settings();
        let mut s =
            DeviceSession::open("/dev/video0", profile, Box::new(source), engine, rec).unwrap();
        s.start_stream().unwrap();
        s.stop_stream().unwrap();
        s.start_stream().unwrap();
        let seen = settings.lock().unwrap().clone();
        assert_eq!(seen.framerate, Some((30, 1)));
        assert_eq!(seen.controls, vec![(0x0098_0901, 3)]);
        assert_eq!(seen.buffers, Some(crate::profile::DEFAULT_BUFFER_COUNT));
    }

    #[test]
    fn ir_sensor_names_radiometric_metadata() {
        let (engine, rec) = setup(ClearanceLevel::Confidential);
        let ir = open("ir_sensor", &engine, &rec).unwrap();
        let meta = ir.metadata_stream().unwrap();
        assert_eq!(meta.format, MetadataFormat::IrRadiometric);
        assert_eq!(meta.path, None);
        let cam = open("generic_webcam", &engine, &rec).unwrap();
        assert!(cam.metadata_stream().is_none());
    }

    #[test]
    fn resolution_above_layer_is_refused() {
        let (engine, rec) = setup(ClearanceLevel::Confidential);
        let mut s = open("ir_sensor", &engine, &rec).unwrap();
        let err = s
            .set_format(CaptureFormat {
                fourcc: u32::from_le_bytes(*b"Y16 "),
                width: 3840,
                height: 2160,
            })
            .unwrap_err();
        assert!(err.downcast_ref::<GateError>().unwrap().is_denial());
        assert!(s.format().is_none());
        assert_eq!(s.discover_tempest_control().unwrap(), 0x009a_0910);
    }
}
