//! Device profiles: role, classification, capture preferences and TEMPEST
//! control mapping.
//!
//! Profiles are immutable once loaded. Lookup goes to `<dir>/<role>.json` in an
//! explicitly configured directory first and falls back to the built-in set.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::{GateError, GateResult};
use crate::policy::{Classification, TempestControl, MAX_LAYER};

pub const MAX_CONTROL_PRESETS: usize = 32;
pub const DEFAULT_BUFFER_COUNT: u32 = 4;
const MAX_BUFFER_COUNT: u32 = 32;

/// V4L2 camera-class privacy control.
pub const V4L2_CID_PRIVACY: u32 = 0x009a_0910;
/// V4L2 camera-class auto exposure control (1 = manual).
pub const V4L2_CID_EXPOSURE_AUTO: u32 = 0x009a_0901;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPreset {
    pub id: u32,
    pub value: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataFormat {
    Klv,
    IrRadiometric,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub device_hint: String,
    /// A clearance level name, optionally with a `_BIOMETRIC` suffix.
    pub classification: String,
    /// FourCC, e.g. `YUYV`.
    #[serde(default)]
    pub pixel_format: Option<String>,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub fps_num: u32,
    #[serde(default = "default_fps_den")]
    pub fps_den: u32,
    #[serde(default)]
    pub layer: u32,
    #[serde(default)]
    pub controls: Vec<ControlPreset>,
    #[serde(default)]
    pub tempest_control: TempestControl,
    #[serde(default)]
    pub meta_device_path: Option<String>,
    #[serde(default)]
    pub meta_format: Option<MetadataFormat>,
    #[serde(default = "default_buffer_count")]
    pub buffer_count: u32,
}

fn default_fps_den() -> u32 {
    1
}

fn default_buffer_count() -> u32 {
    DEFAULT_BUFFER_COUNT
}

impl DeviceProfile {
    /// Requested frames per second as `(numerator, denominator)`.
    pub fn framerate(&self) -> Option<(u32, u32)> {
        (self.fps_num > 0).then(|| (self.fps_num, self.fps_den.max(1)))
    }

    pub fn classification(&self) -> GateResult<Classification> {
        Classification::parse(&self.classification)
    }

    pub fn is_biometric(&self) -> bool {
        self.classification().map(|c| c.biometric).unwrap_or(false)
    }

    /// Little-endian packed FourCC, as V4L2 expects.
    pub fn fourcc(&self) -> Option<u32> {
        let s = self.pixel_format.as_deref()?;
        let bytes: [u8; 4] = s.as_bytes().try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }

    pub fn validate(&self) -> GateResult<()> {
        validate_role(&self.role)?;
        if self.id.trim().is_empty() {
            return Err(GateError::invalid("profile id must not be empty"));
        }
        self.classification()?;
        if let Some(fmt) = &self.pixel_format {
            if self.fourcc().is_none() {
                return Err(GateError::invalid(format!(
                    "pixel_format '{}' is not a four-character code",
                    fmt
                )));
            }
        }
        if self.fps_num > 0 && self.fps_den == 0 {
            return Err(GateError::invalid("fps_den must be non-zero"));
        }
        if self.layer > MAX_LAYER {
            return Err(GateError::invalid(format!(
                "layer {} is outside 0..={}",
                self.layer, MAX_LAYER
            )));
        }
        if self.controls.len() > MAX_CONTROL_PRESETS {
            return Err(GateError::invalid(format!(
                "profile has {} control presets, maximum is {}",
                self.controls.len(),
                MAX_CONTROL_PRESETS
            )));
        }
        if self.buffer_count == 0 || self.buffer_count > MAX_BUFFER_COUNT {
            return Err(GateError::invalid(format!(
                "buffer_count must be within 1..={}",
                MAX_BUFFER_COUNT
            )));
        }
        Ok(())
    }
}

/// Roles double as profile file names, so keep them to a strict allowlist.
pub fn validate_role(role: &str) -> GateResult<()> {
    static ROLE_RE: OnceLock<Result<Regex, String>> = OnceLock::new();
    let re = ROLE_RE
        .get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]{0,63}$").map_err(|e| e.to_string()))
        .as_ref()
        .map_err(|e| GateError::invalid(format!("role pattern failed to compile: {}", e)))?;
    if role.is_empty() {
        return Err(GateError::invalid("role must not be empty"));
    }
    if !re.is_match(role) {
        return Err(GateError::invalid(format!(
            "role '{}' must match ^[a-z][a-z0-9_]{{0,63}}$",
            role
        )));
    }
    Ok(())
}

pub fn builtin_profiles() -> Vec<DeviceProfile> {
    vec![
        DeviceProfile {
            id: "iris_scanner_default".to_string(),
            role: "iris_scanner".to_string(),
            device_hint: "usb:iris".to_string(),
            classification: "SECRET_BIOMETRIC".to_string(),
            pixel_format: Some("GREY".to_string()),
            width: 640,
            height: 480,
            fps_num: 30,
            fps_den: 1,
            layer: 3,
            controls: vec![ControlPreset {
                id: V4L2_CID_EXPOSURE_AUTO,
                value: 1,
            }],
            tempest_control: TempestControl::explicit(V4L2_CID_PRIVACY, [0, 1, 1, 1]),
            meta_device_path: None,
            meta_format: None,
            buffer_count: DEFAULT_BUFFER_COUNT,
        },
        DeviceProfile {
            id: "generic_webcam_default".to_string(),
            role: "generic_webcam".to_string(),
            device_hint: "usb:uvc".to_string(),
            classification: "UNCLASSIFIED".to_string(),
            pixel_format: Some("YUYV".to_string()),
            width: 1280,
            height: 720,
            fps_num: 30,
            fps_den: 1,
            layer: 0,
            controls: Vec::new(),
            tempest_control: TempestControl::auto_detect(),
            meta_device_path: None,
            meta_format: None,
            buffer_count: DEFAULT_BUFFER_COUNT,
        },
        DeviceProfile {
            id: "ir_sensor_default".to_string(),
            role: "ir_sensor".to_string(),
            device_hint: "usb:thermal".to_string(),
            classification: "CONFIDENTIAL".to_string(),
            pixel_format: Some("Y16 ".to_string()),
            width: 320,
            height: 240,
            fps_num: 9,
            fps_den: 1,
            layer: 2,
            controls: Vec::new(),
            tempest_control: TempestControl::auto_detect(),
            meta_device_path: None,
            meta_format: Some(MetadataFormat::IrRadiometric),
            buffer_count: DEFAULT_BUFFER_COUNT,
        },
    ]
}

/// Profile lookup by role against an explicit directory plus the built-ins.
#[derive(Clone, Debug, Default)]
pub struct ProfileRegistry {
    dir: Option<PathBuf>,
    builtins: Vec<DeviceProfile>,
}

impl ProfileRegistry {
    pub fn builtin() -> Self {
        Self {
            dir: None,
            builtins: builtin_profiles(),
        }
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            builtins: builtin_profiles(),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Directory profile first, then built-in. Unknown role is `NotFound`.
    pub fn find_by_role(&self, role: &str) -> GateResult<DeviceProfile> {
        validate_role(role)?;
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{}.json", role));
            if path.exists() {
                return load_profile_file(&path)
                    .map_err(|e| GateError::invalid(format!("{:#}", e)));
            }
        }
        self.builtins
            .iter()
            .find(|p| p.role == role)
            .cloned()
            .ok_or_else(|| GateError::NotFound(format!("no profile for role '{}'", role)))
    }
}

pub fn load_profile_file(path: &Path) -> Result<DeviceProfile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read profile {}", path.display()))?;
    let profile: DeviceProfile = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid profile {}: {}", path.display(), e))?;
    profile
        .validate()
        .map_err(|e| anyhow!("invalid profile {}: {}", path.display(), e))?;
    Ok(profile)
}
