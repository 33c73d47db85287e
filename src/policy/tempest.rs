//! TEMPEST hardware-control discovery and profile mapping.
//!
//! The engine only decides *which* control and *which* value; writing the value
//! to the device belongs to the device I/O layer.

use serde::{Deserialize, Serialize};

use super::TempestState;
use crate::error::{GateError, GateResult};

/// Keywords that mark a device control as emission/privacy related.
pub const TEMPEST_CONTROL_KEYWORDS: [&str; 8] = [
    "tempest",
    "privacy",
    "secure",
    "shutter",
    "led",
    "indicator",
    "emission",
    "lockdown",
];

/// One enumerated device control, in the device's native order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlDescriptor {
    pub id: u32,
    pub name: String,
    pub minimum: i32,
    pub maximum: i32,
    pub default_value: i32,
}

impl ControlDescriptor {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            minimum: 0,
            maximum: 1,
            default_value: 0,
        }
    }
}

pub fn is_tempest_control(name: &str) -> bool {
    let lower = name.to_lowercase();
    TEMPEST_CONTROL_KEYWORDS
        .iter()
        .any(|keyword| lower.contains(keyword))
}

/// First control (in enumeration order) whose name matches a TEMPEST keyword.
pub fn discover_tempest_control<I>(controls: I) -> GateResult<u32>
where
    I: IntoIterator<Item = ControlDescriptor>,
{
    controls
        .into_iter()
        .find(|ctrl| is_tempest_control(&ctrl.name))
        .map(|ctrl| ctrl.id)
        .ok_or_else(|| GateError::NotFound("no TEMPEST-capable control enumerated".to_string()))
}

/// Per-profile TEMPEST control mapping.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempestControl {
    /// Explicit control id; 0 means "none configured".
    #[serde(default)]
    pub control_id: u32,
    #[serde(default)]
    pub disabled_value: i32,
    #[serde(default)]
    pub low_value: i32,
    #[serde(default)]
    pub high_value: i32,
    #[serde(default)]
    pub lockdown_value: i32,
    #[serde(default)]
    pub auto_detect: bool,
}

impl TempestControl {
    pub fn explicit(control_id: u32, values: [i32; 4]) -> Self {
        Self {
            control_id,
            disabled_value: values[0],
            low_value: values[1],
            high_value: values[2],
            lockdown_value: values[3],
            auto_detect: false,
        }
    }

    pub fn auto_detect() -> Self {
        Self {
            auto_detect: true,
            ..Self::default()
        }
    }

    pub fn is_configured(&self) -> bool {
        self.control_id != 0 || self.auto_detect
    }

    pub fn value_for(&self, state: TempestState) -> i32 {
        match state {
            TempestState::Disabled => self.disabled_value,
            TempestState::Low => self.low_value,
            TempestState::High => self.high_value,
            TempestState::Lockdown => self.lockdown_value,
        }
    }

    /// Resolve the control id to drive: explicit id wins, otherwise discovery.
    pub fn resolve<I>(&self, controls: I) -> GateResult<u32>
    where
        I: IntoIterator<Item = ControlDescriptor>,
    {
        if self.control_id != 0 {
            return Ok(self.control_id);
        }
        if self.auto_detect {
            return discover_tempest_control(controls);
        }
        Err(GateError::NotFound(
            "profile has no TEMPEST control mapping".to_string(),
        ))
    }
}
