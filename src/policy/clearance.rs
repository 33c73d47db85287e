use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::GateError;

pub const CLEARANCE_ENV_VAR: &str = "SENSOR_GATE_CLEARANCE";

const BIOMETRIC_SUFFIX: &str = "_BIOMETRIC";

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClearanceLevel {
    #[default]
    Unclassified,
    Confidential,
    Secret,
    TopSecret,
}

impl ClearanceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClearanceLevel::Unclassified => "UNCLASSIFIED",
            ClearanceLevel::Confidential => "CONFIDENTIAL",
            ClearanceLevel::Secret => "SECRET",
            ClearanceLevel::TopSecret => "TOP_SECRET",
        }
    }
}

impl FromStr for ClearanceLevel {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace(' ', "_").as_str() {
            "UNCLASSIFIED" => Ok(ClearanceLevel::Unclassified),
            "CONFIDENTIAL" => Ok(ClearanceLevel::Confidential),
            "SECRET" => Ok(ClearanceLevel::Secret),
            "TOP_SECRET" => Ok(ClearanceLevel::TopSecret),
            other => Err(GateError::invalid(format!(
                "unknown clearance level '{}'",
                other
            ))),
        }
    }
}

/// A device classification: a clearance level, optionally biometric-qualified
/// (`SECRET_BIOMETRIC`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Classification {
    pub level: ClearanceLevel,
    pub biometric: bool,
}

impl Classification {
    pub fn parse(raw: &str) -> Result<Self, GateError> {
        let upper = raw.trim().to_ascii_uppercase();
        let (base, biometric) = match upper.strip_suffix(BIOMETRIC_SUFFIX) {
            Some(base) => (base, true),
            None => (upper.as_str(), false),
        };
        let level = base.parse::<ClearanceLevel>().map_err(|_| {
            GateError::invalid(format!("unknown classification '{}'", raw.trim()))
        })?;
        Ok(Self { level, biometric })
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.biometric {
            write!(f, "{}{}", self.level.as_str(), BIOMETRIC_SUFFIX)
        } else {
            f.write_str(self.level.as_str())
        }
    }
}

/// Where the calling principal's clearance comes from. Read once per engine.
pub trait ClearanceSource: Send + Sync {
    fn clearance(&self) -> ClearanceLevel;
}

#[derive(Clone, Copy, Debug)]
pub struct FixedClearance(pub ClearanceLevel);

impl ClearanceSource for FixedClearance {
    fn clearance(&self) -> ClearanceLevel {
        self.0
    }
}

/// Reads the clearance from an environment variable. Unset or unparseable
/// values fail closed to UNCLASSIFIED.
#[derive(Clone, Debug)]
pub struct EnvClearance {
    var: String,
}

impl EnvClearance {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvClearance {
    fn default() -> Self {
        Self::new(CLEARANCE_ENV_VAR)
    }
}

impl ClearanceSource for EnvClearance {
    fn clearance(&self) -> ClearanceLevel {
        match std::env::var(&self.var) {
            Ok(raw) if !raw.trim().is_empty() => match raw.parse() {
                Ok(level) => level,
                Err(e) => {
                    log::warn!("{} ignored ({}); using UNCLASSIFIED", self.var, e);
                    ClearanceLevel::Unclassified
                }
            },
            _ => ClearanceLevel::Unclassified,
        }
    }
}
