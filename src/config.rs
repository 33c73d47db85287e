use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::policy::ThreatLevel;
use crate::profile::ProfileRegistry;
use crate::telemetry::{
    ChunkSigner, Ed25519ChunkSigner, MqttSinkConfig, SinkSpec, TelemetryConfig, TelemetryProfile,
};

pub const CONFIG_ENV_VAR: &str = "SENSOR_GATE_CONFIG";
/// Chunk signing seed; takes precedence over `telemetry.signing_seed_path`.
pub const SIGNING_SEED_ENV_VAR: &str = "SENSOR_GATE_SIGNING_SEED";

const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1000;
const DEFAULT_EVENT_LOG: &str = "sensor_gate_events.bin";
const DEFAULT_MQTT_HOST: &str = "127.0.0.1";
const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_MQTT_TOPIC: &str = "sensor_gate/events";
const DEFAULT_MQTT_CLIENT_ID: &str = "sensor_gate";

#[derive(Debug, Deserialize, Default)]
struct GateConfigFile {
    telemetry: Option<TelemetryConfigFile>,
    policy: Option<PolicyConfigFile>,
    profiles: Option<ProfilesConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct TelemetryConfigFile {
    profile: Option<String>,
    flush_interval_ms: Option<u64>,
    sign_batches: Option<bool>,
    signing_seed_path: Option<PathBuf>,
    event_log: Option<PathBuf>,
    sqlite_path: Option<String>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    host: Option<String>,
    port: Option<u16>,
    topic: Option<String>,
    client_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PolicyConfigFile {
    threat_level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ProfilesConfigFile {
    dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub telemetry: TelemetrySettings,
    pub threat_level: ThreatLevel,
    pub profile_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    pub profile: TelemetryProfile,
    pub flush_interval: Duration,
    pub sign_batches: bool,
    /// File holding the chunk signing seed.
    pub signing_seed_path: Option<PathBuf>,
    pub event_log: Option<PathBuf>,
    pub sqlite_path: Option<String>,
    pub mqtt: Option<MqttSinkConfig>,
}

impl GateConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_ENV_VAR).ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GateConfigFile) -> Result<Self> {
        let tele = file.telemetry.unwrap_or_default();
        let profile = match tele.profile.as_deref() {
            Some(raw) => raw.parse::<TelemetryProfile>()?,
            None => TelemetryProfile::default(),
        };
        let event_log = match (tele.event_log, tele.sqlite_path.is_some(), tele.mqtt.is_some()) {
            (Some(path), _, _) => Some(path),
            (None, false, false) => Some(PathBuf::from(DEFAULT_EVENT_LOG)),
            (None, _, _) => None,
        };
        let mqtt = tele.mqtt.map(|m| MqttSinkConfig {
            host: m.host.unwrap_or_else(|| DEFAULT_MQTT_HOST.to_string()),
            port: m.port.unwrap_or(DEFAULT_MQTT_PORT),
            topic: m.topic.unwrap_or_else(|| DEFAULT_MQTT_TOPIC.to_string()),
            client_id: m
                .client_id
                .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
        });
        let telemetry = TelemetrySettings {
            profile,
            flush_interval: Duration::from_millis(
                tele.flush_interval_ms.unwrap_or(DEFAULT_FLUSH_INTERVAL_MS),
            ),
            sign_batches: tele.sign_batches.unwrap_or(false),
            signing_seed_path: tele.signing_seed_path,
            event_log,
            sqlite_path: tele.sqlite_path,
            mqtt,
        };
        let threat_level = match file.policy.and_then(|p| p.threat_level) {
            Some(raw) => raw.parse::<ThreatLevel>()?,
            None => ThreatLevel::Normal,
        };
        Ok(Self {
            telemetry,
            threat_level,
            profile_dir: file.profiles.and_then(|p| p.dir),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(profile) = std::env::var("SENSOR_GATE_PROFILE") {
            if !profile.trim().is_empty() {
                self.telemetry.profile = profile.parse()?;
            }
        }
        if let Ok(ms) = std::env::var("SENSOR_GATE_FLUSH_MS") {
            let ms: u64 = ms.trim().parse().map_err(|_| {
                anyhow!("SENSOR_GATE_FLUSH_MS must be an integer number of milliseconds")
            })?;
            self.telemetry.flush_interval = Duration::from_millis(ms);
        }
        if let Ok(path) = std::env::var("SENSOR_GATE_EVENT_LOG") {
            if !path.trim().is_empty() {
                self.telemetry.event_log = Some(PathBuf::from(path));
            }
        }
        if let Ok(path) = std::env::var("SENSOR_GATE_SIGNING_SEED_PATH") {
            if !path.trim().is_empty() {
                self.telemetry.signing_seed_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(level) = std::env::var("SENSOR_GATE_THREAT_LEVEL") {
            if !level.trim().is_empty() {
                self.threat_level = level.parse()?;
            }
        }
        if let Ok(dir) = std::env::var("SENSOR_GATE_PROFILE_DIR") {
            if !dir.trim().is_empty() {
                self.profile_dir = Some(PathBuf::from(dir));
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.telemetry.flush_interval.is_zero() {
            return Err(anyhow!("telemetry flush interval must be greater than zero"));
        }
        if self.telemetry.profile == TelemetryProfile::Forensic && !self.telemetry.sign_batches {
            return Err(anyhow!("forensic telemetry profile requires sign_batches"));
        }
        let has_sink = self.telemetry.event_log.is_some()
            || self.telemetry.sqlite_path.is_some()
            || self.telemetry.mqtt.is_some();
        if self.telemetry.profile != TelemetryProfile::Off && !has_sink {
            return Err(anyhow!("at least one telemetry sink must be configured"));
        }
        Ok(())
    }

    /// Ed25519 signer from `SENSOR_GATE_SIGNING_SEED` or the configured seed
    /// file. `None` when neither is set.
    pub fn configured_signer(&self) -> Result<Option<Ed25519ChunkSigner>> {
        if let Ok(seed) = std::env::var(SIGNING_SEED_ENV_VAR) {
            let seed = Zeroizing::new(seed);
            if !seed.trim().is_empty() {
                return Ed25519ChunkSigner::from_seed(&seed).map(Some);
            }
        }
        let Some(path) = &self.telemetry.signing_seed_path else {
            return Ok(None);
        };
        let seed = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
            anyhow!("failed to read signing seed file {}: {}", path.display(), e)
        })?);
        Ed25519ChunkSigner::from_seed(&seed)
            .map(Some)
            .map_err(|e| anyhow!("signing seed file {}: {}", path.display(), e))
    }

    /// Runtime configuration for `Telemetry::init`. With `sign_batches` set, an
    /// explicit `signer` wins over the configured seed; one of them is required.
    pub fn telemetry_config(&self, signer: Option<Arc<dyn ChunkSigner>>) -> Result<TelemetryConfig> {
        let signer = match signer {
            Some(signer) => Some(signer),
            None if self.telemetry.sign_batches => self
                .configured_signer()?
                .map(|s| Arc::new(s) as Arc<dyn ChunkSigner>),
            None => None,
        };
        if self.telemetry.sign_batches && signer.is_none() {
            return Err(anyhow!(
                "sign_batches is set but no signing backend was supplied (set {} or telemetry.signing_seed_path)",
                SIGNING_SEED_ENV_VAR
            ));
        }
        let mut sinks = Vec::new();
        if let Some(path) = &self.telemetry.event_log {
            sinks.push(SinkSpec::File(path.clone()));
        }
        if let Some(path) = &self.telemetry.sqlite_path {
            sinks.push(SinkSpec::Sqlite(path.clone()));
        }
        if let Some(mqtt) = &self.telemetry.mqtt {
            sinks.push(SinkSpec::Mqtt(mqtt.clone()));
        }
        Ok(TelemetryConfig {
            profile: self.telemetry.profile,
            flush_interval: self.telemetry.flush_interval,
            background: true,
            chunked: self.telemetry.sign_batches,
            sinks,
            signer: if self.telemetry.sign_batches { signer } else { None },
        })
    }

    pub fn profile_registry(&self) -> ProfileRegistry {
        match &self.profile_dir {
            Some(dir) => ProfileRegistry::with_dir(dir),
            None => ProfileRegistry::builtin(),
        }
    }
}

fn read_config_file(path: &Path) -> Result<GateConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
