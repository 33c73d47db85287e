use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use sensor_gate::config::GateConfig;
use sensor_gate::telemetry::{ChunkSigner, Ed25519ChunkSigner, SinkSpec};
use sensor_gate::{TelemetryProfile, ThreatLevel};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SENSOR_GATE_CONFIG",
        "SENSOR_GATE_PROFILE",
        "SENSOR_GATE_FLUSH_MS",
        "SENSOR_GATE_EVENT_LOG",
        "SENSOR_GATE_THREAT_LEVEL",
        "SENSOR_GATE_PROFILE_DIR",
        "SENSOR_GATE_SIGNING_SEED",
        "SENSOR_GATE_SIGNING_SEED_PATH",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let cfg = GateConfig::load().expect("load defaults");
    assert_eq!(cfg.telemetry.profile, TelemetryProfile::Ops);
    assert_eq!(cfg.telemetry.flush_interval, Duration::from_secs(1));
    assert!(cfg.telemetry.event_log.is_some());
    assert_eq!(cfg.threat_level, ThreatLevel::Normal);
    assert!(cfg.profile_dir.is_none());
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "telemetry": {
            "profile": "exercise",
            "flush_interval_ms": 250,
            "sqlite_path": "telemetry.db",
            "mqtt": { "host": "broker.local", "topic": "site/a/events" }
        },
        "policy": { "threat_level": "BRAVO" },
        "profiles": { "dir": "/etc/sensor_gate/profiles" }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("SENSOR_GATE_CONFIG", file.path());
    std::env::set_var("SENSOR_GATE_FLUSH_MS", "500");
    std::env::set_var("SENSOR_GATE_THREAT_LEVEL", "THREATCON_DELTA");

    let cfg = GateConfig::load().expect("load config");
    assert_eq!(cfg.telemetry.profile, TelemetryProfile::Exercise);
    assert_eq!(cfg.telemetry.flush_interval, Duration::from_millis(500));
    assert!(cfg.telemetry.event_log.is_none());
    assert_eq!(cfg.telemetry.sqlite_path.as_deref(), Some("telemetry.db"));
    let mqtt = cfg.telemetry.mqtt.as_ref().expect("mqtt sink");
    assert_eq!(mqtt.host, "broker.local");
    assert_eq!(mqtt.port, 1883);
    assert_eq!(mqtt.topic, "site/a/events");
    assert_eq!(cfg.threat_level, ThreatLevel::Delta);
    assert_eq!(
        cfg.profile_dir.as_deref(),
        Some(std::path::Path::new("/etc/sensor_gate/profiles"))
    );

    let runtime = cfg.telemetry_config(None).expect("runtime config");
    assert_eq!(runtime.sinks.len(), 2);
    assert!(matches!(runtime.sinks[0], SinkSpec::Sqlite(_)));

    clear_env();
}

#[test]
fn loads_toml_file() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
[telemetry]
profile = "forensic"
sign_batches = true
event_log = "/var/log/sensor_gate/events.bin"

[policy]
threat_level = "charlie"
"#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");
    std::env::set_var("SENSOR_GATE_CONFIG", file.path());

    let cfg = GateConfig::load().expect("load toml config");
    assert_eq!(cfg.telemetry.profile, TelemetryProfile::Forensic);
    assert!(cfg.telemetry.sign_batches);
    assert_eq!(cfg.threat_level, ThreatLevel::Charlie);

    assert!(cfg.telemetry_config(None).is_err());
    let signer: Arc<dyn ChunkSigner> =
        Arc::new(Ed25519ChunkSigner::from_seed("devkey:config").unwrap());
    let runtime = cfg.telemetry_config(Some(signer)).expect("runtime config");
    assert!(runtime.chunked);
    assert!(runtime.signer.is_some());

    clear_env();
}

#[test]
fn signing_seed_comes_from_env_or_file() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let mut seed_file = NamedTempFile::new().expect("temp seed");
    std::io::Write::write_all(&mut seed_file, b"devkey:from_file\n").expect("write seed");
    std::env::set_var("SENSOR_GATE_PROFILE", "forensic");
    std::env::set_var("SENSOR_GATE_SIGNING_SEED_PATH", seed_file.path());

    // Forensic still needs sign_batches from the file layer.
    assert!(GateConfig::load().is_err());

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    std::io::Write::write_all(&mut file, b"[telemetry]\nsign_batches = true\n")
        .expect("write config");
    std::env::set_var("SENSOR_GATE_CONFIG", file.path());

    let cfg = GateConfig::load().expect("load config");
    assert_eq!(cfg.telemetry.signing_seed_path.as_deref(), Some(seed_file.path()));
    let from_file = cfg.configured_signer().unwrap().expect("file signer");
    let expected = Ed25519ChunkSigner::from_seed("devkey:from_file").unwrap();
    assert_eq!(from_file.verifying_key(), expected.verifying_key());
    let runtime = cfg.telemetry_config(None).expect("runtime config");
    assert!(runtime.signer.is_some());

    std::env::set_var("SENSOR_GATE_SIGNING_SEED", "devkey:from_env");
    let from_env = cfg.configured_signer().unwrap().expect("env signer");
    let expected = Ed25519ChunkSigner::from_seed("devkey:from_env").unwrap();
    assert_eq!(from_env.verifying_key(), expected.verifying_key());

    std::env::remove_var("SENSOR_GATE_SIGNING_SEED");
    std::fs::write(seed_file.path(), "  \n").expect("blank seed");
    assert!(cfg.configured_signer().is_err());

    clear_env();
}

#[test]
fn rejects_invalid_settings() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    std::env::set_var("SENSOR_GATE_FLUSH_MS", "0");
    assert!(GateConfig::load().is_err());
    clear_env();

    std::env::set_var("SENSOR_GATE_PROFILE", "forensic");
    let err = GateConfig::load().unwrap_err();
    assert!(err.to_string().contains("sign_batches"));
    clear_env();

    std::env::set_var("SENSOR_GATE_PROFILE", "loud");
    assert!(GateConfig::load().is_err());
    clear_env();

    std::env::set_var("SENSOR_GATE_THREAT_LEVEL", "OMEGA");
    assert!(GateConfig::load().is_err());
    clear_env();

    std::env::set_var("SENSOR_GATE_FLUSH_MS", "soon");
    let err = GateConfig::load().unwrap_err();
    assert!(err.to_string().contains("SENSOR_GATE_FLUSH_MS"));
    clear_env();
}
