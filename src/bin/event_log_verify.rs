//! event_log_verify - offline verifier for sensor gate event logs
//!
//! Reads a file-sink event log, either chunked (signed, hash-chained) or plain
//! fixed-size records, and reports what it contains. For chunked logs every
//! signature is checked against the supplied Ed25519 verifying key and the
//! sequence must be gap-free.

use anyhow::{anyhow, Result};
use clap::Parser;

use sensor_gate::telemetry::chunk::{read_chunks, read_records, verify_chunks, verifying_key_from_hex};
use sensor_gate::PayloadView;

#[derive(Parser, Debug)]
#[command(
    name = "event_log_verify",
    about = "Verify a sensor gate event log (chunk chain + signatures)"
)]
struct Args {
    /// Path to the event log written by the file sink
    #[arg(long, default_value = "sensor_gate_events.bin", env = "SENSOR_GATE_EVENT_LOG")]
    log: String,

    /// Verifying key (hex-encoded Ed25519 public key)
    #[arg(long, value_name = "HEX", conflicts_with = "public_key_file")]
    public_key: Option<String>,

    /// Path to file containing a hex-encoded verifying key
    #[arg(long, value_name = "PATH", conflicts_with = "public_key")]
    public_key_file: Option<String>,

    /// Treat the log as plain records instead of chunks
    #[arg(long)]
    raw: bool,

    /// Fail on unsigned chunks
    #[arg(long)]
    require_signatures: bool,

    /// Print every record
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let bytes = std::fs::read(&args.log)
        .map_err(|e| anyhow!("failed to read event log {}: {}", args.log, e))?;
    println!("event_log_verify: checking {} ({} bytes)", args.log, bytes.len());

    if args.raw {
        let events = read_records(&bytes)?;
        if args.verbose {
            for ev in &events {
                print_event(ev);
            }
        }
        println!("OK: {} records (unchunked, no signatures)", events.len());
        return Ok(());
    }

    let key_hex = match (&args.public_key, &args.public_key_file) {
        (Some(hex), _) => hex.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read public key file {}: {}", path, e))?,
        (None, None) => {
            return Err(anyhow!(
                "chunked logs need --public-key or --public-key-file (use --raw for plain logs)"
            ))
        }
    };
    let verifying_key = verifying_key_from_hex(&key_hex)?;

    let chunks = read_chunks(&bytes)?;
    if args.verbose {
        for chunk in &chunks {
            println!(
                "chunk {} ({} records{})",
                chunk.sequence,
                chunk.events.len(),
                if chunk.is_unsigned() { ", unsigned" } else { "" }
            );
            for ev in &chunk.events {
                print_event(ev);
            }
        }
    }
    let report = verify_chunks(&chunks, &verifying_key, args.require_signatures)?;
    if report.unsigned > 0 {
        log::warn!("{} chunk(s) carry no signature", report.unsigned);
    }
    println!(
        "OK: {} chunks, {} records, {} unsigned",
        report.chunks, report.records, report.unsigned
    );
    Ok(())
}

fn print_event(ev: &sensor_gate::Event) {
    let detail = match ev.payload.view() {
        PayloadView::None => String::new(),
        PayloadView::Transition { old, new } => format!(" {} -> {}", old.as_str(), new.as_str()),
        PayloadView::Context(label) => format!(" [{}]", label),
        PayloadView::Aux(v) => format!(" aux={}", v),
        PayloadView::Raw(bytes) => format!(" raw={}", hex::encode(bytes)),
    };
    println!(
        "  {:>20} dev={:<4} {:<18} {:<8}{}",
        ev.timestamp_ns,
        ev.device_id,
        ev.kind.as_str(),
        ev.severity.as_str(),
        detail
    );
}
