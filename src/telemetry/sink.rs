//! Durable destinations for flushed telemetry batches.
//!
//! A sink failure is reported back to the pipeline, which counts it and logs it;
//! it is never propagated to event producers.

use anyhow::{anyhow, Context, Result};
use rumqttc::{Client, Connection, Event as MqttEvent, MqttOptions, QoS};
use rusqlite::{params, Connection as SqliteConnection, OptionalExtension};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;

use super::chunk::{encode_chunk, encode_records, read_chunks, ChunkChain, SIGNATURE_LEN};
use crate::event::{Event, PayloadView};

/// One flushed batch, optionally framed as a signed chunk.
#[derive(Clone, Copy, Debug)]
pub struct EventBatch<'a> {
    pub events: &'a [Event],
    pub chunk: Option<ChunkFrame<'a>>,
}

#[derive(Clone, Copy, Debug)]
pub struct ChunkFrame<'a> {
    pub sequence: u64,
    pub signature: &'a [u8; SIGNATURE_LEN],
    /// SHA-256 of this chunk's signing input (the next chunk's `prev_digest`).
    pub chain_digest: &'a [u8; 32],
}

pub trait EventSink: Send {
    fn name(&self) -> &str;
    fn write_batch(&mut self, batch: &EventBatch<'_>) -> Result<()>;
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
    /// Chain head left by an earlier run, for sinks that persist chunks.
    fn resume_chain(&mut self) -> Result<Option<ChunkChain>> {
        Ok(None)
    }
}

// -------------------- File --------------------

/// Append-only binary file of fixed-size records (or signed chunks).
pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl FileSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create event log directory {}", parent.display())
                })?;
            }
        }
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options
            .open(&path)
            .with_context(|| format!("failed to open event log {}", path.display()))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    fn write_batch(&mut self, batch: &EventBatch<'_>) -> Result<()> {
        let records = encode_records(batch.events);
        match batch.chunk {
            Some(frame) => self
                .writer
                .write_all(&encode_chunk(frame.sequence, frame.signature, &records))?,
            None => self.writer.write_all(&records)?,
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    fn resume_chain(&mut self) -> Result<Option<ChunkChain>> {
        self.writer.flush()?;
        let bytes = std::fs::read(&self.path)
            .with_context(|| format!("failed to read event log {}", self.path.display()))?;
        if bytes.is_empty() {
            return Ok(None);
        }
        let chunks = read_chunks(&bytes).map_err(|e| {
            anyhow!(
                "existing event log {} is not a chunk stream: {}",
                self.path.display(),
                e
            )
        })?;
        Ok(Some(ChunkChain::replay(&chunks)))
    }
}

// -------------------- SQLite --------------------

pub struct SqliteSink {
    conn: SqliteConnection,
}

impl SqliteSink {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = SqliteConnection::open(db_path)
            .with_context(|| format!("failed to open telemetry db {}", db_path))?;
        let mut sink = Self { conn };
        sink.ensure_schema()?;
        Ok(sink)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS telemetry_chunks (
              sequence INTEGER PRIMARY KEY,
              record_count INTEGER NOT NULL,
              signature BLOB NOT NULL,
              chain_digest BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS telemetry_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              chunk_sequence INTEGER,
              device_id INTEGER NOT NULL,
              kind TEXT NOT NULL,
              severity TEXT NOT NULL,
              timestamp_ns INTEGER NOT NULL,
              payload BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_telemetry_device ON telemetry_events(device_id);
            "#,
        )?;
        Ok(())
    }

    pub fn event_count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM telemetry_events", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

impl EventSink for SqliteSink {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn write_batch(&mut self, batch: &EventBatch<'_>) -> Result<()> {
        let tx = self.conn.transaction()?;
        let chunk_sequence = match batch.chunk {
            Some(frame) => {
                let seq = i64::try_from(frame.sequence)
                    .map_err(|_| anyhow!("chunk sequence exceeds i64 range"))?;
                tx.execute(
                    r#"
                    INSERT INTO telemetry_chunks(sequence, record_count, signature, chain_digest)
                    VALUES (?1, ?2, ?3, ?4)
                    "#,
                    params![
                        seq,
                        batch.events.len() as i64,
                        frame.signature.to_vec(),
                        frame.chain_digest.to_vec()
                    ],
                )?;
                Some(seq)
            }
            None => None,
        };
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO telemetry_events(chunk_sequence, device_id, kind, severity, timestamp_ns, payload)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )?;
            for ev in batch.events {
                stmt.execute(params![
                    chunk_sequence,
                    ev.device_id as i64,
                    ev.kind.as_str(),
                    ev.severity.as_str(),
                    i64::try_from(ev.timestamp_ns).unwrap_or(i64::MAX),
                    ev.payload.as_bytes().to_vec(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn resume_chain(&mut self) -> Result<Option<ChunkChain>> {
        let head: Option<(i64, Vec<u8>)> = self
            .conn
            .query_row(
                "SELECT sequence, chain_digest FROM telemetry_chunks ORDER BY sequence DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((sequence, digest)) = head else {
            return Ok(None);
        };
        let digest: [u8; 32] = digest
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("stored chain digest for chunk {} is malformed", sequence))?;
        let next = u64::try_from(sequence)
            .map_err(|_| anyhow!("stored chunk sequence {} is negative", sequence))?
            .saturating_add(1);
        Ok(Some(ChunkChain::resume(next, digest)))
    }
}

// -------------------- MQTT --------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttSinkConfig {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
}

impl Default for MqttSinkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            topic: "sensor_gate/events".to_string(),
            client_id: "sensor_gate".to_string(),
        }
    }
}

#[derive(Serialize)]
struct MqttEventPayload<'a> {
    device_id: u32,
    kind: &'a str,
    severity: &'a str,
    timestamp_ns: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[derive(Serialize)]
struct MqttBatchPayload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    chunk_sequence: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
    events: Vec<MqttEventPayload<'a>>,
}

/// Publishes each batch as one JSON message (QoS 1).
pub struct MqttSink {
    client: Client,
    topic: String,
    _connection: JoinHandle<()>,
}

impl MqttSink {
    pub fn connect(cfg: &MqttSinkConfig) -> Result<Self> {
        let mut options = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
        options.set_keep_alive(Duration::from_secs(60));
        let (client, connection) = Client::new(options, 64);
        let handle = spawn_connection_loop(connection);
        log::info!("telemetry mqtt sink publishing to {}:{}/{}", cfg.host, cfg.port, cfg.topic);
        Ok(Self {
            client,
            topic: cfg.topic.clone(),
            _connection: handle,
        })
    }
}

fn spawn_connection_loop(mut connection: Connection) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for event in connection.iter() {
            match event {
                Ok(MqttEvent::Incoming(_)) | Ok(MqttEvent::Outgoing(_)) => {}
                Err(e) => {
                    log::warn!("telemetry mqtt connection error: {}", e);
                    break;
                }
            }
        }
    })
}

pub(crate) fn batch_json(batch: &EventBatch<'_>) -> Result<Vec<u8>> {
    let events = batch
        .events
        .iter()
        .map(|ev| MqttEventPayload {
            device_id: ev.device_id,
            kind: ev.kind.as_str(),
            severity: ev.severity.as_str(),
            timestamp_ns: ev.timestamp_ns,
            detail: match ev.payload.view() {
                PayloadView::None => None,
                PayloadView::Transition { old, new } => {
                    Some(format!("{}->{}", old.as_str(), new.as_str()))
                }
                PayloadView::Context(label) => Some(label),
                PayloadView::Aux(v) => Some(v.to_string()),
                PayloadView::Raw(bytes) => Some(hex::encode(bytes)),
            },
        })
        .collect();
    let payload = MqttBatchPayload {
        chunk_sequence: batch.chunk.map(|c| c.sequence),
        signature: batch.chunk.map(|c| hex::encode(c.signature)),
        events,
    };
    Ok(serde_json::to_vec(&payload)?)
}

impl EventSink for MqttSink {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn write_batch(&mut self, batch: &EventBatch<'_>) -> Result<()> {
        let payload = batch_json(batch)?;
        self.client
            .try_publish(self.topic.clone(), QoS::AtLeastOnce, false, payload)
            .map_err(|e| anyhow!("mqtt publish failed: {}", e))?;
        Ok(())
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        // The connection thread exits on the resulting disconnect error.
        if let Err(e) = self.client.disconnect() {
            log::debug!("telemetry mqtt disconnect failed: {}", e);
        }
    }
}

// -------------------- Callback --------------------

type BatchCallback = Box<dyn FnMut(&EventBatch<'_>) -> Result<()> + Send>;

/// In-process sink invoking a caller-supplied closure per batch.
pub struct CallbackSink {
    callback: BatchCallback,
}

impl CallbackSink {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnMut(&EventBatch<'_>) -> Result<()> + Send + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl EventSink for CallbackSink {
    fn name(&self) -> &str {
        "callback"
    }

    fn write_batch(&mut self, batch: &EventBatch<'_>) -> Result<()> {
        (self.callback)(batch)
    }
}
