//! Ring + sink set + background flush worker for one initialized runtime.

use anyhow::{Context, Result};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::chunk::{encode_records, ChunkChain, ChunkSigner, SIGNATURE_LEN};
use super::ring::{EventRing, DEFAULT_CAPACITY};
use super::sink::{ChunkFrame, EventBatch, EventSink};
use super::{Stats, TelemetryProfile};
use crate::event::{Event, Severity};

/// Events handed to sinks per batch (one chunk per batch when framing).
const MAX_BATCH: usize = 512;

enum Signal {
    Wake,
    Stop,
}

/// Result of a (possibly bounded) drain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Events removed from the ring.
    pub drained: usize,
    /// Events handed to sinks after profile filtering.
    pub delivered: usize,
    /// False when a deadline expired before the readable events were drained.
    pub complete: bool,
}

struct Delivery {
    sinks: Vec<Box<dyn EventSink>>,
    chain: Option<ChunkChain>,
    signer: Option<Arc<dyn ChunkSigner>>,
    scratch: Vec<Event>,
}

impl Delivery {
    fn deliver(&mut self, events: &[Event], stats: &Stats) {
        let mut signature = [0u8; SIGNATURE_LEN];
        let mut chain_digest = [0u8; 32];
        let sequence = match self.chain.as_mut() {
            Some(chain) => {
                let records = encode_records(events);
                let seq = chain.next_sequence();
                let input = chain.signing_input(seq, &records);
                if let Some(signer) = &self.signer {
                    match signer.sign(&input) {
                        Ok(sig) => signature = sig,
                        Err(e) => {
                            stats.sink_errors.fetch_add(1, Ordering::Relaxed);
                            log::warn!("telemetry chunk {} signing failed: {:#}", seq, e);
                        }
                    }
                }
                chain.advance(&input);
                chain_digest = chain.head_digest();
                Some(seq)
            }
            None => None,
        };
        let batch = EventBatch {
            events,
            chunk: sequence.map(|sequence| ChunkFrame {
                sequence,
                signature: &signature,
                chain_digest: &chain_digest,
            }),
        };
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.write_batch(&batch) {
                stats.sink_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("telemetry sink {} write failed: {:#}", sink.name(), e);
            }
        }
        stats
            .events_flushed
            .fetch_add(events.len() as u64, Ordering::Relaxed);
    }

    fn flush_sinks(&mut self, stats: &Stats) {
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.flush() {
                stats.sink_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("telemetry sink {} flush failed: {:#}", sink.name(), e);
            }
        }
    }
}

pub(crate) struct PipelineParts {
    pub profile: TelemetryProfile,
    pub flush_interval: Duration,
    pub background: bool,
    pub chunked: bool,
    pub sinks: Vec<Box<dyn EventSink>>,
    pub signer: Option<Arc<dyn ChunkSigner>>,
}

pub(crate) struct Pipeline {
    ring: EventRing,
    stats: Arc<Stats>,
    min_severity: Option<Severity>,
    high_water: usize,
    delivery: Mutex<Delivery>,
    wake: Option<SyncSender<Signal>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    pub(crate) fn start(parts: PipelineParts, stats: Arc<Stats>) -> Result<Arc<Self>> {
        let mut sinks = parts.sinks;
        let chunked = parts.chunked || parts.signer.is_some();
        let chain = if chunked {
            Some(resume_chain(&mut sinks)?)
        } else {
            None
        };
        let ring = EventRing::new(DEFAULT_CAPACITY);
        let high_water = ring.capacity() / 4 * 3;
        let delivery = Delivery {
            sinks,
            chain,
            signer: parts.signer,
            scratch: Vec::with_capacity(MAX_BATCH),
        };

        let (wake, rx) = if parts.background {
            let (tx, rx) = mpsc::sync_channel(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let pipeline = Arc::new(Self {
            ring,
            stats,
            min_severity: parts.profile.min_severity(),
            high_water,
            delivery: Mutex::new(delivery),
            wake,
            worker: Mutex::new(None),
        });

        if let Some(rx) = rx {
            let worker_pipeline = pipeline.clone();
            let interval = parts.flush_interval;
            let handle = std::thread::spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                    Ok(Signal::Wake) | Err(RecvTimeoutError::Timeout) => {
                        worker_pipeline.drain(None);
                    }
                }
            });
            *lock(&pipeline.worker) = Some(handle);
        }

        log::info!(
            "telemetry pipeline started (profile={}, capacity={}, interval={:?}, chunked={})",
            parts.profile.as_str(),
            pipeline.ring.capacity(),
            parts.flush_interval,
            chunked
        );
        Ok(pipeline)
    }

    pub(crate) fn usage(&self) -> usize {
        self.ring.len()
    }

    /// Non-blocking submission. Never touches a sink.
    pub(crate) fn submit(&self, event: Event) {
        if self.min_severity.is_none() {
            self.stats.events_filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match self.ring.push(event) {
            Some(occupancy) => {
                self.stats.events_emitted.fetch_add(1, Ordering::Relaxed);
                if occupancy >= self.high_water {
                    if let Some(wake) = &self.wake {
                        // A pending wake already covers this one.
                        let _ = wake.try_send(Signal::Wake);
                    }
                }
            }
            None => {
                self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Drain the events readable at call time to the sinks in FIFO order.
    ///
    /// With a deadline the drain is best-effort and may stop early.
    pub(crate) fn drain(&self, deadline: Option<Instant>) -> FlushReport {
        let mut delivery = lock(&self.delivery);
        let target = self.ring.len();
        let mut report = FlushReport {
            complete: true,
            ..FlushReport::default()
        };
        while report.drained < target {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                report.complete = false;
                break;
            }
            let mut batch = std::mem::take(&mut delivery.scratch);
            batch.clear();
            let want = (target - report.drained).min(MAX_BATCH);
            let n = self.ring.drain_into(&mut batch, want);
            if n == 0 {
                delivery.scratch = batch;
                break;
            }
            report.drained += n;
            if let Some(min) = self.min_severity {
                batch.retain(|ev| ev.severity >= min);
            }
            let filtered = n - batch.len();
            if filtered > 0 {
                self.stats
                    .events_filtered
                    .fetch_add(filtered as u64, Ordering::Relaxed);
            }
            if !batch.is_empty() {
                delivery.deliver(&batch, &self.stats);
                report.delivered += batch.len();
            }
            delivery.scratch = batch;
        }
        if report.drained > 0 {
            delivery.flush_sinks(&self.stats);
        }
        report
    }

    /// Stop the worker and run the final drain.
    pub(crate) fn stop(&self) -> FlushReport {
        if let Some(wake) = &self.wake {
            // Blocks only until the worker frees the single channel slot.
            let _ = wake.send(Signal::Stop);
        }
        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                log::warn!("telemetry flush worker panicked");
            }
        }
        let report = self.drain(None);
        log::info!(
            "telemetry pipeline stopped (final drain {} events, {} delivered)",
            report.drained,
            report.delivered
        );
        report
    }
}

/// Pick up the chunk chain where the most advanced durable sink left it.
fn resume_chain(sinks: &mut [Box<dyn EventSink>]) -> Result<ChunkChain> {
    let mut head: Option<ChunkChain> = None;
    for sink in sinks.iter_mut() {
        let Some(found) = sink
            .resume_chain()
            .with_context(|| format!("failed to resume chunk chain from {} sink", sink.name()))?
        else {
            continue;
        };
        let replace = match &head {
            None => true,
            Some(current) if current.next_sequence() == found.next_sequence() => {
                if current.head_digest() != found.head_digest() {
                    log::warn!(
                        "telemetry {} sink chain head diverges at sequence {}",
                        sink.name(),
                        found.next_sequence()
                    );
                }
                false
            }
            Some(current) => {
                log::warn!(
                    "telemetry sinks disagree on chain head ({} vs {}); continuing from the later one",
                    current.next_sequence(),
                    found.next_sequence()
                );
                found.next_sequence() > current.next_sequence()
            }
        };
        if replace {
            head = Some(found);
        }
    }
    if let Some(chain) = &head {
        log::info!(
            "telemetry chunk chain resumed at sequence {}",
            chain.next_sequence()
        );
    }
    Ok(head.unwrap_or_default())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
