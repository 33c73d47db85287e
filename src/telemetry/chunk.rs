//! Signed chunk framing for flushed telemetry batches.
//!
//! ```text
//! chunk := sequence (u64 LE) | signature (256 bytes) | record_count (u32 LE) | records
//! ```
//!
//! The signature covers a domain-separated, hash-chained signing input:
//! `DOMAIN | prev_digest | sequence | record_count | records`, where
//! `prev_digest` is the SHA-256 of the previous chunk's signing input (zeros for
//! the first chunk). Dropping, reordering or editing a chunk therefore breaks
//! every later signature. Without a signer the signature block is zero-filled
//! and the chunk is still written.

use anyhow::{anyhow, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::{GateError, GateResult};
use crate::event::{Event, RECORD_LEN};

pub const SIGNATURE_LEN: usize = 256;
pub const CHUNK_HEADER_LEN: usize = 8 + SIGNATURE_LEN + 4;

pub const DOMAIN_EVENT_CHUNK: &str = "sensor-gate:event-chunk:v1";
pub const ED25519_SCHEME_ID: &str = "ed25519";

/// Upper bound on records per chunk accepted by the reader.
const MAX_CHUNK_RECORDS: usize = 1 << 20;

/// External signing backend. Produces a fixed-size signature block.
pub trait ChunkSigner: Send + Sync {
    fn scheme(&self) -> &str;
    fn sign(&self, bytes: &[u8]) -> Result<[u8; SIGNATURE_LEN]>;
}

/// Ed25519 backend; the 64-byte signature is zero-padded into the block.
pub struct Ed25519ChunkSigner {
    key: SigningKey,
}

impl Ed25519ChunkSigner {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// Derive the key from a seed string (SHA-256 of the trimmed seed).
    pub fn from_seed(seed: &str) -> Result<Self> {
        let trimmed = seed.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("signing seed is required"));
        }
        let mut digest: [u8; 32] = Sha256::digest(trimmed.as_bytes()).into();
        let key = SigningKey::from_bytes(&digest);
        digest.zeroize();
        Ok(Self { key })
    }

    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Self { key }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl ChunkSigner for Ed25519ChunkSigner {
    fn scheme(&self) -> &str {
        ED25519_SCHEME_ID
    }

    fn sign(&self, bytes: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
        let sig = self.key.sign(bytes).to_bytes();
        let mut block = [0u8; SIGNATURE_LEN];
        block[..sig.len()].copy_from_slice(&sig);
        Ok(block)
    }
}

/// Running sequence number and hash-chain head.
#[derive(Clone, Debug, Default)]
pub struct ChunkChain {
    next_sequence: u64,
    prev_digest: [u8; 32],
}

impl ChunkChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue a chain whose last chunk had sequence `next_sequence - 1` and
    /// signing-input digest `prev_digest`.
    pub fn resume(next_sequence: u64, prev_digest: [u8; 32]) -> Self {
        Self {
            next_sequence,
            prev_digest,
        }
    }

    /// Rebuild the head of a chain from chunks already persisted, in order.
    pub fn replay(chunks: &[Chunk]) -> Self {
        let mut chain = Self::new();
        for chunk in chunks {
            let input = chain.signing_input(chunk.sequence, chunk.records());
            chain.prev_digest = Sha256::digest(&input).into();
            chain.next_sequence = chunk.sequence.saturating_add(1);
        }
        chain
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Digest of the last signing input passed to [`ChunkChain::advance`].
    pub fn head_digest(&self) -> [u8; 32] {
        self.prev_digest
    }

    pub fn signing_input(&self, sequence: u64, records: &[u8]) -> Vec<u8> {
        let count = (records.len() / RECORD_LEN) as u32;
        let mut out = Vec::with_capacity(DOMAIN_EVENT_CHUNK.len() + 32 + 12 + records.len());
        out.extend_from_slice(DOMAIN_EVENT_CHUNK.as_bytes());
        out.extend_from_slice(&self.prev_digest);
        out.extend_from_slice(&sequence.to_le_bytes());
        out.extend_from_slice(&count.to_le_bytes());
        out.extend_from_slice(records);
        out
    }

    /// Record that `signing_input` was emitted as the current sequence.
    pub fn advance(&mut self, signing_input: &[u8]) {
        self.prev_digest = Sha256::digest(signing_input).into();
        self.next_sequence += 1;
    }
}

/// A decoded chunk. Keeps the record bytes as read so verification covers
/// exactly what is on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub sequence: u64,
    pub signature: [u8; SIGNATURE_LEN],
    pub events: Vec<Event>,
    raw: Vec<u8>,
}

impl Chunk {
    pub fn is_unsigned(&self) -> bool {
        self.signature.iter().all(|b| *b == 0)
    }

    pub fn records(&self) -> &[u8] {
        &self.raw
    }
}

pub fn encode_records(events: &[Event]) -> Vec<u8> {
    let mut out = Vec::with_capacity(events.len() * RECORD_LEN);
    for ev in events {
        out.extend_from_slice(&ev.to_record());
    }
    out
}

pub fn encode_chunk(sequence: u64, signature: &[u8; SIGNATURE_LEN], records: &[u8]) -> Vec<u8> {
    let count = (records.len() / RECORD_LEN) as u32;
    let mut out = Vec::with_capacity(CHUNK_HEADER_LEN + records.len());
    out.extend_from_slice(&sequence.to_le_bytes());
    out.extend_from_slice(signature);
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(records);
    out
}

/// Parse a concatenation of chunks. Truncated or oversized input fails with
/// `MalformedInput`.
pub fn read_chunks(bytes: &[u8]) -> GateResult<Vec<Chunk>> {
    let mut cursor = 0usize;
    let mut out = Vec::new();
    while cursor < bytes.len() {
        let seq = read_slice(bytes, &mut cursor, 8)?;
        let sequence = u64::from_le_bytes(seq.try_into().map_err(|_| truncated())?);
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(read_slice(bytes, &mut cursor, SIGNATURE_LEN)?);
        let count = read_slice(bytes, &mut cursor, 4)?;
        let count = u32::from_le_bytes(count.try_into().map_err(|_| truncated())?) as usize;
        if count > MAX_CHUNK_RECORDS {
            return Err(GateError::malformed(format!(
                "chunk record count {} exceeds maximum allowed {}",
                count, MAX_CHUNK_RECORDS
            )));
        }
        let records = read_slice(bytes, &mut cursor, count * RECORD_LEN)?;
        let events = read_records(records)?;
        out.push(Chunk {
            sequence,
            signature,
            events,
            raw: records.to_vec(),
        });
    }
    Ok(out)
}

/// Parse a plain (unchunked) sequence of fixed-size records.
pub fn read_records(bytes: &[u8]) -> GateResult<Vec<Event>> {
    if bytes.len() % RECORD_LEN != 0 {
        return Err(GateError::malformed(format!(
            "record stream length {} is not a multiple of {}",
            bytes.len(),
            RECORD_LEN
        )));
    }
    bytes.chunks_exact(RECORD_LEN).map(Event::from_record).collect()
}

/// Outcome of [`verify_chunks`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkReport {
    pub chunks: usize,
    pub records: usize,
    pub unsigned: usize,
}

/// Check sequence continuity and Ed25519 signatures along the hash chain.
///
/// Unsigned chunks are counted; they fail verification only when
/// `require_signatures` is set.
pub fn verify_chunks(
    chunks: &[Chunk],
    verifying_key: &VerifyingKey,
    require_signatures: bool,
) -> Result<ChunkReport> {
    let mut chain = ChunkChain::new();
    let mut report = ChunkReport::default();
    for chunk in chunks {
        if chunk.sequence != chain.next_sequence() {
            return Err(anyhow!(
                "chunk sequence gap: expected {}, found {}",
                chain.next_sequence(),
                chunk.sequence
            ));
        }
        let input = chain.signing_input(chunk.sequence, chunk.records());
        if chunk.is_unsigned() {
            if require_signatures {
                return Err(anyhow!("chunk {} is unsigned", chunk.sequence));
            }
            report.unsigned += 1;
        } else {
            let mut sig = [0u8; 64];
            sig.copy_from_slice(&chunk.signature[..64]);
            if chunk.signature[64..].iter().any(|b| *b != 0) {
                return Err(anyhow!("chunk {} has a non-canonical signature block", chunk.sequence));
            }
            verifying_key
                .verify(&input, &Signature::from_bytes(&sig))
                .map_err(|e| anyhow!("chunk {} signature invalid: {}", chunk.sequence, e))?;
        }
        chain.advance(&input);
        report.chunks += 1;
        report.records += chunk.events.len();
    }
    Ok(report)
}

pub fn verifying_key_from_hex(hex_str: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(hex_str.trim()).map_err(|e| anyhow!("invalid hex: {}", e))?;
    let key_bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
        anyhow!(
            "invalid public key length: expected 32 bytes, got {}",
            bytes.len()
        )
    })?;
    VerifyingKey::from_bytes(&key_bytes).map_err(|e| anyhow!("invalid public key bytes: {}", e))
}

fn truncated() -> GateError {
    GateError::malformed("truncated chunk")
}

fn read_slice<'a>(bytes: &'a [u8], cursor: &mut usize, len: usize) -> GateResult<&'a [u8]> {
    let end = cursor.checked_add(len).ok_or_else(truncated)?;
    if end > bytes.len() {
        return Err(truncated());
    }
    let out = &bytes[*cursor..end];
    *cursor = end;
    Ok(out)
}
