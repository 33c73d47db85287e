//! Per-frame metadata: KLV parsing, timestamp alignment, radiometric decoding.

pub mod klv;
pub mod radiometric;

pub use klv::{encode_klv, find_klv_item, parse_klv, KlvItem, UniversalLabel, UAS_DATALINK_LS};
pub use radiometric::{decode_ir_radiometric, RadiometricCalibration, TemperatureMap};

use crate::error::{GateError, GateResult};

/// Anything carrying a capture timestamp in monotonic nanoseconds.
pub trait Timestamped {
    fn timestamp_ns(&self) -> u64;
}

/// A companion metadata buffer captured alongside video frames.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataBuffer {
    pub timestamp_ns: u64,
    pub sequence: u32,
    pub data: Vec<u8>,
}

impl MetadataBuffer {
    pub fn klv_items(&self) -> GateResult<Vec<KlvItem<'_>>> {
        parse_klv(&self.data)
    }
}

impl Timestamped for MetadataBuffer {
    fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }
}

impl Timestamped for u64 {
    fn timestamp_ns(&self) -> u64 {
        *self
    }
}

/// Index of the buffer closest in time to `target_ns`; ties go to the earliest.
pub fn sync_metadata<T: Timestamped>(target_ns: u64, buffers: &[T]) -> GateResult<usize> {
    buffers
        .iter()
        .enumerate()
        .min_by_key(|(idx, buf)| (buf.timestamp_ns().abs_diff(target_ns), *idx))
        .map(|(idx, _)| idx)
        .ok_or_else(|| GateError::invalid("no metadata buffers to synchronize"))
}
