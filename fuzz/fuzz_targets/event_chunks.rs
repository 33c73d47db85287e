//! Fuzz target for the forensic chunk reader.

#![no_main]
use libfuzzer_sys::fuzz_target;
use sensor_gate::telemetry::chunk::{encode_records, read_chunks, read_records};

fuzz_target!(|data: &[u8]| {
    if let Ok(chunks) = read_chunks(data) {
        for chunk in &chunks {
            // Decoding is strict, so the decoded events re-encode to the bytes read.
            assert_eq!(encode_records(&chunk.events), chunk.records());
        }
    }
    let _ = read_records(data);
});
