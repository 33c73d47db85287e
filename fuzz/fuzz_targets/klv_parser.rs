//! Fuzz target for KLV metadata parsing.
//!
//! Arbitrary bytes must either parse into items whose values lie inside the
//! input or fail with `MalformedInput`. Successful parses must re-encode and
//! re-parse to the same keys and values.

#![no_main]
use libfuzzer_sys::fuzz_target;
use sensor_gate::metadata::{encode_klv, find_klv_item, parse_klv};
use sensor_gate::ErrorKind;

const MAX_INPUT: usize = 64 * 1024;

fuzz_target!(|data: &[u8]| {
    if data.len() > MAX_INPUT {
        return;
    }
    match parse_klv(data) {
        Ok(items) => {
            for item in &items {
                assert!(item.offset + item.value.len() <= data.len());
                assert_eq!(&data[item.offset..item.offset + item.value.len()], item.value);
            }
            if let Some(first) = items.first() {
                let found = find_klv_item(&items, &first.key).expect("first key is present");
                assert_eq!(found.offset, first.offset);
            }
            let encoded = encode_klv(items.iter().map(|i| (&i.key, i.value)));
            let reparsed = parse_klv(&encoded).expect("canonical encoding parses");
            assert_eq!(reparsed.len(), items.len());
            for (a, b) in items.iter().zip(&reparsed) {
                assert_eq!(a.key, b.key);
                assert_eq!(a.value, b.value);
            }
        }
        Err(e) => assert_eq!(e.kind(), ErrorKind::MalformedInput),
    }
});
