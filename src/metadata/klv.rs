//! SMPTE 336M-style Key-Length-Value parsing over untrusted bytes.
//!
//! Every produced item borrows its value from the input; `offset + value.len()`
//! never exceeds the input length. Anything else is `MalformedInput`.

use crate::error::{GateError, GateResult};

pub const KEY_LEN: usize = 16;

/// Longest long-form length prefix accepted (length fits in a `u64`).
const MAX_LENGTH_BYTES: usize = 8;

/// 16-byte Universal Label. Compared byte-wise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniversalLabel(pub [u8; KEY_LEN]);

impl UniversalLabel {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// MISB ST 0601 UAS Datalink Local Set.
pub const UAS_DATALINK_LS: UniversalLabel = UniversalLabel([
    0x06, 0x0E, 0x2B, 0x34, 0x02, 0x0B, 0x01, 0x01, 0x0E, 0x01, 0x03, 0x01, 0x01, 0x00, 0x00, 0x00,
]);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KlvItem<'a> {
    pub key: UniversalLabel,
    /// Offset of the value within the parsed buffer.
    pub offset: usize,
    pub value: &'a [u8],
}

impl KlvItem<'_> {
    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// Parse consecutive KLV triplets until the buffer is exhausted.
pub fn parse_klv(buffer: &[u8]) -> GateResult<Vec<KlvItem<'_>>> {
    let mut items = Vec::new();
    let mut cursor = 0usize;
    while cursor < buffer.len() {
        let key_bytes = take(buffer, &mut cursor, KEY_LEN, "key")?;
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(key_bytes);

        let length = read_ber_length(buffer, &mut cursor)?;
        let length = usize::try_from(length)
            .map_err(|_| GateError::malformed(format!("KLV length {} exceeds address space", length)))?;
        let offset = cursor;
        let value = take(buffer, &mut cursor, length, "value")?;
        items.push(KlvItem {
            key: UniversalLabel(key),
            offset,
            value,
        });
    }
    Ok(items)
}

/// First item whose key equals `key`, in list order.
pub fn find_klv_item<'i, 'a>(
    items: &'i [KlvItem<'a>],
    key: &UniversalLabel,
) -> GateResult<&'i KlvItem<'a>> {
    items
        .iter()
        .find(|item| item.key == *key)
        .ok_or_else(|| GateError::NotFound(format!("KLV key {}", hex::encode(key.0))))
}

/// Serialize items with minimal BER lengths.
pub fn encode_klv<'a, I>(items: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a UniversalLabel, &'a [u8])>,
{
    let mut out = Vec::new();
    for (key, value) in items {
        out.extend_from_slice(&key.0);
        write_ber_length(&mut out, value.len());
        out.extend_from_slice(value);
    }
    out
}

fn read_ber_length(buffer: &[u8], cursor: &mut usize) -> GateResult<u64> {
    let first = take(buffer, cursor, 1, "length")?[0];
    if first & 0x80 == 0 {
        return Ok(u64::from(first));
    }
    let count = usize::from(first & 0x7F);
    if count == 0 {
        return Err(GateError::malformed("indefinite BER length is not allowed in KLV"));
    }
    if count > MAX_LENGTH_BYTES {
        return Err(GateError::malformed(format!(
            "BER length uses {} bytes, maximum is {}",
            count, MAX_LENGTH_BYTES
        )));
    }
    let bytes = take(buffer, cursor, count, "long-form length")?;
    Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn write_ber_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let be = (len as u64).to_be_bytes();
    let skip = be.iter().take_while(|b| **b == 0).count();
    out.push(0x80 | (be.len() - skip) as u8);
    out.extend_from_slice(&be[skip..]);
}

fn take<'a>(buffer: &'a [u8], cursor: &mut usize, len: usize, what: &str) -> GateResult<&'a [u8]> {
    let end = cursor
        .checked_add(len)
        .filter(|end| *end <= buffer.len())
        .ok_or_else(|| {
            GateError::malformed(format!(
                "truncated KLV {} at offset {}: need {} bytes, {} remain",
                what,
                cursor,
                len,
                buffer.len().saturating_sub(*cursor)
            ))
        })?;
    let out = &buffer[*cursor..end];
    *cursor = end;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const OTHER: UniversalLabel = UniversalLabel([0xAA; KEY_LEN]);

    #[test]
    fn parses_single_uas_item() {
        let mut data = UAS_DATALINK_LS.0.to_vec();
        data.push(0x08);
        data.extend(0u8..8);
        let items = parse_klv(&data).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].offset, 17);
        assert_eq!(items[0].value, &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert!(find_klv_item(&items, &UAS_DATALINK_LS).is_ok());
        assert_eq!(
            find_klv_item(&items, &OTHER).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn long_form_length_round_trips() {
        let big = vec![0x5Au8; 300];
        let small = [1u8, 2, 3];
        let encoded = encode_klv([(&OTHER, &big[..]), (&UAS_DATALINK_LS, &small[..])]);
        assert_eq!(&encoded[16..19], &[0x82, 0x01, 0x2C]);
        let items = parse_klv(&encoded).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].key, OTHER);
        assert_eq!(items[0].value, &big[..]);
        assert_eq!(items[1].value, &small);
    }

    #[test]
    fn every_truncation_is_malformed() {
        let a = [9u8; 5];
        let b = vec![7u8; 200];
        let encoded = encode_klv([(&UAS_DATALINK_LS, &a[..]), (&OTHER, &b[..])]);
        let first_end = KEY_LEN + 1 + a.len();
        for cut in 1..encoded.len() {
            let res = parse_klv(&encoded[..cut]);
            if cut == first_end {
                assert_eq!(res.unwrap().len(), 1);
            } else {
                assert_eq!(res.unwrap_err().kind(), ErrorKind::MalformedInput, "cut {}", cut);
            }
        }
        assert!(parse_klv(&[]).unwrap().is_empty());
    }

    #[test]
    fn rejects_oversized_and_indefinite_lengths() {
        let mut data = OTHER.0.to_vec();
        data.push(0x80);
        assert_eq!(parse_klv(&data).unwrap_err().kind(), ErrorKind::MalformedInput);

        let mut data = OTHER.0.to_vec();
        data.push(0x89);
        data.extend([0xFF; 9]);
        assert_eq!(parse_klv(&data).unwrap_err().kind(), ErrorKind::MalformedInput);

        let mut data = OTHER.0.to_vec();
        data.push(0x88);
        data.extend([0xFF; 8]);
        assert_eq!(parse_klv(&data).unwrap_err().kind(), ErrorKind::MalformedInput);
    }
}
