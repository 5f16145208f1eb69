//! Framed messages as stored in thread and draft files.
//!
//! `HHHH` + head JSON + `\n` + body + `\n`. The checksum covers every byte
//! except the final newline.

use serde::{Deserialize, Serialize};

use tmtp_shared::constants::{FRAME_LEN_DIGITS, MSG_HEADER_MAX_LEN};
use tmtp_shared::SubHeader;

use crate::error::{Result, StoreError, ValidationError};

/// Head of a stored message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StoredHead {
    pub id: String,
    pub from: String,
    pub posted: String,
    pub len: u64,
    pub sub_head: SubHeader,
}

/// A message encoded for disk, with the figures its index entry records.
#[derive(Debug, Clone)]
pub struct EncodedMessage {
    pub bytes: Vec<u8>,
    pub checksum: u32,
}

impl EncodedMessage {
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// The record as forwarded to another user: everything but the final
    /// newline.
    pub fn record(&self) -> &[u8] {
        &self.bytes[..self.bytes.len() - 1]
    }
}

pub fn encode_message(head: &StoredHead, body: &[u8]) -> Result<EncodedMessage> {
    let json = serde_json::to_vec(head)?;
    if json.len() > MSG_HEADER_MAX_LEN {
        return Err(ValidationError::HeadTooLong(head.id.clone(), json.len()).into());
    }
    let mut bytes = Vec::with_capacity(FRAME_LEN_DIGITS + json.len() + body.len() + 2);
    bytes.extend_from_slice(format!("{:04x}", json.len()).as_bytes());
    bytes.extend_from_slice(&json);
    bytes.push(b'\n');
    bytes.extend_from_slice(body);
    let checksum = crc32fast::hash(&bytes);
    bytes.push(b'\n');
    Ok(EncodedMessage { bytes, checksum })
}

/// Rebuild an encoded message from a forwarded record (no final newline).
pub fn from_record(record: &[u8]) -> EncodedMessage {
    let mut bytes = Vec::with_capacity(record.len() + 1);
    bytes.extend_from_slice(record);
    bytes.push(b'\n');
    EncodedMessage {
        checksum: crc32fast::hash(record),
        bytes,
    }
}

/// Parse the head at the start of `bytes`; returns it with the body range.
pub fn decode_head(bytes: &[u8]) -> Result<(StoredHead, std::ops::Range<usize>)> {
    let corrupt = |why: &str| StoreError::CorruptMessage(why.to_string());
    if bytes.len() < FRAME_LEN_DIGITS {
        return Err(corrupt("short head prefix"));
    }
    let prefix = std::str::from_utf8(&bytes[..FRAME_LEN_DIGITS])
        .map_err(|_| corrupt("head prefix not ascii"))?;
    let head_len =
        usize::from_str_radix(prefix, 16).map_err(|_| corrupt("head prefix not hex"))?;
    let head_end = FRAME_LEN_DIGITS + head_len;
    if bytes.len() <= head_end || bytes[head_end] != b'\n' {
        return Err(corrupt("head not terminated"));
    }
    let head: StoredHead = serde_json::from_slice(&bytes[FRAME_LEN_DIGITS..head_end])?;
    let body_start = head_end + 1;
    let body_end = usize::try_from(head.len)
        .ok()
        .and_then(|len| body_start.checked_add(len))
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| corrupt("body truncated"))?;
    Ok((head, body_start..body_end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(id: &str, len: u64) -> StoredHead {
        StoredHead {
            id: id.into(),
            from: "u1".into(),
            posted: "2026-01-01T00:00:00Z".into(),
            len,
            sub_head: SubHeader {
                thread_id: "t1".into(),
                subject: "hi".into(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_layout_and_checksum() {
        let msg = encode_message(&head("m1", 5), b"hello").unwrap();
        let text = String::from_utf8(msg.bytes.clone()).unwrap();
        let head_len = usize::from_str_radix(&text[..4], 16).unwrap();
        assert_eq!(&text[4 + head_len..4 + head_len + 1], "\n");
        assert!(text.ends_with("\nhello\n"));
        assert_eq!(msg.checksum, crc32fast::hash(msg.record()));
        assert_eq!(msg.size(), msg.bytes.len() as u64);
    }

    #[test]
    fn test_decode_head() {
        let msg = encode_message(&head("m1", 5), b"hello").unwrap();
        let (parsed, body) = decode_head(&msg.bytes).unwrap();
        assert_eq!(parsed, head("m1", 5));
        assert_eq!(&msg.bytes[body], b"hello");
    }

    #[test]
    fn test_record_round_trip_keeps_checksum() {
        let msg = encode_message(&head("m1", 3), b"abc").unwrap();
        let copy = from_record(msg.record());
        assert_eq!(copy.checksum, msg.checksum);
        assert_eq!(copy.bytes, msg.bytes);
    }

    #[test]
    fn test_decode_rejects_truncated_body() {
        let msg = encode_message(&head("m1", 5), b"hello").unwrap();
        assert!(decode_head(&msg.bytes[..msg.bytes.len() - 4]).is_err());
    }

    #[test]
    fn test_decode_rejects_huge_length() {
        let msg = encode_message(&head("m1", u64::MAX), b"hello").unwrap();
        assert!(matches!(
            decode_head(&msg.bytes),
            Err(StoreError::CorruptMessage(_))
        ));
    }

    #[test]
    fn test_oversize_head_is_not_fatal() {
        let mut long = head("m1", 5);
        long.sub_head.subject = "x".repeat(70_000);
        let err = encode_message(&long, b"hello").unwrap_err();
        assert!(matches!(
            err,
            StoreError::Validation(ValidationError::HeadTooLong(ref id, _)) if id == "m1"
        ));
        assert!(!err.is_fatal());
    }
}
