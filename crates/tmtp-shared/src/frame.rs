//! TMTP frame codec.
//!
//! A frame is `HHHH` (four hex digits giving the header length), the header
//! JSON, then `DataLen` bytes of payload. When the header declares
//! `DataHead`, the first `DataHead` payload bytes are a JSON sub-header.
//!
//! [`FrameParser`] is resumable: bytes may arrive split at any point and the
//! parser picks up where it left off on the next call.

use bytes::{Buf, Bytes, BytesMut};
use serde::Serialize;

use crate::constants::{FRAME_LEN_DIGITS, MAX_FRAME_DATA, MSG_HEADER_MAX_LEN, MSG_HEADER_MIN_LEN};
use crate::error::ProtocolError;
use crate::protocol::{Header, SubHeader};

/// A fully parsed inbound frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Header,
    /// Raw payload following the sub-header
    pub data: Bytes,
}

impl Frame {
    pub fn new(header: Header, data: impl Into<Bytes>) -> Self {
        Self {
            header,
            data: data.into(),
        }
    }

    pub fn sub_head(&self) -> Option<&SubHeader> {
        self.header.sub_head.as_ref()
    }
}

/// Serialize a header and append the payload (sub-header bytes included).
pub fn pack_frame<H: Serialize>(header: &H, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let head = serde_json::to_vec(header)?;
    if head.len() > MSG_HEADER_MAX_LEN {
        return Err(ProtocolError::HeaderLength(head.len()));
    }
    let mut buf = Vec::with_capacity(FRAME_LEN_DIGITS + head.len() + payload.len());
    buf.extend_from_slice(format!("{:04x}", head.len()).as_bytes());
    buf.extend_from_slice(&head);
    buf.extend_from_slice(payload);
    Ok(buf)
}

#[derive(Debug)]
enum Stage {
    /// Waiting for the four-digit length prefix
    Prefix,
    /// Waiting for `end` bytes of prefix + header JSON
    Header { end: usize },
    /// Header consumed; waiting for the payload
    Payload { header: Box<Header> },
}

/// Incremental parser over a single growable buffer.
#[derive(Debug)]
pub struct FrameParser {
    buf: BytesMut,
    stage: Stage,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
            stage: Stage::Prefix,
        }
    }

    /// Buffer to read socket bytes into directly.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Parse the next complete frame, or `Ok(None)` if more bytes are needed.
    ///
    /// Call repeatedly until it returns `None`; several frames may already be
    /// sitting in the buffer.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            match &self.stage {
                Stage::Prefix => {
                    if self.buf.len() < FRAME_LEN_DIGITS {
                        return Ok(None);
                    }
                    let len = parse_prefix(&self.buf[..FRAME_LEN_DIGITS])?;
                    if len < MSG_HEADER_MIN_LEN {
                        return Err(ProtocolError::HeaderLength(len));
                    }
                    self.stage = Stage::Header {
                        end: FRAME_LEN_DIGITS + len,
                    };
                }
                Stage::Header { end } => {
                    let end = *end;
                    if self.buf.len() < end {
                        return Ok(None);
                    }
                    let header: Header = serde_json::from_slice(&self.buf[FRAME_LEN_DIGITS..end])?;
                    header.check()?;
                    if header.data_len > MAX_FRAME_DATA as u64 {
                        return Err(ProtocolError::PayloadTooLarge {
                            len: header.data_len,
                            max: MAX_FRAME_DATA,
                        });
                    }
                    self.buf.advance(end);
                    self.stage = Stage::Payload {
                        header: Box::new(header),
                    };
                }
                Stage::Payload { header } => {
                    let total = header.data_len as usize;
                    if self.buf.len() < total {
                        return Ok(None);
                    }
                    let Stage::Payload { header } =
                        std::mem::replace(&mut self.stage, Stage::Prefix)
                    else {
                        unreachable!("stage checked above");
                    };
                    let mut header = *header;
                    let payload = self.buf.split_to(total).freeze();
                    let sub_len = header.data_head as usize;
                    if sub_len > 0 {
                        let sub: SubHeader = serde_json::from_slice(&payload[..sub_len])?;
                        header.sub_head = Some(sub);
                    }
                    header.data_len -= header.data_head;
                    header.data_head = 0;
                    return Ok(Some(Frame {
                        header,
                        data: payload.slice(sub_len..),
                    }));
                }
            }
        }
    }
}

fn parse_prefix(digits: &[u8]) -> Result<usize, ProtocolError> {
    let text = std::str::from_utf8(digits)
        .map_err(|_| ProtocolError::InvalidLengthPrefix(String::from_utf8_lossy(digits).into()))?;
    if !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ProtocolError::InvalidLengthPrefix(text.to_string()));
    }
    usize::from_str_radix(text, 16).map_err(|_| ProtocolError::InvalidLengthPrefix(text.to_string()))
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::protocol::{HeaderFor, SubHeader};

    fn delivery(id: &str, body: &[u8]) -> Vec<u8> {
        let sub = SubHeader {
            thread_id: "th".into(),
            subject: format!("re {id}"),
            to: vec![HeaderFor::user("u1")],
            ..Default::default()
        };
        let sub = serde_json::to_vec(&sub).unwrap();
        let head = serde_json::json!({
            "Op": "delivery",
            "Id": id,
            "From": "u2",
            "DataHead": sub.len(),
            "DataLen": sub.len() + body.len(),
        });
        let mut payload = sub;
        payload.extend_from_slice(body);
        pack_frame(&head, &payload).unwrap()
    }

    #[test]
    fn test_single_frame() {
        let mut parser = FrameParser::new();
        parser.push(&delivery("m1", b"hello"));
        let frame = parser.next_frame().unwrap().unwrap();
        assert_eq!(frame.header.op, "delivery");
        assert_eq!(frame.header.id, "m1");
        assert_eq!(&frame.data[..], b"hello");
        assert_eq!(frame.header.data_len, 5);
        assert_eq!(frame.sub_head().unwrap().thread_id, "th");
        assert!(parser.next_frame().unwrap().is_none());
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_frame_without_payload() {
        let bytes = pack_frame(&serde_json::json!({"Op": "info", "Info": "login ok"}), b"").unwrap();
        let mut parser = FrameParser::new();
        parser.push(&bytes);
        let frame = parser.next_frame().unwrap().unwrap();
        assert_eq!(frame.header.info, "login ok");
        assert!(frame.data.is_empty());
        assert!(frame.sub_head().is_none());
    }

    #[test]
    fn test_uppercase_length_prefix() {
        let head = br#"{"Op":"quit","Info":"zzzzzzzzzzzzzzzzzzzzzzzzzz"}"#;
        let mut bytes = format!("{:04X}", head.len()).into_bytes();
        bytes.extend_from_slice(head);
        let mut parser = FrameParser::new();
        parser.push(&bytes);
        assert_eq!(parser.next_frame().unwrap().unwrap().header.op, "quit");
    }

    #[test]
    fn test_rejects_short_header() {
        let mut parser = FrameParser::new();
        parser.push(b"0002{}");
        assert!(matches!(
            parser.next_frame(),
            Err(ProtocolError::HeaderLength(2))
        ));
    }

    #[test]
    fn test_rejects_non_hex_prefix() {
        let mut parser = FrameParser::new();
        parser.push(b"00g1{\"Op\":\"x\"}");
        assert!(matches!(
            parser.next_frame(),
            Err(ProtocolError::InvalidLengthPrefix(_))
        ));
    }

    #[test]
    fn test_rejects_header_without_op() {
        let mut parser = FrameParser::new();
        parser.push(&pack_frame(&serde_json::json!({"Id": "x1"}), b"").unwrap());
        assert!(parser.next_frame().is_err());
    }

    #[test]
    fn test_frames_survive_random_splits() {
        let frames: Vec<Vec<u8>> = (0..20)
            .map(|n| delivery(&format!("m{n}"), format!("body number {n}").repeat(n + 1).as_bytes()))
            .collect();
        let stream: Vec<u8> = frames.concat();
        let mut rng = StdRng::seed_from_u64(0x7e57);

        for _ in 0..200 {
            let mut parser = FrameParser::new();
            let mut parsed = Vec::new();
            let mut pos = 0;
            while pos < stream.len() {
                let step = rng.gen_range(1..=64).min(stream.len() - pos);
                parser.push(&stream[pos..pos + step]);
                pos += step;
                while let Some(frame) = parser.next_frame().unwrap() {
                    parsed.push(frame);
                }
            }
            assert_eq!(parsed.len(), frames.len());
            for (n, frame) in parsed.iter().enumerate() {
                assert_eq!(frame.header.id, format!("m{n}"));
                assert_eq!(
                    &frame.data[..],
                    format!("body number {n}").repeat(n + 1).as_bytes()
                );
            }
            assert_eq!(parser.buffered(), 0);
        }
    }
}
