use serde::{Deserialize, Serialize, Serializer};

use crate::error::ProtocolError;

/// Outbound TMTP operation codes (numeric on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    TmtpRev = 0,
    Register = 1,
    Login = 2,
    UserEdit = 3,
    OhiEdit = 4,
    GroupInvite = 5,
    GroupEdit = 6,
    Post = 7,
    Ping = 8,
    Pulse = 9,
    Ack = 10,
    Quit = 11,
}

impl Op {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl Serialize for Op {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

/// Recipient of a post
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HeaderFor {
    pub id: String,
    /// 1 = user, 2 = group
    #[serde(rename = "Type")]
    pub kind: u8,
}

impl HeaderFor {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: 1,
        }
    }
}

/// Header of a frame written to the relay.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct OutboundHeader {
    pub op: Op,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub node: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub new_alias: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub new_node: String,
    #[serde(rename = "For", skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<HeaderFor>,
    #[serde(rename = "Type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub data_head: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub data_len: u64,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl OutboundHeader {
    pub fn new(op: Op, id: impl Into<String>) -> Self {
        Self {
            op,
            id: id.into(),
            uid: String::new(),
            node: String::new(),
            new_alias: String::new(),
            new_node: String::new(),
            to: Vec::new(),
            kind: String::new(),
            data_head: 0,
            data_len: 0,
        }
    }

    pub fn revision(revision: &str) -> Self {
        Self::new(Op::TmtpRev, revision)
    }

    pub fn register(alias: &str, node: &str) -> Self {
        let mut h = Self::new(Op::Register, "");
        h.new_alias = alias.to_string();
        h.new_node = node.to_string();
        h
    }

    pub fn login(uid: &str, node: &str) -> Self {
        let mut h = Self::new(Op::Login, "");
        h.uid = uid.to_string();
        h.node = node.to_string();
        h
    }

    pub fn ack(id: &str) -> Self {
        let mut h = Self::new(Op::Ack, id);
        h.kind = "ok".to_string();
        h
    }

    pub fn pulse() -> Self {
        Self::new(Op::Pulse, "")
    }

    /// Presence edit naming one or more contacts; `kind` is `add` or `drop`.
    pub fn ohi_edit(id: &str, uids: impl IntoIterator<Item = String>, kind: &str) -> Self {
        let mut h = Self::new(Op::OhiEdit, id);
        h.to = uids.into_iter().map(HeaderFor::user).collect();
        h.kind = kind.to_string();
        h
    }

    pub fn post(id: &str, to: Vec<HeaderFor>, data_head: u64, data_len: u64) -> Self {
        let mut h = Self::new(Op::Post, id);
        h.to = to;
        h.data_head = data_head;
        h.data_len = data_len;
        h
    }
}

/// Header of a frame received from the relay (or injected locally).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Header {
    pub op: String,
    pub id: String,
    pub uid: String,
    pub node_id: String,
    pub info: String,
    pub from: String,
    pub posted: String,
    pub msg_id: String,
    pub error: String,
    pub data_len: u64,
    pub data_head: u64,
    pub ohi: Vec<String>,
    pub status: i8,
    #[serde(skip)]
    pub sub_head: Option<SubHeader>,
}

impl Header {
    pub fn check(&self) -> Result<(), ProtocolError> {
        if self.op.is_empty() {
            return Err(ProtocolError::InvalidHeader("missing Op".to_string()));
        }
        if self.data_head > self.data_len {
            return Err(ProtocolError::SubHeaderLength {
                data_head: self.data_head,
                data_len: self.data_len,
            });
        }
        Ok(())
    }

    /// Frames originating from another user must be acknowledged.
    pub fn needs_ack(&self) -> bool {
        !self.from.is_empty()
    }

    /// Length of the raw payload following the sub-header.
    pub fn payload_len(&self) -> u64 {
        self.data_len - self.data_head
    }
}

/// Sub-header carried by posts and stored with every thread message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SubHeader {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub thread_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub alias: String,
    pub subject: String,
    #[serde(rename = "For", skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<HeaderFor>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<CcHeader>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attach: Vec<AttachRef>,
    /// Set when this post re-delivers a forwarded message for confirmation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm: Option<ConfirmRef>,
}

/// Recipient record as it travels in a sub-header
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CcHeader {
    pub who: String,
    pub who_uid: String,
    pub by: String,
    pub by_uid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub note: String,
    pub subscribe: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AttachRef {
    pub name: String,
    pub size: u64,
}

/// Identifies the stored message a forward refers to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConfirmRef {
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_header_wire_names() {
        let h = OutboundHeader::post("t_0000000001", vec![HeaderFor::user("u1")], 10, 30);
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(
            json,
            r#"{"Op":7,"Id":"t_0000000001","For":[{"Id":"u1","Type":1}],"DataHead":10,"DataLen":30}"#
        );
    }

    #[test]
    fn test_ack_and_pulse() {
        let ack = serde_json::to_string(&OutboundHeader::ack("m1")).unwrap();
        assert_eq!(ack, r#"{"Op":10,"Id":"m1","Type":"ok"}"#);
        let pulse = serde_json::to_string(&OutboundHeader::pulse()).unwrap();
        assert_eq!(pulse, r#"{"Op":9}"#);
    }

    #[test]
    fn test_inbound_header_defaults() {
        let h: Header =
            serde_json::from_str(r#"{"Op":"ack","Id":"tx_000000000001","MsgId":"m9"}"#).unwrap();
        assert_eq!(h.op, "ack");
        assert_eq!(h.msg_id, "m9");
        assert!(h.error.is_empty());
        assert!(!h.needs_ack());
        assert!(h.check().is_ok());
    }

    #[test]
    fn test_header_check_sub_head_bounds() {
        let h = Header {
            op: "delivery".into(),
            data_head: 10,
            data_len: 5,
            ..Default::default()
        };
        assert!(h.check().is_err());
    }
}
