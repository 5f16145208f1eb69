//! Send records: the frame written to the relay for one queue entry.

use tmtp_shared::constants::PRESENCE_ACK_ID;
use tmtp_shared::{pack_frame, ConfirmRef, HeaderFor, LocalId, OutboundHeader, SendTag, SubHeader};
use tmtp_store::{QueueEntry, Service, StoreError};

/// A composed frame and the queue id the relay will acknowledge.
#[derive(Debug, Clone)]
pub struct SendRecord {
    pub id: String,
    pub bytes: Vec<u8>,
}

/// Build the frame for `entry`. `None` means the content it refers to is
/// gone (a draft already sent or discarded, a forwarded message no longer
/// stored) and the entry should just be dropped.
pub fn compose(service: &Service, entry: &QueueEntry) -> Result<Option<SendRecord>, StoreError> {
    let key = entry.key();
    let bytes = match entry.tag()? {
        SendTag::Thread => compose_thread(service, &entry.id, key)?,
        SendTag::Presence => Some(compose_presence_edit(&entry.id, key)?),
        SendTag::Forward => compose_forward(service, &entry.id, key)?,
    };
    Ok(bytes.map(|bytes| SendRecord {
        id: entry.id.clone(),
        bytes,
    }))
}

/// The full presence list, pushed once after login.
pub fn compose_presence_push(service: &Service) -> Result<Option<SendRecord>, StoreError> {
    let uids = service.presence().announced();
    if uids.is_empty() {
        return Ok(None);
    }
    let header = OutboundHeader::ohi_edit(PRESENCE_ACK_ID, uids, "add");
    Ok(Some(SendRecord {
        id: PRESENCE_ACK_ID.to_string(),
        bytes: pack_frame(&header, &[])?,
    }))
}

fn compose_thread(service: &Service, queue_id: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
    let local = LocalId::parse(key)?;
    let Some((head, body)) = service.threads().read_draft(&local)? else {
        return Ok(None);
    };
    let mut sub = head.sub_head;
    sub.thread_id = local.thread_id().to_string();
    let to = sub.to.clone();
    post(queue_id, to, &sub, &body).map(Some)
}

fn compose_presence_edit(queue_id: &str, key: &str) -> Result<Vec<u8>, StoreError> {
    let (kind, uid) = match (key.strip_prefix('+'), key.strip_prefix('-')) {
        (Some(uid), _) => ("add", uid),
        (_, Some(uid)) => ("drop", uid),
        _ => return Err(StoreError::NotFound(format!("presence edit {key:?}"))),
    };
    let header = OutboundHeader::ohi_edit(queue_id, [uid.to_string()], kind);
    Ok(pack_frame(&header, &[])?)
}

fn compose_forward(service: &Service, queue_id: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
    let mut parts = key.splitn(3, '/');
    let (Some(thread_id), Some(msg_id), Some(uid)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(StoreError::NotFound(format!("forward {key:?}")));
    };
    let Some(record) = service.threads().read_record(thread_id, msg_id)? else {
        return Ok(None);
    };
    let sub = SubHeader {
        thread_id: thread_id.to_string(),
        confirm: Some(ConfirmRef {
            id: msg_id.to_string(),
        }),
        ..Default::default()
    };
    post(queue_id, vec![HeaderFor::user(uid)], &sub, &record).map(Some)
}

fn post(queue_id: &str, to: Vec<HeaderFor>, sub: &SubHeader, body: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut payload = serde_json::to_vec(sub)?;
    let data_head = payload.len() as u64;
    payload.extend_from_slice(body);
    let header = OutboundHeader::post(queue_id, to, data_head, payload.len() as u64);
    Ok(pack_frame(&header, &payload)?)
}

#[cfg(test)]
mod tests {
    use tmtp_shared::{FrameParser, Header};
    use tmtp_store::{CrashHook, DraftContent, Registry, ServiceConfig};

    use super::*;

    fn registry(dir: &tempfile::TempDir) -> Registry {
        let registry = Registry::open(dir.path(), CrashHook::disabled()).unwrap();
        registry
            .add_service(ServiceConfig {
                name: "home".into(),
                addr: "127.0.0.1:8888".into(),
                uid: "u1".into(),
                ..Default::default()
            })
            .unwrap();
        registry
    }

    /// Outbound frames parse with the inbound parser once `Op` is a string.
    fn parse(bytes: &[u8]) -> (serde_json::Value, tmtp_shared::Frame) {
        let len = usize::from_str_radix(std::str::from_utf8(&bytes[..4]).unwrap(), 16).unwrap();
        let mut head: serde_json::Value = serde_json::from_slice(&bytes[4..4 + len]).unwrap();
        let raw = head.clone();
        head["Op"] = serde_json::Value::String("post".into());
        let head_bytes = serde_json::to_vec(&head).unwrap();
        let mut parser = FrameParser::new();
        parser.push(format!("{:04x}", head_bytes.len()).as_bytes());
        parser.push(&head_bytes);
        parser.push(&bytes[4 + len..]);
        (raw, parser.next_frame().unwrap().unwrap())
    }

    #[test]
    fn test_thread_record_carries_draft() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let svc = registry.get("home").unwrap();
        let id = svc
            .save_draft(
                None,
                "",
                &DraftContent {
                    subject: "hi".into(),
                    to: vec![HeaderFor::user("u2")],
                    body: "hello".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        svc.send_draft(&id.to_string()).unwrap();

        let entry = svc.queue().pending().remove(0);
        let record = compose(&svc, &entry).unwrap().unwrap();
        assert_eq!(record.id, format!("t{id}"));

        let (raw, frame) = parse(&record.bytes);
        assert_eq!(raw["Op"], 7);
        assert_eq!(raw["Id"], record.id.as_str());
        assert_eq!(raw["For"][0]["Id"], "u2");
        assert_eq!(&frame.data[..], b"hello");
        let sub = frame.sub_head().unwrap();
        assert_eq!(sub.subject, "hi");
        assert!(sub.thread_id.is_empty());
    }

    #[test]
    fn test_missing_draft_composes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let svc = registry.get("home").unwrap();
        let entry = QueueEntry {
            id: "t_000000000001".into(),
            date: String::new(),
        };
        assert!(compose(&svc, &entry).unwrap().is_none());
    }

    #[test]
    fn test_presence_edits() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let svc = registry.get("home").unwrap();
        let entry = QueueEntry {
            id: "o-u7".into(),
            date: String::new(),
        };
        let record = compose(&svc, &entry).unwrap().unwrap();
        let (raw, _) = parse(&record.bytes);
        assert_eq!(raw["Op"], 4);
        assert_eq!(raw["Type"], "drop");
        assert_eq!(raw["For"][0]["Id"], "u7");

        assert!(compose_presence_push(&svc).unwrap().is_none());
        svc.presence().apply_edit("+u3").unwrap();
        let push = compose_presence_push(&svc).unwrap().unwrap();
        assert_eq!(push.id, PRESENCE_ACK_ID);
    }

    #[test]
    fn test_forward_names_the_original_message() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let svc = registry.get("home").unwrap();
        let header = Header {
            op: "delivery".into(),
            id: "m1".into(),
            from: "u2".into(),
            posted: "2026-01-01T00:00:00Z".into(),
            sub_head: Some(SubHeader {
                subject: "s".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        svc.threads().store_received(&header, b"body").unwrap();

        let entry = QueueEntry {
            id: "fm1/m1/u3".into(),
            date: String::new(),
        };
        let record = compose(&svc, &entry).unwrap().unwrap();
        let (raw, frame) = parse(&record.bytes);
        assert_eq!(raw["For"][0]["Id"], "u3");
        let sub = frame.sub_head().unwrap();
        assert_eq!(sub.thread_id, "m1");
        assert_eq!(sub.confirm.as_ref().unwrap().id, "m1");
        let stored = svc.threads().read_record("m1", "m1").unwrap().unwrap();
        assert_eq!(&frame.data[..], &stored[..]);

        let gone = QueueEntry {
            id: "fm1/m9/u3".into(),
            date: String::new(),
        };
        assert!(compose(&svc, &gone).unwrap().is_none());
    }
}
