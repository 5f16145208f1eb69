//! Durable send queue.
//!
//! One JSON array per service, kept sorted by `tag + id` so lookups are a
//! binary search. Each element also records when it was queued, which gives
//! the order the session sends in.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use tmtp_shared::SendTag;

use crate::error::{Result, StoreError};
use crate::staging::Staging;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueueEntry {
    /// Tag character followed by the operation id
    pub id: String,
    pub date: String,
}

impl QueueEntry {
    pub fn tag(&self) -> Result<SendTag> {
        let c = self
            .id
            .chars()
            .next()
            .ok_or_else(|| StoreError::NotFound("empty queue id".into()))?;
        Ok(SendTag::from_char(c)?)
    }

    /// The id without its tag.
    pub fn key(&self) -> &str {
        self.id.get(1..).unwrap_or_default()
    }
}

pub fn queue_id(tag: SendTag, id: &str) -> String {
    format!("{}{id}", tag.as_char())
}

type Subscriber = Arc<dyn Fn() + Send + Sync>;

pub struct SendQueue {
    path: PathBuf,
    staging: Arc<Staging>,
    entries: Mutex<Vec<QueueEntry>>,
    subscriber: RwLock<Option<Subscriber>>,
}

impl std::fmt::Debug for SendQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendQueue")
            .field("path", &self.path)
            .field("len", &self.entries.lock().len())
            .finish()
    }
}

impl SendQueue {
    /// Load the queue file at `path`; a missing file is an empty queue.
    pub fn load(path: PathBuf, staging: Arc<Staging>) -> Result<Self> {
        let mut entries: Vec<QueueEntry> = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries.dedup_by(|a, b| a.id == b.id);
        Ok(Self {
            path,
            staging,
            entries: Mutex::new(entries),
            subscriber: RwLock::new(None),
        })
    }

    /// Register the callback invoked after entries are added.
    pub fn on_enqueue(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.subscriber.write() = Some(Arc::new(callback));
    }

    pub fn has(&self, tag: SendTag, id: &str) -> bool {
        let full = queue_id(tag, id);
        self.entries
            .lock()
            .binary_search_by(|e| e.id.as_str().cmp(&full))
            .is_ok()
    }

    /// Queue one operation. Returns false if it was already queued.
    pub fn add(&self, tag: SendTag, id: &str) -> Result<bool> {
        let added = self.add_batch(&[(tag, id.to_string())], true)?;
        Ok(added > 0)
    }

    /// Queue several operations in one write; `notify` decides whether the
    /// subscriber hears about it. Returns how many were new.
    pub fn add_batch(&self, items: &[(SendTag, String)], notify: bool) -> Result<usize> {
        let added = {
            let mut entries = self.entries.lock();
            let mut next = entries.clone();
            let mut added = 0;
            let date = queue_date();
            for (tag, id) in items {
                let full = queue_id(*tag, id);
                if let Err(slot) = next.binary_search_by(|e| e.id.as_str().cmp(&full)) {
                    next.insert(
                        slot,
                        QueueEntry {
                            id: full,
                            date: date.clone(),
                        },
                    );
                    added += 1;
                }
            }
            if added > 0 {
                self.persist(&next)?;
                *entries = next;
            }
            added
        };
        if added > 0 && notify {
            self.notify();
        }
        Ok(added)
    }

    /// Remove an entry by its full id (tag included).
    pub fn drop_entry(&self, full_id: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        let Ok(slot) = entries.binary_search_by(|e| e.id.as_str().cmp(full_id)) else {
            return Ok(false);
        };
        let mut next = entries.clone();
        next.remove(slot);
        self.persist(&next)?;
        *entries = next;
        Ok(true)
    }

    /// Entries in the order they were queued.
    pub fn pending(&self) -> Vec<QueueEntry> {
        let mut list = self.entries.lock().clone();
        list.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify(&self) {
        let callback = self.subscriber.read().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn persist(&self, entries: &[QueueEntry]) -> Result<()> {
        let bytes = serde_json::to_vec(entries)?;
        self.staging.replace(&self.path, &bytes)
    }
}

/// Queue dates carry milliseconds so entries added in the same second keep
/// their order.
fn queue_date() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::crash::{Checkpoint, CrashHook};

    fn queue(dir: &tempfile::TempDir) -> SendQueue {
        let temp = dir.path().join("temp");
        std::fs::create_dir_all(&temp).unwrap();
        let staging = Arc::new(Staging::new(temp, CrashHook::disabled()));
        SendQueue::load(dir.path().join("sendq"), staging).unwrap()
    }

    #[test]
    fn test_add_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(&dir);
        assert!(q.add(SendTag::Thread, "_000000000001").unwrap());
        assert!(!q.add(SendTag::Thread, "_000000000001").unwrap());
        assert_eq!(q.len(), 1);
        assert!(q.has(SendTag::Thread, "_000000000001"));
        assert!(!q.has(SendTag::Presence, "_000000000001"));
    }

    #[test]
    fn test_persisted_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(&dir);
        q.add(SendTag::Presence, "+u1").unwrap();
        q.add(SendTag::Thread, "t1_000000000001").unwrap();
        assert!(q.drop_entry("o+u1").unwrap());
        assert!(!q.drop_entry("o+u1").unwrap());

        let reloaded = queue(&dir);
        let pending = reloaded.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "tt1_000000000001");
        assert_eq!(pending[0].tag().unwrap(), SendTag::Thread);
        assert_eq!(pending[0].key(), "t1_000000000001");
    }

    #[test]
    fn test_pending_follows_queue_order() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(&dir);
        q.add(SendTag::Thread, "zz_000000000001").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        q.add(SendTag::Forward, "a1/a2/u3").unwrap();
        let ids: Vec<String> = q.pending().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["tzz_000000000001", "fa1/a2/u3"]);
    }

    #[test]
    fn test_failed_write_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(&dir);
        q.add(SendTag::Thread, "_000000000001").unwrap();

        let temp = dir.path().join("temp");
        let failing = Arc::new(Staging::new(temp, CrashHook::abort_at(Checkpoint::Staged)));
        let broken = SendQueue::load(dir.path().join("sendq"), failing).unwrap();
        assert!(broken.add(SendTag::Presence, "+u1").is_err());
        assert!(!broken.has(SendTag::Presence, "+u1"));
        assert!(broken.drop_entry("t_000000000001").is_err());
        assert!(broken.has(SendTag::Thread, "_000000000001"));
        assert_eq!(broken.len(), 1);
    }

    #[test]
    fn test_batch_without_notify() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(&dir);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        q.on_enqueue(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let batch = vec![
            (SendTag::Forward, "a1/a1/u3".to_string()),
            (SendTag::Forward, "a1/a2/u3".to_string()),
        ];
        assert_eq!(q.add_batch(&batch, false).unwrap(), 2);
        assert_eq!(q.add_batch(&batch, true).unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        q.add(SendTag::Presence, "-u9").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
