//! Per-service thread store.
//!
//! A thread file holds framed messages in id order followed by a trailer
//! (index and Cc list). Drafts live in `draft/<localId>` and take an index
//! slot with offset -1 in their thread. A draft that starts a new thread is
//! a stand-alone file in thread format until the relay accepts it; the
//! relay's message id then becomes the thread id.
//!
//! Every mutation runs under the door of the thread it touches and goes
//! through [`Staging`], so [`ThreadStore::replay`] can finish it after a
//! crash.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use tmtp_shared::{now_rfc3339, AttachRef, CcHeader, Header, HeaderFor, LocalId, LocalIdClock, SubHeader};

use crate::error::{Outcome, Result, StoreError, ValidationError};
use crate::message::{decode_head, encode_message, from_record, EncodedMessage, StoredHead};
use crate::staging::{
    apply_append, apply_link, read_at, remove_if_exists, sync_dir, StageOp, Staged, Staging,
    StagingName,
};
use crate::trailer::{CcEntry, IndexEntry, Trailer, DRAFT_OFFSET};

/// Reader/writer lock for one thread id.
#[derive(Debug, Default)]
pub struct Door {
    lock: RwLock<()>,
    renamed: AtomicBool,
}

impl Door {
    fn ensure_open(&self, key: &str) -> Result<()> {
        if self.renamed.load(Ordering::Acquire) {
            return Err(StoreError::Renamed(key.to_string()));
        }
        Ok(())
    }
}

/// Lazily created doors. The map lock is held only to look a door up or
/// to drop it. A door leaves the map when its last user is done, unless it
/// was renamed: that flag must outlive every handle.
#[derive(Debug, Default)]
struct Doors {
    map: Mutex<HashMap<String, Arc<Door>>>,
}

impl Doors {
    fn get(&self, key: &str) -> DoorRef<'_> {
        let door = self.map.lock().entry(key.to_string()).or_default().clone();
        DoorRef {
            doors: self,
            key: key.to_string(),
            door,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map.lock().len()
    }
}

struct DoorRef<'a> {
    doors: &'a Doors,
    key: String,
    door: Arc<Door>,
}

impl std::ops::Deref for DoorRef<'_> {
    type Target = Door;

    fn deref(&self) -> &Door {
        &self.door
    }
}

impl Drop for DoorRef<'_> {
    fn drop(&mut self) {
        let mut map = self.doors.map.lock();
        // Handles are only cloned under the map lock, so two means the map
        // and this one.
        if Arc::strong_count(&self.door) == 2 && !self.door.renamed.load(Ordering::Acquire) {
            map.remove(&self.key);
        }
    }
}

/// Thread list row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ThreadSummary {
    pub id: String,
    pub subject: String,
    pub from: String,
    /// Date of the latest message
    pub date: String,
    pub count: usize,
    pub unseen: usize,
}

/// Draft content as edited by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DraftContent {
    pub alias: String,
    pub subject: String,
    #[serde(rename = "For")]
    pub to: Vec<HeaderFor>,
    pub cc: Vec<CcHeader>,
    pub attach: Vec<AttachRef>,
    pub body: String,
}

impl DraftContent {
    fn sub_head(&self, thread_id: &str) -> SubHeader {
        SubHeader {
            thread_id: thread_id.to_string(),
            alias: self.alias.clone(),
            subject: self.subject.clone(),
            to: self.to.clone(),
            cc: self.cc.clone(),
            attach: self.attach.clone(),
            confirm: None,
        }
    }
}

/// Ids the store accepts from the relay. They become file names and
/// staging name fields.
pub fn valid_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

#[derive(Debug)]
pub struct ThreadStore {
    service: String,
    thread_dir: PathBuf,
    draft_dir: PathBuf,
    upload_dir: PathBuf,
    staging: Arc<Staging>,
    doors: Doors,
    clock: LocalIdClock,
    now: fn() -> String,
}

impl ThreadStore {
    pub fn new(
        service: &str,
        thread_dir: PathBuf,
        draft_dir: PathBuf,
        upload_dir: PathBuf,
        staging: Arc<Staging>,
    ) -> Self {
        Self {
            service: service.to_string(),
            thread_dir,
            draft_dir,
            upload_dir,
            staging,
            doors: Doors::default(),
            clock: LocalIdClock::new(),
            now: now_rfc3339,
        }
    }

    /// Use `now` for draft and seen dates.
    pub fn with_clock(mut self, now: fn() -> String) -> Self {
        self.now = now;
        self
    }

    pub fn thread_path(&self, thread_id: &str) -> PathBuf {
        self.thread_dir.join(thread_id)
    }

    pub fn draft_path(&self, id: &LocalId) -> PathBuf {
        self.draft_dir.join(id.to_string())
    }

    /// Allocate a local id for a new draft in `thread_id` (empty = new thread).
    pub fn new_draft_id(&self, thread_id: &str) -> LocalId {
        self.clock.next(thread_id)
    }

    fn door_key(id: &LocalId) -> String {
        if id.is_new_thread() {
            id.to_string()
        } else {
            id.thread_id().to_string()
        }
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// All threads and new-thread drafts, newest first.
    pub fn list_threads(&self) -> Result<Vec<ThreadSummary>> {
        let mut list = Vec::new();
        for (dir, drafts_only) in [(&self.thread_dir, false), (&self.draft_dir, true)] {
            for entry in fs::read_dir(dir)? {
                let id = entry?.file_name().to_string_lossy().into_owned();
                if drafts_only && !id.starts_with('_') {
                    continue;
                }
                let trailer = match self.read_trailer(&id) {
                    Ok(trailer) => trailer,
                    Err(StoreError::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                };
                if let Some(summary) = summarize(&id, &trailer) {
                    list.push(summary);
                }
            }
        }
        list.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.id.cmp(&b.id)));
        Ok(list)
    }

    pub fn index(&self, thread_id: &str) -> Result<Vec<IndexEntry>> {
        Ok(self.read_trailer(thread_id)?.index)
    }

    pub fn cc(&self, thread_id: &str) -> Result<Vec<CcEntry>> {
        Ok(self.read_trailer(thread_id)?.cc)
    }

    /// Trailer of a thread, or of a new-thread draft when the id starts
    /// with `_`.
    fn read_trailer(&self, thread_id: &str) -> Result<Trailer> {
        let door = self.doors.get(thread_id);
        let _guard = door.lock.read();
        let path = self.trailer_path(thread_id);
        let mut file = open_existing(&path)?.ok_or_else(|| StoreError::NotFound(thread_id.into()))?;
        Ok(Trailer::read_from(&mut file, thread_id)?.0)
    }

    fn trailer_path(&self, thread_id: &str) -> PathBuf {
        if thread_id.starts_with('_') {
            self.draft_dir.join(thread_id)
        } else {
            self.thread_path(thread_id)
        }
    }

    /// Copy the stored form of the selected messages (all when `ids` is
    /// empty) to `out`, in index order. Returns how many were written.
    pub fn write_messages<W: Write>(&self, thread_id: &str, ids: &[String], out: &mut W) -> Result<usize> {
        let door = self.doors.get(thread_id);
        let _guard = door.lock.read();
        let path = self.trailer_path(thread_id);
        let mut file = open_existing(&path)?.ok_or_else(|| StoreError::NotFound(thread_id.into()))?;
        let (trailer, _) = Trailer::read_from(&mut file, thread_id)?;

        let mut written = 0;
        for entry in trailer
            .index
            .iter()
            .filter(|e| ids.is_empty() || ids.contains(&e.id))
        {
            let bytes = if entry.is_draft() {
                let Some(mut draft) = open_existing(&self.draft_dir.join(&entry.id))? else {
                    tracing::debug!(service = %self.service, draft = %entry.id, "draft file gone");
                    continue;
                };
                read_at(&mut draft, 0, entry.size as usize)?
            } else {
                read_at(&mut file, entry.offset as u64, entry.size as usize)?
            };
            out.write_all(&bytes)?;
            written += 1;
        }
        Ok(written)
    }

    /// Head and body of a saved draft; `None` if it was sent or discarded.
    pub fn read_draft(&self, id: &LocalId) -> Result<Option<(StoredHead, Vec<u8>)>> {
        let Some(mut file) = open_existing(&self.draft_path(id))? else {
            return Ok(None);
        };
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let (head, body) = decode_head(&bytes)?;
        Ok(Some((head, bytes[body].to_vec())))
    }

    /// A stored message as forwarded to another user (no final newline).
    pub fn read_record(&self, thread_id: &str, msg_id: &str) -> Result<Option<Vec<u8>>> {
        let door = self.doors.get(thread_id);
        let _guard = door.lock.read();
        let Some(mut file) = open_existing(&self.thread_path(thread_id))? else {
            return Ok(None);
        };
        let (trailer, _) = Trailer::read_from(&mut file, thread_id)?;
        match trailer.entry(msg_id) {
            Some(e) if !e.is_draft() && e.size > 0 => {
                Ok(Some(read_at(&mut file, e.offset as u64, e.size as usize - 1)?))
            }
            _ => Ok(None),
        }
    }

    // ---------------------------------------------------------------------
    // Drafts
    // ---------------------------------------------------------------------

    /// Save or overwrite draft `id`.
    pub fn save_draft(&self, id: &LocalId, content: &DraftContent) -> Result<()> {
        let key = Self::door_key(id);
        let door = self.doors.get(&key);
        let _guard = door.lock.write();
        door.ensure_open(&key)?;

        let date = (self.now)();
        let head = StoredHead {
            id: id.to_string(),
            from: "self".to_string(),
            posted: "draft".to_string(),
            len: content.body.len() as u64,
            sub_head: content.sub_head(id.thread_id()),
        };
        let msg = encode_message(&head, content.body.as_bytes())?;
        let entry = IndexEntry {
            id: id.to_string(),
            from: "self".to_string(),
            alias: content.alias.clone(),
            date,
            subject: content.subject.clone(),
            offset: DRAFT_OFFSET,
            size: msg.size(),
            checksum: msg.checksum,
            ..Default::default()
        };

        let (trailer, offset) = if id.is_new_thread() {
            (
                Trailer {
                    index: vec![entry],
                    cc: Vec::new(),
                },
                None,
            )
        } else {
            let mut file = self.open_thread(id.thread_id())?;
            let (mut trailer, pos) = Trailer::read_from(&mut file, id.thread_id())?;
            match trailer.position(&entry.id) {
                Some(i) => trailer.index[i] = entry,
                None => {
                    let slot = trailer.insertion_point(&entry.id);
                    trailer.index.insert(slot, entry);
                }
            }
            (trailer, Some(pos))
        };

        let name = StagingName::new(StageOp::WriteDraft, id.thread_id())
            .local(&id.suffix())
            .at(offset);
        let mut staged = self.staging.begin(name)?;
        staged.write_all(&msg.bytes)?;
        staged.write_all(&trailer.encode()?)?;
        let staged = staged.commit(&self.staging)?;
        self.apply_draft(&staged)?;
        self.staging.finish(staged)?;
        tracing::debug!(service = %self.service, draft = %id, "draft saved");
        Ok(())
    }

    /// Remove draft `id` and its index slot.
    pub fn discard_draft(&self, id: &LocalId) -> Result<Outcome> {
        let key = Self::door_key(id);
        let door = self.doors.get(&key);
        let _guard = door.lock.write();
        door.ensure_open(&key)?;

        let draft_exists = self.draft_path(id).exists();
        let (trailer, offset) = if id.is_new_thread() {
            if !draft_exists {
                return Ok(self.benign(Outcome::Missing, id, "draft already cleared"));
            }
            (Trailer::default(), None)
        } else {
            let mut file = self.open_thread(id.thread_id())?;
            let (mut trailer, pos) = Trailer::read_from(&mut file, id.thread_id())?;
            match trailer.position(&id.to_string()) {
                Some(i) => {
                    trailer.index.remove(i);
                }
                None if !draft_exists => {
                    return Ok(self.benign(Outcome::Missing, id, "draft already cleared"));
                }
                None => {}
            }
            (trailer, Some(pos))
        };

        let name = StagingName::new(StageOp::DiscardDraft, id.thread_id())
            .local(&id.suffix())
            .at(offset);
        let mut staged = self.staging.begin(name)?;
        staged.write_all(&trailer.encode()?)?;
        let staged = staged.commit(&self.staging)?;
        self.apply_draft(&staged)?;
        self.staging.finish(staged)?;
        tracing::debug!(service = %self.service, draft = %id, "draft discarded");
        Ok(Outcome::Done)
    }

    /// Check that draft `id` can be sent. Performs no mutation.
    pub fn validate_draft(&self, id: &LocalId) -> Result<()> {
        let (head, _) = self
            .read_draft(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let sub = &head.sub_head;
        if id.is_new_thread() && sub.subject.trim().is_empty() {
            return Err(ValidationError::MissingSubject(id.to_string()).into());
        }
        if sub.to.is_empty() {
            return Err(ValidationError::NoRecipients(id.to_string()).into());
        }
        for (n, to) in sub.to.iter().enumerate() {
            if to.id.is_empty() {
                let who = sub
                    .cc
                    .get(n)
                    .map(|c| c.who.clone())
                    .unwrap_or_else(|| format!("recipient {n}"));
                return Err(ValidationError::UnknownRecipient(who).into());
            }
        }
        for attach in &sub.attach {
            let plain = Path::new(&attach.name)
                .file_name()
                .is_some_and(|n| n == attach.name.as_str());
            if !plain || !self.upload_dir.join(&attach.name).is_file() {
                return Err(ValidationError::MissingAttachment(attach.name.clone()).into());
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Messages
    // ---------------------------------------------------------------------

    /// Store a delivery from the relay.
    pub fn store_received(&self, header: &Header, body: &[u8]) -> Result<Outcome> {
        let sub = header.sub_head.clone().unwrap_or_default();
        if !valid_id(&header.id) {
            return Ok(self.benign(Outcome::Invalid, &header.id, "invalid message id"));
        }
        let thread_id = if sub.thread_id.is_empty() {
            header.id.clone()
        } else {
            sub.thread_id.clone()
        };
        if !valid_id(&thread_id) {
            return Ok(self.benign(Outcome::Invalid, &thread_id, "invalid thread id"));
        }

        let door = self.doors.get(&thread_id);
        let _guard = door.lock.write();

        let head = StoredHead {
            id: header.id.clone(),
            from: header.from.clone(),
            posted: header.posted.clone(),
            len: body.len() as u64,
            sub_head: sub,
        };
        let msg = match encode_message(&head, body) {
            Ok(msg) => msg,
            Err(StoreError::Validation(ValidationError::HeadTooLong(..))) => {
                return Ok(self.benign(Outcome::Invalid, &head.id, "message head too long"));
            }
            Err(e) => return Err(e),
        };
        let entry = IndexEntry {
            id: head.id.clone(),
            from: head.from.clone(),
            alias: head.sub_head.alias.clone(),
            date: head.posted.clone(),
            subject: head.sub_head.subject.clone(),
            ..Default::default()
        };
        self.insert_message(StageOp::Received, &thread_id, entry, msg, &head.sub_head.cc, None)
    }

    /// Turn draft `id` into the stored message `msg_id` once the relay
    /// acknowledged it. A draft starting a new thread becomes thread
    /// `msg_id` and its provisional id stops accepting operations.
    pub fn store_sent(&self, id: &LocalId, msg_id: &str, posted: &str, from: &str) -> Result<Outcome> {
        if !valid_id(msg_id) {
            return Ok(self.benign(Outcome::Invalid, msg_id, "invalid message id"));
        }
        let key = Self::door_key(id);
        let door = self.doors.get(&key);
        let _guard = door.lock.write();
        if door.ensure_open(&key).is_err() {
            return Ok(self.benign(Outcome::Missing, id, "draft already sent"));
        }

        let Some((draft, body)) = self.read_draft(id)? else {
            return Ok(self.benign(Outcome::Missing, id, "saved file was cleared"));
        };
        let thread_id = if id.is_new_thread() {
            msg_id.to_string()
        } else {
            id.thread_id().to_string()
        };
        let head = StoredHead {
            id: msg_id.to_string(),
            from: from.to_string(),
            posted: posted.to_string(),
            len: body.len() as u64,
            sub_head: draft.sub_head,
        };
        let msg = encode_message(&head, &body)?;
        let entry = IndexEntry {
            id: msg_id.to_string(),
            from: from.to_string(),
            alias: head.sub_head.alias.clone(),
            date: posted.to_string(),
            subject: head.sub_head.subject.clone(),
            seen: posted.to_string(),
            ..Default::default()
        };
        let outcome =
            self.insert_message(StageOp::Sent, &thread_id, entry, msg, &head.sub_head.cc, Some(id))?;
        if id.is_new_thread() && outcome.is_done() {
            door.renamed.store(true, Ordering::Release);
            tracing::info!(service = %self.service, draft = %id, thread = %thread_id, "thread renamed");
        }
        Ok(outcome)
    }

    /// Record that `msg_id` in `thread_id` was seen.
    pub fn mark_seen(&self, thread_id: &str, msg_id: &str) -> Result<Outcome> {
        let door = self.doors.get(thread_id);
        let _guard = door.lock.write();
        door.ensure_open(thread_id)?;

        let mut file = self.open_thread(thread_id)?;
        let (mut trailer, pos) = Trailer::read_from(&mut file, thread_id)?;
        let Some(i) = trailer.position(msg_id) else {
            return Ok(self.benign(Outcome::Missing, msg_id, "message not in index"));
        };
        if !trailer.index[i].seen.is_empty() {
            return Ok(Outcome::Unchanged);
        }
        trailer.index[i].seen = (self.now)();
        self.rewrite_trailer(StageOp::Seen, thread_id, msg_id, &trailer, pos)?;
        Ok(Outcome::Done)
    }

    /// Handle a forwarded copy of message `confirm_id`: store it if absent,
    /// otherwise compare it with the stored copy and note any mismatch on
    /// the index entry.
    pub fn store_forwarded(&self, header: &Header, confirm_id: &str, record: &[u8]) -> Result<Outcome> {
        let sub = header.sub_head.clone().unwrap_or_default();
        let thread_id = if sub.thread_id.is_empty() {
            confirm_id.to_string()
        } else {
            sub.thread_id
        };
        if !valid_id(confirm_id) || !valid_id(&thread_id) {
            return Ok(self.benign(Outcome::Invalid, confirm_id, "invalid forwarded id"));
        }

        let door = self.doors.get(&thread_id);
        let _guard = door.lock.write();
        let msg = from_record(record);

        if let Some(mut file) = open_existing(&self.thread_path(&thread_id))? {
            let (mut trailer, pos) = Trailer::read_from(&mut file, &thread_id)?;
            if let Some(i) = trailer.position(confirm_id) {
                let stored = &trailer.index[i];
                if stored.checksum == msg.checksum && stored.size == msg.size() {
                    tracing::debug!(service = %self.service, msg = confirm_id, "forward confirmed");
                    return Ok(Outcome::Unchanged);
                }
                let note = format!("{} confirm failed", header.from);
                if stored.forwarded_by == note {
                    return Ok(Outcome::Unchanged);
                }
                tracing::warn!(
                    service = %self.service,
                    thread = %thread_id,
                    msg = confirm_id,
                    from = %header.from,
                    "forwarded copy does not match stored message"
                );
                trailer.index[i].forwarded_by = note;
                self.rewrite_trailer(StageOp::Confirm, &thread_id, confirm_id, &trailer, pos)?;
                return Ok(Outcome::Annotated);
            }
        } else if thread_id != confirm_id {
            return Ok(self.benign(Outcome::Missing, &thread_id, "thread not found"));
        }

        let Ok((head, _)) = decode_head(&msg.bytes) else {
            return Ok(self.benign(Outcome::Invalid, confirm_id, "unreadable forwarded record"));
        };
        if head.id != confirm_id {
            return Ok(self.benign(Outcome::Invalid, confirm_id, "forwarded record id mismatch"));
        }
        let entry = IndexEntry {
            id: head.id.clone(),
            from: head.from.clone(),
            alias: head.sub_head.alias.clone(),
            date: head.posted.clone(),
            subject: head.sub_head.subject.clone(),
            forwarded_by: header.from.clone(),
            ..Default::default()
        };
        self.insert_message(StageOp::Received, &thread_id, entry, msg, &head.sub_head.cc, None)
    }

    /// Stage and apply a message insert. The caller holds the door.
    fn insert_message(
        &self,
        op: StageOp,
        thread_id: &str,
        mut entry: IndexEntry,
        msg: EncodedMessage,
        cc: &[CcHeader],
        draft: Option<&LocalId>,
    ) -> Result<Outcome> {
        entry.size = msg.size();
        entry.checksum = msg.checksum;
        let path = self.thread_path(thread_id);
        let local = draft.map(LocalId::suffix).unwrap_or_default();

        let (name, tail, trailer) = if entry.id == thread_id {
            if path.exists() {
                return Ok(self.benign(Outcome::Duplicate, thread_id, "thread already stored"));
            }
            entry.offset = 0;
            let mut trailer = Trailer::default();
            trailer.merge_cc(cc, &entry.date, entry.checksum);
            trailer.index.push(entry);
            let name = StagingName::new(op, thread_id).msg(thread_id).local(&local);
            (name, Vec::new(), trailer)
        } else {
            let Some(mut file) = open_existing(&path)? else {
                return Ok(self.benign(Outcome::Missing, thread_id, "thread not found"));
            };
            let (mut trailer, pos) = Trailer::read_from(&mut file, thread_id)?;
            if let Some(i) = draft.and_then(|d| trailer.position(&d.to_string())) {
                trailer.index.remove(i);
            }
            if trailer.position(&entry.id).is_some() {
                return Ok(self.benign(Outcome::Duplicate, &entry.id, "message already stored"));
            }
            let slot = trailer.insertion_point(&entry.id);
            let split = trailer.split_offset(slot, pos);
            let tail = read_at(&mut file, split, (pos - split) as usize)?;
            entry.offset = split as i64;
            let msg_id = entry.id.clone();
            let (date, checksum) = (entry.date.clone(), entry.checksum);
            trailer.insert_at(slot, entry);
            trailer.merge_cc(cc, &date, checksum);
            let name = StagingName::new(op, thread_id)
                .msg(&msg_id)
                .local(&local)
                .at(Some(split));
            (name, tail, trailer)
        };

        let mut staged = self.staging.begin(name)?;
        staged.write_all(&msg.bytes)?;
        staged.write_all(&tail)?;
        staged.write_all(&trailer.encode()?)?;
        let staged = staged.commit(&self.staging)?;
        self.apply_message(&staged)?;
        tracing::debug!(
            service = %self.service,
            op = staged.name.op.tag(),
            thread = %thread_id,
            msg = %staged.name.msg_id,
            "message stored"
        );
        self.staging.finish(staged)?;
        Ok(Outcome::Done)
    }

    fn rewrite_trailer(
        &self,
        op: StageOp,
        thread_id: &str,
        msg_id: &str,
        trailer: &Trailer,
        pos: u64,
    ) -> Result<()> {
        let name = StagingName::new(op, thread_id).msg(msg_id).at(Some(pos));
        let mut staged = self.staging.begin(name)?;
        staged.write_all(&trailer.encode()?)?;
        let staged = staged.commit(&self.staging)?;
        apply_append(&staged, &self.thread_path(thread_id), pos, 0)?;
        self.staging.finish(staged)
    }

    // ---------------------------------------------------------------------
    // Apply & replay
    // ---------------------------------------------------------------------

    fn apply_message(&self, staged: &Staged) -> Result<()> {
        let name = &staged.name;
        if name.op == StageOp::Sent {
            let draft_thread = if name.is_new_thread() { "" } else { name.thread_id.as_str() };
            let draft = self.draft_dir.join(format!("{draft_thread}_{}", name.local));
            if remove_if_exists(&draft)? {
                sync_dir(&self.draft_dir)?;
            }
        }
        let dest = self.thread_path(&name.thread_id);
        if name.is_new_thread() {
            apply_link(staged, &dest)
        } else {
            let offset = name
                .offset
                .ok_or_else(|| StoreError::UnknownStagingFile(name.to_string()))?;
            apply_append(staged, &dest, offset, 0)
        }
    }

    fn apply_draft(&self, staged: &Staged) -> Result<()> {
        let name = &staged.name;
        let draft = self
            .draft_dir
            .join(format!("{}_{}", name.thread_id, name.local));
        remove_if_exists(&draft)?;
        if name.op == StageOp::WriteDraft {
            apply_link(staged, &draft)?;
        } else {
            sync_dir(&self.draft_dir)?;
        }
        if let Some(offset) = name.offset {
            let skip = match name.op {
                StageOp::WriteDraft => Trailer::read_from(&mut staged.open()?, &name.to_string())?.1,
                _ => 0,
            };
            apply_append(staged, &self.thread_path(&name.thread_id), offset, skip)?;
        }
        Ok(())
    }

    /// Finish a thread mutation left behind by a crash.
    pub fn replay(&self, staged: Staged) -> Result<()> {
        tracing::info!(service = %self.service, file = %staged.name, "completing staged operation");
        let name = &staged.name;
        match name.op {
            StageOp::Received | StageOp::Sent => self.apply_message(&staged)?,
            StageOp::WriteDraft | StageOp::DiscardDraft => self.apply_draft(&staged)?,
            StageOp::Seen | StageOp::Confirm => {
                let offset = name
                    .offset
                    .ok_or_else(|| StoreError::UnknownStagingFile(name.to_string()))?;
                apply_append(&staged, &self.thread_path(&name.thread_id), offset, 0)?;
            }
            StageOp::Replace => return Err(StoreError::UnknownStagingFile(name.to_string())),
        }
        self.staging.finish(staged)
    }

    fn open_thread(&self, thread_id: &str) -> Result<File> {
        let path = self.thread_path(thread_id);
        match OpenOptions::new().read(true).open(&path) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(thread_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn benign(&self, outcome: Outcome, id: impl std::fmt::Display, why: &str) -> Outcome {
        tracing::info!(service = %self.service, id = %id, ?outcome, "{why}");
        outcome
    }
}

fn open_existing(path: &Path) -> Result<Option<File>> {
    match File::open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn summarize(id: &str, trailer: &Trailer) -> Option<ThreadSummary> {
    let first = trailer.index.first()?;
    let last = trailer
        .index
        .iter()
        .filter(|e| !e.is_draft())
        .last()
        .unwrap_or(first);
    Some(ThreadSummary {
        id: id.to_string(),
        subject: first.subject.clone(),
        from: first.from.clone(),
        date: last.date.clone(),
        count: trailer.index.iter().filter(|e| !e.is_draft()).count(),
        unseen: trailer
            .index
            .iter()
            .filter(|e| !e.is_draft() && e.seen.is_empty())
            .count(),
    })
}
