//! Thread file trailer: `[index JSON][Cc JSON][index len: 8 hex][Cc len: 8 hex]`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use serde::{Deserialize, Serialize};

use tmtp_shared::constants::CC_NOTE_MAX;
use tmtp_shared::CcHeader;

use crate::error::{Result, StoreError};

/// Hex digits holding the two trailer lengths.
pub const TRAILER_LEN_DIGITS: usize = 16;

/// Offset recorded for content that lives in a draft file.
pub const DRAFT_OFFSET: i64 = -1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct IndexEntry {
    pub id: String,
    pub from: String,
    pub alias: String,
    pub date: String,
    pub subject: String,
    /// Date the message was first seen; empty while unread
    pub seen: String,
    pub forwarded_by: String,
    pub offset: i64,
    pub size: u64,
    pub checksum: u32,
}

impl IndexEntry {
    pub fn is_draft(&self) -> bool {
        self.offset == DRAFT_OFFSET
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CcEntry {
    pub who: String,
    pub by: String,
    pub who_uid: String,
    pub by_uid: String,
    pub date: String,
    pub note: String,
    pub subscribe: bool,
    /// Checksum of the message that introduced this entry
    pub checksum: u32,
}

impl CcEntry {
    pub fn from_header(cc: &CcHeader, date: &str, checksum: u32) -> Self {
        Self {
            who: cc.who.clone(),
            by: cc.by.clone(),
            who_uid: cc.who_uid.clone(),
            by_uid: cc.by_uid.clone(),
            date: date.to_string(),
            note: cc.note.chars().take(CC_NOTE_MAX).collect(),
            subscribe: cc.subscribe,
            checksum,
        }
    }

    fn key(&self) -> &str {
        if self.who_uid.is_empty() {
            &self.who
        } else {
            &self.who_uid
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trailer {
    pub index: Vec<IndexEntry>,
    pub cc: Vec<CcEntry>,
}

impl Trailer {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = serde_json::to_vec(&self.index)?;
        let index_len = out.len();
        let cc = serde_json::to_vec(&self.cc)?;
        let cc_len = cc.len();
        out.extend_from_slice(&cc);
        out.extend_from_slice(encode_len(index_len)?.as_bytes());
        out.extend_from_slice(encode_len(cc_len)?.as_bytes());
        Ok(out)
    }

    /// Read the trailer at the end of `file`. Returns it with the offset
    /// where it starts, which is also where message content ends.
    pub fn read_from(file: &mut File, name: &str) -> Result<(Self, u64)> {
        let corrupt = || StoreError::CorruptTrailer(name.to_string());
        let file_len = file.metadata()?.len();
        if file_len < TRAILER_LEN_DIGITS as u64 {
            return Err(corrupt());
        }
        let mut lens = [0u8; TRAILER_LEN_DIGITS];
        file.seek(SeekFrom::Start(file_len - TRAILER_LEN_DIGITS as u64))?;
        file.read_exact(&mut lens)?;
        let index_len = decode_len(&lens[..8]).ok_or_else(corrupt)?;
        let cc_len = decode_len(&lens[8..]).ok_or_else(corrupt)?;
        let body_len = index_len + cc_len;
        let pos = file_len
            .checked_sub(TRAILER_LEN_DIGITS as u64 + body_len)
            .ok_or_else(corrupt)?;
        let mut json = vec![0u8; body_len as usize];
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(&mut json)?;
        let (index, cc) = json.split_at(index_len as usize);
        let trailer = Self {
            index: serde_json::from_slice(index).map_err(|_| corrupt())?,
            cc: serde_json::from_slice(cc).map_err(|_| corrupt())?,
        };
        Ok((trailer, pos))
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.iter().position(|e| e.id == id)
    }

    pub fn entry(&self, id: &str) -> Option<&IndexEntry> {
        self.index.iter().find(|e| e.id == id)
    }

    /// Where a message with `id` goes in id order.
    pub fn insertion_point(&self, id: &str) -> usize {
        self.index.partition_point(|e| e.id.as_str() < id)
    }

    /// Offset where content inserted at `slot` begins: the first stored
    /// message at or after the slot, else the trailer position.
    pub fn split_offset(&self, slot: usize, trailer_pos: u64) -> u64 {
        self.index[slot..]
            .iter()
            .find(|e| !e.is_draft())
            .map(|e| e.offset as u64)
            .unwrap_or(trailer_pos)
    }

    /// Insert `entry` at `slot`, moving later stored messages by its size.
    pub fn insert_at(&mut self, slot: usize, entry: IndexEntry) {
        let shift = entry.size as i64;
        for later in self.index[slot..].iter_mut().filter(|e| !e.is_draft()) {
            later.offset += shift;
        }
        self.index.insert(slot, entry);
    }

    /// Add Cc entries for recipients not yet listed.
    pub fn merge_cc(&mut self, cc: &[CcHeader], date: &str, checksum: u32) {
        for header in cc {
            let entry = CcEntry::from_header(header, date, checksum);
            if !self.cc.iter().any(|e| e.key() == entry.key()) {
                self.cc.push(entry);
            }
        }
    }
}

fn encode_len(len: usize) -> Result<String> {
    let len = u32::try_from(len)
        .map_err(|_| StoreError::CorruptTrailer(format!("trailer section of {len} bytes")))?;
    Ok(hex::encode(len.to_be_bytes()))
}

fn decode_len(digits: &[u8]) -> Option<u64> {
    let mut raw = [0u8; 4];
    hex::decode_to_slice(digits, &mut raw).ok()?;
    Some(u32::from_be_bytes(raw) as u64)
}
