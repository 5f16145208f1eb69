use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::LOCAL_ID_COUNTER_DIGITS;
use crate::error::ProtocolError;

/// Provisional id of content the relay has not yet accepted:
/// `<threadId>_<12 hex digit millisecond counter>`.
///
/// An empty thread id means the content starts a new thread, so the id
/// begins with `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId {
    thread_id: String,
    counter: u64,
}

impl LocalId {
    pub fn new(thread_id: impl Into<String>, counter: u64) -> Self {
        Self {
            thread_id: thread_id.into(),
            counter,
        }
    }

    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        let (thread_id, suffix) = s
            .rsplit_once('_')
            .ok_or_else(|| ProtocolError::InvalidLocalId(s.to_string()))?;
        if suffix.len() != LOCAL_ID_COUNTER_DIGITS {
            return Err(ProtocolError::InvalidLocalId(s.to_string()));
        }
        let counter = u64::from_str_radix(suffix, 16)
            .map_err(|_| ProtocolError::InvalidLocalId(s.to_string()))?;
        Ok(Self::new(thread_id, counter))
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// True when the draft belongs to no thread yet.
    pub fn is_new_thread(&self) -> bool {
        self.thread_id.is_empty()
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// The fixed-width hex counter, as used in staging file names.
    pub fn suffix(&self) -> String {
        format!("{:0width$x}", self.counter, width = LOCAL_ID_COUNTER_DIGITS)
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.thread_id, self.suffix())
    }
}

/// Hands out strictly increasing millisecond counters for local ids, even
/// when called several times within one millisecond.
#[derive(Debug, Default)]
pub struct LocalIdClock {
    last: AtomicU64,
}

impl LocalIdClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, thread_id: &str) -> LocalId {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev + 1);
            match self.last.compare_exchange_weak(
                prev,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return LocalId::new(thread_id, candidate),
                Err(actual) => prev = actual,
            }
        }
    }
}

/// One-byte operation tag that prefixes every send queue id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SendTag {
    /// Send a saved draft; id is its local id
    Thread,
    /// Presence list edit; id is `+uid` or `-uid`
    Presence,
    /// Forward a stored message; id is `threadId/msgId/uid`
    Forward,
}

impl SendTag {
    pub fn as_char(self) -> char {
        match self {
            Self::Thread => 't',
            Self::Presence => 'o',
            Self::Forward => 'f',
        }
    }

    pub fn from_char(c: char) -> Result<Self, ProtocolError> {
        match c {
            't' => Ok(Self::Thread),
            'o' => Ok(Self::Presence),
            'f' => Ok(Self::Forward),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

/// Current UTC time in the RFC 3339 form used in every stored date.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_id_display_and_parse() {
        let id = LocalId::new("t1", 0x1234);
        assert_eq!(id.to_string(), "t1_000000001234");
        assert_eq!(LocalId::parse("t1_000000001234").unwrap(), id);
    }

    #[test]
    fn test_new_thread_local_id() {
        let id = LocalId::parse("_0000000000ff").unwrap();
        assert!(id.is_new_thread());
        assert_eq!(id.counter(), 0xff);
        assert_eq!(id.to_string(), "_0000000000ff");
    }

    #[test]
    fn test_parse_rejects_bad_suffix() {
        assert!(LocalId::parse("t1").is_err());
        assert!(LocalId::parse("t1_12").is_err());
        assert!(LocalId::parse("t1_zzzzzzzzzzzz").is_err());
    }

    #[test]
    fn test_clock_is_strictly_increasing() {
        let clock = LocalIdClock::new();
        let mut last = clock.next("");
        for _ in 0..1000 {
            let next = clock.next("");
            assert!(next.counter() > last.counter());
            assert!(next.to_string() > last.to_string());
            last = next;
        }
    }

    #[test]
    fn test_send_tag_chars() {
        for tag in [SendTag::Thread, SendTag::Presence, SendTag::Forward] {
            assert_eq!(SendTag::from_char(tag.as_char()).unwrap(), tag);
        }
        assert!(SendTag::from_char('x').is_err());
    }
}
