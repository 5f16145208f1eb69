//! Presence ("ohi") lists.
//!
//! `ohi` on disk maps each contact this user announces presence to onto the
//! date it was added. The relay separately reports which contacts are online
//! right now; that map lives only in memory.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use tmtp_shared::now_rfc3339;

use crate::error::{Result, StoreError};
use crate::staging::Staging;

#[derive(Debug)]
pub struct Presence {
    path: PathBuf,
    staging: Arc<Staging>,
    announce: Mutex<BTreeMap<String, String>>,
    online: Mutex<BTreeMap<String, String>>,
}

impl Presence {
    pub fn load(path: PathBuf, staging: Arc<Staging>) -> Result<Self> {
        let announce = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            staging,
            announce: Mutex::new(announce),
            online: Mutex::new(BTreeMap::new()),
        })
    }

    /// Contacts this user announces presence to.
    pub fn announced(&self) -> Vec<String> {
        self.announce.lock().keys().cloned().collect()
    }

    /// Apply an acknowledged edit: `+uid` adds, `-uid` removes.
    pub fn apply_edit(&self, edit: &str) -> Result<bool> {
        let mut announce = self.announce.lock();
        let mut next = announce.clone();
        let changed = match (edit.strip_prefix('+'), edit.strip_prefix('-')) {
            (Some(uid), _) if !uid.is_empty() => {
                !next.contains_key(uid) && next.insert(uid.to_string(), now_rfc3339()).is_none()
            }
            (_, Some(uid)) if !uid.is_empty() => next.remove(uid).is_some(),
            _ => return Err(StoreError::NotFound(format!("presence edit {edit:?}"))),
        };
        if changed {
            let bytes = serde_json::to_vec(&next)?;
            self.staging.replace(&self.path, &bytes)?;
            *announce = next;
        }
        Ok(changed)
    }

    /// Replace the online map with the relay's list after login.
    pub fn set_online(&self, uids: &[String]) {
        let now = now_rfc3339();
        let mut online = self.online.lock();
        online.clear();
        for uid in uids {
            online.insert(uid.clone(), now.clone());
        }
    }

    /// Record one contact going on or off line.
    pub fn update_online(&self, uid: &str, is_online: bool) {
        let mut online = self.online.lock();
        if is_online {
            online.insert(uid.to_string(), now_rfc3339());
        } else {
            online.remove(uid);
        }
    }

    pub fn online(&self) -> Vec<String> {
        self.online.lock().keys().cloned().collect()
    }

    /// Forget every online status, as when the link drops.
    pub fn clear_online(&self) {
        self.online.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash::{Checkpoint, CrashHook};

    fn presence(dir: &tempfile::TempDir) -> Presence {
        let staging = Arc::new(Staging::new(dir.path(), CrashHook::disabled()));
        Presence::load(dir.path().join("ohi"), staging).unwrap()
    }

    #[test]
    fn test_edits_persist() {
        let dir = tempfile::tempdir().unwrap();
        let p = presence(&dir);
        assert!(p.apply_edit("+u1").unwrap());
        assert!(p.apply_edit("+u2").unwrap());
        assert!(!p.apply_edit("+u2").unwrap());
        assert!(p.apply_edit("-u1").unwrap());
        assert!(p.apply_edit("u3").is_err());

        assert_eq!(presence(&dir).announced(), vec!["u2".to_string()]);
    }

    #[test]
    fn test_failed_write_keeps_announced_list() {
        let dir = tempfile::tempdir().unwrap();
        presence(&dir).apply_edit("+u1").unwrap();

        let failing = Arc::new(Staging::new(dir.path(), CrashHook::abort_at(Checkpoint::Staged)));
        let p = Presence::load(dir.path().join("ohi"), failing).unwrap();
        assert!(p.apply_edit("+u2").is_err());
        assert!(p.apply_edit("-u1").is_err());
        assert_eq!(p.announced(), vec!["u1".to_string()]);
    }

    #[test]
    fn test_online_map() {
        let dir = tempfile::tempdir().unwrap();
        let p = presence(&dir);
        p.set_online(&["u1".into(), "u2".into()]);
        p.update_online("u3", true);
        p.update_online("u1", false);
        assert_eq!(p.online(), vec!["u2".to_string(), "u3".to_string()]);
        p.clear_online();
        assert!(p.online().is_empty());
    }
}
