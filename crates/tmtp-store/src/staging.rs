//! Stage-then-commit file mutations.
//!
//! Every mutation of a thread file, draft or service file is first written
//! in full to `<temp>/<name>.tmp`, synced, renamed to `<temp>/<name>` and the
//! directory synced. That rename is the durability boundary: a file with a
//! final name holds everything needed to redo the mutation, and its name
//! says how. After the destination is updated and synced the staging file is
//! removed. At startup [`Staging::recover`] drops `.tmp` leftovers and
//! returns the rest for replay.
//!
//! Name grammar: `<op>_<threadId>_<messageId>_<localSuffix>_<offset>`, with
//! empty fields where an op has no use for them. For `rf` the thread id
//! field carries the name of the service file being replaced.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::crash::{Checkpoint, CrashHook};
use crate::error::{Result, StoreError};

const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageOp {
    /// Store a message received from the relay
    Received,
    /// Store a sent message once the relay acknowledged it
    Sent,
    /// Save (write) a draft
    WriteDraft,
    /// Discard a draft
    DiscardDraft,
    /// Mark a message seen
    Seen,
    /// Annotate a failed forward confirmation
    Confirm,
    /// Replace a whole service file
    Replace,
}

impl StageOp {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Received => "sr",
            Self::Sent => "ss",
            Self::WriteDraft => "ws",
            Self::DiscardDraft => "ds",
            Self::Seen => "sn",
            Self::Confirm => "cf",
            Self::Replace => "rf",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "sr" => Self::Received,
            "ss" => Self::Sent,
            "ws" => Self::WriteDraft,
            "ds" => Self::DiscardDraft,
            "sn" => Self::Seen,
            "cf" => Self::Confirm,
            "rf" => Self::Replace,
            _ => return None,
        })
    }
}

/// Self-describing name of a staging file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingName {
    pub op: StageOp,
    pub thread_id: String,
    pub msg_id: String,
    pub local: String,
    /// Byte offset in the destination where the staged bytes land
    pub offset: Option<u64>,
}

impl StagingName {
    pub fn new(op: StageOp, thread_id: &str) -> Self {
        Self {
            op,
            thread_id: thread_id.to_string(),
            msg_id: String::new(),
            local: String::new(),
            offset: None,
        }
    }

    pub fn msg(mut self, msg_id: &str) -> Self {
        self.msg_id = msg_id.to_string();
        self
    }

    pub fn local(mut self, suffix: &str) -> Self {
        self.local = suffix.to_string();
        self
    }

    pub fn at(mut self, offset: Option<u64>) -> Self {
        self.offset = offset;
        self
    }

    /// True when the staged content becomes a new thread file.
    pub fn is_new_thread(&self) -> bool {
        !self.thread_id.is_empty() && self.thread_id == self.msg_id
    }
}

impl fmt::Display for StagingName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}_",
            self.op.tag(),
            self.thread_id,
            self.msg_id,
            self.local
        )?;
        if let Some(offset) = self.offset {
            write!(f, "{offset}")?;
        }
        Ok(())
    }
}

impl FromStr for StagingName {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || StoreError::UnknownStagingFile(s.to_string());
        let parts: Vec<&str> = s.splitn(5, '_').collect();
        let [tag, thread_id, msg_id, local, offset] = parts.as_slice() else {
            return Err(bad());
        };
        let op = StageOp::from_tag(tag).ok_or_else(bad)?;
        let offset = if offset.is_empty() {
            None
        } else {
            Some(offset.parse::<u64>().map_err(|_| bad())?)
        };
        Ok(Self {
            op,
            thread_id: thread_id.to_string(),
            msg_id: msg_id.to_string(),
            local: local.to_string(),
            offset,
        })
    }
}

/// The staging directory of one service.
#[derive(Debug)]
pub struct Staging {
    dir: PathBuf,
    crash: CrashHook,
}

impl Staging {
    pub fn new(dir: impl Into<PathBuf>, crash: CrashHook) -> Self {
        Self {
            dir: dir.into(),
            crash,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Open `<name>.tmp` for writing. Fails if it already exists.
    pub fn begin(&self, name: StagingName) -> Result<StagedFile> {
        let file_name = name.to_string();
        let tmp_path = self.dir.join(format!("{file_name}{TMP_SUFFIX}"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        Ok(StagedFile {
            path: self.dir.join(&file_name),
            tmp_path,
            name,
            file,
        })
    }

    /// Remove a staging file after its apply routine completed.
    pub fn finish(&self, staged: Staged) -> Result<()> {
        let file_name = staged.name.to_string();
        self.crash.check(Checkpoint::Applied, &file_name)?;
        fs::remove_file(&staged.path)?;
        tracing::trace!(file = %file_name, "staging complete");
        Ok(())
    }

    /// Discard incomplete `.tmp` files and return committed ones in name
    /// order, ready for replay.
    pub fn recover(&self) -> Result<Vec<Staged>> {
        let mut pending = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.ends_with(TMP_SUFFIX) {
                tracing::info!(file = %file_name, "discarding incomplete staging file");
                fs::remove_file(entry.path())?;
                continue;
            }
            let name: StagingName = file_name.parse()?;
            pending.push(Staged {
                name,
                path: entry.path(),
            });
        }
        pending.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(pending)
    }

    /// Replace `target` with `bytes` through an `rf` staging file.
    pub fn replace(&self, target: &Path, bytes: &[u8]) -> Result<()> {
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| StoreError::NotFound(target.display().to_string()))?;
        let mut staged = self.begin(StagingName::new(StageOp::Replace, &file_name))?;
        staged.write_all(bytes)?;
        let staged = staged.commit(self)?;
        apply_replace(&staged, target)?;
        self.finish(staged)
    }
}

/// A staging file still being written.
#[derive(Debug)]
pub struct StagedFile {
    name: StagingName,
    tmp_path: PathBuf,
    path: PathBuf,
    file: File,
}

impl StagedFile {
    pub fn name(&self) -> &StagingName {
        &self.name
    }

    /// Sync, rename to the final name and sync the directory.
    pub fn commit(self, staging: &Staging) -> Result<Staged> {
        self.file.sync_all()?;
        drop(self.file);
        fs::rename(&self.tmp_path, &self.path)?;
        sync_dir(staging.dir())?;
        let staged = Staged {
            name: self.name,
            path: self.path,
        };
        staging
            .crash
            .check(Checkpoint::Staged, &staged.name.to_string())?;
        Ok(staged)
    }
}

impl Write for StagedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// A committed staging file awaiting (or replaying) its apply routine.
#[derive(Debug, Clone)]
pub struct Staged {
    pub name: StagingName,
    pub path: PathBuf,
}

impl Staged {
    pub fn open(&self) -> Result<File> {
        Ok(File::open(&self.path)?)
    }

    pub fn read_all(&self) -> Result<Vec<u8>> {
        Ok(fs::read(&self.path)?)
    }
}

/// Truncate `dest` at `offset` and append the staged bytes from `skip` on.
///
/// Running it twice yields the same file, so replay after a crash inside
/// apply is safe.
pub fn apply_append(staged: &Staged, dest: &Path, offset: u64, skip: u64) -> Result<()> {
    let mut src = staged.open()?;
    src.seek(SeekFrom::Start(skip))?;
    let mut out = OpenOptions::new().write(true).open(dest)?;
    out.set_len(offset)?;
    out.seek(SeekFrom::Start(offset))?;
    io::copy(&mut src, &mut out)?;
    out.sync_all()?;
    Ok(())
}

/// Hard-link the staged file into place as `dest`.
pub fn apply_link(staged: &Staged, dest: &Path) -> Result<()> {
    match fs::hard_link(&staged.path, dest) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e.into()),
    }
    if let Some(dir) = dest.parent() {
        sync_dir(dir)?;
    }
    Ok(())
}

/// Truncate `target` and copy the whole staged file into it.
pub fn apply_replace(staged: &Staged, target: &Path) -> Result<()> {
    let existed = target.exists();
    let mut src = staged.open()?;
    let mut out = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(target)?;
    out.set_len(0)?;
    io::copy(&mut src, &mut out)?;
    out.sync_all()?;
    if !existed {
        if let Some(dir) = target.parent() {
            sync_dir(dir)?;
        }
    }
    Ok(())
}

/// Remove a file, treating absence as success.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Read `len` bytes at `offset`.
pub fn read_at(file: &mut File, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_round_trip() {
        let name = StagingName::new(StageOp::Sent, "m7")
            .msg("m7")
            .local("00000000abcd")
            .at(None);
        assert_eq!(name.to_string(), "ss_m7_m7_00000000abcd_");
        assert_eq!(name.to_string().parse::<StagingName>().unwrap(), name);
        assert!(name.is_new_thread());

        let name = StagingName::new(StageOp::WriteDraft, "")
            .local("0000000000ff")
            .at(Some(0));
        assert_eq!(name.to_string(), "ws___0000000000ff_0");
        assert_eq!(name.to_string().parse::<StagingName>().unwrap(), name);
        assert!(!name.is_new_thread());
    }

    #[test]
    fn test_name_rejects_garbage() {
        assert!("zz_a_b_c_1".parse::<StagingName>().is_err());
        assert!("sr_a_b".parse::<StagingName>().is_err());
        assert!("sr_a_b_c_x".parse::<StagingName>().is_err());
    }

    #[test]
    fn test_replace_and_recover() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("temp");
        fs::create_dir(&temp).unwrap();
        let staging = Staging::new(&temp, CrashHook::disabled());

        let target = dir.path().join("sendq");
        staging.replace(&target, b"[1,2,3]").unwrap();
        staging.replace(&target, b"[]").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"[]");
        assert!(staging.recover().unwrap().is_empty());
    }

    #[test]
    fn test_recover_discards_tmp_and_keeps_committed() {
        let dir = tempfile::tempdir().unwrap();
        let staging = Staging::new(dir.path(), CrashHook::abort_at(Checkpoint::Staged));

        let mut half = staging
            .begin(StagingName::new(StageOp::Seen, "t1").at(Some(10)))
            .unwrap();
        half.write_all(b"partial").unwrap();
        drop(half);

        let mut full = staging
            .begin(StagingName::new(StageOp::Replace, "config"))
            .unwrap();
        full.write_all(b"{}").unwrap();
        assert!(matches!(
            full.commit(&staging),
            Err(StoreError::SimulatedCrash("staged"))
        ));

        let pending = staging.recover().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name.op, StageOp::Replace);
        assert_eq!(pending[0].read_all().unwrap(), b"{}");
        assert!(!dir.path().join("sn_t1___10.tmp").exists());
    }

    #[test]
    fn test_apply_append_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("thread");
        fs::write(&dest, b"0123456789OLDTRAILER").unwrap();
        let staged_path = dir.path().join("staged");
        fs::write(&staged_path, b"xxNEW").unwrap();
        let staged = Staged {
            name: StagingName::new(StageOp::Seen, "thread").at(Some(10)),
            path: staged_path,
        };

        apply_append(&staged, &dest, 10, 2).unwrap();
        apply_append(&staged, &dest, 10, 2).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"0123456789NEW");
    }
}
