//! Services and the registry that owns them.
//!
//! On disk: `<root>/svc/<name>/{config, sendq, ohi, thread/, draft/, temp/}`
//! plus `<root>/upload/` shared by all services for attachment files.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use tmtp_shared::{now_rfc3339, LocalId, SendTag};

use crate::crash::CrashHook;
use crate::error::{Outcome, Result, StoreError};
use crate::presence::Presence;
use crate::queue::{queue_id, SendQueue};
use crate::staging::{apply_replace, StageOp, Staging};
use crate::thread::{valid_id, DraftContent, ThreadStore};

const CONFIG_FILE: &str = "config";
const SENDQ_FILE: &str = "sendq";
const OHI_FILE: &str = "ohi";

/// Per-service settings, stored as `config`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServiceConfig {
    pub name: String,
    /// Relay address, `host:port`
    pub addr: String,
    /// Seconds between logins; also scales the idle read timeout
    pub login_period: u64,
    /// Assigned by the relay on registration; empty until then
    pub uid: String,
    pub alias: String,
    pub node: String,
}

impl ServiceConfig {
    pub fn is_registered(&self) -> bool {
        !self.uid.is_empty()
    }
}

/// A send the relay refused outright.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SendFailure {
    pub id: String,
    pub error: String,
    pub date: String,
}

#[derive(Debug)]
pub struct Service {
    name: String,
    dir: PathBuf,
    config: RwLock<ServiceConfig>,
    staging: Arc<Staging>,
    threads: ThreadStore,
    queue: SendQueue,
    presence: Presence,
    failures: Mutex<Vec<SendFailure>>,
}

impl Service {
    /// Open an existing service directory, finishing any staged operation
    /// a crash left behind before loading state.
    pub fn open(dir: PathBuf, upload_dir: PathBuf, crash: CrashHook) -> Result<Self> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| StoreError::NotFound(dir.display().to_string()))?;
        make_tree(&dir)?;
        let staging = Arc::new(Staging::new(dir.join("temp"), crash));
        let threads = ThreadStore::new(
            &name,
            dir.join("thread"),
            dir.join("draft"),
            upload_dir,
            staging.clone(),
        );

        let pending = staging.recover()?;
        if !pending.is_empty() {
            tracing::info!(service = %name, count = pending.len(), "recovering staged operations");
        }
        let mut sent = Vec::new();
        for staged in pending {
            if staged.name.op == StageOp::Sent {
                let draft_thread = if staged.name.is_new_thread() {
                    ""
                } else {
                    staged.name.thread_id.as_str()
                };
                sent.push(queue_id(SendTag::Thread, &format!("{draft_thread}_{}", staged.name.local)));
            }
            if staged.name.op == StageOp::Replace {
                let target = match staged.name.thread_id.as_str() {
                    f @ (CONFIG_FILE | SENDQ_FILE | OHI_FILE) => dir.join(f),
                    _ => return Err(StoreError::UnknownStagingFile(staged.name.to_string())),
                };
                tracing::info!(service = %name, file = %staged.name, "completing staged operation");
                apply_replace(&staged, &target)?;
                staging.finish(staged)?;
            } else {
                threads.replay(staged)?;
            }
        }

        let config: ServiceConfig = match fs::read(dir.join(CONFIG_FILE)) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(format!("{name}/{CONFIG_FILE}")))
            }
            Err(e) => return Err(e.into()),
        };
        let queue = SendQueue::load(dir.join(SENDQ_FILE), staging.clone())?;
        for id in sent {
            queue.drop_entry(&id)?;
        }
        let presence = Presence::load(dir.join(OHI_FILE), staging.clone())?;
        tracing::debug!(service = %name, queued = queue.len(), "service opened");

        Ok(Self {
            name,
            dir,
            config: RwLock::new(config),
            staging,
            threads,
            queue,
            presence,
            failures: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> ServiceConfig {
        self.config.read().clone()
    }

    pub fn threads(&self) -> &ThreadStore {
        &self.threads
    }

    pub fn queue(&self) -> &SendQueue {
        &self.queue
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    /// Persist the identity the relay assigned on registration.
    pub fn set_registered(&self, uid: &str, node: &str) -> Result<()> {
        let mut config = self.config.write();
        let mut updated = config.clone();
        updated.uid = uid.to_string();
        updated.node = node.to_string();
        self.write_config(&updated)?;
        *config = updated;
        tracing::info!(service = %self.name, uid, "registered");
        Ok(())
    }

    fn write_config(&self, config: &ServiceConfig) -> Result<()> {
        let bytes = serde_json::to_vec(config)?;
        self.staging.replace(&self.dir.join(CONFIG_FILE), &bytes)
    }

    /// Save a draft; `id` is `None` for a fresh draft in `thread_id`.
    pub fn save_draft(&self, id: Option<&str>, thread_id: &str, content: &DraftContent) -> Result<LocalId> {
        let id = match id {
            Some(id) => LocalId::parse(id)?,
            None => self.threads.new_draft_id(thread_id),
        };
        self.threads.save_draft(&id, content)?;
        Ok(id)
    }

    /// Discard a draft and any pending send of it.
    pub fn discard_draft(&self, id: &str) -> Result<Outcome> {
        let id = LocalId::parse(id)?;
        let outcome = self.threads.discard_draft(&id)?;
        self.queue
            .drop_entry(&queue_id(SendTag::Thread, &id.to_string()))?;
        Ok(outcome)
    }

    /// Validate a draft and queue it for sending.
    pub fn send_draft(&self, id: &str) -> Result<bool> {
        let id = LocalId::parse(id)?;
        self.threads.validate_draft(&id)?;
        self.queue.add(SendTag::Thread, &id.to_string())
    }

    /// Store draft `id` as sent message `msg_id` and drop its queue entry.
    pub fn complete_sent(&self, id: &str, msg_id: &str, posted: &str) -> Result<Outcome> {
        let local = LocalId::parse(id)?;
        let from = self.config.read().uid.clone();
        let outcome = self.threads.store_sent(&local, msg_id, posted, &from)?;
        self.queue.drop_entry(&queue_id(SendTag::Thread, id))?;
        Ok(outcome)
    }

    /// Queue a presence edit for `uid`.
    pub fn edit_presence(&self, uid: &str, add: bool) -> Result<bool> {
        if !valid_id(uid) {
            return Err(StoreError::NotFound(format!("contact {uid:?}")));
        }
        let edit = format!("{}{uid}", if add { '+' } else { '-' });
        self.queue.add(SendTag::Presence, &edit)
    }

    /// Queue every stored message of a thread for forwarding to `uid`.
    pub fn forward_thread(&self, thread_id: &str, uid: &str, notify: bool) -> Result<usize> {
        let items: Vec<(SendTag, String)> = self
            .threads
            .index(thread_id)?
            .into_iter()
            .filter(|e| !e.is_draft())
            .map(|e| (SendTag::Forward, format!("{thread_id}/{}/{uid}", e.id)))
            .collect();
        self.queue.add_batch(&items, notify)
    }

    /// Record a refused send and drop it from the queue.
    pub fn record_failure(&self, queue_id: &str, error: &str) -> Result<()> {
        tracing::warn!(service = %self.name, id = queue_id, error, "send rejected");
        self.failures.lock().push(SendFailure {
            id: queue_id.to_string(),
            error: error.to_string(),
            date: now_rfc3339(),
        });
        self.queue.drop_entry(queue_id)?;
        Ok(())
    }

    pub fn failures(&self) -> Vec<SendFailure> {
        self.failures.lock().clone()
    }
}

fn make_tree(dir: &Path) -> Result<()> {
    for sub in ["thread", "draft", "temp"] {
        fs::create_dir_all(dir.join(sub))?;
    }
    Ok(())
}

/// Every service under one storage root. Built once at startup and passed
/// to whatever needs it.
#[derive(Debug)]
pub struct Registry {
    root: PathBuf,
    crash: CrashHook,
    services: RwLock<BTreeMap<String, Arc<Service>>>,
}

impl Registry {
    /// Open the storage root, creating it if needed, and every service in it.
    pub fn open(root: impl Into<PathBuf>, crash: CrashHook) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("svc"))?;
        fs::create_dir_all(root.join("upload"))?;
        tracing::info!(path = %root.display(), "opening store");

        let mut services = BTreeMap::new();
        for entry in fs::read_dir(root.join("svc"))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let service = Service::open(entry.path(), root.join("upload"), crash)?;
            services.insert(service.name().to_string(), Arc::new(service));
        }
        Ok(Self {
            root,
            crash,
            services: RwLock::new(services),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.root.join("upload")
    }

    /// Create a service from `config` and open it.
    pub fn add_service(&self, config: ServiceConfig) -> Result<Arc<Service>> {
        if !valid_id(&config.name) {
            return Err(StoreError::NotFound(format!("service name {:?}", config.name)));
        }
        let mut services = self.services.write();
        let dir = self.root.join("svc").join(&config.name);
        if services.contains_key(&config.name) || dir.exists() {
            return Err(StoreError::ServiceExists(config.name));
        }
        make_tree(&dir)?;
        let staging = Staging::new(dir.join("temp"), self.crash);
        staging.replace(&dir.join(CONFIG_FILE), &serde_json::to_vec(&config)?)?;
        let service = Arc::new(Service::open(dir, self.upload_dir(), self.crash)?);
        services.insert(config.name.clone(), service.clone());
        tracing::info!(service = %config.name, addr = %config.addr, "service added");
        Ok(service)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Service>> {
        self.services.read().get(name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.services.read().keys().cloned().collect()
    }

    pub fn services(&self) -> Vec<Arc<Service>> {
        self.services.read().values().cloned().collect()
    }
}
