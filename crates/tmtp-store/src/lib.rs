//! # tmtp-store
//!
//! Crash-consistent local storage for TMTP services, built from plain files,
//! renames and fsync.
//!
//! Each service keeps its threads, drafts, send queue and presence list in
//! its own directory. Every mutation is written to a staging file whose name
//! says how to apply it; once that file is durably renamed the mutation is
//! committed, and [`Registry::open`] replays whatever a crash interrupted.
//! Operations are synchronous; async callers run them on a blocking pool.

pub mod crash;
pub mod fatal;
pub mod message;
pub mod presence;
pub mod queue;
pub mod service;
pub mod staging;
pub mod thread;
pub mod trailer;

mod error;

pub use crash::{Checkpoint, CrashHook};
pub use error::{Outcome, Result, StoreError, ValidationError};
pub use fatal::{halt, OrHalt};
pub use queue::{QueueEntry, SendQueue};
pub use service::{Registry, SendFailure, Service, ServiceConfig};
pub use thread::{DraftContent, ThreadStore, ThreadSummary};
pub use trailer::{CcEntry, IndexEntry};
