use thiserror::Error;

use tmtp_shared::ProtocolError;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Generic I/O error on a store file or directory.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON document on disk could not be read or written.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Thread file footer is missing or inconsistent.
    #[error("Corrupt trailer in {0}")]
    CorruptTrailer(String),

    /// A framed message on disk could not be parsed.
    #[error("Corrupt message: {0}")]
    CorruptMessage(String),

    /// A staging file name that no apply routine understands.
    #[error("Unrecognized staging file {0}")]
    UnknownStagingFile(String),

    /// The thread, draft or service does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The provisional thread id was replaced by the relay's id.
    #[error("Thread {0} was renamed")]
    Renamed(String),

    #[error("Service {0} already exists")]
    ServiceExists(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Raised by the crash hook in abort mode.
    #[error("Simulated crash at checkpoint {0}")]
    SimulatedCrash(&'static str),
}

impl StoreError {
    /// Errors that mean the on-disk state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Json(_)
                | Self::CorruptTrailer(_)
                | Self::CorruptMessage(_)
                | Self::UnknownStagingFile(_)
        )
    }
}

/// A draft that cannot be sent as it stands. Nothing is modified.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} subject is required for a new thread")]
    MissingSubject(String),

    #[error("{0} to-list empty")]
    NoRecipients(String),

    #[error("alias unknown: {0}")]
    UnknownRecipient(String),

    #[error("attachment not found: {0}")]
    MissingAttachment(String),

    /// The encoded head does not fit the four-digit length prefix.
    #[error("head of {0} is {1} bytes")]
    HeadTooLong(String, usize),
}

/// Result of a mutation that may legitimately turn into a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Mutation committed.
    Done,
    /// The content was already stored.
    Duplicate,
    /// The target was already removed, sent or never existed.
    Missing,
    /// The content referenced an id this store will not accept.
    Invalid,
    /// Nothing needed to change.
    Unchanged,
    /// Stored with a mismatch note attached.
    Annotated,
}

impl Outcome {
    pub fn is_done(self) -> bool {
        matches!(self, Self::Done | Self::Annotated)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
