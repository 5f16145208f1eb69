use thiserror::Error;

use tmtp_shared::ProtocolError;
use tmtp_store::StoreError;

/// Why a relay connection ended.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Framing error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("Relay closed the connection")]
    Closed,

    #[error("Relay sent quit")]
    Quit,

    #[error("Idle timeout")]
    Idle,

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Failure to apply one inbound frame.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The frame makes no sense to this client; the connection is dropped.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The store refused the change. Fatal store errors never get here.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl DispatchError {
    /// Whether the connection has to be dropped.
    pub fn closes_link(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}
