use thiserror::Error;

/// Errors raised while framing or parsing TMTP traffic.
///
/// Any of these on an inbound frame is fatal to that connection only; the
/// session closes the socket and reconnects.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid header length prefix: {0:?}")]
    InvalidLengthPrefix(String),

    #[error("Header length {0} out of range")]
    HeaderLength(usize),

    #[error("Payload length {len} exceeds limit {max}")]
    PayloadTooLarge { len: u64, max: usize },

    #[error("Sub-header length {data_head} exceeds payload length {data_len}")]
    SubHeaderLength { data_head: u64, data_len: u64 },

    #[error("Invalid header JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid local id: {0}")]
    InvalidLocalId(String),

    #[error("Unknown send tag: {0:?}")]
    UnknownTag(char),
}
