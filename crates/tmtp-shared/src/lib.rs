// Wire types and framing shared by the store, the relay link and the client.

pub mod constants;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use frame::{pack_frame, Frame, FrameParser};
pub use protocol::{AttachRef, CcHeader, ConfirmRef, Header, HeaderFor, Op, OutboundHeader, SubHeader};
pub use types::{now_rfc3339, LocalId, LocalIdClock, SendTag};
