// Relay link: TMTP session, inbound dispatch and send-record composition.

pub mod backoff;
pub mod dispatch;
pub mod error;
pub mod record;
pub mod session;

pub use backoff::Backoff;
pub use dispatch::{handle_frame, Event};
pub use error::{DispatchError, LinkError};
pub use record::{compose, compose_presence_push, SendRecord};
pub use session::{spawn_link, LinkCommand, LinkConfig, LinkHandle, LinkNotification, LinkState};
