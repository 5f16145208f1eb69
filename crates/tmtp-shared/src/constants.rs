/// Protocol revision announced in the first frame of every connection
pub const PROTOCOL_REVISION: &str = "1";

/// Application name
pub const APP_NAME: &str = "mnm-tmtp";

/// Width of the frame header length prefix (ASCII hex digits)
pub const FRAME_LEN_DIGITS: usize = 4;

/// Shortest header JSON a relay can legally send: `{"op":1}`
pub const MSG_HEADER_MIN_LEN: usize = 8;

/// Longest header JSON expressible in four hex digits
pub const MSG_HEADER_MAX_LEN: usize = 0xFFFF;

/// Maximum payload accepted in one frame (50 MiB)
pub const MAX_FRAME_DATA: usize = 50 * 1024 * 1024;

/// Hex digits of the millisecond counter in a local id
pub const LOCAL_ID_COUNTER_DIGITS: usize = 12;

/// Id attached to the one-shot presence push after login.
/// Acks carrying it never touch the send queue.
pub const PRESENCE_ACK_ID: &str = "_ohi";

/// Seconds to wait for the relay to acknowledge a send record
pub const ACK_TIMEOUT_SECS: u64 = 15;

/// The idle read timeout is the login period divided by this
pub const IDLE_TIME_FRACTION: u64 = 10;

/// Maximum characters kept in a Cc note
pub const CC_NOTE_MAX: usize = 1024;

/// Default relay port
pub const DEFAULT_RELAY_PORT: u16 = 8888;
