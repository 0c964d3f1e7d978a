#![forbid(unsafe_code)]

pub mod events;
pub mod framing;

pub use events::{
	ClientEvent, JoinChat, JoinedChat, Lagged, ReceiveMessage, SendMessage, ServerEvent, error_reason,
};
pub use framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, decode_event, encode_event, encode_event_default};

