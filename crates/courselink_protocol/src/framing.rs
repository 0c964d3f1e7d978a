#![forbid(unsafe_code)]

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Default maximum text frame size for v1.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024; // 64 KiB

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("json decode error: {0}")]
	Decode(#[source] serde_json::Error),

	#[error("json encode error: {0}")]
	Encode(#[source] serde_json::Error),
}

impl FramingError {
	/// True when the peer should be disconnected rather than answered.
	pub fn is_fatal(&self) -> bool {
		matches!(self, FramingError::FrameTooLarge { .. })
	}
}

/// Encode an event into a single JSON text frame.
pub fn encode_event<E: Serialize>(event: &E, max_frame_size: usize) -> Result<String, FramingError> {
	let text = serde_json::to_string(event).map_err(FramingError::Encode)?;
	if text.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}
	Ok(text)
}

/// Encode a frame using `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode_event_default<E: Serialize>(event: &E) -> Result<String, FramingError> {
	encode_event(event, DEFAULT_MAX_FRAME_SIZE)
}

/// Decode one event from a JSON text frame.
///
/// The size check happens before parsing so oversized input is never handed to serde.
pub fn decode_event<E: DeserializeOwned>(text: &str, max_frame_size: usize) -> Result<E, FramingError> {
	if text.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}

	serde_json::from_str(text).map_err(FramingError::Decode)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::events::{ClientEvent, ServerEvent};

	#[test]
	fn decode_rejects_oversized_before_parsing() {
		let text = format!(r#"{{"event":"send-message","data":{{"chatId":1,"content":"{}"}}}}"#, "a".repeat(128));

		let err = decode_event::<ClientEvent>(&text, 64).unwrap_err();
		match err {
			FramingError::FrameTooLarge { len, max } => {
				assert_eq!(len, text.len());
				assert_eq!(max, 64);
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn decode_reports_malformed_json() {
		let err = decode_event::<ClientEvent>("{not json", DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		assert!(matches!(err, FramingError::Decode(_)));
		assert!(!err.is_fatal());
	}

	#[test]
	fn encode_rejects_too_large() {
		let ev = ServerEvent::error("x".repeat(100));
		let err = encode_event(&ev, 32).unwrap_err();
		assert!(err.is_fatal());
	}
}
