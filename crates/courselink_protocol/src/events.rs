#![forbid(unsafe_code)]

//! Named events exchanged over a chat connection.
//!
//! Every frame is a JSON object `{"event": "<name>", "data": <payload>}`.

use courselink_domain::{ChatId, MessageId, UserId};
use serde::{Deserialize, Deserializer, Serialize};

/// Reasons carried by `error` events.
pub mod error_reason {
	pub const CHAT_NOT_FOUND: &str = "Chat not found";
	pub const UNAUTHORIZED: &str = "Unauthorized access to chat";
	pub const INTERNAL: &str = "Internal server error";
	pub const SEND_FAILED: &str = "Failed to send message";
	pub const EMPTY_CONTENT: &str = "Message content is required";
	pub const INVALID_REQUEST: &str = "Invalid request";
	pub const CONTENT_TOO_LONG: &str = "Message is too long";
}

/// Client → server events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
	JoinChat(JoinChat),
	SendMessage(SendMessage),
}

impl ClientEvent {
	pub fn name(&self) -> &'static str {
		match self {
			ClientEvent::JoinChat(_) => "join-chat",
			ClientEvent::SendMessage(_) => "send-message",
		}
	}

	pub fn chat_id(&self) -> ChatId {
		match self {
			ClientEvent::JoinChat(j) => j.chat_id,
			ClientEvent::SendMessage(s) => s.chat_id,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinChat {
	#[serde(deserialize_with = "lenient_chat_id")]
	pub chat_id: ChatId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
	#[serde(deserialize_with = "lenient_chat_id")]
	pub chat_id: ChatId,
	pub content: String,
}

/// Server → client events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
	JoinedChat(JoinedChat),
	ReceiveMessage(ReceiveMessage),
	/// Human-readable failure reason, delivered to the originating connection only.
	Error(String),
	/// Room events were dropped because this connection's queue was full.
	Lagged(Lagged),
}

impl ServerEvent {
	pub fn name(&self) -> &'static str {
		match self {
			ServerEvent::JoinedChat(_) => "joined-chat",
			ServerEvent::ReceiveMessage(_) => "receive-message",
			ServerEvent::Error(_) => "error",
			ServerEvent::Lagged(_) => "lagged",
		}
	}

	pub fn error(reason: impl Into<String>) -> Self {
		ServerEvent::Error(reason.into())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedChat {
	pub chat_id: ChatId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveMessage {
	pub id: MessageId,
	pub content: String,
	pub sender_id: UserId,
	pub sender_name: Option<String>,
	pub sender_image: Option<String>,
	/// Unix milliseconds.
	pub created_at: i64,
	pub chat_id: ChatId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lagged {
	pub chat_id: ChatId,
	pub dropped: u64,
}

/// Accepts `5` as well as `"5"`; browser clients often carry ids as strings.
fn lenient_chat_id<'de, D>(deserializer: D) -> Result<ChatId, D::Error>
where
	D: Deserializer<'de>,
{
	#[derive(Deserialize)]
	#[serde(untagged)]
	enum IntOrString {
		Int(i64),
		Str(String),
	}

	match IntOrString::deserialize(deserializer)? {
		IntOrString::Int(v) => Ok(ChatId(v)),
		IntOrString::Str(s) => s.parse::<ChatId>().map_err(serde::de::Error::custom),
	}
}
