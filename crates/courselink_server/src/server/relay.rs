#![forbid(unsafe_code)]

use courselink_domain::{ChatId, StoredMessage, UserId};
use courselink_protocol::{ReceiveMessage, ServerEvent, error_reason};
use thiserror::Error;
use tracing::{debug, warn};

use crate::server::connection::Connection;
use crate::server::room_router::RoomRouter;
use crate::server::store::{ConversationService, StoreError};
use crate::util::unix_ms_now;

#[derive(Debug, Error)]
pub enum RelayError {
	#[error("message content is empty")]
	InvalidInput,

	#[error("message content is {len} bytes encoded, limit is {max}")]
	TooLong { len: usize, max: usize },

	#[error("chat {0} not found")]
	NotFound(ChatId),

	#[error("user {user} may not post to chat {chat}")]
	Unauthorized { chat: ChatId, user: UserId },

	#[error(transparent)]
	Persistence(#[from] StoreError),
}

impl RelayError {
	/// Reason string sent back to the sender.
	pub fn reason(&self) -> &'static str {
		match self {
			RelayError::InvalidInput => error_reason::EMPTY_CONTENT,
			RelayError::TooLong { .. } => error_reason::CONTENT_TOO_LONG,
			RelayError::NotFound(_) => error_reason::CHAT_NOT_FOUND,
			RelayError::Unauthorized { .. } => error_reason::UNAUTHORIZED,
			RelayError::Persistence(_) => error_reason::SEND_FAILED,
		}
	}

	fn kind(&self) -> &'static str {
		match self {
			RelayError::InvalidInput => "invalid_input",
			RelayError::TooLong { .. } => "too_long",
			RelayError::NotFound(_) => "not_found",
			RelayError::Unauthorized { .. } => "unauthorized",
			RelayError::Persistence(_) => "persistence",
		}
	}
}

/// Bytes of an outbound frame reserved for everything in a `receive-message` echo except the
/// content: event tag, field names, ids, timestamp and the sender's name and image.
pub const ECHO_ENVELOPE_BUDGET: usize = 4 * 1024;

/// Validate, persist, then fan out one message.
#[derive(Debug, Clone)]
pub struct MessageRelay {
	store: ConversationService,
	router: RoomRouter,
	max_content_bytes: usize,
}

impl MessageRelay {
	/// `max_frame_bytes` is the outbound frame limit; content is capped so its echo still fits.
	pub fn new(store: ConversationService, router: RoomRouter, max_frame_bytes: usize) -> Self {
		Self {
			store,
			router,
			max_content_bytes: max_frame_bytes.saturating_sub(ECHO_ENVELOPE_BUDGET),
		}
	}

	/// Largest JSON-encoded content accepted, quotes included.
	pub fn max_content_bytes(&self) -> usize {
		self.max_content_bytes
	}

	/// Handle a `send-message` from `conn`.
	///
	/// Nothing is broadcast unless the insert succeeded. Failing to bump the conversation's
	/// recency marker afterwards is logged and not reported.
	pub async fn send(&self, conn: &Connection, chat_id: ChatId, content: &str) -> Result<StoredMessage, RelayError> {
		let res = self.send_inner(conn, chat_id, content).await;
		if let Err(e) = &res {
			metrics::counter!("courselink_relay_errors_total", "kind" => e.kind()).increment(1);
		}
		res
	}

	async fn send_inner(&self, conn: &Connection, chat_id: ChatId, content: &str) -> Result<StoredMessage, RelayError> {
		let content = content.trim();
		if content.is_empty() {
			return Err(RelayError::InvalidInput);
		}

		let encoded_len = serde_json::to_string(content).map_or(usize::MAX, |s| s.len());
		if encoded_len > self.max_content_bytes {
			return Err(RelayError::TooLong {
				len: encoded_len,
				max: self.max_content_bytes,
			});
		}

		let user = conn.user_id();

		let conversation = self
			.store
			.conversation(chat_id)
			.await?
			.ok_or(RelayError::NotFound(chat_id))?;
		if !conversation.is_participant(user) {
			return Err(RelayError::Unauthorized { chat: chat_id, user });
		}

		if !self.router.is_member(conn.id(), chat_id) {
			return Err(RelayError::Unauthorized { chat: chat_id, user });
		}

		let stored = self.store.insert_message(chat_id, user, content, unix_ms_now()).await?;
		metrics::counter!("courselink_messages_persisted_total").increment(1);

		let report = self
			.router
			.broadcast(chat_id, ServerEvent::ReceiveMessage(receive_message(&stored)));
		debug!(
			conn_id = conn.id(),
			chat_id = %chat_id,
			message_id = %stored.id,
			delivered = report.delivered,
			dropped = report.dropped,
			"message relayed"
		);

		if let Err(e) = self.store.touch_conversation(chat_id, stored.created_at_ms).await {
			warn!(chat_id = %chat_id, error = %e, "failed to update conversation recency");
		}

		Ok(stored)
	}
}

fn receive_message(m: &StoredMessage) -> ReceiveMessage {
	ReceiveMessage {
		id: m.id,
		content: m.content.clone(),
		sender_id: m.sender_id,
		sender_name: m.sender.name.clone(),
		sender_image: m.sender.image.clone(),
		created_at: m.created_at_ms,
		chat_id: m.chat_id,
	}
}
