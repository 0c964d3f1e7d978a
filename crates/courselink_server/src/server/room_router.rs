#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use courselink_domain::{ChatId, UserId};
use courselink_protocol::{Lagged, ServerEvent, error_reason};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::server::connection::{ConnId, Connection, ConnectionState};
use crate::server::store::{ConversationService, StoreError};

#[derive(Debug, Error)]
pub enum RouterError {
	#[error("connection is not authenticated")]
	NotAuthenticated,

	#[error("chat {0} not found")]
	NotFound(ChatId),

	#[error("user {user} is not a participant of chat {chat}")]
	Unauthorized { chat: ChatId, user: UserId },

	#[error(transparent)]
	Store(#[from] StoreError),
}

impl RouterError {
	/// Reason string sent back to the client.
	pub fn reason(&self) -> &'static str {
		match self {
			RouterError::NotFound(_) => error_reason::CHAT_NOT_FOUND,
			RouterError::NotAuthenticated | RouterError::Unauthorized { .. } => error_reason::UNAUTHORIZED,
			RouterError::Store(_) => error_reason::INTERNAL,
		}
	}
}

/// Configuration for `RoomRouter`.
#[derive(Debug, Clone, Default)]
pub struct RoomRouterConfig {
	pub debug_logs: bool,
}

/// Outcome of one room fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
	pub delivered: usize,
	pub dropped: usize,
}

/// Maps conversations to the connections subscribed to them.
///
/// The lock is only ever held for map updates and `try_send`, so every method except
/// `join` is synchronous and safe to call from `Drop`.
#[derive(Debug, Clone)]
pub struct RoomRouter {
	inner: Arc<Mutex<Inner>>,
	store: ConversationService,
	cfg: RoomRouterConfig,
}

impl RoomRouter {
	pub fn new(store: ConversationService, cfg: RoomRouterConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			store,
			cfg,
		}
	}

	/// Subscribe `conn` to a conversation's room after checking it against the store.
	///
	/// Joining a room the connection is already in succeeds without adding a second entry.
	pub async fn join(&self, conn: &Connection, chat_id: ChatId) -> Result<ChatId, RouterError> {
		if conn.state() != ConnectionState::Authenticated {
			return Err(RouterError::NotAuthenticated);
		}

		let conversation = self
			.store
			.conversation(chat_id)
			.await?
			.ok_or(RouterError::NotFound(chat_id))?;

		let user = conn.user_id();
		if !conversation.is_participant(user) {
			return Err(RouterError::Unauthorized { chat: chat_id, user });
		}

		let mut inner = self.inner.lock();

		// Cleanup may have run while the store lookup was in flight.
		if conn.state() != ConnectionState::Authenticated {
			return Err(RouterError::NotAuthenticated);
		}

		let entry = inner.rooms.entry(chat_id).or_default();
		prune_closed_members(entry);

		let already_member = entry.members.iter().any(|m| m.conn_id == conn.id());
		if !already_member {
			entry.members.push(Member {
				conn_id: conn.id(),
				tx: conn.outbound(),
				pending_lag: 0,
			});
		}
		let members = entry.members.len();

		inner.rooms_by_conn.entry(conn.id()).or_default().insert(chat_id);
		drop(inner);

		if !already_member {
			metrics::counter!("courselink_joins_total").increment(1);
		}

		if self.cfg.debug_logs {
			debug!(conn_id = conn.id(), chat_id = %chat_id, members, already_member, "room router: joined");
		}

		Ok(chat_id)
	}

	/// Remove a connection from every room it joined. Idempotent.
	pub fn leave_all(&self, conn_id: ConnId) -> Vec<ChatId> {
		let mut inner = self.inner.lock();
		let Some(chats) = inner.rooms_by_conn.remove(&conn_id) else {
			return Vec::new();
		};

		let mut left = Vec::with_capacity(chats.len());
		for chat_id in chats {
			if let Some(entry) = inner.rooms.get_mut(&chat_id) {
				entry.members.retain(|m| m.conn_id != conn_id);
				if entry.members.is_empty() {
					inner.rooms.remove(&chat_id);
				}
			}
			left.push(chat_id);
		}

		if self.cfg.debug_logs {
			debug!(conn_id, rooms = left.len(), "room router: left all rooms");
		}

		left
	}

	pub fn is_member(&self, conn_id: ConnId, chat_id: ChatId) -> bool {
		let inner = self.inner.lock();
		inner
			.rooms_by_conn
			.get(&conn_id)
			.is_some_and(|chats| chats.contains(&chat_id))
	}

	/// Deliver `event` to every member of the room, the sender included.
	///
	/// Members with a full queue miss this event and get a `lagged` marker on their next
	/// successful delivery. Members whose connection is gone are pruned.
	pub fn broadcast(&self, chat_id: ChatId, event: ServerEvent) -> BroadcastReport {
		let mut inner = self.inner.lock();
		let Inner { rooms, rooms_by_conn } = &mut *inner;

		let Some(entry) = rooms.get_mut(&chat_id) else {
			return BroadcastReport::default();
		};

		let mut report = BroadcastReport::default();

		for member in entry.members.iter_mut() {
			match member.tx.try_send(event.clone()) {
				Ok(()) => {
					report.delivered += 1;

					if member.pending_lag > 0
						&& member
							.tx
							.try_send(ServerEvent::Lagged(Lagged {
								chat_id,
								dropped: member.pending_lag,
							}))
							.is_ok()
					{
						member.pending_lag = 0;
					}
				}
				Err(mpsc::error::TrySendError::Full(_)) => {
					report.dropped += 1;
					member.pending_lag = member.pending_lag.saturating_add(1);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		let mut closed = Vec::new();
		entry.members.retain(|m| {
			let open = !m.tx.is_closed();
			if !open {
				closed.push(m.conn_id);
			}
			open
		});

		for conn_id in &closed {
			if let Some(chats) = rooms_by_conn.get_mut(conn_id) {
				chats.remove(&chat_id);
				if chats.is_empty() {
					rooms_by_conn.remove(conn_id);
				}
			}
		}

		if entry.members.is_empty() {
			rooms.remove(&chat_id);
		}
		drop(inner);

		if report.dropped > 0 {
			metrics::counter!("courselink_room_dropped_total").increment(report.dropped as u64);
		}

		if self.cfg.debug_logs && (report.dropped > 0 || !closed.is_empty()) {
			debug!(
				chat_id = %chat_id,
				delivered = report.delivered,
				dropped = report.dropped,
				pruned = closed.len(),
				"room router: partial delivery"
			);
		}

		report
	}

	/// Snapshot of member counts per room.
	#[allow(dead_code)]
	pub fn room_sizes(&self) -> HashMap<ChatId, usize> {
		let inner = self.inner.lock();
		inner.rooms.iter().map(|(k, v)| (*k, v.members.len())).collect()
	}

	/// Rooms the given connection currently belongs to.
	#[allow(dead_code)]
	pub fn rooms_for_conn(&self, conn_id: ConnId) -> HashSet<ChatId> {
		let inner = self.inner.lock();
		inner.rooms_by_conn.get(&conn_id).cloned().unwrap_or_default()
	}
}

#[derive(Debug, Default)]
struct Inner {
	rooms: HashMap<ChatId, RoomEntry>,
	rooms_by_conn: HashMap<ConnId, HashSet<ChatId>>,
}

#[derive(Debug, Default)]
struct RoomEntry {
	members: Vec<Member>,
}

#[derive(Debug)]
struct Member {
	conn_id: ConnId,
	tx: mpsc::Sender<ServerEvent>,

	/// Events dropped since the last successful delivery.
	pending_lag: u64,
}

fn prune_closed_members(entry: &mut RoomEntry) {
	entry.members.retain(|m| !m.tx.is_closed());
}
