#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use courselink_domain::{IdentityClaim, UserId};
use courselink_protocol::{
	ClientEvent, JoinedChat, SendMessage, ServerEvent, decode_event, encode_event, error_reason,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::gateway::Gateway;
use crate::server::relay::RelayError;
use crate::server::room_router::RouterError;
use crate::server::state::AppState;

/// Gateway-assigned connection id.
pub type ConnId = u64;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Connecting,
	Authenticated,
	Disconnected,
}

/// A connection that has been assigned an id but has not presented a valid credential.
#[derive(Debug)]
pub struct PendingConnection {
	id: ConnId,
}

impl PendingConnection {
	pub(crate) fn new(id: ConnId) -> Self {
		Self { id }
	}

	pub fn id(&self) -> ConnId {
		self.id
	}

	#[allow(dead_code)]
	pub fn state(&self) -> ConnectionState {
		ConnectionState::Connecting
	}

	/// Attach a verified claim. The claim cannot change for the rest of the connection.
	pub(crate) fn authenticate(
		self,
		claim: IdentityClaim,
		queue_capacity: usize,
	) -> (Connection, mpsc::Receiver<ServerEvent>) {
		let (tx, rx) = mpsc::channel(queue_capacity.max(1));
		let conn = Connection {
			id: self.id,
			claim: Arc::new(claim),
			outbound: tx,
			closed: Arc::new(AtomicBool::new(false)),
		};
		(conn, rx)
	}
}

/// An authenticated connection. Cheap to clone; all clones share the same state.
#[derive(Debug, Clone)]
pub struct Connection {
	id: ConnId,
	claim: Arc<IdentityClaim>,
	outbound: mpsc::Sender<ServerEvent>,
	closed: Arc<AtomicBool>,
}

impl Connection {
	pub fn id(&self) -> ConnId {
		self.id
	}

	pub fn claim(&self) -> &IdentityClaim {
		&self.claim
	}

	pub fn user_id(&self) -> UserId {
		self.claim.user_id
	}

	pub fn state(&self) -> ConnectionState {
		if self.closed.load(Ordering::Acquire) {
			ConnectionState::Disconnected
		} else {
			ConnectionState::Authenticated
		}
	}

	/// Sender half of the outbound queue, for room membership.
	pub fn outbound(&self) -> mpsc::Sender<ServerEvent> {
		self.outbound.clone()
	}

	/// Queue a reply for this connection only. Waits for queue space.
	pub async fn emit(&self, event: ServerEvent) -> bool {
		self.outbound.send(event).await.is_ok()
	}

	/// Returns true on the first call only.
	pub(crate) fn mark_disconnected(&self) -> bool {
		!self.closed.swap(true, Ordering::AcqRel)
	}
}

/// Runs disconnect cleanup when dropped, including when the handler task panics or is cancelled.
pub struct ConnectionGuard {
	gateway: Gateway,
	conn: Connection,
}

impl ConnectionGuard {
	pub fn new(gateway: Gateway, conn: Connection) -> Self {
		Self { gateway, conn }
	}

	pub fn connection(&self) -> &Connection {
		&self.conn
	}
}

impl Drop for ConnectionGuard {
	fn drop(&mut self) {
		self.gateway.disconnect(&self.conn);
	}
}

/// Drive one upgraded socket until either side closes it.
pub async fn handle_connection(
	socket: WebSocket,
	guard: ConnectionGuard,
	mut outbound_rx: mpsc::Receiver<ServerEvent>,
	state: AppState,
) {
	let conn = guard.connection().clone();
	let conn_id = conn.id();
	let max_frame_bytes = state.gateway.settings().max_frame_bytes;

	info!(conn_id, user_id = %conn.user_id(), "connection established");

	let (mut sink, mut stream) = socket.split();

	let mut writer = tokio::spawn(async move {
		while let Some(event) = outbound_rx.recv().await {
			let text = match encode_event(&event, max_frame_bytes) {
				Ok(text) => text,
				Err(e) => {
					warn!(conn_id, event = event.name(), error = %e, "dropping unencodable event");
					continue;
				}
			};

			if sink.send(Message::Text(text.into())).await.is_err() {
				break;
			}
		}

		let _ = sink.close().await;
	});

	while let Some(frame) = stream.next().await {
		let text = match frame {
			Ok(Message::Text(text)) => text,
			Ok(Message::Binary(_)) => {
				conn.emit(ServerEvent::error(error_reason::INVALID_REQUEST)).await;
				continue;
			}
			Ok(Message::Close(_)) => break,
			Ok(_) => continue,
			Err(e) => {
				debug!(conn_id, error = %e, "websocket read failed");
				break;
			}
		};

		match decode_event::<ClientEvent>(text.as_str(), max_frame_bytes) {
			Ok(event) => handle_event(&state, &conn, event).await,
			Err(e) if e.is_fatal() => {
				warn!(conn_id, error = %e, "closing connection on oversized frame");
				break;
			}
			Err(e) => {
				debug!(conn_id, error = %e, "undecodable client frame");
				conn.emit(ServerEvent::error(error_reason::INVALID_REQUEST)).await;
			}
		}
	}

	// Leave every room first so no new events are queued, then let the writer drain.
	drop(guard);
	drop(conn);

	if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
		writer.abort();
	}

	info!(conn_id, "connection closed");
}

async fn handle_event(state: &AppState, conn: &Connection, event: ClientEvent) {
	let name = event.name();
	let chat_id = event.chat_id();
	debug!(conn_id = conn.id(), event = name, chat_id = %chat_id, "client event");

	match event {
		ClientEvent::JoinChat(_) => match state.router.join(conn, chat_id).await {
			Ok(chat_id) => {
				conn.emit(ServerEvent::JoinedChat(JoinedChat { chat_id })).await;
			}
			Err(e) => {
				match &e {
					RouterError::Store(err) => warn!(conn_id = conn.id(), event = name, chat_id = %chat_id, error = %err, "event failed"),
					other => debug!(conn_id = conn.id(), event = name, chat_id = %chat_id, error = %other, "event rejected"),
				}
				conn.emit(ServerEvent::error(e.reason())).await;
			}
		},
		ClientEvent::SendMessage(SendMessage { content, .. }) => {
			if let Err(e) = state.relay.send(conn, chat_id, &content).await {
				match &e {
					RelayError::Persistence(err) => {
						warn!(conn_id = conn.id(), event = name, chat_id = %chat_id, error = %err, "event failed")
					}
					other => debug!(conn_id = conn.id(), event = name, chat_id = %chat_id, error = %other, "event rejected"),
				}
				conn.emit(ServerEvent::error(e.reason())).await;
			}
		}
	}
}
