#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use courselink_domain::IdentityClaim;
use courselink_protocol::{DEFAULT_MAX_FRAME_SIZE, ServerEvent};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::server::auth::{IdentityVerifier, VerifyError, extract_credential};
use crate::server::connection::{ConnId, Connection, ConnectionGuard, PendingConnection, handle_connection};
use crate::server::room_router::RoomRouter;
use crate::server::state::AppState;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,

	/// Capacity of each connection's outbound queue. Room events beyond it are dropped.
	pub outbound_queue_capacity: usize,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			outbound_queue_capacity: 256,
		}
	}
}

/// Admits connections and owns the registry of live ones.
#[derive(Clone)]
pub struct Gateway {
	inner: Arc<GatewayInner>,
}

struct GatewayInner {
	verifier: IdentityVerifier,
	router: RoomRouter,
	settings: ConnectionSettings,
	next_id: AtomicU64,
	live: Mutex<HashMap<ConnId, Arc<IdentityClaim>>>,
}

impl std::fmt::Debug for Gateway {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Gateway")
			.field("settings", &self.inner.settings)
			.field("live", &self.live_connections())
			.finish_non_exhaustive()
	}
}

impl Gateway {
	pub fn new(verifier: IdentityVerifier, router: RoomRouter, settings: ConnectionSettings) -> Self {
		Self {
			inner: Arc::new(GatewayInner {
				verifier,
				router,
				settings,
				next_id: AtomicU64::new(1),
				live: Mutex::new(HashMap::new()),
			}),
		}
	}

	pub fn settings(&self) -> &ConnectionSettings {
		&self.inner.settings
	}

	/// Assign an id to an incoming connection.
	pub fn begin(&self) -> PendingConnection {
		metrics::counter!("courselink_connections_total").increment(1);
		PendingConnection::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
	}

	/// Verify the handshake credential and register the connection.
	pub fn admit(
		&self,
		pending: PendingConnection,
		credential: Option<&str>,
	) -> Result<(Connection, mpsc::Receiver<ServerEvent>), VerifyError> {
		let conn_id = pending.id();
		let claim = match credential.map(|c| self.inner.verifier.verify(c)) {
			Some(Ok(claim)) => claim,
			Some(Err(e)) => return Err(self.reject(conn_id, e)),
			None => return Err(self.reject(conn_id, VerifyError::Missing)),
		};

		let (conn, rx) = pending.authenticate(claim, self.inner.settings.outbound_queue_capacity);
		self.inner.live.lock().insert(conn_id, Arc::new(conn.claim().clone()));
		metrics::gauge!("courselink_active_connections").increment(1.0);

		debug!(conn_id, user_id = %conn.user_id(), "connection authenticated");
		Ok((conn, rx))
	}

	fn reject(&self, conn_id: ConnId, err: VerifyError) -> VerifyError {
		metrics::counter!("courselink_handshake_rejected_total").increment(1);
		warn!(conn_id, error = %err, "handshake rejected");
		err
	}

	/// Drop the connection from every room and from the registry. Safe to call repeatedly;
	/// returns true only for the call that did the work.
	pub fn disconnect(&self, conn: &Connection) -> bool {
		if !conn.mark_disconnected() {
			return false;
		}

		let left = self.inner.router.leave_all(conn.id());
		if self.inner.live.lock().remove(&conn.id()).is_some() {
			metrics::gauge!("courselink_active_connections").decrement(1.0);
		}

		debug!(conn_id = conn.id(), rooms = left.len(), "connection cleaned up");
		true
	}

	pub fn live_connections(&self) -> usize {
		self.inner.live.lock().len()
	}

	#[allow(dead_code)]
	pub fn claim_for(&self, conn_id: ConnId) -> Option<Arc<IdentityClaim>> {
		self.inner.live.lock().get(&conn_id).cloned()
	}
}

#[derive(Debug, Default, Deserialize)]
pub struct HandshakeQuery {
	token: Option<String>,
}

/// `GET /ws`: authenticate, then upgrade. Unauthenticated handshakes never reach the socket.
pub async fn ws_handler(
	ws: WebSocketUpgrade,
	State(state): State<AppState>,
	Query(query): Query<HandshakeQuery>,
	headers: HeaderMap,
) -> Response {
	let gateway = state.gateway.clone();
	let credential = extract_credential(query.token.as_deref(), &headers);

	let (conn, rx) = match gateway.admit(gateway.begin(), credential.as_deref()) {
		Ok(admitted) => admitted,
		Err(_) => return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
	};

	// Owning the guard here means an upgrade that never completes still cleans up.
	let guard = ConnectionGuard::new(gateway.clone(), conn);
	let max_frame_bytes = gateway.settings().max_frame_bytes;

	ws.max_message_size(max_frame_bytes)
		.max_frame_size(max_frame_bytes)
		.on_upgrade(move |socket| handle_connection(socket, guard, rx, state))
}
