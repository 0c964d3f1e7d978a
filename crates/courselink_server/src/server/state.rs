#![forbid(unsafe_code)]

use std::sync::Arc;

use crate::server::auth::IdentityVerifier;
use crate::server::gateway::{ConnectionSettings, Gateway};
use crate::server::health::HealthState;
use crate::server::relay::MessageRelay;
use crate::server::room_router::{RoomRouter, RoomRouterConfig};
use crate::server::store::ConversationService;

/// Shared server state handed to every axum handler.
#[derive(Debug, Clone)]
pub struct AppState {
	pub gateway: Gateway,
	pub router: RoomRouter,
	pub relay: Arc<MessageRelay>,
	pub store: ConversationService,
	pub verifier: IdentityVerifier,
	pub health: HealthState,
}

impl AppState {
	pub fn new(
		store: ConversationService,
		verifier: IdentityVerifier,
		settings: ConnectionSettings,
		router_cfg: RoomRouterConfig,
		health: HealthState,
	) -> Self {
		let router = RoomRouter::new(store.clone(), router_cfg);
		let relay = Arc::new(MessageRelay::new(
			store.clone(),
			router.clone(),
			settings.max_frame_bytes,
		));
		let gateway = Gateway::new(verifier.clone(), router.clone(), settings);

		Self {
			gateway,
			router,
			relay,
			store,
			verifier,
			health,
		}
	}
}
