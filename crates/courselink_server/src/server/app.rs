#![forbid(unsafe_code)]

use axum::Router;
use axum::http::HeaderValue;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::server::gateway::ws_handler;
use crate::server::health::{healthz, readyz};
use crate::server::http::{get_conversation, list_conversations, open_conversation};
use crate::server::state::AppState;

/// All routes served on the main listener.
pub fn build_router(state: AppState, frontend_origin: Option<&str>) -> Router {
	Router::new()
		.route("/ws", get(ws_handler))
		.route("/conversations", get(list_conversations).post(open_conversation))
		.route("/conversations/{chat_id}", get(get_conversation))
		.route("/healthz", get(healthz))
		.route("/readyz", get(readyz))
		.layer(cors_layer(frontend_origin))
		.layer(TraceLayer::new_for_http())
		.with_state(state)
}

fn cors_layer(frontend_origin: Option<&str>) -> CorsLayer {
	let origin = frontend_origin.and_then(|o| match o.parse::<HeaderValue>() {
		Ok(v) => Some(v),
		Err(e) => {
			warn!(origin = %o, error = %e, "invalid frontend origin; allowing any");
			None
		}
	});

	match origin {
		// Credentialed requests carry the `token` cookie, which wildcard origins cannot.
		Some(origin) => CorsLayer::new()
			.allow_origin(origin)
			.allow_credentials(true)
			.allow_methods([axum::http::Method::GET, axum::http::Method::POST])
			.allow_headers([axum::http::header::AUTHORIZATION, axum::http::header::CONTENT_TYPE]),
		None => CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any),
	}
}
