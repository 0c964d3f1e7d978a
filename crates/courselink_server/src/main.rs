#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context as _, anyhow};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::app::build_router;
use crate::server::auth::IdentityVerifier;
use crate::server::gateway::ConnectionSettings;
use crate::server::health::HealthState;
use crate::server::room_router::RoomRouterConfig;
use crate::server::state::AppState;
use crate::server::store_sql::connect_store;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: courselink_server [--bind host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     Listen address for HTTP and WebSocket (default: {})\n\
\t--config   Config file (default: ~/.courselink/config.toml)\n\
\t--help     Show this help\n\
",
		config::DEFAULT_BIND
	);
	std::process::exit(2)
}

#[derive(Debug, Default)]
struct Args {
	bind: Option<String>,
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut args = Args::default();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,courselink_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("courselink_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

async fn shutdown_signal() {
	if let Err(e) = tokio::signal::ctrl_c().await {
		warn!(error = %e, "failed to listen for ctrl-c");
		std::future::pending::<()>().await;
	}
	info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => config::default_config_path()?,
	};
	let mut server_cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	if let Some(bind) = args.bind {
		server_cfg.server.bind = bind;
	}

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let secret = server_cfg
		.server
		.auth_secret
		.clone()
		.ok_or_else(|| anyhow!("no auth secret configured (set COURSELINK_AUTH_SECRET or server.auth_secret)"))?;
	let verifier = IdentityVerifier::new(secret);

	let health = HealthState::new();
	let store = connect_store(
		&server_cfg.persistence.database_url,
		server_cfg.persistence.run_migrations,
		server_cfg.persistence.store_timeout,
	)
	.await
	.context("connect conversation store")?;

	let settings = ConnectionSettings {
		max_frame_bytes: server_cfg.server.max_frame_bytes,
		outbound_queue_capacity: server_cfg.server.outbound_queue_capacity,
	};
	let router_cfg = RoomRouterConfig {
		debug_logs: server_cfg.server.debug_room_logs,
	};

	let state = AppState::new(store, verifier, settings, router_cfg, health.clone());
	let app = build_router(state, server_cfg.server.frontend_origin.as_deref());

	let listener = tokio::net::TcpListener::bind(&server_cfg.server.bind)
		.await
		.with_context(|| format!("bind {}", server_cfg.server.bind))?;
	let local_addr = listener.local_addr().context("listener local_addr")?;

	health.mark_ready();
	info!(bind = %local_addr, "courselink_server: listening");

	axum::serve(listener, app)
		.with_graceful_shutdown(shutdown_signal())
		.await
		.context("serve")?;

	Ok(())
}
