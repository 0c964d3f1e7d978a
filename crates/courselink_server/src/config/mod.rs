#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use courselink_protocol::DEFAULT_MAX_FRAME_SIZE;
use serde::Deserialize;
use tracing::{info, warn};

use crate::util::SecretString;

pub const DEFAULT_BIND: &str = "0.0.0.0:4000";
pub const DEFAULT_DATABASE_URL: &str = "sqlite:courselink.db";
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Default config path: `~/.courselink/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".courselink").join("config.toml"))
}

/// Load the server config from TOML and `COURSELINK_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// HTTP/WebSocket listen address (host:port).
	pub bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// HS256 secret shared with the account service.
	pub auth_secret: Option<SecretString>,
	/// Browser origin allowed to call the HTTP API. `None` allows any.
	pub frontend_origin: Option<String>,
	pub outbound_queue_capacity: usize,
	pub max_frame_bytes: usize,
	pub debug_room_logs: bool,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: DEFAULT_BIND.to_string(),
			metrics_bind: None,
			auth_secret: None,
			frontend_origin: None,
			outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			debug_room_logs: false,
		}
	}
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	/// `sqlite:...`, `postgres://...`, or `memory:`.
	pub database_url: String,
	pub store_timeout: Duration,
	pub run_migrations: bool,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			database_url: DEFAULT_DATABASE_URL.to_string(),
			store_timeout: DEFAULT_STORE_TIMEOUT,
			run_migrations: true,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	auth_secret: Option<String>,
	frontend_origin: Option<String>,
	outbound_queue_capacity: Option<usize>,
	max_frame_bytes: Option<usize>,
	debug_room_logs: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
	store_timeout_ms: Option<u64>,
	run_migrations: Option<bool>,
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();
		let persistence_defaults = PersistenceSettings::default();

		Self {
			server: ServerSettings {
				bind: non_blank(file.server.bind).unwrap_or(defaults.bind),
				metrics_bind: non_blank(file.server.metrics_bind),
				auth_secret: non_blank(file.server.auth_secret).map(SecretString::new),
				frontend_origin: non_blank(file.server.frontend_origin),
				outbound_queue_capacity: file
					.server
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.outbound_queue_capacity),
				max_frame_bytes: file
					.server
					.max_frame_bytes
					.filter(|v| *v > 0)
					.unwrap_or(defaults.max_frame_bytes),
				debug_room_logs: file.server.debug_room_logs.unwrap_or(false),
			},
			persistence: PersistenceSettings {
				database_url: non_blank(file.persistence.database_url).unwrap_or(persistence_defaults.database_url),
				store_timeout: file
					.persistence
					.store_timeout_ms
					.filter(|v| *v > 0)
					.map(Duration::from_millis)
					.unwrap_or(persistence_defaults.store_timeout),
				run_migrations: file.persistence.run_migrations.unwrap_or(true),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

/// Apply overrides from `lookup` (the process environment outside tests).
fn apply_overrides(cfg: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
	let get = |key: &str| non_blank(lookup(key));

	if let Some(v) = get("COURSELINK_AUTH_SECRET") {
		cfg.server.auth_secret = Some(SecretString::new(v));
		info!("server auth: auth_secret overridden by env");
	}

	if let Some(v) = get("COURSELINK_BIND") {
		info!(bind = %v, "server config: bind overridden by env");
		cfg.server.bind = v;
	}

	if let Some(v) = get("COURSELINK_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = get("COURSELINK_FRONTEND_URL") {
		info!(origin = %v, "server config: frontend_origin overridden by env");
		cfg.server.frontend_origin = Some(v);
	}

	if let Some(v) = get("COURSELINK_OUTBOUND_QUEUE_CAPACITY") {
		match v.parse::<usize>() {
			Ok(capacity) if capacity > 0 => {
				cfg.server.outbound_queue_capacity = capacity;
				info!(capacity, "server config: outbound_queue_capacity overridden by env");
			}
			_ => warn!(value = %v, "ignoring invalid COURSELINK_OUTBOUND_QUEUE_CAPACITY"),
		}
	}

	if let Some(v) = get("COURSELINK_MAX_FRAME_BYTES") {
		match v.parse::<usize>() {
			Ok(bytes) if bytes > 0 => {
				cfg.server.max_frame_bytes = bytes;
				info!(bytes, "server config: max_frame_bytes overridden by env");
			}
			_ => warn!(value = %v, "ignoring invalid COURSELINK_MAX_FRAME_BYTES"),
		}
	}

	if let Some(v) = get("COURSELINK_DATABASE_URL") {
		cfg.persistence.database_url = v;
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = get("COURSELINK_STORE_TIMEOUT_MS") {
		match v.parse::<u64>() {
			Ok(ms) if ms > 0 => {
				cfg.persistence.store_timeout = Duration::from_millis(ms);
				info!(ms, "persistence: store_timeout overridden by env");
			}
			_ => warn!(value = %v, "ignoring invalid COURSELINK_STORE_TIMEOUT_MS"),
		}
	}

	if let Some(v) = get("COURSELINK_RUN_MIGRATIONS")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.run_migrations = enabled;
		info!(enabled, "persistence: run_migrations overridden by env");
	}
}
