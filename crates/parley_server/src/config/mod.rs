#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use parley_protocol::DEFAULT_MAX_FRAME_SIZE;
use parley_util::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.parley/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parley").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub uploads: UploadSettings,
	pub calls: CallSettings,
	pub persistence: PersistenceSettings,
	pub assistant: AssistantSettings,
}

/// Transport and connection settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	pub max_frame_bytes: usize,
	/// Per-connection outbound queue depth; deliveries beyond it are dropped.
	pub outbound_queue_capacity: usize,
	/// Inbound rate limiting: per-connection burst size (0 disables).
	pub rate_limit_burst: u32,
	/// Inbound rate limiting: per-connection frames per minute (0 disables).
	pub rate_limit_per_minute: u32,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			tls_cert_path: None,
			tls_key_path: None,
			metrics_bind: None,
			health_bind: None,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			outbound_queue_capacity: 1024,
			rate_limit_burst: 60,
			rate_limit_per_minute: 600,
		}
	}
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
	/// HMAC secret for access tokens; an ephemeral one is generated when absent.
	pub hmac_secret: Option<SecretString>,
	pub token_ttl: Duration,
}

impl Default for AuthSettings {
	fn default() -> Self {
		Self {
			hmac_secret: None,
			token_ttl: Duration::from_secs(86_400),
		}
	}
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
	pub scratch_dir: PathBuf,
	pub storage_dir: PathBuf,
	/// Prefix for file URLs handed back to clients (`<base>/uploads/<file>`).
	pub public_base_url: String,
	pub default_chunk_size: u64,
	pub max_file_bytes: u64,
	pub max_chunks: u64,
	/// Unfinished sessions older than this are reaped.
	pub ttl: Duration,
	pub sweep_interval: Duration,
}

impl Default for UploadSettings {
	fn default() -> Self {
		Self {
			scratch_dir: PathBuf::from("./uploads/temp"),
			storage_dir: PathBuf::from("./uploads"),
			public_base_url: String::new(),
			default_chunk_size: 1024 * 1024,
			max_file_bytes: 100 * 1024 * 1024,
			max_chunks: 10_000,
			ttl: Duration::from_secs(3600),
			sweep_interval: Duration::from_secs(60),
		}
	}
}

#[derive(Debug, Clone)]
pub struct CallSettings {
	/// Unanswered calls are ended with reason `timeout` after this long.
	pub ring_timeout: Duration,
}

impl Default for CallSettings {
	fn default() -> Self {
		Self {
			ring_timeout: Duration::from_secs(60),
		}
	}
}

/// Persistence settings; no database URL means in-memory storage.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Database URL (sqlite:, postgres: or mysql:).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AssistantSettings {
	pub api_key: Option<SecretString>,
	/// Completion endpoint override.
	pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	uploads: FileUploadSettings,

	#[serde(default)]
	calls: FileCallSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	assistant: FileAssistantSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	max_frame_bytes: Option<usize>,
	outbound_queue_capacity: Option<usize>,
	rate_limit_burst: Option<u32>,
	rate_limit_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	hmac_secret: Option<String>,
	token_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileUploadSettings {
	scratch_dir: Option<String>,
	storage_dir: Option<String>,
	public_base_url: Option<String>,
	default_chunk_size: Option<u64>,
	max_file_bytes: Option<u64>,
	max_chunks: Option<u64>,
	ttl_secs: Option<u64>,
	sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileCallSettings {
	ring_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAssistantSettings {
	api_key: Option<String>,
	endpoint: Option<String>,
}

fn non_blank(s: Option<String>) -> Option<String> {
	s.filter(|s| !s.trim().is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let server_defaults = ServerSettings::default();
		let auth_defaults = AuthSettings::default();
		let upload_defaults = UploadSettings::default();
		let call_defaults = CallSettings::default();

		Self {
			server: ServerSettings {
				tls_cert_path: non_blank(file.server.tls_cert_path).map(PathBuf::from),
				tls_key_path: non_blank(file.server.tls_key_path).map(PathBuf::from),
				metrics_bind: non_blank(file.server.metrics_bind),
				health_bind: non_blank(file.server.health_bind),
				max_frame_bytes: file
					.server
					.max_frame_bytes
					.filter(|v| *v > 0)
					.unwrap_or(server_defaults.max_frame_bytes),
				outbound_queue_capacity: file
					.server
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(server_defaults.outbound_queue_capacity),
				rate_limit_burst: file.server.rate_limit_burst.unwrap_or(server_defaults.rate_limit_burst),
				rate_limit_per_minute: file
					.server
					.rate_limit_per_minute
					.unwrap_or(server_defaults.rate_limit_per_minute),
			},
			auth: AuthSettings {
				hmac_secret: non_blank(file.auth.hmac_secret).map(SecretString::new),
				token_ttl: file
					.auth
					.token_ttl_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(auth_defaults.token_ttl),
			},
			uploads: UploadSettings {
				scratch_dir: non_blank(file.uploads.scratch_dir)
					.map(PathBuf::from)
					.unwrap_or(upload_defaults.scratch_dir),
				storage_dir: non_blank(file.uploads.storage_dir)
					.map(PathBuf::from)
					.unwrap_or(upload_defaults.storage_dir),
				public_base_url: non_blank(file.uploads.public_base_url)
					.map(|s| s.trim_end_matches('/').to_string())
					.unwrap_or(upload_defaults.public_base_url),
				default_chunk_size: file
					.uploads
					.default_chunk_size
					.filter(|v| *v > 0)
					.unwrap_or(upload_defaults.default_chunk_size),
				max_file_bytes: file
					.uploads
					.max_file_bytes
					.filter(|v| *v > 0)
					.unwrap_or(upload_defaults.max_file_bytes),
				max_chunks: file
					.uploads
					.max_chunks
					.filter(|v| *v > 0)
					.unwrap_or(upload_defaults.max_chunks),
				ttl: file
					.uploads
					.ttl_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(upload_defaults.ttl),
				sweep_interval: file
					.uploads
					.sweep_interval_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(upload_defaults.sweep_interval),
			},
			calls: CallSettings {
				ring_timeout: file
					.calls
					.ring_timeout_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(call_defaults.ring_timeout),
			},
			persistence: PersistenceSettings {
				database_url: non_blank(file.persistence.database_url),
			},
			assistant: AssistantSettings {
				api_key: non_blank(file.assistant.api_key).map(SecretString::new),
				endpoint: non_blank(file.assistant.endpoint),
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

fn env_string(name: &str) -> Option<String> {
	std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Some(v) = env_string("PARLEY_TLS_CERT") {
		cfg.server.tls_cert_path = Some(PathBuf::from(v));
		info!("server config: tls_cert_path overridden by env");
	}

	if let Some(v) = env_string("PARLEY_TLS_KEY") {
		cfg.server.tls_key_path = Some(PathBuf::from(v));
		info!("server config: tls_key_path overridden by env");
	}

	if let Some(v) = env_string("PARLEY_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env_string("PARLEY_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_MAX_FRAME_BYTES")
		&& let Ok(max) = v.trim().parse::<usize>()
		&& max > 0
	{
		cfg.server.max_frame_bytes = max;
		info!(max, "server config: max_frame_bytes overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_OUTBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.server.outbound_queue_capacity = capacity;
		info!(capacity, "server config: outbound_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_RATE_LIMIT_BURST")
		&& let Ok(burst) = v.trim().parse::<u32>()
	{
		cfg.server.rate_limit_burst = burst;
		info!(burst, "server config: rate_limit_burst overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_RATE_LIMIT_PER_MINUTE")
		&& let Ok(rate) = v.trim().parse::<u32>()
	{
		cfg.server.rate_limit_per_minute = rate;
		info!(rate, "server config: rate_limit_per_minute overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_RATE_LIMIT_ENABLED")
		&& let Some(false) = parse_env_bool(&v)
	{
		cfg.server.rate_limit_burst = 0;
		cfg.server.rate_limit_per_minute = 0;
		info!("server config: rate limiting disabled by env");
	}

	if let Some(v) = env_string("PARLEY_AUTH_HMAC_SECRET") {
		cfg.auth.hmac_secret = Some(SecretString::new(v));
		info!("server auth: hmac_secret overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_TOKEN_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.auth.token_ttl = Duration::from_secs(secs);
		info!(secs, "server auth: token_ttl overridden by env");
	}

	if let Some(v) = env_string("PARLEY_UPLOAD_SCRATCH_DIR") {
		cfg.uploads.scratch_dir = PathBuf::from(v);
		info!("uploads: scratch_dir overridden by env");
	}

	if let Some(v) = env_string("PARLEY_UPLOAD_STORAGE_DIR") {
		cfg.uploads.storage_dir = PathBuf::from(v);
		info!("uploads: storage_dir overridden by env");
	}

	if let Some(v) = env_string("PARLEY_PUBLIC_BASE_URL") {
		cfg.uploads.public_base_url = v.trim_end_matches('/').to_string();
		info!("uploads: public_base_url overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_UPLOAD_MAX_FILE_BYTES")
		&& let Ok(max) = v.trim().parse::<u64>()
		&& max > 0
	{
		cfg.uploads.max_file_bytes = max;
		info!(max, "uploads: max_file_bytes overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_UPLOAD_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.uploads.ttl = Duration::from_secs(secs);
		info!(secs, "uploads: ttl overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_CALL_RING_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.calls.ring_timeout = Duration::from_secs(secs);
		info!(secs, "calls: ring_timeout overridden by env");
	}

	if let Some(v) = env_string("PARLEY_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = env_string("PARLEY_ASSISTANT_API_KEY").or_else(|| env_string("GEMINI_API_KEY")) {
		cfg.assistant.api_key = Some(SecretString::new(v));
		info!("assistant: api_key overridden by env");
	}

	if let Some(v) = env_string("PARLEY_ASSISTANT_ENDPOINT") {
		cfg.assistant.endpoint = Some(v);
		info!("assistant: endpoint overridden by env");
	}

	if cfg.server.tls_cert_path.is_some() != cfg.server.tls_key_path.is_some() {
		warn!("server config: tls_cert_path and tls_key_path must both be set; falling back to a self-signed cert");
	}

	if cfg.uploads.default_chunk_size > cfg.uploads.max_file_bytes {
		warn!(
			chunk = cfg.uploads.default_chunk_size,
			max = cfg.uploads.max_file_bytes,
			"uploads: default_chunk_size > max_file_bytes; clamping"
		);
		cfg.uploads.default_chunk_size = cfg.uploads.max_file_bytes;
	}
}
