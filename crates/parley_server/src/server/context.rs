#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tracing::info;

use crate::config::{ServerConfig, UploadSettings};
use crate::server::broker::Broker;
use crate::server::calls::CallSignaling;
use crate::server::completion::{DisabledCompletion, GeminiCompletion, TextCompletion};
use crate::server::credentials::{CredentialService, StoreCredentials};
use crate::server::registry::Registry;
use crate::server::store::{MemoryStore, SqlStore, Store};
use crate::server::uploads::UploadManager;

/// Services shared by every connection, built once at startup.
pub struct ServerContext {
	pub broker: Arc<Broker>,
	pub registry: Registry,
	pub calls: CallSignaling,
	pub uploads: UploadManager,
	pub store: Arc<dyn Store>,
	pub credentials: Arc<dyn CredentialService>,
	pub completion: Arc<dyn TextCompletion>,
	/// Advertised in `welcome`.
	pub max_frame_bytes: usize,
}

impl ServerContext {
	pub async fn from_config(cfg: &ServerConfig) -> anyhow::Result<Self> {
		let store: Arc<dyn Store> = match cfg.persistence.database_url.as_deref() {
			Some(url) => {
				let store = SqlStore::connect(url).await.context("open persistence store")?;
				info!("persistence: sql store connected");
				Arc::new(store)
			}
			None => {
				info!("persistence: in-memory store (history is lost on restart)");
				Arc::new(MemoryStore::new())
			}
		};

		let completion: Arc<dyn TextCompletion> = match cfg.assistant.api_key.clone() {
			Some(key) => Arc::new(GeminiCompletion::new(key, cfg.assistant.endpoint.clone())),
			None => {
				info!("assistant: no api key configured; ai_request is disabled");
				Arc::new(DisabledCompletion)
			}
		};

		let credentials = Arc::new(StoreCredentials::new(
			Arc::clone(&store),
			cfg.auth.hmac_secret.clone(),
			cfg.auth.token_ttl,
		));

		Ok(Self::assemble(
			store,
			credentials,
			completion,
			cfg.uploads.clone(),
			cfg.server.max_frame_bytes,
		))
	}

	/// In-memory services with a random token secret and a cheap password hash cost.
	pub fn in_memory(uploads: UploadSettings, max_frame_bytes: usize) -> Self {
		let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
		let credentials = Arc::new(
			StoreCredentials::new(
				Arc::clone(&store),
				Some(parley_util::SecretString::new(uuid::Uuid::new_v4().simple().to_string())),
				Duration::from_secs(3600),
			)
			.with_password_params(argon2::Params::new(1024, 1, 1, None).unwrap_or_default()),
		);
		Self::assemble(store, credentials, Arc::new(DisabledCompletion), uploads, max_frame_bytes)
	}

	pub fn with_completion(mut self, completion: Arc<dyn TextCompletion>) -> Self {
		self.completion = completion;
		self
	}

	fn assemble(
		store: Arc<dyn Store>,
		credentials: Arc<dyn CredentialService>,
		completion: Arc<dyn TextCompletion>,
		uploads: UploadSettings,
		max_frame_bytes: usize,
	) -> Self {
		let broker = Arc::new(Broker::new());
		Self {
			registry: Registry::new(Arc::clone(&broker)),
			calls: CallSignaling::new(Arc::clone(&broker)),
			uploads: UploadManager::new(Arc::clone(&broker), uploads),
			broker,
			store,
			credentials,
			completion,
			max_frame_bytes,
		}
	}
}
