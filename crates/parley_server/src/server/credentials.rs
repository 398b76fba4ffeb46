#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use argon2::password_hash::{self, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use parley_util::SecretString;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};

use crate::server::store::{Store, StoreError, UserRecord};
use crate::util::time::unix_secs_now;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_VERSION: &str = "v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
	pub sub: String,
	pub name: String,
	pub exp: u64,
}

#[derive(Debug, Error)]
pub enum AuthError {
	#[error("invalid username or password")]
	InvalidCredentials,

	#[error("username already taken")]
	UsernameTaken,

	#[error("invalid token: {0}")]
	InvalidToken(String),

	#[error("{0}")]
	Validation(String),

	#[error(transparent)]
	Store(#[from] StoreError),

	#[error("credential failure: {0}")]
	Internal(String),
}

#[async_trait::async_trait]
pub trait CredentialService: Send + Sync {
	async fn register(&self, username: &str, password: &str, email: Option<&str>) -> Result<UserRecord, AuthError>;

	async fn verify_credentials(&self, username: &str, password: &str) -> Result<UserRecord, AuthError>;

	fn issue_token(&self, user: &UserRecord) -> Result<String, AuthError>;

	fn verify_token(&self, token: &str) -> Result<TokenClaims, AuthError>;
}

/// Accounts backed by a [`Store`]; Argon2id password hashes and HMAC-signed bearer tokens.
pub struct StoreCredentials {
	store: Arc<dyn Store>,
	secret: SecretString,
	token_ttl: Duration,
	hasher: Argon2<'static>,
}

impl StoreCredentials {
	pub fn new(store: Arc<dyn Store>, secret: Option<SecretString>, token_ttl: Duration) -> Self {
		let secret = secret.unwrap_or_else(|| {
			warn!("auth: no hmac_secret configured; tokens will not survive a restart");
			SecretString::new(format!(
				"{}{}",
				uuid::Uuid::new_v4().simple(),
				uuid::Uuid::new_v4().simple()
			))
		});

		Self {
			store,
			secret,
			token_ttl,
			hasher: Argon2::default(),
		}
	}

	/// Override the Argon2id cost used for new hashes. Existing hashes keep their own.
	pub fn with_password_params(mut self, params: Params) -> Self {
		self.hasher = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
		self
	}

	async fn hash_blocking(&self, password: &str) -> Result<String, AuthError> {
		let hasher = self.hasher.clone();
		let password = password.to_string();
		tokio::task::spawn_blocking(move || hash_password(&hasher, &password))
			.await
			.map_err(|e| AuthError::Internal(format!("hash task: {e}")))?
	}

	async fn verify_blocking(&self, password: &str, stored: &str) -> Result<bool, AuthError> {
		let hasher = self.hasher.clone();
		let (password, stored) = (password.to_string(), stored.to_string());
		tokio::task::spawn_blocking(move || verify_password(&hasher, &password, &stored))
			.await
			.map_err(|e| AuthError::Internal(format!("verify task: {e}")))?
	}

	fn sign(&self, payload_b64: &[u8]) -> Result<Vec<u8>, AuthError> {
		let mut mac = HmacSha256::new_from_slice(self.secret.expose().as_bytes())
			.map_err(|e| AuthError::Internal(format!("hmac key: {e}")))?;
		mac.update(payload_b64);
		Ok(mac.finalize().into_bytes().to_vec())
	}
}

#[async_trait::async_trait]
impl CredentialService for StoreCredentials {
	async fn register(&self, username: &str, password: &str, email: Option<&str>) -> Result<UserRecord, AuthError> {
		let username = username.trim();
		validate_username(username)?;
		validate_password(password)?;
		let email = email.map(str::trim).filter(|e| !e.is_empty());

		let hash = self.hash_blocking(password).await?;
		match self.store.create_user(username, email, &hash).await {
			Ok(user) => {
				debug!(user_id = %user.user_id, "auth: user registered");
				Ok(user)
			}
			Err(StoreError::Duplicate(_)) => Err(AuthError::UsernameTaken),
			Err(e) => Err(e.into()),
		}
	}

	async fn verify_credentials(&self, username: &str, password: &str) -> Result<UserRecord, AuthError> {
		let Some(user) = self.store.find_user_by_name(username.trim()).await? else {
			return Err(AuthError::InvalidCredentials);
		};

		if self.verify_blocking(password, &user.password_hash).await? {
			Ok(user)
		} else {
			Err(AuthError::InvalidCredentials)
		}
	}

	fn issue_token(&self, user: &UserRecord) -> Result<String, AuthError> {
		let claims = TokenClaims {
			sub: user.user_id.to_string(),
			name: user.username.clone(),
			exp: unix_secs_now() + self.token_ttl.as_secs(),
		};
		let payload = serde_json::to_vec(&claims).map_err(|e| AuthError::Internal(format!("encode claims: {e}")))?;
		let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
		let sig = self.sign(payload_b64.as_bytes())?;

		Ok(format!("{TOKEN_VERSION}.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
	}

	fn verify_token(&self, token: &str) -> Result<TokenClaims, AuthError> {
		let parts = token.trim().split('.').collect::<Vec<_>>();
		if parts.len() != 3 || parts[0] != TOKEN_VERSION {
			return Err(AuthError::InvalidToken("invalid token format".to_string()));
		}

		let payload_b64 = parts[1];
		let provided_sig = URL_SAFE_NO_PAD
			.decode(parts[2])
			.map_err(|_| AuthError::InvalidToken("undecodable signature".to_string()))?;
		let expected_sig = self.sign(payload_b64.as_bytes())?;
		if !constant_time_eq(&expected_sig, &provided_sig) {
			return Err(AuthError::InvalidToken("invalid token signature".to_string()));
		}

		let payload = URL_SAFE_NO_PAD
			.decode(payload_b64)
			.map_err(|_| AuthError::InvalidToken("undecodable payload".to_string()))?;
		let claims: TokenClaims =
			serde_json::from_slice(&payload).map_err(|_| AuthError::InvalidToken("malformed claims".to_string()))?;
		if claims.exp <= unix_secs_now() {
			return Err(AuthError::InvalidToken("token expired".to_string()));
		}

		Ok(claims)
	}
}

fn validate_username(username: &str) -> Result<(), AuthError> {
	let len = username.chars().count();
	if !(3..=32).contains(&len) {
		return Err(AuthError::Validation("username must be 3-32 characters".to_string()));
	}
	if !username
		.chars()
		.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
	{
		return Err(AuthError::Validation(
			"username may only contain letters, digits, '_', '-' and '.'".to_string(),
		));
	}
	Ok(())
}

fn validate_password(password: &str) -> Result<(), AuthError> {
	if password.chars().count() < 6 {
		return Err(AuthError::Validation("password must be at least 6 characters".to_string()));
	}
	Ok(())
}

/// PHC string (`$argon2id$v=19$m=...,t=...,p=...$<salt>$<hash>`).
fn hash_password(hasher: &Argon2<'_>, password: &str) -> Result<String, AuthError> {
	let salt = SaltString::encode_b64(uuid::Uuid::new_v4().as_bytes())
		.map_err(|e| AuthError::Internal(format!("password salt: {e}")))?;
	hasher
		.hash_password(password.as_bytes(), &salt)
		.map(|hash| hash.to_string())
		.map_err(|e| AuthError::Internal(format!("hash password: {e}")))
}

/// Cost parameters come from the stored hash, not from `hasher`.
fn verify_password(hasher: &Argon2<'_>, password: &str, stored: &str) -> Result<bool, AuthError> {
	let parsed = PasswordHash::new(stored).map_err(|e| AuthError::Internal(format!("malformed password hash: {e}")))?;
	match hasher.verify_password(password.as_bytes(), &parsed) {
		Ok(()) => Ok(true),
		Err(password_hash::Error::Password) => Ok(false),
		Err(e) => Err(AuthError::Internal(format!("verify password: {e}"))),
	}
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::server::store::MemoryStore;

	fn light_params() -> Params {
		Params::new(1024, 1, 1, None).expect("argon2 params")
	}

	fn service() -> StoreCredentials {
		StoreCredentials::new(
			Arc::new(MemoryStore::new()),
			Some(SecretString::new("test-secret")),
			Duration::from_secs(3600),
		)
		.with_password_params(light_params())
	}

	#[tokio::test]
	async fn register_then_login() {
		let creds = service();
		let user = creds.register("alice", "secret123", None).await.expect("register");
		assert!(user.password_hash.starts_with("$argon2id$v=19$m=1024,t=1,p=1$"));
		assert!(!user.password_hash.contains("secret123"));

		let again = creds.verify_credentials("ALICE", "secret123").await.expect("login");
		assert_eq!(again.user_id, user.user_id);

		match creds.verify_credentials("alice", "wrong-pass").await {
			Err(AuthError::InvalidCredentials) => {}
			other => panic!("expected InvalidCredentials, got: {other:?}"),
		}
		match creds.verify_credentials("nobody", "secret123").await {
			Err(AuthError::InvalidCredentials) => {}
			other => panic!("expected InvalidCredentials, got: {other:?}"),
		}
	}

	#[tokio::test]
	async fn password_hashes_are_salted_and_self_describing() {
		let creds = service();
		let a = creds.register("frank", "secret123", None).await.expect("register");
		let b = creds.register("grace", "secret123", None).await.expect("register");
		assert_ne!(a.password_hash, b.password_hash, "fresh salt per hash");

		// A hash made at a different cost still verifies.
		let stronger = Argon2::new(
			Algorithm::Argon2id,
			Version::V0x13,
			Params::new(2048, 2, 1, None).expect("params"),
		);
		let stored = hash_password(&stronger, "secret123").expect("hash");
		assert!(verify_password(&creds.hasher, "secret123", &stored).expect("verify"));
		assert!(!verify_password(&creds.hasher, "secret124", &stored).expect("verify"));

		match verify_password(&creds.hasher, "secret123", "v1$10000$salt$digest") {
			Err(AuthError::Internal(msg)) => assert!(msg.contains("malformed password hash")),
			other => panic!("expected Internal, got: {other:?}"),
		}
	}

	#[tokio::test]
	async fn duplicate_username_is_taken() {
		let creds = service();
		creds.register("bob", "secret123", None).await.expect("register");
		match creds.register("Bob", "another1", None).await {
			Err(AuthError::UsernameTaken) => {}
			other => panic!("expected UsernameTaken, got: {other:?}"),
		}
	}

	#[tokio::test]
	async fn rejects_weak_input() {
		let creds = service();
		assert!(matches!(
			creds.register("ab", "secret123", None).await,
			Err(AuthError::Validation(_))
		));
		assert!(matches!(
			creds.register("has space", "secret123", None).await,
			Err(AuthError::Validation(_))
		));
		assert!(matches!(
			creds.register("carol", "123", None).await,
			Err(AuthError::Validation(_))
		));
	}

	#[tokio::test]
	async fn token_roundtrip_and_tamper() {
		let creds = service();
		let user = creds.register("dave", "secret123", None).await.expect("register");
		let token = creds.issue_token(&user).expect("issue");

		let claims = creds.verify_token(&token).expect("verify");
		assert_eq!(claims.sub, user.user_id.to_string());
		assert_eq!(claims.name, "dave");

		let mut tampered = token.clone();
		tampered.push('A');
		assert!(matches!(creds.verify_token(&tampered), Err(AuthError::InvalidToken(_))));
		assert!(matches!(creds.verify_token("v2.a.b"), Err(AuthError::InvalidToken(_))));

		let other = StoreCredentials::new(
			Arc::new(MemoryStore::new()),
			Some(SecretString::new("other-secret")),
			Duration::from_secs(3600),
		);
		assert!(matches!(other.verify_token(&token), Err(AuthError::InvalidToken(_))));
	}

	#[tokio::test]
	async fn expired_token_rejected() {
		let creds = StoreCredentials::new(
			Arc::new(MemoryStore::new()),
			Some(SecretString::new("test-secret")),
			Duration::ZERO,
		)
		.with_password_params(light_params());
		let user = creds.register("erin", "secret123", None).await.expect("register");
		let token = creds.issue_token(&user).expect("issue");
		match creds.verify_token(&token) {
			Err(AuthError::InvalidToken(msg)) => assert!(msg.contains("expired")),
			other => panic!("expected InvalidToken, got: {other:?}"),
		}
	}
}
