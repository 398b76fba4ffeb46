#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::BytesMut;
use parley_domain::UserId;
use parley_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, encode_frame, try_decode_frame};
use parley_protocol::version::ALPN;
use parley_protocol::{ClientEvent, ServerEvent};
use parley_util::QuicEndpoint;
use quinn::{Endpoint, TransportConfig, VarInt};
use tracing::{debug, info};

/// Client session configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Remote server host (DNS name or IP literal). Also used as TLS SNI.
	pub server_host: String,

	/// Remote server UDP port.
	pub server_port: u16,

	/// Resolved remote server address override.
	pub server_addr: Option<SocketAddr>,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,

	/// Timeout for connect + welcome.
	pub connect_timeout: Duration,
}

impl ClientConfig {
	/// Create a config from `quic://host:port`.
	pub fn from_quic_endpoint(endpoint: &str) -> Result<Self, ClientCoreError> {
		let e = QuicEndpoint::parse(endpoint)
			.map_err(|msg| ClientCoreError::Protocol(format!("invalid endpoint (expected quic://host:port): {msg}")))?;
		Ok(Self {
			server_host: e.server_name().to_string(),
			server_port: e.port,
			server_addr: None,
			..Self::default()
		})
	}

	/// Config pointing straight at a socket address.
	pub fn for_addr(addr: SocketAddr) -> Self {
		Self {
			server_host: "localhost".to_string(),
			server_port: addr.port(),
			server_addr: Some(addr),
			..Self::default()
		}
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			server_host: "localhost".to_string(),
			server_port: 18203,
			server_addr: None,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
		}
	}
}

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	/// QUIC endpoint setup failed.
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Unexpected message ordering or types.
	#[error("protocol error: {0}")]
	Protocol(String),

	/// The server answered with an `error` frame.
	#[error("server error {code}: {message}")]
	Server {
		code: String,
		message: String,
	},

	#[error("timed out waiting for {0}")]
	Timeout(String),

	#[error("io error: {0}")]
	Io(String),

	#[error("error: {0}")]
	Other(String),
}

impl From<anyhow::Error> for ClientCoreError {
	fn from(e: anyhow::Error) -> Self {
		ClientCoreError::Other(format!("{e:#}"))
	}
}

/// Greeting sent by the server once the stream is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
	pub session_id: String,
	pub server_time: i64,
	pub max_frame_bytes: u64,
	pub protocol_version: u32,
}

/// Result of a successful login.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
	pub user_id: UserId,
	pub username: String,
	pub token: String,
}

/// One connection to the server: a single bidirectional stream of JSON frames.
pub struct Session {
	conn: quinn::Connection,
	send: quinn::SendStream,
	recv: quinn::RecvStream,
	buf: BytesMut,
	max_frame_bytes: usize,
	// Dropping the endpoint would tear the connection down with it.
	_endpoint: Endpoint,
}

impl Session {
	/// Connect and wait for `welcome`.
	pub async fn connect(cfg: ClientConfig) -> Result<(Self, Welcome), ClientCoreError> {
		let endpoint = make_client_endpoint().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;
		let quinn_cfg = make_insecure_client_config().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;

		let connect_timeout = cfg.connect_timeout;
		let server_name = cfg.server_host.clone();

		let candidates = match cfg.server_addr {
			Some(addr) => vec![addr],
			None => QuicEndpoint {
				host: cfg.server_host.clone(),
				port: cfg.server_port,
			}
			.resolve()
			.map_err(|e| ClientCoreError::Connect(e.to_string()))?,
		};

		let mut last_err: Option<String> = None;
		let mut conn: Option<quinn::Connection> = None;

		for server_addr in candidates {
			let connecting = endpoint
				.connect_with(quinn_cfg.clone(), server_addr, &server_name)
				.map_err(|e| ClientCoreError::Connect(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

			match tokio::time::timeout(connect_timeout, connecting).await {
				Ok(Ok(c)) => {
					conn = Some(c);
					break;
				}
				Ok(Err(e)) => {
					last_err = Some(format!("connect failed (addr={server_addr}, sni={server_name}): {e}"));
				}
				Err(_) => {
					last_err = Some(format!(
						"connect timeout after {connect_timeout:?} (addr={server_addr}, sni={server_name})"
					));
				}
			}
		}

		let conn = conn.ok_or_else(|| {
			ClientCoreError::Connect(
				last_err.unwrap_or_else(|| format!("connect failed (no addresses attempted) (sni={server_name})")),
			)
		})?;

		info!(remote = %conn.remote_address(), "connected");

		let (send, recv) = tokio::time::timeout(connect_timeout, conn.open_bi())
			.await
			.map_err(|_| ClientCoreError::Timeout("stream open".to_string()))?
			.map_err(|e| ClientCoreError::Io(format!("open_bi failed: {e}")))?;

		let mut session = Self {
			conn,
			send,
			recv,
			buf: BytesMut::with_capacity(16 * 1024),
			max_frame_bytes: cfg.max_frame_bytes,
			_endpoint: endpoint,
		};

		// The server only sees the stream once it carries data.
		session.send(&ClientEvent::Ping {}).await?;

		let welcome = match tokio::time::timeout(connect_timeout, session.recv()).await {
			Ok(Ok(ServerEvent::Welcome {
				session_id,
				server_time,
				max_frame_bytes,
				protocol_version,
			})) => Welcome {
				session_id,
				server_time,
				max_frame_bytes,
				protocol_version,
			},
			Ok(Ok(other)) => return Err(ClientCoreError::Protocol(format!("expected welcome, got {other:?}"))),
			Ok(Err(e)) => return Err(e),
			Err(_) => return Err(ClientCoreError::Timeout("welcome".to_string())),
		};

		session
			.recv_until(connect_timeout, |ev| matches!(ev, ServerEvent::Pong { .. }))
			.await?;
		session.max_frame_bytes = (welcome.max_frame_bytes as usize).min(cfg.max_frame_bytes);

		debug!(
			session_id = %welcome.session_id,
			protocol_version = welcome.protocol_version,
			max_frame_bytes = welcome.max_frame_bytes,
			"received welcome"
		);
		Ok((session, welcome))
	}

	pub async fn send(&mut self, event: &ClientEvent) -> Result<(), ClientCoreError> {
		let frame = encode_frame(event, self.max_frame_bytes)?;
		self.send
			.write_all(&frame)
			.await
			.map_err(|e| ClientCoreError::Io(e.to_string()))?;
		Ok(())
	}

	/// Next server event, in arrival order.
	pub async fn recv(&mut self) -> Result<ServerEvent, ClientCoreError> {
		let mut tmp = [0u8; 8192];

		loop {
			if let Some(event) = try_decode_frame::<ServerEvent>(&mut self.buf, self.max_frame_bytes)? {
				return Ok(event);
			}

			let n = match self.recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => {
					return Err(ClientCoreError::Protocol(
						"stream closed before receiving full message".to_string(),
					));
				}
				Err(e) => return Err(ClientCoreError::Io(e.to_string())),
			};

			self.buf.extend_from_slice(&tmp[..n]);
		}
	}

	/// Skip events until one matches `want`. An `error` frame ends the wait early.
	pub async fn recv_until<F>(&mut self, timeout: Duration, mut want: F) -> Result<ServerEvent, ClientCoreError>
	where
		F: FnMut(&ServerEvent) -> bool,
	{
		let wait = async {
			loop {
				let event = match self.recv().await {
					Ok(event) => event,
					Err(e) => return Err(e),
				};
				if want(&event) {
					return Ok(event);
				}
				if let ServerEvent::Error { code, message, .. } = event {
					return Err(ClientCoreError::Server { code, message });
				}
				debug!(?event, "skipping event");
			}
		};

		tokio::time::timeout(timeout, wait)
			.await
			.map_err(|_| ClientCoreError::Timeout("matching event".to_string()))?
	}

	/// Create an account. Returns the new user id.
	pub async fn register(&mut self, username: &str, password: &str) -> Result<UserId, ClientCoreError> {
		self.send(&ClientEvent::Register {
			username: username.to_string(),
			password: password.to_string(),
			email: None,
		})
		.await?;

		match self
			.recv_until(Duration::from_secs(10), |ev| matches!(ev, ServerEvent::RegisterResponse { .. }))
			.await?
		{
			ServerEvent::RegisterResponse {
				success: true,
				user_id: Some(user_id),
				..
			} => Ok(user_id),
			ServerEvent::RegisterResponse { message, .. } => Err(ClientCoreError::Server {
				code: "register_failed".to_string(),
				message,
			}),
			other => Err(ClientCoreError::Protocol(format!("expected register_response, got {other:?}"))),
		}
	}

	/// Log in and bind this session to the account.
	pub async fn login(&mut self, username: &str, password: &str) -> Result<LoginOutcome, ClientCoreError> {
		self.send(&ClientEvent::Login {
			username: username.to_string(),
			password: password.to_string(),
		})
		.await?;

		match self
			.recv_until(Duration::from_secs(10), |ev| matches!(ev, ServerEvent::LoginResponse { .. }))
			.await?
		{
			ServerEvent::LoginResponse {
				success: true,
				user_id: Some(user_id),
				username: Some(username),
				token: Some(token),
				..
			} => Ok(LoginOutcome {
				user_id,
				username,
				token,
			}),
			ServerEvent::LoginResponse { message, .. } => Err(ClientCoreError::Server {
				code: "login_failed".to_string(),
				message,
			}),
			other => Err(ClientCoreError::Protocol(format!("expected login_response, got {other:?}"))),
		}
	}

	/// Finish the stream so the server tears the session down, then close the connection.
	pub async fn close(mut self) {
		let _ = self.send.finish();
		let _ = tokio::time::timeout(Duration::from_secs(2), self.send.stopped()).await;
		self.conn.close(VarInt::from_u32(0), b"bye");
	}
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	let addr: SocketAddr = "0.0.0.0:0".parse().context("parse client bind addr")?;
	let endpoint = Endpoint::client(addr).context("create client endpoint")?;
	Ok(endpoint)
}

/// Dev-only TLS config that skips server cert validation.
fn make_insecure_client_config() -> anyhow::Result<quinn::ClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	#[derive(Debug)]
	struct NoVerifier;

	impl rustls::client::danger::ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &rustls::pki_types::CertificateDer<'_>,
			_intermediates: &[rustls::pki_types::CertificateDer<'_>],
			_server_name: &rustls::pki_types::ServerName<'_>,
			_ocsp_response: &[u8],
			_now: rustls::pki_types::UnixTime,
		) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
			Ok(rustls::client::danger::ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Err(rustls::Error::General("TLS1.2 not supported".into()))
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			vec![
				rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
				rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA256,
				rustls::SignatureScheme::RSA_PSS_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA512,
				rustls::SignatureScheme::ED25519,
			]
		}
	}

	let mut tls = rustls::ClientConfig::builder()
		.with_root_certificates(rustls::RootCertStore::empty())
		.with_no_client_auth();

	tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
	tls.alpn_protocols = vec![ALPN.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;
	let mut cfg = quinn::ClientConfig::new(Arc::new(quic_tls));

	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(4));
	transport.max_concurrent_uni_streams(VarInt::from_u32(0));
	transport.keep_alive_interval(Some(Duration::from_secs(15)));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}
