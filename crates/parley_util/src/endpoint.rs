#![forbid(unsafe_code)]

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

use thiserror::Error;

const SCHEME: &str = "quic://";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EndpointError {
	#[error("endpoint must be non-empty (expected quic://host:port)")]
	Empty,

	#[error("endpoint must not carry a path, query or fragment: {0}")]
	TrailingComponents(String),

	#[error("endpoint is missing :port: {0}")]
	MissingPort(String),

	#[error("endpoint host is empty: {0}")]
	EmptyHost(String),

	#[error("IPv6 hosts must be bracketed like quic://[::1]:18203: {0}")]
	UnbracketedIpv6(String),

	#[error("endpoint port must be in 1..=65535: {0}")]
	InvalidPort(String),

	#[error("failed to resolve {0}: {1}")]
	Resolve(String, String),
}

/// A `host:port` pair, written as `quic://host:port` or bare `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuicEndpoint {
	pub host: String,
	pub port: u16,
}

impl QuicEndpoint {
	pub fn parse(s: &str) -> Result<Self, EndpointError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(EndpointError::Empty);
		}

		let rest = s.strip_prefix(SCHEME).unwrap_or(s);
		if rest.contains(['/', '?', '#']) {
			return Err(EndpointError::TrailingComponents(s.to_string()));
		}

		let (host, port) = rest
			.rsplit_once(':')
			.ok_or_else(|| EndpointError::MissingPort(s.to_string()))?;

		let host = host.trim();
		if host.is_empty() {
			return Err(EndpointError::EmptyHost(s.to_string()));
		}
		if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
			return Err(EndpointError::UnbracketedIpv6(s.to_string()));
		}

		let port = match port.trim().parse::<u16>() {
			Ok(p) if p != 0 => p,
			_ => return Err(EndpointError::InvalidPort(s.to_string())),
		};

		Ok(Self {
			host: host.to_string(),
			port,
		})
	}

	/// `host:port`, IPv6 hosts stay bracketed.
	pub fn hostport(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}

	/// Host name suitable for TLS SNI (brackets stripped).
	pub fn server_name(&self) -> &str {
		self.host.trim_start_matches('[').trim_end_matches(']')
	}

	/// Resolve to socket addresses; IP literals resolve without DNS.
	pub fn resolve(&self) -> Result<Vec<SocketAddr>, EndpointError> {
		if let Ok(addr) = self.hostport().parse::<SocketAddr>() {
			return Ok(vec![addr]);
		}

		let addrs = self
			.hostport()
			.to_socket_addrs()
			.map_err(|e| EndpointError::Resolve(self.hostport(), e.to_string()))?
			.collect::<Vec<_>>();

		if addrs.is_empty() {
			return Err(EndpointError::Resolve(self.hostport(), "no addresses".to_string()));
		}
		Ok(addrs)
	}
}

impl fmt::Display for QuicEndpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{SCHEME}{}:{}", self.host, self.port)
	}
}
