#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use parley_domain::{RoomId, SessionId, UserId};
use parley_protocol::OnlineUser;
use thiserror::Error;
use tracing::{debug, info};

use crate::server::broker::Broker;
use crate::server::outbox::Outbox;
use crate::util::time::unix_ms_now;

/// Server-assigned connection handle, increasing per accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u64);

impl fmt::Display for ConnectionHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

/// Snapshot of one live connection.
#[derive(Debug, Clone)]
pub struct Connection {
	pub handle: ConnectionHandle,
	pub session_id: SessionId,
	pub user_id: Option<UserId>,
	pub display_name: String,
	pub room: Option<RoomId>,
	pub authenticated: bool,
	pub connected_at_ms: i64,
	pub outbox: Outbox,
}

impl Connection {
	/// Broker subscriber id for this connection.
	pub fn subscriber_id(&self) -> String {
		self.session_id.to_string()
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
	#[error("connection is already authenticated")]
	AlreadyAuthenticated,

	#[error("user id must be non-empty")]
	InvalidIdentity,

	#[error("unknown connection {0}")]
	UnknownConnection(ConnectionHandle),
}

/// Live connections plus a user -> handles index for multi-device users.
pub struct Registry {
	broker: Arc<Broker>,
	inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
	connections: HashMap<ConnectionHandle, Connection>,
	by_user: HashMap<UserId, BTreeSet<ConnectionHandle>>,
}

impl Registry {
	pub fn new(broker: Arc<Broker>) -> Self {
		Self {
			broker,
			inner: Mutex::new(Inner::default()),
		}
	}

	/// Track a new, unauthenticated connection with a fresh session id.
	pub fn register(&self, handle: ConnectionHandle, outbox: Outbox) -> Connection {
		let conn = Connection {
			handle,
			session_id: SessionId::generate(),
			user_id: None,
			display_name: String::new(),
			room: None,
			authenticated: false,
			connected_at_ms: unix_ms_now(),
			outbox,
		};

		self.inner.lock().connections.insert(handle, conn.clone());
		debug!(%handle, session_id = %conn.session_id, "registry: connection registered");
		conn
	}

	pub fn authenticate(
		&self,
		handle: ConnectionHandle,
		user_id: UserId,
		display_name: &str,
	) -> Result<Connection, RegistryError> {
		if user_id.as_str().trim().is_empty() {
			return Err(RegistryError::InvalidIdentity);
		}

		let mut inner = self.inner.lock();
		let conn = inner
			.connections
			.get_mut(&handle)
			.ok_or(RegistryError::UnknownConnection(handle))?;
		if conn.authenticated {
			return Err(RegistryError::AlreadyAuthenticated);
		}

		conn.user_id = Some(user_id.clone());
		conn.display_name = if display_name.trim().is_empty() {
			user_id.to_string()
		} else {
			display_name.to_string()
		};
		conn.authenticated = true;
		let snapshot = conn.clone();

		inner.by_user.entry(user_id.clone()).or_default().insert(handle);
		info!(%handle, user_id = %user_id, "registry: connection authenticated");
		Ok(snapshot)
	}

	/// Set the active room. Returns the previous one; subscriptions are the caller's business.
	pub fn set_room(&self, handle: ConnectionHandle, room: Option<RoomId>) -> Result<Option<RoomId>, RegistryError> {
		let mut inner = self.inner.lock();
		let conn = inner
			.connections
			.get_mut(&handle)
			.ok_or(RegistryError::UnknownConnection(handle))?;
		Ok(std::mem::replace(&mut conn.room, room))
	}

	/// Forget a connection and drop all its broker subscriptions. Idempotent.
	pub fn remove(&self, handle: ConnectionHandle) -> Option<Connection> {
		let conn = {
			let mut inner = self.inner.lock();
			let conn = inner.connections.remove(&handle)?;
			if let Some(user) = &conn.user_id
				&& let Some(handles) = inner.by_user.get_mut(user)
			{
				handles.remove(&handle);
				if handles.is_empty() {
					inner.by_user.remove(user);
				}
			}
			conn
		};

		let dropped = self.broker.unsubscribe_all(&conn.subscriber_id());
		debug!(%handle, dropped, "registry: connection removed");
		Some(conn)
	}

	pub fn get(&self, handle: ConnectionHandle) -> Option<Connection> {
		self.inner.lock().connections.get(&handle).cloned()
	}

	pub fn connections_for_user(&self, user: &UserId) -> Vec<Connection> {
		let inner = self.inner.lock();
		inner
			.by_user
			.get(user)
			.map(|handles| {
				handles
					.iter()
					.filter_map(|h| inner.connections.get(h).cloned())
					.collect()
			})
			.unwrap_or_default()
	}

	pub fn is_online(&self, user: &UserId) -> bool {
		self.inner.lock().by_user.contains_key(user)
	}

	/// One entry per authenticated user, sorted by user id.
	pub fn online_users(&self) -> Vec<OnlineUser> {
		let inner = self.inner.lock();
		let mut users = inner
			.by_user
			.iter()
			.map(|(user, handles)| {
				let username = handles
					.iter()
					.find_map(|h| inner.connections.get(h))
					.map(|c| c.display_name.clone())
					.unwrap_or_else(|| user.to_string());
				OnlineUser {
					user_id: user.clone(),
					username,
					connections: handles.len(),
				}
			})
			.collect::<Vec<_>>();
		users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
		users
	}

	pub fn len(&self) -> usize {
		self.inner.lock().connections.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
