#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use anyhow::{Context as _, anyhow};
use parking_lot::Mutex;
use parley_domain::{MediaKind, RoomId, UserId};
use parley_protocol::ChatMessage;
use thiserror::Error;

use crate::util::time::unix_ms_now;

/// Rooms every deployment starts with.
pub const DEFAULT_ROOMS: &[(&str, &str)] = &[("global", "Global"), ("lobby", "Lobby")];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
	pub user_id: UserId,
	pub username: String,
	pub email: Option<String>,
	pub password_hash: String,
	pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
	pub room_id: RoomId,
	pub name: String,
	pub created_by: Option<UserId>,
	pub created_at: i64,
}

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("already exists: {0}")]
	Duplicate(String),

	#[error(transparent)]
	Backend(#[from] anyhow::Error),
}

/// Narrow persistence interface for accounts, rooms and chat history.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
	async fn create_user(&self, username: &str, email: Option<&str>, password_hash: &str) -> Result<UserRecord, StoreError>;

	/// Case-insensitive lookup.
	async fn find_user_by_name(&self, username: &str) -> Result<Option<UserRecord>, StoreError>;

	async fn create_room(&self, room: &RoomId, name: &str, created_by: Option<&UserId>) -> Result<RoomRecord, StoreError>;

	async fn list_rooms(&self) -> Result<Vec<RoomRecord>, StoreError>;

	async fn add_message(&self, msg: &ChatMessage) -> Result<(), StoreError>;

	/// Up to `limit` most recent messages of `room`, oldest first. Deleted messages are skipped.
	async fn recent_messages(&self, room: &RoomId, limit: usize) -> Result<Vec<ChatMessage>, StoreError>;

	/// A live (not deleted) message.
	async fn find_message(&self, message_id: &str) -> Result<Option<ChatMessage>, StoreError>;

	/// Replace the content of a live message. False when there is none.
	async fn edit_message(&self, message_id: &str, content: &str, edited_at: i64) -> Result<bool, StoreError>;

	/// Tombstone a live message. False when there is none.
	async fn delete_message(&self, message_id: &str, deleted_at: i64) -> Result<bool, StoreError>;

	/// Record a reaction. False when this user already reacted with this emoji.
	async fn add_reaction(&self, message_id: &str, user: &UserId, emoji: &str) -> Result<bool, StoreError>;

	/// Record or refresh a read receipt.
	async fn mark_read(&self, message_id: &str, user: &UserId, read_at: i64) -> Result<(), StoreError>;
}

fn new_user_id() -> anyhow::Result<UserId> {
	let raw = uuid::Uuid::new_v4().simple().to_string();
	UserId::new(format!("user_{}", &raw[..12])).map_err(|e| anyhow!("generate user id: {e}"))
}

fn default_rooms() -> anyhow::Result<Vec<RoomRecord>> {
	DEFAULT_ROOMS
		.iter()
		.map(|(id, name)| {
			Ok(RoomRecord {
				room_id: RoomId::new(*id).map_err(|e| anyhow!("default room id: {e}"))?,
				name: name.to_string(),
				created_by: None,
				created_at: 0,
			})
		})
		.collect()
}

/// Process-local store. Everything is lost on restart.
pub struct MemoryStore {
	inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
	users: HashMap<String, UserRecord>,
	rooms: Vec<RoomRecord>,
	messages: HashMap<RoomId, Vec<ChatMessage>>,
	reactions: HashSet<(String, UserId, String)>,
	reads: HashMap<(String, UserId), i64>,
}

impl MemoryInner {
	fn message_mut(&mut self, message_id: &str) -> Option<&mut ChatMessage> {
		self.messages
			.values_mut()
			.flat_map(|history| history.iter_mut())
			.find(|m| m.message_id == message_id)
	}
}

impl MemoryStore {
	/// Per-room cap on retained history.
	const HISTORY_CAP: usize = 500;

	pub fn new() -> Self {
		let inner = MemoryInner {
			rooms: default_rooms().unwrap_or_default(),
			..MemoryInner::default()
		};
		Self {
			inner: Mutex::new(inner),
		}
	}
}

impl Default for MemoryStore {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait::async_trait]
impl Store for MemoryStore {
	async fn create_user(&self, username: &str, email: Option<&str>, password_hash: &str) -> Result<UserRecord, StoreError> {
		let mut inner = self.inner.lock();
		let key = username.to_lowercase();
		if inner.users.contains_key(&key) {
			return Err(StoreError::Duplicate(username.to_string()));
		}

		let record = UserRecord {
			user_id: new_user_id()?,
			username: username.to_string(),
			email: email.map(str::to_string),
			password_hash: password_hash.to_string(),
			created_at: unix_ms_now(),
		};
		inner.users.insert(key, record.clone());
		Ok(record)
	}

	async fn find_user_by_name(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
		Ok(self.inner.lock().users.get(&username.to_lowercase()).cloned())
	}

	async fn create_room(&self, room: &RoomId, name: &str, created_by: Option<&UserId>) -> Result<RoomRecord, StoreError> {
		let mut inner = self.inner.lock();
		if inner.rooms.iter().any(|r| &r.room_id == room) {
			return Err(StoreError::Duplicate(room.to_string()));
		}

		let record = RoomRecord {
			room_id: room.clone(),
			name: name.to_string(),
			created_by: created_by.cloned(),
			created_at: unix_ms_now(),
		};
		inner.rooms.push(record.clone());
		Ok(record)
	}

	async fn list_rooms(&self) -> Result<Vec<RoomRecord>, StoreError> {
		Ok(self.inner.lock().rooms.clone())
	}

	async fn add_message(&self, msg: &ChatMessage) -> Result<(), StoreError> {
		let mut inner = self.inner.lock();
		let history = inner.messages.entry(msg.room_id.clone()).or_default();
		history.push(msg.clone());
		if history.len() > Self::HISTORY_CAP {
			let excess = history.len() - Self::HISTORY_CAP;
			history.drain(..excess);
		}
		Ok(())
	}

	async fn recent_messages(&self, room: &RoomId, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
		let inner = self.inner.lock();
		let Some(history) = inner.messages.get(room) else {
			return Ok(Vec::new());
		};
		let start = history.len().saturating_sub(limit);
		Ok(history[start..].to_vec())
	}

	async fn find_message(&self, message_id: &str) -> Result<Option<ChatMessage>, StoreError> {
		Ok(self.inner.lock().message_mut(message_id).cloned())
	}

	async fn edit_message(&self, message_id: &str, content: &str, edited_at: i64) -> Result<bool, StoreError> {
		let mut inner = self.inner.lock();
		let Some(msg) = inner.message_mut(message_id) else {
			return Ok(false);
		};
		msg.content = content.to_string();
		msg.edited_at = Some(edited_at);
		Ok(true)
	}

	async fn delete_message(&self, message_id: &str, _deleted_at: i64) -> Result<bool, StoreError> {
		let mut inner = self.inner.lock();
		for history in inner.messages.values_mut() {
			if let Some(pos) = history.iter().position(|m| m.message_id == message_id) {
				history.remove(pos);
				return Ok(true);
			}
		}
		Ok(false)
	}

	async fn add_reaction(&self, message_id: &str, user: &UserId, emoji: &str) -> Result<bool, StoreError> {
		let key = (message_id.to_string(), user.clone(), emoji.to_string());
		Ok(self.inner.lock().reactions.insert(key))
	}

	async fn mark_read(&self, message_id: &str, user: &UserId, read_at: i64) -> Result<(), StoreError> {
		self.inner
			.lock()
			.reads
			.insert((message_id.to_string(), user.clone()), read_at);
		Ok(())
	}
}

/// SQL-backed store. The backend is picked from the database URL scheme.
#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

type UserRow = (String, String, Option<String>, String, i64);
type RoomRow = (String, String, Option<String>, i64);
type MessageRow = (
	String,
	String,
	String,
	String,
	String,
	i64,
	Option<String>,
	Option<String>,
	Option<i64>,
);

const MESSAGE_COLUMNS: &str = "message_id, room_id, user_id, username, content, created_at, message_type, metadata, edited_at";

impl SqlStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let backend = if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			SqlBackend::Sqlite(pool)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			SqlBackend::Postgres(pool)
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
			sqlx::migrate!("migrations/mysql")
				.run(&pool)
				.await
				.context("run mysql migrations")?;
			SqlBackend::Mysql(pool)
		} else {
			return Err(anyhow!("unsupported database_url (use sqlite:, postgres:, mysql:)"));
		};

		Ok(Self { backend })
	}
}

fn map_insert_err(err: sqlx::Error, key: &str, what: &'static str) -> StoreError {
	match &err {
		sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate(key.to_string()),
		_ => StoreError::Backend(anyhow!(err).context(what)),
	}
}

fn user_from_row(row: UserRow) -> Result<UserRecord, StoreError> {
	let (user_id, username, email, password_hash, created_at) = row;
	Ok(UserRecord {
		user_id: UserId::new(user_id).map_err(|e| anyhow!("stored user id: {e}"))?,
		username,
		email,
		password_hash,
		created_at,
	})
}

fn room_from_row(row: RoomRow) -> Result<RoomRecord, StoreError> {
	let (room_id, name, created_by, created_at) = row;
	Ok(RoomRecord {
		room_id: RoomId::new(room_id).map_err(|e| anyhow!("stored room id: {e}"))?,
		name,
		created_by: created_by.and_then(|u| UserId::new(u).ok()),
		created_at,
	})
}

fn message_from_row(row: MessageRow) -> Result<ChatMessage, StoreError> {
	let (message_id, room_id, user_id, username, content, timestamp, message_type, metadata, edited_at) = row;
	Ok(ChatMessage {
		message_id,
		room_id: RoomId::new(room_id).map_err(|e| anyhow!("stored room id: {e}"))?,
		user_id: UserId::new(user_id).map_err(|e| anyhow!("stored user id: {e}"))?,
		username,
		content,
		timestamp,
		message_type: message_type.as_deref().map(media_kind_from_name),
		metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
		edited_at,
	})
}

fn media_kind_from_name(name: &str) -> MediaKind {
	match name {
		"voice" => MediaKind::Voice,
		"image" => MediaKind::Image,
		_ => MediaKind::File,
	}
}

#[async_trait::async_trait]
impl Store for SqlStore {
	async fn create_user(&self, username: &str, email: Option<&str>, password_hash: &str) -> Result<UserRecord, StoreError> {
		let record = UserRecord {
			user_id: new_user_id()?,
			username: username.to_string(),
			email: email.map(str::to_string),
			password_hash: password_hash.to_string(),
			created_at: unix_ms_now(),
		};
		let key = username.to_lowercase();

		let result = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query(
				"INSERT INTO users (user_id, username, username_key, email, password_hash, created_at) VALUES (?, ?, ?, ?, ?, ?)",
			)
			.bind(record.user_id.as_str())
			.bind(&record.username)
			.bind(&key)
			.bind(record.email.as_deref())
			.bind(&record.password_hash)
			.bind(record.created_at)
			.execute(pool)
			.await
			.map(|_| ()),
			SqlBackend::Postgres(pool) => sqlx::query(
				"INSERT INTO users (user_id, username, username_key, email, password_hash, created_at) VALUES ($1, $2, $3, $4, $5, $6)",
			)
			.bind(record.user_id.as_str())
			.bind(&record.username)
			.bind(&key)
			.bind(record.email.as_deref())
			.bind(&record.password_hash)
			.bind(record.created_at)
			.execute(pool)
			.await
			.map(|_| ()),
			SqlBackend::Mysql(pool) => sqlx::query(
				"INSERT INTO users (user_id, username, username_key, email, password_hash, created_at) VALUES (?, ?, ?, ?, ?, ?)",
			)
			.bind(record.user_id.as_str())
			.bind(&record.username)
			.bind(&key)
			.bind(record.email.as_deref())
			.bind(&record.password_hash)
			.bind(record.created_at)
			.execute(pool)
			.await
			.map(|_| ()),
		};

		result.map_err(|e| map_insert_err(e, username, "insert user"))?;
		Ok(record)
	}

	async fn find_user_by_name(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
		let key = username.to_lowercase();
		let row: Option<UserRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT user_id, username, email, password_hash, created_at FROM users WHERE username_key = ?",
			)
			.bind(&key)
			.fetch_optional(pool)
			.await
			.context("select user (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT user_id, username, email, password_hash, created_at FROM users WHERE username_key = $1",
			)
			.bind(&key)
			.fetch_optional(pool)
			.await
			.context("select user (postgres)")?,
			SqlBackend::Mysql(pool) => sqlx::query_as(
				"SELECT user_id, username, email, password_hash, created_at FROM users WHERE username_key = ?",
			)
			.bind(&key)
			.fetch_optional(pool)
			.await
			.context("select user (mysql)")?,
		};

		row.map(user_from_row).transpose()
	}

	async fn create_room(&self, room: &RoomId, name: &str, created_by: Option<&UserId>) -> Result<RoomRecord, StoreError> {
		let record = RoomRecord {
			room_id: room.clone(),
			name: name.to_string(),
			created_by: created_by.cloned(),
			created_at: unix_ms_now(),
		};
		let created_by = record.created_by.as_ref().map(UserId::as_str);

		let result = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("INSERT INTO rooms (room_id, name, created_by, created_at) VALUES (?, ?, ?, ?)")
					.bind(room.as_str())
					.bind(name)
					.bind(created_by)
					.bind(record.created_at)
					.execute(pool)
					.await
					.map(|_| ())
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("INSERT INTO rooms (room_id, name, created_by, created_at) VALUES ($1, $2, $3, $4)")
					.bind(room.as_str())
					.bind(name)
					.bind(created_by)
					.bind(record.created_at)
					.execute(pool)
					.await
					.map(|_| ())
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query("INSERT INTO rooms (room_id, name, created_by, created_at) VALUES (?, ?, ?, ?)")
					.bind(room.as_str())
					.bind(name)
					.bind(created_by)
					.bind(record.created_at)
					.execute(pool)
					.await
					.map(|_| ())
			}
		};

		result.map_err(|e| map_insert_err(e, room.as_str(), "insert room"))?;
		Ok(record)
	}

	async fn list_rooms(&self) -> Result<Vec<RoomRecord>, StoreError> {
		const SQL: &str = "SELECT room_id, name, created_by, created_at FROM rooms ORDER BY created_at, room_id";
		let rows: Vec<RoomRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(SQL).fetch_all(pool).await.context("list rooms (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(SQL).fetch_all(pool).await.context("list rooms (postgres)")?,
			SqlBackend::Mysql(pool) => sqlx::query_as(SQL).fetch_all(pool).await.context("list rooms (mysql)")?,
		};

		rows.into_iter().map(room_from_row).collect()
	}

	async fn add_message(&self, msg: &ChatMessage) -> Result<(), StoreError> {
		let message_type = msg.message_type.map(MediaKind::as_str);
		let metadata = msg.metadata.as_ref().map(|m| m.to_string());

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO messages (message_id, room_id, user_id, username, content, created_at, message_type, metadata) \
					VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
				)
				.bind(&msg.message_id)
				.bind(msg.room_id.as_str())
				.bind(msg.user_id.as_str())
				.bind(&msg.username)
				.bind(&msg.content)
				.bind(msg.timestamp)
				.bind(message_type)
				.bind(metadata.as_deref())
				.execute(pool)
				.await
				.context("insert message (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO messages (message_id, room_id, user_id, username, content, created_at, message_type, metadata) \
					VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
				)
				.bind(&msg.message_id)
				.bind(msg.room_id.as_str())
				.bind(msg.user_id.as_str())
				.bind(&msg.username)
				.bind(&msg.content)
				.bind(msg.timestamp)
				.bind(message_type)
				.bind(metadata.as_deref())
				.execute(pool)
				.await
				.context("insert message (postgres)")?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query(
					"INSERT INTO messages (message_id, room_id, user_id, username, content, created_at, message_type, metadata) \
					VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
				)
				.bind(&msg.message_id)
				.bind(msg.room_id.as_str())
				.bind(msg.user_id.as_str())
				.bind(&msg.username)
				.bind(&msg.content)
				.bind(msg.timestamp)
				.bind(message_type)
				.bind(metadata.as_deref())
				.execute(pool)
				.await
				.context("insert message (mysql)")?;
			}
		}

		Ok(())
	}

	async fn recent_messages(&self, room: &RoomId, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
		let limit = i64::try_from(limit).unwrap_or(i64::MAX);
		let mut rows: Vec<MessageRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(&format!(
				"SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id = ? AND deleted_at IS NULL \
				ORDER BY created_at DESC, seq DESC LIMIT ?"
			))
			.bind(room.as_str())
			.bind(limit)
			.fetch_all(pool)
			.await
			.context("select messages (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(&format!(
				"SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id = $1 AND deleted_at IS NULL \
				ORDER BY created_at DESC, seq DESC LIMIT $2"
			))
			.bind(room.as_str())
			.bind(limit)
			.fetch_all(pool)
			.await
			.context("select messages (postgres)")?,
			SqlBackend::Mysql(pool) => sqlx::query_as(&format!(
				"SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id = ? AND deleted_at IS NULL \
				ORDER BY created_at DESC, seq DESC LIMIT ?"
			))
			.bind(room.as_str())
			.bind(limit)
			.fetch_all(pool)
			.await
			.context("select messages (mysql)")?,
		};

		rows.reverse();
		rows.into_iter().map(message_from_row).collect()
	}

	async fn find_message(&self, message_id: &str) -> Result<Option<ChatMessage>, StoreError> {
		let row: Option<MessageRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(&format!(
				"SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = ? AND deleted_at IS NULL"
			))
			.bind(message_id)
			.fetch_optional(pool)
			.await
			.context("select message (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(&format!(
				"SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = $1 AND deleted_at IS NULL"
			))
			.bind(message_id)
			.fetch_optional(pool)
			.await
			.context("select message (postgres)")?,
			SqlBackend::Mysql(pool) => sqlx::query_as(&format!(
				"SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = ? AND deleted_at IS NULL"
			))
			.bind(message_id)
			.fetch_optional(pool)
			.await
			.context("select message (mysql)")?,
		};

		row.map(message_from_row).transpose()
	}

	async fn edit_message(&self, message_id: &str, content: &str, edited_at: i64) -> Result<bool, StoreError> {
		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query(
				"UPDATE messages SET content = ?, edited_at = ? WHERE message_id = ? AND deleted_at IS NULL",
			)
			.bind(content)
			.bind(edited_at)
			.bind(message_id)
			.execute(pool)
			.await
			.context("update message (sqlite)")?
			.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query(
				"UPDATE messages SET content = $1, edited_at = $2 WHERE message_id = $3 AND deleted_at IS NULL",
			)
			.bind(content)
			.bind(edited_at)
			.bind(message_id)
			.execute(pool)
			.await
			.context("update message (postgres)")?
			.rows_affected(),
			SqlBackend::Mysql(pool) => sqlx::query(
				"UPDATE messages SET content = ?, edited_at = ? WHERE message_id = ? AND deleted_at IS NULL",
			)
			.bind(content)
			.bind(edited_at)
			.bind(message_id)
			.execute(pool)
			.await
			.context("update message (mysql)")?
			.rows_affected(),
		};

		Ok(affected > 0)
	}

	async fn delete_message(&self, message_id: &str, deleted_at: i64) -> Result<bool, StoreError> {
		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("UPDATE messages SET deleted_at = ? WHERE message_id = ? AND deleted_at IS NULL")
					.bind(deleted_at)
					.bind(message_id)
					.execute(pool)
					.await
					.context("delete message (sqlite)")?
					.rows_affected()
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("UPDATE messages SET deleted_at = $1 WHERE message_id = $2 AND deleted_at IS NULL")
					.bind(deleted_at)
					.bind(message_id)
					.execute(pool)
					.await
					.context("delete message (postgres)")?
					.rows_affected()
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query("UPDATE messages SET deleted_at = ? WHERE message_id = ? AND deleted_at IS NULL")
					.bind(deleted_at)
					.bind(message_id)
					.execute(pool)
					.await
					.context("delete message (mysql)")?
					.rows_affected()
			}
		};

		Ok(affected > 0)
	}

	async fn add_reaction(&self, message_id: &str, user: &UserId, emoji: &str) -> Result<bool, StoreError> {
		let now = unix_ms_now();
		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query(
				"INSERT OR IGNORE INTO message_reactions (message_id, user_id, emoji, created_at) VALUES (?, ?, ?, ?)",
			)
			.bind(message_id)
			.bind(user.as_str())
			.bind(emoji)
			.bind(now)
			.execute(pool)
			.await
			.context("insert reaction (sqlite)")?
			.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query(
				"INSERT INTO message_reactions (message_id, user_id, emoji, created_at) VALUES ($1, $2, $3, $4) \
				ON CONFLICT DO NOTHING",
			)
			.bind(message_id)
			.bind(user.as_str())
			.bind(emoji)
			.bind(now)
			.execute(pool)
			.await
			.context("insert reaction (postgres)")?
			.rows_affected(),
			SqlBackend::Mysql(pool) => sqlx::query(
				"INSERT IGNORE INTO message_reactions (message_id, user_id, emoji, created_at) VALUES (?, ?, ?, ?)",
			)
			.bind(message_id)
			.bind(user.as_str())
			.bind(emoji)
			.bind(now)
			.execute(pool)
			.await
			.context("insert reaction (mysql)")?
			.rows_affected(),
		};

		Ok(affected > 0)
	}

	async fn mark_read(&self, message_id: &str, user: &UserId, read_at: i64) -> Result<(), StoreError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO message_reads (message_id, user_id, read_at) VALUES (?, ?, ?) \
					ON CONFLICT (message_id, user_id) DO UPDATE SET read_at = excluded.read_at",
				)
				.bind(message_id)
				.bind(user.as_str())
				.bind(read_at)
				.execute(pool)
				.await
				.context("upsert read receipt (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO message_reads (message_id, user_id, read_at) VALUES ($1, $2, $3) \
					ON CONFLICT (message_id, user_id) DO UPDATE SET read_at = EXCLUDED.read_at",
				)
				.bind(message_id)
				.bind(user.as_str())
				.bind(read_at)
				.execute(pool)
				.await
				.context("upsert read receipt (postgres)")?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query(
					"INSERT INTO message_reads (message_id, user_id, read_at) VALUES (?, ?, ?) \
					ON DUPLICATE KEY UPDATE read_at = VALUES(read_at)",
				)
				.bind(message_id)
				.bind(user.as_str())
				.bind(read_at)
				.execute(pool)
				.await
				.context("upsert read receipt (mysql)")?;
			}
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn message(room: &str, n: i64) -> ChatMessage {
		ChatMessage {
			message_id: format!("msg_{n}"),
			room_id: RoomId::new(room).expect("room"),
			user_id: UserId::new("user_1").expect("user"),
			username: "alice".to_string(),
			content: format!("line {n}"),
			timestamp: 1_000 + n,
			message_type: (n % 2 == 0).then_some(MediaKind::Image),
			metadata: (n % 2 == 0).then(|| serde_json::json!({ "fileId": format!("file_{n}") })),
			edited_at: None,
		}
	}

	async fn exercise(store: &dyn Store) {
		let user = store.create_user("Alice", Some("a@example.com"), "v1$hash").await.expect("create user");
		assert!(user.user_id.as_str().starts_with("user_"));
		match store.create_user("ALICE", None, "v1$other").await {
			Err(StoreError::Duplicate(_)) => {}
			other => panic!("expected Duplicate, got: {other:?}"),
		}
		let found = store.find_user_by_name("alice").await.expect("find").expect("present");
		assert_eq!(found, user);
		assert!(store.find_user_by_name("nobody").await.expect("find").is_none());

		let rooms = store.list_rooms().await.expect("rooms");
		assert!(rooms.iter().any(|r| r.room_id.as_str() == "global"));
		assert!(rooms.iter().any(|r| r.room_id.as_str() == "lobby"));
		let dev = RoomId::new("dev").expect("room");
		store.create_room(&dev, "Dev", Some(&user.user_id)).await.expect("create room");
		assert!(matches!(
			store.create_room(&dev, "Dev again", None).await,
			Err(StoreError::Duplicate(_))
		));

		for n in 0..5 {
			store.add_message(&message("dev", n)).await.expect("add");
		}
		store.add_message(&message("lobby", 99)).await.expect("add");

		let recent = store.recent_messages(&dev, 3).await.expect("recent");
		let ids = recent.iter().map(|m| m.message_id.as_str()).collect::<Vec<_>>();
		assert_eq!(ids, vec!["msg_2", "msg_3", "msg_4"], "newest three, oldest first");
		assert_eq!(recent[0].message_type, Some(MediaKind::Image));
		assert_eq!(recent[0].metadata, Some(serde_json::json!({ "fileId": "file_2" })));
		assert_eq!(recent[1].message_type, None);

		assert!(store.edit_message("msg_3", "fixed", 5_000).await.expect("edit"));
		let edited = store.find_message("msg_3").await.expect("find").expect("present");
		assert_eq!(edited.content, "fixed");
		assert_eq!(edited.edited_at, Some(5_000));
		assert!(!store.edit_message("msg_missing", "x", 5_000).await.expect("edit"));

		assert!(store.delete_message("msg_4", 6_000).await.expect("delete"));
		assert!(!store.delete_message("msg_4", 6_001).await.expect("delete twice"));
		assert!(store.find_message("msg_4").await.expect("find").is_none());
		assert!(!store.edit_message("msg_4", "too late", 7_000).await.expect("edit deleted"));
		let recent = store.recent_messages(&dev, 10).await.expect("recent");
		let ids = recent.iter().map(|m| m.message_id.as_str()).collect::<Vec<_>>();
		assert_eq!(ids, vec!["msg_0", "msg_1", "msg_2", "msg_3"], "deleted messages are not replayed");
		assert_eq!(recent[3].content, "fixed");

		assert!(store.add_reaction("msg_3", &user.user_id, "👍").await.expect("react"));
		assert!(!store.add_reaction("msg_3", &user.user_id, "👍").await.expect("react again"));
		assert!(store.add_reaction("msg_3", &user.user_id, "🎉").await.expect("other emoji"));

		store.mark_read("msg_3", &user.user_id, 8_000).await.expect("read");
		store.mark_read("msg_3", &user.user_id, 9_000).await.expect("read again");
	}

	#[tokio::test]
	async fn memory_store_contract() {
		exercise(&MemoryStore::new()).await;
	}

	#[tokio::test]
	async fn sqlite_store_contract() {
		let dir = tempfile::tempdir().expect("tempdir");
		let url = format!("sqlite://{}?mode=rwc", dir.path().join("parley.db").display());
		let store = SqlStore::connect(&url).await.expect("connect sqlite");
		exercise(&store).await;
	}

	#[tokio::test]
	async fn unknown_database_scheme_is_rejected() {
		assert!(SqlStore::connect("redis://localhost").await.is_err());
	}

	#[tokio::test]
	async fn memory_history_is_capped() {
		let store = MemoryStore::new();
		for n in 0..(MemoryStore::HISTORY_CAP as i64 + 10) {
			store.add_message(&message("lobby", n)).await.expect("add");
		}
		let lobby = RoomId::new("lobby").expect("room");
		let all = store.recent_messages(&lobby, usize::MAX).await.expect("recent");
		assert_eq!(all.len(), MemoryStore::HISTORY_CAP);
		assert_eq!(all[0].message_id, "msg_10");
	}
}
