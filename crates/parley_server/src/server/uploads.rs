#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use parley_domain::{MediaKind, RoomId, UserId};
use parley_protocol::{ChatMessage, ServerEvent};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::UploadSettings;
use crate::server::broker::Broker;
use crate::server::outbox::encode;
use crate::util::time::unix_ms_now;

const MAX_UPLOAD_ID_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum UploadError {
	#[error("upload not found: {0}")]
	NotFound(String),

	#[error("upload belongs to another user")]
	Unauthorized,

	#[error("{0}")]
	Validation(String),

	/// Chunk-level validation failure; the upload can still be completed.
	#[error("{0}")]
	InvalidChunk(String),

	#[error("{0}")]
	InvalidState(String),

	#[error("missing chunks: {received}/{total}")]
	Incomplete {
		received: u64,
		total: u64,
	},

	#[error("upload id already in use: {0}")]
	Conflict(String),

	#[error("{0}")]
	ResourceExhausted(String),

	#[error("storage error: {0}")]
	Io(#[from] std::io::Error),
}

impl UploadError {
	/// Whether the client may keep using the same upload id.
	pub fn recoverable(&self) -> bool {
		matches!(self, UploadError::Incomplete { .. } | UploadError::InvalidChunk(_))
	}
}

/// Client-declared upload parameters.
#[derive(Debug, Clone, Default)]
pub struct UploadMeta {
	pub upload_id: Option<String>,
	pub file_name: Option<String>,
	pub file_size: u64,
	pub mime_type: Option<String>,
	pub chunk_size: Option<u64>,
	pub total_chunks: Option<u64>,
	pub room: Option<RoomId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTicket {
	pub upload_id: String,
	pub chunk_size: u64,
	pub total_chunks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadProgress {
	pub upload_id: String,
	pub chunks_received: u64,
	pub total_chunks: u64,
	pub progress: u32,
}

/// A finalized upload.
#[derive(Debug, Clone)]
pub struct StoredFile {
	pub upload_id: String,
	pub file_id: String,
	pub file_name: String,
	pub file_size: u64,
	pub mime_type: String,
	pub url: String,
	pub kind: MediaKind,
	pub owner: UserId,
	pub room: Option<RoomId>,
	pub path: PathBuf,
	/// The chat line announced to the room, if the upload targeted one.
	pub announcement: Option<ChatMessage>,
}

#[derive(Debug)]
struct UploadSession {
	upload_id: String,
	file_name: String,
	mime_type: String,
	chunk_size: u64,
	total_chunks: u64,
	/// Chunk index -> decoded byte length.
	received: BTreeMap<u64, u64>,
	dir: PathBuf,
	owner: UserId,
	room: Option<RoomId>,
	created_at: Instant,
	finalizing: bool,
	/// Chunk writes between the admission check and the `received` update.
	writers: u32,
}

impl UploadSession {
	fn progress(&self) -> UploadProgress {
		let received = self.received.len() as u64;
		UploadProgress {
			upload_id: self.upload_id.clone(),
			chunks_received: received,
			total_chunks: self.total_chunks,
			progress: (received.saturating_mul(100) / self.total_chunks.max(1)) as u32,
		}
	}

	fn received_bytes(&self) -> u64 {
		self.received.values().sum()
	}
}

#[derive(Default)]
struct UploadTable {
	sessions: HashMap<String, UploadSession>,
	by_owner: HashMap<UserId, HashSet<String>>,
}

impl UploadTable {
	fn session_for(&mut self, upload_id: &str, owner: &UserId) -> Result<&mut UploadSession, UploadError> {
		let session = self
			.sessions
			.get_mut(upload_id)
			.ok_or_else(|| UploadError::NotFound(upload_id.to_string()))?;
		if &session.owner != owner {
			return Err(UploadError::Unauthorized);
		}
		Ok(session)
	}

	fn remove(&mut self, upload_id: &str) -> Option<UploadSession> {
		let session = self.sessions.remove(upload_id)?;
		if let Some(ids) = self.by_owner.get_mut(&session.owner) {
			ids.remove(upload_id);
			if ids.is_empty() {
				self.by_owner.remove(&session.owner);
			}
		}
		Some(session)
	}
}

/// Chunked upload sessions backed by a scratch directory per upload.
///
/// The table lock is never held across file I/O.
pub struct UploadManager {
	broker: Arc<Broker>,
	settings: UploadSettings,
	inner: Mutex<UploadTable>,
}

impl UploadManager {
	pub fn new(broker: Arc<Broker>, settings: UploadSettings) -> Self {
		Self {
			broker,
			settings,
			inner: Mutex::new(UploadTable::default()),
		}
	}

	pub fn settings(&self) -> &UploadSettings {
		&self.settings
	}

	pub async fn init_upload(&self, owner: &UserId, meta: UploadMeta) -> Result<UploadTicket, UploadError> {
		let upload_id = match meta.upload_id.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
			Some(id) => {
				validate_upload_id(&id)?;
				id
			}
			None => format!("upload_{}", uuid::Uuid::new_v4().simple()),
		};

		if meta.file_size > self.settings.max_file_bytes {
			return Err(UploadError::ResourceExhausted(format!(
				"file size {} exceeds limit of {} bytes",
				meta.file_size, self.settings.max_file_bytes
			)));
		}

		let chunk_size = match meta.chunk_size {
			Some(0) => return Err(UploadError::Validation("chunkSize must be positive".to_string())),
			Some(size) => size,
			None => self.settings.default_chunk_size,
		};
		let total_chunks = match meta.total_chunks {
			Some(0) => return Err(UploadError::Validation("totalChunks must be positive".to_string())),
			Some(total) => total,
			None => meta.file_size.div_ceil(chunk_size).max(1),
		};
		if total_chunks > self.settings.max_chunks {
			return Err(UploadError::ResourceExhausted(format!(
				"{total_chunks} chunks exceeds limit of {}",
				self.settings.max_chunks
			)));
		}

		let file_name = meta
			.file_name
			.map(|s| s.trim().to_string())
			.filter(|s| !s.is_empty())
			.unwrap_or_else(|| "unknown".to_string());
		let mime_type = meta
			.mime_type
			.map(|s| s.trim().to_string())
			.filter(|s| !s.is_empty())
			.unwrap_or_else(|| "application/octet-stream".to_string());
		let dir = self.settings.scratch_dir.join(&upload_id);

		{
			let mut table = self.inner.lock();
			if table.sessions.contains_key(&upload_id) {
				return Err(UploadError::Conflict(upload_id));
			}
			table.sessions.insert(
				upload_id.clone(),
				UploadSession {
					upload_id: upload_id.clone(),
					file_name: file_name.clone(),
					mime_type,
					chunk_size,
					total_chunks,
					received: BTreeMap::new(),
					dir: dir.clone(),
					owner: owner.clone(),
					room: meta.room,
					created_at: Instant::now(),
					finalizing: false,
					writers: 0,
				},
			);
			table.by_owner.entry(owner.clone()).or_default().insert(upload_id.clone());
		}

		if let Err(e) = tokio::fs::create_dir_all(&dir).await {
			self.inner.lock().remove(&upload_id);
			return Err(e.into());
		}

		info!(
			upload_id = %upload_id,
			owner = %owner,
			file_name = %file_name,
			file_size = meta.file_size,
			total_chunks,
			"upload session created"
		);

		Ok(UploadTicket {
			upload_id,
			chunk_size,
			total_chunks,
		})
	}

	/// Store one base64 chunk. Re-sending an index overwrites it and counts once.
	pub async fn receive_chunk(
		&self,
		upload_id: &str,
		index: u64,
		data_b64: &str,
		declared_total: Option<u64>,
		owner: &UserId,
	) -> Result<UploadProgress, UploadError> {
		let (dir, chunk_size) = {
			let mut table = self.inner.lock();
			let session = table.session_for(upload_id, owner)?;
			check_chunk(session, index, declared_total)?;
			(session.dir.clone(), session.chunk_size)
		};

		let bytes = STANDARD
			.decode(data_b64.trim())
			.map_err(|e| UploadError::InvalidChunk(format!("chunk data is not valid base64: {e}")))?;
		let len = bytes.len() as u64;
		if len > chunk_size {
			return Err(UploadError::InvalidChunk(format!(
				"chunk of {len} bytes exceeds chunk size {chunk_size}"
			)));
		}

		// Admission: finalize refuses to run while this write is registered.
		let write = {
			let mut table = self.inner.lock();
			let session = table.session_for(upload_id, owner)?;
			check_chunk(session, index, declared_total)?;
			let already = session.received_bytes() - session.received.get(&index).copied().unwrap_or(0);
			if len > self.settings.max_file_bytes.saturating_sub(already) {
				return Err(UploadError::ResourceExhausted(format!(
					"upload exceeds limit of {} bytes",
					self.settings.max_file_bytes
				)));
			}
			session.writers += 1;
			ChunkWrite {
				table: &self.inner,
				upload_id,
				armed: true,
			}
		};

		// Each writer gets its own temp file; the rename makes the chunk appear whole.
		let path = dir.join(format!("chunk_{index}"));
		let part = dir.join(format!("chunk_{index}.{}.part", uuid::Uuid::new_v4().simple()));
		if let Err(e) = write_chunk(&part, &path, &bytes).await {
			let _ = tokio::fs::remove_file(&part).await;
			return Err(e.into());
		}

		let progress = write.commit(|session| {
			if &session.owner != owner {
				return Err(UploadError::Unauthorized);
			}
			session.received.insert(index, len);
			Ok(session.progress())
		})?;

		debug!(
			upload_id,
			index,
			received = progress.chunks_received,
			total = progress.total_chunks,
			"upload chunk stored"
		);
		Ok(progress)
	}

	/// Assemble all chunks into the storage directory and announce the file to the target room.
	pub async fn finalize(&self, upload_id: &str, owner: &UserId, owner_name: &str) -> Result<StoredFile, UploadError> {
		let (dir, file_name, mime_type, total, room) = {
			let mut table = self.inner.lock();
			let session = table.session_for(upload_id, owner)?;
			if session.finalizing {
				return Err(UploadError::InvalidState("upload is already being finalized".to_string()));
			}
			if session.writers > 0 {
				return Err(UploadError::InvalidState(format!(
					"{} chunk write(s) still in progress",
					session.writers
				)));
			}
			let received = session.received.len() as u64;
			if received < session.total_chunks {
				return Err(UploadError::Incomplete {
					received,
					total: session.total_chunks,
				});
			}
			session.finalizing = true;
			(
				session.dir.clone(),
				session.file_name.clone(),
				session.mime_type.clone(),
				session.total_chunks,
				session.room.clone(),
			)
		};

		let file_id = format!("file_{}", uuid::Uuid::new_v4().simple());
		let stored_name = format!("{file_id}{}", extension_of(&file_name));
		let out_path = self.settings.storage_dir.join(&stored_name);

		let file_size = match assemble(&dir, total, &self.settings.storage_dir, &out_path).await {
			Ok(size) => size,
			Err(e) => {
				warn!(upload_id, error = %e, "upload assembly failed; discarding session");
				let _ = tokio::fs::remove_file(&out_path).await;
				remove_scratch(&dir).await;
				self.inner.lock().remove(upload_id);
				metrics::counter!("parley_server_uploads_failed_total").increment(1);
				return Err(e.into());
			}
		};

		remove_scratch(&dir).await;
		self.inner.lock().remove(upload_id);

		let kind = MediaKind::from_mime(&mime_type);
		let url = format!("{}/uploads/{stored_name}", self.settings.public_base_url);

		let announcement = room.as_ref().map(|room| ChatMessage {
			message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
			room_id: room.clone(),
			user_id: owner.clone(),
			username: owner_name.to_string(),
			content: match kind {
				MediaKind::Voice => "Voice message".to_string(),
				_ => format!("Shared {file_name}"),
			},
			timestamp: unix_ms_now(),
			message_type: Some(kind),
			metadata: Some(serde_json::json!({
				"type": kind.as_str(),
				"fileId": file_id,
				"fileName": file_name,
				"url": url,
				"fileSize": file_size,
				"mimeType": mime_type,
			})),
			edited_at: None,
		});

		if let Some(msg) = &announcement
			&& let Some(payload) = encode(&ServerEvent::Chat(msg.clone()))
		{
			self.broker.publish_to_room(&msg.room_id, payload, None);
		}

		metrics::counter!("parley_server_uploads_completed_total").increment(1);
		info!(upload_id, file_id = %file_id, file_size, kind = %kind, "upload finalized");

		Ok(StoredFile {
			upload_id: upload_id.to_string(),
			file_id,
			file_name,
			file_size,
			mime_type,
			url,
			kind,
			owner: owner.clone(),
			room,
			path: out_path,
			announcement,
		})
	}

	/// Drop every unfinished upload owned by `owner`. Returns how many were removed.
	pub async fn cancel_for_owner(&self, owner: &UserId) -> usize {
		let removed = {
			let mut table = self.inner.lock();
			let ids = table
				.by_owner
				.get(owner)
				.map(|ids| {
					ids.iter()
						.filter(|id| table.sessions.get(*id).is_some_and(|s| !s.finalizing))
						.cloned()
						.collect::<Vec<_>>()
				})
				.unwrap_or_default();
			ids.iter().filter_map(|id| table.remove(id)).collect::<Vec<_>>()
		};

		for session in &removed {
			remove_scratch(&session.dir).await;
		}
		if !removed.is_empty() {
			info!(owner = %owner, count = removed.len(), "cancelled uploads for owner");
		}
		removed.len()
	}

	/// Drop unfinished uploads older than `max_age`. Returns their ids.
	pub async fn reap_expired(&self, max_age: Duration) -> Vec<String> {
		let removed = {
			let mut table = self.inner.lock();
			let stale = table
				.sessions
				.values()
				.filter(|s| !s.finalizing && s.writers == 0 && s.created_at.elapsed() >= max_age)
				.map(|s| s.upload_id.clone())
				.collect::<Vec<_>>();
			stale.iter().filter_map(|id| table.remove(id)).collect::<Vec<_>>()
		};

		for session in &removed {
			remove_scratch(&session.dir).await;
		}
		if !removed.is_empty() {
			metrics::counter!("parley_server_uploads_reaped_total").increment(removed.len() as u64);
			info!(count = removed.len(), "reaped expired uploads");
		}
		removed.into_iter().map(|s| s.upload_id).collect()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().sessions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// Registered in-flight chunk write. Dropping it unregisters without recording the chunk.
struct ChunkWrite<'a> {
	table: &'a Mutex<UploadTable>,
	upload_id: &'a str,
	armed: bool,
}

impl ChunkWrite<'_> {
	/// Unregister and update the session under the same lock acquisition.
	fn commit<T>(
		mut self,
		apply: impl FnOnce(&mut UploadSession) -> Result<T, UploadError>,
	) -> Result<T, UploadError> {
		self.armed = false;
		let mut table = self.table.lock();
		let session = table
			.sessions
			.get_mut(self.upload_id)
			.ok_or_else(|| UploadError::NotFound(self.upload_id.to_string()))?;
		session.writers = session.writers.saturating_sub(1);
		apply(session)
	}
}

impl Drop for ChunkWrite<'_> {
	fn drop(&mut self) {
		if !self.armed {
			return;
		}
		if let Some(session) = self.table.lock().sessions.get_mut(self.upload_id) {
			session.writers = session.writers.saturating_sub(1);
		}
	}
}

fn check_chunk(session: &UploadSession, index: u64, declared_total: Option<u64>) -> Result<(), UploadError> {
	if session.finalizing {
		return Err(UploadError::InvalidState("upload is being finalized".to_string()));
	}
	if index >= session.total_chunks {
		return Err(UploadError::InvalidChunk(format!(
			"chunk index {index} out of range (total {})",
			session.total_chunks
		)));
	}
	if let Some(total) = declared_total
		&& total != session.total_chunks
	{
		return Err(UploadError::InvalidChunk(format!(
			"totalChunks {total} does not match session ({})",
			session.total_chunks
		)));
	}
	Ok(())
}

async fn write_chunk(part: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
	tokio::fs::write(part, bytes).await?;
	tokio::fs::rename(part, path).await
}

fn validate_upload_id(id: &str) -> Result<(), UploadError> {
	let valid = id.len() <= MAX_UPLOAD_ID_LEN && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
	if !valid {
		return Err(UploadError::Validation(format!(
			"uploadId must match [A-Za-z0-9_-]{{1,{MAX_UPLOAD_ID_LEN}}}"
		)));
	}
	Ok(())
}

/// `.ext` of a client file name, lowercased; empty when absent or suspicious.
fn extension_of(file_name: &str) -> String {
	Path::new(file_name)
		.extension()
		.and_then(|e| e.to_str())
		.filter(|e| !e.is_empty() && e.len() <= 16 && e.chars().all(|c| c.is_ascii_alphanumeric()))
		.map(|e| format!(".{}", e.to_ascii_lowercase()))
		.unwrap_or_default()
}

async fn assemble(dir: &Path, total: u64, storage_dir: &Path, out_path: &Path) -> std::io::Result<u64> {
	tokio::fs::create_dir_all(storage_dir).await?;
	let mut out = tokio::fs::File::create(out_path).await?;

	let mut written = 0u64;
	for index in 0..total {
		let chunk = tokio::fs::read(dir.join(format!("chunk_{index}"))).await?;
		out.write_all(&chunk).await?;
		written += chunk.len() as u64;
	}
	out.flush().await?;
	Ok(written)
}

async fn remove_scratch(dir: &Path) {
	match tokio::fs::remove_dir_all(dir).await {
		Ok(()) => {}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
		Err(e) => warn!(dir = %dir.display(), error = %e, "failed to remove upload scratch dir"),
	}
}
