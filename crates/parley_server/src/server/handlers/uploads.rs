#![forbid(unsafe_code)]

use parley_domain::MediaKind;
use parley_protocol::ServerEvent;
use tracing::warn;

use super::identity;
use crate::server::context::ServerContext;
use crate::server::error::HandlerError;
use crate::server::registry::Connection;
use crate::server::uploads::UploadMeta;

pub(super) async fn init(ctx: &ServerContext, conn: &Connection, meta: UploadMeta) -> Result<(), HandlerError> {
	let (user, _) = identity(conn)?;
	let ticket = ctx.uploads.init_upload(user, meta).await?;
	conn.outbox.send(&ServerEvent::UploadReady {
		upload_id: ticket.upload_id,
		chunk_size: ticket.chunk_size,
		total_chunks: ticket.total_chunks,
	});
	Ok(())
}

pub(super) async fn chunk(
	ctx: &ServerContext,
	conn: &Connection,
	upload_id: &str,
	index: u64,
	data: &str,
	declared_total: Option<u64>,
) -> Result<(), HandlerError> {
	let (user, _) = identity(conn)?;
	let progress = ctx
		.uploads
		.receive_chunk(upload_id, index, data, declared_total, user)
		.await?;
	conn.outbox.send(&ServerEvent::UploadProgress {
		upload_id: progress.upload_id,
		chunks_received: progress.chunks_received,
		total_chunks: progress.total_chunks,
		progress: progress.progress,
	});
	Ok(())
}

pub(super) async fn finalize(ctx: &ServerContext, conn: &Connection, upload_id: &str) -> Result<(), HandlerError> {
	let (user, name) = identity(conn)?;
	let stored = ctx.uploads.finalize(upload_id, user, name).await?;

	if let Some(msg) = &stored.announcement
		&& let Err(e) = ctx.store.add_message(msg).await
	{
		warn!(upload_id, error = %e, "failed to persist upload announcement");
	}

	conn.outbox.send(&ServerEvent::UploadComplete {
		upload_id: stored.upload_id,
		file_id: stored.file_id,
		file_url: stored.url,
		file_name: stored.file_name,
		file_size: stored.file_size,
		mime_type: stored.mime_type,
		is_voice: stored.kind == MediaKind::Voice,
	});
	Ok(())
}
