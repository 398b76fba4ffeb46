#![forbid(unsafe_code)]

use std::sync::Arc;

use parley_protocol::version::PROTOCOL_VERSION_U32;
use parley_protocol::{ClientEvent, DecodeError, ServerEvent, decode_client_event};
use tracing::{debug, info, warn};

use crate::server::context::ServerContext;
use crate::server::error::{ErrorKind, HandlerError};
use crate::server::handlers;
use crate::server::outbox::{Outbox, publish_event};
use crate::server::registry::{Connection, ConnectionHandle};
use crate::util::time::unix_ms_now;

/// Routes decoded client events to handlers and turns failures into error frames.
#[derive(Clone)]
pub struct Dispatcher {
	ctx: Arc<ServerContext>,
}

impl Dispatcher {
	pub fn new(ctx: Arc<ServerContext>) -> Self {
		Self { ctx }
	}

	pub fn context(&self) -> &Arc<ServerContext> {
		&self.ctx
	}

	/// Register a fresh connection and greet it.
	pub fn open(&self, handle: ConnectionHandle, outbox: Outbox) -> Connection {
		let conn = self.ctx.registry.register(handle, outbox);
		conn.outbox.send(&ServerEvent::Welcome {
			session_id: conn.session_id.to_string(),
			server_time: unix_ms_now(),
			max_frame_bytes: self.ctx.max_frame_bytes as u64,
			protocol_version: PROTOCOL_VERSION_U32,
		});
		conn
	}

	/// Handle one inbound text frame. Never fails; errors are reported to the sender.
	pub async fn dispatch(&self, handle: ConnectionHandle, text: &str) {
		let Some(conn) = self.ctx.registry.get(handle) else {
			debug!(%handle, "dispatch for unknown connection ignored");
			return;
		};

		let event = match decode_client_event(text) {
			Ok(event) => event,
			// Known but private type: the gate wins over field validation.
			Err(DecodeError::InvalidFields { kind, .. })
				if !conn.authenticated && !ClientEvent::is_public_kind(&kind) =>
			{
				self.report(&conn, HandlerError::Unauthenticated, Some(&kind), None);
				return;
			}
			Err(e) => {
				let request_type = match &e {
					DecodeError::Unrecognized(kind) => Some(kind.clone()),
					DecodeError::InvalidFields { kind, .. } => Some(kind.clone()),
					_ => None,
				};
				self.report(&conn, HandlerError::from(e), request_type.as_deref(), None);
				return;
			}
		};

		let kind = event.kind();
		metrics::counter!("parley_server_events_in_total", "type" => kind).increment(1);

		if !conn.authenticated && !event.is_public() {
			self.report(&conn, HandlerError::Unauthenticated, Some(kind), None);
			return;
		}

		let upload_id = upload_id_of(&event);
		if let Err(e) = handlers::handle(&self.ctx, &conn, event).await {
			self.report(&conn, e, Some(kind), upload_id.as_deref());
		}
	}

	/// Report a failure that happened outside a handler, such as a rate limit hit.
	pub fn reject(&self, handle: ConnectionHandle, err: HandlerError) {
		if let Some(conn) = self.ctx.registry.get(handle) {
			self.report(&conn, err, None, None);
		}
	}

	fn report(&self, conn: &Connection, err: HandlerError, request_type: Option<&str>, upload_id: Option<&str>) {
		let kind = err.kind();
		metrics::counter!("parley_server_dispatch_errors_total", "code" => kind.code()).increment(1);
		if kind == ErrorKind::Internal {
			warn!(handle = %conn.handle, request_type, error = %err, "handler failed");
		} else {
			debug!(handle = %conn.handle, request_type, error = %err, "request rejected");
		}

		let is_upload = request_type.is_some_and(|t| t.starts_with("upload_"));
		let event = match (&err, is_upload) {
			(HandlerError::Upload(upload_err), true) => ServerEvent::UploadError {
				upload_id: upload_id.map(str::to_string),
				code: kind.code().to_string(),
				message: err.client_message(),
				recoverable: upload_err.recoverable(),
			},
			(_, true) => ServerEvent::UploadError {
				upload_id: upload_id.map(str::to_string),
				code: kind.code().to_string(),
				message: err.client_message(),
				recoverable: false,
			},
			_ => ServerEvent::Error {
				code: kind.code().to_string(),
				message: err.client_message(),
				request_type: request_type.map(str::to_string),
			},
		};
		conn.outbox.send(&event);
	}

	/// Tear down a connection. On the user's last connection this also ends their calls,
	/// cancels their uploads and announces them offline.
	pub async fn close(&self, handle: ConnectionHandle) {
		let Some(conn) = self.ctx.registry.remove(handle) else {
			return;
		};
		let Some(user) = conn.user_id.as_ref() else {
			debug!(%handle, "anonymous connection closed");
			return;
		};
		if self.ctx.registry.is_online(user) {
			debug!(%handle, user_id = %user, "connection closed; user still online elsewhere");
			return;
		}

		let calls = self.ctx.calls.force_end_for_user(user, "disconnected");
		let uploads = self.ctx.uploads.cancel_for_owner(user).await;
		publish_event(
			&self.ctx.broker,
			parley_domain::Topic::PRESENCE,
			&ServerEvent::PresenceUpdate {
				user_id: user.clone(),
				username: conn.display_name.clone(),
				status: "offline".to_string(),
			},
			None,
		);

		info!(
			%handle,
			user_id = %user,
			calls_ended = calls.len(),
			uploads_cancelled = uploads,
			"user went offline"
		);
	}
}

fn upload_id_of(event: &ClientEvent) -> Option<String> {
	match event {
		ClientEvent::UploadInit { upload_id, .. } => upload_id.clone(),
		ClientEvent::UploadChunk { upload_id, .. } | ClientEvent::UploadFinalize { upload_id } => {
			Some(upload_id.clone())
		}
		_ => None,
	}
}
