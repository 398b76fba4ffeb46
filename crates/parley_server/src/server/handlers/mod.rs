#![forbid(unsafe_code)]

mod assistant;
mod auth;
mod calls;
mod chat;
mod messages;
mod presence;
mod rooms;
mod uploads;

use parley_domain::UserId;
use parley_protocol::{ClientEvent, ServerEvent};

use crate::server::context::ServerContext;
use crate::server::error::HandlerError;
use crate::server::registry::Connection;
use crate::util::time::unix_ms_now;

/// Run the handler for `event` on behalf of `conn`.
pub(crate) async fn handle(ctx: &ServerContext, conn: &Connection, event: ClientEvent) -> Result<(), HandlerError> {
	match event {
		ClientEvent::Register {
			username,
			password,
			email,
		} => auth::register(ctx, conn, &username, &password, email.as_deref()).await,
		ClientEvent::Login { username, password } => auth::login(ctx, conn, &username, &password).await,
		ClientEvent::Auth { token } => auth::resume(ctx, conn, &token),
		ClientEvent::Ping {} => {
			conn.outbox.send(&ServerEvent::Pong {
				timestamp: unix_ms_now(),
			});
			Ok(())
		}

		ClientEvent::Chat {
			room_id,
			content,
			metadata,
		} => chat::send(ctx, conn, room_id, content, metadata).await,
		ClientEvent::EditMessage {
			message_id,
			new_content,
		} => messages::edit(ctx, conn, &message_id, new_content).await,
		ClientEvent::DeleteMessage { message_id } => messages::delete(ctx, conn, &message_id).await,
		ClientEvent::AddReaction { message_id, emoji } => messages::react(ctx, conn, &message_id, &emoji).await,
		ClientEvent::MarkRead { message_id } => messages::mark_read(ctx, conn, &message_id).await,
		ClientEvent::Typing { room_id, is_typing } => chat::typing(ctx, conn, room_id, is_typing),
		ClientEvent::JoinRoom { room_id } => rooms::join(ctx, conn, room_id).await,
		ClientEvent::LeaveRoom { room_id } => rooms::leave(ctx, conn, room_id),
		ClientEvent::CreateRoom { room_id, name } => rooms::create(ctx, conn, room_id, &name).await,
		ClientEvent::GetRooms {} => rooms::list(ctx, conn).await,
		ClientEvent::GetOnlineUsers {} => presence::online_users(ctx, conn),
		ClientEvent::PresenceUpdate { status } => presence::update(ctx, conn, &status),

		ClientEvent::CallInit { target_id, call_type } => calls::init(ctx, conn, &target_id, call_type),
		ClientEvent::CallAccept { call_id } => calls::accept(ctx, conn, &call_id),
		ClientEvent::CallReject { call_id, reason } => calls::reject(ctx, conn, &call_id, reason.as_deref()),
		ClientEvent::CallEnd { call_id } => calls::end(ctx, conn, &call_id),
		ClientEvent::CallStatus { call_id } => calls::status(ctx, conn, &call_id),
		ClientEvent::WebrtcOffer {
			call_id,
			target_id,
			sdp,
		} => Ok(ctx.calls.send_offer(&call_id, identity(conn)?.0, &target_id, sdp)?),
		ClientEvent::WebrtcAnswer {
			call_id,
			target_id,
			sdp,
		} => Ok(ctx.calls.send_answer(&call_id, identity(conn)?.0, &target_id, sdp)?),
		ClientEvent::WebrtcIce {
			call_id,
			target_id,
			candidate,
		} => Ok(ctx
			.calls
			.send_ice_candidate(&call_id, identity(conn)?.0, &target_id, candidate)?),
		ClientEvent::MediaMute { call_id, muted } => calls::mute(ctx, conn, &call_id, muted),
		ClientEvent::MediaVideo { call_id, video } => calls::video(ctx, conn, &call_id, video),
		ClientEvent::MediaScreen { call_id, sharing } => calls::screen(ctx, conn, &call_id, sharing),
		ClientEvent::ScreenShareStart { call_id } => calls::share_screen(ctx, conn, &call_id, true),
		ClientEvent::ScreenShareStop { call_id } => calls::share_screen(ctx, conn, &call_id, false),

		ClientEvent::UploadInit {
			upload_id,
			file_name,
			file_size,
			mime_type,
			chunk_size,
			total_chunks,
			room_id,
		} => {
			let meta = crate::server::uploads::UploadMeta {
				upload_id,
				file_name,
				file_size,
				mime_type,
				chunk_size,
				total_chunks,
				room: room_id.or_else(|| conn.room.clone()),
			};
			uploads::init(ctx, conn, meta).await
		}
		ClientEvent::UploadChunk {
			upload_id,
			chunk_index,
			chunk_data,
			total_chunks,
		} => uploads::chunk(ctx, conn, &upload_id, chunk_index, &chunk_data, total_chunks).await,
		ClientEvent::UploadFinalize { upload_id } => uploads::finalize(ctx, conn, &upload_id).await,

		ClientEvent::AiRequest { message } => assistant::request(ctx, conn, message),
	}
}

/// Authenticated identity of the sender.
fn identity(conn: &Connection) -> Result<(&UserId, &str), HandlerError> {
	match (&conn.user_id, conn.authenticated) {
		(Some(user), true) => Ok((user, conn.display_name.as_str())),
		_ => Err(HandlerError::Unauthenticated),
	}
}
