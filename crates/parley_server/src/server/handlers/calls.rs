#![forbid(unsafe_code)]

use parley_domain::{CallKind, UserId};
use parley_protocol::ServerEvent;

use super::identity;
use crate::server::calls::CallError;
use crate::server::context::ServerContext;
use crate::server::error::HandlerError;
use crate::server::registry::Connection;

pub(super) fn init(ctx: &ServerContext, conn: &Connection, target: &UserId, kind: CallKind) -> Result<(), HandlerError> {
	let (user, name) = identity(conn)?;
	if user != target && !ctx.registry.is_online(target) {
		return Err(HandlerError::NotFound(format!("user {target} is not online")));
	}

	let call_id = ctx.calls.initiate_call(user, name, target, kind)?;
	conn.outbox.send(&ServerEvent::CallInitResponse {
		call_id,
		target_id: target.clone(),
		call_type: kind,
	});
	Ok(())
}

pub(super) fn accept(ctx: &ServerContext, conn: &Connection, call_id: &str) -> Result<(), HandlerError> {
	let (user, name) = identity(conn)?;
	let session = ctx.calls.accept_call(call_id, user, name)?;
	conn.outbox.send(&session.status_event());
	Ok(())
}

pub(super) fn reject(
	ctx: &ServerContext,
	conn: &Connection,
	call_id: &str,
	reason: Option<&str>,
) -> Result<(), HandlerError> {
	let (user, _) = identity(conn)?;
	ctx.calls.reject_call(call_id, user, reason)?;
	Ok(())
}

pub(super) fn end(ctx: &ServerContext, conn: &Connection, call_id: &str) -> Result<(), HandlerError> {
	let (user, _) = identity(conn)?;
	let duration = ctx.calls.end_call(call_id, user)?;
	conn.outbox.send(&ServerEvent::CallEndResponse {
		call_id: call_id.to_string(),
		duration,
	});
	Ok(())
}

pub(super) fn status(ctx: &ServerContext, conn: &Connection, call_id: &str) -> Result<(), HandlerError> {
	let (user, _) = identity(conn)?;
	let session = ctx.calls.status(call_id)?;
	if !session.involves(user) {
		return Err(CallError::NotInCall.into());
	}
	conn.outbox.send(&session.status_event());
	Ok(())
}

pub(super) fn mute(ctx: &ServerContext, conn: &Connection, call_id: &str, muted: Option<bool>) -> Result<(), HandlerError> {
	let (user, _) = identity(conn)?;
	let muted = ctx.calls.toggle_mute(call_id, user, muted)?;
	conn.outbox.send(&ServerEvent::MediaMute {
		call_id: call_id.to_string(),
		user_id: user.clone(),
		muted,
	});
	Ok(())
}

pub(super) fn video(ctx: &ServerContext, conn: &Connection, call_id: &str, video: Option<bool>) -> Result<(), HandlerError> {
	let (user, _) = identity(conn)?;
	let video = ctx.calls.toggle_video(call_id, user, video)?;
	conn.outbox.send(&ServerEvent::MediaVideo {
		call_id: call_id.to_string(),
		user_id: user.clone(),
		video,
	});
	Ok(())
}

pub(super) fn screen(
	ctx: &ServerContext,
	conn: &Connection,
	call_id: &str,
	sharing: Option<bool>,
) -> Result<(), HandlerError> {
	let (user, _) = identity(conn)?;
	let sharing = ctx.calls.toggle_screen_share(call_id, user, sharing)?;
	conn.outbox.send(&ServerEvent::MediaScreen {
		call_id: call_id.to_string(),
		user_id: user.clone(),
		sharing,
	});
	Ok(())
}

pub(super) fn share_screen(ctx: &ServerContext, conn: &Connection, call_id: &str, on: bool) -> Result<(), HandlerError> {
	let (user, _) = identity(conn)?;
	let sharing = if on {
		ctx.calls.start_screen_share(call_id, user)?
	} else {
		ctx.calls.stop_screen_share(call_id, user)?
	};
	conn.outbox.send(&ServerEvent::MediaScreen {
		call_id: call_id.to_string(),
		user_id: user.clone(),
		sharing,
	});
	Ok(())
}
