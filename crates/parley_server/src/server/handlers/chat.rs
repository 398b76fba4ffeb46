#![forbid(unsafe_code)]

use parley_domain::{RoomId, Topic};
use parley_protocol::{ChatMessage, ServerEvent};
use serde_json::Value;
use tracing::warn;

use super::identity;
use crate::server::context::ServerContext;
use crate::server::error::HandlerError;
use crate::server::outbox::{encode, publish_event};
use crate::server::registry::Connection;
use crate::util::time::unix_ms_now;

const MAX_CONTENT_CHARS: usize = 4000;

/// Room every user can talk in without joining first.
pub(super) fn default_room() -> Result<RoomId, HandlerError> {
	RoomId::new("global").map_err(|e| HandlerError::Internal(anyhow::anyhow!("default room: {e}")))
}

pub(super) async fn send(
	ctx: &ServerContext,
	conn: &Connection,
	room: Option<RoomId>,
	content: String,
	metadata: Option<Value>,
) -> Result<(), HandlerError> {
	let (user, name) = identity(conn)?;
	if content.trim().is_empty() {
		return Err(HandlerError::Validation("message content is empty".to_string()));
	}
	if content.chars().count() > MAX_CONTENT_CHARS {
		return Err(HandlerError::Validation(format!(
			"message exceeds {MAX_CONTENT_CHARS} characters"
		)));
	}

	let room = match room.or_else(|| conn.room.clone()) {
		Some(room) => room,
		None => default_room()?,
	};

	let msg = ChatMessage {
		message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
		room_id: room.clone(),
		user_id: user.clone(),
		username: name.to_string(),
		content,
		timestamp: unix_ms_now(),
		message_type: None,
		metadata,
		edited_at: None,
	};

	let delivered = publish_event(
		&ctx.broker,
		&Topic::room(&room),
		&ServerEvent::Chat(msg.clone()),
		Some(&conn.subscriber_id()),
	);
	metrics::counter!("parley_server_chat_messages_total").increment(1);
	tracing::debug!(room = %room, delivered, "chat message published");

	if let Err(e) = ctx.store.add_message(&msg).await {
		warn!(room = %room, error = %e, "failed to persist chat message");
	}
	Ok(())
}

pub(super) fn typing(
	ctx: &ServerContext,
	conn: &Connection,
	room: Option<RoomId>,
	is_typing: bool,
) -> Result<(), HandlerError> {
	let (user, name) = identity(conn)?;
	let Some(room) = room.or_else(|| conn.room.clone()) else {
		return Err(HandlerError::Validation("not in a room".to_string()));
	};

	let subscriber = conn.subscriber_id();
	if let Some(payload) = encode(&ServerEvent::Typing {
		room_id: room.clone(),
		user_id: user.clone(),
		username: name.to_string(),
		is_typing,
	}) {
		ctx.broker
			.publish_excluding(&Topic::room(&room), payload, Some(&subscriber), &subscriber);
	}
	Ok(())
}
