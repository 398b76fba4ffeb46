#![forbid(unsafe_code)]

use parley_domain::Topic;
use parley_protocol::{ChatMessage, ServerEvent};
use tracing::debug;

use super::identity;
use crate::server::context::ServerContext;
use crate::server::error::HandlerError;
use crate::server::outbox::encode;
use crate::server::registry::Connection;
use crate::server::store::StoreError;
use crate::util::time::unix_ms_now;

const MAX_CONTENT_CHARS: usize = 4000;
const MAX_EMOJI_CHARS: usize = 16;

async fn live_message(ctx: &ServerContext, message_id: &str) -> Result<ChatMessage, HandlerError> {
	ctx.store
		.find_message(message_id)
		.await?
		.ok_or_else(|| HandlerError::NotFound(format!("message {message_id} not found")))
}

/// Reply to the sender and fan out to the rest of the message's room.
fn announce(ctx: &ServerContext, conn: &Connection, msg: &ChatMessage, event: &ServerEvent) -> usize {
	let Some(payload) = encode(event) else {
		return 0;
	};
	conn.outbox.push(payload.clone());
	let subscriber = conn.subscriber_id();
	ctx.broker
		.publish_excluding(&Topic::room(&msg.room_id), payload, Some(&subscriber), &subscriber)
}

pub(super) async fn edit(
	ctx: &ServerContext,
	conn: &Connection,
	message_id: &str,
	content: String,
) -> Result<(), HandlerError> {
	let (user, _) = identity(conn)?;
	if content.trim().is_empty() {
		return Err(HandlerError::Validation("message content is empty".to_string()));
	}
	if content.chars().count() > MAX_CONTENT_CHARS {
		return Err(HandlerError::Validation(format!(
			"message exceeds {MAX_CONTENT_CHARS} characters"
		)));
	}

	let msg = live_message(ctx, message_id).await?;
	if &msg.user_id != user {
		return Err(HandlerError::Unauthorized("only the author can edit a message".to_string()));
	}

	let edited_at = unix_ms_now();
	if !ctx.store.edit_message(message_id, &content, edited_at).await? {
		return Err(HandlerError::NotFound(format!("message {message_id} not found")));
	}

	let delivered = announce(
		ctx,
		conn,
		&msg,
		&ServerEvent::MessageEdited {
			message_id: msg.message_id.clone(),
			room_id: msg.room_id.clone(),
			user_id: user.clone(),
			new_content: content,
			edited_at,
		},
	);
	debug!(room = %msg.room_id, message_id, delivered, "message edited");
	Ok(())
}

/// The author or the room's creator may delete.
pub(super) async fn delete(ctx: &ServerContext, conn: &Connection, message_id: &str) -> Result<(), HandlerError> {
	let (user, _) = identity(conn)?;
	let msg = live_message(ctx, message_id).await?;

	if &msg.user_id != user {
		let creator = ctx
			.store
			.list_rooms()
			.await?
			.into_iter()
			.find(|r| r.room_id == msg.room_id)
			.and_then(|r| r.created_by);
		if creator.as_ref() != Some(user) {
			return Err(HandlerError::Unauthorized(
				"only the author or the room creator can delete a message".to_string(),
			));
		}
	}

	if !ctx.store.delete_message(message_id, unix_ms_now()).await? {
		return Err(HandlerError::NotFound(format!("message {message_id} not found")));
	}

	let delivered = announce(
		ctx,
		conn,
		&msg,
		&ServerEvent::MessageDeleted {
			message_id: msg.message_id.clone(),
			room_id: msg.room_id.clone(),
			user_id: user.clone(),
		},
	);
	debug!(room = %msg.room_id, message_id, delivered, "message deleted");
	Ok(())
}

pub(super) async fn react(
	ctx: &ServerContext,
	conn: &Connection,
	message_id: &str,
	emoji: &str,
) -> Result<(), HandlerError> {
	let (user, name) = identity(conn)?;
	let emoji = emoji.trim();
	if emoji.is_empty() || emoji.chars().count() > MAX_EMOJI_CHARS {
		return Err(HandlerError::Validation(format!(
			"emoji must be 1-{MAX_EMOJI_CHARS} characters"
		)));
	}

	let msg = live_message(ctx, message_id).await?;
	if !ctx.store.add_reaction(message_id, user, emoji).await? {
		return Err(StoreError::Duplicate(format!("reaction {emoji} on {message_id}")).into());
	}

	announce(
		ctx,
		conn,
		&msg,
		&ServerEvent::ReactionAdded {
			message_id: msg.message_id.clone(),
			room_id: msg.room_id.clone(),
			user_id: user.clone(),
			username: name.to_string(),
			emoji: emoji.to_string(),
		},
	);
	Ok(())
}

pub(super) async fn mark_read(ctx: &ServerContext, conn: &Connection, message_id: &str) -> Result<(), HandlerError> {
	let (user, name) = identity(conn)?;
	let msg = live_message(ctx, message_id).await?;

	let read_at = unix_ms_now();
	ctx.store.mark_read(message_id, user, read_at).await?;

	announce(
		ctx,
		conn,
		&msg,
		&ServerEvent::MessageRead {
			message_id: msg.message_id.clone(),
			room_id: msg.room_id.clone(),
			read_by: user.clone(),
			username: name.to_string(),
			timestamp: read_at,
		},
	);
	Ok(())
}
