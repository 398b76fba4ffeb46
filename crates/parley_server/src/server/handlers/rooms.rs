#![forbid(unsafe_code)]

use std::collections::HashSet;

use parley_domain::{RoomId, Topic};
use parley_protocol::{RoomInfo, ServerEvent};
use tracing::{debug, warn};

use super::identity;
use crate::server::context::ServerContext;
use crate::server::error::HandlerError;
use crate::server::outbox::{encode, held_delivery_for, publish_event};
use crate::server::registry::Connection;

/// Messages replayed to a joining member.
const HISTORY_LIMIT: usize = 50;

pub(super) async fn join(ctx: &ServerContext, conn: &Connection, room: RoomId) -> Result<(), HandlerError> {
	let (user, name) = identity(conn)?;
	let subscriber = conn.subscriber_id();

	let previous = ctx.registry.set_room(conn.handle, Some(room.clone()))?;
	if let Some(prev) = previous.filter(|p| p != &room) {
		ctx.broker.unsubscribe(&subscriber, &Topic::room(&prev));
		publish_event(
			&ctx.broker,
			&Topic::room(&prev),
			&ServerEvent::UserLeftRoom {
				room_id: prev.clone(),
				user_id: user.clone(),
				username: name.to_string(),
			},
			Some(&subscriber),
		);
	}

	// Live traffic is parked until `room_joined` is out, so nothing in the history
	// snapshot is delivered twice and nothing published meanwhile is lost.
	let topic = Topic::room(&room);
	let (deliver, held) = held_delivery_for(&conn.outbox);
	ctx.broker.subscribe(&subscriber, &topic, deliver);

	let history = match ctx.store.recent_messages(&room, HISTORY_LIMIT).await {
		Ok(history) => history,
		Err(e) => {
			warn!(room = %room, error = %e, "failed to load room history");
			Vec::new()
		}
	};
	let replayed = history.iter().map(|m| m.message_id.clone()).collect::<HashSet<_>>();

	conn.outbox.send(&ServerEvent::RoomJoined {
		room_id: room.clone(),
		user_id: user.clone(),
		username: name.to_string(),
		history,
	});
	let duplicates = held.release(|payload| {
		matches!(
			serde_json::from_str::<ServerEvent>(payload),
			Ok(ServerEvent::Chat(msg)) if replayed.contains(&msg.message_id)
		)
	});
	if duplicates > 0 {
		debug!(handle = %conn.handle, room = %room, duplicates, "dropped live messages already in history");
	}

	if let Some(payload) = encode(&ServerEvent::UserJoinedRoom {
		room_id: room.clone(),
		user_id: user.clone(),
		username: name.to_string(),
	}) {
		ctx.broker.publish_excluding(&topic, payload, Some(&subscriber), &subscriber);
	}
	debug!(handle = %conn.handle, room = %room, "joined room");
	Ok(())
}

pub(super) fn leave(ctx: &ServerContext, conn: &Connection, room: Option<RoomId>) -> Result<(), HandlerError> {
	let (user, name) = identity(conn)?;
	let Some(room) = room.or_else(|| conn.room.clone()) else {
		return Err(HandlerError::Validation("not in a room".to_string()));
	};

	let subscriber = conn.subscriber_id();
	let topic = Topic::room(&room);
	if !ctx.broker.unsubscribe(&subscriber, &topic) {
		return Err(HandlerError::NotFound(format!("not a member of room {room}")));
	}
	if conn.room.as_ref() == Some(&room) {
		ctx.registry.set_room(conn.handle, None)?;
	}

	conn.outbox.send(&ServerEvent::RoomLeft {
		room_id: room.clone(),
		user_id: user.clone(),
		username: name.to_string(),
	});
	publish_event(
		&ctx.broker,
		&topic,
		&ServerEvent::UserLeftRoom {
			room_id: room,
			user_id: user.clone(),
			username: name.to_string(),
		},
		Some(&subscriber),
	);
	Ok(())
}

pub(super) async fn create(
	ctx: &ServerContext,
	conn: &Connection,
	room: Option<RoomId>,
	name: &str,
) -> Result<(), HandlerError> {
	let (user, _) = identity(conn)?;
	let name = name.trim();
	if name.is_empty() || name.chars().count() > 64 {
		return Err(HandlerError::Validation("room name must be 1-64 characters".to_string()));
	}

	let room = match room {
		Some(room) => room,
		None => {
			let suffix = uuid::Uuid::new_v4().simple().to_string();
			RoomId::new(format!("room_{}", &suffix[..8]))
				.map_err(|e| HandlerError::Internal(anyhow::anyhow!("generate room id: {e}")))?
		}
	};

	let record = ctx.store.create_room(&room, name, Some(user)).await?;
	conn.outbox.send(&ServerEvent::RoomCreated {
		room_id: record.room_id,
		name: record.name,
	});
	Ok(())
}

pub(super) async fn list(ctx: &ServerContext, conn: &Connection) -> Result<(), HandlerError> {
	let rooms = ctx
		.store
		.list_rooms()
		.await?
		.into_iter()
		.map(|r| RoomInfo {
			room_id: r.room_id,
			name: r.name,
			created_by: r.created_by,
		})
		.collect();

	conn.outbox.send(&ServerEvent::Rooms { rooms });
	Ok(())
}
