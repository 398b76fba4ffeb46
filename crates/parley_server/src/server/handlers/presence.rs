#![forbid(unsafe_code)]

use parley_domain::Topic;
use parley_protocol::ServerEvent;

use super::identity;
use crate::server::context::ServerContext;
use crate::server::error::HandlerError;
use crate::server::outbox::publish_event;
use crate::server::registry::Connection;

const STATUSES: &[&str] = &["online", "away", "busy", "offline"];

pub(super) fn online_users(ctx: &ServerContext, conn: &Connection) -> Result<(), HandlerError> {
	let users = ctx.registry.online_users();
	conn.outbox.send(&ServerEvent::OnlineUsers {
		count: users.len(),
		users,
	});
	Ok(())
}

pub(super) fn update(ctx: &ServerContext, conn: &Connection, status: &str) -> Result<(), HandlerError> {
	let (user, name) = identity(conn)?;
	let status = status.trim().to_ascii_lowercase();
	if !STATUSES.contains(&status.as_str()) {
		return Err(HandlerError::Validation(format!(
			"unknown status {status:?} (expected one of {})",
			STATUSES.join(", ")
		)));
	}

	publish_event(
		&ctx.broker,
		Topic::PRESENCE,
		&ServerEvent::PresenceUpdate {
			user_id: user.clone(),
			username: name.to_string(),
			status,
		},
		Some(&conn.subscriber_id()),
	);
	Ok(())
}
