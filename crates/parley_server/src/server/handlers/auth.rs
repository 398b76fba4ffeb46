#![forbid(unsafe_code)]

use parley_domain::{Topic, UserId};
use parley_protocol::ServerEvent;
use tracing::info;

use crate::server::context::ServerContext;
use crate::server::credentials::AuthError;
use crate::server::error::HandlerError;
use crate::server::outbox::{delivery_for, encode};
use crate::server::registry::Connection;

/// Failures the client can act on are answered in-band; the rest become error frames.
fn answerable(err: &AuthError) -> bool {
	matches!(
		err,
		AuthError::InvalidCredentials | AuthError::UsernameTaken | AuthError::InvalidToken(_) | AuthError::Validation(_)
	)
}

pub(super) async fn register(
	ctx: &ServerContext,
	conn: &Connection,
	username: &str,
	password: &str,
	email: Option<&str>,
) -> Result<(), HandlerError> {
	let reply = match ctx.credentials.register(username, password, email).await {
		Ok(user) => ServerEvent::RegisterResponse {
			success: true,
			user_id: Some(user.user_id),
			message: "registration successful".to_string(),
		},
		Err(e) if answerable(&e) => ServerEvent::RegisterResponse {
			success: false,
			user_id: None,
			message: e.to_string(),
		},
		Err(e) => return Err(e.into()),
	};

	conn.outbox.send(&reply);
	Ok(())
}

pub(super) async fn login(
	ctx: &ServerContext,
	conn: &Connection,
	username: &str,
	password: &str,
) -> Result<(), HandlerError> {
	let user = match ctx.credentials.verify_credentials(username, password).await {
		Ok(user) => user,
		Err(e) if answerable(&e) => {
			conn.outbox.send(&ServerEvent::LoginResponse {
				success: false,
				user_id: None,
				username: None,
				token: None,
				message: e.to_string(),
			});
			return Ok(());
		}
		Err(e) => return Err(e.into()),
	};

	let token = ctx.credentials.issue_token(&user)?;
	establish(ctx, conn, user.user_id.clone(), &user.username)?;

	conn.outbox.send(&ServerEvent::LoginResponse {
		success: true,
		user_id: Some(user.user_id),
		username: Some(user.username),
		token: Some(token),
		message: "login successful".to_string(),
	});
	Ok(())
}

/// Resume a session from a previously issued token.
pub(super) fn resume(ctx: &ServerContext, conn: &Connection, token: &str) -> Result<(), HandlerError> {
	let claims = match ctx.credentials.verify_token(token) {
		Ok(claims) => claims,
		Err(e) if answerable(&e) => {
			conn.outbox.send(&ServerEvent::AuthResponse {
				success: false,
				user_id: None,
				username: None,
				message: e.to_string(),
			});
			return Ok(());
		}
		Err(e) => return Err(e.into()),
	};

	let user_id = UserId::new(claims.sub).map_err(|_| HandlerError::Validation("token subject is empty".to_string()))?;
	establish(ctx, conn, user_id.clone(), &claims.name)?;

	conn.outbox.send(&ServerEvent::AuthResponse {
		success: true,
		user_id: Some(user_id),
		username: Some(claims.name),
		message: "authenticated".to_string(),
	});
	Ok(())
}

/// Bind the connection to `user`, subscribe it to its personal and presence topics
/// and announce the user when this is their first live connection.
fn establish(ctx: &ServerContext, conn: &Connection, user: UserId, name: &str) -> Result<(), HandlerError> {
	let conn = ctx.registry.authenticate(conn.handle, user.clone(), name)?;
	let subscriber = conn.subscriber_id();
	ctx.broker.subscribe(&subscriber, &Topic::user(&user), delivery_for(&conn.outbox));
	ctx.broker.subscribe(&subscriber, Topic::PRESENCE, delivery_for(&conn.outbox));

	let sessions = ctx.registry.connections_for_user(&user).len();
	info!(handle = %conn.handle, user_id = %user, sessions, "session authenticated");

	if sessions == 1
		&& let Some(payload) = encode(&ServerEvent::PresenceUpdate {
			user_id: user,
			username: conn.display_name.clone(),
			status: "online".to_string(),
		}) {
		ctx.broker
			.publish_excluding(Topic::PRESENCE, payload, Some(&subscriber), &subscriber);
	}
	Ok(())
}
