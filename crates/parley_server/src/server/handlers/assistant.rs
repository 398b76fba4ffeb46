#![forbid(unsafe_code)]

use std::sync::Arc;

use parley_protocol::ServerEvent;
use tracing::{debug, warn};

use super::identity;
use crate::server::completion::CompletionError;
use crate::server::context::ServerContext;
use crate::server::error::HandlerError;
use crate::server::registry::Connection;

const MAX_PROMPT_CHARS: usize = 8000;

/// Completions run off the connection task; the reply arrives whenever the model answers.
pub(super) fn request(ctx: &ServerContext, conn: &Connection, message: String) -> Result<(), HandlerError> {
	let (user, _) = identity(conn)?;
	let prompt = message.trim();
	if prompt.is_empty() {
		return Err(HandlerError::Validation("message is empty".to_string()));
	}
	if prompt.chars().count() > MAX_PROMPT_CHARS {
		return Err(HandlerError::Validation(format!("message exceeds {MAX_PROMPT_CHARS} characters")));
	}

	let completion = Arc::clone(&ctx.completion);
	let outbox = conn.outbox.clone();
	let prompt = prompt.to_string();
	let user = user.clone();
	tokio::spawn(async move {
		let reply = match completion.complete(&prompt).await {
			Ok(response) => {
				debug!(user_id = %user, "assistant replied");
				ServerEvent::AiResponse { response }
			}
			Err(CompletionError::Unavailable) => ServerEvent::AiError {
				message: "assistant is not available".to_string(),
			},
			Err(e) => {
				warn!(user_id = %user, error = %e, "assistant request failed");
				ServerEvent::AiError {
					message: "assistant request failed".to_string(),
				}
			}
		};
		outbox.send(&reply);
	});
	Ok(())
}
