#![forbid(unsafe_code)]

use parley_protocol::DecodeError;
use thiserror::Error;

use crate::server::calls::CallError;
use crate::server::completion::CompletionError;
use crate::server::credentials::AuthError;
use crate::server::registry::RegistryError;
use crate::server::store::StoreError;
use crate::server::uploads::UploadError;

/// Error classes reported to clients in the `code` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	Validation,
	Unauthenticated,
	Unauthorized,
	NotFound,
	InvalidState,
	Conflict,
	ResourceExhausted,
	UnrecognizedEvent,
	Internal,
}

impl ErrorKind {
	pub const fn code(self) -> &'static str {
		match self {
			ErrorKind::Validation => "validation_error",
			ErrorKind::Unauthenticated => "unauthenticated",
			ErrorKind::Unauthorized => "unauthorized",
			ErrorKind::NotFound => "not_found",
			ErrorKind::InvalidState => "invalid_state",
			ErrorKind::Conflict => "conflict",
			ErrorKind::ResourceExhausted => "resource_exhausted",
			ErrorKind::UnrecognizedEvent => "unrecognized_event",
			ErrorKind::Internal => "internal",
		}
	}
}

/// Everything a handler can fail with. Always recovered into an error frame.
#[derive(Debug, Error)]
pub enum HandlerError {
	#[error(transparent)]
	Decode(#[from] DecodeError),

	#[error("authentication required")]
	Unauthenticated,

	#[error("{0}")]
	Validation(String),

	#[error("{0}")]
	NotFound(String),

	#[error("{0}")]
	Unauthorized(String),

	#[error("too many requests")]
	RateLimited,

	#[error(transparent)]
	Registry(#[from] RegistryError),

	#[error(transparent)]
	Call(#[from] CallError),

	#[error(transparent)]
	Upload(#[from] UploadError),

	#[error(transparent)]
	Auth(#[from] AuthError),

	#[error(transparent)]
	Completion(#[from] CompletionError),

	#[error(transparent)]
	Store(#[from] StoreError),

	#[error(transparent)]
	Internal(#[from] anyhow::Error),
}

impl HandlerError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			HandlerError::Decode(DecodeError::Unrecognized(_)) => ErrorKind::UnrecognizedEvent,
			HandlerError::Decode(_) => ErrorKind::Validation,
			HandlerError::Unauthenticated => ErrorKind::Unauthenticated,
			HandlerError::Validation(_) => ErrorKind::Validation,
			HandlerError::NotFound(_) => ErrorKind::NotFound,
			HandlerError::Unauthorized(_) => ErrorKind::Unauthorized,
			HandlerError::RateLimited => ErrorKind::ResourceExhausted,
			HandlerError::Registry(e) => match e {
				RegistryError::AlreadyAuthenticated => ErrorKind::Conflict,
				RegistryError::InvalidIdentity => ErrorKind::Validation,
				RegistryError::UnknownConnection(_) => ErrorKind::Internal,
			},
			HandlerError::Call(e) => match e {
				CallError::AlreadyInCall | CallError::TargetBusy => ErrorKind::Conflict,
				CallError::SelfCall => ErrorKind::Validation,
				CallError::NotFound(_) => ErrorKind::NotFound,
				CallError::InvalidState(_) => ErrorKind::InvalidState,
				CallError::NotInvited | CallError::NotInCall => ErrorKind::Unauthorized,
			},
			HandlerError::Upload(e) => match e {
				UploadError::NotFound(_) => ErrorKind::NotFound,
				UploadError::Unauthorized => ErrorKind::Unauthorized,
				UploadError::Validation(_) | UploadError::InvalidChunk(_) => ErrorKind::Validation,
				UploadError::InvalidState(_) | UploadError::Incomplete { .. } => ErrorKind::InvalidState,
				UploadError::Conflict(_) => ErrorKind::Conflict,
				UploadError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
				UploadError::Io(_) => ErrorKind::Internal,
			},
			HandlerError::Auth(e) => match e {
				AuthError::InvalidCredentials | AuthError::InvalidToken(_) => ErrorKind::Unauthenticated,
				AuthError::UsernameTaken => ErrorKind::Conflict,
				AuthError::Validation(_) => ErrorKind::Validation,
				AuthError::Store(_) | AuthError::Internal(_) => ErrorKind::Internal,
			},
			HandlerError::Completion(_) => ErrorKind::Internal,
			HandlerError::Store(StoreError::Duplicate(_)) => ErrorKind::Conflict,
			HandlerError::Store(StoreError::Backend(_)) => ErrorKind::Internal,
			HandlerError::Internal(_) => ErrorKind::Internal,
		}
	}

	/// Message safe to show to the client. Internal details stay in the logs.
	pub fn client_message(&self) -> String {
		match self.kind() {
			ErrorKind::Internal => "internal server error".to_string(),
			_ => self.to_string(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use parley_domain::CallState;

	#[test]
	fn maps_component_errors_to_wire_codes() {
		let cases = [
			(HandlerError::from(DecodeError::Unrecognized("x".into())), "unrecognized_event"),
			(HandlerError::from(DecodeError::MissingType), "validation_error"),
			(HandlerError::Unauthenticated, "unauthenticated"),
			(HandlerError::from(CallError::TargetBusy), "conflict"),
			(HandlerError::from(CallError::InvalidState(CallState::Connecting)), "invalid_state"),
			(HandlerError::from(CallError::NotInvited), "unauthorized"),
			(
				HandlerError::from(UploadError::Incomplete { received: 1, total: 2 }),
				"invalid_state",
			),
			(HandlerError::from(UploadError::ResourceExhausted("big".into())), "resource_exhausted"),
			(HandlerError::RateLimited, "resource_exhausted"),
			(HandlerError::from(AuthError::UsernameTaken), "conflict"),
			(HandlerError::from(StoreError::Duplicate("lobby".into())), "conflict"),
		];

		for (err, code) in cases {
			assert_eq!(err.kind().code(), code, "{err}");
		}
	}

	#[test]
	fn internal_errors_are_not_leaked() {
		let err = HandlerError::from(anyhow::anyhow!("db password is hunter2"));
		assert_eq!(err.client_message(), "internal server error");
	}
}
