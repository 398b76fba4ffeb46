#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum accepted length for user and room identifiers.
pub const MAX_ID_LEN: usize = 128;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown kind: {0}")]
	UnknownKind(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

fn validate_id(id: &str) -> Result<(), ParseIdError> {
	if id.trim().is_empty() {
		return Err(ParseIdError::Empty);
	}
	if id.len() > MAX_ID_LEN {
		return Err(ParseIdError::InvalidFormat(format!("longer than {MAX_ID_LEN} bytes")));
	}
	if id.chars().any(|c| c.is_control()) {
		return Err(ParseIdError::InvalidFormat("contains control characters".into()));
	}
	Ok(())
}

macro_rules! string_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(try_from = "String", into = "String")]
		pub struct $name(String);

		impl $name {
			pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
				let id = id.into();
				validate_id(&id)?;
				Ok(Self(id))
			}

			pub fn as_str(&self) -> &str {
				&self.0
			}

			pub fn into_string(self) -> String {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				Self::new(s.to_string())
			}
		}

		impl TryFrom<String> for $name {
			type Error = ParseIdError;

			fn try_from(s: String) -> Result<Self, Self::Error> {
				Self::new(s)
			}
		}

		impl From<$name> for String {
			fn from(id: $name) -> String {
				id.0
			}
		}
	};
}

string_id!(
	/// Authenticated user identifier (opaque, assigned by the credential service).
	UserId
);

string_id!(
	/// Logical room identifier (`lobby`, `global`, ...).
	RoomId
);

/// Server-issued session identifier; doubles as the broker subscriber handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
	/// Create a new random session id.
	pub fn generate() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Broker topic keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
	/// `room:<roomId>`
	Room(RoomId),
	/// `user:<userId>`
	User(UserId),
	/// Application topic such as `presence`.
	Named(String),
}

impl Topic {
	pub const ROOM_PREFIX: &'static str = "room:";
	pub const USER_PREFIX: &'static str = "user:";

	/// Server-wide presence channel.
	pub const PRESENCE: &'static str = "presence";

	/// Format a room topic (e.g. `room:lobby`).
	pub fn room(room: &RoomId) -> String {
		format!("{}{}", Self::ROOM_PREFIX, room.as_str())
	}

	/// Format a user topic (e.g. `user:42`).
	pub fn user(user: &UserId) -> String {
		format!("{}{}", Self::USER_PREFIX, user.as_str())
	}

	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		if let Some(rest) = s.strip_prefix(Self::ROOM_PREFIX) {
			return Ok(Topic::Room(RoomId::new(rest.to_string())?));
		}
		if let Some(rest) = s.strip_prefix(Self::USER_PREFIX) {
			return Ok(Topic::User(UserId::new(rest.to_string())?));
		}
		if s.contains(':') {
			return Err(ParseIdError::InvalidFormat(format!("unknown topic namespace: {s}")));
		}
		Ok(Topic::Named(s.to_string()))
	}
}

impl fmt::Display for Topic {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Topic::Room(r) => write!(f, "{}{}", Self::ROOM_PREFIX, r),
			Topic::User(u) => write!(f, "{}{}", Self::USER_PREFIX, u),
			Topic::Named(n) => f.write_str(n),
		}
	}
}

impl FromStr for Topic {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Topic::parse(s)
	}
}

/// Kind of call being negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
	Audio,
	#[default]
	Video,
	#[serde(alias = "screen_share")]
	Screen,
}

impl CallKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			CallKind::Audio => "audio",
			CallKind::Video => "video",
			CallKind::Screen => "screen",
		}
	}
}

impl fmt::Display for CallKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for CallKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"audio" => Ok(CallKind::Audio),
			"video" => Ok(CallKind::Video),
			"screen" | "screen_share" => Ok(CallKind::Screen),
			other => Err(ParseIdError::UnknownKind(other.to_string())),
		}
	}
}

/// Call lifecycle state.
///
/// `Ringing` is the callee's view of a `Calling` call and is never stored on a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
	Idle,
	Calling,
	Ringing,
	Connecting,
	Connected,
	Ended,
}

impl CallState {
	pub const fn as_str(self) -> &'static str {
		match self {
			CallState::Idle => "idle",
			CallState::Calling => "calling",
			CallState::Ringing => "ringing",
			CallState::Connecting => "connecting",
			CallState::Connected => "connected",
			CallState::Ended => "ended",
		}
	}

	pub const fn is_terminal(self) -> bool {
		matches!(self, CallState::Ended)
	}
}

impl fmt::Display for CallState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Logical kind of a completed upload, derived from its MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
	Voice,
	Image,
	File,
}

impl MediaKind {
	pub fn from_mime(mime: &str) -> Self {
		let mime = mime.trim().to_ascii_lowercase();
		if mime.starts_with("audio/") {
			MediaKind::Voice
		} else if mime.starts_with("image/") {
			MediaKind::Image
		} else {
			MediaKind::File
		}
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			MediaKind::Voice => "voice",
			MediaKind::Image => "image",
			MediaKind::File => "file",
		}
	}
}

impl fmt::Display for MediaKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn topic_parse_and_display() {
		let room = RoomId::new("lobby").unwrap();
		assert_eq!(Topic::room(&room), "room:lobby");
		assert_eq!(Topic::parse("room:lobby").unwrap(), Topic::Room(room));

		let user = UserId::new("u-1").unwrap();
		assert_eq!(Topic::parse("user:u-1").unwrap().to_string(), "user:u-1");
		assert_eq!(Topic::user(&user), "user:u-1");

		assert_eq!(Topic::parse("presence").unwrap(), Topic::Named("presence".to_string()));
		assert!(Topic::parse("bogus:thing").is_err());
		assert!(Topic::parse("room:").is_err());
	}

	#[test]
	fn rejects_bad_ids() {
		assert!(UserId::new("").is_err());
		assert!(RoomId::new("   ").is_err());
		assert!(RoomId::new("a\nb").is_err());
		assert!(RoomId::new("x".repeat(MAX_ID_LEN + 1)).is_err());
		assert!(serde_json::from_str::<RoomId>("\"\"").is_err());
	}

	#[test]
	fn call_kind_parses_aliases() {
		assert_eq!("Screen_Share".parse::<CallKind>().unwrap(), CallKind::Screen);
		assert_eq!(serde_json::from_str::<CallKind>("\"screen_share\"").unwrap(), CallKind::Screen);
		assert_eq!(CallKind::default(), CallKind::Video);
		assert!("hologram".parse::<CallKind>().is_err());
	}

	#[test]
	fn media_kind_from_mime() {
		assert_eq!(MediaKind::from_mime("audio/webm"), MediaKind::Voice);
		assert_eq!(MediaKind::from_mime("IMAGE/png"), MediaKind::Image);
		assert_eq!(MediaKind::from_mime("application/pdf"), MediaKind::File);
		assert_eq!(MediaKind::from_mime(""), MediaKind::File);
	}
}
