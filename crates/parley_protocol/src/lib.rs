#![forbid(unsafe_code)]

pub mod event;
pub mod framing;

pub use event::{
	ChatMessage, ClientEvent, DecodeError, OnlineUser, ParticipantInfo, RoomInfo, ServerEvent, decode_client_event,
};
pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_text_frame, encode_frame, encode_frame_into, encode_text_frame,
	frame_len_from_payload_len, try_decode_frame, try_decode_text_frame,
};

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;

	/// Compact representation useful for logs/metrics.
	pub const PROTOCOL_VERSION_U32: u32 = (PROTOCOL_MAJOR << 16) | PROTOCOL_MINOR;

	/// ALPN identifier negotiated on the QUIC handshake.
	pub const ALPN: &[u8] = b"parley-v1";
}
