#![forbid(unsafe_code)]

use parley_domain::{CallKind, CallState, MediaKind, RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

fn default_true() -> bool {
	true
}

fn default_status() -> String {
	"online".to_string()
}

/// Events sent by clients. The wire form is a JSON object with a `type` discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
	Register {
		username: String,
		password: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		email: Option<String>,
	},
	Login {
		username: String,
		password: String,
	},
	Auth {
		token: String,
	},
	Ping {},

	Chat {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		room_id: Option<RoomId>,
		content: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		metadata: Option<Value>,
	},
	EditMessage {
		message_id: String,
		#[serde(alias = "content")]
		new_content: String,
	},
	DeleteMessage {
		message_id: String,
	},
	AddReaction {
		message_id: String,
		emoji: String,
	},
	MarkRead {
		message_id: String,
	},
	Typing {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		room_id: Option<RoomId>,
		#[serde(default = "default_true")]
		is_typing: bool,
	},
	JoinRoom {
		room_id: RoomId,
	},
	LeaveRoom {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		room_id: Option<RoomId>,
	},
	CreateRoom {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		room_id: Option<RoomId>,
		name: String,
	},
	GetRooms {},
	GetOnlineUsers {},
	PresenceUpdate {
		#[serde(default = "default_status")]
		status: String,
	},

	CallInit {
		#[serde(alias = "targetUserId")]
		target_id: UserId,
		#[serde(default)]
		call_type: CallKind,
	},
	CallAccept {
		call_id: String,
	},
	CallReject {
		call_id: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		reason: Option<String>,
	},
	CallEnd {
		call_id: String,
	},
	CallStatus {
		call_id: String,
	},
	WebrtcOffer {
		call_id: String,
		#[serde(alias = "targetUserId")]
		target_id: UserId,
		sdp: Value,
	},
	WebrtcAnswer {
		call_id: String,
		#[serde(alias = "targetUserId")]
		target_id: UserId,
		sdp: Value,
	},
	WebrtcIce {
		call_id: String,
		#[serde(alias = "targetUserId")]
		target_id: UserId,
		candidate: Value,
	},
	MediaMute {
		call_id: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		muted: Option<bool>,
	},
	MediaVideo {
		call_id: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		video: Option<bool>,
	},
	MediaScreen {
		call_id: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		sharing: Option<bool>,
	},
	ScreenShareStart {
		call_id: String,
	},
	ScreenShareStop {
		call_id: String,
	},

	UploadInit {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		upload_id: Option<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		file_name: Option<String>,
		file_size: u64,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		mime_type: Option<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		chunk_size: Option<u64>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		total_chunks: Option<u64>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		room_id: Option<RoomId>,
	},
	UploadChunk {
		upload_id: String,
		chunk_index: u64,
		chunk_data: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		total_chunks: Option<u64>,
	},
	UploadFinalize {
		upload_id: String,
	},

	AiRequest {
		message: String,
	},
}

impl ClientEvent {
	/// Every `type` discriminator the server understands.
	pub const KINDS: &'static [&'static str] = &[
		"register",
		"login",
		"auth",
		"ping",
		"chat",
		"edit_message",
		"delete_message",
		"add_reaction",
		"mark_read",
		"typing",
		"join_room",
		"leave_room",
		"create_room",
		"get_rooms",
		"get_online_users",
		"presence_update",
		"call_init",
		"call_accept",
		"call_reject",
		"call_end",
		"call_status",
		"webrtc_offer",
		"webrtc_answer",
		"webrtc_ice",
		"media_mute",
		"media_video",
		"media_screen",
		"screen_share_start",
		"screen_share_stop",
		"upload_init",
		"upload_chunk",
		"upload_finalize",
		"ai_request",
	];

	/// Wire discriminator of this event.
	pub fn kind(&self) -> &'static str {
		match self {
			ClientEvent::Register { .. } => "register",
			ClientEvent::Login { .. } => "login",
			ClientEvent::Auth { .. } => "auth",
			ClientEvent::Ping {} => "ping",
			ClientEvent::Chat { .. } => "chat",
			ClientEvent::EditMessage { .. } => "edit_message",
			ClientEvent::DeleteMessage { .. } => "delete_message",
			ClientEvent::AddReaction { .. } => "add_reaction",
			ClientEvent::MarkRead { .. } => "mark_read",
			ClientEvent::Typing { .. } => "typing",
			ClientEvent::JoinRoom { .. } => "join_room",
			ClientEvent::LeaveRoom { .. } => "leave_room",
			ClientEvent::CreateRoom { .. } => "create_room",
			ClientEvent::GetRooms {} => "get_rooms",
			ClientEvent::GetOnlineUsers {} => "get_online_users",
			ClientEvent::PresenceUpdate { .. } => "presence_update",
			ClientEvent::CallInit { .. } => "call_init",
			ClientEvent::CallAccept { .. } => "call_accept",
			ClientEvent::CallReject { .. } => "call_reject",
			ClientEvent::CallEnd { .. } => "call_end",
			ClientEvent::CallStatus { .. } => "call_status",
			ClientEvent::WebrtcOffer { .. } => "webrtc_offer",
			ClientEvent::WebrtcAnswer { .. } => "webrtc_answer",
			ClientEvent::WebrtcIce { .. } => "webrtc_ice",
			ClientEvent::MediaMute { .. } => "media_mute",
			ClientEvent::MediaVideo { .. } => "media_video",
			ClientEvent::MediaScreen { .. } => "media_screen",
			ClientEvent::ScreenShareStart { .. } => "screen_share_start",
			ClientEvent::ScreenShareStop { .. } => "screen_share_stop",
			ClientEvent::UploadInit { .. } => "upload_init",
			ClientEvent::UploadChunk { .. } => "upload_chunk",
			ClientEvent::UploadFinalize { .. } => "upload_finalize",
			ClientEvent::AiRequest { .. } => "ai_request",
		}
	}

	/// Discriminators accepted before the connection has authenticated.
	pub const PUBLIC_KINDS: &'static [&'static str] = &["register", "login", "auth", "ping"];

	pub fn is_public(&self) -> bool {
		Self::is_public_kind(self.kind())
	}

	/// Same as [`ClientEvent::is_public`], for frames whose fields failed to decode.
	pub fn is_public_kind(kind: &str) -> bool {
		Self::PUBLIC_KINDS.contains(&kind)
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
	#[error("invalid json: {0}")]
	InvalidJson(String),

	#[error("missing or non-string \"type\" field")]
	MissingType,

	#[error("unrecognized event type: {0}")]
	Unrecognized(String),

	#[error("invalid {kind} event: {reason}")]
	InvalidFields {
		kind: String,
		reason: String,
	},
}

/// Decode one inbound text frame into a typed event.
///
/// Unknown discriminators are reported separately from known events with bad fields.
pub fn decode_client_event(text: &str) -> Result<ClientEvent, DecodeError> {
	let value: Value = serde_json::from_str(text).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;

	let kind = match value.get("type") {
		Some(Value::String(kind)) => kind.clone(),
		_ => return Err(DecodeError::MissingType),
	};

	if !ClientEvent::KINDS.contains(&kind.as_str()) {
		return Err(DecodeError::Unrecognized(kind));
	}

	serde_json::from_value(value).map_err(|e| DecodeError::InvalidFields {
		kind,
		reason: e.to_string(),
	})
}

/// A chat line as delivered to room members (also used for history).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
	pub message_id: String,
	pub room_id: RoomId,
	pub user_id: UserId,
	pub username: String,
	pub content: String,
	pub timestamp: i64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message_type: Option<MediaKind>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub metadata: Option<Value>,
	/// Unix ms of the last edit.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub edited_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
	pub room_id: RoomId,
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub created_by: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
	pub user_id: UserId,
	pub username: String,
	pub connections: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
	pub user_id: UserId,
	pub muted: bool,
	pub video: bool,
	pub screen_sharing: bool,
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
	Welcome {
		session_id: String,
		server_time: i64,
		max_frame_bytes: u64,
		protocol_version: u32,
	},
	Pong {
		timestamp: i64,
	},
	Error {
		code: String,
		message: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		request_type: Option<String>,
	},

	RegisterResponse {
		success: bool,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		user_id: Option<UserId>,
		message: String,
	},
	LoginResponse {
		success: bool,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		user_id: Option<UserId>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		username: Option<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		token: Option<String>,
		message: String,
	},
	AuthResponse {
		success: bool,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		user_id: Option<UserId>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		username: Option<String>,
		message: String,
	},

	Chat(ChatMessage),
	MessageEdited {
		message_id: String,
		room_id: RoomId,
		user_id: UserId,
		new_content: String,
		edited_at: i64,
	},
	MessageDeleted {
		message_id: String,
		room_id: RoomId,
		user_id: UserId,
	},
	ReactionAdded {
		message_id: String,
		room_id: RoomId,
		user_id: UserId,
		username: String,
		emoji: String,
	},
	MessageRead {
		message_id: String,
		room_id: RoomId,
		read_by: UserId,
		username: String,
		timestamp: i64,
	},
	Typing {
		room_id: RoomId,
		user_id: UserId,
		username: String,
		is_typing: bool,
	},
	RoomJoined {
		room_id: RoomId,
		user_id: UserId,
		username: String,
		#[serde(default)]
		history: Vec<ChatMessage>,
	},
	RoomLeft {
		room_id: RoomId,
		user_id: UserId,
		username: String,
	},
	UserJoinedRoom {
		room_id: RoomId,
		user_id: UserId,
		username: String,
	},
	UserLeftRoom {
		room_id: RoomId,
		user_id: UserId,
		username: String,
	},
	RoomCreated {
		room_id: RoomId,
		name: String,
	},
	Rooms {
		rooms: Vec<RoomInfo>,
	},
	OnlineUsers {
		users: Vec<OnlineUser>,
		count: usize,
	},
	PresenceUpdate {
		user_id: UserId,
		username: String,
		status: String,
	},

	CallInitResponse {
		call_id: String,
		target_id: UserId,
		call_type: CallKind,
	},
	CallIncoming {
		call_id: String,
		caller_id: UserId,
		caller_name: String,
		call_type: CallKind,
	},
	CallAccepted {
		call_id: String,
		user_id: UserId,
		username: String,
	},
	CallRejected {
		call_id: String,
		user_id: UserId,
		reason: String,
	},
	CallEnded {
		call_id: String,
		ended_by: UserId,
		duration: u64,
		reason: String,
	},
	CallEndResponse {
		call_id: String,
		duration: u64,
	},
	CallStatus {
		call_id: String,
		state: CallState,
		call_type: CallKind,
		initiator_id: UserId,
		participants: Vec<ParticipantInfo>,
		created_at: i64,
		connected_at: i64,
	},
	WebrtcOffer {
		call_id: String,
		from: UserId,
		sdp: Value,
	},
	WebrtcAnswer {
		call_id: String,
		from: UserId,
		sdp: Value,
	},
	WebrtcIce {
		call_id: String,
		from: UserId,
		candidate: Value,
	},
	MediaMute {
		call_id: String,
		user_id: UserId,
		muted: bool,
	},
	MediaVideo {
		call_id: String,
		user_id: UserId,
		video: bool,
	},
	MediaScreen {
		call_id: String,
		user_id: UserId,
		sharing: bool,
	},

	UploadReady {
		upload_id: String,
		chunk_size: u64,
		total_chunks: u64,
	},
	UploadProgress {
		upload_id: String,
		chunks_received: u64,
		total_chunks: u64,
		progress: u32,
	},
	UploadComplete {
		upload_id: String,
		file_id: String,
		file_url: String,
		file_name: String,
		file_size: u64,
		mime_type: String,
		is_voice: bool,
	},
	UploadError {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		upload_id: Option<String>,
		code: String,
		message: String,
		recoverable: bool,
	},

	AiResponse {
		response: String,
	},
	AiError {
		message: String,
	},
}

impl ServerEvent {
	/// Serialize to the JSON text carried in one frame.
	pub fn to_json(&self) -> Result<String, serde_json::Error> {
		serde_json::to_string(self)
	}
}
