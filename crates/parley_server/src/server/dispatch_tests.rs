#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parley_domain::{CallKind, CallState, RoomId, Topic, UserId};
use parley_protocol::{ChatMessage, ServerEvent};
use parley_protocol::version::PROTOCOL_VERSION_U32;
use serde_json::json;
use tokio::sync::mpsc;

use crate::config::UploadSettings;
use crate::server::broker::{Broker, Payload};
use crate::server::completion::{CompletionError, TextCompletion};
use crate::server::context::ServerContext;
use crate::server::dispatch::Dispatcher;
use crate::server::outbox::{Outbox, publish_event};
use crate::server::registry::ConnectionHandle;
use crate::server::store::{RoomRecord, Store, StoreError, UserRecord};

struct EchoCompletion;

#[async_trait::async_trait]
impl TextCompletion for EchoCompletion {
	async fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
		Ok(format!("echo: {prompt}"))
	}
}

/// One in-process client: a registered connection and the receiving end of its outbox.
struct TestClient {
	handle: ConnectionHandle,
	subscriber: String,
	rx: mpsc::Receiver<Payload>,
}

impl TestClient {
	fn open(dispatcher: &Dispatcher, handle: u64) -> Self {
		let (outbox, rx) = Outbox::channel(256);
		let conn = dispatcher.open(ConnectionHandle(handle), outbox);
		Self {
			handle: conn.handle,
			subscriber: conn.subscriber_id(),
			rx,
		}
	}

	async fn send(&self, dispatcher: &Dispatcher, event: serde_json::Value) {
		dispatcher.dispatch(self.handle, &event.to_string()).await;
	}

	/// Everything queued so far.
	fn drain(&mut self) -> Vec<ServerEvent> {
		let mut out = Vec::new();
		while let Ok(payload) = self.rx.try_recv() {
			out.push(serde_json::from_str(&payload).expect("server event json"));
		}
		out
	}

	fn only(&mut self) -> ServerEvent {
		let mut events = self.drain();
		assert_eq!(events.len(), 1, "expected exactly one event, got: {events:?}");
		events.remove(0)
	}

	async fn next(&mut self) -> ServerEvent {
		let payload = tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
			.await
			.expect("timed out waiting for event")
			.expect("outbox closed");
		serde_json::from_str(&payload).expect("server event json")
	}
}

fn context(root: &std::path::Path) -> ServerContext {
	let uploads = UploadSettings {
		scratch_dir: root.join("temp"),
		storage_dir: root.join("files"),
		..UploadSettings::default()
	};
	ServerContext::in_memory(uploads, 64 * 1024).with_completion(Arc::new(EchoCompletion))
}

fn dispatcher(root: &std::path::Path) -> Dispatcher {
	Dispatcher::new(Arc::new(context(root)))
}

/// Register, log in and drop everything queued along the way.
async fn signed_in(d: &Dispatcher, handle: u64, name: &str) -> (TestClient, UserId) {
	let mut client = TestClient::open(d, handle);
	client
		.send(d, json!({ "type": "register", "username": name, "password": "hunter22" }))
		.await;
	client
		.send(d, json!({ "type": "login", "username": name, "password": "hunter22" }))
		.await;

	let user_id = client
		.drain()
		.into_iter()
		.find_map(|e| match e {
			ServerEvent::LoginResponse {
				success: true,
				user_id: Some(id),
				..
			} => Some(id),
			_ => None,
		})
		.expect("login succeeded");
	(client, user_id)
}

fn error_code(event: &ServerEvent) -> (&str, Option<&str>) {
	match event {
		ServerEvent::Error {
			code, request_type, ..
		} => (code.as_str(), request_type.as_deref()),
		other => panic!("expected Error, got: {other:?}"),
	}
}

#[tokio::test]
async fn open_sends_welcome() {
	let dir = tempfile::tempdir().expect("tempdir");
	let d = dispatcher(dir.path());
	let mut client = TestClient::open(&d, 1);

	match client.only() {
		ServerEvent::Welcome {
			protocol_version,
			max_frame_bytes,
			session_id,
			..
		} => {
			assert_eq!(protocol_version, PROTOCOL_VERSION_U32);
			assert_eq!(max_frame_bytes, 64 * 1024);
			assert!(!session_id.is_empty());
		}
		other => panic!("expected Welcome, got: {other:?}"),
	}
}

#[tokio::test]
async fn unauthenticated_connections_only_reach_public_events() {
	let dir = tempfile::tempdir().expect("tempdir");
	let d = dispatcher(dir.path());
	let mut client = TestClient::open(&d, 1);
	client.drain();

	client.send(&d, json!({ "type": "chat", "content": "hi" })).await;
	assert_eq!(error_code(&client.only()), ("unauthenticated", Some("chat")));

	// Bad fields on a private type still hit the gate first.
	client.send(&d, json!({ "type": "chat" })).await;
	assert_eq!(error_code(&client.only()), ("unauthenticated", Some("chat")));
	client.send(&d, json!({ "type": "call_init", "targetId": 7 })).await;
	assert_eq!(error_code(&client.only()), ("unauthenticated", Some("call_init")));

	// Public types are validated as usual.
	client.send(&d, json!({ "type": "login" })).await;
	assert_eq!(error_code(&client.only()), ("validation_error", Some("login")));

	client.send(&d, json!({ "type": "ping" })).await;
	assert!(matches!(client.only(), ServerEvent::Pong { .. }));
}

#[tokio::test]
async fn malformed_frames_become_error_frames() {
	let dir = tempfile::tempdir().expect("tempdir");
	let d = dispatcher(dir.path());
	let (mut client, _) = signed_in(&d, 1, "alice").await;

	client.send(&d, json!({ "type": "teleport", "to": "mars" })).await;
	assert_eq!(error_code(&client.only()), ("unrecognized_event", Some("teleport")));

	client.send(&d, json!({ "type": "join_room" })).await;
	assert_eq!(error_code(&client.only()), ("validation_error", Some("join_room")));

	d.dispatch(client.handle, "{not json").await;
	assert_eq!(error_code(&client.only()), ("validation_error", None));

	// The connection keeps working afterwards.
	client.send(&d, json!({ "type": "ping" })).await;
	assert!(matches!(client.only(), ServerEvent::Pong { .. }));
}

#[tokio::test]
async fn auth_failures_are_answered_in_band() {
	let dir = tempfile::tempdir().expect("tempdir");
	let d = dispatcher(dir.path());
	let (_alice, _) = signed_in(&d, 1, "alice").await;

	let mut client = TestClient::open(&d, 2);
	client.drain();
	client
		.send(&d, json!({ "type": "register", "username": "alice", "password": "hunter22" }))
		.await;
	assert!(matches!(client.only(), ServerEvent::RegisterResponse { success: false, .. }));

	client
		.send(&d, json!({ "type": "login", "username": "alice", "password": "wrong-password" }))
		.await;
	assert!(matches!(client.only(), ServerEvent::LoginResponse { success: false, token: None, .. }));

	client.send(&d, json!({ "type": "auth", "token": "v1.garbage.sig" })).await;
	assert!(matches!(client.only(), ServerEvent::AuthResponse { success: false, .. }));

	client.send(&d, json!({ "type": "get_rooms" })).await;
	assert_eq!(error_code(&client.only()), ("unauthenticated", Some("get_rooms")));
}

#[tokio::test]
async fn token_resumes_session_on_new_connection() {
	let dir = tempfile::tempdir().expect("tempdir");
	let d = dispatcher(dir.path());

	let mut first = TestClient::open(&d, 1);
	first
		.send(&d, json!({ "type": "register", "username": "alice", "password": "hunter22" }))
		.await;
	first
		.send(&d, json!({ "type": "login", "username": "alice", "password": "hunter22" }))
		.await;
	let token = first
		.drain()
		.into_iter()
		.find_map(|e| match e {
			ServerEvent::LoginResponse { token: Some(t), .. } => Some(t),
			_ => None,
		})
		.expect("token issued");

	let mut second = TestClient::open(&d, 2);
	second.drain();
	second.send(&d, json!({ "type": "auth", "token": token })).await;
	match second.only() {
		ServerEvent::AuthResponse {
			success: true,
			username,
			..
		} => assert_eq!(username.as_deref(), Some("alice")),
		other => panic!("expected AuthResponse, got: {other:?}"),
	}

	second.send(&d, json!({ "type": "get_online_users" })).await;
	match second.only() {
		ServerEvent::OnlineUsers { users, count } => {
			assert_eq!(count, 1);
			assert_eq!(users[0].connections, 2);
		}
		other => panic!("expected OnlineUsers, got: {other:?}"),
	}
}

#[tokio::test]
async fn chat_reaches_room_members_only() {
	let dir = tempfile::tempdir().expect("tempdir");
	let d = dispatcher(dir.path());
	let (mut a, alice) = signed_in(&d, 1, "alice").await;
	let (mut b, _) = signed_in(&d, 2, "bob").await;
	let (mut c, _) = signed_in(&d, 3, "carol").await;

	a.send(&d, json!({ "type": "join_room", "roomId": "lobby" })).await;
	b.send(&d, json!({ "type": "join_room", "roomId": "lobby" })).await;
	c.send(&d, json!({ "type": "join_room", "roomId": "dev" })).await;
	assert!(
		a.drain()
			.iter()
			.any(|e| matches!(e, ServerEvent::UserJoinedRoom { username, .. } if username == "bob"))
	);
	b.drain();
	c.drain();

	a.send(&d, json!({ "type": "chat", "content": "hello lobby" })).await;
	for client in [&mut a, &mut b] {
		match client.only() {
			ServerEvent::Chat(msg) => {
				assert_eq!(msg.room_id.as_str(), "lobby");
				assert_eq!(msg.user_id, alice);
				assert_eq!(msg.content, "hello lobby");
				assert!(msg.message_id.starts_with("msg_"));
			}
			other => panic!("expected Chat, got: {other:?}"),
		}
	}
	assert!(c.drain().is_empty(), "outsider received room traffic");

	// Late joiners get the room history.
	c.send(&d, json!({ "type": "join_room", "roomId": "lobby" })).await;
	let joined = c
		.drain()
		.into_iter()
		.find_map(|e| match e {
			ServerEvent::RoomJoined { history, .. } => Some(history),
			_ => None,
		})
		.expect("room_joined");
	assert_eq!(joined.len(), 1);
	assert_eq!(joined[0].content, "hello lobby");

	// Bob stays subscribed and sees Carol arrive.
	assert!(
		b.drain()
			.iter()
			.any(|e| matches!(e, ServerEvent::UserJoinedRoom { username, .. } if username == "carol"))
	);
}

#[tokio::test]
async fn typing_skips_sender_and_needs_a_room() {
	let dir = tempfile::tempdir().expect("tempdir");
	let d = dispatcher(dir.path());
	let (mut a, _) = signed_in(&d, 1, "alice").await;
	let (mut b, _) = signed_in(&d, 2, "bob").await;

	a.send(&d, json!({ "type": "typing" })).await;
	assert_eq!(error_code(&a.only()), ("validation_error", Some("typing")));

	a.send(&d, json!({ "type": "join_room", "roomId": "lobby" })).await;
	b.send(&d, json!({ "type": "join_room", "roomId": "lobby" })).await;
	a.drain();
	b.drain();

	a.send(&d, json!({ "type": "typing", "isTyping": true })).await;
	assert!(a.drain().is_empty());
	assert!(matches!(b.only(), ServerEvent::Typing { is_typing: true, .. }));
}

#[tokio::test]
async fn call_flow_reaches_connected() {
	let dir = tempfile::tempdir().expect("tempdir");
	let d = dispatcher(dir.path());
	let (mut a, alice) = signed_in(&d, 1, "alice").await;
	let (mut b, bob) = signed_in(&d, 2, "bob").await;
	a.drain();

	a.send(&d, json!({ "type": "call_init", "targetId": bob, "callType": "video" }))
		.await;
	let call_id = match a.only() {
		ServerEvent::CallInitResponse { call_id, call_type, .. } => {
			assert_eq!(call_type, CallKind::Video);
			call_id
		}
		other => panic!("expected CallInitResponse, got: {other:?}"),
	};
	assert!(matches!(b.only(), ServerEvent::CallIncoming { caller_id, .. } if caller_id == alice));

	b.send(&d, json!({ "type": "call_accept", "callId": call_id })).await;
	assert!(matches!(b.only(), ServerEvent::CallStatus { state: CallState::Connecting, .. }));
	assert!(matches!(a.only(), ServerEvent::CallAccepted { user_id, .. } if user_id == bob));

	a.send(
		&d,
		json!({ "type": "webrtc_offer", "callId": call_id, "targetId": bob, "sdp": { "type": "offer", "sdp": "v=0" } }),
	)
	.await;
	match b.only() {
		ServerEvent::WebrtcOffer { from, sdp, .. } => {
			assert_eq!(from, alice);
			assert_eq!(sdp["sdp"], "v=0");
		}
		other => panic!("expected WebrtcOffer, got: {other:?}"),
	}

	b.send(
		&d,
		json!({ "type": "webrtc_answer", "callId": call_id, "targetUserId": alice, "sdp": "answer" }),
	)
	.await;
	assert!(matches!(a.only(), ServerEvent::WebrtcAnswer { from, .. } if from == bob));

	a.send(&d, json!({ "type": "call_status", "callId": call_id })).await;
	match a.only() {
		ServerEvent::CallStatus {
			state,
			participants,
			connected_at,
			..
		} => {
			assert_eq!(state, CallState::Connected);
			assert_eq!(participants.len(), 2);
			assert!(connected_at > 0);
		}
		other => panic!("expected CallStatus, got: {other:?}"),
	}

	a.send(&d, json!({ "type": "media_mute", "callId": call_id })).await;
	assert!(matches!(a.only(), ServerEvent::MediaMute { muted: true, .. }));
	assert!(matches!(b.only(), ServerEvent::MediaMute { muted: true, .. }));

	b.send(&d, json!({ "type": "call_end", "callId": call_id })).await;
	assert!(matches!(b.only(), ServerEvent::CallEndResponse { .. }));
	assert!(matches!(a.only(), ServerEvent::CallEnded { ended_by, .. } if ended_by == bob));
}

#[tokio::test]
async fn call_errors_map_to_codes() {
	let dir = tempfile::tempdir().expect("tempdir");
	let d = dispatcher(dir.path());
	let (mut a, _) = signed_in(&d, 1, "alice").await;
	let (mut b, bob) = signed_in(&d, 2, "bob").await;
	a.drain();

	a.send(&d, json!({ "type": "call_init", "targetId": "nobody" })).await;
	assert_eq!(error_code(&a.only()), ("not_found", Some("call_init")));

	a.send(&d, json!({ "type": "call_init", "targetId": bob })).await;
	a.drain();
	b.drain();
	a.send(&d, json!({ "type": "call_init", "targetId": bob })).await;
	assert_eq!(error_code(&a.only()), ("conflict", Some("call_init")));

	b.send(&d, json!({ "type": "call_accept", "callId": "call_unknown" })).await;
	assert_eq!(error_code(&b.only()), ("not_found", Some("call_accept")));
}

#[tokio::test]
async fn disconnect_ends_calls_and_announces_offline() {
	let dir = tempfile::tempdir().expect("tempdir");
	let d = dispatcher(dir.path());
	let (mut a, alice) = signed_in(&d, 1, "alice").await;
	let (mut b, bob) = signed_in(&d, 2, "bob").await;
	a.drain();

	a.send(&d, json!({ "type": "call_init", "targetId": bob })).await;
	let call_id = match a.only() {
		ServerEvent::CallInitResponse { call_id, .. } => call_id,
		other => panic!("expected CallInitResponse, got: {other:?}"),
	};
	b.send(&d, json!({ "type": "call_accept", "callId": call_id })).await;
	a.send(&d, json!({ "type": "upload_init", "uploadId": "pending", "fileSize": 10 }))
		.await;
	a.drain();
	b.drain();

	d.close(a.handle).await;

	let events = b.drain();
	assert!(
		events
			.iter()
			.any(|e| matches!(e, ServerEvent::CallEnded { reason, ended_by, .. } if reason == "disconnected" && ended_by == &alice)),
		"got: {events:?}"
	);
	assert!(
		events
			.iter()
			.any(|e| matches!(e, ServerEvent::PresenceUpdate { status, user_id, .. } if status == "offline" && user_id == &alice))
	);

	let ctx = d.context();
	assert!(ctx.calls.is_empty());
	assert!(ctx.uploads.is_empty());
	assert!(!ctx.registry.is_online(&alice));
	assert!(ctx.broker.topics_for(&a.subscriber).is_empty());
}

#[tokio::test]
async fn upload_errors_use_upload_frames() {
	let dir = tempfile::tempdir().expect("tempdir");
	let d = dispatcher(dir.path());
	let (mut a, _) = signed_in(&d, 1, "alice").await;
	a.drain();

	a.send(&d, json!({ "type": "upload_finalize", "uploadId": "ghost" })).await;
	match a.only() {
		ServerEvent::UploadError {
			upload_id,
			code,
			recoverable,
			..
		} => {
			assert_eq!(upload_id.as_deref(), Some("ghost"));
			assert_eq!(code, "not_found");
			assert!(!recoverable);
		}
		other => panic!("expected UploadError, got: {other:?}"),
	}

	a.send(
		&d,
		json!({ "type": "upload_init", "uploadId": "doc", "fileName": "a.bin", "fileSize": 3, "chunkSize": 2 }),
	)
	.await;
	assert!(matches!(a.only(), ServerEvent::UploadReady { total_chunks: 2, .. }));

	a.send(&d, json!({ "type": "upload_chunk", "uploadId": "doc", "chunkIndex": 0, "chunkData": "YWI=" }))
		.await;
	assert!(matches!(a.only(), ServerEvent::UploadProgress { progress: 50, .. }));

	a.send(&d, json!({ "type": "upload_finalize", "uploadId": "doc" })).await;
	assert!(matches!(
		a.only(),
		ServerEvent::UploadError { recoverable: true, ref code, .. } if code == "invalid_state"
	));

	a.send(&d, json!({ "type": "upload_chunk", "uploadId": "doc", "chunkIndex": 1, "chunkData": "Yw==" }))
		.await;
	a.drain();
	a.send(&d, json!({ "type": "upload_finalize", "uploadId": "doc" })).await;
	match a.only() {
		ServerEvent::UploadComplete {
			file_size, is_voice, ..
		} => {
			assert_eq!(file_size, 3);
			assert!(!is_voice);
		}
		other => panic!("expected UploadComplete, got: {other:?}"),
	}
}

#[tokio::test]
async fn ai_request_replies_asynchronously() {
	let dir = tempfile::tempdir().expect("tempdir");
	let d = dispatcher(dir.path());
	let (mut a, _) = signed_in(&d, 1, "alice").await;
	a.drain();

	a.send(&d, json!({ "type": "ai_request", "message": "  hello  " })).await;
	match a.next().await {
		ServerEvent::AiResponse { response } => assert_eq!(response, "echo: hello"),
		other => panic!("expected AiResponse, got: {other:?}"),
	}

	a.send(&d, json!({ "type": "ai_request", "message": "   " })).await;
	assert_eq!(error_code(&a.only()), ("validation_error", Some("ai_request")));
}

/// Posts a chat line and publishes it live while the history of `room` is being read,
/// so the line lands both in the snapshot and in the joiner's subscription.
struct PublishDuringHistory {
	inner: Arc<dyn Store>,
	broker: Arc<Broker>,
	msg: ChatMessage,
}

#[async_trait::async_trait]
impl Store for PublishDuringHistory {
	async fn create_user(&self, username: &str, email: Option<&str>, password_hash: &str) -> Result<UserRecord, StoreError> {
		self.inner.create_user(username, email, password_hash).await
	}

	async fn find_user_by_name(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
		self.inner.find_user_by_name(username).await
	}

	async fn create_room(&self, room: &RoomId, name: &str, created_by: Option<&UserId>) -> Result<RoomRecord, StoreError> {
		self.inner.create_room(room, name, created_by).await
	}

	async fn list_rooms(&self) -> Result<Vec<RoomRecord>, StoreError> {
		self.inner.list_rooms().await
	}

	async fn add_message(&self, msg: &ChatMessage) -> Result<(), StoreError> {
		self.inner.add_message(msg).await
	}

	async fn recent_messages(&self, room: &RoomId, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
		if room == &self.msg.room_id {
			self.inner.add_message(&self.msg).await?;
			publish_event(&self.broker, &Topic::room(room), &ServerEvent::Chat(self.msg.clone()), None);
		}
		self.inner.recent_messages(room, limit).await
	}

	async fn find_message(&self, message_id: &str) -> Result<Option<ChatMessage>, StoreError> {
		self.inner.find_message(message_id).await
	}

	async fn edit_message(&self, message_id: &str, content: &str, edited_at: i64) -> Result<bool, StoreError> {
		self.inner.edit_message(message_id, content, edited_at).await
	}

	async fn delete_message(&self, message_id: &str, deleted_at: i64) -> Result<bool, StoreError> {
		self.inner.delete_message(message_id, deleted_at).await
	}

	async fn add_reaction(&self, message_id: &str, user: &UserId, emoji: &str) -> Result<bool, StoreError> {
		self.inner.add_reaction(message_id, user, emoji).await
	}

	async fn mark_read(&self, message_id: &str, user: &UserId, read_at: i64) -> Result<(), StoreError> {
		self.inner.mark_read(message_id, user, read_at).await
	}
}

#[tokio::test]
async fn join_does_not_repeat_history_as_live_traffic() {
	let dir = tempfile::tempdir().expect("tempdir");
	let mut ctx = context(dir.path());
	let lobby = RoomId::new("lobby").expect("room");
	let racing = ChatMessage {
		message_id: "msg_racing".to_string(),
		room_id: lobby.clone(),
		user_id: UserId::new("user_other").expect("user"),
		username: "zoe".to_string(),
		content: "just in time".to_string(),
		timestamp: 1,
		message_type: None,
		metadata: None,
		edited_at: None,
	};
	ctx.store = Arc::new(PublishDuringHistory {
		inner: Arc::clone(&ctx.store),
		broker: Arc::clone(&ctx.broker),
		msg: racing,
	});
	let d = Dispatcher::new(Arc::new(ctx));
	let (mut a, _) = signed_in(&d, 1, "alice").await;

	a.send(&d, json!({ "type": "join_room", "roomId": "lobby" })).await;
	let events = a.drain();
	let history = events
		.iter()
		.find_map(|e| match e {
			ServerEvent::RoomJoined { history, .. } => Some(history),
			_ => None,
		})
		.expect("room_joined");
	assert_eq!(history.iter().map(|m| m.message_id.as_str()).collect::<Vec<_>>(), vec!["msg_racing"]);
	assert!(
		!events.iter().any(|e| matches!(e, ServerEvent::Chat(_))),
		"history line delivered again: {events:?}"
	);

	// Later traffic is forwarded directly.
	a.send(&d, json!({ "type": "chat", "content": "after" })).await;
	assert!(matches!(a.only(), ServerEvent::Chat(msg) if msg.content == "after"));
}

/// Id of the single chat line `client` has queued.
fn chat_id(client: &mut TestClient) -> String {
	match client.only() {
		ServerEvent::Chat(msg) => msg.message_id,
		other => panic!("expected Chat, got: {other:?}"),
	}
}

#[tokio::test]
async fn message_edits_and_deletes_reach_the_room() {
	let dir = tempfile::tempdir().expect("tempdir");
	let d = dispatcher(dir.path());
	let (mut a, alice) = signed_in(&d, 1, "alice").await;
	let (mut b, bob) = signed_in(&d, 2, "bob").await;

	a.send(&d, json!({ "type": "create_room", "roomId": "dev", "name": "Dev" })).await;
	a.send(&d, json!({ "type": "join_room", "roomId": "dev" })).await;
	b.send(&d, json!({ "type": "join_room", "roomId": "dev" })).await;
	a.drain();
	b.drain();

	b.send(&d, json!({ "type": "chat", "content": "teh build is green" })).await;
	let id = chat_id(&mut a);
	assert_eq!(chat_id(&mut b), id);

	a.send(&d, json!({ "type": "edit_message", "messageId": id, "newContent": "nope" })).await;
	assert_eq!(error_code(&a.only()), ("unauthorized", Some("edit_message")));

	b.send(&d, json!({ "type": "edit_message", "messageId": id, "content": "   " })).await;
	assert_eq!(error_code(&b.only()), ("validation_error", Some("edit_message")));

	b.send(&d, json!({ "type": "edit_message", "messageId": id, "content": "the build is green" })).await;
	for client in [&mut a, &mut b] {
		match client.only() {
			ServerEvent::MessageEdited {
				message_id,
				new_content,
				user_id,
				..
			} => {
				assert_eq!(message_id, id);
				assert_eq!(new_content, "the build is green");
				assert_eq!(user_id, bob);
			}
			other => panic!("expected MessageEdited, got: {other:?}"),
		}
	}

	// The room creator may remove anyone's message.
	a.send(&d, json!({ "type": "delete_message", "messageId": id })).await;
	for client in [&mut a, &mut b] {
		match client.only() {
			ServerEvent::MessageDeleted { message_id, user_id, .. } => {
				assert_eq!(message_id, id);
				assert_eq!(user_id, alice);
			}
			other => panic!("expected MessageDeleted, got: {other:?}"),
		}
	}

	b.send(&d, json!({ "type": "delete_message", "messageId": id })).await;
	assert_eq!(error_code(&b.only()), ("not_found", Some("delete_message")));

	// Neither author nor creator.
	a.send(&d, json!({ "type": "chat", "content": "mine" })).await;
	let mine = chat_id(&mut a);
	b.drain();
	let (mut c, _) = signed_in(&d, 3, "carol").await;
	c.send(&d, json!({ "type": "delete_message", "messageId": mine })).await;
	assert_eq!(error_code(&c.only()), ("unauthorized", Some("delete_message")));

	c.send(&d, json!({ "type": "join_room", "roomId": "dev" })).await;
	let history = c
		.drain()
		.into_iter()
		.find_map(|e| match e {
			ServerEvent::RoomJoined { history, .. } => Some(history),
			_ => None,
		})
		.expect("room_joined");
	assert_eq!(history.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(), vec!["mine"]);
}

#[tokio::test]
async fn reactions_and_read_receipts_fan_out() {
	let dir = tempfile::tempdir().expect("tempdir");
	let d = dispatcher(dir.path());
	let (mut a, _) = signed_in(&d, 1, "alice").await;
	let (mut b, bob) = signed_in(&d, 2, "bob").await;

	a.send(&d, json!({ "type": "join_room", "roomId": "lobby" })).await;
	b.send(&d, json!({ "type": "join_room", "roomId": "lobby" })).await;
	a.drain();
	b.drain();

	a.send(&d, json!({ "type": "chat", "content": "ship it?" })).await;
	let id = chat_id(&mut a);
	b.drain();

	b.send(&d, json!({ "type": "add_reaction", "messageId": id, "emoji": "👍" })).await;
	for client in [&mut a, &mut b] {
		match client.only() {
			ServerEvent::ReactionAdded {
				message_id,
				user_id,
				emoji,
				room_id,
				..
			} => {
				assert_eq!(message_id, id);
				assert_eq!(user_id, bob);
				assert_eq!(emoji, "👍");
				assert_eq!(room_id.as_str(), "lobby");
			}
			other => panic!("expected ReactionAdded, got: {other:?}"),
		}
	}

	b.send(&d, json!({ "type": "add_reaction", "messageId": id, "emoji": "👍" })).await;
	assert_eq!(error_code(&b.only()), ("conflict", Some("add_reaction")));
	assert!(a.drain().is_empty());

	b.send(&d, json!({ "type": "mark_read", "messageId": id })).await;
	for client in [&mut a, &mut b] {
		match client.only() {
			ServerEvent::MessageRead {
				message_id, read_by, ..
			} => {
				assert_eq!(message_id, id);
				assert_eq!(read_by, bob);
			}
			other => panic!("expected MessageRead, got: {other:?}"),
		}
	}

	b.send(&d, json!({ "type": "mark_read", "messageId": "msg_missing" })).await;
	assert_eq!(error_code(&b.only()), ("not_found", Some("mark_read")));
}
