#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use parley_domain::{MediaKind, RoomId, Topic, UserId};
use parley_protocol::ServerEvent;
use proptest::prelude::*;

use crate::config::UploadSettings;
use crate::server::broker::{Broker, Delivery};
use crate::server::uploads::{UploadError, UploadManager, UploadMeta};

fn user(id: &str) -> UserId {
	UserId::new(id).expect("valid UserId")
}

fn settings(root: &std::path::Path) -> UploadSettings {
	UploadSettings {
		scratch_dir: root.join("temp"),
		storage_dir: root.join("files"),
		public_base_url: "https://files.test".to_string(),
		default_chunk_size: 4,
		max_file_bytes: 64,
		max_chunks: 16,
		..UploadSettings::default()
	}
}

fn manager(root: &std::path::Path) -> UploadManager {
	UploadManager::new(Arc::new(Broker::new()), settings(root))
}

fn b64(bytes: &[u8]) -> String {
	STANDARD.encode(bytes)
}

fn meta(upload_id: &str, file_size: u64, total_chunks: u64) -> UploadMeta {
	UploadMeta {
		upload_id: Some(upload_id.to_string()),
		file_name: Some("notes.TXT".to_string()),
		file_size,
		mime_type: Some("text/plain".to_string()),
		chunk_size: Some(4),
		total_chunks: Some(total_chunks),
		room: None,
	}
}

#[tokio::test]
async fn chunks_assemble_in_index_order() {
	let dir = tempfile::tempdir().expect("tempdir");
	let uploads = manager(dir.path());
	let alice = user("alice");

	let ticket = uploads.init_upload(&alice, meta("up1", 10, 3)).await.expect("init");
	assert_eq!(ticket.upload_id, "up1");
	assert_eq!(ticket.total_chunks, 3);

	uploads.receive_chunk("up1", 2, &b64(b"89"), Some(3), &alice).await.expect("chunk 2");
	uploads.receive_chunk("up1", 0, &b64(b"0123"), None, &alice).await.expect("chunk 0");
	let progress = uploads.receive_chunk("up1", 1, &b64(b"4567"), None, &alice).await.expect("chunk 1");
	assert_eq!(progress.chunks_received, 3);
	assert_eq!(progress.progress, 100);

	let stored = uploads.finalize("up1", &alice, "Alice").await.expect("finalize");
	assert_eq!(stored.file_size, 10);
	assert_eq!(stored.kind, MediaKind::File);
	assert!(stored.url.starts_with("https://files.test/uploads/file_"));
	assert!(stored.url.ends_with(".txt"));
	assert!(stored.announcement.is_none());
	assert_eq!(std::fs::read(&stored.path).expect("stored file"), b"0123456789");

	assert!(uploads.is_empty());
	assert!(!dir.path().join("temp").join("up1").exists(), "scratch dir removed");
}

#[tokio::test]
async fn duplicate_chunk_counts_once() {
	let dir = tempfile::tempdir().expect("tempdir");
	let uploads = manager(dir.path());
	let alice = user("alice");
	uploads.init_upload(&alice, meta("dup", 8, 2)).await.expect("init");

	uploads.receive_chunk("dup", 0, &b64(b"aaaa"), None, &alice).await.expect("first");
	let progress = uploads.receive_chunk("dup", 0, &b64(b"bbbb"), None, &alice).await.expect("resend");
	assert_eq!(progress.chunks_received, 1);
	assert_eq!(progress.progress, 50);

	uploads.receive_chunk("dup", 1, &b64(b"cccc"), None, &alice).await.expect("second");
	let stored = uploads.finalize("dup", &alice, "Alice").await.expect("finalize");
	assert_eq!(std::fs::read(&stored.path).expect("stored file"), b"bbbbcccc", "last write wins");
}

#[tokio::test]
async fn incomplete_finalize_keeps_session_for_retry() {
	let dir = tempfile::tempdir().expect("tempdir");
	let uploads = manager(dir.path());
	let alice = user("alice");
	uploads.init_upload(&alice, meta("gap", 8, 2)).await.expect("init");
	uploads.receive_chunk("gap", 0, &b64(b"abcd"), None, &alice).await.expect("chunk 0");

	match uploads.finalize("gap", &alice, "Alice").await {
		Err(e @ UploadError::Incomplete { received: 1, total: 2 }) => assert!(e.recoverable()),
		other => panic!("expected Incomplete, got: {other:?}"),
	}
	assert_eq!(uploads.len(), 1);

	uploads.receive_chunk("gap", 1, &b64(b"efgh"), None, &alice).await.expect("chunk 1");
	uploads.finalize("gap", &alice, "Alice").await.expect("finalize after retry");
}

#[tokio::test]
async fn chunk_validation_errors() {
	let dir = tempfile::tempdir().expect("tempdir");
	let uploads = manager(dir.path());
	let (alice, mallory) = (user("alice"), user("mallory"));
	uploads.init_upload(&alice, meta("v", 8, 2)).await.expect("init");

	match uploads.receive_chunk("v", 2, &b64(b"x"), None, &alice).await {
		Err(UploadError::InvalidChunk(msg)) => assert!(msg.contains("out of range")),
		other => panic!("expected InvalidChunk, got: {other:?}"),
	}
	match uploads.receive_chunk("v", 0, &b64(b"x"), Some(5), &alice).await {
		Err(UploadError::InvalidChunk(msg)) => assert!(msg.contains("totalChunks")),
		other => panic!("expected InvalidChunk, got: {other:?}"),
	}
	match uploads.receive_chunk("v", 0, "%%not base64%%", None, &alice).await {
		Err(e @ UploadError::InvalidChunk(_)) => assert!(e.recoverable()),
		other => panic!("expected InvalidChunk, got: {other:?}"),
	}
	match uploads.receive_chunk("v", 0, &b64(b"too long"), None, &alice).await {
		Err(UploadError::InvalidChunk(msg)) => assert!(msg.contains("exceeds chunk size")),
		other => panic!("expected InvalidChunk, got: {other:?}"),
	}
	match uploads.receive_chunk("v", 0, &b64(b"abcd"), None, &mallory).await {
		Err(UploadError::Unauthorized) => {}
		other => panic!("expected Unauthorized, got: {other:?}"),
	}
	match uploads.receive_chunk("missing", 0, &b64(b"abcd"), None, &alice).await {
		Err(UploadError::NotFound(id)) => assert_eq!(id, "missing"),
		other => panic!("expected NotFound, got: {other:?}"),
	}
}

#[tokio::test]
async fn init_enforces_limits_and_unique_ids() {
	let dir = tempfile::tempdir().expect("tempdir");
	let uploads = manager(dir.path());
	let alice = user("alice");

	assert!(matches!(
		uploads.init_upload(&alice, meta("big", 65, 17)).await,
		Err(UploadError::ResourceExhausted(_))
	));
	assert!(matches!(
		uploads.init_upload(&alice, meta("many", 8, 17)).await,
		Err(UploadError::ResourceExhausted(_))
	));
	assert!(matches!(
		uploads.init_upload(&alice, meta("../escape", 8, 2)).await,
		Err(UploadError::Validation(_))
	));
	assert!(matches!(
		uploads.init_upload(&alice, meta("zero", 8, 0)).await,
		Err(UploadError::Validation(_))
	));

	uploads.init_upload(&alice, meta("same", 8, 2)).await.expect("init");
	assert!(matches!(
		uploads.init_upload(&alice, meta("same", 8, 2)).await,
		Err(UploadError::Conflict(_))
	));

	// Missing id and totals are filled in by the server.
	let ticket = uploads
		.init_upload(
			&alice,
			UploadMeta {
				file_size: 9,
				..UploadMeta::default()
			},
		)
		.await
		.expect("init with defaults");
	assert!(ticket.upload_id.starts_with("upload_"));
	assert_eq!(ticket.chunk_size, 4);
	assert_eq!(ticket.total_chunks, 3);
}

#[tokio::test]
async fn finalize_announces_to_target_room() {
	let dir = tempfile::tempdir().expect("tempdir");
	let broker = Arc::new(Broker::new());
	let uploads = UploadManager::new(Arc::clone(&broker), settings(dir.path()));
	let alice = user("alice");
	let room = RoomId::new("lobby").expect("room");

	let seen = Arc::new(Mutex::new(Vec::new()));
	let sink = Arc::clone(&seen);
	broker.subscribe(
		"watcher",
		&Topic::room(&room),
		Arc::new(move |d: &Delivery| {
			let ev: ServerEvent = serde_json::from_str(&d.payload).expect("server event json");
			sink.lock().push(ev);
		}),
	);

	let mut voice = meta("voice1", 4, 1);
	voice.mime_type = Some("audio/webm".to_string());
	voice.room = Some(room.clone());
	uploads.init_upload(&alice, voice).await.expect("init");
	uploads.receive_chunk("voice1", 0, &b64(b"opus"), None, &alice).await.expect("chunk");
	let stored = uploads.finalize("voice1", &alice, "Alice").await.expect("finalize");
	assert_eq!(stored.kind, MediaKind::Voice);

	match seen.lock().as_slice() {
		[ServerEvent::Chat(msg)] => {
			assert_eq!(msg.room_id, room);
			assert_eq!(msg.content, "Voice message");
			assert_eq!(msg.message_type, Some(MediaKind::Voice));
			let metadata = msg.metadata.as_ref().expect("metadata");
			assert_eq!(metadata["fileId"], stored.file_id.as_str());
			assert_eq!(metadata["fileSize"], 4);
		}
		other => panic!("expected Chat announcement, got: {other:?}"),
	}
}

#[tokio::test]
async fn cancel_and_reap_remove_sessions() {
	let dir = tempfile::tempdir().expect("tempdir");
	let uploads = manager(dir.path());
	let (alice, bob) = (user("alice"), user("bob"));
	uploads.init_upload(&alice, meta("a1", 8, 2)).await.expect("init");
	uploads.init_upload(&alice, meta("a2", 8, 2)).await.expect("init");
	uploads.init_upload(&bob, meta("b1", 8, 2)).await.expect("init");

	assert_eq!(uploads.cancel_for_owner(&alice).await, 2);
	assert_eq!(uploads.cancel_for_owner(&alice).await, 0);
	assert!(!dir.path().join("temp").join("a1").exists());
	assert_eq!(uploads.len(), 1);

	assert!(uploads.reap_expired(Duration::from_secs(3600)).await.is_empty());
	assert_eq!(uploads.reap_expired(Duration::ZERO).await, vec!["b1".to_string()]);
	assert!(uploads.is_empty());
}

proptest! {
	#![proptest_config(ProptestConfig::with_cases(24))]

	#[test]
	fn any_arrival_order_reassembles_the_file(
		data in proptest::collection::vec(any::<u8>(), 1..48),
		seed in any::<u64>(),
	) {
		let rt = tokio::runtime::Builder::new_current_thread()
			.enable_all()
			.build()
			.expect("runtime");
		let dir = tempfile::tempdir().expect("tempdir");
		let uploads = manager(dir.path());
		let alice = user("alice");

		let chunks = data.chunks(4).map(<[u8]>::to_vec).collect::<Vec<_>>();
		let total = chunks.len() as u64;
		let mut order = (0..chunks.len()).collect::<Vec<_>>();
		// Deterministic shuffle driven by the seed.
		let mut state = seed | 1;
		for i in (1..order.len()).rev() {
			state ^= state << 13;
			state ^= state >> 7;
			state ^= state << 17;
			order.swap(i, (state % (i as u64 + 1)) as usize);
		}

		let assembled = rt.block_on(async {
			uploads
				.init_upload(&alice, meta("prop", data.len() as u64, total))
				.await
				.expect("init");
			for &index in &order {
				uploads
					.receive_chunk("prop", index as u64, &b64(&chunks[index]), Some(total), &alice)
					.await
					.expect("chunk");
			}
			let stored = uploads.finalize("prop", &alice, "Alice").await.expect("finalize");
			std::fs::read(&stored.path).expect("stored file")
		});

		prop_assert_eq!(assembled, data);
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finalize_never_reads_a_chunk_mid_write() {
	const CHUNK: u64 = 1 << 20;
	let dir = tempfile::tempdir().expect("tempdir");
	let uploads = Arc::new(UploadManager::new(
		Arc::new(Broker::new()),
		UploadSettings {
			default_chunk_size: CHUNK,
			max_file_bytes: CHUNK,
			max_chunks: 4,
			..settings(dir.path())
		},
	));
	let alice = user("alice");
	let data = (0..CHUNK).map(|i| (i % 251) as u8).collect::<Vec<_>>();
	let encoded = b64(&data);

	for round in 0u64..40 {
		let id = format!("race{round}");
		uploads
			.init_upload(
				&alice,
				UploadMeta {
					upload_id: Some(id.clone()),
					file_size: CHUNK,
					chunk_size: Some(CHUNK),
					total_chunks: Some(1),
					..UploadMeta::default()
				},
			)
			.await
			.expect("init");
		uploads.receive_chunk(&id, 0, &encoded, None, &alice).await.expect("first write");

		// Another device resends the same chunk while this one finalizes.
		let resend = {
			let (uploads, id, encoded, alice) = (Arc::clone(&uploads), id.clone(), encoded.clone(), alice.clone());
			tokio::spawn(async move { uploads.receive_chunk(&id, 0, &encoded, None, &alice).await })
		};
		tokio::time::sleep(Duration::from_micros(round * 50)).await;

		loop {
			match uploads.finalize(&id, &alice, "Alice").await {
				Ok(stored) => {
					let assembled = std::fs::read(&stored.path).expect("stored file");
					assert!(
						assembled == data,
						"round {round}: assembled {} bytes, expected {}",
						assembled.len(),
						data.len()
					);
					break;
				}
				Err(UploadError::InvalidState(_)) => tokio::task::yield_now().await,
				Err(other) => panic!("round {round}: expected success or InvalidState, got: {other:?}"),
			}
		}

		match resend.await.expect("resend task") {
			Ok(_) | Err(UploadError::InvalidState(_)) | Err(UploadError::NotFound(_)) => {}
			Err(other) => panic!("round {round}: unexpected resend result: {other:?}"),
		}
	}
	assert!(uploads.is_empty());
}
