use bytes::{BufMut, BytesMut};
use parley_domain::CallKind;
use parley_protocol::{
	ClientEvent, DEFAULT_MAX_FRAME_SIZE, FramingError, ServerEvent, decode_client_event, decode_text_frame, encode_frame,
	encode_text_frame, try_decode_frame, try_decode_text_frame,
};
use proptest::prelude::*;

#[test]
fn client_event_survives_framing() {
	let text = r#"{"type":"call_init","targetId":"bob","callType":"audio"}"#;
	let frame = encode_text_frame(text, DEFAULT_MAX_FRAME_SIZE).expect("encode");

	let (decoded, consumed) = decode_text_frame(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode");
	assert_eq!(consumed, frame.len());

	match decode_client_event(&decoded).expect("event") {
		ClientEvent::CallInit { target_id, call_type } => {
			assert_eq!(target_id.as_str(), "bob");
			assert_eq!(call_type, CallKind::Audio);
		}
		other => panic!("expected CallInit, got: {other:?}"),
	}
}

#[test]
fn typed_frames_decode_from_buffer() {
	let ev = ServerEvent::Pong { timestamp: 1_700_000_000_000 };
	let frame = encode_frame(&ev, DEFAULT_MAX_FRAME_SIZE).expect("encode");

	let mut buf = BytesMut::from(&frame[..]);
	let decoded: ServerEvent = try_decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE)
		.expect("ok")
		.expect("some");
	assert_eq!(decoded, ev);
	assert!(buf.is_empty());
}

#[test]
fn oversized_prefix_rejected_before_payload_arrives() {
	let mut buf = BytesMut::new();
	buf.put_u32(1024);

	match try_decode_text_frame(&mut buf, 512) {
		Err(FramingError::FrameTooLarge { len, max }) => {
			assert_eq!(len, 1024);
			assert_eq!(max, 512);
		}
		other => panic!("expected FrameTooLarge, got: {other:?}"),
	}
}

#[test]
fn empty_payload_is_a_valid_frame() {
	let frame = encode_text_frame("", DEFAULT_MAX_FRAME_SIZE).expect("encode");
	assert_eq!(frame, vec![0, 0, 0, 0]);

	let mut buf = BytesMut::from(&frame[..]);
	assert_eq!(
		try_decode_text_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE).expect("ok").as_deref(),
		Some("")
	);
}

proptest! {
	#[test]
	fn incremental_decode_at_any_split(
		texts in proptest::collection::vec("[ -~]{0,64}", 1..6),
		split in any::<prop::sample::Index>(),
	) {
		let mut wire = Vec::new();
		for t in &texts {
			wire.extend_from_slice(&encode_text_frame(t, DEFAULT_MAX_FRAME_SIZE).expect("encode"));
		}

		let at = split.index(wire.len() + 1);
		let mut buf = BytesMut::new();
		let mut out = Vec::new();

		for part in [&wire[..at], &wire[at..]] {
			buf.extend_from_slice(part);
			while let Some(text) = try_decode_text_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE).expect("decode") {
				out.push(text);
			}
		}

		prop_assert_eq!(out, texts);
		prop_assert!(buf.is_empty());
	}
}
