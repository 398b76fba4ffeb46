#![forbid(unsafe_code)]

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Default maximum frame payload size for v1.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 2 * 1024 * 1024; // 2 MiB

const PREFIX_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},

	#[error("frame payload is not valid UTF-8: {0}")]
	Utf8(#[from] std::str::Utf8Error),

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

fn check_len(len: usize, max_frame_size: usize) -> Result<(), FramingError> {
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}
	Ok(())
}

/// Encode a UTF-8 text payload into a length-prefixed frame.
pub fn encode_text_frame(text: &str, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	check_len(text.len(), max_frame_size)?;

	let mut out = Vec::with_capacity(frame_len_from_payload_len(text.len()));
	out.extend_from_slice(&(text.len() as u32).to_be_bytes());
	out.extend_from_slice(text.as_bytes());
	Ok(out)
}

/// Serialize `msg` as JSON and frame it.
pub fn encode_frame<T: Serialize>(msg: &T, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let text = serde_json::to_string(msg)?;
	encode_text_frame(&text, max_frame_size)
}

/// Append an encoded text frame into the provided buffer.
pub fn encode_frame_into(buf: &mut BytesMut, text: &str, max_frame_size: usize) -> Result<(), FramingError> {
	check_len(text.len(), max_frame_size)?;

	buf.reserve(frame_len_from_payload_len(text.len()));
	buf.put_u32(text.len() as u32);
	buf.put_slice(text.as_bytes());
	Ok(())
}

/// Compute total frame length (prefix + payload).
#[inline]
pub fn frame_len_from_payload_len(payload_len: usize) -> usize {
	PREFIX_LEN + payload_len
}

fn peek_len(src: &[u8]) -> Option<usize> {
	let prefix: [u8; PREFIX_LEN] = src.get(..PREFIX_LEN)?.try_into().ok()?;
	Some(u32::from_be_bytes(prefix) as usize)
}

/// Decode a single text frame from the start of `src`, returning the text and bytes consumed.
pub fn decode_text_frame(src: &[u8], max_frame_size: usize) -> Result<(String, usize), FramingError> {
	let Some(len) = peek_len(src) else {
		return Err(FramingError::InsufficientData {
			need: PREFIX_LEN,
			have: src.len(),
		});
	};
	check_len(len, max_frame_size)?;

	let need = frame_len_from_payload_len(len);
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	let text = std::str::from_utf8(&src[PREFIX_LEN..need])?;
	Ok((text.to_string(), need))
}

/// Try to split one text frame off the front of a growable buffer.
///
/// Returns `Ok(None)` until a whole frame is buffered. An oversized prefix is rejected before the payload
/// arrives.
pub fn try_decode_text_frame(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<String>, FramingError> {
	let Some(len) = peek_len(buf) else {
		return Ok(None);
	};
	check_len(len, max_frame_size)?;

	let need = frame_len_from_payload_len(len);
	if buf.len() < need {
		return Ok(None);
	}

	let frame = buf.split_to(need);
	let text = std::str::from_utf8(&frame[PREFIX_LEN..])?;
	Ok(Some(text.to_string()))
}

/// Like `try_decode_text_frame`, then deserializes the JSON payload.
pub fn try_decode_frame<T: DeserializeOwned>(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<T>, FramingError> {
	match try_decode_text_frame(buf, max_frame_size)? {
		Some(text) => Ok(Some(serde_json::from_str(&text)?)),
		None => Ok(None),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decode_requires_full_frame() {
		let frame = encode_text_frame("{\"type\":\"ping\"}", DEFAULT_MAX_FRAME_SIZE).expect("encode");

		let err = decode_text_frame(&frame[..6], DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		match err {
			FramingError::InsufficientData { need, have } => {
				assert_eq!(need, frame.len());
				assert_eq!(have, 6);
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn encode_rejects_too_large() {
		let err = encode_text_frame(&"a".repeat(64), 32).unwrap_err();
		match err {
			FramingError::FrameTooLarge { len, max } => {
				assert_eq!(len, 64);
				assert_eq!(max, 32);
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn rejects_invalid_utf8_payload() {
		let mut buf = BytesMut::new();
		buf.put_u32(2);
		buf.put_slice(&[0xff, 0xfe]);

		match try_decode_text_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE) {
			Err(FramingError::Utf8(_)) => {}
			other => panic!("expected Utf8 error, got: {other:?}"),
		}
	}

	#[test]
	fn encode_frame_into_appends() {
		let mut buf = BytesMut::new();
		encode_frame_into(&mut buf, "a", DEFAULT_MAX_FRAME_SIZE).expect("first");
		encode_frame_into(&mut buf, "bc", DEFAULT_MAX_FRAME_SIZE).expect("second");
		assert_eq!(buf.len(), frame_len_from_payload_len(1) + frame_len_from_payload_len(2));

		assert_eq!(try_decode_text_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap().as_deref(), Some("a"));
		assert_eq!(try_decode_text_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap().as_deref(), Some("bc"));
		assert!(buf.is_empty());
	}
}
