#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use anyhow::{Context as _, anyhow};
use bytes::BytesMut;
use parley_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame_into, try_decode_text_frame};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ServerSettings;
use crate::server::dispatch::Dispatcher;
use crate::server::error::HandlerError;
use crate::server::outbox::Outbox;
use crate::server::registry::ConnectionHandle;

/// Inbound frames buffered between the stream reader and the dispatcher.
const INBOUND_QUEUE: usize = 64;

/// How long queued replies may take to flush once the client stops sending.
const FLUSH_GRACE: Duration = Duration::from_secs(2);

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,
	pub outbound_queue_capacity: usize,

	/// 0 disables rate limiting.
	pub rate_limit_burst: u32,
	pub rate_limit_per_minute: u32,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			outbound_queue_capacity: 1024,
			rate_limit_burst: 0,
			rate_limit_per_minute: 0,
		}
	}
}

impl From<&ServerSettings> for ConnectionSettings {
	fn from(s: &ServerSettings) -> Self {
		Self {
			max_frame_bytes: s.max_frame_bytes,
			outbound_queue_capacity: s.outbound_queue_capacity,
			rate_limit_burst: s.rate_limit_burst,
			rate_limit_per_minute: s.rate_limit_per_minute,
		}
	}
}

#[derive(Debug, Clone)]
pub(crate) struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	pub(crate) fn new(capacity: u32, refill_per_minute: u32) -> Option<Self> {
		if capacity == 0 || refill_per_minute == 0 {
			return None;
		}
		Some(Self {
			capacity: capacity as f64,
			tokens: capacity as f64,
			refill_per_sec: refill_per_minute as f64 / 60.0,
			last: Instant::now(),
		})
	}

	pub(crate) fn allow(&mut self) -> bool {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

/// Drive one QUIC connection: a single client-opened bidirectional stream carrying
/// length-prefixed JSON frames in both directions.
pub async fn handle_connection(
	handle: ConnectionHandle,
	connection: quinn::Connection,
	dispatcher: Dispatcher,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("parley_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("parley_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut send, mut recv) = connection.accept_bi().await.context("accept bidirectional stream")?;

	let (outbox, mut out_rx) = Outbox::channel(settings.outbound_queue_capacity);
	let conn = dispatcher.open(handle, outbox);
	info!(%handle, session_id = %conn.session_id, remote = %connection.remote_address(), "session opened");
	drop(conn);

	let max_frame = settings.max_frame_bytes;
	let mut writer_task = tokio::spawn(async move {
		let mut buf = BytesMut::with_capacity(8 * 1024);
		while let Some(payload) = out_rx.recv().await {
			if let Err(e) = encode_frame_into(&mut buf, &payload, max_frame) {
				warn!(error = %e, "dropping oversized outbound frame");
				continue;
			}
			send.write_all(&buf).await.context("stream write")?;
			buf.clear();
			metrics::counter!("parley_server_frames_out_total").increment(1);
		}
		let _ = send.finish();
		Ok::<(), anyhow::Error>(())
	});

	let (in_tx, mut in_rx) = mpsc::channel::<String>(INBOUND_QUEUE);
	let reader_task = tokio::spawn(async move {
		let mut buf = BytesMut::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("stream read failed")),
			};

			metrics::counter!("parley_server_bytes_in_total").increment(n as u64);
			buf.extend_from_slice(&tmp[..n]);

			loop {
				match try_decode_text_frame(&mut buf, max_frame) {
					Ok(Some(text)) => {
						metrics::counter!("parley_server_frames_in_total").increment(1);
						if in_tx.send(text).await.is_err() {
							return Ok(());
						}
					}
					Ok(None) => break,
					Err(e) => {
						metrics::counter!("parley_server_frame_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode inbound frame"));
					}
				}
			}
		}
	});

	let mut limiter = TokenBucket::new(settings.rate_limit_burst, settings.rate_limit_per_minute);
	while let Some(text) = in_rx.recv().await {
		if let Some(bucket) = limiter.as_mut()
			&& !bucket.allow()
		{
			metrics::counter!("parley_server_rate_limited_total").increment(1);
			dispatcher.reject(handle, HandlerError::RateLimited);
			continue;
		}
		dispatcher.dispatch(handle, &text).await;
	}

	let read_result = reader_task.await;
	dispatcher.close(handle).await;

	if tokio::time::timeout(FLUSH_GRACE, &mut writer_task).await.is_err() {
		debug!(%handle, "outbound queue did not drain; aborting writer");
		writer_task.abort();
	}
	connection.close(0u32.into(), b"bye");
	info!(%handle, "session closed");

	match read_result {
		Ok(result) => result,
		Err(e) => Err(anyhow!(e).context("reader task panicked")),
	}
}
