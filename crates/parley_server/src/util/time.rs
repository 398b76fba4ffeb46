#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn since_epoch() -> Duration {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
}

/// Current Unix time in milliseconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	since_epoch().as_millis() as i64
}

/// Current Unix time in whole seconds.
#[inline]
pub fn unix_secs_now() -> u64 {
	since_epoch().as_secs()
}
