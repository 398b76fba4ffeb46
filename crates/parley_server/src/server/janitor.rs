#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::server::context::ServerContext;

#[derive(Debug, Clone, Copy)]
pub struct JanitorConfig {
	pub interval: Duration,
	pub upload_ttl: Duration,
	pub ring_timeout: Duration,
}

/// One sweep: stale upload sessions and unanswered calls.
pub async fn sweep(ctx: &ServerContext, cfg: &JanitorConfig) -> (usize, usize) {
	let uploads = ctx.uploads.reap_expired(cfg.upload_ttl).await;
	let calls = ctx.calls.expire_ringing(cfg.ring_timeout);

	if !uploads.is_empty() || !calls.is_empty() {
		info!(uploads = uploads.len(), calls = calls.len(), "janitor: expired stale sessions");
	} else {
		debug!("janitor: nothing to expire");
	}
	(uploads.len(), calls.len())
}

pub fn spawn_janitor(ctx: Arc<ServerContext>, cfg: JanitorConfig) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut tick = tokio::time::interval(cfg.interval.max(Duration::from_secs(1)));
		tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		tick.tick().await;

		loop {
			tick.tick().await;
			sweep(&ctx, &cfg).await;
		}
	})
}
