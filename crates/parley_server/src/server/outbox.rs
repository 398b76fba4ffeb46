#![forbid(unsafe_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use parley_protocol::ServerEvent;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::server::broker::{Broker, Delivery, DeliveryFn, Payload};

/// Sending half of a connection's bounded outbound queue.
///
/// Pushes never block: a full queue drops the frame, a closed one is ignored.
#[derive(Debug, Clone)]
pub struct Outbox {
	tx: mpsc::Sender<Payload>,
}

impl Outbox {
	pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Payload>) {
		let (tx, rx) = mpsc::channel(capacity.max(1));
		(Self { tx }, rx)
	}

	/// Queue an already encoded frame. Returns false when it was dropped.
	pub fn push(&self, payload: Payload) -> bool {
		match self.tx.try_send(payload) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(_)) => {
				metrics::counter!("parley_server_outbound_dropped_total").increment(1);
				debug!("outbox full; dropping frame");
				false
			}
			Err(mpsc::error::TrySendError::Closed(_)) => false,
		}
	}

	/// Encode and queue a direct reply.
	pub fn send(&self, event: &ServerEvent) -> bool {
		match encode(event) {
			Some(payload) => self.push(payload),
			None => false,
		}
	}

	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

/// Broker callback that forwards every delivery into `outbox`.
pub fn delivery_for(outbox: &Outbox) -> DeliveryFn {
	let outbox = outbox.clone();
	Arc::new(move |delivery: &Delivery| {
		outbox.push(Arc::clone(&delivery.payload));
	})
}

/// Deliveries parked while a join replays history; see [`held_delivery_for`].
pub struct HeldDeliveries {
	outbox: Outbox,
	held: Arc<Mutex<Option<Vec<Payload>>>>,
}

impl HeldDeliveries {
	/// Flush parked frames in arrival order, dropping those `skip` matches, and switch the
	/// callback to direct forwarding. Returns how many were dropped.
	pub fn release(self, skip: impl Fn(&Payload) -> bool) -> usize {
		let mut held = self.held.lock();
		let mut skipped = 0;
		for payload in held.take().unwrap_or_default() {
			if skip(&payload) {
				skipped += 1;
			} else {
				self.outbox.push(payload);
			}
		}
		skipped
	}
}

/// Like [`delivery_for`], but parks deliveries until [`HeldDeliveries::release`].
pub fn held_delivery_for(outbox: &Outbox) -> (DeliveryFn, HeldDeliveries) {
	let held = Arc::new(Mutex::new(Some(Vec::new())));
	let deliver = {
		let (outbox, held) = (outbox.clone(), Arc::clone(&held));
		Arc::new(move |delivery: &Delivery| {
			let mut held = held.lock();
			match held.as_mut() {
				Some(parked) => parked.push(Arc::clone(&delivery.payload)),
				None => {
					outbox.push(Arc::clone(&delivery.payload));
				}
			}
		}) as DeliveryFn
	};

	(
		deliver,
		HeldDeliveries {
			outbox: outbox.clone(),
			held,
		},
	)
}

pub(crate) fn encode(event: &ServerEvent) -> Option<Payload> {
	match event.to_json() {
		Ok(text) => Some(Payload::from(text)),
		Err(e) => {
			warn!(error = %e, "failed to encode server event");
			None
		}
	}
}

/// Encode once and publish to `topic`.
pub(crate) fn publish_event(broker: &Broker, topic: &str, event: &ServerEvent, sender: Option<&str>) -> usize {
	match encode(event) {
		Some(payload) => broker.publish(topic, payload, sender),
		None => 0,
	}
}
