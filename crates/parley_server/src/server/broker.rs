#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use parley_domain::{RoomId, Topic, UserId};
use tracing::debug;

/// Encoded JSON text shared by every recipient of a publish.
pub type Payload = Arc<str>;

/// One message handed to a subscriber callback.
#[derive(Debug, Clone)]
pub struct Delivery {
	pub topic: String,
	pub payload: Payload,
	/// Subscriber id of the publisher, when the publish came from a connection.
	pub sender: Option<String>,
}

/// Subscriber callback. Must not block; it runs on the publisher's task.
pub type DeliveryFn = Arc<dyn Fn(&Delivery) + Send + Sync>;

/// In-memory topic fan-out.
///
/// Subscribers are opaque ids (session ids in practice). Callbacks are collected under the table lock and
/// invoked after it is released, so a callback may freely call back into the broker.
#[derive(Default)]
pub struct Broker {
	inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
	topics: HashMap<String, HashMap<String, DeliveryFn>>,
	by_subscriber: HashMap<String, HashSet<String>>,
}

impl Broker {
	pub fn new() -> Self {
		Self::default()
	}

	/// Subscribe `subscriber` to `topic`. Resubscribing replaces the callback.
	pub fn subscribe(&self, subscriber: &str, topic: &str, on_message: DeliveryFn) {
		let mut inner = self.inner.lock();
		let replaced = inner
			.topics
			.entry(topic.to_string())
			.or_default()
			.insert(subscriber.to_string(), on_message)
			.is_some();
		inner
			.by_subscriber
			.entry(subscriber.to_string())
			.or_default()
			.insert(topic.to_string());

		debug!(subscriber, topic, replaced, "broker: subscribed");
	}

	/// Remove one subscription. Returns whether it existed.
	pub fn unsubscribe(&self, subscriber: &str, topic: &str) -> bool {
		let mut inner = self.inner.lock();
		let removed = remove_pair(&mut inner, subscriber, topic);

		if let Some(topics) = inner.by_subscriber.get_mut(subscriber) {
			topics.remove(topic);
			if topics.is_empty() {
				inner.by_subscriber.remove(subscriber);
			}
		}

		if removed {
			debug!(subscriber, topic, "broker: unsubscribed");
		}
		removed
	}

	/// Drop every subscription held by `subscriber`. Returns how many were removed.
	pub fn unsubscribe_all(&self, subscriber: &str) -> usize {
		let mut inner = self.inner.lock();
		let Some(topics) = inner.by_subscriber.remove(subscriber) else {
			return 0;
		};

		let mut removed = 0;
		for topic in &topics {
			if remove_pair(&mut inner, subscriber, topic) {
				removed += 1;
			}
		}

		debug!(subscriber, removed, "broker: unsubscribed from all topics");
		removed
	}

	/// Deliver `payload` to every current subscriber of `topic`, sender included.
	pub fn publish(&self, topic: &str, payload: Payload, sender: Option<&str>) -> usize {
		self.publish_filtered(topic, payload, sender, None)
	}

	/// Like `publish` but skips `excluded`.
	pub fn publish_excluding(&self, topic: &str, payload: Payload, sender: Option<&str>, excluded: &str) -> usize {
		self.publish_filtered(topic, payload, sender, Some(excluded))
	}

	pub fn publish_to_room(&self, room: &RoomId, payload: Payload, sender: Option<&str>) -> usize {
		self.publish(&Topic::room(room), payload, sender)
	}

	pub fn publish_to_user(&self, user: &UserId, payload: Payload, sender: Option<&str>) -> usize {
		self.publish(&Topic::user(user), payload, sender)
	}

	/// Deliver to every (subscriber, topic) pair. A subscriber on three topics gets three deliveries.
	pub fn broadcast(&self, payload: Payload) -> usize {
		let targets = {
			let inner = self.inner.lock();
			inner
				.topics
				.iter()
				.flat_map(|(topic, subs)| subs.values().map(move |cb| (topic.clone(), Arc::clone(cb))))
				.collect::<Vec<_>>()
		};

		for (topic, cb) in &targets {
			cb(&Delivery {
				topic: topic.clone(),
				payload: Arc::clone(&payload),
				sender: None,
			});
		}
		targets.len()
	}

	pub fn topic_count(&self) -> usize {
		self.inner.lock().topics.len()
	}

	pub fn subscriber_count(&self, topic: &str) -> usize {
		self.inner.lock().topics.get(topic).map(HashMap::len).unwrap_or(0)
	}

	/// Topics `subscriber` currently holds, sorted.
	pub fn topics_for(&self, subscriber: &str) -> Vec<String> {
		let inner = self.inner.lock();
		let mut topics = inner
			.by_subscriber
			.get(subscriber)
			.map(|t| t.iter().cloned().collect::<Vec<_>>())
			.unwrap_or_default();
		topics.sort();
		topics
	}

	fn publish_filtered(&self, topic: &str, payload: Payload, sender: Option<&str>, excluded: Option<&str>) -> usize {
		let callbacks = {
			let inner = self.inner.lock();
			let Some(subs) = inner.topics.get(topic) else {
				return 0;
			};
			subs.iter()
				.filter(|(id, _)| Some(id.as_str()) != excluded)
				.map(|(_, cb)| Arc::clone(cb))
				.collect::<Vec<_>>()
		};

		if callbacks.is_empty() {
			return 0;
		}

		let delivery = Delivery {
			topic: topic.to_string(),
			payload,
			sender: sender.map(str::to_string),
		};
		for cb in &callbacks {
			cb(&delivery);
		}
		callbacks.len()
	}
}

fn remove_pair(inner: &mut Inner, subscriber: &str, topic: &str) -> bool {
	let Some(subs) = inner.topics.get_mut(topic) else {
		return false;
	};
	let removed = subs.remove(subscriber).is_some();
	if subs.is_empty() {
		inner.topics.remove(topic);
	}
	removed
}
