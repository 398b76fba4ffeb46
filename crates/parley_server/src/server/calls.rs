#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parley_domain::{CallKind, CallState, UserId};
use parley_protocol::{ParticipantInfo, ServerEvent};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::server::broker::Broker;
use crate::server::outbox::encode;
use crate::util::time::unix_ms_now;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
	#[error("you are already in a call")]
	AlreadyInCall,

	#[error("target user is busy")]
	TargetBusy,

	#[error("cannot call yourself")]
	SelfCall,

	#[error("call not found: {0}")]
	NotFound(String),

	#[error("call is {0}; expected calling")]
	InvalidState(CallState),

	#[error("you were not invited to this call")]
	NotInvited,

	#[error("user is not part of this call")]
	NotInCall,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
	pub user_id: UserId,
	pub muted: bool,
	pub video: bool,
	pub screen_sharing: bool,
}

/// State of one call. Cloned out of the table as a snapshot.
#[derive(Debug, Clone)]
pub struct CallSession {
	pub call_id: String,
	pub kind: CallKind,
	pub state: CallState,
	pub initiator_id: UserId,
	pub initiator_name: String,
	pub invitee_id: UserId,
	pub participants: Vec<Participant>,
	pub created_at_ms: i64,
	/// 0 until the first answer.
	pub connected_at_ms: i64,
}

impl CallSession {
	pub fn is_participant(&self, user: &UserId) -> bool {
		self.participants.iter().any(|p| &p.user_id == user)
	}

	/// Invitee who has not accepted yet.
	fn is_pending_invitee(&self, user: &UserId) -> bool {
		&self.invitee_id == user && !self.is_participant(user)
	}

	/// Participant or invitee.
	pub fn involves(&self, user: &UserId) -> bool {
		self.is_participant(user) || &self.invitee_id == user
	}

	fn duration_secs(&self, now_ms: i64) -> u64 {
		if self.connected_at_ms <= 0 {
			return 0;
		}
		(now_ms.saturating_sub(self.connected_at_ms).max(0) / 1000) as u64
	}

	pub fn status_event(&self) -> ServerEvent {
		ServerEvent::CallStatus {
			call_id: self.call_id.clone(),
			state: self.state,
			call_type: self.kind,
			initiator_id: self.initiator_id.clone(),
			participants: self
				.participants
				.iter()
				.map(|p| ParticipantInfo {
					user_id: p.user_id.clone(),
					muted: p.muted,
					video: p.video,
					screen_sharing: p.screen_sharing,
				})
				.collect(),
			created_at: self.created_at_ms,
			connected_at: self.connected_at_ms,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaControl {
	Mute,
	Video,
	ScreenShare,
}

/// Signaling relay kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
	Offer,
	Answer,
	Ice,
}

/// Events to publish once the table lock is released.
type Relays = Vec<(UserId, ServerEvent)>;

#[derive(Default)]
struct CallTable {
	calls: HashMap<String, CallSession>,
	/// Active participants only; invitees are indexed once they accept.
	by_user: HashMap<UserId, String>,
}

impl CallTable {
	fn get(&self, call_id: &str) -> Result<&CallSession, CallError> {
		self.calls.get(call_id).ok_or_else(|| CallError::NotFound(call_id.to_string()))
	}

	fn get_mut(&mut self, call_id: &str) -> Result<&mut CallSession, CallError> {
		self.calls
			.get_mut(call_id)
			.ok_or_else(|| CallError::NotFound(call_id.to_string()))
	}

	/// Remove the call and every index entry pointing at it.
	fn teardown(&mut self, call_id: &str) -> Option<CallSession> {
		let session = self.calls.remove(call_id)?;
		for p in &session.participants {
			if self.by_user.get(&p.user_id).map(String::as_str) == Some(call_id) {
				self.by_user.remove(&p.user_id);
			}
		}
		Some(session)
	}

	/// End a call on behalf of `ended_by`, queueing `call_ended` for everyone else involved.
	fn end(&mut self, call_id: &str, ended_by: &UserId, reason: &str, relays: &mut Relays) -> Option<u64> {
		let session = self.teardown(call_id)?;
		let duration = session.duration_secs(unix_ms_now());

		let event = ServerEvent::CallEnded {
			call_id: session.call_id.clone(),
			ended_by: ended_by.clone(),
			duration,
			reason: reason.to_string(),
		};

		for p in &session.participants {
			if &p.user_id != ended_by {
				relays.push((p.user_id.clone(), event.clone()));
			}
		}
		if session.is_pending_invitee(&session.invitee_id) && &session.invitee_id != ended_by {
			relays.push((session.invitee_id.clone(), event));
		}

		metrics::counter!("parley_server_calls_ended_total").increment(1);
		info!(call_id, ended_by = %ended_by, duration, reason, "call ended");
		Some(duration)
	}
}

/// Call lifecycle and WebRTC signaling relay.
///
/// One lock guards the call table and the user index. Relays go out through the broker's `user:<id>`
/// topics after the lock is released.
pub struct CallSignaling {
	broker: Arc<Broker>,
	inner: Mutex<CallTable>,
}

impl CallSignaling {
	pub fn new(broker: Arc<Broker>) -> Self {
		Self {
			broker,
			inner: Mutex::new(CallTable::default()),
		}
	}

	pub fn initiate_call(
		&self,
		caller: &UserId,
		caller_name: &str,
		target: &UserId,
		kind: CallKind,
	) -> Result<String, CallError> {
		if caller == target {
			return Err(CallError::SelfCall);
		}

		let call_id = new_call_id();
		let session = {
			let mut table = self.inner.lock();
			if table.by_user.contains_key(caller) {
				return Err(CallError::AlreadyInCall);
			}
			if table.by_user.contains_key(target) {
				return Err(CallError::TargetBusy);
			}

			let session = CallSession {
				call_id: call_id.clone(),
				kind,
				state: CallState::Calling,
				initiator_id: caller.clone(),
				initiator_name: caller_name.to_string(),
				invitee_id: target.clone(),
				participants: vec![Participant {
					user_id: caller.clone(),
					muted: false,
					video: kind == CallKind::Video,
					screen_sharing: kind == CallKind::Screen,
				}],
				created_at_ms: unix_ms_now(),
				connected_at_ms: 0,
			};
			table.by_user.insert(caller.clone(), call_id.clone());
			table.calls.insert(call_id.clone(), session.clone());
			session
		};

		metrics::counter!("parley_server_calls_started_total").increment(1);
		info!(call_id = %call_id, caller = %caller, target = %target, kind = %kind, "call initiated");

		self.relay(vec![(
			target.clone(),
			ServerEvent::CallIncoming {
				call_id: call_id.clone(),
				caller_id: session.initiator_id,
				caller_name: session.initiator_name,
				call_type: kind,
			},
		)]);
		Ok(call_id)
	}

	pub fn accept_call(&self, call_id: &str, user: &UserId, user_name: &str) -> Result<CallSession, CallError> {
		let (snapshot, relays) = {
			let mut table = self.inner.lock();
			let session = table.get(call_id)?;
			if session.state != CallState::Calling {
				return Err(CallError::InvalidState(session.state));
			}
			if &session.invitee_id != user {
				return Err(CallError::NotInvited);
			}
			if table.by_user.contains_key(user) {
				return Err(CallError::AlreadyInCall);
			}

			let session = table.get_mut(call_id)?;
			session.participants.push(Participant {
				user_id: user.clone(),
				muted: false,
				video: session.kind == CallKind::Video,
				screen_sharing: false,
			});
			session.state = CallState::Connecting;
			let snapshot = session.clone();
			table.by_user.insert(user.clone(), call_id.to_string());

			let relays = vec![(
				snapshot.initiator_id.clone(),
				ServerEvent::CallAccepted {
					call_id: call_id.to_string(),
					user_id: user.clone(),
					username: user_name.to_string(),
				},
			)];
			(snapshot, relays)
		};

		info!(call_id, user = %user, "call accepted");
		self.relay(relays);
		Ok(snapshot)
	}

	pub fn reject_call(&self, call_id: &str, user: &UserId, reason: Option<&str>) -> Result<(), CallError> {
		let reason = reason.map(str::trim).filter(|r| !r.is_empty()).unwrap_or("declined");

		let relays = {
			let mut table = self.inner.lock();
			let session = table.get(call_id)?;
			if session.state.is_terminal() {
				return Err(CallError::InvalidState(session.state));
			}
			if !session.involves(user) {
				return Err(CallError::NotInCall);
			}

			let notify = if &session.initiator_id == user {
				session.invitee_id.clone()
			} else {
				session.initiator_id.clone()
			};
			table.teardown(call_id);

			vec![(
				notify,
				ServerEvent::CallRejected {
					call_id: call_id.to_string(),
					user_id: user.clone(),
					reason: reason.to_string(),
				},
			)]
		};

		metrics::counter!("parley_server_calls_ended_total").increment(1);
		info!(call_id, user = %user, reason, "call rejected");
		self.relay(relays);
		Ok(())
	}

	pub fn send_offer(&self, call_id: &str, from: &UserId, target: &UserId, sdp: Value) -> Result<(), CallError> {
		self.signal(SignalKind::Offer, call_id, from, target, sdp)
	}

	/// Relays the answer; the first answer marks the call connected.
	pub fn send_answer(&self, call_id: &str, from: &UserId, target: &UserId, sdp: Value) -> Result<(), CallError> {
		self.signal(SignalKind::Answer, call_id, from, target, sdp)
	}

	pub fn send_ice_candidate(
		&self,
		call_id: &str,
		from: &UserId,
		target: &UserId,
		candidate: Value,
	) -> Result<(), CallError> {
		self.signal(SignalKind::Ice, call_id, from, target, candidate)
	}

	/// Relay an opaque signaling payload between two members of a call.
	pub fn signal(
		&self,
		kind: SignalKind,
		call_id: &str,
		from: &UserId,
		target: &UserId,
		payload: Value,
	) -> Result<(), CallError> {
		{
			let mut table = self.inner.lock();
			let session = table.get_mut(call_id)?;
			if !session.is_participant(from) || !session.involves(target) {
				return Err(CallError::NotInCall);
			}

			// Only an accepted call connects; an early answer is relayed without a transition.
			if kind == SignalKind::Answer && session.state == CallState::Connecting {
				session.state = CallState::Connected;
				session.connected_at_ms = unix_ms_now();
				info!(call_id, "call connected");
			}
		}

		let call_id = call_id.to_string();
		let from = from.clone();
		let event = match kind {
			SignalKind::Offer => ServerEvent::WebrtcOffer {
				call_id,
				from,
				sdp: payload,
			},
			SignalKind::Answer => ServerEvent::WebrtcAnswer {
				call_id,
				from,
				sdp: payload,
			},
			SignalKind::Ice => ServerEvent::WebrtcIce {
				call_id,
				from,
				candidate: payload,
			},
		};

		debug!(?kind, target = %target, "relaying signaling payload");
		self.relay(vec![(target.clone(), event)]);
		Ok(())
	}

	/// End a call. Returns its connected duration in whole seconds.
	pub fn end_call(&self, call_id: &str, user: &UserId) -> Result<u64, CallError> {
		let mut relays = Vec::new();
		let duration = {
			let mut table = self.inner.lock();
			if !table.get(call_id)?.involves(user) {
				return Err(CallError::NotInCall);
			}
			table.end(call_id, user, "ended", &mut relays).unwrap_or(0)
		};

		self.relay(relays);
		Ok(duration)
	}

	pub fn toggle_mute(&self, call_id: &str, user: &UserId, explicit: Option<bool>) -> Result<bool, CallError> {
		self.media(call_id, user, MediaControl::Mute, explicit)
	}

	pub fn toggle_video(&self, call_id: &str, user: &UserId, explicit: Option<bool>) -> Result<bool, CallError> {
		self.media(call_id, user, MediaControl::Video, explicit)
	}

	pub fn toggle_screen_share(&self, call_id: &str, user: &UserId, explicit: Option<bool>) -> Result<bool, CallError> {
		self.media(call_id, user, MediaControl::ScreenShare, explicit)
	}

	pub fn start_screen_share(&self, call_id: &str, user: &UserId) -> Result<bool, CallError> {
		self.media(call_id, user, MediaControl::ScreenShare, Some(true))
	}

	pub fn stop_screen_share(&self, call_id: &str, user: &UserId) -> Result<bool, CallError> {
		self.media(call_id, user, MediaControl::ScreenShare, Some(false))
	}

	fn media(&self, call_id: &str, user: &UserId, control: MediaControl, explicit: Option<bool>) -> Result<bool, CallError> {
		let (value, relays) = {
			let mut table = self.inner.lock();
			let session = table.get_mut(call_id)?;
			let participant = session
				.participants
				.iter_mut()
				.find(|p| &p.user_id == user)
				.ok_or(CallError::NotInCall)?;

			let flag = match control {
				MediaControl::Mute => &mut participant.muted,
				MediaControl::Video => &mut participant.video,
				MediaControl::ScreenShare => &mut participant.screen_sharing,
			};
			*flag = explicit.unwrap_or(!*flag);
			let value = *flag;

			let call_id = call_id.to_string();
			let user_id = user.clone();
			let event = match control {
				MediaControl::Mute => ServerEvent::MediaMute {
					call_id,
					user_id,
					muted: value,
				},
				MediaControl::Video => ServerEvent::MediaVideo {
					call_id,
					user_id,
					video: value,
				},
				MediaControl::ScreenShare => ServerEvent::MediaScreen {
					call_id,
					user_id,
					sharing: value,
				},
			};

			let relays = session
				.participants
				.iter()
				.filter(|p| &p.user_id != user)
				.map(|p| (p.user_id.clone(), event.clone()))
				.collect::<Relays>();
			(value, relays)
		};

		debug!(call_id, user = %user, ?control, value, "media state changed");
		self.relay(relays);
		Ok(value)
	}

	/// Disconnect path: end the user's active call and any call still ringing for them.
	pub fn force_end_for_user(&self, user: &UserId, reason: &str) -> Vec<String> {
		let mut relays = Vec::new();
		let ended = {
			let mut table = self.inner.lock();
			let mut ids = table
				.calls
				.values()
				.filter(|s| s.is_pending_invitee(user))
				.map(|s| s.call_id.clone())
				.collect::<Vec<_>>();
			if let Some(active) = table.by_user.get(user) {
				ids.push(active.clone());
			}

			ids.into_iter()
				.filter(|id| table.end(id, user, reason, &mut relays).is_some())
				.collect::<Vec<_>>()
		};

		self.relay(relays);
		ended
	}

	/// End calls that stayed unanswered for longer than `max_age`.
	pub fn expire_ringing(&self, max_age: Duration) -> Vec<String> {
		let cutoff = unix_ms_now() - max_age.as_millis() as i64;
		let mut relays = Vec::new();
		let expired = {
			let mut table = self.inner.lock();
			let stale = table
				.calls
				.values()
				.filter(|s| s.state == CallState::Calling && s.created_at_ms <= cutoff)
				.map(|s| (s.call_id.clone(), s.initiator_id.clone(), s.invitee_id.clone()))
				.collect::<Vec<_>>();

			for (call_id, initiator, invitee) in &stale {
				let event = ServerEvent::CallEnded {
					call_id: call_id.clone(),
					ended_by: initiator.clone(),
					duration: 0,
					reason: "timeout".to_string(),
				};
				table.teardown(call_id);
				relays.push((initiator.clone(), event.clone()));
				relays.push((invitee.clone(), event));
				metrics::counter!("parley_server_calls_ended_total").increment(1);
				info!(call_id = %call_id, "unanswered call timed out");
			}
			stale.into_iter().map(|(id, _, _)| id).collect::<Vec<_>>()
		};

		self.relay(relays);
		expired
	}

	pub fn status(&self, call_id: &str) -> Result<CallSession, CallError> {
		self.inner.lock().get(call_id).cloned()
	}

	pub fn active_call_for(&self, user: &UserId) -> Option<String> {
		self.inner.lock().by_user.get(user).cloned()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().calls.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	fn relay(&self, relays: Relays) {
		for (user, event) in relays {
			if let Some(payload) = encode(&event) {
				self.broker.publish_to_user(&user, payload, None);
			}
		}
	}
}

fn new_call_id() -> String {
	let suffix = uuid::Uuid::new_v4().simple().to_string();
	format!("call_{}_{}", unix_ms_now(), &suffix[..8])
}
