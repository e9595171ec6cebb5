use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{INTERVAL_MAX_MS, INTERVAL_MIN_MS, LIVENESS_MAX, NEW_PEER_GRACE_MS};
use crate::peer::PeerId;

pub fn now_ms() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock is before the epoch")
		.as_millis() as i64
}

/// Per-peer liveness bookkeeping. See SPEC_FULL.md §3/§4.D for the full
/// state machine.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatState {
	pub interval_ms: i64,
	pub liveness: i64,
	pub next_poll_ms: i64,
	pub inactive: bool,
}

impl HeartbeatState {
	/// Fresh state for a peer that was just added to the peer set.
	pub fn new_peer(now: i64) -> Self {
		HeartbeatState {
			interval_ms: INTERVAL_MIN_MS,
			liveness: LIVENESS_MAX,
			next_poll_ms: now + NEW_PEER_GRACE_MS,
			inactive: false,
		}
	}

	/// Any traffic at all from this peer resets it to fully live.
	pub fn on_traffic_received(&mut self) {
		self.liveness = LIVENESS_MAX;
		self.interval_ms = INTERVAL_MIN_MS;
	}

	/// Applied when the broker actually performs the reconnect (closes and
	/// reopens both sockets). Doubles the backoff, clears `inactive`.
	pub fn on_reconnect_applied(&mut self, now: i64) {
		self.interval_ms = (self.interval_ms * 2).min(INTERVAL_MAX_MS);
		self.inactive = false;
		self.next_poll_ms = now + self.interval_ms;
	}
}

pub type HeartbeatTable = HashMap<PeerId, HeartbeatState>;

/// Outcome of a single ticker pass over the heartbeat table.
#[derive(Debug, Default)]
pub struct TickOutcome {
	/// Peers that just transitioned from Dying to Reconnecting this tick;
	/// the ticker bundles these into a single `Reconnect` control request.
	pub newly_reconnecting: Vec<PeerId>,
}

/// Advance every non-inactive peer whose `next_poll_ms` has elapsed.
/// Pure function over the table so it can be unit tested without threads
/// or sockets (see the tests module below).
pub fn tick(table: &mut HeartbeatTable, now: i64) -> TickOutcome {
	let mut outcome = TickOutcome::default();
	for (peer, state) in table.iter_mut() {
		if state.inactive || now < state.next_poll_ms {
			continue;
		}
		if state.liveness > 1 {
			state.liveness -= 1;
			state.next_poll_ms = now + state.interval_ms;
		} else {
			state.inactive = true;
			outcome.newly_reconnecting.push(peer.clone());
		}
	}
	outcome
}
