//! Folds plain-memory-queue activity (control requests, client sends) into
//! the same blocking `zmq::poll` call the broker already uses to wait on
//! ROUTER/SUB readability.
//!
//! The trick (lifted from the donor engine's socket-event monitor thread,
//! which wakes itself up by `PUSH`ing onto an `inproc://` socket it also
//! polls) is to bind a `PULL` socket in the broker thread and hand every
//! queue producer a `PUSH` socket connected to the same endpoint. A producer
//! sends a single empty frame after every enqueue; the broker's poll set
//! includes the `PULL` socket's poll item, so a queue push always wakes the
//! select even though the queue itself is plain memory, not a socket.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::BrokerError;

static NEXT_WAKE_ID: AtomicU64 = AtomicU64::new(0);

/// Broker-side half: bound, included in the poll set, drained whenever it
/// fires.
pub struct WakeReceiver {
	socket: zmq::Socket,
	endpoint: String,
}

impl WakeReceiver {
	pub fn bind(ctx: &zmq::Context) -> Result<Self, BrokerError> {
		let id = NEXT_WAKE_ID.fetch_add(1, Ordering::Relaxed);
		let endpoint = format!("inproc://broker-wake-{id}");
		let socket = ctx.socket(zmq::PULL).map_err(|e| BrokerError::zmq("wake socket", e))?;
		socket.bind(&endpoint).map_err(|e| BrokerError::zmq("wake bind", e))?;
		Ok(WakeReceiver { socket, endpoint })
	}

	pub fn connect_sender(&self, ctx: &zmq::Context) -> Result<WakeSender, BrokerError> {
		WakeSender::connect(ctx, &self.endpoint)
	}

	/// The `inproc://` endpoint this receiver is bound to. Lets a caller
	/// hold onto it independently of the `WakeReceiver` itself, so a new
	/// `WakeSender` can still be connected after the receiver has been
	/// handed off to the broker thread.
	pub fn endpoint(&self) -> &str {
		&self.endpoint
	}

	pub fn poll_item(&self) -> zmq::PollItem<'_> {
		self.socket.as_poll_item(zmq::POLLIN)
	}

	/// Drain all pending pings. Safe to call even if the socket wasn't
	/// actually ready (non-blocking recv just returns `EAGAIN`).
	pub fn drain(&self) {
		loop {
			match self.socket.recv_bytes(zmq::DONTWAIT) {
				Ok(_) => continue,
				Err(_) => break,
			}
		}
	}
}

/// Producer-side half: one per client/control producer. Not `Clone` because
/// the underlying `zmq::Socket` isn't `Sync`; wrap in `Arc` if a handle must
/// be shared across threads (as `ClientEnv` does for the control queue).
pub struct WakeSender {
	socket: Mutex<zmq::Socket>,
}

impl WakeSender {
	pub(crate) fn connect(ctx: &zmq::Context, endpoint: &str) -> Result<Self, BrokerError> {
		let socket = ctx.socket(zmq::PUSH).map_err(|e| BrokerError::zmq("wake sender", e))?;
		socket.connect(endpoint).map_err(|e| BrokerError::zmq("wake connect", e))?;
		Ok(WakeSender { socket: Mutex::new(socket) })
	}

	/// Best-effort; a dropped wake ping just means the broker notices the
	/// new queue item on its next scheduled wake-up instead of immediately.
	pub fn ping(&self) {
		let socket = self.socket.lock();
		let _ = socket.send(&[][..], zmq::DONTWAIT);
	}
}
