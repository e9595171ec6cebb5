//! Component A: turns a ZMQ socket's edge-triggered readability into
//! something the broker loop's single `zmq::poll` call can wait on, plus a
//! `can_receive` helper for the "loop while readable" drain pattern §4.G
//! requires (ZMQ's fd readiness is edge-triggered over the aggregate of
//! many queued messages, so one wake-up can mean "several messages are
//! here").

use crate::error::BrokerError;

pub(crate) struct Readiness<'a> {
	socket: &'a zmq::Socket,
	context: &'static str,
}

impl<'a> Readiness<'a> {
	pub fn new(socket: &'a zmq::Socket, context: &'static str) -> Self {
		Readiness { socket, context }
	}

	/// A poll item suitable for folding into the broker's multi-socket
	/// `zmq::poll` call.
	pub fn poll_item(&self) -> zmq::PollItem<'a> {
		self.socket.as_poll_item(zmq::POLLIN)
	}

	/// True iff `recv_multipart` would not block right now. Returns
	/// `SocketGone` (as a logged-false, per caller's choice) if the
	/// underlying socket handle reports it was closed from under us.
	pub fn can_receive(&self) -> Result<bool, BrokerError> {
		self.socket
			.get_events()
			.map(|events| events.contains(zmq::POLLIN))
			.map_err(|e| BrokerError::zmq(self.context, e))
	}
}
