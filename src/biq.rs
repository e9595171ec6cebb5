use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::peer::PeerId;
use crate::wake::WakeSender;

pub type ClientId = Vec<u8>;
pub type MsgType = Vec<u8>;
pub type Subscription = Vec<u8>;

/// A multi-frame application payload; frames 3.. of the wire layout in
/// SPEC_FULL.md §6.
pub type Payload = Vec<Vec<u8>>;

/// A message a client worker wants the broker to send out over ROUTER.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
	/// `None` means "pick uniformly at random over the current peer set".
	pub peer: Option<PeerId>,
	pub msg_type: MsgType,
	pub payload: Payload,
}

/// Something the broker delivers to a registered client.
#[derive(Debug, Clone)]
pub enum InboundEvent {
	/// A ROUTER frame addressed to a `MsgType` this client owns.
	Message { peer: PeerId, msg_type: MsgType, payload: Payload },
	/// A SUB publication on a topic this client subscribed to.
	Publication { peer: PeerId, subscription: Subscription, payload: Payload },
	/// The send this client requested could not be routed anywhere.
	NoPeers,
	/// This client's `Register` request was rejected; no further events
	/// will ever arrive on this BiQ, since the client was never added to
	/// the routing tables.
	RegistrationRejected(crate::error::RegistrationError),
}

/// The client-facing handle returned by `register_client`.
///
/// Both directions are unbounded MPSC queues: the client is the sole
/// producer of the send side and sole consumer of the recv side. No
/// backpressure beyond available memory; dropping the `BiQ` drops the
/// client's outbound queue, and the broker simply stops being able to
/// deliver to the (now gone) recv side.
pub struct BiQ {
	outbound_tx: Sender<OutboundMessage>,
	inbound_rx: Receiver<InboundEvent>,
	wake: Arc<WakeSender>,
}

impl BiQ {
	/// Enqueue a message for the broker to send. Never blocks.
	pub fn send(&self, message: OutboundMessage) {
		// The receiver only ever goes away once the broker drops the
		// client's entry from `clients`, at which point there is nothing
		// useful to do with a dropped send besides discard it.
		let _ = self.outbound_tx.send(message);
		self.wake.ping();
	}

	/// Non-blocking receive of the next event for this client, if any.
	pub fn try_recv(&self) -> Option<InboundEvent> {
		self.inbound_rx.try_recv().ok()
	}

	/// Blocking receive; returns `None` once the broker has gone away
	/// (the inbound sender was dropped in `term_env`).
	pub fn recv(&self) -> Option<InboundEvent> {
		self.inbound_rx.recv().ok()
	}
}

/// The broker-facing half of a `BiQ`, stored in `RoutingTables::clients`.
pub(crate) struct ClientChannel {
	pub outbound_rx: Receiver<OutboundMessage>,
	pub inbound_tx: Sender<InboundEvent>,
}

/// Construct a `(BiQ, ClientChannel)` pair bound to a single client.
pub(crate) fn biq_pair(wake: Arc<WakeSender>) -> (BiQ, ClientChannel) {
	let (outbound_tx, outbound_rx) = crossbeam_channel::unbounded();
	let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
	(BiQ { outbound_tx, inbound_rx, wake }, ClientChannel { outbound_rx, inbound_tx })
}
