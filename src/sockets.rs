//! Thin helpers over the raw `zmq` ROUTER/SUB sockets: construction,
//! peer connect/disconnect, and the wire framing from SPEC_FULL.md §6.
//! Everything here is a direct operation on the socket the broker thread
//! exclusively owns; nothing in this module is safe to call from more than
//! one thread concurrently on the same socket, which is why it is only
//! ever reached through `broker::run`.

use tracing::warn;

use crate::biq::{MsgType, Payload, Subscription};
use crate::config::HEARTBEAT_TOPIC;
use crate::error::BrokerError;
use crate::peer::PeerId;

pub(crate) fn new_router(ctx: &zmq::Context) -> Result<zmq::Socket, BrokerError> {
	let socket = ctx.socket(zmq::ROUTER).map_err(|e| BrokerError::zmq("create ROUTER", e))?;
	socket.set_router_mandatory(true).map_err(|e| BrokerError::zmq("ROUTER_MANDATORY", e))?;
	socket.set_linger(0).map_err(|e| BrokerError::zmq("ROUTER linger", e))?;
	Ok(socket)
}

pub(crate) fn new_sub(ctx: &zmq::Context) -> Result<zmq::Socket, BrokerError> {
	let socket = ctx.socket(zmq::SUB).map_err(|e| BrokerError::zmq("create SUB", e))?;
	socket.set_linger(0).map_err(|e| BrokerError::zmq("SUB linger", e))?;
	socket
		.set_subscribe(HEARTBEAT_TOPIC)
		.map_err(|e| BrokerError::zmq("subscribe _hb", e))?;
	Ok(socket)
}

/// Connect both sockets to a newly added peer. The ROUTER side needs its
/// outgoing routing id pinned to the peer's `connection_id` *before*
/// connecting (`ZMQ_CONNECT_ROUTING_ID`), which is what lets us later
/// address sends to this peer without ZMQ auto-assigning an opaque id.
pub(crate) fn connect_peer(
	router: &zmq::Socket,
	sub: &zmq::Socket,
	peer: &PeerId,
) -> Result<(), BrokerError> {
	router
		.set_connect_rid(&peer.connection_id())
		.map_err(|e| BrokerError::zmq("set_connect_rid", e))?;
	router.connect(&peer.router_endpoint()).map_err(|e| BrokerError::zmq("ROUTER connect", e))?;
	sub.connect(&peer.pub_endpoint()).map_err(|e| BrokerError::zmq("SUB connect", e))?;
	Ok(())
}

pub(crate) fn disconnect_peer(router: &zmq::Socket, sub: &zmq::Socket, peer: &PeerId) {
	if let Err(e) = router.disconnect(&peer.router_endpoint()) {
		warn!(peer = %peer, error = %e, "ROUTER disconnect failed (treated as best-effort)");
	}
	if let Err(e) = sub.disconnect(&peer.pub_endpoint()) {
		warn!(peer = %peer, error = %e, "SUB disconnect failed (treated as best-effort)");
	}
}

pub(crate) fn subscribe(sub: &zmq::Socket, topic: &Subscription) -> Result<(), BrokerError> {
	sub.set_subscribe(topic).map_err(|e| BrokerError::zmq("subscribe", e))
}

/// Send `[connection_id, "", msg_type, payload...]` to a specific peer.
pub(crate) fn send_request(
	router: &zmq::Socket,
	connection_id: &[u8],
	msg_type: &MsgType,
	payload: &Payload,
) -> Result<(), BrokerError> {
	let mut parts: Vec<&[u8]> = Vec::with_capacity(3 + payload.len());
	parts.push(connection_id);
	parts.push(b"");
	parts.push(msg_type);
	for frame in payload {
		parts.push(frame);
	}
	router.send_multipart(parts, zmq::DONTWAIT).map_err(|e| BrokerError::zmq("ROUTER send", e))
}

/// A single parsed ROUTER inbound multipart, see SPEC_FULL.md §6.
pub(crate) struct RouterFrame {
	pub connection_id: Vec<u8>,
	pub msg_type: MsgType,
	pub payload: Payload,
}

/// `Err` here means "malformed, log and drop"; never a fatal condition.
pub(crate) fn parse_router_frame(mut parts: Vec<Vec<u8>>) -> Result<RouterFrame, String> {
	if parts.len() < 3 {
		return Err(format!("expected at least 3 frames, got {}", parts.len()));
	}
	let payload = parts.split_off(3);
	let msg_type = parts.pop().expect("len checked above");
	let delimiter = parts.pop().expect("len checked above");
	let connection_id = parts.pop().expect("len checked above");
	if !delimiter.is_empty() {
		return Err("missing empty delimiter frame".to_string());
	}
	Ok(RouterFrame { connection_id, msg_type, payload })
}

/// A single parsed SUB inbound multipart, see SPEC_FULL.md §6.
pub(crate) struct SubFrame {
	pub subscription: Subscription,
	pub connection_id: Vec<u8>,
	pub payload: Payload,
}

pub(crate) fn parse_sub_frame(mut parts: Vec<Vec<u8>>) -> Result<SubFrame, String> {
	if parts.len() < 2 {
		return Err(format!("expected at least 2 frames, got {}", parts.len()));
	}
	let payload = parts.split_off(2);
	let connection_id = parts.pop().expect("len checked above");
	let subscription = parts.pop().expect("len checked above");
	Ok(SubFrame { subscription, connection_id, payload })
}
