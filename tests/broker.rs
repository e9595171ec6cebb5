//! End-to-end tests against a real `zmq::Context`: these spin up a fake
//! peer (a bound ROUTER + PUB pair playing the role of a remote node) and
//! drive a real `run_broker` against it on a background thread. Mirrors
//! the donor's own `connect_two_nodes` integration test in spirit (spawn
//! real sockets, `sleep` past the handshake, then assert delivery) rather
//! than mocking ZMQ out.

use std::sync::Arc;
use std::time::Duration;

use p2p_client_broker::{
	create_env, get_peers, register_client, run_broker, term_env, update_peers, GlobalEnv,
	InboundEvent, OutboundMessage, PeerId, UpdatePeersReq,
};

fn silent_log() -> p2p_client_broker::LogSink {
	Arc::new(|_level, _text| {})
}

/// Human-readable `tracing` output for these tests, controlled by
/// `RUST_LOG`; harmless to call more than once per test binary.
fn init_tracing() {
	let _ = tracing_subscriber::FmtSubscriber::builder()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.try_init();
}

fn free_port_pair() -> (u16, u16) {
	// Bind then immediately release two ephemeral ports; good enough for
	// a single-process test run, not safe under heavy parallelism.
	let a = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
	let b = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
	(a, b)
}

/// A fake remote node: a bound ROUTER (for RPC-style requests) and a bound
/// PUB (for publications), standing in for another broker instance.
///
/// Publications carry the sending peer's own connection id as their
/// second frame (`[topic, connection_id, payload...]`) since, unlike
/// ROUTER, PUB/SUB carries no sender identity of its own — attributing a
/// publication to a peer is an application-level convention this wire
/// format adds on top.
struct FakePeer {
	router: zmq::Socket,
	pub_socket: zmq::Socket,
	connection_id: Vec<u8>,
}

impl FakePeer {
	fn bind(ctx: &zmq::Context, peer: &PeerId) -> Self {
		let router = ctx.socket(zmq::ROUTER).unwrap();
		router.set_router_mandatory(true).unwrap();
		router.bind(&peer.router_endpoint()).unwrap();

		let pub_socket = ctx.socket(zmq::PUB).unwrap();
		pub_socket.bind(&peer.pub_endpoint()).unwrap();

		FakePeer { router, pub_socket, connection_id: peer.connection_id() }
	}

	/// Receive one request and immediately echo it back to the same
	/// sender, as `[sender_id, "", msg_type, payload...]`.
	fn echo_once(&self, timeout: Duration) -> bool {
		let mut items = [self.router.as_poll_item(zmq::POLLIN)];
		if zmq::poll(&mut items, timeout.as_millis() as i64).unwrap() == 0 {
			return false;
		}
		let parts = self.router.recv_multipart(0).unwrap();
		self.router.send_multipart(parts, 0).unwrap();
		true
	}

	fn publish(&self, topic: &[u8], payload: &[u8]) {
		self.pub_socket.send_multipart([topic, self.connection_id.as_slice(), payload], 0).unwrap();
	}
}

#[test]
fn request_reply_round_trip() {
	init_tracing();
	let ctx = zmq::Context::new();
	let (router_port, pub_port) = free_port_pair();
	let peer = PeerId::new("127.0.0.1", router_port, pub_port);
	let fake_peer = FakePeer::bind(&ctx, &peer);

	let global = GlobalEnv::new(ctx, silent_log());
	let env = create_env(global, [peer.clone()]).expect("create_env");

	let broker_env = env.clone();
	let broker_thread = std::thread::spawn(move || run_broker(&broker_env));

	let biq = register_client(&env, b"alice".to_vec(), vec![b"ping".to_vec()], vec![])
		.expect("register_client");

	// Give the broker a moment to process the registration and for the
	// ROUTER connection to complete its handshake before we send.
	std::thread::sleep(Duration::from_millis(200));

	biq.send(OutboundMessage { peer: None, msg_type: b"ping".to_vec(), payload: vec![b"hello".to_vec()] });

	assert!(fake_peer.echo_once(Duration::from_secs(2)), "fake peer never saw the request");

	let event = biq.recv().expect("broker thread died before replying");
	match event {
		InboundEvent::Message { peer: from, msg_type, payload } => {
			assert_eq!(from, peer);
			assert_eq!(msg_type, b"ping");
			assert_eq!(payload, vec![b"hello".to_vec()]);
		},
		other => panic!("unexpected event: {other:?}"),
	}

	term_env(&env);
	broker_thread.join().unwrap().expect("broker loop exited with an error");
}

#[test]
fn publication_fans_out_to_every_subscriber() {
	init_tracing();
	let ctx = zmq::Context::new();
	let (router_port, pub_port) = free_port_pair();
	let peer = PeerId::new("127.0.0.1", router_port, pub_port);
	let fake_peer = FakePeer::bind(&ctx, &peer);

	let global = GlobalEnv::new(ctx, silent_log());
	let env = create_env(global, [peer.clone()]).expect("create_env");

	let broker_env = env.clone();
	let broker_thread = std::thread::spawn(move || run_broker(&broker_env));

	let alice = register_client(&env, b"alice".to_vec(), vec![], vec![b"blocks".to_vec()]).unwrap();
	let bob = register_client(&env, b"bob".to_vec(), vec![], vec![b"blocks".to_vec()]).unwrap();

	std::thread::sleep(Duration::from_millis(200));
	fake_peer.publish(b"blocks", b"block-42");

	for biq in [&alice, &bob] {
		let event = biq.recv().expect("broker thread died before publishing");
		match event {
			InboundEvent::Publication { peer: from, subscription, payload } => {
				assert_eq!(from, peer);
				assert_eq!(subscription, b"blocks");
				assert_eq!(payload, vec![b"block-42".to_vec()]);
			},
			other => panic!("unexpected event: {other:?}"),
		}
	}

	term_env(&env);
	broker_thread.join().unwrap().expect("broker loop exited with an error");
}

#[test]
fn send_with_no_peers_reports_no_peers() {
	init_tracing();
	let ctx = zmq::Context::new();
	let global = GlobalEnv::new(ctx, silent_log());
	let env = create_env(global, std::iter::empty()).expect("create_env");

	let broker_env = env.clone();
	let broker_thread = std::thread::spawn(move || run_broker(&broker_env));

	let biq = register_client(&env, b"alice".to_vec(), vec![b"ping".to_vec()], vec![]).unwrap();
	std::thread::sleep(Duration::from_millis(50));
	biq.send(OutboundMessage { peer: None, msg_type: b"ping".to_vec(), payload: vec![] });

	assert!(matches!(biq.recv(), Some(InboundEvent::NoPeers)));

	term_env(&env);
	broker_thread.join().unwrap().expect("broker loop exited with an error");
}

#[test]
fn update_peers_is_reflected_in_get_peers() {
	init_tracing();
	let ctx = zmq::Context::new();
	let (router_port, pub_port) = free_port_pair();
	let peer = PeerId::new("127.0.0.1", router_port, pub_port);
	let _fake_peer = FakePeer::bind(&ctx, &peer);

	let global = GlobalEnv::new(ctx, silent_log());
	let env = create_env(global, std::iter::empty()).expect("create_env");

	let broker_env = env.clone();
	let broker_thread = std::thread::spawn(move || run_broker(&broker_env));

	assert!(get_peers(&env).is_empty());

	update_peers(&env, UpdatePeersReq { add: [peer.clone()].into_iter().collect(), del: Default::default() });

	// get_peers only reflects a snapshot published by the broker thread
	// once it has applied the request; poll briefly rather than sleeping
	// a single fixed duration.
	let mut seen = false;
	for _ in 0..50 {
		if get_peers(&env).contains(&peer) {
			seen = true;
			break;
		}
		std::thread::sleep(Duration::from_millis(20));
	}
	assert!(seen, "peer never appeared in get_peers() snapshot");

	term_env(&env);
	broker_thread.join().unwrap().expect("broker loop exited with an error");
}

/// S3: kill the remote peer, wait past the liveness window
/// (LIVENESS_MAX * INTERVAL_MIN ≈ 10s), rebind a peer on the same
/// endpoints, and confirm traffic flows again — the broker's own
/// Reconnect application and ZMQ's background TCP reconnect both
/// contribute here, so this proves the end-to-end behavior rather than
/// isolating the heartbeat state machine (see heartbeat.rs's unit tests
/// for that). Ignored by default given the ~10s wait.
#[test]
#[ignore]
fn peer_drop_and_restart_eventually_resumes_traffic() {
	init_tracing();
	let ctx = zmq::Context::new();
	let (router_port, pub_port) = free_port_pair();
	let peer = PeerId::new("127.0.0.1", router_port, pub_port);

	let global = GlobalEnv::new(ctx.clone(), silent_log());
	let env = create_env(global, [peer.clone()]).expect("create_env");

	let broker_env = env.clone();
	let broker_thread = std::thread::spawn(move || run_broker(&broker_env));

	let biq = register_client(&env, b"alice".to_vec(), vec![b"ping".to_vec()], vec![])
		.expect("register_client");

	{
		let fake_peer = FakePeer::bind(&ctx, &peer);
		std::thread::sleep(Duration::from_millis(200));
		biq.send(OutboundMessage {
			peer: None,
			msg_type: b"ping".to_vec(),
			payload: vec![b"before".to_vec()],
		});
		assert!(fake_peer.echo_once(Duration::from_secs(2)), "first peer never saw the request");
		let _ = biq.recv().expect("no reply before killing the peer");
	} // fake_peer dropped here: its sockets close and the endpoints free up.

	std::thread::sleep(Duration::from_secs(11));

	let fake_peer = FakePeer::bind(&ctx, &peer);
	biq.send(OutboundMessage {
		peer: None,
		msg_type: b"ping".to_vec(),
		payload: vec![b"after".to_vec()],
	});
	assert!(
		fake_peer.echo_once(Duration::from_secs(5)),
		"restarted peer never saw a request after reconnect"
	);
	let event = biq.recv().expect("broker thread died before replying after reconnect");
	assert!(matches!(event, InboundEvent::Message { .. }));

	term_env(&env);
	broker_thread.join().unwrap().expect("broker loop exited with an error");
}

#[test]
fn duplicate_client_id_is_rejected_without_disturbing_the_first_registration() {
	init_tracing();
	let ctx = zmq::Context::new();
	let global = GlobalEnv::new(ctx, silent_log());
	let env = create_env(global, std::iter::empty()).expect("create_env");

	let broker_env = env.clone();
	let broker_thread = std::thread::spawn(move || run_broker(&broker_env));

	let first = register_client(&env, b"dup".to_vec(), vec![b"a".to_vec()], vec![]).unwrap();
	std::thread::sleep(Duration::from_millis(100));

	let second = register_client(&env, b"dup".to_vec(), vec![b"b".to_vec()], vec![]).unwrap();

	let rejection = second.recv().expect("broker thread died before rejecting");
	assert!(matches!(
		rejection,
		InboundEvent::RegistrationRejected(p2p_client_broker::RegistrationError::ClientIdExists)
	));

	// The first registration must still own "a": sending through it and
	// getting a NoPeers (rather than nothing at all, or a crash) shows
	// the broker is still alive and still routing for the first client.
	first.send(OutboundMessage { peer: None, msg_type: b"a".to_vec(), payload: vec![] });
	assert!(matches!(first.recv(), Some(InboundEvent::NoPeers)));

	term_env(&env);
	broker_thread.join().unwrap().expect("broker loop exited with an error");
}

/// S6: the broker subscribes `"_hb"` on behalf of every client internally,
/// but a client that never asked for it must never see it on its own
/// recv-queue — heartbeats only ever refresh liveness, they are not routed
/// as publications.
#[test]
fn heartbeat_topic_is_never_delivered_to_a_subscriber() {
	init_tracing();
	let ctx = zmq::Context::new();
	let (router_port, pub_port) = free_port_pair();
	let peer = PeerId::new("127.0.0.1", router_port, pub_port);
	let fake_peer = FakePeer::bind(&ctx, &peer);

	let global = GlobalEnv::new(ctx, silent_log());
	let env = create_env(global, [peer.clone()]).expect("create_env");

	let broker_env = env.clone();
	let broker_thread = std::thread::spawn(move || run_broker(&broker_env));

	// Registered for "blocks" only, never "_hb".
	let biq = register_client(&env, b"alice".to_vec(), vec![], vec![b"blocks".to_vec()]).unwrap();
	std::thread::sleep(Duration::from_millis(200));

	fake_peer.publish(b"_hb", b"");
	fake_peer.publish(b"blocks", b"block-7");

	let event = biq.recv().expect("broker thread died before publishing");
	match event {
		InboundEvent::Publication { subscription, payload, .. } => {
			assert_eq!(subscription, b"blocks", "heartbeat frame leaked to a non-subscriber");
			assert_eq!(payload, vec![b"block-7".to_vec()]);
		},
		other => panic!("unexpected event: {other:?}"),
	}

	term_env(&env);
	broker_thread.join().unwrap().expect("broker loop exited with an error");
}
