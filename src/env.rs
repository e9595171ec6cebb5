use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::Level;

use crate::biq::{biq_pair, BiQ, ClientId, MsgType, Subscription};
use crate::control::{ControlRequest, UpdatePeersReq};
use crate::error::BrokerError;
use crate::heartbeat::{now_ms, HeartbeatState, HeartbeatTable};
use crate::peer::{validate_no_collisions, PeerId};
use crate::sockets;
use crate::ticker;
use crate::wake::{WakeReceiver, WakeSender};

/// Caller-supplied log sink: `(level, text) -> ()`. Invoked alongside (not
/// instead of) this crate's own `tracing` events, per SPEC_FULL.md §10.3.
pub type LogSink = Arc<dyn Fn(Level, &str) + Send + Sync>;

/// The collaborator-provided environment: a ZMQ context and a log sink.
/// Construction of the context/log backend is out of scope for this crate
/// (SPEC_FULL.md §1) — the caller builds one and hands it in.
///
/// `Clone` since `zmq::Context` is itself a cheap, `Arc`-backed handle (the
/// same way the donor passes `zmq_context.clone()` into each thread it
/// spawns, e.g. `core.rs::start_client`'s `auth::start_authentication_thread
/// (zmq_context.clone())`); this lets the heartbeat ticker hold its own
/// handle to the log sink without needing the whole `ClientEnv`.
#[derive(Clone)]
pub struct GlobalEnv {
	pub(crate) context: zmq::Context,
	pub(crate) log: LogSink,
}

impl GlobalEnv {
	pub fn new(context: zmq::Context, log: LogSink) -> Self {
		GlobalEnv { context, log }
	}

	pub(crate) fn log(&self, level: Level, text: &str) {
		(self.log)(level, text);
		match level {
			Level::ERROR => tracing::error!("{text}"),
			Level::WARN => tracing::warn!("{text}"),
			Level::INFO => tracing::info!("{text}"),
			Level::DEBUG => tracing::debug!("{text}"),
			Level::TRACE => tracing::trace!("{text}"),
		}
	}
}

/// Bundle of broker-exclusive resources, handed over to `run_broker` and
/// taken out of `ClientEnv` exactly once. Sockets must never be touched by
/// more than one thread; this `Option`-in-a-`Mutex` is how we enforce that
/// `run_broker` consumes them exactly once even though `ClientEnv` itself
/// is a cheaply cloned, multi-threaded handle.
pub(crate) struct BrokerSockets {
	pub router: zmq::Socket,
	pub sub: zmq::Socket,
	pub wake_recv: WakeReceiver,
	pub control_rx: Receiver<ControlRequest>,
}

struct ClientEnvInner {
	global: GlobalEnv,
	control_tx: Sender<ControlRequest>,
	control_wake: WakeSender,
	// The wake-channel endpoint, kept independently of `sockets` so a new
	// producer (e.g. a client registering after `run_broker` has already
	// taken the sockets) can still connect one. `WakeReceiver::connect_sender`
	// itself doesn't need exclusive access to the receiver, only its endpoint.
	wake_endpoint: String,
	peers_snapshot: RwLock<BTreeSet<PeerId>>,
	hb: Arc<Mutex<HeartbeatTable>>,
	sockets: Mutex<Option<BrokerSockets>>,
	shutdown: Arc<AtomicBool>,
	ticker_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Shared handle to a running (or about-to-run) broker. Cheap to clone;
/// every clone refers to the same underlying broker.
#[derive(Clone)]
pub struct ClientEnv(Arc<ClientEnvInner>);

/// Build the broker's sockets and tables for `initial_peers`, spawn the
/// heartbeat ticker, and return a handle usable from any thread.
/// `run_broker` must be called (typically on its own thread) for any
/// traffic to actually flow.
pub fn create_env(
	global: GlobalEnv,
	initial_peers: impl IntoIterator<Item = PeerId>,
) -> Result<ClientEnv, BrokerError> {
	let initial_peers: BTreeSet<PeerId> = initial_peers.into_iter().collect();
	validate_no_collisions(&initial_peers).map_err(|e| BrokerError::ConfigError(e.to_string()))?;

	let router = sockets::new_router(&global.context)?;
	let sub = sockets::new_sub(&global.context)?;

	let now = now_ms();
	let mut hb = HeartbeatTable::new();
	for peer in &initial_peers {
		sockets::connect_peer(&router, &sub, peer)?;
		hb.insert(peer.clone(), HeartbeatState::new_peer(now));
	}

	let wake_recv = WakeReceiver::bind(&global.context)?;
	let wake_endpoint = wake_recv.endpoint().to_string();
	let control_wake = wake_recv.connect_sender(&global.context)?;
	let (control_tx, control_rx) = crossbeam_channel::unbounded();

	let hb = Arc::new(Mutex::new(hb));
	let shutdown = Arc::new(AtomicBool::new(false));

	let inner = Arc::new(ClientEnvInner {
		control_tx,
		control_wake,
		wake_endpoint,
		peers_snapshot: RwLock::new(initial_peers),
		hb: hb.clone(),
		sockets: Mutex::new(Some(BrokerSockets { router, sub, wake_recv, control_rx })),
		shutdown: shutdown.clone(),
		ticker_handle: Mutex::new(None),
		global,
	});

	let ticker_control_tx = inner.control_tx.clone();
	let ticker_wake = inner.new_wake_sender()?;
	let ticker_global = inner.global.clone();
	let handle = ticker::spawn(hb, ticker_control_tx, ticker_wake, shutdown, ticker_global);
	*inner.ticker_handle.lock() = Some(handle);

	Ok(ClientEnv(inner))
}

impl ClientEnvInner {
	/// Usable at any point in `ClientEnv`'s lifetime, including after
	/// `run_broker` has already taken `sockets` out — connecting a new wake
	/// producer only needs the endpoint string, not the live `WakeReceiver`.
	fn new_wake_sender(&self) -> Result<WakeSender, BrokerError> {
		WakeSender::connect(&self.global.context, &self.wake_endpoint)
	}
}

/// Tear down a broker: signals the ticker and the broker loop to stop.
/// Socket teardown (linger=0, close) happens on the broker thread itself
/// when it notices the shutdown signal, in `broker::run` — ZMQ sockets may
/// only ever be touched by the thread that owns them (SPEC_FULL.md §5), so
/// `term_env` cannot safely close them directly from the caller's thread.
pub fn term_env(env: &ClientEnv) {
	env.0.shutdown.store(true, Ordering::SeqCst);
	env.0.control_wake.ping();
	if let Some(handle) = env.0.ticker_handle.lock().take() {
		let _ = handle.join();
	}
}

/// Allocate a `BiQ` and enqueue a `Register` control request. Returns
/// immediately; the `BiQ` is usable right away (sends simply queue up
/// until the broker applies the registration). If the registration is
/// ultimately rejected, an `InboundEvent::RegistrationRejected` is the
/// only event this client will ever see on its recv side.
pub fn register_client(
	env: &ClientEnv,
	client_id: ClientId,
	msg_types: Vec<MsgType>,
	subs: Vec<Subscription>,
) -> Result<BiQ, BrokerError> {
	let wake = Arc::new(env.0.new_wake_sender()?);
	let (biq, channel) = biq_pair(wake);
	let request = ControlRequest::Register { client_id, msg_types, subs, channel };
	let _ = env.0.control_tx.send(request);
	env.0.control_wake.ping();
	Ok(biq)
}

pub fn update_peers(env: &ClientEnv, req: UpdatePeersReq) {
	let _ = env.0.control_tx.send(ControlRequest::UpdatePeers { add: req.add, del: req.del });
	env.0.control_wake.ping();
}

/// Snapshot-read of the current peer set. The only facade operation that
/// reads broker state from outside the broker thread.
pub fn get_peers(env: &ClientEnv) -> BTreeSet<PeerId> {
	env.0.peers_snapshot.read().clone()
}

impl ClientEnv {
	pub(crate) fn global(&self) -> &GlobalEnv {
		&self.0.global
	}

	pub(crate) fn take_sockets(&self) -> Option<BrokerSockets> {
		self.0.sockets.lock().take()
	}

	pub(crate) fn publish_peers(&self, peers: BTreeSet<PeerId>) {
		*self.0.peers_snapshot.write() = peers;
	}

	pub(crate) fn hb(&self) -> Arc<Mutex<HeartbeatTable>> {
		self.0.hb.clone()
	}

	pub(crate) fn is_shutdown(&self) -> bool {
		self.0.shutdown.load(Ordering::SeqCst)
	}
}

impl Drop for ClientEnvInner {
	fn drop(&mut self) {
		if let Some(handle) = self.ticker_handle.lock().take() {
			self.shutdown.store(true, Ordering::SeqCst);
			self.control_wake.ping();
			let _ = handle.join();
		}
	}
}
