//! Component H: a dedicated thread that advances every peer's heartbeat
//! state on a fixed resolution and asks the broker to reconnect whatever
//! just went quiet. Mirrors the donor engine's separate heartbeat-monitor
//! thread pattern (rather than folding liveness decay into the broker's
//! own select loop), so a slow broker iteration can never skew the clock
//! peers are judged dead against.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, info_span, trace, Level};

use crate::config::TICKER_RESOLUTION;
use crate::control::ControlRequest;
use crate::env::GlobalEnv;
use crate::heartbeat::{now_ms, tick, HeartbeatTable};
use crate::wake::WakeSender;

pub(crate) fn spawn(
	hb: Arc<Mutex<HeartbeatTable>>,
	control_tx: Sender<ControlRequest>,
	wake: WakeSender,
	shutdown: Arc<AtomicBool>,
	global: GlobalEnv,
) -> JoinHandle<()> {
	std::thread::Builder::new()
		.name("p2p-broker-ticker".into())
		.spawn(move || run(hb, control_tx, wake, shutdown, global))
		.expect("failed to spawn heartbeat ticker thread")
}

fn run(
	hb: Arc<Mutex<HeartbeatTable>>,
	control_tx: Sender<ControlRequest>,
	wake: WakeSender,
	shutdown: Arc<AtomicBool>,
	global: GlobalEnv,
) {
	let _span = info_span!("p2p_heartbeat_ticker").entered();
	global.log(Level::DEBUG, "heartbeat ticker started");

	while !shutdown.load(Ordering::SeqCst) {
		std::thread::sleep(TICKER_RESOLUTION);
		if shutdown.load(Ordering::SeqCst) {
			break;
		}

		let outcome = {
			let mut table = hb.lock();
			tick(&mut table, now_ms())
		};
		trace!(peers_checked = outcome.newly_reconnecting.len(), "heartbeat tick");

		if !outcome.newly_reconnecting.is_empty() {
			debug!(peers = ?outcome.newly_reconnecting, "peers went quiet, requesting reconnect");
			global.log(
				Level::DEBUG,
				&format!("heartbeat ticker requesting reconnect for {:?}", outcome.newly_reconnecting),
			);
			let request = ControlRequest::Reconnect { peers: outcome.newly_reconnecting };
			if control_tx.send(request).is_err() {
				break;
			}
			wake.ping();
		}
	}

	global.log(Level::DEBUG, "heartbeat ticker stopped");
}
