use std::collections::BTreeSet;

use crate::biq::{ClientChannel, ClientId, MsgType, Subscription};
use crate::peer::PeerId;

/// Carried on the single MPSC control queue from the public facade and the
/// heartbeat ticker to the broker. Only the broker ever dequeues.
pub(crate) enum ControlRequest {
	Register {
		client_id: ClientId,
		msg_types: Vec<MsgType>,
		subs: Vec<Subscription>,
		channel: ClientChannel,
	},
	UpdatePeers {
		add: BTreeSet<PeerId>,
		del: BTreeSet<PeerId>,
	},
	Reconnect {
		peers: Vec<PeerId>,
	},
}

/// Public request shape for `update_peers`.
#[derive(Debug, Clone, Default)]
pub struct UpdatePeersReq {
	pub add: BTreeSet<PeerId>,
	pub del: BTreeSet<PeerId>,
}
