use std::collections::{BTreeSet, HashMap, HashSet};

use crate::biq::{ClientChannel, ClientId, MsgType, Subscription};
use crate::error::RegistrationError;
use crate::peer::PeerId;

/// All state mutated exclusively by the broker thread, aside from the
/// heartbeat table (shared with the ticker, see `broker::BrokerState`) and
/// the published `peers` snapshot (shared with `get_peers`, same place).
#[derive(Default)]
pub(crate) struct RoutingTables {
	pub peers: BTreeSet<PeerId>,
	pub clients: HashMap<ClientId, ClientChannel>,
	pub msg_owner: HashMap<MsgType, ClientId>,
	pub subs: HashMap<Subscription, HashSet<ClientId>>,
}

impl RoutingTables {
	/// Linear scan from a ROUTER connection id back to the `PeerId` it came
	/// from. Peer sets are expected small (low hundreds at most) so this
	/// avoids maintaining a second index that could desynchronize from
	/// `peers`.
	pub fn peer_for_connection_id(&self, connection_id: &[u8]) -> Option<&PeerId> {
		self.peers.iter().find(|p| p.connection_id() == connection_id)
	}
}

/// Validate and apply a `Register` request against the routing tables.
/// Returns the list of subscription keys that just became non-empty for
/// the first time (the caller must `subscribe` the SUB socket to these),
/// or a `RegistrationError` if nothing was mutated.
pub(crate) fn apply_register(
	tables: &mut RoutingTables,
	client_id: ClientId,
	msg_types: Vec<MsgType>,
	subs: Vec<Subscription>,
	channel: ClientChannel,
) -> Result<Vec<Subscription>, (RegistrationError, ClientChannel)> {
	if tables.clients.contains_key(&client_id) {
		return Err((RegistrationError::ClientIdExists, channel));
	}
	if msg_types.iter().any(|mt| tables.msg_owner.contains_key(mt)) {
		return Err((RegistrationError::MsgTypeOwned, channel));
	}

	tables.clients.insert(client_id.clone(), channel);
	for msg_type in msg_types {
		tables.msg_owner.insert(msg_type, client_id.clone());
	}

	let mut newly_subscribed = Vec::new();
	for sub in subs {
		let set = tables.subs.entry(sub.clone()).or_default();
		if set.is_empty() {
			newly_subscribed.push(sub);
		}
		set.insert(client_id.clone());
	}

	Ok(newly_subscribed)
}

/// Remove a client from every table it could appear in. Used when a
/// client's `BiQ` is observed to be gone (disconnected send/recv ends).
///
/// Prunes any subscription key whose subscriber set becomes empty as a
/// result, rather than leaving a dangling empty entry behind: a present
/// key with an empty subscriber set is a bookkeeping bug the broker loop
/// treats as fatal (SPEC_FULL.md §4.G), so removal must never produce one.
pub(crate) fn remove_client(tables: &mut RoutingTables, client_id: &ClientId) {
	tables.clients.remove(client_id);
	tables.msg_owner.retain(|_, owner| owner != client_id);
	tables.subs.retain(|_, set| {
		set.remove(client_id);
		!set.is_empty()
	});
}

/// Pure normalization of an `UpdatePeers` request, independent of routing
/// tables so it can be property-tested directly (SPEC_FULL.md §8, property
/// 2): `add' ∩ peers = ∅`, `del' ⊆ peers`, `add' ∩ del' = ∅`, and peers
/// present in both `add` and `del` are a no-op.
pub(crate) fn normalize_update(
	peers: &BTreeSet<PeerId>,
	add: &BTreeSet<PeerId>,
	del: &BTreeSet<PeerId>,
) -> (BTreeSet<PeerId>, BTreeSet<PeerId>) {
	let both: BTreeSet<PeerId> = add.intersection(del).cloned().collect();
	let add_prime: BTreeSet<PeerId> =
		add.difference(&both).filter(|p| !peers.contains(*p)).cloned().collect();
	let del_prime: BTreeSet<PeerId> =
		del.difference(&both).filter(|p| peers.contains(*p)).cloned().collect();
	(add_prime, del_prime)
}
