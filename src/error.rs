use crate::peer::PeerId;
use thiserror::Error;

/// Errors surfaced by the broker.
///
/// `InvariantViolation` is the only variant that ever terminates the broker
/// loop; everything else is either logged-and-dropped or handed back to a
/// caller through a control-request result or a client's recv-queue.
#[derive(Debug, Error)]
pub enum BrokerError {
	#[error("invariant violation: {0}")]
	InvariantViolation(String),

	#[error("config error: {0}")]
	ConfigError(String),

	#[error("registration rejected: {0}")]
	RegistrationRejected(String),

	#[error("malformed frame: {0}")]
	MalformedFrame(String),

	#[error("no peers available to send to")]
	NoPeers,

	#[error("zmq error on {context}: {source}")]
	Zmq {
		context: &'static str,
		#[source]
		source: zmq::Error,
	},
}

impl BrokerError {
	pub(crate) fn zmq(context: &'static str, source: zmq::Error) -> Self {
		BrokerError::Zmq { context, source }
	}
}

/// Why a registration was rejected; kept separate from [`BrokerError`] so
/// that `register_client` can report it synchronously to the caller without
/// forcing every consumer of [`BrokerError`] to match on registration
/// specifics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
	#[error("client id already registered")]
	ClientIdExists,
	#[error("msg_type already owned by another client")]
	MsgTypeOwned,
}

/// A configuration problem detected while validating a peer set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerConfigError {
	#[error("connection id for {0:?} is {1} bytes, outside the 1..=254 range ZMQ allows")]
	ConnectionIdLength(PeerId, usize),
	#[error("peers {0:?} and {1:?} derive the same connection id {2:?}")]
	ConnectionIdCollision(PeerId, PeerId, Vec<u8>),
}
