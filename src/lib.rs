//! Client-side ZeroMQ RPC/pub-sub broker.
//!
//! A single broker thread multiplexes any number of in-process clients over
//! one ROUTER socket (point-to-point requests) and one SUB socket (fan-out
//! publications) shared across a configurable peer set, with an adaptive
//! heartbeat driving automatic reconnects. See `GlobalEnv`/`create_env` for
//! the entry point.

mod biq;
mod broker;
mod config;
mod control;
mod env;
mod error;
mod heartbeat;
mod peer;
mod readiness;
mod routing;
mod sockets;
mod ticker;
mod wake;

pub use biq::{BiQ, ClientId, InboundEvent, MsgType, OutboundMessage, Payload, Subscription};
pub use broker::run_broker;
pub use control::UpdatePeersReq;
pub use env::{create_env, get_peers, register_client, term_env, update_peers, ClientEnv, GlobalEnv, LogSink};
pub use error::{BrokerError, PeerConfigError, RegistrationError};
pub use peer::PeerId;
