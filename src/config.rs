//! Tuning knobs for the heartbeat/reconnect state machine and a couple of
//! protocol-level constants. Centralised here rather than scattered through
//! `heartbeat.rs`/`broker.rs` so a caller that owns its own configuration
//! layer has one place to point at.

use std::time::Duration;

/// Lower bound (and initial value) of a peer's heartbeat interval.
pub const INTERVAL_MIN_MS: i64 = 2_000;

/// Upper bound a peer's heartbeat interval backs off to.
pub const INTERVAL_MAX_MS: i64 = 32_000;

/// Number of silent ticks-of-interval tolerated before a peer is declared
/// dead and a reconnect is scheduled.
pub const LIVENESS_MAX: i64 = 5;

/// Grace period given to a freshly added peer before the ticker starts
/// decrementing its liveness, so the TCP handshake has time to complete.
pub const NEW_PEER_GRACE_MS: i64 = 2_000;

/// Minimum wall-clock resolution of the heartbeat ticker thread.
pub const TICKER_RESOLUTION: Duration = Duration::from_millis(50);

/// Reserved subscription key carrying peer heartbeats. Always subscribed,
/// never delivered to a client.
pub const HEARTBEAT_TOPIC: &[u8] = b"_hb";

/// ZMQ restricts ROUTER peer identities to this range.
pub const MIN_CONNECTION_ID_LEN: usize = 1;
pub const MAX_CONNECTION_ID_LEN: usize = 254;
