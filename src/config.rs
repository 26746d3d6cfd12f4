//! Engine-construction constants and the knobs the CLI is allowed to
//! override.

use std::time::Duration;

/// The BitTorrent peer wire protocol's block size. Not configurable: it is
/// part of the wire contract this client speaks, not a tuning knob.
pub const BLOCK_LEN: u32 = 16 * 1024;

/// Default bound on concurrently-running peer sessions.
pub const DEFAULT_MAX_PEERS: usize = 45;

/// Default port advertised to the tracker. This client never listens, so
/// the value is purely advisory.
pub const DEFAULT_PORT: u16 = 6881;

/// Capacity of the peer-address queue between the tracker poller and the
/// worker pool.
pub const PEER_QUEUE_CAPACITY: usize = 256;

/// Tuning knobs for a single engine run.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Max number of peer sessions running concurrently.
    pub max_peers: usize,
    /// Port advertised to the tracker.
    pub port: u16,
    /// Bound on TCP connect + handshake.
    pub connect_timeout: Duration,
    /// Inactivity bound on the peer message-read loop.
    pub read_timeout: Duration,
    /// Block size used for REQUEST generation.
    pub block_len: u32,
    /// Bound on the tracker HTTP connect + request/response round trip.
    pub tracker_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_peers: DEFAULT_MAX_PEERS,
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(2),
            block_len: BLOCK_LEN,
            tracker_timeout: Duration::from_secs(15),
        }
    }
}
