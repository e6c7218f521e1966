//! Protocol constants and tuning defaults.
//!
//! Anything an operator may want to change also has a field in
//! [`Config`](crate::config::Config); the values here are the defaults it
//! falls back to.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &str = "-RS0100-";

/// User agent string for tracker requests
pub const USER_AGENT: &str = "rswarm/0.1.0";

// ============================================================================
// Ports
// ============================================================================

/// First port tried for the inbound listener
pub const DEFAULT_PORT_START: u16 = 6881;

/// Last port tried for the inbound listener
pub const DEFAULT_PORT_END: u16 = 6889;

// ============================================================================
// Wire protocol
// ============================================================================

/// Protocol identifier sent in the handshake
pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Length of the handshake message in bytes
pub const HANDSHAKE_LEN: usize = 68;

/// Largest frame accepted from a peer. Whole-piece transfers need room for
/// the largest piece plus the piece header.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

// ============================================================================
// Choking
// ============================================================================

/// Maximum active (reciprocating) unchoked peers
pub const MAX_ACTIVE_PEERS: usize = 4;

/// Maximum optimistically unchoked peers
pub const MAX_OPTIMISTIC_PEERS: usize = 1;

/// Time between choke controller ticks
pub const CHOKE_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// Scheduling
// ============================================================================

/// Pieces that may be requested concurrently
pub const MAX_IN_FLIGHT_PIECES: usize = 25;

/// End-game starts once fewer than this fraction of pieces is pending
pub const ENDGAME_THRESHOLD: f64 = 0.10;

/// Minimum spacing between end-game re-requests of the same piece
pub const ENDGAME_INTERVAL: Duration = Duration::from_secs(5);

/// Scheduler back-off when nothing can be requested
pub const SCHEDULER_IDLE: Duration = Duration::from_millis(100);

/// In-flight piece is returned to the pending set after this long
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Uploading
// ============================================================================

/// Queued upload requests allowed per peer
pub const MAX_QUEUED_REQUESTS: usize = 64;

// ============================================================================
// Timeouts and intervals
// ============================================================================

/// Keep-alive message interval
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// A peer that sends nothing for this long is disconnected
pub const READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Outbound TCP connect + handshake timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Tracker HTTP request timeout
pub const TRACKER_TIMEOUT: Duration = Duration::from_secs(30);

/// Wait before re-announcing after a failed or empty announce
pub const TRACKER_RETRY: Duration = Duration::from_secs(5);

/// Fallback re-announce interval when the tracker omits one
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1800);

// ============================================================================
// Connection limits
// ============================================================================

/// Maximum simultaneous peer connections
pub const MAX_PEERS: usize = 50;

/// Capacity of the link-to-coordinator event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;
