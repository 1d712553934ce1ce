//! Shared constants for hubwire.
//!
//! Defaults for [`crate::config::HubOptions`] and protocol-level limits live
//! here so the wire modules and the config layer agree on them.
//!
//! # Categories
//!
//! - **Wire**: separators and frame limits
//! - **Timeouts**: handshake, keepalive and client timeout defaults
//! - **Dispatch**: per-connection invocation and stream limits

use std::time::Duration;

// ============================================================================
// Wire
// ============================================================================

/// ASCII record separator terminating every text-framed message.
pub const RECORD_SEPARATOR: u8 = 0x1e;

/// Largest payload the binary framing will accept by default (512 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// A varint length prefix never exceeds five bytes (31 bits of length).
pub const MAX_LENGTH_PREFIX_SIZE: usize = 5;

/// Default cap on a single received hub message (32 KiB).
///
/// The handshake is subject to the same limit.
pub const DEFAULT_MAXIMUM_RECEIVE_MESSAGE_SIZE: usize = 32 * 1024;

/// Frames queued for one connection's writer before a slow-client warning.
///
/// The warning re-arms once the backlog drains below half this mark.
pub const OUTBOUND_HIGH_WATER_MARK: usize = 1024;

/// Read buffer size for transport reads.
pub const TRANSPORT_READ_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// Timeouts
// ============================================================================

/// Interval after which an idle connection is sent a `Ping`.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Time without any received bytes before the server drops a client.
///
/// Should be at least double the client's own keepalive interval.
pub const DEFAULT_CLIENT_TIMEOUT_INTERVAL: Duration = Duration::from_secs(30);

/// Time a new connection has to complete the handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Time a group command waits for the owning server's acknowledgment.
pub const DEFAULT_BACKPLANE_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Granularity of the keepalive / client-timeout check.
pub const KEEP_ALIVE_TICK: Duration = Duration::from_millis(250);

// ============================================================================
// Dispatch
// ============================================================================

/// Plain invocations a single client may have running at once.
pub const DEFAULT_MAX_PARALLEL_INVOCATIONS: usize = 1;

/// Buffered items per client-to-server upload stream.
pub const DEFAULT_STREAM_BUFFER_CAPACITY: usize = 10;

/// Default listen address for `hubwire serve`.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5000";

/// Default channel prefix for backplane channels.
pub const DEFAULT_BACKPLANE_PREFIX: &str = "hubwire";
