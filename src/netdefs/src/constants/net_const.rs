//! Flag words, port ranges, and timing defaults for the netcore engine.

use std::time::Duration;

/// ===== Socket flags =====
///
/// The socket is visible to receive lookups.  Cleared on deactivation and,
/// unless the socket was active before it became fully bound, on disconnect.
pub const SOCKET_FLAG_ACTIVE: u32 = 1 << 0;
/// The socket tolerates sharing its port with any other address, provided
/// the other socket carries this flag too.
pub const SOCKET_FLAG_REUSE_ANY_ADDRESS: u32 = 1 << 1;
/// The socket tolerates sharing its exact local address, provided the other
/// socket carries this flag too.
pub const SOCKET_FLAG_REUSE_EXACT_ADDRESS: u32 = 1 << 2;
/// The socket tolerates taking over a time-wait socket's binding, provided
/// the other socket carries this flag too.
pub const SOCKET_FLAG_REUSE_TIME_WAIT: u32 = 1 << 3;
/// The socket is lingering after close and is eligible for eviction by a new
/// bind under the reuse-time-wait policy.
pub const SOCKET_FLAG_TIME_WAIT: u32 = 1 << 4;
/// The socket was active before its move into the fully bound state.  Used
/// by disconnect to decide whether to restore the inactive state.
pub const SOCKET_FLAG_PREVIOUSLY_ACTIVE: u32 = 1 << 5;
/// The socket is a clone of a listening socket's binding; bind skips the
/// availability validation entirely for it.
pub const SOCKET_FLAG_FORKED_LISTENER: u32 = 1 << 6;
/// Multicast transmissions from this socket loop back to local receivers.
pub const SOCKET_FLAG_MULTICAST_LOOPBACK: u32 = 1 << 7;
/// Broadcast transmissions are refused on this socket.
pub const SOCKET_FLAG_BROADCAST_DISABLED: u32 = 1 << 8;

/// ===== Bind flags =====
///
/// Mark the socket active as part of the bind.
pub const BIND_FLAG_ACTIVATE: u32 = 1 << 0;
/// Do not assign an ephemeral port when the local port is zero.
pub const BIND_FLAG_NO_PORT_ASSIGNMENT: u32 = 1 << 1;

/// ===== Link capabilities =====
///
/// The device can enter promiscuous mode.
pub const LINK_CAPABILITY_PROMISCUOUS_MODE: u32 = 1 << 0;
/// The device can receive all multicast frames without full promiscuity.
pub const LINK_CAPABILITY_MULTICAST_ALL: u32 = 1 << 1;

/// ===== Buffer allocation flags =====
///
/// Reserve room for the device link layer's header.
pub const BUFFER_FLAG_ADD_DEVICE_LINK_HEADERS: u32 = 1 << 0;
/// Reserve room for the device link layer's footer.
pub const BUFFER_FLAG_ADD_DEVICE_LINK_FOOTERS: u32 = 1 << 1;
/// Reserve room for the data link layer's header.
pub const BUFFER_FLAG_ADD_DATA_LINK_HEADERS: u32 = 1 << 2;
/// Reserve room for the data link layer's footer.
pub const BUFFER_FLAG_ADD_DATA_LINK_FOOTERS: u32 = 1 << 3;

/// ===== I/O readiness events =====
///
/// The socket lost its connection (for example its link went down).
pub const POLL_EVENT_DISCONNECTED: u32 = 1 << 0;
/// An error is pending on the socket.
pub const POLL_EVENT_ERROR: u32 = 1 << 1;

/// ===== Ports and timing =====
///
/// First port of the automatically assigned range.
pub const EPHEMERAL_PORT_BEGIN: u32 = 49152;
/// Number of ports in the automatically assigned range.
pub const EPHEMERAL_PORT_COUNT: u32 = 16384;
/// Total time to wait for an address translation answer.
pub const TRANSLATION_TIMEOUT: Duration = Duration::from_secs(5);
/// Interval between repeated translation requests while waiting.
pub const TRANSLATION_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Packet buffer sizes are rounded up to this granularity, after the link's
/// transmit alignment has been applied.
pub const BUFFER_SIZE_GRANULARITY: usize = 64;

/// The link properties version the engine accepts.
pub const LINK_PROPERTIES_VERSION: u32 = 1;
