// This module contains all the constants that affect the behavior of the network.

/// How long a requester keeps the offer window open after the originating
/// discovery broadcast. The same value is used as the receive timeout for
/// every stream-transport read.
pub const RESPONSE_TIMEOUT_SECONDS: u64 = 10;

/// Fixed size of the control record preceding every chunk on the stream
/// transport. The record is ASCII, zero-padded to exactly this length.
pub const CONTROL_MESSAGE_SIZE: usize = 1024;

/// Maximum useful size of a single datagram message. Messages are never
/// fragmented; anything longer is rejected at encode time.
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// Listen backlog for the stream-transport listener.
pub const TCP_MAX_PENDING_CONNECTIONS: u32 = 10;

/// The stream-transport port of a peer is its UDP port plus this offset.
/// Peers are identified on the wire by (ip, udp_port) only; whoever opens
/// a stream connection applies the offset itself.
pub const STREAM_PORT_OFFSET: u16 = 1000;

/// Pause before re-flooding a discovery message to the neighbors. Damps
/// flood storms and gives the direct offer a head start.
pub const FLOOD_DEBOUNCE_SECONDS: u64 = 1;

/// Pause between consecutive payload slices on an outbound transfer.
/// Together with the per-node link speed this is the sole bandwidth
/// simulation mechanism.
pub const PACING_INTERVAL_SECONDS: u64 = 1;
