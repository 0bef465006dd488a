//! SNP is a lightweight connection-oriented transport protocol running on top of UDP. It
//!  provides two delivery modes - ordered/reliable and best-effort/unreliable - multiplexed
//!  over per-peer 'connections', prioritising implementation simplicity and low latency over
//!  TCP-style completeness.
//!
//! ## Design goals
//!
//! * Connections are cheap: several logical connections can share a pair of UDP ports. A
//!    connection is identified by a random connection id plus the remote address/port tuple,
//!    so a single listening socket serves any number of peers.
//! * The abstraction is sending / receiving *messages* (i.e. defined-length chunks of data
//!   as opposed to streams of bytes)
//! * Reliable messages are delivered in send order, effectively exactly once, based on
//!   per-connection sequence numbers, cumulative acknowledgement and retransmission
//!   * there is *no* reordering buffer: a packet arriving ahead of a gap is dropped, and
//!      the sender's retransmission of the missing packet restores order eventually. This
//!      trades potential stalls under loss for a radically simple receiver.
//! * Unreliable messages are never acknowledged or retransmitted, but they carry the
//!   sender's reliable sequence number as a checkpoint: a receiver discards any unreliable
//!   message that does not match its current reliable state, because the message may refer
//!   to state changes enacted by reliable messages
//! * Connections are kept alive explicitly: a peer that has nothing to send emits periodic
//!   keepalives, and a connection with no inbound traffic for a configured timeout is
//!   closed unilaterally
//! * All timers (retransmission, keepalive, timeout, connect retry) are polled from a
//!   single periodic tick per endpoint rather than per-entry timers - resolution is bounded
//!   by the tick interval, which keeps the concurrency model trivial
//! * explicitly *no* congestion control, flow control, path MTU discovery or encryption
//!    --> different trade-offs than TCP / QUIC
//!
//! ## Wire format
//!
//! Every UDP datagram carries exactly one envelope (all multi-byte integers are
//!  varint-encoded):
//!
//! ```ascii
//! 0:  kind (u8):
//!     * 1 CONNECTION_REQUEST
//!     * 2 CONNECTION_ACCEPT
//!     * 3 NO_CONNECTION
//!     * 4 CONNECTION_CLOSE
//!     * 5 KEEP_ALIVE
//!     * 6 SEND_RELIABLE
//!     * 7 SEND_UNRELIABLE
//!     * 8 ACKNOWLEDGEMENT
//! *:  connection id (varint u32)
//! *:  kind-specific fields:
//!     * SEND_RELIABLE:    reliable sequence number (varint u64),
//!                          data length (varint) followed by the raw bytes
//!     * SEND_UNRELIABLE:  reliable sequence number (varint u64),
//!                          unreliable sequence number (varint u64),
//!                          data length (varint) followed by the raw bytes
//!     * ACKNOWLEDGEMENT:  last sequence number seen (varint u64)
//!     * all other kinds have no additional fields
//! ```
//!
//! ## Connection lifecycle
//!
//! A client opens a connection by picking a random connection id and sending
//!  CONNECTION_REQUEST, retrying at the retransmit interval until the attempt window
//!  expires. The server creates its side of the connection when the first request arrives
//!  and answers CONNECTION_ACCEPT (idempotently - retransmitted requests are answered
//!  again). The client promotes its pending request to a connection when the first reply
//!  for that id and source address arrives (any kind except NO_CONNECTION and
//!  CONNECTION_CLOSE) - the reply is consumed purely as a promotion signal and is not
//!  delivered into the new connection.
//!
//! Teardown is symmetric and unacknowledged: a voluntary close sends CONNECTION_CLOSE once;
//!  receiving CONNECTION_CLOSE (or NO_CONNECTION, the answer to an envelope for an unknown
//!  connection) closes the local side without a reciprocal close. Inactivity beyond the
//!  connection timeout closes a connection unilaterally.

pub mod client_end_point;
pub mod config;
pub mod connection;
pub mod connection_id;
pub mod connection_registry;
pub mod envelope;
pub mod message_dispatcher;
pub mod send_socket;
pub mod server_end_point;

#[cfg(test)]
pub(crate) mod test_util;

pub use client_end_point::ClientEndPoint;
pub use config::SnpConfig;
pub use connection::Connection;
pub use connection_id::ConnectionId;
pub use envelope::{Envelope, Payload};
pub use message_dispatcher::{Delivery, MessageDispatcher};
pub use send_socket::SendSocket;
pub use server_end_point::ServerEndPoint;
