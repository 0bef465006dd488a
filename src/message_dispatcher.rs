use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;

use crate::connection_id::ConnectionId;

/// Whether a message arrived through the ordered/acknowledged path or the best-effort path.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Reliable,
    Unreliable,
}

/// The seam through which the protocol hands events to application code. Implementations
///  are called from the endpoint's single event loop, so they should return quickly -
///  long-running work belongs in a task or behind a channel.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    /// The endpoint's receive loop has started and datagrams are being processed.
    async fn on_listening(&self, local_addr: SocketAddr);

    /// A connection reached the open state - on the server when a request from an unknown
    ///  peer arrived, on the client when a pending request was answered.
    async fn on_connection_established(&self, connection_id: ConnectionId, peer_addr: SocketAddr);

    /// Application data was accepted by the sequencing rules and is delivered exactly once.
    async fn on_message(
        &self,
        connection_id: ConnectionId,
        peer_addr: SocketAddr,
        delivery: Delivery,
        data: &[u8],
    );

    /// The connection left the registry - voluntarily, by timeout, or peer-initiated. Emitted
    ///  at most once per connection.
    async fn on_connection_closed(&self, connection_id: ConnectionId, peer_addr: SocketAddr);
}
