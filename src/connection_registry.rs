use std::net::SocketAddr;
use tokio::time::Instant;

use crate::connection::Connection;
use crate::connection_id::ConnectionId;

/// The set of open connections of an endpoint.
///
/// Lookup is a linear scan: connection ids are random, so an id alone does not identify a
///  connection - the peer address is part of the key - and endpoints are expected to hold
///  tens of connections, not thousands, so a flat Vec beats a map on simplicity and is fast
///  enough.
pub struct ConnectionRegistry {
    connections: Vec<Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry {
            connections: Vec::new(),
        }
    }

    pub fn insert(&mut self, connection: Connection) {
        self.connections.push(connection);
    }

    /// A connection is identified by the id *and* the peer address: two peers can pick the
    ///  same random id without clashing.
    pub fn get_mut(
        &mut self,
        connection_id: ConnectionId,
        peer_addr: SocketAddr,
    ) -> Option<&mut Connection> {
        self.connections
            .iter_mut()
            .find(|c| c.connection_id() == connection_id && c.peer_addr() == peer_addr)
    }

    /// Drop connections that closed since the last sweep. Connections only flag themselves as
    ///  closed; actual removal happens here, once, regardless of which path closed them.
    pub fn sweep_closed(&mut self) {
        self.connections.retain(|c| !c.is_closed());
    }

    /// Run per-connection maintenance with a single consistent timestamp, then sweep whatever
    ///  timed out.
    pub async fn tick_all(&mut self, now: Instant) {
        for connection in self.connections.iter_mut() {
            connection.tick(now).await;
        }
        self.sweep_closed();
    }

    /// Voluntarily close all connections, e.g. on endpoint shutdown.
    pub async fn close_all(&mut self) {
        for connection in self.connections.iter_mut() {
            connection.close().await;
        }
        self.connections.clear();
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
