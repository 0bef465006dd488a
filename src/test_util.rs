use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time;

use crate::connection_id::ConnectionId;
use crate::message_dispatcher::{Delivery, MessageDispatcher};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatcherEvent {
    Listening(SocketAddr),
    Established(ConnectionId, SocketAddr),
    Message(ConnectionId, Delivery, Vec<u8>),
    Closed(ConnectionId, SocketAddr),
}

/// Dispatcher that records every callback, for asserting on event sequences in tests.
pub struct RecordingDispatcher {
    events: Mutex<Vec<DispatcherEvent>>,
}

impl RecordingDispatcher {
    pub fn new() -> Arc<RecordingDispatcher> {
        Arc::new(RecordingDispatcher {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<DispatcherEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Poll until the recorded events satisfy the predicate. Meant to be wrapped in
    ///  `tokio::time::timeout` by the caller when running on a real clock.
    pub async fn wait_until(&self, predicate: impl Fn(&[DispatcherEvent]) -> bool) {
        loop {
            if predicate(self.events.lock().unwrap().as_slice()) {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl MessageDispatcher for RecordingDispatcher {
    async fn on_listening(&self, local_addr: SocketAddr) {
        self.events
            .lock()
            .unwrap()
            .push(DispatcherEvent::Listening(local_addr));
    }

    async fn on_connection_established(&self, connection_id: ConnectionId, peer_addr: SocketAddr) {
        self.events
            .lock()
            .unwrap()
            .push(DispatcherEvent::Established(connection_id, peer_addr));
    }

    async fn on_message(
        &self,
        connection_id: ConnectionId,
        _peer_addr: SocketAddr,
        delivery: Delivery,
        data: &[u8],
    ) {
        self.events
            .lock()
            .unwrap()
            .push(DispatcherEvent::Message(connection_id, delivery, data.to_vec()));
    }

    async fn on_connection_closed(&self, connection_id: ConnectionId, peer_addr: SocketAddr) {
        self.events
            .lock()
            .unwrap()
            .push(DispatcherEvent::Closed(connection_id, peer_addr));
    }
}
