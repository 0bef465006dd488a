use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::bail;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{Mutex, Notify};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::config::SnpConfig;
use crate::connection::Connection;
use crate::connection_id::ConnectionId;
use crate::connection_registry::ConnectionRegistry;
use crate::envelope::{Envelope, Payload};
use crate::message_dispatcher::MessageDispatcher;
use crate::send_socket::{send_envelope, SendSocket};

/// The accepting side: creates a connection whenever a request from an unknown
///  (id, address) arrives, and answers anything else it has no connection for with
///  NO_CONNECTION. Unlike the client it initiates nothing, so there is no pending-request
///  bookkeeping on this side.
pub struct ServerEndPoint {
    receive_socket: Arc<UdpSocket>,
    send_socket: Arc<dyn SendSocket>,
    dispatcher: Arc<dyn MessageDispatcher>,
    config: Arc<SnpConfig>,
    connections: Mutex<ConnectionRegistry>,
    shutdown_signal: Notify,
}

impl ServerEndPoint {
    pub async fn new(
        bind_addr: SocketAddr,
        dispatcher: Arc<dyn MessageDispatcher>,
        config: Arc<SnpConfig>,
    ) -> anyhow::Result<ServerEndPoint> {
        config.validate()?;

        let receive_socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        info!("server endpoint: bound socket to {:?}", receive_socket.local_addr());

        let send_socket: Arc<dyn SendSocket> = Arc::new(receive_socket.clone());
        Ok(Self::from_parts(receive_socket, send_socket, dispatcher, config))
    }

    pub(crate) fn from_parts(
        receive_socket: Arc<UdpSocket>,
        send_socket: Arc<dyn SendSocket>,
        dispatcher: Arc<dyn MessageDispatcher>,
        config: Arc<SnpConfig>,
    ) -> ServerEndPoint {
        ServerEndPoint {
            receive_socket,
            send_socket,
            dispatcher,
            config,
            connections: Mutex::new(ConnectionRegistry::new()),
            shutdown_signal: Notify::new(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.send_socket.local_addr()
    }

    /// Send application data on an open connection (identified by the id the client picked
    ///  plus the client's address).
    pub async fn send(
        &self,
        connection_id: ConnectionId,
        peer_addr: SocketAddr,
        data: &[u8],
        reliable: bool,
    ) -> anyhow::Result<()> {
        let mut connections = self.connections.lock().await;
        match connections.get_mut(connection_id, peer_addr) {
            Some(connection) => {
                connection.send(data, reliable).await;
                Ok(())
            }
            None => bail!("no open connection {} to {:?}", connection_id, peer_addr),
        }
    }

    /// Voluntarily close one connection, telling the peer.
    pub async fn close(
        &self,
        connection_id: ConnectionId,
        peer_addr: SocketAddr,
    ) -> anyhow::Result<()> {
        let mut connections = self.connections.lock().await;
        match connections.get_mut(connection_id, peer_addr) {
            Some(connection) => {
                connection.close().await;
                connections.sweep_closed();
                Ok(())
            }
            None => bail!("no open connection {} to {:?}", connection_id, peer_addr),
        }
    }

    /// Close every connection (telling the peers) and stop the receive loop.
    pub async fn shutdown(&self) {
        debug!("server endpoint: shutting down");
        self.connections.lock().await.close_all().await;
        self.shutdown_signal.notify_one();
    }

    /// The endpoint's single thread of control, analogous to the client side. Meant to be
    ///  spawned as a task by the application.
    pub async fn recv_loop(&self) {
        info!("server endpoint: starting receive loop on {:?}", self.local_addr());
        self.dispatcher.on_listening(self.local_addr()).await;

        let mut buf = vec![0u8; self.config.receive_buffer_size];
        let mut tick = time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                recv_result = self.receive_socket.recv_from(&mut buf) => match recv_result {
                    Ok((num_read, from)) => self.on_datagram(&buf[..num_read], from).await,
                    Err(e) => error!("socket error: {}", e),
                },
                _ = tick.tick() => self.tick().await,
                _ = self.shutdown_signal.notified() => {
                    debug!("server endpoint: receive loop stopped");
                    return;
                }
            }
        }
    }

    pub(crate) async fn on_datagram(&self, data: &[u8], from: SocketAddr) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "server_datagram", ?correlation_id);

        // instrumented rather than entered: an entered span guard is !Send and would make
        //  the receive loop unspawnable
        async {
            trace!("received datagram from {:?}: {:?}", from, data);

            let envelope = match Envelope::deser(&mut &data[..]) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("unparseable envelope from {:?} - dropping: {}", from, e);
                    return;
                }
            };
            self.on_envelope(envelope, from).await;
        }
        .instrument(span)
        .await;
    }

    async fn on_envelope(&self, envelope: Envelope, from: SocketAddr) {
        let mut connections = self.connections.lock().await;

        if let Some(connection) = connections.get_mut(envelope.connection_id, from) {
            connection.on_packet(envelope).await;
            connections.sweep_closed();
            return;
        }

        if let Payload::ConnectionRequest = envelope.payload {
            let connection_id = envelope.connection_id;
            debug!("new connection {} from {:?}", connection_id, from);

            connections.insert(Connection::new(
                connection_id,
                from,
                self.send_socket.clone(),
                self.dispatcher.clone(),
                self.config.clone(),
            ));

            // the request goes through the regular handling path, which produces the accept
            if let Some(connection) = connections.get_mut(connection_id, from) {
                connection.on_packet(envelope).await;
            }
            self.dispatcher
                .on_connection_established(connection_id, from)
                .await;
            return;
        }

        debug!(
            "envelope for unknown connection {} from {:?} - answering NO_CONNECTION",
            envelope.connection_id, from
        );
        let no_connection = Envelope {
            connection_id: envelope.connection_id,
            payload: Payload::NoConnection,
        };
        send_envelope(self.send_socket.as_ref(), from, &no_connection).await;
    }

    pub(crate) async fn tick(&self) {
        let now = Instant::now();
        self.connections.lock().await.tick_all(now).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_end_point::ClientEndPoint;
    use crate::message_dispatcher::Delivery;
    use crate::send_socket::MockSendSocket;
    use crate::test_util::{DispatcherEvent, RecordingDispatcher};
    use bytes::BytesMut;
    use std::time::Duration;
    use tokio::runtime::Builder;
    use tokio::time::timeout;

    fn test_config() -> Arc<SnpConfig> {
        Arc::new(SnpConfig::default())
    }

    fn client_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9100))
    }

    fn raw(envelope: &Envelope) -> Vec<u8> {
        let mut buf = BytesMut::new();
        envelope.ser(&mut buf);
        buf.to_vec()
    }

    fn expect_sent(socket: &mut MockSendSocket, to: SocketAddr, expected: Envelope) {
        socket
            .expect_do_send_packet()
            .withf(move |addr, buf| {
                *addr == to && Envelope::deser(&mut &buf[..]).unwrap() == expected
            })
            .times(1)
            .return_const(());
    }

    async fn new_server(
        socket: MockSendSocket,
        dispatcher: Arc<RecordingDispatcher>,
    ) -> ServerEndPoint {
        let receive_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        ServerEndPoint::from_parts(receive_socket, Arc::new(socket), dispatcher, test_config())
    }

    #[test]
    fn test_connection_request_creates_connection_and_accepts() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let connection_id = ConnectionId::from_raw(17);

            let mut socket = MockSendSocket::new();
            expect_sent(
                &mut socket,
                client_addr(),
                Envelope { connection_id, payload: Payload::ConnectionAccept },
            );
            expect_sent(
                &mut socket,
                client_addr(),
                Envelope {
                    connection_id,
                    payload: Payload::Acknowledgement { last_sequence_number_seen: 1 },
                },
            );

            let dispatcher = RecordingDispatcher::new();
            let server = new_server(socket, dispatcher.clone()).await;

            server
                .on_datagram(
                    &raw(&Envelope { connection_id, payload: Payload::ConnectionRequest }),
                    client_addr(),
                )
                .await;

            assert_eq!(server.connections.lock().await.len(), 1);
            assert_eq!(
                dispatcher.events(),
                vec![DispatcherEvent::Established(connection_id, client_addr())]
            );

            server
                .on_datagram(
                    &raw(&Envelope {
                        connection_id,
                        payload: Payload::SendReliable {
                            reliable_sequence_number: 1,
                            data: vec![9],
                        },
                    }),
                    client_addr(),
                )
                .await;
            assert_eq!(
                dispatcher.events().last().unwrap(),
                &DispatcherEvent::Message(connection_id, Delivery::Reliable, vec![9])
            );
        });
    }

    #[test]
    fn test_unknown_connection_is_answered_with_no_connection() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let connection_id = ConnectionId::from_raw(17);

            let mut socket = MockSendSocket::new();
            expect_sent(
                &mut socket,
                client_addr(),
                Envelope { connection_id, payload: Payload::NoConnection },
            );

            let dispatcher = RecordingDispatcher::new();
            let server = new_server(socket, dispatcher.clone()).await;

            server
                .on_datagram(
                    &raw(&Envelope {
                        connection_id,
                        payload: Payload::SendReliable {
                            reliable_sequence_number: 1,
                            data: vec![1],
                        },
                    }),
                    client_addr(),
                )
                .await;

            // no connection was created
            assert!(server.connections.lock().await.is_empty());
            assert!(dispatcher.events().is_empty());
        });
    }

    #[test]
    fn test_end_to_end_over_localhost() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let config = Arc::new(SnpConfig::default());

            let server_dispatcher = RecordingDispatcher::new();
            let server = Arc::new(
                ServerEndPoint::new(
                    SocketAddr::from(([127, 0, 0, 1], 0)),
                    server_dispatcher.clone(),
                    config.clone(),
                )
                .await
                .unwrap(),
            );
            let server_addr = server.local_addr();

            let client_dispatcher = RecordingDispatcher::new();
            let client = Arc::new(
                ClientEndPoint::new(
                    SocketAddr::from(([127, 0, 0, 1], 0)),
                    client_dispatcher.clone(),
                    config,
                )
                .await
                .unwrap(),
            );

            {
                let server = server.clone();
                tokio::spawn(async move { server.recv_loop().await });
            }
            {
                let client = client.clone();
                tokio::spawn(async move { client.recv_loop().await });
            }

            let connection_id = client.connect(server_addr).await.unwrap();
            timeout(
                Duration::from_secs(5),
                client_dispatcher.wait_until(|events| {
                    events.contains(&DispatcherEvent::Established(connection_id, server_addr))
                }),
            )
            .await
            .unwrap();

            client.send(connection_id, server_addr, &[1, 2, 3], true).await.unwrap();
            client.send(connection_id, server_addr, &[4], false).await.unwrap();

            timeout(
                Duration::from_secs(5),
                server_dispatcher.wait_until(|events| {
                    events.contains(&DispatcherEvent::Message(
                        connection_id,
                        Delivery::Reliable,
                        vec![1, 2, 3],
                    ))
                }),
            )
            .await
            .unwrap();

            // answer in both delivery modes
            let client_addr = match server_dispatcher
                .events()
                .iter()
                .find_map(|e| match e {
                    DispatcherEvent::Established(id, addr) if *id == connection_id => Some(*addr),
                    _ => None,
                }) {
                Some(addr) => addr,
                None => panic!("server never saw the connection"),
            };
            server.send(connection_id, client_addr, &[5, 6], true).await.unwrap();
            server.send(connection_id, client_addr, &[7], false).await.unwrap();

            timeout(
                Duration::from_secs(5),
                client_dispatcher.wait_until(|events| {
                    events.contains(&DispatcherEvent::Message(
                        connection_id,
                        Delivery::Reliable,
                        vec![5, 6],
                    ))
                }),
            )
            .await
            .unwrap();

            // voluntary close propagates to the server side
            client.close(connection_id, server_addr).await.unwrap();
            timeout(
                Duration::from_secs(5),
                server_dispatcher.wait_until(|events| {
                    events
                        .iter()
                        .any(|e| matches!(e, DispatcherEvent::Closed(id, _) if *id == connection_id))
                }),
            )
            .await
            .unwrap();

            client.shutdown().await;
            server.shutdown().await;
        });
    }
}
