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

/// A connection request that went out but has not been answered yet. Retried at the
///  retransmit cadence until the attempt window expires, then silently discarded - there is
///  no failure notification for an unreachable server, callers have to track their own
///  deadline.
struct PendingRequest {
    connection_id: ConnectionId,
    server_addr: SocketAddr,
    tries: u32,
    first_attempt: Instant,
    last_attempt: Instant,
}

struct ClientInner {
    pending_requests: Vec<PendingRequest>,
    connections: ConnectionRegistry,
}

/// The connecting side: opens connections towards servers and routes inbound envelopes to
///  them. One client endpoint owns one UDP socket and can hold any number of connections to
///  any number of servers.
///
/// All protocol state lives behind a single mutex that is only ever locked from
///  [`recv_loop`](ClientEndPoint::recv_loop) and the public API, giving every handler
///  run-to-completion semantics over the endpoint's state.
pub struct ClientEndPoint {
    receive_socket: Arc<UdpSocket>,
    send_socket: Arc<dyn SendSocket>,
    dispatcher: Arc<dyn MessageDispatcher>,
    config: Arc<SnpConfig>,
    inner: Mutex<ClientInner>,
    shutdown_signal: Notify,
}

impl ClientEndPoint {
    /// Upper bound on re-rolls when a random connection id collides with an existing
    ///  connection or pending request towards the same server. Exhausting this many rolls
    ///  means the id range is effectively saturated.
    const MAX_CONNECTION_ID_ROLLS: usize = 64;

    pub async fn new(
        bind_addr: SocketAddr,
        dispatcher: Arc<dyn MessageDispatcher>,
        config: Arc<SnpConfig>,
    ) -> anyhow::Result<ClientEndPoint> {
        config.validate()?;

        let receive_socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        info!("client endpoint: bound socket to {:?}", receive_socket.local_addr());

        let send_socket: Arc<dyn SendSocket> = Arc::new(receive_socket.clone());
        Ok(Self::from_parts(receive_socket, send_socket, dispatcher, config))
    }

    pub(crate) fn from_parts(
        receive_socket: Arc<UdpSocket>,
        send_socket: Arc<dyn SendSocket>,
        dispatcher: Arc<dyn MessageDispatcher>,
        config: Arc<SnpConfig>,
    ) -> ClientEndPoint {
        ClientEndPoint {
            receive_socket,
            send_socket,
            dispatcher,
            config,
            inner: Mutex::new(ClientInner {
                pending_requests: Vec::new(),
                connections: ConnectionRegistry::new(),
            }),
            shutdown_signal: Notify::new(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.send_socket.local_addr()
    }

    /// Start opening a connection to a server. The returned id identifies the connection
    ///  attempt; the connection is usable once the dispatcher's established callback fires
    ///  for it. An attempt that goes unanswered for the whole attempt window disappears
    ///  without further notice.
    ///
    /// Fails only if no free connection id towards that server could be found, i.e. the
    ///  configured id range is (close to) saturated.
    pub async fn connect(&self, server_addr: SocketAddr) -> anyhow::Result<ConnectionId> {
        let mut inner = self.inner.lock().await;

        // random ids can collide, but only a collision towards the same server matters.
        //  The number of rolls is bounded so a saturated id range fails instead of spinning
        //  with the endpoint mutex held.
        let mut connection_id = None;
        for _ in 0..Self::MAX_CONNECTION_ID_ROLLS {
            let candidate =
                ConnectionId::random(self.config.connection_id_min, self.config.connection_id_max);
            let in_use = inner
                .pending_requests
                .iter()
                .any(|r| r.connection_id == candidate && r.server_addr == server_addr)
                || inner.connections.get_mut(candidate, server_addr).is_some();
            if !in_use {
                connection_id = Some(candidate);
                break;
            }
        }
        let connection_id = match connection_id {
            Some(connection_id) => connection_id,
            None => bail!(
                "no free connection id towards {:?} - the configured id range is exhausted",
                server_addr
            ),
        };

        debug!("connecting to {:?} as connection {}", server_addr, connection_id);

        let now = Instant::now();
        inner.pending_requests.push(PendingRequest {
            connection_id,
            server_addr,
            tries: 1,
            first_attempt: now,
            last_attempt: now,
        });

        let request = Envelope {
            connection_id,
            payload: Payload::ConnectionRequest,
        };
        send_envelope(self.send_socket.as_ref(), server_addr, &request).await;

        Ok(connection_id)
    }

    /// Send application data on an open connection. Fails only if the connection does not
    ///  exist (never established, or already closed) - actual transmission is fire and
    ///  forget, with reliability handled by the connection.
    pub async fn send(
        &self,
        connection_id: ConnectionId,
        server_addr: SocketAddr,
        data: &[u8],
        reliable: bool,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.connections.get_mut(connection_id, server_addr) {
            Some(connection) => {
                connection.send(data, reliable).await;
                Ok(())
            }
            None => bail!("no open connection {} to {:?}", connection_id, server_addr),
        }
    }

    /// Voluntarily close one connection, telling the peer.
    pub async fn close(
        &self,
        connection_id: ConnectionId,
        server_addr: SocketAddr,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.connections.get_mut(connection_id, server_addr) {
            Some(connection) => {
                connection.close().await;
                inner.connections.sweep_closed();
                Ok(())
            }
            None => bail!("no open connection {} to {:?}", connection_id, server_addr),
        }
    }

    /// Close every connection (telling the peers), drop pending requests and stop the
    ///  receive loop.
    pub async fn shutdown(&self) {
        debug!("client endpoint: shutting down");
        let mut inner = self.inner.lock().await;
        inner.pending_requests.clear();
        inner.connections.close_all().await;
        self.shutdown_signal.notify_one();
    }

    /// The endpoint's single thread of control: processes inbound datagrams and the
    ///  maintenance tick strictly one at a time until [`shutdown`](ClientEndPoint::shutdown)
    ///  is called. Meant to be spawned as a task by the application.
    pub async fn recv_loop(&self) {
        info!("client endpoint: starting receive loop on {:?}", self.local_addr());
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
                    debug!("client endpoint: receive loop stopped");
                    return;
                }
            }
        }
    }

    pub(crate) async fn on_datagram(&self, data: &[u8], from: SocketAddr) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "client_datagram", ?correlation_id);

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
        let mut inner = self.inner.lock().await;

        if let Some(connection) = inner.connections.get_mut(envelope.connection_id, from) {
            connection.on_packet(envelope).await;
            inner.connections.sweep_closed();
            return;
        }

        if matches!(envelope.payload, Payload::NoConnection | Payload::ConnectionClose) {
            // nothing to tear down, and answering would risk a NO_CONNECTION ping-pong
            debug!(
                "{:?} from {:?} for unknown connection {} - dropping",
                envelope.payload, from, envelope.connection_id
            );
            return;
        }

        // the first reply for a pending request - of whatever kind the server chose to send -
        //  promotes the request to a connection. The envelope itself is consumed as the
        //  promotion signal and is not delivered into the new connection.
        if let Some(idx) = inner
            .pending_requests
            .iter()
            .position(|r| r.connection_id == envelope.connection_id && r.server_addr == from)
        {
            let request = inner.pending_requests.swap_remove(idx);
            debug!(
                "connection {} to {:?} established after {} tries",
                request.connection_id, request.server_addr, request.tries
            );
            inner.connections.insert(Connection::new(
                request.connection_id,
                request.server_addr,
                self.send_socket.clone(),
                self.dispatcher.clone(),
                self.config.clone(),
            ));
            self.dispatcher
                .on_connection_established(request.connection_id, request.server_addr)
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
        let mut inner = self.inner.lock().await;

        inner.connections.tick_all(now).await;

        let mut retries = Vec::new();
        for request in inner.pending_requests.iter_mut() {
            if now.duration_since(request.last_attempt) > self.config.retransmit_interval
                && now.duration_since(request.first_attempt)
                    < self.config.connection_open_attempt_duration
            {
                request.tries += 1;
                request.last_attempt = now;
                retries.push((request.connection_id, request.server_addr));
            }
        }
        for (connection_id, server_addr) in retries {
            trace!("retrying connection request {} to {:?}", connection_id, server_addr);
            let request = Envelope {
                connection_id,
                payload: Payload::ConnectionRequest,
            };
            send_envelope(self.send_socket.as_ref(), server_addr, &request).await;
        }

        let open_attempt_duration = self.config.connection_open_attempt_duration;
        inner.pending_requests.retain(|request| {
            let expired =
                now.duration_since(request.first_attempt) >= open_attempt_duration;
            if expired {
                debug!(
                    "connection request {} to {:?} went unanswered for the whole attempt window ({} tries) - giving up",
                    request.connection_id, request.server_addr, request.tries
                );
            }
            !expired
        });
    }
}
