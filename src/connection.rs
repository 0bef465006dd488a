use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use bytes::BytesMut;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::SnpConfig;
use crate::connection_id::ConnectionId;
use crate::envelope::{Envelope, Payload};
use crate::message_dispatcher::{Delivery, MessageDispatcher};
use crate::send_socket::SendSocket;

/// A reliable envelope that was sent but not acknowledged yet. The envelope is stored as
///  constructed and retransmitted unchanged; `tries` is purely observational - there is no
///  retry cap, the connection timeout is the only backstop.
struct UnackedEnvelope {
    sequence_number: u64,
    last_sent: Instant,
    tries: u32,
    envelope: Envelope,
}

/// The per-peer protocol state machine. A connection is open from construction until
///  [`close`](Connection::close) (voluntary, timeout or peer-initiated) and is owned
///  exclusively by one endpoint's registry - all state is plain fields mutated from the
///  endpoint's single thread of control, so no synchronization is needed here.
///
/// A closed connection only sets its `closed` flag; the owning endpoint sweeps it from the
///  registry afterwards. That keeps removal idempotent even though close can be triggered
///  from several paths (tick timeout, peer teardown, endpoint shutdown).
pub struct Connection {
    connection_id: ConnectionId,
    peer_addr: SocketAddr,
    send_socket: Arc<dyn SendSocket>,
    dispatcher: Arc<dyn MessageDispatcher>,
    config: Arc<SnpConfig>,

    /// sequence number of the most recent locally originated reliable message (0 = none yet)
    send_reliable_seq: u64,
    /// sequence number of the most recent locally originated unreliable message (0 = none yet)
    send_unreliable_seq: u64,
    /// highest reliable sequence number accepted from the peer. Only ever increases, and only
    ///  by exactly 1 per accepted message - gaps are never skipped over.
    recv_reliable_seq_seen: u64,
    /// highest unreliable sequence number accepted from the peer
    recv_unreliable_seq_seen: u64,

    /// reliable envelopes awaiting acknowledgement, in send order
    unacked: VecDeque<UnackedEnvelope>,

    last_sent: Instant,
    last_received: Instant,
    closed: bool,
}

impl Connection {
    pub fn new(
        connection_id: ConnectionId,
        peer_addr: SocketAddr,
        send_socket: Arc<dyn SendSocket>,
        dispatcher: Arc<dyn MessageDispatcher>,
        config: Arc<SnpConfig>,
    ) -> Connection {
        let now = Instant::now();
        Connection {
            connection_id,
            peer_addr,
            send_socket,
            dispatcher,
            config,
            send_reliable_seq: 0,
            send_unreliable_seq: 0,
            recv_reliable_seq_seen: 0,
            recv_unreliable_seq_seen: 0,
            unacked: VecDeque::new(),
            last_sent: now,
            last_received: now,
            closed: false,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Handle an inbound envelope that the owning endpoint resolved to this connection.
    pub async fn on_packet(&mut self, envelope: Envelope) {
        self.last_received = Instant::now();

        match &envelope.payload {
            Payload::ConnectionRequest => {
                // answered unconditionally: the peer retransmits its request until the first
                //  accept arrives, so this must be idempotent
                let accept = Envelope {
                    connection_id: self.connection_id,
                    payload: Payload::ConnectionAccept,
                };
                self.transmit(&accept).await;
            }
            Payload::ConnectionAccept | Payload::KeepAlive => {
                // nothing to be done beyond refreshing the inactivity timer
            }
            Payload::SendReliable {
                reliable_sequence_number,
                data,
            } => {
                self.on_send_reliable(*reliable_sequence_number, data).await;
            }
            Payload::SendUnreliable {
                reliable_sequence_number,
                unreliable_sequence_number,
                data,
            } => {
                self.on_send_unreliable(*reliable_sequence_number, *unreliable_sequence_number, data)
                    .await;
            }
            Payload::Acknowledgement {
                last_sequence_number_seen,
            } => {
                // cumulative: everything up to the threshold is confirmed
                trace!(
                    "connection {}: ack up to #{} from {:?}",
                    self.connection_id,
                    last_sequence_number_seen,
                    self.peer_addr
                );
                let threshold = *last_sequence_number_seen;
                self.unacked.retain(|u| u.sequence_number > threshold);
            }
            Payload::ConnectionClose | Payload::NoConnection => {
                // the peer ended the logical session (voluntarily, or because it has no record
                //  of this connection) - close locally without a reciprocal close
                debug!(
                    "connection {}: peer {:?} ended the session - closing",
                    self.connection_id, self.peer_addr
                );
                self.on_peer_close().await;
            }
        }
    }

    async fn on_send_reliable(&mut self, sequence_number: u64, data: &[u8]) {
        if sequence_number <= self.recv_reliable_seq_seen {
            // duplicate - our earlier ack may have been lost, so ack again with the current
            //  threshold, but do not deliver the data a second time
            debug!(
                "connection {}: duplicate reliable #{} (seen up to #{}) - re-acking",
                self.connection_id, sequence_number, self.recv_reliable_seq_seen
            );
            self.send_acknowledgement().await;
        } else if sequence_number == self.recv_reliable_seq_seen + 1 {
            self.recv_reliable_seq_seen += 1;
            self.send_acknowledgement().await;

            trace!(
                "connection {}: delivering reliable #{}",
                self.connection_id,
                sequence_number
            );
            self.dispatcher
                .on_message(self.connection_id, self.peer_addr, Delivery::Reliable, data)
                .await;
        } else {
            // a packet in between was dropped. There is no reordering buffer, and no ack is
            //  sent - the sender's retransmission of the missing packet re-delivers everything
            //  in order eventually
            debug!(
                "connection {}: reliable #{} arrived ahead of a gap (seen up to #{}) - dropping",
                self.connection_id, sequence_number, self.recv_reliable_seq_seen
            );
        }
    }

    async fn on_send_unreliable(
        &mut self,
        reliable_sequence_number: u64,
        unreliable_sequence_number: u64,
        data: &[u8],
    ) {
        if unreliable_sequence_number < self.recv_unreliable_seq_seen {
            debug!(
                "connection {}: unreliable #{} is older than #{} - discarding",
                self.connection_id, unreliable_sequence_number, self.recv_unreliable_seq_seen
            );
            return;
        }

        // an unreliable message may refer to state changes enacted by reliable messages, so it
        //  is only deliverable at exactly the reliable checkpoint it was sent at
        if reliable_sequence_number != self.recv_reliable_seq_seen {
            debug!(
                "connection {}: unreliable #{} is bound to reliable checkpoint #{} but we are at #{} - discarding",
                self.connection_id,
                unreliable_sequence_number,
                reliable_sequence_number,
                self.recv_reliable_seq_seen
            );
            return;
        }

        self.recv_unreliable_seq_seen = unreliable_sequence_number;
        self.dispatcher
            .on_message(self.connection_id, self.peer_addr, Delivery::Unreliable, data)
            .await;
    }

    async fn send_acknowledgement(&mut self) {
        let ack = Envelope {
            connection_id: self.connection_id,
            payload: Payload::Acknowledgement {
                last_sequence_number_seen: self.recv_reliable_seq_seen,
            },
        };
        self.transmit(&ack).await;
    }

    /// Send application data to the peer. Reliable sends are queued for retransmission until
    ///  acknowledged; unreliable sends go on the wire exactly once, stamped with the current
    ///  reliable checkpoint.
    ///
    /// NB: This function does not return Result - send errors are absorbed by the socket
    ///  layer, where they are indistinguishable from a lost packet and covered by the regular
    ///  retransmission / timeout machinery.
    pub async fn send(&mut self, data: &[u8], reliable: bool) {
        if reliable {
            self.send_reliable_seq += 1;
            let envelope = Envelope {
                connection_id: self.connection_id,
                payload: Payload::SendReliable {
                    reliable_sequence_number: self.send_reliable_seq,
                    data: data.to_vec(),
                },
            };

            // queued before the first transmission so a lost packet is covered
            self.unacked.push_back(UnackedEnvelope {
                sequence_number: self.send_reliable_seq,
                last_sent: Instant::now(),
                tries: 0,
                envelope: envelope.clone(),
            });
            self.transmit(&envelope).await;
        } else {
            self.send_unreliable_seq += 1;
            let envelope = Envelope {
                connection_id: self.connection_id,
                payload: Payload::SendUnreliable {
                    reliable_sequence_number: self.send_reliable_seq,
                    unreliable_sequence_number: self.send_unreliable_seq,
                    data: data.to_vec(),
                },
            };
            self.transmit(&envelope).await;
        }
    }

    /// Per-tick maintenance: retransmit overdue unacked envelopes, close on inactivity
    ///  timeout, emit a keepalive if the send side has been quiet for too long.
    ///
    /// `now` is captured once by the owning endpoint's tick, so all connections of an
    ///  endpoint see a consistent clock.
    pub async fn tick(&mut self, now: Instant) {
        let mut due = Vec::new();
        for unacked in self.unacked.iter_mut() {
            if now.duration_since(unacked.last_sent) > self.config.retransmit_interval {
                unacked.tries += 1;
                unacked.last_sent = now;
                due.push(unacked.envelope.clone());
            }
        }
        for envelope in &due {
            trace!(
                "connection {}: retransmitting to {:?}: {:?}",
                self.connection_id,
                self.peer_addr,
                envelope
            );
            self.transmit(envelope).await;
        }

        if now.duration_since(self.last_received) > self.config.connection_timeout {
            debug!(
                "connection {}: nothing received from {:?} for longer than the connection timeout - closing",
                self.connection_id, self.peer_addr
            );
            self.close().await;
        } else if now.duration_since(self.last_sent) > self.config.keep_alive_interval {
            let keep_alive = Envelope {
                connection_id: self.connection_id,
                payload: Payload::KeepAlive,
            };
            self.transmit(&keep_alive).await;
        }
    }

    /// Voluntary close: tell the peer once, then tear down. Safe to call repeatedly; only
    ///  the first call has any effect.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        let close = Envelope {
            connection_id: self.connection_id,
            payload: Payload::ConnectionClose,
        };
        self.transmit(&close).await;
        self.finish_close().await;
    }

    /// Teardown triggered by the peer (ConnectionClose / NoConnection received): no
    ///  reciprocal close goes on the wire - the peer is already gone.
    async fn on_peer_close(&mut self) {
        if self.closed {
            return;
        }
        self.finish_close().await;
    }

    async fn finish_close(&mut self) {
        self.closed = true;
        self.dispatcher
            .on_connection_closed(self.connection_id, self.peer_addr)
            .await;
    }

    async fn transmit(&mut self, envelope: &Envelope) {
        let mut buf = BytesMut::new();
        envelope.ser(&mut buf);
        self.send_socket.do_send_packet(self.peer_addr, &buf).await;
        self.last_sent = Instant::now();
    }
}
