use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use bytes::BytesMut;
use tokio::net::UdpSocket;
use tracing::{error, trace};

use crate::envelope::Envelope;

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate
///  mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("UDP socket: sending packet to {:?}", to);

        if let Err(e) = self.send_to(packet_buf, to).await {
            // a send error is indistinguishable from a lost packet for the peer, so it is
            //  handled by the protocol's regular retransmission / timeout machinery
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// Serialize an envelope and put it on the wire.
pub(crate) async fn send_envelope(socket: &dyn SendSocket, to: SocketAddr, envelope: &Envelope) {
    let mut buf = BytesMut::new();
    envelope.ser(&mut buf);
    socket.do_send_packet(to, &buf).await;
}
