//! Minimal echo setup over localhost: the server sends every reliable message it receives
//!  back on the same connection, the client sends a handful of messages and prints the
//!  echoes.
//!
//! ```shell
//! cargo run --example echo
//! ```

use async_trait::async_trait;
use snp::{
    ClientEndPoint, ConnectionId, Delivery, MessageDispatcher, ServerEndPoint, SnpConfig,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, Level};

enum Event {
    Established(ConnectionId, SocketAddr),
    Message(ConnectionId, SocketAddr, Vec<u8>),
}

/// Dispatcher that forwards the interesting events into a channel, so the demo's main task
///  can react to them without sharing state with the endpoint.
struct ChannelDispatcher {
    name: &'static str,
    events: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl MessageDispatcher for ChannelDispatcher {
    async fn on_listening(&self, local_addr: SocketAddr) {
        info!("{}: listening on {:?}", self.name, local_addr);
    }

    async fn on_connection_established(&self, connection_id: ConnectionId, peer_addr: SocketAddr) {
        info!("{}: connection {} with {:?} established", self.name, connection_id, peer_addr);
        let _ = self.events.send(Event::Established(connection_id, peer_addr));
    }

    async fn on_message(
        &self,
        connection_id: ConnectionId,
        peer_addr: SocketAddr,
        delivery: Delivery,
        data: &[u8],
    ) {
        info!(
            "{}: received {:?} message on connection {}: {:?}",
            self.name, delivery, connection_id, data
        );
        let _ = self.events.send(Event::Message(connection_id, peer_addr, data.to_vec()));
    }

    async fn on_connection_closed(&self, connection_id: ConnectionId, peer_addr: SocketAddr) {
        info!("{}: connection {} with {:?} closed", self.name, connection_id, peer_addr);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let config = Arc::new(SnpConfig::default());

    let (server_events_tx, mut server_events) = mpsc::unbounded_channel();
    let server = Arc::new(
        ServerEndPoint::new(
            "127.0.0.1:0".parse()?,
            Arc::new(ChannelDispatcher { name: "server", events: server_events_tx }),
            config.clone(),
        )
        .await?,
    );
    let server_addr = server.local_addr();
    {
        let server = server.clone();
        tokio::spawn(async move { server.recv_loop().await });
    }

    // the echo half: every message the server receives goes straight back, reliably
    {
        let server = server.clone();
        tokio::spawn(async move {
            while let Some(event) = server_events.recv().await {
                if let Event::Message(connection_id, peer_addr, data) = event {
                    server.send(connection_id, peer_addr, &data, true).await?;
                }
            }
            anyhow::Ok(())
        });
    }

    let (client_events_tx, mut client_events) = mpsc::unbounded_channel();
    let client = Arc::new(
        ClientEndPoint::new(
            "127.0.0.1:0".parse()?,
            Arc::new(ChannelDispatcher { name: "client", events: client_events_tx }),
            config,
        )
        .await?,
    );
    {
        let client = client.clone();
        tokio::spawn(async move { client.recv_loop().await });
    }

    let connection_id = client.connect(server_addr).await?;
    loop {
        match client_events.recv().await {
            Some(Event::Established(id, _)) if id == connection_id => break,
            Some(_) => {}
            None => anyhow::bail!("client endpoint went away before the connection opened"),
        }
    }

    for n in 0u8..3 {
        client.send(connection_id, server_addr, &[n, n, n], true).await?;
    }
    client.send(connection_id, server_addr, b"best effort", false).await?;

    let mut echoes = 0;
    while echoes < 3 {
        match client_events.recv().await {
            Some(Event::Message(_, _, _)) => echoes += 1,
            Some(_) => {}
            None => anyhow::bail!("client endpoint went away before all echoes arrived"),
        }
    }

    client.close(connection_id, server_addr).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}
