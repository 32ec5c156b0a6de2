//! The UDP-facing half of the service: a single bound socket, an inbound
//! receive loop, and an outbound drain task that empties the worker pool's
//! `Outbound` queue onto the wire.
//!
//! Grounded on the teacher's `udp_bind_daemon`/socket handling in
//! `vl1-service/src/vl1service.rs`, trimmed to the single fixed-port case:
//! the specification's NAT-traversal-oriented reuse of many ports is a
//! Non-goal here.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::net_addr::NetAddr;
use crate::worker::Outbound;

/// Abstraction over the raw datagram transport, analogous to the teacher's
/// `HostSystem` trait. Exists so tests can swap in an in-memory channel
/// instead of a real socket.
#[async_trait]
pub trait SphynxHost: Send + Sync {
    async fn send_to(&self, dest: NetAddr, body: &[u8]) -> io::Result<()>;
}

pub struct UdpHost {
    socket: Arc<UdpSocket>,
}

#[async_trait]
impl SphynxHost for UdpHost {
    async fn send_to(&self, dest: NetAddr, body: &[u8]) -> io::Result<()> {
        self.socket.send_to(body, dest.socket_addr()).await?;
        Ok(())
    }
}

impl UdpHost {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket: Arc::new(socket) })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawns the task that drains `outbound_rx` onto the socket.
    pub fn spawn_outbound_drain(&self, mut outbound_rx: mpsc::UnboundedReceiver<Outbound>) -> JoinHandle<()> {
        let socket = self.socket.clone();
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(err) = socket.send_to(&msg.body, msg.dest.socket_addr()).await {
                    warn!(dest = %msg.dest, %err, "outbound datagram send failed");
                }
            }
        })
    }

    /// Spawns the inbound receive loop. Each datagram is handed to
    /// `on_datagram` along with its source address; the buffer is reused
    /// across iterations.
    pub fn spawn_inbound_loop<F>(&self, mut on_datagram: F) -> JoinHandle<()>
    where
        F: FnMut(NetAddr, Vec<u8>) + Send + 'static,
    {
        let socket = self.socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => on_datagram(NetAddr::new(from), buf[..len].to_vec()),
                    Err(err) => {
                        debug!(%err, "udp recv_from failed");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bound_socket_reports_its_local_addr() {
        let host = UdpHost::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(host.local_addr().unwrap().port() > 0);
    }

    #[tokio::test]
    async fn send_to_does_not_error_against_a_bound_peer() {
        let a = UdpHost::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = UdpHost::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let dest = NetAddr::new(b.local_addr().unwrap());
        a.send_to(dest, b"hi").await.unwrap();
    }
}
