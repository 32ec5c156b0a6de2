//! Client-side façade: drives the three-packet handshake against one server
//! and hands the resulting connexion to a (single-worker) pool of its own.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sphynx_crypto::curve::CurvePoint;
use sphynx_crypto::random::SecureRandom;
use sphynx_protocol::constants::{HandshakeError, HandshakeType};
use sphynx_protocol::handshake;
use sphynx_transport::Delivery;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::SphynxConfig;
use crate::connexion::Connexion;
use crate::error::Error;
use crate::host::UdpHost;
use crate::net_addr::NetAddr;
use crate::worker::{Delivered, WorkerPool};

/// Application-visible events surfaced by the client, mirroring
/// `ServerEvent` minus the per-peer address (there is only one peer).
pub enum ClientEvent {
    Message { stream: u8, reliable: bool, payload: Vec<u8> },
    Huge { stream: u8, bytes: Vec<u8>, size: u64 },
    Disconnected(sphynx_protocol::constants::DisconnectReason),
}

pub struct SphynxClient {
    conn: Arc<Connexion>,
    _host: Arc<UdpHost>,
    _pool: Arc<WorkerPool>,
}

impl SphynxClient {
    /// Performs HELLO -> COOKIE -> CHALLENGE -> ANSWER against `server` using
    /// a fresh ephemeral socket, retrying each step up to three times before
    /// giving up with `Error::Io` (timed out).
    pub async fn connect(server: SocketAddr, server_pub: CurvePoint, config: SphynxConfig) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), Error> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.connect(server).await?;
        let mut rng = SecureRandom::new();
        let step_timeout = Duration::from_millis(config.handshake_tick_ms.max(50) * 10);

        let hello = handshake::encode_hello(&server_pub);
        let cookie = Self::round_trip(&socket, &hello, step_timeout, |buf| Self::parse_or_error(buf, |b| handshake::decode_cookie(b).ok())).await?;

        let (a, big_a) = handshake::client_begin(&mut rng);
        let challenge = handshake::encode_challenge(cookie, &big_a);
        let (data_port, big_y, r, proof) =
            Self::round_trip(&socket, &challenge, step_timeout, |buf| Self::parse_or_error(buf, |b| handshake::decode_answer(b).ok())).await?;

        let keys = handshake::client_finish(&server_pub, &a, &big_a, &big_y, &r, &proof)?;

        let mut data_addr = server;
        data_addr.set_port(data_port);
        let remote = NetAddr::new(data_addr);
        let conn = Arc::new(Connexion::new(remote, keys, true, config.bandwidth_low_limit, config.bandwidth_high_limit, now_ms()));

        let host = Arc::new(UdpHost::bind("0.0.0.0:0".parse().unwrap()).await?);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (delivered_tx, mut delivered_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(WorkerPool::new(1, config.worker_tick_ms, outbound_tx, delivered_tx));
        host.spawn_outbound_drain(outbound_rx);
        pool.assign(conn.clone());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(Delivered { event, .. }) = delivered_rx.recv().await {
                let mapped = match event {
                    Delivery::Message { stream, reliable, payload } => ClientEvent::Message { stream, reliable, payload },
                    Delivery::Huge { stream, bytes, size } => ClientEvent::Huge { stream, bytes, size },
                    Delivery::Disconnect(reason) => ClientEvent::Disconnected(reason),
                };
                let _ = events_tx.send(mapped);
            }
        });

        // Only one connexion exists on this pool, so every inbound datagram
        // belongs to it; route through the worker it was assigned to rather
        // than deciding that here a second time.
        let worker_idx = conn.worker_idx().unwrap_or(0);
        let inbound_pool = pool.clone();
        host.spawn_inbound_loop(move |_from, body| {
            inbound_pool.dispatch_inbound(worker_idx, remote, body);
        });

        Ok((Self { conn, _host: host, _pool: pool }, events_rx))
    }

    pub fn send_reliable(&self, stream: u8, payload: &[u8]) -> Result<(), Error> {
        self.conn.send_reliable(stream, payload, now_ms())
    }

    pub fn send_unreliable(&self, substream: u8, payload: &[u8]) -> Result<(), Error> {
        self.conn.send_unreliable(substream, payload)
    }

    pub fn send_huge(&self, data: &[u8]) -> Result<(), Error> {
        self.conn.send_huge(data, now_ms())
    }

    pub fn disconnect(&self) {
        self.conn.disconnect(sphynx_protocol::constants::DisconnectReason::UserExit);
    }

    /// Any step can get `S2cError` back instead of its expected reply (a
    /// bad cookie, a full server, a blocked key, ...); surfacing that reason
    /// immediately is what makes `on_connect_fail(reason)` possible, instead
    /// of retrying the same request until the step simply times out.
    fn parse_or_error<T>(buf: &[u8], parse: impl Fn(&[u8]) -> Option<T>) -> Result<Option<T>, HandshakeError> {
        if buf.first() == Some(&(HandshakeType::S2cError as u8)) {
            let reason = handshake::decode_error(buf).unwrap_or(HandshakeError::ServerError);
            return Err(reason);
        }
        Ok(parse(buf))
    }

    async fn round_trip<T>(socket: &UdpSocket, packet: &[u8], step_timeout: Duration, parse: impl Fn(&[u8]) -> Result<Option<T>, HandshakeError>) -> Result<T, Error> {
        for _ in 0..3 {
            socket.send(packet).await?;
            let mut buf = vec![0u8; 2048];
            let attempt = timeout(step_timeout, socket.recv(&mut buf)).await;
            if let Ok(Ok(len)) = attempt {
                match parse(&buf[..len]) {
                    Ok(Some(parsed)) => return Ok(parsed),
                    Err(reason) => return Err(sphynx_protocol::Error::Handshake(reason).into()),
                    Ok(None) => {}
                }
            }
        }
        Err(Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timed out")))
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}
