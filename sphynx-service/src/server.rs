//! Server-side façade: binds a socket, runs the stateless HELLO/COOKIE
//! handshake dispatch, and hands completed connexions to the worker pool.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use sphynx_crypto::random::SecureRandom;
use sphynx_protocol::constants::{HandshakeError, HandshakeType};
use sphynx_protocol::cookie::CookieJar;
use sphynx_protocol::handshake::{self, ServerIdentity};
use sphynx_transport::Delivery;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::SphynxConfig;
use crate::connexion::Connexion;
use crate::connexion_map::ConnexionMap;
use crate::error::Error;
use crate::host::UdpHost;
use crate::net_addr::NetAddr;
use crate::worker::{Delivered, WorkerPool};

/// Application-visible events surfaced by the server, analogous to the
/// teacher's `Event` enum passed through `HostSystem::event`.
pub enum ServerEvent {
    Connected(NetAddr),
    Message { from: NetAddr, stream: u8, reliable: bool, payload: Vec<u8> },
    Huge { from: NetAddr, stream: u8, bytes: Vec<u8>, size: u64 },
    Disconnected(NetAddr, sphynx_protocol::constants::DisconnectReason),
}

pub struct SphynxServer {
    identity: ServerIdentity,
    cookies: Mutex<CookieJar>,
    rng: Mutex<SecureRandom>,
    map: Arc<ConnexionMap>,
    pool: WorkerPool,
    host: Arc<UdpHost>,
    config: SphynxConfig,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
}

impl SphynxServer {
    pub async fn bind(addr: SocketAddr, config: SphynxConfig) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ServerEvent>), Error> {
        let mut rng = SecureRandom::new();
        let identity = ServerIdentity::generate(&mut rng);
        let cookies = CookieJar::new(&mut rng);
        let map = Arc::new(ConnexionMap::new(config.hash_table_size, config.flood_table_size, config.connection_flood_threshold, &mut rng));

        let host = Arc::new(UdpHost::bind(addr).await?);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (delivered_tx, mut delivered_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(config.worker_count, config.worker_tick_ms, outbound_tx, delivered_tx);
        host.spawn_outbound_drain(outbound_rx);

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let server = Arc::new(Self {
            identity,
            cookies: Mutex::new(cookies),
            rng: Mutex::new(rng),
            map,
            pool,
            host: host.clone(),
            config,
            events_tx,
        });

        let delivered_server = server.clone();
        tokio::spawn(async move {
            while let Some(Delivered { from, event }) = delivered_rx.recv().await {
                delivered_server.on_delivered(from, event);
            }
        });

        let dispatch = server.clone();
        host.spawn_inbound_loop(move |from, body| {
            dispatch.on_datagram(from, body);
        });

        Ok((server, events_rx))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.host.local_addr()
    }

    pub fn public_key(&self) -> sphynx_crypto::curve::CurvePoint {
        self.identity.public
    }

    /// Entry point for every inbound datagram. Established connexions are
    /// routed straight to their owning worker's queue (§4.8); only
    /// datagrams from addresses with no connexion yet reach the (stateless,
    /// socket-writing) handshake path, which runs on its own task.
    ///
    /// A CHALLENGE-tagged datagram from an address that already has a
    /// connexion is a retransmission of a lost ANSWER, not transport
    /// traffic: routing it into AE-decrypt would just reject it as garbage,
    /// so it's special-cased to re-emit the cached ANSWER instead (§4.2's
    /// handshake memo).
    fn on_datagram(self: &Arc<Self>, from: NetAddr, body: Vec<u8>) {
        if let Some(conn) = self.map.lookup(&from) {
            if body.first().copied() == Some(HandshakeType::C2sChallenge as u8) {
                let server = self.clone();
                tokio::spawn(async move { server.on_challenge_retransmission(from, conn, body).await });
                return;
            }
            if let Some(idx) = conn.worker_idx() {
                self.pool.dispatch_inbound(idx, from, body);
            }
            return;
        }

        let server = self.clone();
        tokio::spawn(async move { server.on_handshake_packet(from, body).await });
    }

    /// Re-emits the cached ANSWER for a CHALLENGE retransmission with no new
    /// cryptographic work. A challenge that doesn't match what this
    /// connexion was created from is silently dropped, same as any other
    /// unauthenticated parse/verify failure.
    async fn on_challenge_retransmission(&self, from: NetAddr, conn: Arc<Connexion>, body: Vec<u8>) {
        if let Some(answer) = conn.cached_answer_for(&body) {
            let _ = self.host.send_to(from, &answer).await;
        }
    }

    fn on_delivered(&self, from: NetAddr, event: Delivery) {
        match event {
            Delivery::Message { stream, reliable, payload } => {
                let _ = self.events_tx.send(ServerEvent::Message { from, stream, reliable, payload });
            }
            Delivery::Huge { stream, bytes, size } => {
                let _ = self.events_tx.send(ServerEvent::Huge { from, stream, bytes, size });
            }
            Delivery::Disconnect(reason) => {
                self.map.remove(&from);
                let _ = self.events_tx.send(ServerEvent::Disconnected(from, reason));
            }
        }
    }

    async fn on_handshake_packet(&self, from: NetAddr, body: Vec<u8>) {
        let Some(&tag) = body.first() else { return };
        let Some(kind) = HandshakeType::from_u8(tag) else { return };
        let addr_bytes = addr_key_bytes(&from);

        match kind {
            HandshakeType::C2sHello => {
                if handshake::decode_hello(&body).is_err() {
                    return;
                }
                let cookie = self.cookies.lock().issue(&addr_bytes);
                let reply = handshake::encode_cookie(cookie);
                let _ = self.host.send_to(from, &reply).await;
            }
            HandshakeType::C2sChallenge => {
                let Ok((cookie, big_a)) = handshake::decode_challenge(&body) else { return };
                // A bad cookie means this traffic isn't authenticated yet:
                // replying here would hand an attacker a reflection/oracle
                // primitive against a spoofed source, so it's dropped
                // silently instead (spec.md line 108, SPEC_FULL.md §7).
                if !self.cookies.lock().verify(&addr_bytes, &cookie) {
                    return;
                }
                if self.map.check_flood(&from) {
                    let _ = self.host.send_to(from, &handshake::encode_error(HandshakeError::ServerFull)).await;
                    return;
                }
                if self.map.is_full() {
                    let _ = self.host.send_to(from, &handshake::encode_error(HandshakeError::ServerFull)).await;
                    return;
                }

                let mut rng = self.rng.lock();
                let result = handshake::server_respond(&self.identity, &big_a, &mut rng);
                drop(rng);

                let Ok((big_y, r, keys, proof)) = result else {
                    let _ = self.host.send_to(from, &handshake::encode_error(HandshakeError::ServerError)).await;
                    return;
                };

                let data_port = self.host.local_addr().map(|a| a.port()).unwrap_or(0);
                let reply = handshake::encode_answer(data_port, &big_y, &r, &proof);

                let conn = Arc::new(Connexion::new(from, keys, false, self.config.bandwidth_low_limit, self.config.bandwidth_high_limit, now_ms()));
                conn.cache_handshake(body.clone(), reply.clone());
                if self.map.insert(from, conn.clone()).is_ok() {
                    self.pool.assign(conn);
                    let _ = self.events_tx.send(ServerEvent::Connected(from));
                    info!(%from, "connexion established");
                }

                let _ = self.host.send_to(from, &reply).await;
            }
            HandshakeType::S2cCookie | HandshakeType::S2cAnswer | HandshakeType::S2cError => {
                // Server-originated tags arriving at the server: not ours to handle.
            }
        }
    }
}

fn addr_key_bytes(addr: &NetAddr) -> Vec<u8> {
    let mut out = addr.ip_bytes();
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_picks_an_ephemeral_port() {
        let (server, _events) = SphynxServer::bind("127.0.0.1:0".parse().unwrap(), SphynxConfig::default()).await.unwrap();
        assert!(server.local_addr().unwrap().port() > 0);
    }
}
