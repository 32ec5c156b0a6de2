//! The `Connexion` object: one peer's live authenticated-encryption state,
//! transport state machine, and lifecycle, bundled behind a lock so a
//! worker task can drive it while the map's readers concurrently look it
//! up.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use sphynx_protocol::ae::AuthenticatedEncryption;
use sphynx_protocol::handshake::SessionKeys;
use sphynx_transport::{Delivery, Transport};

use crate::error::Error;
use crate::net_addr::NetAddr;

/// Sentinel meaning "not yet assigned to a worker".
const NO_WORKER: usize = usize::MAX;

/// Mirrors the teacher's coarse connection-lifecycle states, driven by
/// graceful disconnect and silence timeout rather than by a single boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    Draining,
    Finalizing,
    Gone,
}

/// The server side's cache of the first-seen CHALLENGE and the ANSWER it
/// computed for it, so a retransmitted CHALLENGE can get the cached ANSWER
/// re-emitted with no new cryptographic work (see spec.md's handshake memo).
struct HandshakeMemo {
    challenge: Vec<u8>,
    answer: Vec<u8>,
}

pub struct Connexion {
    remote: NetAddr,
    ae: Mutex<AuthenticatedEncryption>,
    transport: Mutex<Transport>,
    lifecycle: Mutex<Lifecycle>,
    created_at_ms: i64,
    last_activity_ms: AtomicI64,
    /// Index of the worker task this connexion was assigned to at creation;
    /// never changes afterward (no migration, per §4.8).
    worker_idx: AtomicUsize,
    handshake_memo: Mutex<Option<HandshakeMemo>>,
}

impl Connexion {
    pub fn new(remote: NetAddr, keys: SessionKeys, is_initiator: bool, bandwidth_low_limit: u32, bandwidth_high_limit: u32, now_ms: i64) -> Self {
        let ae = if is_initiator {
            AuthenticatedEncryption::new(keys.c2s_mac, keys.c2s_enc, keys.s2c_mac, keys.s2c_enc, true)
        } else {
            AuthenticatedEncryption::new(keys.s2c_mac, keys.s2c_enc, keys.c2s_mac, keys.c2s_enc, false)
        };
        Self {
            remote,
            ae: Mutex::new(ae),
            transport: Mutex::new(Transport::new(bandwidth_low_limit, bandwidth_high_limit)),
            lifecycle: Mutex::new(Lifecycle::Active),
            created_at_ms: now_ms,
            last_activity_ms: AtomicI64::new(now_ms),
            worker_idx: AtomicUsize::new(NO_WORKER),
            handshake_memo: Mutex::new(None),
        }
    }

    /// A connexion whose keys are irrelevant to the test, for exercising the
    /// map's probing and bookkeeping in isolation.
    #[cfg(test)]
    pub fn new_for_test() -> Self {
        use sphynx_crypto::secret::Secret;
        let ae = AuthenticatedEncryption::new(Secret::new([0u8; 16]), Secret::new([0u8; 32]), Secret::new([0u8; 16]), Secret::new([0u8; 32]), true);
        Self {
            remote: NetAddr::new("127.0.0.1:0".parse::<SocketAddr>().unwrap()),
            ae: Mutex::new(ae),
            transport: Mutex::new(Transport::new(1_000, 1_000_000)),
            lifecycle: Mutex::new(Lifecycle::Active),
            created_at_ms: 0,
            last_activity_ms: AtomicI64::new(0),
            worker_idx: AtomicUsize::new(NO_WORKER),
            handshake_memo: Mutex::new(None),
        }
    }

    /// Records the CHALLENGE this connexion was created from and the ANSWER
    /// it produced, so a later retransmission of the same CHALLENGE can be
    /// served from cache instead of redone.
    pub fn cache_handshake(&self, challenge: Vec<u8>, answer: Vec<u8>) {
        *self.handshake_memo.lock() = Some(HandshakeMemo { challenge, answer });
    }

    /// Returns the cached ANSWER bytes if `challenge` is byte-identical to
    /// the one this connexion was created from, `None` otherwise (including
    /// when nothing was ever cached).
    pub fn cached_answer_for(&self, challenge: &[u8]) -> Option<Vec<u8>> {
        self.handshake_memo.lock().as_ref().filter(|memo| memo.challenge == challenge).map(|memo| memo.answer.clone())
    }

    /// Set once, by `WorkerPool::assign`, right after this connexion's
    /// creation. Looked up by the I/O dispatcher to route an inbound
    /// datagram straight to the owning worker's queue.
    pub fn set_worker_idx(&self, idx: usize) {
        self.worker_idx.store(idx, Ordering::Relaxed);
    }

    pub fn worker_idx(&self) -> Option<usize> {
        match self.worker_idx.load(Ordering::Relaxed) {
            NO_WORKER => None,
            idx => Some(idx),
        }
    }

    pub fn remote(&self) -> NetAddr {
        self.remote
    }

    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock()
    }

    pub fn send_reliable(&self, stream: u8, payload: &[u8], now_ms: i64) -> Result<(), Error> {
        self.transport.lock().send_reliable(stream, payload, now_ms)?;
        Ok(())
    }

    pub fn send_unreliable(&self, substream: u8, payload: &[u8]) -> Result<(), Error> {
        self.transport.lock().send_unreliable(substream, payload)?;
        Ok(())
    }

    /// Streams an object larger than `MAX_MESSAGE_SIZE` over the bulk
    /// reliable stream's huge-transfer overlay.
    pub fn send_huge(&self, data: &[u8], now_ms: i64) -> Result<(), Error> {
        self.transport.lock().send_huge(data, now_ms)?;
        Ok(())
    }

    pub fn disconnect(&self, reason: sphynx_protocol::constants::DisconnectReason) {
        self.transport.lock().disconnect(reason);
        *self.lifecycle.lock() = Lifecycle::Draining;
    }

    /// Runs one worker tick: advances the transport state machine and, if
    /// anything is queued, encrypts it into a datagram ready to send.
    pub fn on_tick(&self, now_ms: i64, timeout_loss_count: u32) -> Result<Option<Vec<u8>>, Error> {
        let body = self.transport.lock().on_tick(now_ms, timeout_loss_count);
        match body {
            Some(plaintext) => Ok(Some(self.ae.lock().encrypt(&plaintext)?)),
            None => Ok(None),
        }
    }

    /// Decrypts and processes one inbound datagram, returning delivered
    /// application events.
    pub fn on_datagram(&self, now_ms: i64, wire: &[u8]) -> Result<Vec<Delivery>, Error> {
        self.last_activity_ms.store(now_ms, Ordering::Relaxed);
        let plaintext = self.ae.lock().decrypt(wire)?;
        let delivered = self.transport.lock().receive_datagram(now_ms, &plaintext)?;
        for event in &delivered {
            if let Delivery::Disconnect(_) = event {
                *self.lifecycle.lock() = Lifecycle::Finalizing;
            }
        }
        Ok(delivered)
    }

    pub fn is_timed_out(&self, now_ms: i64) -> bool {
        self.transport.lock().is_timed_out(now_ms)
    }

    pub fn mark_gone(&self) {
        *self.lifecycle.lock() = Lifecycle::Gone;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sphynx_crypto::secret::Secret;

    fn keys() -> SessionKeys {
        SessionKeys {
            c2s_mac: Secret::new([1u8; 16]),
            s2c_mac: Secret::new([2u8; 16]),
            c2s_enc: Secret::new([3u8; 32]),
            s2c_enc: Secret::new([4u8; 32]),
        }
    }

    fn pair() -> (Connexion, Connexion) {
        let addr = NetAddr::new("127.0.0.1:9".parse::<SocketAddr>().unwrap());
        let client = Connexion::new(addr, keys(), true, 1_000, 1_000_000, 0);
        let server = Connexion::new(addr, keys(), false, 1_000, 1_000_000, 0);
        (client, server)
    }

    #[test]
    fn message_round_trips_through_encryption_and_transport() {
        let (client, server) = pair();
        client.send_reliable(1, b"hi server", 0).unwrap();
        let wire = client.on_tick(0, 0).unwrap().expect("datagram queued");
        let delivered = server.on_datagram(5, &wire).unwrap();
        assert!(matches!(&delivered[0], Delivery::Message { payload, .. } if payload == b"hi server"));
    }

    #[test]
    fn disconnect_moves_lifecycle_to_draining_then_peer_to_finalizing() {
        let (client, server) = pair();
        client.disconnect(sphynx_protocol::constants::DisconnectReason::UserExit);
        assert_eq!(client.lifecycle(), Lifecycle::Draining);
        let wire = client.on_tick(0, 0).unwrap().unwrap();
        server.on_datagram(1, &wire).unwrap();
        assert_eq!(server.lifecycle(), Lifecycle::Finalizing);
    }

    #[test]
    fn new_for_test_connexion_has_no_timeout_at_time_zero() {
        let conn = Connexion::new_for_test();
        assert!(!conn.is_timed_out(0));
    }
}
