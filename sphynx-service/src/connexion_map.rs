//! A flat, power-of-two hash table mapping `NetAddr -> Connexion`, with
//! linear-congruential collision probing and a separate salted flood
//! counter table.
//!
//! Grounded bit-for-bit on `original_source/src/sphynx/ConnexionMap.cpp`:
//! the probe recurrence, the backward collision-flag cleanup on remove, and
//! the flood-threshold check are all preserved. The `5x + 1` recurrence
//! (multiplier ≡ 1 mod 4, odd increment) is a textbook full-period LCG over
//! a power-of-two modulus (Hull-Dobell), same shape as the original's
//! `COLLISION_MULTIPLIER`/`COLLISION_INCREMENTER`; `0xCCCC...CD` is the
//! standard multiplicative inverse of 5 modulo 2^64, used to walk the probe
//! sequence backward on removal.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use sphynx_crypto::random::SecureRandom;

use crate::connexion::Connexion;
use crate::error::Error;
use crate::net_addr::NetAddr;

const COLLISION_MULTIPLIER: u64 = 5;
const COLLISION_INCREMENTER: u64 = 1;
/// Multiplicative inverse of 5 modulo 2^64; used to invert the probe step.
const COLLISION_MULT_INVERSE: u64 = 0xCCCC_CCCC_CCCC_CCCD;

struct Slot {
    addr: Option<NetAddr>,
    conn: Option<Arc<Connexion>>,
    collision: bool,
}

impl Slot {
    fn empty() -> Self {
        Self { addr: None, conn: None, collision: false }
    }
}

pub struct ConnexionMap {
    mask: u64,
    ip_salt: u64,
    port_salt: u64,
    flood_salt: u64,
    flood_mask: u64,
    table: RwLock<Vec<Slot>>,
    flood_table: RwLock<Vec<u32>>,
    connection_flood_threshold: u32,
    count: AtomicUsize,
}

fn wang_hash_u32(mut key: u32) -> u32 {
    key = (!key).wrapping_add(key << 15);
    key ^= key >> 12;
    key = key.wrapping_add(key << 2);
    key ^= key >> 4;
    key = key.wrapping_mul(2057);
    key ^= key >> 16;
    key
}

fn murmur_mix(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h
}

impl ConnexionMap {
    pub fn new(table_size_pow2: usize, flood_table_size_pow2: usize, connection_flood_threshold: u32, rng: &mut SecureRandom) -> Self {
        assert!(table_size_pow2.is_power_of_two());
        assert!(flood_table_size_pow2.is_power_of_two());
        let table = (0..table_size_pow2).map(|_| Slot::empty()).collect();
        let flood_table = vec![0u32; flood_table_size_pow2];
        Self {
            mask: (table_size_pow2 - 1) as u64,
            ip_salt: rng.next_u64(),
            port_salt: rng.next_u64(),
            flood_salt: rng.next_u64(),
            flood_mask: (flood_table_size_pow2 - 1) as u64,
            table: RwLock::new(table),
            flood_table: RwLock::new(flood_table),
            connection_flood_threshold,
            count: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        (self.mask + 1) as usize
    }

    /// Every slot occupied: `insert`'s probe would never terminate if it
    /// tried anyway, so the handshake dispatcher must check this first and
    /// reply `server-full` instead.
    pub fn is_full(&self) -> bool {
        self.count.load(Ordering::Relaxed) >= self.capacity()
    }

    fn home_key(&self, addr: &NetAddr) -> u64 {
        let ip = addr.ip_bytes();
        let ip_hash = if ip.len() == 4 {
            let v = u32::from_be_bytes([ip[0], ip[1], ip[2], ip[3]]);
            wang_hash_u32(v ^ self.ip_salt as u32) as u64
        } else {
            let mut h = self.ip_salt;
            for chunk in ip.chunks(8) {
                let mut buf = [0u8; 8];
                buf[..chunk.len()].copy_from_slice(chunk);
                h ^= murmur_mix(u64::from_le_bytes(buf));
            }
            h
        };
        let port = addr.port() as u64;
        let folded_port = port.wrapping_mul(self.port_salt.wrapping_mul(4).wrapping_add(1));
        (ip_hash ^ folded_port) & self.mask
    }

    fn flood_key(&self, addr: &NetAddr) -> u64 {
        let ip = addr.ip_bytes();
        let mut h = self.flood_salt;
        for chunk in ip.chunks(8) {
            let mut buf = [0u8; 8];
            buf[..chunk.len()].copy_from_slice(chunk);
            h ^= murmur_mix(u64::from_le_bytes(buf));
        }
        h & self.flood_mask
    }

    fn probe_forward(&self, key: u64) -> u64 {
        (key.wrapping_mul(COLLISION_MULTIPLIER).wrapping_add(COLLISION_INCREMENTER)) & self.mask
    }

    fn probe_backward(&self, key: u64) -> u64 {
        (key.wrapping_sub(COLLISION_INCREMENTER).wrapping_mul(COLLISION_MULT_INVERSE)) & self.mask
    }

    pub fn lookup(&self, addr: &NetAddr) -> Option<Arc<Connexion>> {
        let table = self.table.read();
        let mut key = self.home_key(addr);
        loop {
            let slot = &table[key as usize];
            if let Some(slot_addr) = &slot.addr {
                if slot_addr == addr {
                    return slot.conn.clone();
                }
            } else if !slot.collision {
                return None;
            }
            key = self.probe_forward(key);
        }
    }

    /// Used by the handshake dispatcher for a source address with no
    /// existing connexion: confirms the address is truly absent, then
    /// checks whether that source has exceeded the flood threshold.
    pub fn check_flood(&self, addr: &NetAddr) -> bool {
        let flood_key = self.flood_key(addr);
        let count = self.flood_table.read()[flood_key as usize];
        count >= self.connection_flood_threshold
    }

    pub fn insert(&self, addr: NetAddr, conn: Arc<Connexion>) -> Result<(), Error> {
        let mut table = self.table.write();
        // Checked under the table's write lock, not just via `is_full`
        // beforehand: two concurrent inserts both passing a pre-lock check
        // could otherwise both reach a fully occupied table, where the
        // probe loop below would never find an empty slot and spin forever.
        if self.count.load(Ordering::Relaxed) >= self.capacity() {
            return Err(Error::MapFull);
        }

        let mut key = self.home_key(&addr);
        loop {
            if table[key as usize].addr.is_none() {
                break;
            }
            table[key as usize].collision = true;
            key = self.probe_forward(key);
        }
        table[key as usize] = Slot { addr: Some(addr), conn: Some(conn), collision: table[key as usize].collision };
        self.count.fetch_add(1, Ordering::Relaxed);
        drop(table);

        let flood_key = self.flood_key(&addr);
        self.flood_table.write()[flood_key as usize] += 1;
        Ok(())
    }

    pub fn remove(&self, addr: &NetAddr) {
        let mut table = self.table.write();
        let mut key = self.home_key(addr);
        let found_key = loop {
            let slot = &table[key as usize];
            match &slot.addr {
                Some(slot_addr) if slot_addr == addr => break key,
                None if !slot.collision => return,
                _ => {}
            }
            key = self.probe_forward(key);
        };

        table[found_key as usize] = Slot::empty();
        self.count.fetch_sub(1, Ordering::Relaxed);

        let mut walk_key = self.probe_backward(found_key);
        loop {
            let slot = &table[walk_key as usize];
            if slot.addr.is_some() || !slot.collision {
                break;
            }
            table[walk_key as usize].collision = false;
            walk_key = self.probe_backward(walk_key);
        }
        drop(table);

        let flood_key = self.flood_key(addr);
        let mut flood = self.flood_table.write();
        let counter = &mut flood[flood_key as usize];
        *counter = counter.saturating_sub(1);
    }

    pub fn len(&self) -> usize {
        self.table.read().iter().filter(|s| s.addr.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connexion::Connexion;
    use std::net::SocketAddr;

    fn addr(s: &str) -> NetAddr {
        NetAddr::new(s.parse::<SocketAddr>().unwrap())
    }

    fn fresh_map() -> ConnexionMap {
        let mut rng = SecureRandom::new();
        ConnexionMap::new(64, 16, 10, &mut rng)
    }

    #[test]
    fn insert_then_lookup_returns_same_connexion() {
        let map = fresh_map();
        let a = addr("1.2.3.4:1000");
        let conn = Arc::new(Connexion::new_for_test());
        map.insert(a, conn.clone()).unwrap();
        let found = map.lookup(&a).unwrap();
        assert!(Arc::ptr_eq(&found, &conn));
    }

    #[test]
    fn remove_then_lookup_returns_none() {
        let map = fresh_map();
        let a = addr("1.2.3.4:1000");
        map.insert(a, Arc::new(Connexion::new_for_test())).unwrap();
        map.remove(&a);
        assert!(map.lookup(&a).is_none());
    }

    #[test]
    fn lookup_of_address_never_inserted_is_none() {
        let map = fresh_map();
        assert!(map.lookup(&addr("9.9.9.9:1")).is_none());
    }

    #[test]
    fn many_addresses_survive_collisions_round_trip() {
        let map = fresh_map();
        let mut addrs = Vec::new();
        for port in 0..50u16 {
            let a = addr(&format!("10.0.0.{}:{}", port % 255 + 1, 2000 + port));
            map.insert(a, Arc::new(Connexion::new_for_test())).unwrap();
            addrs.push(a);
        }
        for a in &addrs {
            assert!(map.lookup(a).is_some(), "expected {a} to be found");
        }
        assert_eq!(map.len(), 50);
    }

    #[test]
    fn removing_one_does_not_break_lookup_of_its_collision_chain_neighbors() {
        let map = fresh_map();
        let mut addrs = Vec::new();
        for port in 0..20u16 {
            let a = addr(&format!("10.0.0.1:{}", 3000 + port));
            map.insert(a, Arc::new(Connexion::new_for_test())).unwrap();
            addrs.push(a);
        }
        map.remove(&addrs[5]);
        for (i, a) in addrs.iter().enumerate() {
            if i == 5 {
                assert!(map.lookup(a).is_none());
            } else {
                assert!(map.lookup(a).is_some(), "neighbor {i} lost after removal");
            }
        }
    }

    #[test]
    fn flood_counter_tracks_inserts_and_removes() {
        let map = fresh_map();
        let a = addr("5.5.5.5:1");
        assert!(!map.check_flood(&a));
        for port in 0..10u16 {
            map.insert(addr(&format!("5.5.5.5:{}", port + 1)), Arc::new(Connexion::new_for_test())).unwrap();
        }
        assert!(map.check_flood(&a));
    }

    #[test]
    fn insert_past_capacity_returns_map_full_instead_of_spinning() {
        let mut rng = SecureRandom::new();
        let map = ConnexionMap::new(4, 4, 100, &mut rng);
        for port in 0..4u16 {
            map.insert(addr(&format!("10.0.0.{}:{}", port + 1, 9000 + port)), Arc::new(Connexion::new_for_test())).unwrap();
        }
        assert!(map.is_full());
        let err = map.insert(addr("10.0.0.9:9999"), Arc::new(Connexion::new_for_test()));
        assert!(matches!(err, Err(Error::MapFull)));
    }

    #[test]
    fn remove_frees_capacity_for_a_subsequent_insert() {
        let mut rng = SecureRandom::new();
        let map = ConnexionMap::new(4, 4, 100, &mut rng);
        let mut addrs = Vec::new();
        for port in 0..4u16 {
            let a = addr(&format!("10.0.0.{}:{}", port + 1, 9000 + port));
            map.insert(a, Arc::new(Connexion::new_for_test())).unwrap();
            addrs.push(a);
        }
        map.remove(&addrs[0]);
        assert!(!map.is_full());
        map.insert(addr("10.0.0.9:9999"), Arc::new(Connexion::new_for_test())).unwrap();
        assert!(map.is_full());
    }
}
