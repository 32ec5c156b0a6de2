//! Per-stream reliable send/receive state: fragmentation, reassembly,
//! retransmission bookkeeping, and ACK/NACK scheduling.
//!
//! Grounded on the original's `RecvFrag`/`RecvQueue`/`OutgoingMessage`
//! structs (`original_source/include/cat/sphynx/Common.hpp`), re-expressed
//! with owned collections in place of the source's intrusive linked lists.

use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Reliable-stream ids are carried on the wire in 15 bits (the top bit of
/// the 16-bit id field is the fragment-continuation flag, see
/// `sphynx_protocol::chunk`), so the id space sender and receiver both
/// count through must wrap at 2^15, not at `u16::MAX`. Tracking a wider
/// counter here would let the two sides' full-width ids diverge from what
/// the wire can actually carry once either side crosses 32768.
const ID_BITS: u32 = 15;
const ID_MASK: u16 = (1u16 << ID_BITS) - 1;
const ID_MODULUS: i32 = 1 << ID_BITS;

/// Signed circular distance from `expected` to `id` within the 15-bit id
/// space: positive when `id` is ahead, negative when it's a stale repeat.
fn id_delta(id: u16, expected: u16) -> i32 {
    let raw = (id as i32 - expected as i32).rem_euclid(ID_MODULUS);
    if raw >= ID_MODULUS / 2 {
        raw - ID_MODULUS
    } else {
        raw
    }
}

struct SentEntry {
    payload: Vec<u8>,
    is_fragment_continuation: bool,
    first_send_ms: i64,
    last_send_ms: i64,
}

/// Send-side state shared by every reliable stream, ordered or not: it only
/// cares about assigning ids, tracking what's unacked, and retransmitting.
pub struct ReliableSend {
    next_id: u16,
    unacked: BTreeMap<u16, SentEntry>,
}

impl ReliableSend {
    pub fn new() -> Self {
        Self { next_id: 0, unacked: BTreeMap::new() }
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    /// Splits `payload` into fragments no larger than `max_fragment` bytes,
    /// assigns each a sequence id, and records them as freshly sent.
    /// Returns `(id, is_fragment_continuation, payload)` for each fragment
    /// in order, ready to place in the outgoing cluster.
    pub fn enqueue(&mut self, payload: &[u8], max_fragment: usize, now_ms: i64) -> Vec<(u16, bool, Vec<u8>)> {
        let fragments: Vec<Vec<u8>> = if payload.len() > max_fragment && max_fragment > 0 {
            payload.chunks(max_fragment).map(|c| c.to_vec()).collect()
        } else {
            vec![payload.to_vec()]
        };
        let n = fragments.len();
        let mut out = Vec::with_capacity(n);
        for (i, frag) in fragments.into_iter().enumerate() {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1) & ID_MASK;
            let is_cont = i + 1 < n;
            self.unacked.insert(
                id,
                SentEntry { payload: frag.clone(), is_fragment_continuation: is_cont, first_send_ms: now_ms, last_send_ms: now_ms },
            );
            out.push((id, is_cont, frag));
        }
        out
    }

    pub fn ack(&mut self, id: u16) {
        self.unacked.remove(&id);
    }

    /// Returns every unacked message whose last send is older than
    /// `timeout_ms`, re-stamping its last-send time to `now_ms`.
    pub fn due_for_retransmit(&mut self, now_ms: i64, timeout_ms: i64) -> Vec<(u16, bool, Vec<u8>)> {
        let mut out = Vec::new();
        for (id, entry) in self.unacked.iter_mut() {
            if now_ms.saturating_sub(entry.last_send_ms) >= timeout_ms {
                entry.last_send_ms = now_ms;
                out.push((*id, entry.is_fragment_continuation, entry.payload.clone()));
            }
        }
        out
    }

    /// Round-trip sample for the oldest still-unacked entry, used by flow
    /// control to estimate one-way delay. `None` if nothing is in flight.
    pub fn oldest_first_send(&self) -> Option<i64> {
        self.unacked.values().map(|e| e.first_send_ms).min()
    }
}

/// Receive-side state for an ordered reliable stream: delivers to the user
/// in strictly increasing id order, buffering anything that arrives ahead
/// and reassembling fragments transparently.
pub struct OrderedRecv {
    next_expected: u16,
    queued: BTreeMap<u16, (bool, Vec<u8>)>,
    reassembly: Vec<u8>,
    pub pending_ack: BTreeSet<u16>,
    pub pending_nack: BTreeSet<u16>,
}

impl OrderedRecv {
    pub fn new() -> Self {
        Self { next_expected: 0, queued: BTreeMap::new(), reassembly: Vec::new(), pending_ack: BTreeSet::new(), pending_nack: BTreeSet::new() }
    }

    /// Feeds one received reliable-data chunk in; returns any messages that
    /// are now complete and in order, to deliver to the user.
    pub fn receive(&mut self, id: u16, is_fragment_continuation: bool, payload: Vec<u8>) -> Vec<Vec<u8>> {
        let id = id & ID_MASK;
        self.pending_ack.insert(id);
        let delta = id_delta(id, self.next_expected);

        if delta == 0 {
            let mut delivered = Vec::new();
            self.absorb(is_fragment_continuation, payload, &mut delivered);
            self.next_expected = self.next_expected.wrapping_add(1) & ID_MASK;
            self.pending_nack.remove(&id);
            while let Some((&qid, _)) = self.queued.iter().next() {
                if qid != self.next_expected {
                    break;
                }
                let (qcont, qpayload) = self.queued.remove(&qid).unwrap();
                self.absorb(qcont, qpayload, &mut delivered);
                self.next_expected = self.next_expected.wrapping_add(1) & ID_MASK;
                self.pending_nack.remove(&qid);
            }
            delivered
        } else if delta > 0 {
            self.queued.entry(id).or_insert((is_fragment_continuation, payload));
            let mut k = self.next_expected;
            while k != id {
                self.pending_nack.insert(k);
                k = k.wrapping_add(1) & ID_MASK;
            }
            Vec::new()
        } else {
            // duplicate of something already delivered; still ACKed above.
            Vec::new()
        }
    }

    fn absorb(&mut self, is_fragment_continuation: bool, payload: Vec<u8>, delivered: &mut Vec<Vec<u8>>) {
        if is_fragment_continuation {
            self.reassembly.extend_from_slice(&payload);
        } else if self.reassembly.is_empty() {
            delivered.push(payload);
        } else {
            self.reassembly.extend_from_slice(&payload);
            delivered.push(std::mem::take(&mut self.reassembly));
        }
    }
}

/// Receive-side state for the reliable-*unordered* stream (stream 0):
/// each message delivers at-most-once, as soon as its id is established as
/// unseen, with no ordering requirement.
pub struct UnorderedRecv {
    seen: HashSet<u16>,
    high_water: u16,
    pub pending_ack: BTreeSet<u16>,
}

const UNORDERED_DEDUP_WINDOW: u16 = 4096;

impl UnorderedRecv {
    pub fn new() -> Self {
        Self { seen: HashSet::new(), high_water: 0, pending_ack: BTreeSet::new() }
    }

    /// Returns `Some(payload)` the first time `id` is seen, `None` on
    /// replay/duplicate. `id` is a wire-truncated 15-bit value like every
    /// other reliable-stream id (see `ID_MASK`); the dedup window math below
    /// operates in that same 15-bit circular space.
    pub fn receive(&mut self, id: u16, payload: Vec<u8>) -> Option<Vec<u8>> {
        let id = id & ID_MASK;
        self.pending_ack.insert(id);
        if !self.seen.insert(id) {
            return None;
        }
        if id_delta(id, self.high_water) > 0 {
            self.high_water = id;
            let floor = self.high_water.wrapping_sub(UNORDERED_DEDUP_WINDOW) & ID_MASK;
            self.seen.retain(|seen_id| id_delta(*seen_id, floor) >= 0);
        }
        Some(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_recv_buffers_and_delivers_in_order() {
        let mut recv = OrderedRecv::new();
        assert!(recv.receive(1, false, b"BB".to_vec()).is_empty());
        assert!(recv.receive(2, false, b"CC".to_vec()).is_empty());
        let delivered = recv.receive(0, false, b"AA".to_vec());
        assert_eq!(delivered, vec![b"AA".to_vec(), b"BB".to_vec(), b"CC".to_vec()]);
    }

    #[test]
    fn ordered_recv_reassembles_fragments() {
        let mut recv = OrderedRecv::new();
        assert!(recv.receive(0, true, b"hel".to_vec()).is_empty());
        assert!(recv.receive(1, true, b"lo ".to_vec()).is_empty());
        let delivered = recv.receive(2, false, b"world".to_vec());
        assert_eq!(delivered, vec![b"hello world".to_vec()]);
    }

    #[test]
    fn ordered_recv_duplicate_after_delivery_is_dropped() {
        let mut recv = OrderedRecv::new();
        recv.receive(0, false, b"A".to_vec());
        assert!(recv.receive(0, false, b"A".to_vec()).is_empty());
    }

    #[test]
    fn unordered_recv_delivers_each_id_once() {
        let mut recv = UnorderedRecv::new();
        assert!(recv.receive(5, b"x".to_vec()).is_some());
        assert!(recv.receive(5, b"x".to_vec()).is_none());
        assert!(recv.receive(6, b"y".to_vec()).is_some());
    }

    #[test]
    fn send_retransmits_only_after_timeout() {
        let mut send = ReliableSend::new();
        send.enqueue(b"hi", 1000, 0);
        assert!(send.due_for_retransmit(50, 100).is_empty());
        let due = send.due_for_retransmit(150, 100);
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn send_ack_clears_unacked_entry() {
        let mut send = ReliableSend::new();
        let sent = send.enqueue(b"hi", 1000, 0);
        let (id, _, _) = sent[0];
        send.ack(id);
        assert_eq!(send.unacked_len(), 0);
    }

    #[test]
    fn enqueue_splits_oversized_payload_into_fragments() {
        let mut send = ReliableSend::new();
        let chunks = send.enqueue(&[0u8; 25], 10, 0);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].1 && chunks[1].1 && !chunks[2].1);
    }

    #[test]
    fn send_id_wraps_at_15_bits_not_16() {
        let mut send = ReliableSend::new();
        send.next_id = ID_MASK;
        let chunks = send.enqueue(b"x", 1000, 0);
        assert_eq!(chunks[0].0, ID_MASK);
        let chunks = send.enqueue(b"y", 1000, 0);
        assert_eq!(chunks[0].0, 0);
    }

    #[test]
    fn ordered_recv_delivers_in_order_across_the_15_bit_wraparound() {
        let mut recv = OrderedRecv::new();
        recv.next_expected = ID_MASK;
        let delivered = recv.receive(ID_MASK, false, b"last".to_vec());
        assert_eq!(delivered, vec![b"last".to_vec()]);
        assert_eq!(recv.next_expected, 0);
        let delivered = recv.receive(0, false, b"wrapped".to_vec());
        assert_eq!(delivered, vec![b"wrapped".to_vec()]);
    }

    #[test]
    fn ordered_recv_does_not_stall_after_wraparound_with_reordered_arrival() {
        let mut recv = OrderedRecv::new();
        recv.next_expected = ID_MASK;
        assert!(recv.receive(0, false, b"B".to_vec()).is_empty());
        let delivered = recv.receive(ID_MASK, false, b"A".to_vec());
        assert_eq!(delivered, vec![b"A".to_vec(), b"B".to_vec()]);
    }

    #[test]
    fn unordered_recv_accepts_ids_across_the_15_bit_wraparound() {
        let mut recv = UnorderedRecv::new();
        recv.high_water = ID_MASK;
        recv.seen.insert(ID_MASK);
        assert!(recv.receive(0, b"wrapped".to_vec()).is_some());
        assert!(recv.receive(0, b"wrapped".to_vec()).is_none());
    }
}
