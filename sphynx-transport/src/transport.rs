//! The per-connection transport state machine: four reliable streams,
//! sixteen unreliable-ordered substreams, outgoing cluster assembly, MTU
//! discovery, keep-alive, and silence-timeout detection.

use sphynx_protocol::chunk::{self, Chunk};
use sphynx_protocol::constants::{InternalOpcode, BULK_STREAM, MAX_MESSAGE_SIZE, MTU_FLOOR, NUM_STREAMS, NUM_UNRELIABLE_STREAMS, SILENCE_LIMIT_MS, TIMEOUT_DISCONNECT_MS};

use crate::error::Error;
use crate::flow_control::FlowControl;
use crate::huge::{self, HugeReceiver};
use crate::reliable::{OrderedRecv, ReliableSend, UnorderedRecv};
use crate::unreliable::{UnreliableOrderedRecv, UnreliableOrderedSend};

/// Reliable receive state for one stream: stream 0 is unordered, the rest
/// are ordered.
enum ReliableRecv {
    Unordered(UnorderedRecv),
    Ordered(OrderedRecv),
}

pub struct Transport {
    reliable_send: [ReliableSend; NUM_STREAMS],
    reliable_recv: [ReliableRecv; NUM_STREAMS],
    unreliable_send: Vec<UnreliableOrderedSend>,
    unreliable_recv: Vec<UnreliableOrderedRecv>,
    flow_control: FlowControl,
    mtu: usize,
    cluster: Vec<u8>,
    last_send_on_stream: [i64; NUM_STREAMS],
    last_recv_ms: i64,
    disconnect_sends_remaining: u8,
    disconnect_reason: Option<sphynx_protocol::constants::DisconnectReason>,
    huge_recv: HugeReceiver,
}

/// One fully decoded inbound event.
pub enum Delivery {
    Message { stream: u8, reliable: bool, payload: Vec<u8> },
    /// A reassembled (or end-of-transfer) fragment of a huge-transfer
    /// object riding the bulk stream; `size == 0` with empty `bytes`
    /// signals completion, mirroring the user-facing `on_huge` callback.
    Huge { stream: u8, bytes: Vec<u8>, size: u64 },
    Disconnect(sphynx_protocol::constants::DisconnectReason),
}

impl Transport {
    pub fn new(bandwidth_low_limit: u32, bandwidth_high_limit: u32) -> Self {
        Self {
            reliable_send: std::array::from_fn(|_| ReliableSend::new()),
            reliable_recv: std::array::from_fn(|i| if i == 0 { ReliableRecv::Unordered(UnorderedRecv::new()) } else { ReliableRecv::Ordered(OrderedRecv::new()) }),
            unreliable_send: (0..NUM_UNRELIABLE_STREAMS).map(|_| UnreliableOrderedSend::new()).collect(),
            unreliable_recv: (0..NUM_UNRELIABLE_STREAMS).map(|_| UnreliableOrderedRecv::new()).collect(),
            flow_control: FlowControl::new(bandwidth_low_limit, bandwidth_high_limit),
            mtu: MTU_FLOOR,
            cluster: Vec::new(),
            last_send_on_stream: [0; NUM_STREAMS],
            last_recv_ms: 0,
            disconnect_sends_remaining: 0,
            disconnect_reason: None,
            huge_recv: HugeReceiver::new(),
        }
    }

    /// Queues an object larger than `MAX_MESSAGE_SIZE` for huge-transfer
    /// streaming: a `PushRequest`/`Start` handshake followed by every
    /// chunk's systematic-coded blocks and a closing frame, each sent as one
    /// reliable message on the bulk stream.
    pub fn send_huge(&mut self, data: &[u8], now_ms: i64) -> Result<(), Error> {
        for frame in huge::encode_push(data) {
            self.send_reliable(BULK_STREAM, &frame, now_ms)?;
        }
        Ok(())
    }

    fn max_fragment(&self) -> usize {
        self.mtu.saturating_sub(8)
    }

    fn push_chunk(&mut self, chunk: &Chunk) {
        chunk::encode(chunk, &mut self.cluster);
    }

    pub fn send_reliable(&mut self, stream: u8, payload: &[u8], now_ms: i64) -> Result<(), Error> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge);
        }
        let idx = stream as usize;
        if idx >= NUM_STREAMS {
            return Err(Error::UnknownStream(stream));
        }
        let max_fragment = self.max_fragment();
        let fragments = self.reliable_send[idx].enqueue(payload, max_fragment, now_ms);
        for (id, is_fragment_continuation, frag) in fragments {
            self.push_chunk(&Chunk::ReliableData { stream, id, is_fragment_continuation, payload: frag });
        }
        self.last_send_on_stream[idx] = now_ms;
        Ok(())
    }

    pub fn send_unreliable(&mut self, substream: u8, payload: &[u8]) -> Result<(), Error> {
        let idx = substream as usize;
        if idx >= NUM_UNRELIABLE_STREAMS {
            return Err(Error::UnknownStream(substream));
        }
        let id = self.unreliable_send[idx].next();
        self.push_chunk(&Chunk::UnreliableOrdered { stream: substream, id, payload: payload.to_vec() });
        Ok(())
    }

    /// Begins a graceful disconnect: the reason is queued to be sent up to
    /// three times across subsequent ticks to survive loss.
    pub fn disconnect(&mut self, reason: sphynx_protocol::constants::DisconnectReason) {
        if self.disconnect_reason.is_none() {
            self.disconnect_reason = Some(reason);
            self.disconnect_sends_remaining = 3;
        }
    }

    pub fn is_timed_out(&self, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.last_recv_ms) >= TIMEOUT_DISCONNECT_MS
    }

    /// Drives retransmission, keep-alive, disconnect re-sends, and flushes
    /// the accumulated cluster. Returns the datagram body to hand to the
    /// authenticated-encryption layer, if anything is queued.
    pub fn on_tick(&mut self, now_ms: i64, timeout_loss_count: u32) -> Option<Vec<u8>> {
        self.flow_control.on_tick(now_ms, timeout_loss_count);

        let timeout = self.flow_control.retransmit_timeout_ms();
        for stream in 0..NUM_STREAMS {
            let due = self.reliable_send[stream].due_for_retransmit(now_ms, timeout);
            for (id, is_fragment_continuation, payload) in due {
                chunk::encode(&Chunk::ReliableData { stream: stream as u8, id, is_fragment_continuation, payload }, &mut self.cluster);
            }
        }

        for stream in 0..NUM_STREAMS {
            let pending = self.collect_pending_acks(stream);
            if !pending.is_empty() {
                chunk::encode(&Chunk::Ack { stream: stream as u8, entries: pending }, &mut self.cluster);
            }
        }

        for stream in 0..NUM_STREAMS {
            if now_ms.saturating_sub(self.last_send_on_stream[stream]) >= SILENCE_LIMIT_MS {
                for (id, is_fragment_continuation, payload) in self.reliable_send[stream].enqueue(&[], usize::MAX, now_ms) {
                    chunk::encode(&Chunk::ReliableData { stream: stream as u8, id, is_fragment_continuation, payload }, &mut self.cluster);
                }
                self.last_send_on_stream[stream] = now_ms;
            }
        }

        if let Some(reason) = self.disconnect_reason {
            if self.disconnect_sends_remaining > 0 {
                chunk::encode(&Chunk::Internal { opcode: InternalOpcode::Disco, payload: vec![reason as u8] }, &mut self.cluster);
                self.disconnect_sends_remaining -= 1;
            }
        }

        if self.cluster.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.cluster))
        }
    }

    fn collect_pending_acks(&mut self, stream: usize) -> Vec<(u16, bool)> {
        match &mut self.reliable_recv[stream] {
            ReliableRecv::Ordered(recv) => {
                let mut entries: Vec<(u16, bool)> = recv.pending_ack.iter().map(|id| (*id, recv.pending_nack.contains(id))).collect();
                entries.truncate(8);
                for (id, _) in &entries {
                    recv.pending_ack.remove(id);
                }
                entries
            }
            ReliableRecv::Unordered(recv) => {
                let mut entries: Vec<(u16, bool)> = recv.pending_ack.iter().map(|id| (*id, false)).collect();
                entries.truncate(8);
                for (id, _) in &entries {
                    recv.pending_ack.remove(id);
                }
                entries
            }
        }
    }

    /// Decodes a decrypted datagram body into zero or more delivered events,
    /// updating all internal reliability/flow-control/keep-alive state.
    pub fn receive_datagram(&mut self, now_ms: i64, body: &[u8]) -> Result<Vec<Delivery>, Error> {
        self.last_recv_ms = now_ms;
        let chunks = chunk::decode_all(body)?;
        let mut delivered = Vec::new();

        for c in chunks {
            match c {
                Chunk::Unreliable { stream, payload } => {
                    delivered.push(Delivery::Message { stream, reliable: false, payload });
                }
                Chunk::UnreliableOrdered { stream, id, payload } => {
                    let idx = stream as usize;
                    if idx < NUM_UNRELIABLE_STREAMS {
                        if let Some(out) = self.unreliable_recv[idx].receive(id, payload) {
                            delivered.push(Delivery::Message { stream, reliable: false, payload: out });
                        }
                    }
                }
                Chunk::ReliableData { stream, id, is_fragment_continuation, payload } => {
                    let idx = stream as usize;
                    if idx >= NUM_STREAMS {
                        continue;
                    }
                    let mut messages = Vec::new();
                    match &mut self.reliable_recv[idx] {
                        ReliableRecv::Ordered(recv) => messages.extend(recv.receive(id, is_fragment_continuation, payload)),
                        ReliableRecv::Unordered(recv) => messages.extend(recv.receive(id, payload)),
                    }
                    for msg in messages {
                        if msg.is_empty() {
                            continue;
                        }
                        if stream == BULK_STREAM {
                            if let Some(frame) = huge::decode_frame(&msg) {
                                for (bytes, size) in self.huge_recv.on_frame(frame) {
                                    delivered.push(Delivery::Huge { stream, bytes, size });
                                }
                            }
                        } else {
                            delivered.push(Delivery::Message { stream, reliable: true, payload: msg });
                        }
                    }
                }
                Chunk::Ack { stream, entries } => {
                    let idx = stream as usize;
                    if idx >= NUM_STREAMS {
                        continue;
                    }
                    let mut nack_count = 0u32;
                    for (id, is_nack) in entries {
                        if is_nack {
                            nack_count += 1;
                            continue;
                        }
                        if let Some(first_send) = self.reliable_send[idx].oldest_first_send() {
                            self.flow_control.on_ack(now_ms, first_send);
                        }
                        self.reliable_send[idx].ack(id);
                    }
                    let avg_one_way = self.flow_control.retransmit_timeout_ms();
                    self.flow_control.on_ack_done(avg_one_way, nack_count, body.len());
                }
                Chunk::Internal { opcode, payload } => match opcode {
                    InternalOpcode::MtuProbe => {
                        self.push_chunk(&Chunk::Internal { opcode: InternalOpcode::MtuSet, payload: (payload.len() as u16).to_le_bytes().to_vec() });
                    }
                    InternalOpcode::MtuSet => {
                        if payload.len() == 2 {
                            let observed = u16::from_le_bytes([payload[0], payload[1]]) as usize;
                            if observed > self.mtu {
                                self.mtu = observed;
                            }
                        }
                    }
                    InternalOpcode::TimePing => {
                        self.push_chunk(&Chunk::Internal { opcode: InternalOpcode::TimePong, payload });
                    }
                    InternalOpcode::TimePong => {}
                    InternalOpcode::Disco => {
                        if let Some(&reason_byte) = payload.first() {
                            if let Some(reason) = decode_disconnect_reason(reason_byte) {
                                delivered.push(Delivery::Disconnect(reason));
                            }
                        }
                    }
                },
            }
        }

        Ok(delivered)
    }

    pub fn bulk_stream() -> u8 {
        BULK_STREAM
    }
}

fn decode_disconnect_reason(byte: u8) -> Option<sphynx_protocol::constants::DisconnectReason> {
    use sphynx_protocol::constants::DisconnectReason::*;
    match byte {
        0 => Some(UserExit),
        1 => Some(Timeout),
        2 => Some(Tampering),
        3 => Some(BrokenPipe),
        4 => Some(Silent),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Transport, Transport) {
        (Transport::new(1_000, 1_000_000), Transport::new(1_000, 1_000_000))
    }

    #[test]
    fn reliable_message_delivers_end_to_end() {
        let (mut a, mut b) = pair();
        a.send_reliable(1, b"hello", 0).unwrap();
        let datagram = a.on_tick(0, 0).expect("cluster should be non-empty");
        let delivered = b.receive_datagram(10, &datagram).unwrap();
        assert!(matches!(&delivered[0], Delivery::Message { stream: 1, reliable: true, payload } if payload == b"hello"));
    }

    #[test]
    fn oversized_message_is_rejected() {
        let (mut a, _b) = pair();
        let big = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(a.send_reliable(1, &big, 0).is_err());
    }

    #[test]
    fn ack_clears_sender_unacked_state() {
        let (mut a, mut b) = pair();
        a.send_reliable(2, b"ping", 0).unwrap();
        let datagram = a.on_tick(0, 0).unwrap();
        b.receive_datagram(5, &datagram).unwrap();
        let ack_datagram = b.on_tick(5, 0).expect("ack should be queued");
        a.receive_datagram(10, &ack_datagram).unwrap();
        assert_eq!(a.reliable_send[2].unacked_len(), 0);
    }

    #[test]
    fn disconnect_reason_is_delivered_to_peer() {
        let (mut a, mut b) = pair();
        a.disconnect(sphynx_protocol::constants::DisconnectReason::UserExit);
        let datagram = a.on_tick(0, 0).unwrap();
        let delivered = b.receive_datagram(1, &datagram).unwrap();
        assert!(matches!(delivered[0], Delivery::Disconnect(sphynx_protocol::constants::DisconnectReason::UserExit)));
    }

    #[test]
    fn huge_transfer_streams_across_many_datagrams_and_signals_completion() {
        let (mut a, mut b) = pair();
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 256) as u8).collect();
        a.send_huge(&data, 0).unwrap();

        let mut reassembled = Vec::new();
        let mut saw_close = false;
        let mut now = 0;
        while let Some(datagram) = a.on_tick(now, 0) {
            for event in b.receive_datagram(now, &datagram).unwrap() {
                match event {
                    Delivery::Huge { bytes, size: 0, .. } if bytes.is_empty() => saw_close = true,
                    Delivery::Huge { bytes, .. } => reassembled.extend_from_slice(&bytes),
                    _ => {}
                }
            }
            now += 20;
        }

        assert!(saw_close);
        assert_eq!(reassembled, data);
    }

    #[test]
    fn timeout_detection_fires_after_silence_limit() {
        let (mut a, _b) = pair();
        assert!(!a.is_timed_out(0));
        assert!(a.is_timed_out(TIMEOUT_DISCONNECT_MS + 1));
    }
}
