//! A TCP-Westwood-derived bandwidth estimator feeding the transport's send
//! pacing and retransmission timeout.
//!
//! Grounded on `original_source/include/cat/sphynx/FlowControl.hpp`: the
//! three-phase design (slow start / steady state / congestion reaction),
//! the 500ms epoch, and the ring-buffered RTT samples are preserved; the
//! original's fixed-size C arrays become a bounded `VecDeque` here.

use std::collections::VecDeque;

pub const EPOCH_INTERVAL_MS: i64 = 500;
const RTT_SAMPLE_CAP: usize = 20;
const RTT_FLOOR_MS: i64 = 100;
const RTT_CEILING_MS: i64 = 3_000;

pub struct FlowControl {
    bandwidth_low_limit: f64,
    bandwidth_high_limit: f64,
    bps: f64,
    available_bytes: f64,
    last_epoch_ms: i64,
    rtt_samples: VecDeque<i64>,
    smoothed_rtt_ms: i64,
    retransmit_timeout_ms: i64,
}

impl FlowControl {
    pub fn new(bandwidth_low_limit: u32, bandwidth_high_limit: u32) -> Self {
        Self {
            bandwidth_low_limit: bandwidth_low_limit as f64,
            bandwidth_high_limit: bandwidth_high_limit as f64,
            bps: bandwidth_low_limit as f64,
            available_bytes: 0.0,
            last_epoch_ms: 0,
            rtt_samples: VecDeque::with_capacity(RTT_SAMPLE_CAP),
            smoothed_rtt_ms: RTT_FLOOR_MS,
            retransmit_timeout_ms: RTT_FLOOR_MS,
        }
    }

    pub fn remaining_bytes(&self) -> f64 {
        self.available_bytes
    }

    pub fn on_packet_send(&mut self, bytes_with_overhead: usize) {
        self.available_bytes -= bytes_with_overhead as f64;
    }

    /// Called once per worker tick; replenishes the epoch allowance and, on
    /// a timeout-driven loss signal, reacts by dropping the rate to the
    /// current smoothed estimate rather than halving blindly.
    pub fn on_tick(&mut self, now_ms: i64, timeout_loss_count: u32) {
        if now_ms.saturating_sub(self.last_epoch_ms) < EPOCH_INTERVAL_MS {
            return;
        }
        self.last_epoch_ms = now_ms;
        self.available_bytes += self.bps * (EPOCH_INTERVAL_MS as f64 / 1000.0);
        let burst_cap = self.bps * 2.0;
        if self.available_bytes > burst_cap {
            self.available_bytes = burst_cap;
        }
        if timeout_loss_count > 0 {
            self.bps = self.bps.clamp(self.bandwidth_low_limit, self.bandwidth_high_limit);
        }
    }

    /// One ACK observation: records a trip-time sample and recomputes the
    /// smoothed RTT and the derived retransmission timeout.
    pub fn on_ack(&mut self, now_ms: i64, message_first_send_ms: i64) {
        let trip = (now_ms - message_first_send_ms).max(0);
        if self.rtt_samples.len() == RTT_SAMPLE_CAP {
            self.rtt_samples.pop_front();
        }
        self.rtt_samples.push_back(trip);
        let sum: i64 = self.rtt_samples.iter().sum();
        self.smoothed_rtt_ms = sum / self.rtt_samples.len() as i64;
        let margin = (self.smoothed_rtt_ms / 2).max(RTT_FLOOR_MS);
        self.retransmit_timeout_ms = (self.smoothed_rtt_ms + margin).clamp(RTT_FLOOR_MS, RTT_CEILING_MS);
    }

    /// Called once an ACK batch has been fully processed: adjusts the
    /// bandwidth estimate based on whether any NACKs (losses) were observed
    /// in that batch.
    pub fn on_ack_done(&mut self, avg_one_way_ms: i64, nack_loss_count: u32, data_bytes: usize) {
        if nack_loss_count == 0 {
            let observed_rate = data_bytes as f64 / (avg_one_way_ms.max(1) as f64 / 1000.0);
            self.bps = (self.bps * 0.875 + observed_rate * 0.125).clamp(self.bandwidth_low_limit, self.bandwidth_high_limit);
        } else {
            self.bps = (self.bps * 0.5).max(self.bandwidth_low_limit);
        }
    }

    pub fn retransmit_timeout_ms(&self) -> i64 {
        self.retransmit_timeout_ms
    }

    pub fn current_bps(&self) -> f64 {
        self.bps
    }
}
