use serde::{Deserialize, Serialize};

/// Every operator-visible tunable, analogous to the teacher's `Settings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SphynxConfig {
    /// Number of worker tasks. Defaults to the available core count.
    pub worker_count: usize,
    pub worker_tick_ms: u64,
    pub handshake_tick_ms: u64,
    pub initial_hello_post_ms: u64,
    pub connect_timeout_ms: i64,
    pub mtu_probe_interval_ms: i64,
    pub silence_limit_ms: i64,
    pub silence_timeout_ms: i64,
    pub bandwidth_low_limit: u32,
    pub bandwidth_high_limit: u32,
    pub connection_flood_threshold: u32,
    pub hash_table_size: usize,
    pub flood_table_size: usize,
}

impl Default for SphynxConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism().map_or(1, |c| c.get()),
            worker_tick_ms: 20,
            handshake_tick_ms: 100,
            initial_hello_post_ms: 200,
            connect_timeout_ms: 6_000,
            mtu_probe_interval_ms: 8_000,
            silence_limit_ms: 4_357,
            silence_timeout_ms: 15_000,
            bandwidth_low_limit: 10_000,
            bandwidth_high_limit: 10_000_000,
            connection_flood_threshold: 10,
            hash_table_size: 1 << 14,
            flood_table_size: 1 << 12,
        }
    }
}
