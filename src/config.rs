//! # Configuration
//!
//! The keys spec §6 enumerates, collected the way the teacher's
//! `ipc::TransportConfig` collects transport knobs — one struct with a
//! sensible `Default`, named constants instead of magic numbers at call
//! sites.

use std::time::Duration;

/// Tunables for one protocol-layer instance.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Override the auto-assigned TCP listening port. `0` lets the OS pick.
    pub tcp_port: u16,

    /// Override the auto-detected hostname/interface to bind and advertise.
    pub tcp_base_address: String,

    /// Per-send response timeout for `send_and_wait` / `verify_connection`.
    pub wait_for_response_timeout: Duration,

    /// How long the Connection Monitor waits between probes of the same peer.
    pub max_time_between_connection_confirmations: Duration,

    /// Consecutive missed probes before a peer is evicted.
    pub max_missed_keep_alive_signals: u32,

    /// How often the Connection Monitor's tick loop runs.
    pub keep_alive_interval: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            tcp_port: 0,
            tcp_base_address: "127.0.0.1".to_string(),
            wait_for_response_timeout: Duration::from_secs(5),
            max_time_between_connection_confirmations: Duration::from_secs(15),
            max_missed_keep_alive_signals: 5,
            keep_alive_interval: Duration::from_secs(5),
        }
    }
}
