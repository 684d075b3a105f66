//! Engine configuration
//!
//! Every tunable of the protocol lives in [`DsrConfig`]. Durations are
//! stored as integer milliseconds so configuration files stay plain; the
//! accessor methods convert them to [`Duration`].

use crate::error::{Result, RoutingError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest duration any `*_ms` setting may take (one day)
pub const MAX_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1_000;

/// Route cache implementation used by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// Global link graph with on-demand shortest path
    #[default]
    LinkCache,
    /// Per-destination table of complete routes
    PathCache,
}

/// Protocol configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DsrConfig {
    /// Lifetime of cached links and routes
    pub route_cache_timeout_ms: u64,
    pub cache_strategy: CacheStrategy,
    /// Routes kept per destination by the path cache
    pub path_cache_max_paths: usize,
    /// Use externally supplied link costs instead of hop count
    pub cost_metric: bool,
    /// Seed for the shortest-path tie-break; random when unset
    pub tie_break_seed: Option<u64>,

    pub send_buffer_timeout_ms: u64,
    pub send_buffer_size: usize,

    /// Number of targets with discovery state
    pub request_table_size: usize,
    /// Request ids remembered per initiator
    pub request_table_ids: usize,
    pub max_request_rexmt: u32,
    pub max_request_period_ms: u64,
    pub request_period_ms: u64,
    /// Timeout of a request with TTL 1
    pub nonprop_request_timeout_ms: u64,
    pub ttl_start: u8,
    pub max_ttl: u8,
    /// Accept a request more than once when it arrives over a cheaper path
    pub rreq_multi_visit: bool,
    pub rreq_max_visit: usize,
    /// Only the target answers requests
    pub rrep_destination_only: bool,
    pub grat_reply_holdoff_ms: u64,
    /// Upper bound of the random delay before a request is rebroadcast
    pub broadcast_jitter_ms: u64,
    /// Learn from, and offer shorter routes for, packets addressed to
    /// other nodes
    pub promiscuous: bool,

    pub use_network_layer_ack: bool,
    pub rexmt_buffer_size: usize,
    pub maint_holdoff_time_ms: u64,
    pub max_maint_rexmt: u32,
    /// Retransmit the whole packet on ack timeout instead of a bare
    /// acknowledgement request
    pub retry_packet: bool,
    pub max_salvage_count: u8,

    pub neighbor_table_size: usize,
    /// Retransmission timeout before any RTT sample
    pub initial_rto_ms: u64,
    pub rtt_min_ms: u64,
    pub rexmt_max_ms: u64,
}

impl Default for DsrConfig {
    fn default() -> Self {
        DsrConfig {
            route_cache_timeout_ms: 300_000,
            cache_strategy: CacheStrategy::LinkCache,
            path_cache_max_paths: 64,
            cost_metric: false,
            tie_break_seed: None,
            send_buffer_timeout_ms: 30_000,
            send_buffer_size: 100,
            request_table_size: 64,
            request_table_ids: 16,
            max_request_rexmt: 16,
            max_request_period_ms: 10_000,
            request_period_ms: 500,
            nonprop_request_timeout_ms: 30,
            ttl_start: 10,
            max_ttl: dsr_protocol::MAX_TTL,
            rreq_multi_visit: false,
            rreq_max_visit: 1,
            rrep_destination_only: false,
            grat_reply_holdoff_ms: 1_000,
            broadcast_jitter_ms: 0,
            promiscuous: true,
            use_network_layer_ack: true,
            rexmt_buffer_size: 100,
            maint_holdoff_time_ms: 250,
            max_maint_rexmt: 2,
            retry_packet: false,
            max_salvage_count: 15,
            neighbor_table_size: 64,
            initial_rto_ms: 500,
            rtt_min_ms: 100,
            rexmt_max_ms: 2_000,
        }
    }
}

impl DsrConfig {
    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("send_buffer_size", self.send_buffer_size),
            ("request_table_size", self.request_table_size),
            ("request_table_ids", self.request_table_ids),
            ("rexmt_buffer_size", self.rexmt_buffer_size),
            ("neighbor_table_size", self.neighbor_table_size),
            ("path_cache_max_paths", self.path_cache_max_paths),
            ("rreq_max_visit", self.rreq_max_visit),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(RoutingError::InvalidConfig(format!("{} must be > 0", name)));
            }
        }

        let timeouts = [
            ("route_cache_timeout_ms", self.route_cache_timeout_ms),
            ("send_buffer_timeout_ms", self.send_buffer_timeout_ms),
            ("max_request_period_ms", self.max_request_period_ms),
            ("request_period_ms", self.request_period_ms),
            ("nonprop_request_timeout_ms", self.nonprop_request_timeout_ms),
            ("grat_reply_holdoff_ms", self.grat_reply_holdoff_ms),
            ("broadcast_jitter_ms", self.broadcast_jitter_ms),
            ("maint_holdoff_time_ms", self.maint_holdoff_time_ms),
            ("initial_rto_ms", self.initial_rto_ms),
            ("rtt_min_ms", self.rtt_min_ms),
            ("rexmt_max_ms", self.rexmt_max_ms),
        ];
        for (name, value) in timeouts {
            if value > MAX_TIMEOUT_MS {
                return Err(RoutingError::InvalidConfig(format!(
                    "{} must be <= {}, got {}",
                    name, MAX_TIMEOUT_MS, value
                )));
            }
        }

        if self.ttl_start == 0 || self.ttl_start > self.max_ttl {
            return Err(RoutingError::InvalidConfig(format!(
                "ttl_start must be in 1..={}, got {}",
                self.max_ttl, self.ttl_start
            )));
        }

        if self.rtt_min_ms > self.rexmt_max_ms {
            return Err(RoutingError::InvalidConfig(format!(
                "rtt_min_ms ({}) exceeds rexmt_max_ms ({})",
                self.rtt_min_ms, self.rexmt_max_ms
            )));
        }

        if self.request_period_ms > self.max_request_period_ms {
            return Err(RoutingError::InvalidConfig(format!(
                "request_period_ms ({}) exceeds max_request_period_ms ({})",
                self.request_period_ms, self.max_request_period_ms
            )));
        }

        Ok(())
    }

    pub fn route_cache_timeout(&self) -> Duration {
        Duration::from_millis(self.route_cache_timeout_ms)
    }

    pub fn send_buffer_timeout(&self) -> Duration {
        Duration::from_millis(self.send_buffer_timeout_ms)
    }

    pub fn request_period(&self) -> Duration {
        Duration::from_millis(self.request_period_ms)
    }

    pub fn max_request_period(&self) -> Duration {
        Duration::from_millis(self.max_request_period_ms)
    }

    pub fn nonprop_request_timeout(&self) -> Duration {
        Duration::from_millis(self.nonprop_request_timeout_ms)
    }

    pub fn grat_reply_holdoff(&self) -> Duration {
        Duration::from_millis(self.grat_reply_holdoff_ms)
    }

    pub fn maint_holdoff_time(&self) -> Duration {
        Duration::from_millis(self.maint_holdoff_time_ms)
    }

    pub fn initial_rto(&self) -> Duration {
        Duration::from_millis(self.initial_rto_ms)
    }

    pub fn rtt_min(&self) -> Duration {
        Duration::from_millis(self.rtt_min_ms)
    }

    pub fn rexmt_max(&self) -> Duration {
        Duration::from_millis(self.rexmt_max_ms)
    }
}
