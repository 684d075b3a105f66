//! Routing error types

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Routing-specific errors
#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for routing operations
pub type Result<T> = std::result::Result<T, RoutingError>;

/// Why a packet handed to the engine was never delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropReason {
    /// Route discovery gave up after the maximum number of requests
    DiscoveryFailed,
    /// The packet waited longer than the send-buffer timeout
    SendBufferTimeout,
    /// Evicted to make room in a full send buffer
    SendBufferFull,
    /// The next hop failed and no alternate route was usable
    LinkFailure,
    /// The packet already used up its salvage attempts
    SalvageExhausted,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::DiscoveryFailed => "route discovery failed",
            DropReason::SendBufferTimeout => "send buffer timeout",
            DropReason::SendBufferFull => "send buffer full",
            DropReason::LinkFailure => "link failure",
            DropReason::SalvageExhausted => "salvage exhausted",
        };
        f.write_str(s)
    }
}
