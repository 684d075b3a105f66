//! Error types for protocol operations

use crate::types::Address;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Duplicate address in route: {0}")]
    DuplicateAddress(Address),

    #[error("Cost vector length mismatch: expected {expected}, got {actual}")]
    CostLengthMismatch { expected: usize, actual: usize },

    #[error("Routes do not join: first ends at {first_dst}, second starts at {second_src}")]
    RouteMismatch {
        first_dst: Address,
        second_src: Address,
    },

    #[error("Address {0} is not part of the route")]
    AddressNotInRoute(Address),

    #[error("Segments left ({segments_left}) exceeds route length ({hops})")]
    InvalidSegmentsLeft { segments_left: usize, hops: usize },

    #[error("A route needs at least two nodes, got {0}")]
    RouteTooShort(usize),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}
