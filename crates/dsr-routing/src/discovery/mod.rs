//! Route discovery state
//!
//! The engine drives the request/reply exchange; the tables it needs are
//! kept here.

pub mod grat_reply;
pub mod request_table;

pub use grat_reply::GratReplyTable;
pub use request_table::{DiscoveryEntry, RequestTable, RetryDecision, RetryLimits};
