//! DSR Routing Engine
//!
//! On-demand source routing for multi-hop wireless networks:
//! - Route discovery (requests, replies, cached and gratuitous replies)
//! - Route maintenance (hop-by-hop acknowledgements, route errors, salvage)
//! - Link-cache and path-cache route caches
//! - Send buffer for packets waiting on discovery
//!
//! The engine performs no I/O. See [`DsrEngine`] for the driving contract.

pub mod cache;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod maint_buffer;
pub mod neighbor;
pub mod scheduler;
pub mod send_buffer;

pub use cache::{LinkCache, PathCache, RouteCache};
pub use config::{CacheStrategy, DsrConfig};
pub use engine::{DsrEngine, DsrStats, Output};
pub use error::{DropReason, Result, RoutingError};
pub use scheduler::{Scheduler, TimerEvent};
