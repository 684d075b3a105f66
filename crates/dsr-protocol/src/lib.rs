//! DSR Protocol Module
//!
//! Value types shared by the routing engine and the node runtime:
//! - Node and link-layer addresses
//! - Source routes and the route algebra (reverse, split, splice, shortcut)
//! - Packets and the DSR options they carry

pub mod error;
pub mod packet;
pub mod route;
pub mod types;

pub use error::{ProtocolError, Result};
pub use packet::{DsrOption, Packet, Payload, SourceRouteHeader};
pub use route::{RouteFlags, SourceRoute};
pub use types::{Address, HwAddr};

/// Upper bound on the IP TTL carried by a packet
pub const MAX_TTL: u8 = 255;

/// Default IP TTL for unicast packets
pub const DEFAULT_TTL: u8 = 64;
