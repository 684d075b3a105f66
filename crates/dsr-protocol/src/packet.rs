//! Packet model
//!
//! Packets are structured values handed between the engine and the link
//! layer. A packet carries an optional source-route header, any number of
//! DSR options and an optional upper-layer payload.

use crate::error::Result;
use crate::route::SourceRoute;
use crate::types::Address;
use crate::DEFAULT_TTL;
use serde::{Deserialize, Serialize};

/// Upper-layer data carried by a packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Identifier assigned by the sender, used for delivery reports
    pub id: u64,
    pub data: Vec<u8>,
}

impl Payload {
    pub fn new(id: u64, data: impl Into<Vec<u8>>) -> Self {
        Payload {
            id,
            data: data.into(),
        }
    }
}

/// Source-route header of a unicast packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRouteHeader {
    pub route: SourceRoute,
    /// Remaining segments; the receiver of a transmission is
    /// `route.next_hop(segments_left)`
    pub segments_left: usize,
    /// Number of times the packet has been salvaged
    pub salvage: u8,
}

impl SourceRouteHeader {
    /// Header for a packet about to leave `route.src()`
    pub fn new(route: SourceRoute) -> Self {
        let segments_left = route.num_hops();
        SourceRouteHeader {
            route,
            segments_left,
            salvage: 0,
        }
    }

    /// Node this transmission is addressed to
    pub fn next_hop(&self) -> Result<Address> {
        self.route.next_hop(self.segments_left)
    }

    /// Node that made this transmission
    pub fn prev_hop(&self) -> Result<Address> {
        self.route.prev_hop(self.segments_left)
    }

    /// Move to the following segment. Returns `false` at the last segment.
    pub fn advance(&mut self) -> bool {
        if self.segments_left == 0 {
            return false;
        }
        self.segments_left -= 1;
        true
    }

    /// Nodes still to be visited after the current receiver
    pub fn remaining(&self) -> impl Iterator<Item = Address> + '_ {
        let skip = (self.route.link_count() + 1).saturating_sub(self.segments_left);
        self.route.path().skip(skip)
    }
}

/// DSR options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DsrOption {
    /// Route request; the initiator is the packet source
    RouteRequest {
        id: u16,
        target: Address,
        /// Nodes that forwarded the request so far
        accumulated: Vec<Address>,
        /// Weight of each link traversed so far
        link_costs: Vec<u32>,
    },
    /// Route reply carrying a complete route from initiator to target
    RouteReply { route: SourceRoute },
    /// Report that `error_source` could not reach `unreachable`
    RouteError {
        error_source: Address,
        error_dest: Address,
        unreachable: Address,
        salvage: u8,
    },
    AckRequest { id: u16 },
    Ack { id: u16, from: Address, to: Address },
}

/// A DSR packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub src: Address,
    pub dst: Address,
    pub ttl: u8,
    pub source_route: Option<SourceRouteHeader>,
    pub options: Vec<DsrOption>,
    pub payload: Option<Payload>,
}

impl Packet {
    /// Unicast packet without a source route
    pub fn new(src: Address, dst: Address) -> Self {
        Packet {
            src,
            dst,
            ttl: DEFAULT_TTL,
            source_route: None,
            options: Vec::new(),
            payload: None,
        }
    }

    /// Broadcast packet with the given TTL
    pub fn broadcast(src: Address, ttl: u8) -> Self {
        Packet {
            ttl,
            ..Packet::new(src, Address::BROADCAST)
        }
    }

    /// Source-routed packet following `route`
    pub fn routed(route: SourceRoute) -> Self {
        Packet {
            source_route: Some(SourceRouteHeader::new(route.clone())),
            ..Packet::new(route.src(), route.dst())
        }
    }

    pub fn with_option(mut self, option: DsrOption) -> Self {
        self.options.push(option);
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.dst.is_broadcast()
    }

    /// The route request option, if any
    pub fn route_request(&self) -> Option<(u16, Address, &[Address], &[u32])> {
        self.options.iter().find_map(|opt| match opt {
            DsrOption::RouteRequest {
                id,
                target,
                accumulated,
                link_costs,
            } => Some((*id, *target, accumulated.as_slice(), link_costs.as_slice())),
            _ => None,
        })
    }

    pub fn ack_request(&self) -> Option<u16> {
        self.options.iter().find_map(|opt| match opt {
            DsrOption::AckRequest { id } => Some(*id),
            _ => None,
        })
    }

    pub fn remove_ack_request(&mut self) {
        self.options
            .retain(|opt| !matches!(opt, DsrOption::AckRequest { .. }));
    }

    /// Route error options carried by this packet
    pub fn route_errors(&self) -> impl Iterator<Item = &DsrOption> {
        self.options
            .iter()
            .filter(|opt| matches!(opt, DsrOption::RouteError { .. }))
    }

    /// Salvage count of the source-route header, 0 without one
    pub fn salvage(&self) -> u8 {
        self.source_route.as_ref().map_or(0, |h| h.salvage)
    }
}
