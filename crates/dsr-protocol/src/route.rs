//! Source routes and the route algebra
//!
//! A [`SourceRoute`] is the ordered node sequence `src, hops.., dst` a
//! packet follows. Routes are immutable values: every operation returns a
//! new route and validates that no address appears twice.

use crate::error::{ProtocolError, Result};
use crate::types::Address;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

bitflags! {
    /// Route flags bitfield
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct RouteFlags: u8 {
        /// Links on this route are usable in both directions
        const BIDIRECTIONAL = 0b0000_0001;
    }
}

/// An explicit route from `src` to `dst`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRoute {
    src: Address,
    dst: Address,
    hops: Vec<Address>,
    /// One weight per link (`hops.len() + 1` entries) when known
    cost: Option<Vec<u32>>,
    flags: RouteFlags,
}

impl SourceRoute {
    /// Create a route, rejecting repeated addresses
    pub fn new(src: Address, dst: Address, hops: Vec<Address>) -> Result<Self> {
        let path = std::iter::once(src)
            .chain(hops.iter().copied())
            .chain(std::iter::once(dst));
        if let Some(dup) = find_duplicate(path) {
            return Err(ProtocolError::DuplicateAddress(dup));
        }

        Ok(SourceRoute {
            src,
            dst,
            hops,
            cost: None,
            flags: RouteFlags::BIDIRECTIONAL,
        })
    }

    /// Single-link route between two neighbors
    pub fn direct(src: Address, dst: Address) -> Result<Self> {
        Self::new(src, dst, Vec::new())
    }

    /// Build a route from a full node path (`src` first, `dst` last)
    pub fn from_path(path: &[Address]) -> Result<Self> {
        match path {
            [src, hops @ .., dst] => Self::new(*src, *dst, hops.to_vec()),
            _ => Err(ProtocolError::RouteTooShort(path.len())),
        }
    }

    /// Attach a per-link cost vector
    pub fn with_cost(mut self, cost: Vec<u32>) -> Result<Self> {
        if cost.len() != self.link_count() {
            return Err(ProtocolError::CostLengthMismatch {
                expected: self.link_count(),
                actual: cost.len(),
            });
        }
        self.cost = Some(cost);
        Ok(self)
    }

    pub fn with_flags(mut self, flags: RouteFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn src(&self) -> Address {
        self.src
    }

    pub fn dst(&self) -> Address {
        self.dst
    }

    /// Intermediate nodes, excluding `src` and `dst`
    pub fn hops(&self) -> &[Address] {
        &self.hops
    }

    pub fn cost(&self) -> Option<&[u32]> {
        self.cost.as_deref()
    }

    pub fn flags(&self) -> RouteFlags {
        self.flags
    }

    pub fn is_bidirectional(&self) -> bool {
        self.flags.contains(RouteFlags::BIDIRECTIONAL)
    }

    /// Number of intermediate nodes
    pub fn num_hops(&self) -> usize {
        self.hops.len()
    }

    /// Number of links (`num_hops() + 1`)
    pub fn link_count(&self) -> usize {
        self.hops.len() + 1
    }

    /// Weight of link `index` (counted from `src`), 1 when no costs are known
    pub fn link_cost(&self, index: usize) -> u32 {
        self.cost
            .as_ref()
            .and_then(|c| c.get(index).copied())
            .unwrap_or(1)
    }

    /// Aggregate route cost: sum of link costs, or the link count
    pub fn total_cost(&self) -> u32 {
        match &self.cost {
            Some(cost) => cost.iter().fold(0u32, |acc, c| acc.saturating_add(*c)),
            None => self.link_count() as u32,
        }
    }

    /// Iterate the full node sequence `src, hops.., dst`
    pub fn path(&self) -> impl Iterator<Item = Address> + '_ {
        std::iter::once(self.src)
            .chain(self.hops.iter().copied())
            .chain(std::iter::once(self.dst))
    }

    /// Index of `addr` in the full node sequence
    pub fn position(&self, addr: Address) -> Option<usize> {
        self.path().position(|a| a == addr)
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.position(addr).is_some()
    }

    /// Whether `a` is immediately followed by `b` on this route
    pub fn contains_link(&self, a: Address, b: Address) -> bool {
        let path: Vec<Address> = self.path().collect();
        path.windows(2).any(|w| w[0] == a && w[1] == b)
    }

    /// Node at `index` of the full node sequence
    fn node_at(&self, index: usize) -> Address {
        if index == 0 {
            self.src
        } else if index <= self.hops.len() {
            self.hops[index - 1]
        } else {
            self.dst
        }
    }

    /// Next hop for a given segments-left count
    ///
    /// `0` designates `dst`, `n` the first intermediate node.
    pub fn next_hop(&self, segments_left: usize) -> Result<Address> {
        let n = self.hops.len();
        if segments_left > n {
            return Err(ProtocolError::InvalidSegmentsLeft {
                segments_left,
                hops: n,
            });
        }
        Ok(self.node_at(n + 1 - segments_left))
    }

    /// Node that transmits to `next_hop(segments_left)`
    pub fn prev_hop(&self, segments_left: usize) -> Result<Address> {
        let n = self.hops.len();
        if segments_left > n {
            return Err(ProtocolError::InvalidSegmentsLeft {
                segments_left,
                hops: n,
            });
        }
        Ok(self.node_at(n - segments_left))
    }

    /// Reverse the route: `dst` becomes `src`, hops and costs are reversed
    pub fn reverse(&self) -> SourceRoute {
        let mut hops = self.hops.clone();
        hops.reverse();
        let cost = self.cost.as_ref().map(|c| {
            let mut c = c.clone();
            c.reverse();
            c
        });

        SourceRoute {
            src: self.dst,
            dst: self.src,
            hops,
            cost,
            flags: self.flags,
        }
    }

    /// Leading part of the route, from `src` up to `addr`
    pub fn prefix_to(&self, addr: Address) -> Result<SourceRoute> {
        let pos = self
            .position(addr)
            .ok_or(ProtocolError::AddressNotInRoute(addr))?;
        if pos == 0 {
            return Err(ProtocolError::DuplicateAddress(addr));
        }

        let route = SourceRoute::new(self.src, addr, self.hops[..pos - 1].to_vec())?;
        self.carry_cost(route, 0, pos)
    }

    /// Trailing part of the route, from `addr` to `dst`
    pub fn suffix_from(&self, addr: Address) -> Result<SourceRoute> {
        let pos = self
            .position(addr)
            .ok_or(ProtocolError::AddressNotInRoute(addr))?;
        if pos == self.hops.len() + 1 {
            return Err(ProtocolError::DuplicateAddress(addr));
        }

        let route = SourceRoute::new(addr, self.dst, self.hops[pos..].to_vec())?;
        self.carry_cost(route, pos, self.hops.len() + 1)
    }

    /// Splice `other` (starting at this route's `dst`) onto this route
    ///
    /// The joining node becomes an intermediate hop. Fails when the result
    /// would visit an address twice.
    pub fn concatenate(&self, other: &SourceRoute) -> Result<SourceRoute> {
        if self.dst != other.src {
            return Err(ProtocolError::RouteMismatch {
                first_dst: self.dst,
                second_src: other.src,
            });
        }

        let mut hops = Vec::with_capacity(self.hops.len() + other.hops.len() + 1);
        hops.extend_from_slice(&self.hops);
        hops.push(self.dst);
        hops.extend_from_slice(&other.hops);

        let route = SourceRoute::new(self.src, other.dst, hops)?
            .with_flags(self.flags & other.flags);

        match (&self.cost, &other.cost) {
            (Some(a), Some(b)) => {
                let mut cost = a.clone();
                cost.extend_from_slice(b);
                route.with_cost(cost)
            }
            _ => Ok(route),
        }
    }

    /// Drop every node strictly between `a1` and `a2`
    ///
    /// The result uses the direct link `a1 -> a2`, weighted `cost`. Kept
    /// links keep their weights; an uncosted route stays uncosted.
    pub fn shortcut(&self, a1: Address, a2: Address, cost: u32) -> Result<SourceRoute> {
        let p1 = self
            .position(a1)
            .ok_or(ProtocolError::AddressNotInRoute(a1))?;
        let p2 = self
            .position(a2)
            .ok_or(ProtocolError::AddressNotInRoute(a2))?;
        if p1 >= p2 {
            return Err(ProtocolError::AddressNotInRoute(a2));
        }

        let path: Vec<Address> = self
            .path()
            .enumerate()
            .filter(|(i, _)| *i <= p1 || *i >= p2)
            .map(|(_, a)| a)
            .collect();
        let route = SourceRoute::from_path(&path)?.with_flags(self.flags);

        match &self.cost {
            Some(weights) => {
                let mut kept = weights[..p1].to_vec();
                kept.push(cost);
                kept.extend_from_slice(&weights[p2..]);
                route.with_cost(kept)
            }
            None => Ok(route),
        }
    }

    fn carry_cost(&self, route: SourceRoute, from: usize, to: usize) -> Result<SourceRoute> {
        match &self.cost {
            Some(cost) => route.with_cost(cost[from..to].to_vec()),
            None => Ok(route),
        }
    }
}

impl fmt::Display for SourceRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for addr in self.path() {
            if !first {
                write!(f, " -> ")?;
            }
            write!(f, "{}", addr)?;
            first = false;
        }
        Ok(())
    }
}

/// First address that occurs twice in `path`, if any
pub fn find_duplicate(path: impl IntoIterator<Item = Address>) -> Option<Address> {
    let mut seen = HashSet::new();
    path.into_iter().find(|addr| !seen.insert(*addr))
}
