//! Path cache
//!
//! Keeps, per destination, a bounded list of complete routes starting at
//! this node. Lookups pick the cheapest valid candidate and extend its
//! lifetime. Invalidation scans every stored route.

use super::RouteCache;
use dsr_protocol::{Address, SourceRoute};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    Valid,
    Invalid,
}

#[derive(Debug, Clone)]
struct PathEntry {
    /// Intermediate nodes between the owner and the destination
    hops: Vec<Address>,
    cost_vector: Vec<u32>,
    cost: u32,
    status: PathStatus,
    expires_at: Instant,
}

impl PathEntry {
    /// Whether the route `owner, hops.., dst` uses the link `a -> b`
    fn uses_link(&self, owner: Address, dst: Address, a: Address, b: Address, both: bool) -> bool {
        let path: Vec<Address> = std::iter::once(owner)
            .chain(self.hops.iter().copied())
            .chain(std::iter::once(dst))
            .collect();
        path.windows(2)
            .any(|w| (w[0] == a && w[1] == b) || (both && w[0] == b && w[1] == a))
    }
}

/// Per-destination route table
pub struct PathCache {
    owner: Address,
    paths: HashMap<Address, Vec<PathEntry>>,
    max_paths: usize,
    route_timeout: Duration,
}

impl PathCache {
    pub fn new(owner: Address, max_paths: usize, route_timeout: Duration) -> Self {
        PathCache {
            owner,
            paths: HashMap::new(),
            max_paths: max_paths.max(1),
            route_timeout,
        }
    }

    /// Store a route to `dst` through `hops`
    ///
    /// An identical route is refreshed in place. When the destination is
    /// full, the entry closest to expiry is replaced.
    pub fn set_path(
        &mut self,
        dst: Address,
        hops: Vec<Address>,
        cost_vector: Vec<u32>,
        status: PathStatus,
        ttl: Duration,
        now: Instant,
    ) {
        self.upsert_path(dst, hops, Some(cost_vector), status, ttl, now);
    }

    /// Like `set_path`, but a missing cost vector keeps the weights of an
    /// identical stored route (or counts hops for a new one)
    fn upsert_path(
        &mut self,
        dst: Address,
        hops: Vec<Address>,
        cost_vector: Option<Vec<u32>>,
        status: PathStatus,
        ttl: Duration,
        now: Instant,
    ) {
        if dst == self.owner {
            return;
        }

        let expires_at = now + ttl;
        let entries = self.paths.entry(dst).or_default();

        if let Some(existing) = entries.iter_mut().find(|e| e.hops == hops) {
            if let Some(cost_vector) = cost_vector {
                existing.cost = total(&cost_vector);
                existing.cost_vector = cost_vector;
            }
            existing.status = status;
            existing.expires_at = existing.expires_at.max(expires_at);
            return;
        }

        if entries.len() >= self.max_paths {
            if let Some(oldest) = entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(i, _)| i)
            {
                entries.swap_remove(oldest);
            }
        }

        let cost_vector = cost_vector.unwrap_or_else(|| vec![1; hops.len() + 1]);
        entries.push(PathEntry {
            cost: total(&cost_vector),
            hops,
            cost_vector,
            status,
            expires_at,
        });
    }

    /// Cheapest valid route to `dst`: (intermediate hops, cost vector)
    ///
    /// Expired candidates are purged first. Ties go to the entry that
    /// expires last. The chosen entry's lifetime is extended.
    pub fn get_path(&mut self, dst: Address, now: Instant) -> Option<(Vec<Address>, Vec<u32>)> {
        let entries = self.paths.get_mut(&dst)?;
        entries.retain(|e| e.expires_at > now);

        let best = entries
            .iter_mut()
            .filter(|e| e.status == PathStatus::Valid)
            .min_by(|a, b| a.cost.cmp(&b.cost).then(b.expires_at.cmp(&a.expires_at)));

        let result = best.map(|entry| {
            entry.expires_at = entry.expires_at.max(now + self.route_timeout);
            (entry.hops.clone(), entry.cost_vector.clone())
        });

        if entries.is_empty() {
            self.paths.remove(&dst);
        }
        result
    }

    /// Delete every route that visits `addr`
    pub fn erase_routes_through(&mut self, addr: Address) {
        self.paths.remove(&addr);
        for entries in self.paths.values_mut() {
            entries.retain(|e| !e.hops.contains(&addr));
        }
        self.paths.retain(|_, entries| !entries.is_empty());
    }

    /// Delete every route using the link `a -> b` (either direction when
    /// `bidirectional`)
    pub fn erase_link(&mut self, a: Address, b: Address, bidirectional: bool) {
        let owner = self.owner;
        for (dst, entries) in self.paths.iter_mut() {
            entries.retain(|e| !e.uses_link(owner, *dst, a, b, bidirectional));
        }
        self.paths.retain(|_, entries| !entries.is_empty());
    }

    /// Number of routes stored for `dst`
    pub fn candidates(&self, dst: Address) -> usize {
        self.paths.get(&dst).map_or(0, Vec::len)
    }

    /// Record the routes to every node after the owner on `route`
    fn install_suffixes(&mut self, route: &SourceRoute, timeout: Duration, now: Instant) {
        let path: Vec<Address> = route.path().collect();
        let Some(start) = path.iter().position(|a| *a == self.owner) else {
            return;
        };

        for end in start + 1..path.len() {
            let hops = path[start + 1..end].to_vec();
            let costs = route
                .cost()
                .map(|_| (start..end).map(|i| route.link_cost(i)).collect());
            self.upsert_path(path[end], hops, costs, PathStatus::Valid, timeout, now);
        }
    }
}

fn total(cost_vector: &[u32]) -> u32 {
    cost_vector.iter().fold(0u32, |acc, c| acc.saturating_add(*c))
}

impl RouteCache for PathCache {
    fn find_route(&mut self, src: Address, dst: Address, now: Instant) -> Option<SourceRoute> {
        if src != self.owner {
            return None;
        }
        let (hops, costs) = self.get_path(dst, now)?;
        SourceRoute::new(src, dst, hops).ok()?.with_cost(costs).ok()
    }

    fn install_route(&mut self, route: &SourceRoute, timeout: Duration, now: Instant) {
        self.install_suffixes(route, timeout, now);
        if route.is_bidirectional() {
            self.install_suffixes(&route.reverse(), timeout, now);
        }
    }

    fn add_link(&mut self, a: Address, b: Address, cost: u32, timeout: Duration, now: Instant) {
        if a == self.owner {
            self.set_path(b, Vec::new(), vec![cost], PathStatus::Valid, timeout, now);
        } else if b == self.owner {
            self.set_path(a, Vec::new(), vec![cost], PathStatus::Valid, timeout, now);
        }
    }

    fn invalidate_link(&mut self, a: Address, b: Address) {
        self.erase_link(a, b, true);
    }

    fn invalidate_node(&mut self, addr: Address) {
        self.erase_routes_through(addr);
    }

    fn flush(&mut self) {
        self.paths.clear();
    }

    fn len(&self) -> usize {
        self.paths.values().map(Vec::len).sum()
    }
}
