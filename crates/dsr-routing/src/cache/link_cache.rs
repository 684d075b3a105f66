//! Link cache
//!
//! Stores every link the node has learned as a weighted directed graph and
//! answers route queries with single-source Dijkstra from the current root.
//! The shortest-path tree is memoized until the graph changes, the root
//! changes, or the earliest edge expiry passes.
//!
//! Equal-cost alternatives are broken by a random key drawn per frontier
//! insertion, so two runs may return different (equally short) routes. Set a
//! seed to make the choice reproducible.

use super::RouteCache;
use dsr_protocol::{Address, SourceRoute};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug, Clone)]
struct Edge {
    to: Address,
    weight: u32,
    expires_at: Instant,
}

/// Memoized Dijkstra result
#[derive(Debug)]
struct ShortestPathTree {
    root: Address,
    /// node -> (predecessor, weight of the link from it)
    pred: HashMap<Address, (Address, u32)>,
    /// Earliest expiry among the edges present when the tree was built
    valid_until: Option<Instant>,
}

/// Graph-based route cache
pub struct LinkCache {
    root: Address,
    edges: HashMap<Address, Vec<Edge>>,
    tree: Option<ShortestPathTree>,
    rng: StdRng,
}

impl LinkCache {
    pub fn new(root: Address, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        LinkCache {
            root,
            edges: HashMap::new(),
            tree: None,
            rng,
        }
    }

    /// Change the node routes are computed from
    pub fn set_root(&mut self, root: Address) {
        if self.root != root {
            self.root = root;
            self.tree = None;
        }
    }

    pub fn root(&self) -> Address {
        self.root
    }

    /// Add or refresh the directed edge `u -> v`
    pub fn add_edge(&mut self, u: Address, v: Address, weight: u32, ttl: Duration, now: Instant) {
        self.upsert_edge(u, v, Some(weight), ttl, now);
    }

    /// Extend the life of `u -> v` without touching its weight
    ///
    /// An unknown edge is added with weight 1.
    pub fn refresh_edge(&mut self, u: Address, v: Address, ttl: Duration, now: Instant) {
        self.upsert_edge(u, v, None, ttl, now);
    }

    fn upsert_edge(
        &mut self,
        u: Address,
        v: Address,
        weight: Option<u32>,
        ttl: Duration,
        now: Instant,
    ) {
        if u == v {
            return;
        }

        let expires_at = now + ttl;
        let out = self.edges.entry(u).or_default();

        // The memo only depends on topology and weights; a later expiry
        // leaves its valid_until conservative.
        let reshaped = match out.iter_mut().find(|e| e.to == v) {
            Some(edge) => {
                edge.expires_at = edge.expires_at.max(expires_at);
                match weight.map(|w| w.max(1)) {
                    Some(w) if w != edge.weight => {
                        edge.weight = w;
                        true
                    }
                    _ => false,
                }
            }
            None => {
                out.push(Edge {
                    to: v,
                    weight: weight.unwrap_or(1).max(1),
                    expires_at,
                });
                true
            }
        };
        if reshaped {
            self.tree = None;
        }
    }

    /// Remove `u -> v`, and `v -> u` when `bidirectional`
    pub fn remove_edge(&mut self, u: Address, v: Address, bidirectional: bool) {
        self.remove_directed(u, v);
        if bidirectional {
            self.remove_directed(v, u);
        }
        self.tree = None;
    }

    fn remove_directed(&mut self, u: Address, v: Address) {
        if let Some(out) = self.edges.get_mut(&u) {
            out.retain(|e| e.to != v);
            if out.is_empty() {
                self.edges.remove(&u);
            }
        }
    }

    /// Weight of the live edge `u -> v`
    #[cfg(test)]
    pub(crate) fn edge_weight(&self, u: Address, v: Address, now: Instant) -> Option<u32> {
        self.edges
            .get(&u)?
            .iter()
            .find(|e| e.to == v && e.expires_at > now)
            .map(|e| e.weight)
    }

    /// Drop expired edges. Returns how many were removed.
    fn purge_expired(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        self.edges.retain(|_, out| {
            let before = out.len();
            out.retain(|e| e.expires_at > now);
            removed += before - out.len();
            !out.is_empty()
        });
        if removed > 0 {
            self.tree = None;
        }
        removed
    }

    fn tree_is_current(&self, now: Instant) -> bool {
        match &self.tree {
            Some(tree) => {
                tree.root == self.root && tree.valid_until.map_or(true, |until| until > now)
            }
            None => false,
        }
    }

    fn compute_tree(&mut self, now: Instant) {
        let evicted = self.purge_expired(now);
        if evicted > 0 {
            trace!("link cache evicted {} expired links", evicted);
        }

        let root = self.root;
        let mut dist: HashMap<Address, u32> = HashMap::new();
        let mut pred: HashMap<Address, (Address, u32)> = HashMap::new();
        let mut frontier = BinaryHeap::new();

        dist.insert(root, 0);
        frontier.push(Reverse((0u32, self.rng.gen::<u64>(), root)));

        while let Some(Reverse((d, _, node))) = frontier.pop() {
            if dist.get(&node).is_some_and(|best| d > *best) {
                continue;
            }

            let Some(out) = self.edges.get(&node) else {
                continue;
            };

            for edge in out {
                let candidate = d.saturating_add(edge.weight);
                let improves = dist.get(&edge.to).map_or(true, |best| candidate < *best);
                if improves {
                    dist.insert(edge.to, candidate);
                    pred.insert(edge.to, (node, edge.weight));
                    frontier.push(Reverse((candidate, self.rng.gen::<u64>(), edge.to)));
                }
            }
        }

        let valid_until = self
            .edges
            .values()
            .flat_map(|out| out.iter().map(|e| e.expires_at))
            .min();

        self.tree = Some(ShortestPathTree {
            root,
            pred,
            valid_until,
        });
    }

    /// Shortest route from the root to `dst`
    fn route_from_tree(&self, dst: Address) -> Option<SourceRoute> {
        let tree = self.tree.as_ref()?;
        let mut path = vec![dst];
        let mut costs = Vec::new();
        let mut node = dst;

        while node != tree.root {
            let (prev, weight) = *tree.pred.get(&node)?;
            path.push(prev);
            costs.push(weight);
            node = prev;
        }

        path.reverse();
        costs.reverse();
        SourceRoute::from_path(&path).ok()?.with_cost(costs).ok()
    }

    /// Number of directed edges
    pub fn edge_count(&self) -> usize {
        self.edges.values().map(Vec::len).sum()
    }
}

impl RouteCache for LinkCache {
    fn find_route(&mut self, src: Address, dst: Address, now: Instant) -> Option<SourceRoute> {
        if src == dst {
            return None;
        }

        self.set_root(src);
        if !self.tree_is_current(now) {
            self.compute_tree(now);
        }
        self.route_from_tree(dst)
    }

    fn install_route(&mut self, route: &SourceRoute, timeout: Duration, now: Instant) {
        let path: Vec<Address> = route.path().collect();
        let bidirectional = route.is_bidirectional();

        for (i, link) in path.windows(2).enumerate() {
            match route.cost() {
                Some(_) => {
                    let weight = route.link_cost(i);
                    self.add_edge(link[0], link[1], weight, timeout, now);
                    if bidirectional {
                        self.add_edge(link[1], link[0], weight, timeout, now);
                    }
                }
                None => {
                    self.refresh_edge(link[0], link[1], timeout, now);
                    if bidirectional {
                        self.refresh_edge(link[1], link[0], timeout, now);
                    }
                }
            }
        }
    }

    fn add_link(&mut self, a: Address, b: Address, cost: u32, timeout: Duration, now: Instant) {
        self.add_edge(a, b, cost, timeout, now);
        self.add_edge(b, a, cost, timeout, now);
    }

    fn invalidate_link(&mut self, a: Address, b: Address) {
        self.remove_edge(a, b, true);
    }

    fn invalidate_node(&mut self, addr: Address) {
        self.edges.remove(&addr);
        for out in self.edges.values_mut() {
            out.retain(|e| e.to != addr);
        }
        self.edges.retain(|_, out| !out.is_empty());
        self.tree = None;
    }

    fn flush(&mut self) {
        self.edges.clear();
        self.tree = None;
    }

    fn len(&self) -> usize {
        self.edge_count()
    }
}
