//! Route caches
//!
//! Two interchangeable strategies sit behind [`RouteCache`]:
//! - [`LinkCache`]: a global graph of known links, routes computed on demand
//!   with Dijkstra
//! - [`PathCache`]: a per-destination table of complete routes
//!
//! Links are treated as bidirectional: adding or invalidating `a -> b`
//! affects `b -> a` as well.

pub mod link_cache;
pub mod path_cache;

pub use link_cache::LinkCache;
pub use path_cache::{PathCache, PathStatus};

use crate::config::{CacheStrategy, DsrConfig};
use dsr_protocol::{Address, SourceRoute};
use std::time::{Duration, Instant};

/// Common interface of both cache strategies
pub trait RouteCache: Send {
    /// Best known route from `src` to `dst`
    fn find_route(&mut self, src: Address, dst: Address, now: Instant) -> Option<SourceRoute>;

    /// Learn every link (and reachable destination) of `route`
    fn install_route(&mut self, route: &SourceRoute, timeout: Duration, now: Instant);

    /// Learn a single link
    fn add_link(&mut self, a: Address, b: Address, cost: u32, timeout: Duration, now: Instant);

    /// Forget the link between `a` and `b`
    fn invalidate_link(&mut self, a: Address, b: Address);

    /// Forget everything that goes through `addr`
    fn invalidate_node(&mut self, addr: Address);

    fn flush(&mut self);

    /// Number of stored links or routes
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build the cache selected by `config` for the node `owner`
pub fn build(owner: Address, config: &DsrConfig) -> Box<dyn RouteCache> {
    match config.cache_strategy {
        CacheStrategy::LinkCache => Box::new(LinkCache::new(owner, config.tie_break_seed)),
        CacheStrategy::PathCache => Box::new(PathCache::new(
            owner,
            config.path_cache_max_paths,
            config.route_cache_timeout(),
        )),
    }
}
