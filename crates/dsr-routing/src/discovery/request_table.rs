//! Route request table
//!
//! Two pieces of state live here:
//! - per-target discovery entries (TTL, retry timeout, retransmit count)
//! - per-initiator records of recently seen request ids, used to suppress
//!   duplicate floods

use dsr_protocol::Address;
use lru::LruCache;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Discovery in progress for one target
#[derive(Debug, Clone)]
pub struct DiscoveryEntry {
    pub target: Address,
    /// IP TTL of the most recent request
    pub ttl: u8,
    /// Wait before the next retry
    pub timeout: Duration,
    pub retransmits: u32,
    /// Id of the most recent request
    pub request_id: u16,
    pub started_at: Instant,
}

/// What to do when a discovery timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { ttl: u8, timeout: Duration },
    GiveUp,
}

/// Limits applied on retry
#[derive(Debug, Clone, Copy)]
pub struct RetryLimits {
    pub max_retransmits: u32,
    pub max_ttl: u8,
    pub max_timeout: Duration,
}

/// One path over which a request reached this node
#[derive(Debug, Clone, PartialEq, Eq)]
struct Visit {
    cost: u32,
    hops: Vec<Address>,
}

#[derive(Debug, Clone)]
struct SeenRequest {
    target: Address,
    id: u16,
    visits: Vec<Visit>,
}

pub struct RequestTable {
    discoveries: LruCache<Address, DiscoveryEntry>,
    seen: LruCache<Address, VecDeque<SeenRequest>>,
    ids_per_initiator: usize,
    multi_visit: bool,
    max_visits: usize,
}

impl RequestTable {
    pub fn new(
        table_size: usize,
        ids_per_initiator: usize,
        multi_visit: bool,
        max_visits: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(table_size).unwrap_or(NonZeroUsize::MIN);
        RequestTable {
            discoveries: LruCache::new(capacity),
            seen: LruCache::new(capacity),
            ids_per_initiator: ids_per_initiator.max(1),
            multi_visit,
            max_visits: max_visits.max(1),
        }
    }

    pub fn entry(&self, target: &Address) -> Option<&DiscoveryEntry> {
        self.discoveries.peek(target)
    }

    /// Start discovering `target`. Returns `false` if already in progress.
    pub fn begin(
        &mut self,
        target: Address,
        ttl: u8,
        timeout: Duration,
        request_id: u16,
        now: Instant,
    ) -> bool {
        if self.discoveries.contains(&target) {
            return false;
        }

        self.discoveries.put(
            target,
            DiscoveryEntry {
                target,
                ttl,
                timeout,
                retransmits: 0,
                request_id,
                started_at: now,
            },
        );
        true
    }

    /// Advance the retry state of `target` after its timer fired
    ///
    /// Gives up (and forgets the entry) once the retransmit budget is spent.
    /// Otherwise TTL and timeout double up to their caps.
    pub fn retry(&mut self, target: &Address, limits: RetryLimits) -> RetryDecision {
        let Some(entry) = self.discoveries.get_mut(target) else {
            return RetryDecision::GiveUp;
        };

        if entry.retransmits >= limits.max_retransmits {
            self.discoveries.pop(target);
            return RetryDecision::GiveUp;
        }

        entry.retransmits += 1;
        entry.ttl = (u16::from(entry.ttl) * 2).min(u16::from(limits.max_ttl)) as u8;
        entry.timeout = (entry.timeout * 2).min(limits.max_timeout);

        RetryDecision::Retry {
            ttl: entry.ttl,
            timeout: entry.timeout,
        }
    }

    pub fn set_request_id(&mut self, target: &Address, id: u16) {
        if let Some(entry) = self.discoveries.get_mut(target) {
            entry.request_id = id;
        }
    }

    /// Stop discovering `target`. Cancelling an idle target does nothing.
    pub fn cancel(&mut self, target: &Address) -> Option<DiscoveryEntry> {
        self.discoveries.pop(target)
    }

    /// Record a received request and report whether it is a duplicate
    ///
    /// In single-visit mode any repeat of `(initiator, target, id)` is a
    /// duplicate. In multi-visit mode a repeat is accepted only when it is
    /// cheaper than every earlier visit, takes a different path, and the
    /// visit list has room.
    pub fn is_duplicate(
        &mut self,
        initiator: Address,
        target: Address,
        id: u16,
        cost: u32,
        hops: &[Address],
    ) -> bool {
        let ids_per_initiator = self.ids_per_initiator;
        let seen = self.seen.get_or_insert_mut(initiator, VecDeque::new);

        if let Some(request) = seen.iter_mut().find(|r| r.id == id && r.target == target) {
            if !self.multi_visit {
                return true;
            }

            let worse = request
                .visits
                .iter()
                .any(|v| v.cost <= cost || v.hops == hops);
            if worse || request.visits.len() >= self.max_visits {
                return true;
            }

            request.visits.push(Visit {
                cost,
                hops: hops.to_vec(),
            });
            return false;
        }

        if seen.len() >= ids_per_initiator {
            seen.pop_front();
        }
        seen.push_back(SeenRequest {
            target,
            id,
            visits: vec![Visit {
                cost,
                hops: hops.to_vec(),
            }],
        });
        false
    }

    /// Number of targets under discovery
    pub fn active(&self) -> usize {
        self.discoveries.len()
    }
}
