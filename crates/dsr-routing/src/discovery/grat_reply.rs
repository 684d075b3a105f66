//! Gratuitous route reply holdoff

use dsr_protocol::Address;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Suppresses repeated gratuitous replies for the same shortcut
///
/// Keyed by (packet source, previous hop): once a shortening reply has been
/// sent for a pair, no other is sent until the holdoff expires.
#[derive(Debug)]
pub struct GratReplyTable {
    entries: HashMap<(Address, Address), Instant>,
    holdoff: Duration,
}

impl GratReplyTable {
    pub fn new(holdoff: Duration) -> Self {
        GratReplyTable {
            entries: HashMap::new(),
            holdoff,
        }
    }

    /// Whether a reply for (`source`, `prev_hop`) is still held off
    pub fn is_held_off(&self, source: Address, prev_hop: Address, now: Instant) -> bool {
        self.entries
            .get(&(source, prev_hop))
            .is_some_and(|expires| *expires > now)
    }

    pub fn insert(&mut self, source: Address, prev_hop: Address, now: Instant) {
        self.entries.insert((source, prev_hop), now + self.holdoff);
    }

    /// Drop expired entries
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, expires| *expires > now);
        before - self.entries.len()
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.entries.values().min().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
