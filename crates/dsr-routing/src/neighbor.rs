//! One-hop neighbor table
//!
//! Tracks per-neighbor round-trip estimates and the acknowledgement id
//! sequence used by route maintenance. The table is bounded; the least
//! recently heard neighbor is evicted first.

use dsr_protocol::{Address, HwAddr};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Scaled integer RTT estimator
///
/// `srtt` is kept in units of 1/8 microsecond and `rttvar` in units of
/// 1/4 microsecond, so `rto = srtt + 4 * rttvar` is `(srtt >> 3) + rttvar`.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: i64,
    rttvar: i64,
    rto: Duration,
    rtt_min: Duration,
    rexmt_max: Duration,
}

const RTT_SHIFT: u32 = 3;
const RTTVAR_SHIFT: u32 = 2;

impl RttEstimator {
    pub fn new(initial_rto: Duration, rtt_min: Duration, rexmt_max: Duration) -> Self {
        RttEstimator {
            srtt: 0,
            rttvar: 0,
            rto: initial_rto.clamp(rtt_min, rexmt_max),
            rtt_min,
            rexmt_max,
        }
    }

    /// Feed one round-trip sample
    pub fn update(&mut self, sample: Duration) {
        let rtt = (sample.as_micros() as i64).max(1);

        if self.srtt != 0 {
            let mut delta = rtt - 1 - (self.srtt >> RTT_SHIFT);
            self.srtt = (self.srtt + delta).max(1);

            delta = delta.abs() - (self.rttvar >> RTTVAR_SHIFT);
            self.rttvar = (self.rttvar + delta).max(1);
        } else {
            self.srtt = rtt << RTT_SHIFT;
            self.rttvar = rtt << (RTTVAR_SHIFT - 1);
        }

        let rexmt = ((self.srtt >> RTT_SHIFT) + self.rttvar) as u64;
        self.rto = Duration::from_micros(rexmt).clamp(self.rtt_min, self.rexmt_max);
    }

    /// Smoothed RTT, zero before the first sample
    pub fn srtt(&self) -> Duration {
        Duration::from_micros((self.srtt >> RTT_SHIFT) as u64)
    }

    pub fn rttvar(&self) -> Duration {
        Duration::from_micros((self.rttvar >> RTTVAR_SHIFT) as u64)
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn is_initialized(&self) -> bool {
        self.srtt != 0
    }
}

/// Neighbor entry
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub address: Address,
    /// Interface address, when the link layer reported one
    pub hw_addr: Option<HwAddr>,
    pub rtt: RttEstimator,
    /// Id the next acknowledgement request will carry
    pub ack_id: u16,
    pub last_ack_request: Option<Instant>,
    pub last_heard: Instant,
}

/// Bounded table of one-hop neighbors
pub struct NeighborTable {
    entries: LruCache<Address, Neighbor>,
    initial_rto: Duration,
    rtt_min: Duration,
    rexmt_max: Duration,
}

impl NeighborTable {
    pub fn new(
        capacity: usize,
        initial_rto: Duration,
        rtt_min: Duration,
        rexmt_max: Duration,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        NeighborTable {
            entries: LruCache::new(capacity),
            initial_rto,
            rtt_min,
            rexmt_max,
        }
    }

    fn entry(&mut self, addr: Address, now: Instant) -> &mut Neighbor {
        let (initial_rto, rtt_min, rexmt_max) = (self.initial_rto, self.rtt_min, self.rexmt_max);
        self.entries.get_or_insert_mut(addr, || Neighbor {
            address: addr,
            hw_addr: None,
            rtt: RttEstimator::new(initial_rto, rtt_min, rexmt_max),
            ack_id: 1,
            last_ack_request: None,
            last_heard: now,
        })
    }

    /// Record that `addr` was heard from
    pub fn touch(&mut self, addr: Address, now: Instant) {
        self.entry(addr, now).last_heard = now;
    }

    /// Record the interface address `addr` transmits from
    pub fn set_hw_addr(&mut self, addr: Address, hw_addr: HwAddr, now: Instant) {
        self.entry(addr, now).hw_addr = Some(hw_addr);
    }

    pub fn hw_addr(&self, addr: &Address) -> Option<HwAddr> {
        self.entries.peek(addr).and_then(|n| n.hw_addr)
    }

    pub fn get(&self, addr: &Address) -> Option<&Neighbor> {
        self.entries.peek(addr)
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.entries.contains(addr)
    }

    /// Retransmission timeout for `addr`
    pub fn rto(&self, addr: &Address) -> Duration {
        self.entries
            .peek(addr)
            .map(|n| n.rtt.rto())
            .unwrap_or_else(|| self.initial_rto.clamp(self.rtt_min, self.rexmt_max))
    }

    /// Whether a new acknowledgement request may be sent to `addr`
    pub fn ack_request_due(&self, addr: &Address, now: Instant, holdoff: Duration) -> bool {
        match self.entries.peek(addr).and_then(|n| n.last_ack_request) {
            Some(last) => now.saturating_duration_since(last) >= holdoff,
            None => true,
        }
    }

    /// Id the next acknowledgement request to `addr` will carry
    pub fn pending_ack_id(&mut self, addr: Address, now: Instant) -> u16 {
        self.entry(addr, now).ack_id
    }

    /// Take an acknowledgement request id for `addr`
    pub fn next_ack_id(&mut self, addr: Address, now: Instant) -> u16 {
        let neighbor = self.entry(addr, now);
        let id = neighbor.ack_id;
        neighbor.ack_id = neighbor.ack_id.wrapping_add(1);
        neighbor.last_ack_request = Some(now);
        id
    }

    pub fn update_rtt(&mut self, addr: Address, sample: Duration, now: Instant) {
        self.entry(addr, now).rtt.update(sample);
    }

    pub fn remove(&mut self, addr: &Address) -> Option<Neighbor> {
        self.entries.pop(addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
