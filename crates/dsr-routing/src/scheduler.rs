//! Timer scheduling
//!
//! All engine timers go through one ordered queue. Each [`TimerEvent`] is
//! armed at most once: scheduling it again moves its deadline, cancelling it
//! when unarmed does nothing.

use dsr_protocol::Address;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Timer kinds driven by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerEvent {
    /// Route request retry for a target
    RouteRequest(Address),
    /// Earliest pending acknowledgement in the maintenance buffer
    Maintenance,
    /// Earliest send-buffer expiry
    SendBuffer,
    /// Earliest gratuitous-reply holdoff expiry
    GratReplyExpiry,
    /// Earliest jittered rebroadcast
    BroadcastJitter,
}

/// Ordered timer queue
#[derive(Debug, Default)]
pub struct Scheduler {
    /// (deadline, insertion sequence) -> event
    queue: BTreeMap<(Instant, u64), TimerEvent>,
    /// event -> its queue key
    armed: HashMap<TimerEvent, (Instant, u64)>,
    next_seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `event` at `deadline`, replacing any earlier arming
    pub fn schedule(&mut self, event: TimerEvent, deadline: Instant) {
        self.cancel(event);

        let key = (deadline, self.next_seq);
        self.next_seq = self.next_seq.wrapping_add(1);
        self.queue.insert(key, event);
        self.armed.insert(event, key);
    }

    /// Disarm `event`. Returns whether it was armed.
    pub fn cancel(&mut self, event: TimerEvent) -> bool {
        match self.armed.remove(&event) {
            Some(key) => {
                self.queue.remove(&key);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self, event: TimerEvent) -> bool {
        self.armed.contains_key(&event)
    }

    #[cfg(test)]
    pub(crate) fn deadline(&self, event: TimerEvent) -> Option<Instant> {
        self.armed.get(&event).map(|(at, _)| *at)
    }

    /// Earliest armed deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(at, _)| *at)
    }

    /// Remove and return the earliest event due at or before `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<(Instant, TimerEvent)> {
        let (&key, _) = self.queue.iter().next()?;
        if key.0 > now {
            return None;
        }

        let event = self.queue.remove(&key)?;
        self.armed.remove(&event);
        Some((key.0, event))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(n: u8) -> Address {
        Address::from_octets(10, 0, 0, n)
    }

    #[test]
    fn test_events_fire_in_deadline_order() {
        let t0 = Instant::now();
        let mut sched = Scheduler::new();

        sched.schedule(TimerEvent::SendBuffer, t0 + Duration::from_millis(30));
        sched.schedule(TimerEvent::Maintenance, t0 + Duration::from_millis(10));
        sched.schedule(TimerEvent::RouteRequest(addr(4)), t0 + Duration::from_millis(20));

        assert_eq!(sched.next_deadline(), Some(t0 + Duration::from_millis(10)));
        assert!(sched.pop_due(t0).is_none());

        let later = t0 + Duration::from_millis(25);
        assert_eq!(sched.pop_due(later).unwrap().1, TimerEvent::Maintenance);
        assert_eq!(
            sched.pop_due(later).unwrap().1,
            TimerEvent::RouteRequest(addr(4))
        );
        assert!(sched.pop_due(later).is_none());
        assert_eq!(sched.len(), 1);
    }

    #[test]
    fn test_rescheduling_replaces_deadline() {
        let t0 = Instant::now();
        let mut sched = Scheduler::new();

        sched.schedule(TimerEvent::Maintenance, t0 + Duration::from_millis(10));
        sched.schedule(TimerEvent::Maintenance, t0 + Duration::from_millis(50));

        assert_eq!(sched.len(), 1);
        assert_eq!(
            sched.deadline(TimerEvent::Maintenance),
            Some(t0 + Duration::from_millis(50))
        );
        assert!(sched.pop_due(t0 + Duration::from_millis(20)).is_none());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let t0 = Instant::now();
        let mut sched = Scheduler::new();

        sched.schedule(TimerEvent::GratReplyExpiry, t0);
        assert!(sched.cancel(TimerEvent::GratReplyExpiry));
        assert!(!sched.cancel(TimerEvent::GratReplyExpiry));
        assert!(!sched.cancel(TimerEvent::RouteRequest(addr(1))));
        assert!(sched.is_empty());
        assert!(sched.next_deadline().is_none());
    }

    #[test]
    fn test_equal_deadlines_fire_in_insertion_order() {
        let t0 = Instant::now();
        let mut sched = Scheduler::new();

        sched.schedule(TimerEvent::RouteRequest(addr(9)), t0);
        sched.schedule(TimerEvent::RouteRequest(addr(1)), t0);

        assert_eq!(
            sched.pop_due(t0).unwrap().1,
            TimerEvent::RouteRequest(addr(9))
        );
        assert_eq!(
            sched.pop_due(t0).unwrap().1,
            TimerEvent::RouteRequest(addr(1))
        );
    }
}
