//! Send buffer for packets waiting on route discovery

use dsr_protocol::{Address, Payload};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

/// Packet held until a route to its destination is known
#[derive(Debug, Clone)]
pub struct BufferedPacket {
    pub destination: Address,
    pub payload: Payload,
    pub enqueued_at: Instant,
}

/// Bounded FIFO of packets awaiting a route
///
/// Entries are kept in arrival order, so the front is always the next to
/// expire.
#[derive(Debug)]
pub struct SendBuffer {
    queue: VecDeque<BufferedPacket>,
    capacity: usize,
    timeout: Duration,
}

impl SendBuffer {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        SendBuffer {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            timeout,
        }
    }

    /// Buffer a packet. Returns the entry evicted to make room, if any.
    pub fn enqueue(
        &mut self,
        destination: Address,
        payload: Payload,
        now: Instant,
    ) -> Option<BufferedPacket> {
        let evicted = if self.queue.len() >= self.capacity {
            self.queue.pop_front()
        } else {
            None
        };

        self.queue.push_back(BufferedPacket {
            destination,
            payload,
            enqueued_at: now,
        });
        evicted
    }

    /// Take every packet for `destination`, oldest first, for sending
    pub fn release(&mut self, destination: Address) -> Vec<BufferedPacket> {
        self.take(destination)
    }

    /// Remove every packet for `destination` that can no longer be sent
    pub fn discard(&mut self, destination: Address) -> Vec<BufferedPacket> {
        let dropped = self.take(destination);
        if !dropped.is_empty() {
            debug!("discarding {} buffered packets for {}", dropped.len(), destination);
        }
        dropped
    }

    fn take(&mut self, destination: Address) -> Vec<BufferedPacket> {
        let mut released = Vec::new();
        let mut kept = VecDeque::with_capacity(self.queue.len());

        for entry in self.queue.drain(..) {
            if entry.destination == destination {
                released.push(entry);
            } else {
                kept.push_back(entry);
            }
        }

        self.queue = kept;
        released
    }

    /// Remove every packet whose lifetime ended at or before `now`
    pub fn expire(&mut self, now: Instant) -> Vec<BufferedPacket> {
        let mut expired = Vec::new();
        while let Some(front) = self.queue.front() {
            if front.enqueued_at + self.timeout > now {
                break;
            }
            if let Some(entry) = self.queue.pop_front() {
                expired.push(entry);
            }
        }
        expired
    }

    /// When the oldest entry expires
    pub fn next_expiry(&self) -> Option<Instant> {
        self.queue.front().map(|e| e.enqueued_at + self.timeout)
    }

    pub fn has_destination(&self, destination: Address) -> bool {
        self.queue.iter().any(|e| e.destination == destination)
    }

    /// Distinct destinations currently waiting, in arrival order
    pub fn destinations(&self) -> Vec<Address> {
        let mut seen = Vec::new();
        for entry in &self.queue {
            if !seen.contains(&entry.destination) {
                seen.push(entry.destination);
            }
        }
        seen
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        Address::from_octets(10, 0, 0, n)
    }

    fn payload(id: u64) -> Payload {
        Payload::new(id, vec![0u8; 4])
    }

    #[test]
    fn test_release_by_destination() {
        let now = Instant::now();
        let mut buffer = SendBuffer::new(10, Duration::from_secs(30));

        buffer.enqueue(addr(2), payload(1), now);
        buffer.enqueue(addr(3), payload(2), now);
        buffer.enqueue(addr(2), payload(3), now);

        let released = buffer.release(addr(2));
        assert_eq!(
            released.iter().map(|e| e.payload.id).collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!(buffer.len(), 1);
        assert!(buffer.release(addr(2)).is_empty());
    }

    #[test]
    fn test_discard_leaves_other_destinations() {
        let now = Instant::now();
        let mut buffer = SendBuffer::new(10, Duration::from_secs(30));

        buffer.enqueue(addr(2), payload(1), now);
        buffer.enqueue(addr(3), payload(2), now);

        assert_eq!(buffer.discard(addr(3)).len(), 1);
        assert!(!buffer.has_destination(addr(3)));
        assert!(buffer.has_destination(addr(2)));
        assert!(buffer.discard(addr(9)).is_empty());
    }

    #[test]
    fn test_expiry_not_before_timeout() {
        let now = Instant::now();
        let timeout = Duration::from_secs(30);
        let mut buffer = SendBuffer::new(10, timeout);

        buffer.enqueue(addr(2), payload(1), now);
        buffer.enqueue(addr(2), payload(2), now + Duration::from_secs(10));
        assert_eq!(buffer.next_expiry(), Some(now + timeout));

        assert!(buffer.expire(now + timeout - Duration::from_millis(1)).is_empty());

        let expired = buffer.expire(now + timeout);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].payload.id, 1);
        assert_eq!(buffer.next_expiry(), Some(now + Duration::from_secs(40)));
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let now = Instant::now();
        let mut buffer = SendBuffer::new(2, Duration::from_secs(30));

        assert!(buffer.enqueue(addr(2), payload(1), now).is_none());
        assert!(buffer.enqueue(addr(3), payload(2), now).is_none());
        let evicted = buffer.enqueue(addr(4), payload(3), now).unwrap();

        assert_eq!(evicted.payload.id, 1);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.destinations(), vec![addr(3), addr(4)]);
    }
}
