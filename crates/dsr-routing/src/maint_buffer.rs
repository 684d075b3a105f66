//! Maintenance buffer
//!
//! Holds every packet sent to a neighbor that still awaits a network-layer
//! acknowledgement, ordered by retransmission deadline.

use dsr_protocol::{Address, Packet};
use std::collections::BTreeMap;
use std::time::Instant;

/// Packet awaiting acknowledgement from `next_hop`
#[derive(Debug, Clone)]
pub struct MaintEntry {
    pub next_hop: Address,
    /// Acknowledgement id that clears this entry
    pub id: u16,
    /// The packet as transmitted
    pub packet: Packet,
    pub retransmits: u32,
    pub tx_time: Instant,
    pub expires: Instant,
    /// Whether the last transmission carried an acknowledgement request
    pub ack_request_sent: bool,
}

/// `a <= b` in 16-bit serial number arithmetic
pub fn serial_le(a: u16, b: u16) -> bool {
    (b.wrapping_sub(a) as i16) >= 0
}

#[derive(Debug)]
pub struct MaintenanceBuffer {
    entries: BTreeMap<(Instant, u64), MaintEntry>,
    next_seq: u64,
    capacity: usize,
}

impl MaintenanceBuffer {
    pub fn new(capacity: usize) -> Self {
        MaintenanceBuffer {
            entries: BTreeMap::new(),
            next_seq: 0,
            capacity: capacity.max(1),
        }
    }

    /// Track `entry`
    ///
    /// A full buffer refuses new entries; the refused entry is handed back.
    pub fn insert(&mut self, entry: MaintEntry) -> Option<MaintEntry> {
        if self.entries.len() >= self.capacity {
            return Some(entry);
        }

        let key = (entry.expires, self.next_seq);
        self.next_seq = self.next_seq.wrapping_add(1);
        self.entries.insert(key, entry);
        None
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(at, _)| *at)
    }

    /// Remove the earliest entry if its deadline has passed
    pub fn pop_expired(&mut self, now: Instant) -> Option<MaintEntry> {
        match self.entries.first_key_value() {
            Some(((expires, _), _)) if *expires <= now => self.entries.pop_first().map(|(_, e)| e),
            _ => None,
        }
    }

    /// Remove entries for `next_hop` cleared by a cumulative ack of `id`
    pub fn ack(&mut self, next_hop: Address, id: u16) -> Vec<MaintEntry> {
        self.extract(|e| e.next_hop == next_hop && serial_le(e.id, id))
    }

    /// Remove every entry sent to `next_hop`
    pub fn remove_next_hop(&mut self, next_hop: Address) -> Vec<MaintEntry> {
        self.extract(|e| e.next_hop == next_hop)
    }

    /// Remove every entry whose packet is addressed to `dst`
    pub fn remove_destination(&mut self, dst: Address) -> Vec<MaintEntry> {
        self.extract(|e| e.packet.dst == dst)
    }

    fn extract(&mut self, pred: impl Fn(&MaintEntry) -> bool) -> Vec<MaintEntry> {
        let keys: Vec<(Instant, u64)> = self
            .entries
            .iter()
            .filter(|(_, e)| pred(e))
            .map(|(k, _)| *k)
            .collect();

        keys.into_iter()
            .filter_map(|k| self.entries.remove(&k))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn has_next_hop(&self, next_hop: Address) -> bool {
        self.entries.values().any(|e| e.next_hop == next_hop)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(n: u8) -> Address {
        Address::from_octets(10, 0, 0, n)
    }

    fn create_test_entry(next_hop: u8, id: u16, expires: Instant) -> MaintEntry {
        MaintEntry {
            next_hop: addr(next_hop),
            id,
            packet: Packet::new(addr(1), addr(9)),
            retransmits: 0,
            tx_time: expires - Duration::from_millis(100),
            expires,
            ack_request_sent: true,
        }
    }

    #[test]
    fn test_serial_le() {
        assert!(serial_le(1, 1));
        assert!(serial_le(1, 2));
        assert!(!serial_le(2, 1));
        assert!(serial_le(u16::MAX, 0));
        assert!(!serial_le(0, u16::MAX));
    }

    #[test]
    fn test_cumulative_ack() {
        let now = Instant::now();
        let mut buf = MaintenanceBuffer::new(10);
        buf.insert(create_test_entry(2, 1, now));
        buf.insert(create_test_entry(2, 2, now));
        buf.insert(create_test_entry(2, 3, now));
        buf.insert(create_test_entry(3, 1, now));

        let acked = buf.ack(addr(2), 2);
        assert_eq!(acked.len(), 2);
        assert!(acked.iter().all(|e| e.next_hop == addr(2) && e.id <= 2));
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_pop_expired_in_deadline_order() {
        let now = Instant::now();
        let mut buf = MaintenanceBuffer::new(10);
        buf.insert(create_test_entry(2, 1, now + Duration::from_millis(30)));
        buf.insert(create_test_entry(3, 1, now + Duration::from_millis(10)));

        assert_eq!(buf.next_expiry(), Some(now + Duration::from_millis(10)));
        assert!(buf.pop_expired(now).is_none());

        let first = buf.pop_expired(now + Duration::from_millis(40)).unwrap();
        assert_eq!(first.next_hop, addr(3));
        let second = buf.pop_expired(now + Duration::from_millis(40)).unwrap();
        assert_eq!(second.next_hop, addr(2));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_full_buffer_refuses_new_entry() {
        let now = Instant::now();
        let mut buf = MaintenanceBuffer::new(2);
        assert!(buf.insert(create_test_entry(2, 1, now + Duration::from_millis(20))).is_none());
        assert!(buf.insert(create_test_entry(3, 1, now + Duration::from_millis(10))).is_none());

        let refused = buf.insert(create_test_entry(4, 1, now + Duration::from_millis(30)));
        assert_eq!(refused.unwrap().next_hop, addr(4));
        assert_eq!(buf.len(), 2);
        assert!(buf.has_next_hop(addr(3)));
        assert!(!buf.has_next_hop(addr(4)));
    }

    #[test]
    fn test_remove_by_next_hop_and_destination() {
        let now = Instant::now();
        let mut buf = MaintenanceBuffer::new(10);
        buf.insert(create_test_entry(2, 1, now));
        buf.insert(create_test_entry(3, 1, now));

        assert_eq!(buf.remove_next_hop(addr(2)).len(), 1);
        assert!(!buf.has_next_hop(addr(2)));
        assert_eq!(buf.remove_destination(addr(9)).len(), 1);
        assert!(buf.is_empty());
    }
}
