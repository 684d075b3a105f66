//! Simulated wireless medium
//!
//! Nodes attach with an inbox; the medium delivers each transmission to
//! whoever is in range according to a shared, mutable topology. Links are
//! symmetric.

use dsr_protocol::{Address, HwAddr, Packet};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};

/// What a node's radio hands up to it
#[derive(Debug, Clone)]
pub enum Frame {
    /// A transmission from the neighbor `from`, sent by its radio `hw_addr`
    Received {
        packet: Packet,
        from: Address,
        hw_addr: HwAddr,
    },
    /// A unicast this node sent could not reach `next_hop`
    LinkBroken { next_hop: Address, packet: Packet },
}

/// Locally administered MAC of the simulated radio of `node`
pub fn radio_address(node: Address) -> HwAddr {
    let [a, b, c, d] = node.octets();
    HwAddr::new([0x02, 0x00, a, b, c, d])
}

#[derive(Debug, Default)]
struct Topology {
    links: BTreeSet<(Address, Address)>,
}

impl Topology {
    fn key(a: Address, b: Address) -> (Address, Address) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    fn connected(&self, a: Address, b: Address) -> bool {
        self.links.contains(&Self::key(a, b))
    }

    fn neighbors(&self, node: Address) -> Vec<Address> {
        self.links
            .iter()
            .filter_map(|&(a, b)| match node {
                n if n == a => Some(b),
                n if n == b => Some(a),
                _ => None,
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct Medium {
    topology: Arc<RwLock<Topology>>,
    inboxes: Arc<RwLock<HashMap<Address, mpsc::Sender<Frame>>>>,
    promiscuous: bool,
    link_feedback: bool,
}

impl Medium {
    pub fn new(promiscuous: bool, link_feedback: bool) -> Self {
        Self {
            topology: Arc::new(RwLock::new(Topology::default())),
            inboxes: Arc::new(RwLock::new(HashMap::new())),
            promiscuous,
            link_feedback,
        }
    }

    /// Attach a radio for `address`; frames for it arrive on the returned
    /// receiver
    pub async fn attach(&self, address: Address, capacity: usize) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.inboxes.write().await.insert(address, tx);
        rx
    }

    pub async fn detach(&self, address: Address) {
        self.inboxes.write().await.remove(&address);
    }

    pub async fn set_link(&self, a: Address, b: Address, up: bool) {
        let key = Topology::key(a, b);
        let mut topology = self.topology.write().await;
        if up {
            topology.links.insert(key);
        } else {
            topology.links.remove(&key);
        }
        debug!("link {} <-> {} {}", a, b, if up { "up" } else { "down" });
    }

    pub async fn connected(&self, a: Address, b: Address) -> bool {
        self.topology.read().await.connected(a, b)
    }

    pub async fn neighbors(&self, node: Address) -> Vec<Address> {
        self.topology.read().await.neighbors(node)
    }

    /// Put `packet` on the air from `from`, addressed to `next_hop`
    pub async fn transmit(&self, from: Address, packet: Packet, next_hop: Address) {
        let (neighbors, reachable) = {
            let topology = self.topology.read().await;
            (topology.neighbors(from), topology.connected(from, next_hop))
        };

        if next_hop.is_broadcast() {
            for neighbor in neighbors {
                self.deliver(
                    neighbor,
                    Frame::Received {
                        packet: packet.clone(),
                        from,
                        hw_addr: radio_address(from),
                    },
                )
                .await;
            }
            return;
        }

        if !reachable {
            trace!("{} -> {}: not in range", from, next_hop);
            if self.link_feedback {
                self.deliver(from, Frame::LinkBroken { next_hop, packet })
                    .await;
            }
            return;
        }

        if self.promiscuous {
            for neighbor in neighbors.into_iter().filter(|n| *n != next_hop) {
                self.deliver(
                    neighbor,
                    Frame::Received {
                        packet: packet.clone(),
                        from,
                        hw_addr: radio_address(from),
                    },
                )
                .await;
            }
        }

        let hw_addr = radio_address(from);
        self.deliver(
            next_hop,
            Frame::Received {
                packet,
                from,
                hw_addr,
            },
        )
        .await;
    }

    async fn deliver(&self, to: Address, frame: Frame) {
        let inboxes = self.inboxes.read().await;
        let Some(inbox) = inboxes.get(&to) else {
            return;
        };
        // A full inbox loses the frame, as a busy radio would
        if inbox.try_send(frame).is_err() {
            debug!("frame for {} lost", to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        Address::from_octets(10, 0, 0, n)
    }

    async fn create_test_medium(promiscuous: bool) -> Medium {
        let medium = Medium::new(promiscuous, true);
        medium.set_link(addr(1), addr(2), true).await;
        medium.set_link(addr(1), addr(3), true).await;
        medium
    }

    #[tokio::test]
    async fn test_broadcast_reaches_neighbors_only() {
        let medium = create_test_medium(false).await;
        let mut rx2 = medium.attach(addr(2), 8).await;
        let mut rx3 = medium.attach(addr(3), 8).await;
        let mut rx4 = medium.attach(addr(4), 8).await;

        medium
            .transmit(addr(1), Packet::broadcast(addr(1), 1), Address::BROADCAST)
            .await;

        assert!(matches!(
            rx2.try_recv(),
            Ok(Frame::Received { from, hw_addr, .. })
                if from == addr(1) && hw_addr == radio_address(addr(1))
        ));
        assert!(rx3.try_recv().is_ok());
        assert!(rx4.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unicast_out_of_range_reports_break() {
        let medium = create_test_medium(false).await;
        let mut rx1 = medium.attach(addr(1), 8).await;
        let mut rx4 = medium.attach(addr(4), 8).await;

        medium
            .transmit(addr(1), Packet::new(addr(1), addr(4)), addr(4))
            .await;

        assert!(rx4.try_recv().is_err());
        assert!(matches!(
            rx1.try_recv(),
            Ok(Frame::LinkBroken { next_hop, .. }) if next_hop == addr(4)
        ));
    }

    #[tokio::test]
    async fn test_promiscuous_overhearing() {
        let medium = create_test_medium(true).await;
        let mut rx2 = medium.attach(addr(2), 8).await;
        let mut rx3 = medium.attach(addr(3), 8).await;

        medium
            .transmit(addr(1), Packet::new(addr(1), addr(2)), addr(2))
            .await;

        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_link_down() {
        let medium = create_test_medium(false).await;
        assert!(medium.connected(addr(2), addr(1)).await);

        medium.set_link(addr(2), addr(1), false).await;
        assert!(!medium.connected(addr(1), addr(2)).await);
        assert_eq!(medium.neighbors(addr(1)).await, vec![addr(3)]);
    }
}
