//! Deterministic in-memory network for driving several engines
//!
//! Transmissions are delivered instantly; time only moves when every
//! engine is idle, jumping to the earliest pending timer.

#![allow(dead_code)]

use dsr_protocol::{Address, Packet, Payload, SourceRoute};
use dsr_routing::{DropReason, DsrConfig, DsrEngine, Output};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{Duration, Instant};

/// Upper bound on transmissions handled by one `pump`
const MAX_TRANSMISSIONS: usize = 100_000;

pub fn addr(n: u8) -> Address {
    Address::from_octets(10, 0, 0, n)
}

/// Last octet of every node on `route`
pub fn nodes(route: &SourceRoute) -> Vec<u8> {
    route.path().map(|a| a.octets()[3]).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub at: Address,
    pub src: Address,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub at: Address,
    pub dst: Address,
    pub payload: Payload,
    pub reason: DropReason,
}

pub struct TestNetwork {
    config: DsrConfig,
    engines: BTreeMap<Address, DsrEngine>,
    links: BTreeSet<(Address, Address)>,
    in_flight: VecDeque<(Address, Packet, Address)>,
    /// Neighbors of a sender also receive its unicast packets
    pub promiscuous: bool,
    /// Report unicast to an absent neighbor through `on_link_break`
    pub link_feedback: bool,
    pub now: Instant,
    pub delivered: Vec<Delivery>,
    pub failed: Vec<Failure>,
    pub transmissions: usize,
}

impl TestNetwork {
    pub fn new(config: DsrConfig) -> Self {
        TestNetwork {
            config,
            engines: BTreeMap::new(),
            links: BTreeSet::new(),
            in_flight: VecDeque::new(),
            promiscuous: false,
            link_feedback: true,
            now: Instant::now(),
            delivered: Vec::new(),
            failed: Vec::new(),
            transmissions: 0,
        }
    }

    /// Nodes connected in a line, in the given order
    pub fn chain(config: DsrConfig, ids: &[u8]) -> Self {
        let mut net = TestNetwork::new(config);
        for id in ids {
            net.add_node(*id);
        }
        for pair in ids.windows(2) {
            net.add_link(pair[0], pair[1]);
        }
        net
    }

    pub fn add_node(&mut self, id: u8) {
        let engine = DsrEngine::new(addr(id), self.config.clone()).unwrap();
        self.engines.insert(addr(id), engine);
    }

    pub fn add_link(&mut self, a: u8, b: u8) {
        self.links.insert(Self::key(addr(a), addr(b)));
    }

    pub fn remove_link(&mut self, a: u8, b: u8) {
        self.links.remove(&Self::key(addr(a), addr(b)));
    }

    pub fn connected(&self, a: Address, b: Address) -> bool {
        self.links.contains(&Self::key(a, b))
    }

    fn key(a: Address, b: Address) -> (Address, Address) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    fn neighbors_of(&self, node: Address) -> Vec<Address> {
        self.links
            .iter()
            .filter_map(|(a, b)| {
                if *a == node {
                    Some(*b)
                } else if *b == node {
                    Some(*a)
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn engine(&self, id: u8) -> &DsrEngine {
        &self.engines[&addr(id)]
    }

    pub fn engine_mut(&mut self, id: u8) -> &mut DsrEngine {
        self.engines.get_mut(&addr(id)).unwrap()
    }

    /// Hand a payload to `from` for delivery to `to`
    pub fn send(&mut self, from: u8, to: u8, id: u64) {
        let now = self.now;
        let payload = Payload::new(id, format!("payload {}", id).into_bytes());
        self.engine_mut(from).send(addr(to), payload, now);
    }

    pub fn delivered_to(&self, id: u8) -> Vec<&Delivery> {
        self.delivered.iter().filter(|d| d.at == addr(id)).collect()
    }

    pub fn failed_at(&self, id: u8) -> Vec<&Failure> {
        self.failed.iter().filter(|f| f.at == addr(id)).collect()
    }

    /// Advance the clock by `duration`, firing timers and delivering packets
    pub fn run_for(&mut self, duration: Duration) {
        let end = self.now + duration;

        loop {
            self.pump();

            let next = self.engines.values().filter_map(|e| e.poll_timeout()).min();
            match next {
                Some(at) if at <= end => {
                    self.now = self.now.max(at);
                    let now = self.now;
                    for engine in self.engines.values_mut() {
                        if engine.poll_timeout().is_some_and(|t| t <= now) {
                            engine.handle_timeout(now);
                        }
                    }
                }
                _ => break,
            }
        }

        self.now = end;
    }

    /// Move outputs around until every engine is quiet
    pub fn pump(&mut self) {
        let mut handled = 0;

        loop {
            let mut progressed = false;

            let addresses: Vec<Address> = self.engines.keys().copied().collect();
            for node in addresses {
                while let Some(output) = self.engines.get_mut(&node).and_then(|e| e.poll_output()) {
                    progressed = true;
                    match output {
                        Output::Transmit { packet, next_hop } => {
                            self.in_flight.push_back((node, packet, next_hop))
                        }
                        Output::Deliver { src, payload } => self.delivered.push(Delivery {
                            at: node,
                            src,
                            payload,
                        }),
                        Output::DeliverFailed {
                            dst,
                            payload,
                            reason,
                        } => self.failed.push(Failure {
                            at: node,
                            dst,
                            payload,
                            reason,
                        }),
                    }
                }
            }

            while let Some((from, packet, next_hop)) = self.in_flight.pop_front() {
                progressed = true;
                handled += 1;
                assert!(handled < MAX_TRANSMISSIONS, "network did not settle");
                self.transmissions += 1;
                self.deliver(from, packet, next_hop);
            }

            if !progressed {
                break;
            }
        }
    }

    fn deliver(&mut self, from: Address, packet: Packet, next_hop: Address) {
        let now = self.now;
        let neighbors = self.neighbors_of(from);

        if next_hop.is_broadcast() {
            for neighbor in neighbors {
                if let Some(engine) = self.engines.get_mut(&neighbor) {
                    engine.on_packet_received(packet.clone(), from, now);
                }
            }
            return;
        }

        if !self.connected(from, next_hop) {
            if self.link_feedback {
                if let Some(engine) = self.engines.get_mut(&from) {
                    engine.on_link_break(next_hop, Some(packet), now);
                }
            }
            return;
        }

        if self.promiscuous {
            for neighbor in neighbors.into_iter().filter(|n| *n != next_hop) {
                if let Some(engine) = self.engines.get_mut(&neighbor) {
                    engine.on_packet_received(packet.clone(), from, now);
                }
            }
        }

        if let Some(engine) = self.engines.get_mut(&next_hop) {
            engine.on_packet_received(packet, from, now);
        }
    }
}
