//! DSR protocol engine
//!
//! A sans-IO state machine: callers feed it packets, link-break reports,
//! outbound data and the current time; it answers with [`Output`]s to be
//! transmitted or delivered. Timers are entries in an internal
//! [`Scheduler`]; the caller sleeps until [`DsrEngine::poll_timeout`] and
//! then calls [`DsrEngine::handle_timeout`].
//!
//! Discovery (requests, replies, route shortening) is in `discovery.rs`;
//! acknowledgement tracking, link failures and salvage are in
//! `maintenance.rs`.

mod discovery;
mod maintenance;

use crate::cache::{self, RouteCache};
use crate::config::DsrConfig;
use crate::discovery::{GratReplyTable, RequestTable};
use crate::error::{DropReason, Result};
use crate::maint_buffer::MaintenanceBuffer;
use crate::neighbor::NeighborTable;
use crate::scheduler::{Scheduler, TimerEvent};
use crate::send_buffer::SendBuffer;
use dsr_protocol::route::find_duplicate;
use dsr_protocol::{Address, DsrOption, HwAddr, Packet, Payload, SourceRoute};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Something the engine wants done
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// Hand `packet` to the link layer for `next_hop` (may be broadcast)
    Transmit { packet: Packet, next_hop: Address },
    /// Data for the local upper layer
    Deliver { src: Address, payload: Payload },
    /// A locally originated packet was given up on
    DeliverFailed {
        dst: Address,
        payload: Payload,
        reason: DropReason,
    },
}

/// Engine statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DsrStats {
    pub data_sent: u64,
    pub data_delivered: u64,
    pub data_forwarded: u64,
    pub data_dropped: u64,
    pub rreq_sent: u64,
    pub rreq_forwarded: u64,
    pub rreq_duplicates: u64,
    pub rrep_sent: u64,
    pub rrep_cached: u64,
    pub rrep_gratuitous: u64,
    pub rerr_sent: u64,
    pub rerr_received: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    pub retransmissions: u64,
    pub link_breaks: u64,
    pub salvaged: u64,
    pub malformed_dropped: u64,
}

/// Per-node protocol engine
pub struct DsrEngine {
    address: Address,
    config: DsrConfig,
    cache: Box<dyn RouteCache>,
    neighbors: NeighborTable,
    requests: RequestTable,
    grat_replies: GratReplyTable,
    maintenance: MaintenanceBuffer,
    send_buffer: SendBuffer,
    scheduler: Scheduler,
    outputs: VecDeque<Output>,
    /// Rebroadcasts waiting out their jitter
    jittered: Vec<(Instant, Packet)>,
    rng: StdRng,
    /// Externally supplied costs of links to neighbors
    link_costs: HashMap<Address, u32>,
    next_request_id: u16,
    stats: DsrStats,
}

impl DsrEngine {
    /// Create an engine for the node `address`
    pub fn new(address: Address, config: DsrConfig) -> Result<Self> {
        config.validate()?;

        Ok(DsrEngine {
            address,
            cache: cache::build(address, &config),
            neighbors: NeighborTable::new(
                config.neighbor_table_size,
                config.initial_rto(),
                config.rtt_min(),
                config.rexmt_max(),
            ),
            requests: RequestTable::new(
                config.request_table_size,
                config.request_table_ids,
                config.rreq_multi_visit,
                config.rreq_max_visit,
            ),
            grat_replies: GratReplyTable::new(config.grat_reply_holdoff()),
            maintenance: MaintenanceBuffer::new(config.rexmt_buffer_size),
            send_buffer: SendBuffer::new(config.send_buffer_size, config.send_buffer_timeout()),
            scheduler: Scheduler::new(),
            outputs: VecDeque::new(),
            jittered: Vec::new(),
            rng: match config.tie_break_seed {
                Some(seed) => StdRng::seed_from_u64(seed.rotate_left(32)),
                None => StdRng::from_entropy(),
            },
            link_costs: HashMap::new(),
            next_request_id: 0,
            stats: DsrStats::default(),
            config,
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn config(&self) -> &DsrConfig {
        &self.config
    }

    pub fn stats(&self) -> DsrStats {
        self.stats.clone()
    }

    /// Send `payload` to `dst`
    ///
    /// Uses a cached route when one exists; otherwise the packet is buffered
    /// and route discovery starts.
    pub fn send(&mut self, dst: Address, payload: Payload, now: Instant) {
        if dst == self.address {
            self.outputs.push_back(Output::Deliver {
                src: self.address,
                payload,
            });
            return;
        }

        self.stats.data_sent += 1;

        if dst.is_broadcast() {
            let packet = Packet::broadcast(self.address, 1).with_payload(payload);
            self.emit(packet, Address::BROADCAST);
            return;
        }

        if let Some(route) = self.cache.find_route(self.address, dst, now) {
            trace!("{}: sending to {} via {}", self.address, dst, route);
            let packet = Packet::routed(route).with_payload(payload);
            self.send_routed(packet, now);
            return;
        }

        debug!("{}: no route to {}, buffering", self.address, dst);
        if let Some(evicted) = self.send_buffer.enqueue(dst, payload, now) {
            warn!(
                "{}: send buffer full, dropping packet for {}",
                self.address, evicted.destination
            );
            self.fail(evicted.destination, evicted.payload, DropReason::SendBufferFull);
        }
        self.rearm_send_buffer();
        self.start_discovery(dst, now);
    }

    /// Process a packet received from the one-hop neighbor `from`
    pub fn on_packet_received(&mut self, packet: Packet, from: Address, now: Instant) {
        if from == self.address {
            return;
        }

        self.neighbors.touch(from, now);
        let cost = self.link_cost(from);
        self.cache
            .add_link(self.address, from, cost, self.config.route_cache_timeout(), now);

        if let Err(reason) = self.check_well_formed(&packet) {
            debug!("{}: dropping malformed packet from {}: {}", self.address, from, reason);
            self.stats.malformed_dropped += 1;
            return;
        }

        if let Some(header) = &packet.source_route {
            let intended = match header.next_hop() {
                Ok(hop) => hop,
                Err(_) => {
                    self.stats.malformed_dropped += 1;
                    return;
                }
            };
            if intended != self.address {
                if self.config.promiscuous {
                    self.on_overheard(&packet, from, now);
                }
                return;
            }
        } else if !packet.is_broadcast() && packet.dst != self.address {
            return;
        }

        self.process_options(&packet, from, now);

        if let Some(header) = &packet.source_route {
            let timeout = self.config.route_cache_timeout();
            self.cache.install_route(&header.route, timeout, now);
            self.flush_send_buffer(now);

            if packet.dst == self.address {
                self.deliver(packet);
            } else {
                self.forward(packet, now);
            }
        } else if packet.route_request().is_none() {
            self.deliver(packet);
        }
    }

    /// Like [`on_packet_received`](Self::on_packet_received), for a link
    /// layer that also reports the sender's interface address
    pub fn on_frame_received(
        &mut self,
        packet: Packet,
        from: Address,
        hw_addr: HwAddr,
        now: Instant,
    ) {
        if from != self.address {
            self.neighbors.set_hw_addr(from, hw_addr, now);
        }
        self.on_packet_received(packet, from, now);
    }

    /// Report that transmission to `next_hop` failed at the link layer
    ///
    /// `failed` is the packet the link layer could not deliver, if known.
    pub fn on_link_break(&mut self, next_hop: Address, failed: Option<Packet>, now: Instant) {
        self.handle_link_failure(next_hop, failed, now);
    }

    /// Set the cost of the link to `neighbor` (used with `cost_metric`)
    pub fn set_link_cost(&mut self, neighbor: Address, cost: u32) {
        self.link_costs.insert(neighbor, cost.max(1));
    }

    /// Best cached route to `dst`
    pub fn find_route(&mut self, dst: Address, now: Instant) -> Option<SourceRoute> {
        self.cache.find_route(self.address, dst, now)
    }

    pub fn flush_route_cache(&mut self) {
        debug!("{}: flushing route cache", self.address);
        self.cache.flush();
    }

    /// Earliest time [`handle_timeout`](Self::handle_timeout) has work to do
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    /// Fire every timer due at or before `now`, in deadline order
    pub fn handle_timeout(&mut self, now: Instant) {
        while let Some((_, event)) = self.scheduler.pop_due(now) {
            match event {
                TimerEvent::RouteRequest(target) => self.on_request_timeout(target, now),
                TimerEvent::Maintenance => self.on_maintenance_timeout(now),
                TimerEvent::SendBuffer => self.on_send_buffer_timeout(now),
                TimerEvent::GratReplyExpiry => {
                    self.grat_replies.expire(now);
                    self.rearm_grat_replies();
                }
                TimerEvent::BroadcastJitter => self.on_jitter_timeout(now),
            }
        }
    }

    /// Next pending output, if any
    pub fn poll_output(&mut self) -> Option<Output> {
        self.outputs.pop_front()
    }

    /// Whether route discovery for `target` is in progress
    pub fn is_discovering(&self, target: Address) -> bool {
        self.requests.entry(&target).is_some()
    }

    /// Packets waiting for a route
    pub fn buffered(&self) -> usize {
        self.send_buffer.len()
    }

    /// Packets awaiting a hop-by-hop acknowledgement
    pub fn unacknowledged(&self) -> usize {
        self.maintenance.len()
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    /// Interface address of the neighbor `addr`, if known
    pub fn neighbor_hw_addr(&self, addr: Address) -> Option<HwAddr> {
        self.neighbors.hw_addr(&addr)
    }

    fn link_cost(&self, neighbor: Address) -> u32 {
        if self.config.cost_metric {
            self.link_costs.get(&neighbor).copied().unwrap_or(1)
        } else {
            1
        }
    }

    fn check_well_formed(&self, packet: &Packet) -> std::result::Result<(), &'static str> {
        let requests = packet
            .options
            .iter()
            .filter(|o| matches!(o, DsrOption::RouteRequest { .. }))
            .count();
        if requests > 1 {
            return Err("more than one route request");
        }
        if requests == 1 && !packet.is_broadcast() {
            return Err("route request on a unicast packet");
        }

        if let Some(header) = &packet.source_route {
            if header.segments_left > header.route.num_hops() {
                return Err("segments left exceeds route length");
            }
            if find_duplicate(header.route.path()).is_some() {
                return Err("loop in source route");
            }
            if header.route.src() != packet.src || header.route.dst() != packet.dst {
                return Err("source route endpoints differ from packet");
            }
        }

        Ok(())
    }

    fn process_options(&mut self, packet: &Packet, from: Address, now: Instant) {
        for option in &packet.options {
            match option {
                DsrOption::Ack { id, from: acker, to } if *to == self.address => {
                    self.on_ack(*acker, *id, now);
                }
                DsrOption::AckRequest { id } => self.send_ack(from, *id),
                DsrOption::RouteRequest { .. } => self.on_route_request(packet, from, now),
                DsrOption::RouteReply { route } => self.on_route_reply(route, packet, now),
                DsrOption::RouteError {
                    error_source,
                    unreachable,
                    ..
                } => self.on_route_error(*error_source, *unreachable),
                DsrOption::Ack { .. } => {}
            }
        }
    }

    fn deliver(&mut self, packet: Packet) {
        if let Some(payload) = packet.payload {
            self.stats.data_delivered += 1;
            self.outputs.push_back(Output::Deliver {
                src: packet.src,
                payload,
            });
        }
    }

    /// Pass a source-routed packet on to the next node of its route
    fn forward(&mut self, mut packet: Packet, now: Instant) {
        if packet.ttl <= 1 {
            debug!("{}: TTL expired for packet to {}", self.address, packet.dst);
            self.drop_packet(packet, DropReason::LinkFailure);
            return;
        }
        packet.ttl -= 1;
        packet.remove_ack_request();

        let Some(header) = packet.source_route.as_mut() else {
            return;
        };
        if !header.advance() {
            self.stats.malformed_dropped += 1;
            return;
        }

        if packet.payload.is_some() {
            self.stats.data_forwarded += 1;
        }
        self.send_routed(packet, now);
    }

    /// Send a source-routed packet to the next hop of its header
    fn send_routed(&mut self, packet: Packet, now: Instant) {
        let next_hop = match packet.source_route.as_ref().map(|h| h.next_hop()) {
            Some(Ok(hop)) => hop,
            _ => {
                self.stats.malformed_dropped += 1;
                return;
            }
        };
        self.transmit(packet, next_hop, now);
    }

    fn emit(&mut self, packet: Packet, next_hop: Address) {
        self.outputs.push_back(Output::Transmit { packet, next_hop });
    }

    /// Broadcast `packet` after a random delay of up to `broadcast_jitter_ms`
    fn broadcast_jittered(&mut self, packet: Packet, now: Instant) {
        let max = self.config.broadcast_jitter_ms;
        if max == 0 {
            self.emit(packet, Address::BROADCAST);
            return;
        }

        let delay = Duration::from_millis(self.rng.gen_range(0..=max));
        trace!("{}: rebroadcast held for {:?}", self.address, delay);
        self.jittered.push((now + delay, packet));
        self.rearm_jitter();
    }

    fn on_jitter_timeout(&mut self, now: Instant) {
        let (mut due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.jittered)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        self.jittered = pending;

        due.sort_by_key(|(at, _)| *at);
        for (_, packet) in due {
            self.emit(packet, Address::BROADCAST);
        }
        self.rearm_jitter();
    }

    fn rearm_jitter(&mut self) {
        match self.jittered.iter().map(|(at, _)| *at).min() {
            Some(at) => self.scheduler.schedule(TimerEvent::BroadcastJitter, at),
            None => {
                self.scheduler.cancel(TimerEvent::BroadcastJitter);
            }
        }
    }

    /// Report a locally originated packet as undeliverable, or count a
    /// foreign one as dropped
    fn drop_packet(&mut self, packet: Packet, reason: DropReason) {
        match packet.payload {
            Some(payload) if packet.src == self.address => self.fail(packet.dst, payload, reason),
            Some(_) => self.stats.data_dropped += 1,
            None => {}
        }
    }

    fn fail(&mut self, dst: Address, payload: Payload, reason: DropReason) {
        self.stats.data_dropped += 1;
        self.outputs.push_back(Output::DeliverFailed {
            dst,
            payload,
            reason,
        });
    }

    /// Send every buffered packet whose destination is now reachable
    fn flush_send_buffer(&mut self, now: Instant) {
        for dst in self.send_buffer.destinations() {
            let Some(route) = self.cache.find_route(self.address, dst, now) else {
                continue;
            };

            self.cancel_discovery(dst);
            for buffered in self.send_buffer.release(dst) {
                debug!("{}: releasing buffered packet for {} via {}", self.address, dst, route);
                let packet = Packet::routed(route.clone()).with_payload(buffered.payload);
                self.send_routed(packet, now);
            }
        }
        self.rearm_send_buffer();
    }

    fn on_send_buffer_timeout(&mut self, now: Instant) {
        for expired in self.send_buffer.expire(now) {
            debug!("{}: buffered packet for {} timed out", self.address, expired.destination);
            self.fail(expired.destination, expired.payload, DropReason::SendBufferTimeout);
        }
        self.rearm_send_buffer();
    }

    fn rearm_send_buffer(&mut self) {
        match self.send_buffer.next_expiry() {
            Some(at) => self.scheduler.schedule(TimerEvent::SendBuffer, at),
            None => {
                self.scheduler.cancel(TimerEvent::SendBuffer);
            }
        }
    }

    fn rearm_grat_replies(&mut self) {
        match self.grat_replies.next_expiry() {
            Some(at) => self.scheduler.schedule(TimerEvent::GratReplyExpiry, at),
            None => {
                self.scheduler.cancel(TimerEvent::GratReplyExpiry);
            }
        }
    }
}
