//! Route request / reply handling and automatic route shortening

use super::DsrEngine;
use crate::discovery::{RetryDecision, RetryLimits};
use crate::error::DropReason;
use crate::scheduler::TimerEvent;
use dsr_protocol::{Address, DsrOption, Packet, SourceRoute};
use std::time::Instant;
use tracing::{debug, trace, warn};

impl DsrEngine {
    /// Begin discovering a route to `target` unless already doing so
    pub(super) fn start_discovery(&mut self, target: Address, now: Instant) {
        let ttl = self.config.ttl_start;
        let timeout = if ttl == 1 {
            self.config.nonprop_request_timeout()
        } else {
            self.config.request_period()
        };
        let id = self.next_request_id;

        if !self.requests.begin(target, ttl, timeout, id, now) {
            return;
        }
        self.next_request_id = self.next_request_id.wrapping_add(1);

        debug!("{}: starting route discovery for {}", self.address, target);
        self.send_route_request(target, ttl, id);
        self.scheduler
            .schedule(TimerEvent::RouteRequest(target), now + timeout);
    }

    fn send_route_request(&mut self, target: Address, ttl: u8, id: u16) {
        let packet = Packet::broadcast(self.address, ttl).with_option(DsrOption::RouteRequest {
            id,
            target,
            accumulated: Vec::new(),
            link_costs: Vec::new(),
        });
        self.stats.rreq_sent += 1;
        self.emit(packet, Address::BROADCAST);
    }

    /// Stop discovery for `target`; a no-op when none is running
    pub(super) fn cancel_discovery(&mut self, target: Address) {
        if self.requests.cancel(&target).is_some() {
            trace!("{}: discovery for {} complete", self.address, target);
        }
        self.scheduler.cancel(TimerEvent::RouteRequest(target));
    }

    pub(super) fn on_request_timeout(&mut self, target: Address, now: Instant) {
        if self.cache.find_route(self.address, target, now).is_some() {
            self.cancel_discovery(target);
            self.flush_send_buffer(now);
            return;
        }

        let limits = RetryLimits {
            max_retransmits: self.config.max_request_rexmt,
            max_ttl: self.config.max_ttl,
            max_timeout: self.config.max_request_period(),
        };

        match self.requests.retry(&target, limits) {
            RetryDecision::Retry { ttl, timeout } => {
                let id = self.next_request_id;
                self.next_request_id = self.next_request_id.wrapping_add(1);
                self.requests.set_request_id(&target, id);

                debug!(
                    "{}: retrying discovery for {} (ttl {}, next timeout {:?})",
                    self.address, target, ttl, timeout
                );
                self.send_route_request(target, ttl, id);
                self.scheduler
                    .schedule(TimerEvent::RouteRequest(target), now + timeout);
            }
            RetryDecision::GiveUp => {
                warn!("{}: route discovery for {} failed", self.address, target);
                self.cache.invalidate_node(target);
                for buffered in self.send_buffer.discard(target) {
                    self.fail(target, buffered.payload, DropReason::DiscoveryFailed);
                }
                self.rearm_send_buffer();
            }
        }
    }

    pub(super) fn on_route_request(&mut self, packet: &Packet, from: Address, now: Instant) {
        let Some((id, target, accumulated, link_costs)) = packet.route_request() else {
            return;
        };
        let initiator = packet.src;

        if initiator == self.address || accumulated.contains(&self.address) {
            return;
        }
        if link_costs.len() != accumulated.len() {
            self.stats.malformed_dropped += 1;
            return;
        }

        let last_cost = self.link_cost(from);
        let mut costs = link_costs.to_vec();
        costs.push(last_cost);

        // Route from the initiator to this node as recorded by the request
        let Ok(srt) = SourceRoute::new(initiator, self.address, accumulated.to_vec())
            .and_then(|r| r.with_cost(costs.clone()))
        else {
            self.stats.malformed_dropped += 1;
            return;
        };

        let cost = if self.config.cost_metric {
            srt.total_cost()
        } else {
            srt.link_count() as u32
        };

        if self
            .requests
            .is_duplicate(initiator, target, id, cost, accumulated)
        {
            trace!("{}: duplicate request {} from {}", self.address, id, initiator);
            self.stats.rreq_duplicates += 1;
            return;
        }

        let reverse = srt.reverse();
        self.cache
            .install_route(&reverse, self.config.route_cache_timeout(), now);
        self.flush_send_buffer(now);

        if target == self.address {
            debug!("{}: answering request {} from {} via {}", self.address, id, initiator, reverse);
            self.send_route_reply(reverse, srt, now);
            return;
        }

        if !self.config.rrep_destination_only {
            if let Some(cached) = self.cache.find_route(self.address, target, now) {
                match srt.concatenate(&cached) {
                    Ok(full) => {
                        debug!(
                            "{}: answering request for {} from cache: {}",
                            self.address, target, full
                        );
                        self.stats.rrep_cached += 1;
                        self.send_route_reply(reverse, full, now);
                        return;
                    }
                    Err(e) => trace!("{}: cached route unusable for reply: {}", self.address, e),
                }
            }
        }

        if packet.ttl <= 1 {
            return;
        }

        let mut forwarded = packet.clone();
        forwarded.ttl -= 1;
        for option in forwarded.options.iter_mut() {
            if let DsrOption::RouteRequest {
                accumulated,
                link_costs,
                ..
            } = option
            {
                accumulated.push(self.address);
                link_costs.push(last_cost);
            }
        }

        self.stats.rreq_forwarded += 1;
        self.broadcast_jittered(forwarded, now);
    }

    pub(super) fn on_route_reply(&mut self, route: &SourceRoute, packet: &Packet, now: Instant) {
        self.cache
            .install_route(route, self.config.route_cache_timeout(), now);

        if packet.dst != self.address {
            return;
        }

        debug!("{}: learned route {}", self.address, route);
        let reachable: Vec<Address> = route
            .path()
            .skip_while(|a| *a != self.address)
            .skip(1)
            .collect();
        for addr in reachable {
            self.cancel_discovery(addr);
        }
        self.flush_send_buffer(now);
    }

    /// A source-routed packet meant for another node was overheard
    ///
    /// Learn its route, and if this node appears later on it, offer the
    /// source a shorter route with a gratuitous reply.
    pub(super) fn on_overheard(&mut self, packet: &Packet, from: Address, now: Instant) {
        let Some(header) = &packet.source_route else {
            return;
        };
        self.cache
            .install_route(&header.route, self.config.route_cache_timeout(), now);

        let downstream = header.remaining().any(|a| a == self.address);
        if !downstream || packet.src == self.address {
            return;
        }
        if self.grat_replies.is_held_off(packet.src, from, now) {
            trace!("{}: gratuitous reply to {} held off", self.address, packet.src);
            return;
        }

        let cost = self.link_cost(from);
        let shortened = match header.route.shortcut(from, self.address, cost) {
            Ok(route) => route,
            Err(_) => return,
        };
        let reply_path = match shortened.prefix_to(self.address) {
            Ok(prefix) => prefix.reverse(),
            Err(_) => return,
        };

        debug!(
            "{}: offering {} shorter route {}",
            self.address, packet.src, shortened
        );
        self.grat_replies.insert(packet.src, from, now);
        self.rearm_grat_replies();

        self.stats.rrep_gratuitous += 1;
        self.send_route_reply(reply_path, shortened, now);
    }

    /// Send a reply carrying `route` back along `path`
    fn send_route_reply(&mut self, path: SourceRoute, route: SourceRoute, now: Instant) {
        let packet = Packet::routed(path).with_option(DsrOption::RouteReply { route });
        self.stats.rrep_sent += 1;
        self.send_routed(packet, now);
    }
}
