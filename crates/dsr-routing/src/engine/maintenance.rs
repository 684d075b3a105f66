//! Route maintenance
//!
//! Every unicast transmission is tracked until the next hop acknowledges
//! it. A link that stays silent through `max_maint_rexmt` timeouts, or that
//! the link layer reports as broken, is removed from the cache; upstream
//! sources are told with a route error and the affected packets are
//! salvaged onto alternate routes where possible.

use super::DsrEngine;
use crate::error::DropReason;
use crate::maint_buffer::MaintEntry;
use crate::scheduler::TimerEvent;
use dsr_protocol::{Address, DsrOption, Packet, SourceRoute, SourceRouteHeader};
use std::time::Instant;
use tracing::{debug, trace, warn};

impl DsrEngine {
    /// Hand `packet` to the link layer, tracking it for acknowledgement
    pub(super) fn transmit(&mut self, mut packet: Packet, next_hop: Address, now: Instant) {
        if next_hop.is_broadcast() || !self.config.use_network_layer_ack {
            self.emit(packet, next_hop);
            return;
        }

        packet.remove_ack_request();
        let holdoff = self.config.maint_holdoff_time();
        let ack_request_sent = self.neighbors.ack_request_due(&next_hop, now, holdoff);

        // Within the holdoff the packet rides on the next request's id and
        // is cleared by its cumulative acknowledgement.
        let id = if ack_request_sent {
            let id = self.neighbors.next_ack_id(next_hop, now);
            packet.options.push(DsrOption::AckRequest { id });
            id
        } else {
            self.neighbors.pending_ack_id(next_hop, now)
        };

        let entry = MaintEntry {
            next_hop,
            id,
            packet: packet.clone(),
            retransmits: 0,
            tx_time: now,
            expires: now + self.neighbors.rto(&next_hop),
            ack_request_sent,
        };
        if let Some(refused) = self.maintenance.insert(entry) {
            warn!(
                "{}: maintenance buffer full, sending packet to {} untracked",
                self.address, refused.next_hop
            );
        }

        self.emit(packet, next_hop);
        self.rearm_maintenance();
    }

    pub(super) fn send_ack(&mut self, to: Address, id: u16) {
        let packet = Packet::new(self.address, to).with_option(DsrOption::Ack {
            id,
            from: self.address,
            to,
        });
        self.stats.acks_sent += 1;
        self.emit(packet, to);
    }

    pub(super) fn on_ack(&mut self, acker: Address, id: u16, now: Instant) {
        self.stats.acks_received += 1;
        let acked = self.maintenance.ack(acker, id);
        trace!("{}: ack {} from {} cleared {} packets", self.address, id, acker, acked.len());

        // Only the transmission that carried this request gives an unambiguous
        // round-trip sample
        if let Some(entry) = acked
            .iter()
            .find(|e| e.id == id && e.ack_request_sent && e.retransmits == 0)
        {
            let sample = now.saturating_duration_since(entry.tx_time);
            self.neighbors.update_rtt(acker, sample, now);
        }

        self.rearm_maintenance();
    }

    pub(super) fn on_maintenance_timeout(&mut self, now: Instant) {
        // Requests sent this round; held-off entries ride on them
        let mut asked: Vec<(Address, u16)> = Vec::new();

        while let Some(mut entry) = self.maintenance.pop_expired(now) {
            let known = asked
                .iter()
                .find(|(hop, _)| *hop == entry.next_hop)
                .map(|(_, id)| *id);
            // A held-off entry is covered once a request with its id went out
            let covered = entry.ack_request_sent
                || (known.is_none()
                    && self
                        .neighbors
                        .get(&entry.next_hop)
                        .is_some_and(|n| n.ack_id != entry.id));
            if !covered {
                // Nothing asked for an acknowledgement yet, so this is not a
                // retransmission
                let id = match known {
                    Some(id) => id,
                    None => {
                        let id = self.neighbors.next_ack_id(entry.next_hop, now);
                        debug!(
                            "{}: asking {} to acknowledge held-off packets ({})",
                            self.address, entry.next_hop, id
                        );
                        self.send_ack_request(entry.next_hop, id);
                        asked.push((entry.next_hop, id));
                        id
                    }
                };
                entry.id = id;
                entry.tx_time = now;
                entry.expires = now + self.neighbors.rto(&entry.next_hop);
                entry.ack_request_sent = true;
                self.maintenance.insert(entry);
                continue;
            }

            entry.retransmits += 1;

            if entry.retransmits >= self.config.max_maint_rexmt {
                warn!(
                    "{}: no acknowledgement from {} after {} attempts",
                    self.address, entry.next_hop, entry.retransmits
                );
                self.handle_link_failure(entry.next_hop, Some(entry.packet), now);
                continue;
            }

            let id = self.neighbors.next_ack_id(entry.next_hop, now);
            entry.id = id;
            entry.tx_time = now;
            entry.expires = now + self.neighbors.rto(&entry.next_hop);
            entry.ack_request_sent = true;
            self.stats.retransmissions += 1;
            asked.push((entry.next_hop, id));

            if self.config.retry_packet {
                entry.packet.remove_ack_request();
                entry.packet.options.push(DsrOption::AckRequest { id });
                debug!("{}: retransmitting packet to {}", self.address, entry.next_hop);
                self.emit(entry.packet.clone(), entry.next_hop);
            } else {
                debug!("{}: asking {} for ack {}", self.address, entry.next_hop, id);
                self.send_ack_request(entry.next_hop, id);
            }

            self.maintenance.insert(entry);
        }

        self.rearm_maintenance();
    }

    fn send_ack_request(&mut self, to: Address, id: u16) {
        let packet = Packet::new(self.address, to).with_option(DsrOption::AckRequest { id });
        self.emit(packet, to);
    }

    /// The link to `next_hop` is gone
    ///
    /// Drops it from the cache, notifies the sources of every packet that
    /// was using it and salvages those packets.
    pub(super) fn handle_link_failure(
        &mut self,
        next_hop: Address,
        failed: Option<Packet>,
        now: Instant,
    ) {
        warn!("{}: link to {} broken", self.address, next_hop);
        self.stats.link_breaks += 1;
        self.cache.invalidate_link(self.address, next_hop);
        self.neighbors.remove(&next_hop);

        let mut affected: Vec<Packet> = self
            .maintenance
            .remove_next_hop(next_hop)
            .into_iter()
            .map(|e| e.packet)
            .collect();
        if let Some(packet) = failed {
            if !affected.contains(&packet) {
                affected.push(packet);
            }
        }

        let mut notified: Vec<Address> = Vec::new();
        for packet in &affected {
            let Some(header) = &packet.source_route else {
                continue;
            };
            if packet.src == self.address || notified.contains(&packet.src) {
                continue;
            }
            notified.push(packet.src);

            // Errors that were travelling with packets from this source
            let chained: Vec<DsrOption> = affected
                .iter()
                .filter(|p| p.src == packet.src && p.salvage() < self.config.max_salvage_count)
                .flat_map(|p| p.route_errors().cloned())
                .collect();
            let back = header
                .route
                .prefix_to(self.address)
                .ok()
                .map(|prefix| prefix.reverse());

            self.send_route_error(packet.src, next_hop, header.salvage, chained, back, now);
        }

        for packet in affected {
            self.salvage(packet, now);
        }

        self.rearm_maintenance();
    }

    fn send_route_error(
        &mut self,
        dst: Address,
        unreachable: Address,
        salvage: u8,
        chained: Vec<DsrOption>,
        back: Option<SourceRoute>,
        now: Instant,
    ) {
        let route = match back.or_else(|| self.cache.find_route(self.address, dst, now)) {
            Some(route) => route,
            None => {
                debug!("{}: no route to {} for route error", self.address, dst);
                return;
            }
        };

        let mut packet = Packet::routed(route).with_option(DsrOption::RouteError {
            error_source: self.address,
            error_dest: dst,
            unreachable,
            salvage,
        });
        packet.options.extend(chained);

        debug!(
            "{}: reporting broken link {} -> {} to {}",
            self.address, self.address, unreachable, dst
        );
        self.stats.rerr_sent += 1;
        self.send_routed(packet, now);
    }

    /// Re-route a packet whose next hop failed
    fn salvage(&mut self, mut packet: Packet, now: Instant) {
        let Some(header) = packet.source_route.take() else {
            return;
        };
        packet.remove_ack_request();

        if header.salvage >= self.config.max_salvage_count {
            debug!("{}: packet to {} exhausted its salvage count", self.address, packet.dst);
            self.drop_packet(packet, DropReason::SalvageExhausted);
            return;
        }

        let Some(alternate) = self.cache.find_route(self.address, packet.dst, now) else {
            debug!("{}: no alternate route to {}", self.address, packet.dst);
            self.drop_packet(packet, DropReason::LinkFailure);
            return;
        };

        let route = if packet.src == self.address {
            alternate
        } else {
            match header
                .route
                .prefix_to(self.address)
                .and_then(|prefix| prefix.concatenate(&alternate))
            {
                Ok(route) => route,
                Err(e) => {
                    debug!("{}: cannot splice alternate route: {}", self.address, e);
                    self.drop_packet(packet, DropReason::LinkFailure);
                    return;
                }
            }
        };

        let Some(position) = route.position(self.address) else {
            self.drop_packet(packet, DropReason::LinkFailure);
            return;
        };

        debug!("{}: salvaging packet for {} via {}", self.address, packet.dst, route);
        let segments_left = route.num_hops().saturating_sub(position);
        packet.source_route = Some(SourceRouteHeader {
            route,
            segments_left,
            salvage: header.salvage + 1,
        });
        self.stats.salvaged += 1;
        self.send_routed(packet, now);
    }

    pub(super) fn on_route_error(&mut self, error_source: Address, unreachable: Address) {
        self.stats.rerr_received += 1;
        debug!(
            "{}: route error, {} cannot reach {}",
            self.address, error_source, unreachable
        );
        self.cache.invalidate_link(error_source, unreachable);

        let purged = self.maintenance.remove_destination(unreachable);
        if !purged.is_empty() {
            self.rearm_maintenance();
        }
    }

    fn rearm_maintenance(&mut self) {
        match self.maintenance.next_expiry() {
            Some(at) => self.scheduler.schedule(TimerEvent::Maintenance, at),
            None => {
                self.scheduler.cancel(TimerEvent::Maintenance);
            }
        }
    }
}
