//! Multi-node integration tests
//!
//! Several engines wired together through the in-memory network in
//! `common`:
//! - Discovery and delivery across a chain
//! - Cached and gratuitous replies
//! - Link failures detected by the link layer and by missing acks
//! - Salvage onto alternate routes
//! - Discovery giving up

mod common;

use common::{addr, nodes, TestNetwork};
use dsr_routing::{CacheStrategy, DropReason, DsrConfig};
use std::time::Duration;

fn create_test_config() -> DsrConfig {
    DsrConfig {
        tie_break_seed: Some(42),
        ..Default::default()
    }
}

#[test]
fn test_discovery_and_delivery_over_chain() {
    let mut net = TestNetwork::chain(create_test_config(), &[1, 2, 3, 4]);

    net.send(1, 4, 1);
    net.run_for(Duration::from_secs(1));

    let delivered = net.delivered_to(4);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].src, addr(1));
    assert_eq!(delivered[0].payload.id, 1);

    let now = net.now;
    let route = net.engine_mut(1).find_route(addr(4), now).unwrap();
    assert_eq!(nodes(&route), vec![1, 2, 3, 4]);
    assert!(!net.engine(1).is_discovering(addr(4)));
    assert_eq!(net.engine(1).buffered(), 0);
    assert_eq!(net.engine(4).stats().rrep_sent, 1);
    assert!(net.failed.is_empty());

    // Every hop acknowledged its packets
    for id in 1..=4 {
        assert_eq!(net.engine(id).unacknowledged(), 0);
    }
}

#[test]
fn test_reverse_route_needs_no_discovery() {
    let mut net = TestNetwork::chain(create_test_config(), &[1, 2, 3, 4]);

    net.send(1, 4, 1);
    net.run_for(Duration::from_secs(1));
    net.send(4, 1, 2);
    net.run_for(Duration::from_secs(1));

    assert_eq!(net.delivered_to(1).len(), 1);
    assert_eq!(net.engine(4).stats().rreq_sent, 0);
}

#[test]
fn test_expanding_ring_search() {
    let config = DsrConfig {
        ttl_start: 1,
        ..create_test_config()
    };
    let mut net = TestNetwork::chain(config, &[1, 2, 3]);

    net.send(1, 3, 1);
    net.run_for(Duration::from_secs(1));

    assert_eq!(net.delivered_to(3).len(), 1);
    // The non-propagating request dies at the first hop
    assert_eq!(net.engine(1).stats().rreq_sent, 2);
}

#[test]
fn test_intermediate_answers_from_cache() {
    let mut net = TestNetwork::chain(create_test_config(), &[1, 2, 3, 4]);
    net.add_node(5);
    net.add_link(2, 5);

    net.send(1, 4, 1);
    net.run_for(Duration::from_secs(1));

    net.send(5, 4, 2);
    net.run_for(Duration::from_secs(1));

    let delivered = net.delivered_to(4);
    assert_eq!(delivered.len(), 2);
    assert!(delivered.iter().any(|d| d.src == addr(5)));
    assert_eq!(net.engine(2).stats().rrep_cached, 1);
    assert_eq!(net.engine(4).stats().rrep_sent, 1);
}

#[test]
fn test_discovery_gives_up() {
    let config = DsrConfig {
        max_request_rexmt: 3,
        request_period_ms: 100,
        max_request_period_ms: 400,
        ..create_test_config()
    };
    let mut net = TestNetwork::chain(config, &[1, 2]);

    net.send(1, 9, 7);
    net.run_for(Duration::from_secs(5));

    let failed = net.failed_at(1);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].dst, addr(9));
    assert_eq!(failed[0].payload.id, 7);
    assert_eq!(failed[0].reason, DropReason::DiscoveryFailed);
    assert_eq!(net.engine(1).stats().rreq_sent, 4);
    assert!(!net.engine(1).is_discovering(addr(9)));
    assert!(net.engine(1).poll_timeout().is_none());
}

#[test]
fn test_link_break_salvages_onto_alternate_route() {
    let config = DsrConfig {
        rrep_destination_only: true,
        ..create_test_config()
    };
    let mut net = TestNetwork::new(config);
    for id in 1..=5 {
        net.add_node(id);
    }
    net.add_link(1, 2);
    net.add_link(2, 3);
    net.add_link(3, 5);
    net.add_link(2, 4);
    net.add_link(4, 5);
    net.promiscuous = true;

    net.send(1, 5, 1);
    net.run_for(Duration::from_secs(1));

    let now = net.now;
    let route = nodes(&net.engine_mut(1).find_route(addr(5), now).unwrap());
    assert_eq!(route.len(), 4);
    let used = route[2];
    let other = if used == 3 { 4 } else { 3 };

    // 2 overhears the other branch talking to 5 directly
    net.send(other, 5, 2);
    net.run_for(Duration::from_secs(1));
    assert_eq!(net.delivered_to(5).len(), 2);

    net.remove_link(2, used);
    net.send(1, 5, 3);
    net.run_for(Duration::from_secs(1));

    let delivered = net.delivered_to(5);
    assert_eq!(delivered.len(), 3);
    assert!(delivered.iter().any(|d| d.payload.id == 3));

    let stats = net.engine(2).stats();
    assert_eq!(stats.salvaged, 1);
    assert_eq!(stats.rerr_sent, 1);
    assert!(stats.link_breaks >= 1);
    assert_eq!(net.engine(1).stats().rerr_received, 1);

    // The source no longer routes over the broken link
    let now = net.now;
    let route = nodes(&net.engine_mut(1).find_route(addr(5), now).unwrap());
    assert_eq!(route, vec![1, 2, other, 5]);
    assert!(net.failed.is_empty());
}

#[test]
fn test_missing_acks_break_link() {
    let mut net = TestNetwork::chain(create_test_config(), &[1, 2, 3]);
    net.link_feedback = false;

    net.send(1, 3, 1);
    net.run_for(Duration::from_secs(1));
    assert_eq!(net.delivered_to(3).len(), 1);

    net.remove_link(2, 3);
    net.send(1, 3, 2);
    net.run_for(Duration::from_secs(5));

    assert_eq!(net.delivered_to(3).len(), 1);

    let stats = net.engine(2).stats();
    assert_eq!(stats.link_breaks, 1);
    assert_eq!(stats.retransmissions, 1);
    assert_eq!(stats.rerr_sent, 1);
    assert_eq!(stats.data_dropped, 1);

    // The source heard about the break, and its own hop was acknowledged
    assert_eq!(net.engine(1).stats().rerr_received, 1);
    assert!(net.failed.is_empty());
    let now = net.now;
    assert!(net.engine_mut(1).find_route(addr(3), now).is_none());
}

#[test]
fn test_source_reports_unreachable_first_hop() {
    let mut net = TestNetwork::chain(create_test_config(), &[1, 2, 3]);

    net.send(1, 3, 1);
    net.run_for(Duration::from_secs(1));

    net.remove_link(1, 2);
    net.send(1, 3, 2);
    net.run_for(Duration::from_secs(1));

    let failed = net.failed_at(1);
    assert!(failed
        .iter()
        .any(|f| f.payload.id == 2 && f.reason == DropReason::LinkFailure));
    assert_eq!(net.engine(1).stats().link_breaks, 1);
}

#[test]
fn test_gratuitous_reply_shortens_route() {
    let mut net = TestNetwork::chain(create_test_config(), &[1, 2, 3, 4]);
    net.promiscuous = true;

    net.send(1, 4, 1);
    net.run_for(Duration::from_secs(1));
    let now = net.now;
    let route = nodes(&net.engine_mut(1).find_route(addr(4), now).unwrap());
    assert_eq!(route, vec![1, 2, 3, 4]);

    // 3 moves into range of 1 and overhears its next transmission
    net.add_link(1, 3);
    net.send(1, 4, 2);
    net.run_for(Duration::from_secs(1));

    assert_eq!(net.engine(3).stats().rrep_gratuitous, 1);
    let now = net.now;
    let route = nodes(&net.engine_mut(1).find_route(addr(4), now).unwrap());
    assert_eq!(route, vec![1, 3, 4]);

    net.send(1, 4, 3);
    net.run_for(Duration::from_secs(1));
    assert_eq!(net.delivered_to(4).len(), 3);
}

#[test]
fn test_path_cache_end_to_end() {
    let config = DsrConfig {
        cache_strategy: CacheStrategy::PathCache,
        ..create_test_config()
    };
    let mut net = TestNetwork::chain(config, &[1, 2, 3, 4]);

    net.send(1, 4, 1);
    net.run_for(Duration::from_secs(1));
    net.send(4, 1, 2);
    net.run_for(Duration::from_secs(1));

    assert_eq!(net.delivered_to(4).len(), 1);
    assert_eq!(net.delivered_to(1).len(), 1);
    assert_eq!(net.engine(4).stats().rreq_sent, 0);

    let now = net.now;
    let route = nodes(&net.engine_mut(1).find_route(addr(4), now).unwrap());
    assert_eq!(route, vec![1, 2, 3, 4]);
}

#[test]
fn test_buffered_packets_released_in_order() {
    let mut net = TestNetwork::chain(create_test_config(), &[1, 2, 3]);

    for id in 1..=3 {
        net.send(1, 3, id);
    }
    assert_eq!(net.engine(1).buffered(), 3);
    net.run_for(Duration::from_secs(1));

    let ids: Vec<u64> = net.delivered_to(3).iter().map(|d| d.payload.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(net.engine(1).stats().rreq_sent, 1);
}
