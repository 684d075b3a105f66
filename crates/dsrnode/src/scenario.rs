//! Scenario driver
//!
//! Builds the medium from the configured topology, spawns a node task per
//! address, schedules link events and traffic flows, then collects what
//! every node delivered or gave up on.

use anyhow::{Context, Result};
use dsr_protocol::{Address, Payload};
use dsr_routing::DsrStats;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{Config, FlowConfig, LinkEvent};
use crate::medium::Medium;
use crate::node::{Command, Node, NodeEvent};

/// Outcome of a scenario run
#[derive(Debug, Default)]
pub struct ScenarioReport {
    /// Payloads handed to source nodes
    pub sent: usize,
    pub delivered: Vec<NodeEvent>,
    pub failed: Vec<NodeEvent>,
    pub stats: BTreeMap<Address, DsrStats>,
    pub elapsed: Duration,
}

impl ScenarioReport {
    /// Fraction of sent payloads that reached their destination
    pub fn delivery_ratio(&self) -> f64 {
        if self.sent == 0 {
            return 0.0;
        }
        self.delivered.len() as f64 / self.sent as f64
    }

    /// Sum of every node's statistics
    pub fn totals(&self) -> DsrStats {
        self.stats.values().fold(DsrStats::default(), |mut acc, s| {
            acc.data_sent += s.data_sent;
            acc.data_delivered += s.data_delivered;
            acc.data_forwarded += s.data_forwarded;
            acc.data_dropped += s.data_dropped;
            acc.rreq_sent += s.rreq_sent;
            acc.rreq_forwarded += s.rreq_forwarded;
            acc.rreq_duplicates += s.rreq_duplicates;
            acc.rrep_sent += s.rrep_sent;
            acc.rrep_cached += s.rrep_cached;
            acc.rrep_gratuitous += s.rrep_gratuitous;
            acc.rerr_sent += s.rerr_sent;
            acc.rerr_received += s.rerr_received;
            acc.acks_sent += s.acks_sent;
            acc.acks_received += s.acks_received;
            acc.retransmissions += s.retransmissions;
            acc.link_breaks += s.link_breaks;
            acc.salvaged += s.salvaged;
            acc.malformed_dropped += s.malformed_dropped;
            acc
        })
    }
}

/// Run the configured scenario to completion
pub async fn run(config: &Config) -> Result<ScenarioReport> {
    run_until(config, std::future::pending()).await
}

/// Run the configured scenario, stopping early when `shutdown` resolves
pub async fn run_until(
    config: &Config,
    shutdown: impl Future<Output = ()>,
) -> Result<ScenarioReport> {
    config.validate()?;
    let scenario = &config.scenario;

    let medium = Medium::new(scenario.promiscuous, scenario.link_feedback);
    for (a, b) in &scenario.links {
        medium.set_link(*a, *b, true).await;
    }

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut nodes = Vec::with_capacity(scenario.nodes.len());
    for (index, address) in scenario.nodes.iter().enumerate() {
        let handle = Node::spawn(
            *address,
            config.node_routing(index),
            medium.clone(),
            events_tx.clone(),
        )
        .await?;
        nodes.push(handle);
    }
    drop(events_tx);

    info!(
        "Scenario started: {} nodes, {} links, {} flows",
        scenario.nodes.len(),
        scenario.links.len(),
        scenario.flows.len()
    );

    let start = Instant::now();
    let sent = Arc::new(AtomicUsize::new(0));
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    for event in &scenario.link_events {
        tasks.push(tokio::spawn(apply_link_event(
            medium.clone(),
            event.clone(),
            start,
        )));
    }

    for (index, flow) in scenario.flows.iter().enumerate() {
        let commands = nodes
            .iter()
            .find(|n| n.address() == flow.src)
            .map(|n| n.commands())
            .with_context(|| format!("No node for flow source {}", flow.src))?;
        let rng = match scenario.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(index as u64)),
            None => StdRng::from_entropy(),
        };
        tasks.push(tokio::spawn(run_flow(
            index as u64,
            flow.clone(),
            commands,
            rng,
            start,
            sent.clone(),
        )));
    }

    tokio::select! {
        _ = sleep(Duration::from_millis(scenario.duration_ms)) => {
            debug!("Scenario duration elapsed");
        }
        _ = shutdown => {
            info!("Scenario interrupted");
        }
    }

    for task in &tasks {
        task.abort();
    }

    let mut report = ScenarioReport {
        elapsed: start.elapsed(),
        ..Default::default()
    };

    for node in nodes {
        let address = node.address();
        match node.shutdown().await {
            Ok(stats) => {
                report.stats.insert(address, stats);
            }
            Err(e) => warn!("{}", e),
        }
    }

    while let Some(event) = events_rx.recv().await {
        match event {
            NodeEvent::Delivered { .. } => report.delivered.push(event),
            NodeEvent::Failed { .. } => report.failed.push(event),
        }
    }
    report.sent = sent.load(Ordering::Relaxed);

    info!(
        "Scenario finished: {} sent, {} delivered, {} failed",
        report.sent,
        report.delivered.len(),
        report.failed.len()
    );

    Ok(report)
}

async fn apply_link_event(medium: Medium, event: LinkEvent, start: Instant) {
    sleep_until(start + Duration::from_millis(event.at_ms)).await;
    info!(
        "Link {} <-> {} going {}",
        event.a,
        event.b,
        if event.up { "up" } else { "down" }
    );
    medium.set_link(event.a, event.b, event.up).await;
}

async fn run_flow(
    index: u64,
    flow: FlowConfig,
    commands: mpsc::Sender<Command>,
    mut rng: StdRng,
    start: Instant,
    sent: Arc<AtomicUsize>,
) {
    let mut ticker = interval_at(
        start + Duration::from_millis(flow.start_ms),
        Duration::from_millis(flow.interval_ms),
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    for seq in 0..flow.count {
        ticker.tick().await;

        let mut data = vec![0u8; flow.size];
        rng.fill_bytes(&mut data);
        // Flow index in the high half keeps ids unique across flows
        let payload = Payload::new((index << 32) | u64::from(seq), data);

        let command = Command::Send {
            dst: flow.dst,
            payload,
        };
        if commands.send(command).await.is_err() {
            debug!("Flow {} -> {} stopped: node gone", flow.src, flow.dst);
            return;
        }
        sent.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_ratio() {
        let mut report = ScenarioReport::default();
        assert_eq!(report.delivery_ratio(), 0.0);

        report.sent = 4;
        for id in 0..3 {
            report.delivered.push(NodeEvent::Delivered {
                at: Address::from_octets(10, 0, 0, 2),
                src: Address::from_octets(10, 0, 0, 1),
                payload: Payload::new(id, Vec::new()),
            });
        }
        assert_eq!(report.delivery_ratio(), 0.75);
    }

    #[test]
    fn test_totals() {
        let mut report = ScenarioReport::default();
        for n in 1..=3u8 {
            report.stats.insert(
                Address::from_octets(10, 0, 0, n),
                DsrStats {
                    rreq_sent: u64::from(n),
                    salvaged: 1,
                    ..Default::default()
                },
            );
        }

        let totals = report.totals();
        assert_eq!(totals.rreq_sent, 6);
        assert_eq!(totals.salvaged, 3);
    }
}
