use anyhow::{Context, Result};
use dsr_protocol::{Address, Payload};
use dsr_routing::{DropReason, DsrConfig, DsrEngine, DsrStats, Output};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::medium::{Frame, Medium};

const INBOX_CAPACITY: usize = 1024;
const COMMAND_CAPACITY: usize = 64;

/// Instruction for a running node
#[derive(Debug)]
pub enum Command {
    Send { dst: Address, payload: Payload },
    FlushCache,
    Shutdown,
}

/// Upper-layer outcome reported by a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Delivered {
        at: Address,
        src: Address,
        payload: Payload,
    },
    Failed {
        at: Address,
        dst: Address,
        payload: Payload,
        reason: DropReason,
    },
}

/// Handle to a node task
pub struct NodeHandle {
    address: Address,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<DsrStats>,
}

impl NodeHandle {
    pub fn address(&self) -> Address {
        self.address
    }

    /// Sender for issuing commands from other tasks
    pub fn commands(&self) -> mpsc::Sender<Command> {
        self.commands.clone()
    }

    pub async fn send(&self, dst: Address, payload: Payload) -> Result<()> {
        self.commands
            .send(Command::Send { dst, payload })
            .await
            .context("Node is not running")
    }

    pub async fn flush_cache(&self) -> Result<()> {
        self.commands
            .send(Command::FlushCache)
            .await
            .context("Node is not running")
    }

    /// Stop the node and return its final statistics
    pub async fn shutdown(self) -> Result<DsrStats> {
        // The task may already have stopped; its stats are still returned
        let _ = self.commands.send(Command::Shutdown).await;
        self.task
            .await
            .with_context(|| format!("Node {} task failed", self.address))
    }
}

/// One DSR node: an engine driven by its radio, its commands and its timers
pub struct Node {
    engine: DsrEngine,
    medium: Medium,
    inbox: mpsc::Receiver<Frame>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl Node {
    /// Attach a node to `medium` and start its task
    pub async fn spawn(
        address: Address,
        config: DsrConfig,
        medium: Medium,
        events: mpsc::UnboundedSender<NodeEvent>,
    ) -> Result<NodeHandle> {
        let engine = DsrEngine::new(address, config)
            .with_context(|| format!("Invalid routing configuration for {}", address))?;
        let inbox = medium.attach(address, INBOX_CAPACITY).await;
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);

        let node = Node {
            engine,
            medium,
            inbox,
            commands: rx,
            events,
        };
        let task = tokio::spawn(node.run());

        Ok(NodeHandle {
            address,
            commands: tx,
            task,
        })
    }

    async fn run(mut self) -> DsrStats {
        let address = self.engine.address();
        debug!("{}: node running", address);

        loop {
            let deadline = self.engine.poll_timeout().map(Instant::from_std);

            tokio::select! {
                frame = self.inbox.recv() => match frame {
                    Some(Frame::Received { packet, from, hw_addr }) => {
                        self.engine.on_frame_received(packet, from, hw_addr, now());
                    }
                    Some(Frame::LinkBroken { next_hop, packet }) => {
                        self.engine.on_link_break(next_hop, Some(packet), now());
                    }
                    None => break,
                },
                command = self.commands.recv() => match command {
                    Some(Command::Send { dst, payload }) => self.engine.send(dst, payload, now()),
                    Some(Command::FlushCache) => self.engine.flush_route_cache(),
                    Some(Command::Shutdown) | None => break,
                },
                _ = sleep_until_deadline(deadline) => self.engine.handle_timeout(now()),
            }

            self.flush_outputs().await;
        }

        self.medium.detach(address).await;
        let stats = self.engine.stats();
        info!(
            "{}: stopped (sent {}, delivered {}, forwarded {}, dropped {})",
            address, stats.data_sent, stats.data_delivered, stats.data_forwarded, stats.data_dropped
        );
        stats
    }

    async fn flush_outputs(&mut self) {
        let address = self.engine.address();

        while let Some(output) = self.engine.poll_output() {
            match output {
                Output::Transmit { packet, next_hop } => {
                    self.medium.transmit(address, packet, next_hop).await;
                }
                Output::Deliver { src, payload } => {
                    debug!("{}: delivered packet {} from {}", address, payload.id, src);
                    self.report(NodeEvent::Delivered {
                        at: address,
                        src,
                        payload,
                    });
                }
                Output::DeliverFailed {
                    dst,
                    payload,
                    reason,
                } => {
                    warn!("{}: packet {} to {} failed: {}", address, payload.id, dst, reason);
                    self.report(NodeEvent::Failed {
                        at: address,
                        dst,
                        payload,
                        reason,
                    });
                }
            }
        }
    }

    fn report(&self, event: NodeEvent) {
        if self.events.send(event).is_err() {
            debug!("{}: no one is listening for node events", self.engine.address());
        }
    }
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(n: u8) -> Address {
        Address::from_octets(10, 0, 0, n)
    }

    async fn create_test_chain(n: u8) -> (Medium, Vec<NodeHandle>, mpsc::UnboundedReceiver<NodeEvent>) {
        let medium = Medium::new(false, true);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut handles = Vec::new();
        for id in 1..=n {
            let config = DsrConfig {
                tie_break_seed: Some(u64::from(id)),
                ..Default::default()
            };
            handles.push(
                Node::spawn(addr(id), config, medium.clone(), events_tx.clone())
                    .await
                    .unwrap(),
            );
            if id > 1 {
                medium.set_link(addr(id - 1), addr(id), true).await;
            }
        }

        (medium, handles, events_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_across_chain() {
        let (_medium, handles, mut events) = create_test_chain(3).await;

        handles[0]
            .send(addr(3), Payload::new(1, b"hello".to_vec()))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            NodeEvent::Delivered {
                at: addr(3),
                src: addr(1),
                payload: Payload::new(1, b"hello".to_vec()),
            }
        );

        let mut stats = Vec::new();
        for handle in handles {
            stats.push(handle.shutdown().await.unwrap());
        }
        assert_eq!(stats[0].data_sent, 1);
        assert_eq!(stats[1].data_forwarded, 1);
        assert_eq!(stats[2].data_delivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_destination_fails() {
        let (_medium, handles, mut events) = create_test_chain(2).await;

        handles[0]
            .send(addr(9), Payload::new(7, b"lost".to_vec()))
            .await
            .unwrap();

        // Discovery gives up well before the send buffer timeout
        let event = tokio::time::timeout(Duration::from_secs(120), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            NodeEvent::Failed { reason: DropReason::DiscoveryFailed, .. }
                | NodeEvent::Failed { reason: DropReason::SendBufferTimeout, .. }
        ));

        for handle in handles {
            handle.shutdown().await.unwrap();
        }
    }
}
