//! A cluster of [Node]s sharing one genesis and one pipe fabric.

use crate::{
    genesis::{validators, Genesis, Validator, DEFAULT_BALANCE},
    monitor::{self, Monitor},
    deadline::Deadline,
    node::{self, Node},
    pipe::{self, Fabric},
    sim,
    types::Hash,
};
use commonware_runtime::{Clock, Metrics, Spawner};
use std::ops::{Index, IndexMut};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur when operating a [Network].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("node {index}: {source}")]
    Node { index: usize, source: node::Error },
    #[error("monitor: {0}")]
    Monitor(#[from] monitor::Error),
}

/// Configuration for a [Network].
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of validators.
    pub nodes: usize,

    /// Seed used to derive validator keys.
    pub seed: u64,

    /// Genesis balance of every validator.
    pub balance: u64,

    pub chain_id: u64,

    /// Seconds between blocks.
    pub block_period: u64,

    pub min_gas_price: u64,

    /// Whether to start every node on creation.
    pub start: bool,

    pub pipe: pipe::Config,
    pub sim: sim::Config,
    pub monitor: monitor::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nodes: 4,
            seed: 0,
            balance: DEFAULT_BALANCE,
            chain_id: 1337,
            block_period: 1,
            min_gas_price: 1,
            start: true,
            pipe: pipe::Config::default(),
            sim: sim::Config::default(),
            monitor: monitor::Config::default(),
        }
    }
}

/// An ordered set of validators connected through the same [Fabric].
pub struct Network<E: Spawner + Clock + Metrics> {
    context: E,
    genesis: Genesis,
    nodes: Vec<Node<E>>,
    monitor: Monitor<E>,
}

impl<E: Spawner + Clock + Metrics> Network<E> {
    /// Generate `cfg.nodes` validators from `cfg.seed` and build a network of them.
    pub fn new(context: E, cfg: Config) -> Result<Self, Error> {
        let validators = validators(cfg.nodes, cfg.seed, cfg.balance);
        Self::from_validators(context, validators, cfg)
    }

    /// Build a network of `validators`, in order. `cfg.nodes`, `cfg.seed` and
    /// `cfg.balance` are ignored.
    pub fn from_validators(
        context: E,
        validators: Vec<Validator>,
        cfg: Config,
    ) -> Result<Self, Error> {
        let genesis = Genesis::new(
            cfg.chain_id,
            cfg.block_period,
            cfg.min_gas_price,
            &validators,
        );
        let fabric = Fabric::new(context.clone(), cfg.pipe.clone());
        let nodes = validators
            .into_iter()
            .enumerate()
            .map(|(id, validator)| {
                Node::new(
                    context.clone(),
                    id,
                    validator,
                    genesis.clone(),
                    fabric.clone(),
                    cfg.sim.clone(),
                )
            })
            .collect();
        let monitor = Monitor::new(
            context.with_label("monitor"),
            monitor::Config {
                block_period: cfg.block_period,
                ..cfg.monitor
            },
        );

        let mut network = Self {
            context,
            genesis,
            nodes,
            monitor,
        };
        if cfg.start {
            network.start()?;
        }
        Ok(network)
    }

    /// Start every node that is not running.
    pub fn start(&mut self) -> Result<(), Error> {
        for node in self.nodes.iter_mut().filter(|node| !node.is_running()) {
            node.start().map_err(|source| Error::Node {
                index: node.id(),
                source,
            })?;
        }
        info!(nodes = self.nodes.len(), "network started");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node<E>> {
        self.nodes.iter()
    }

    pub fn nodes(&self) -> &[Node<E>] {
        &self.nodes
    }

    pub fn genesis(&self) -> &Genesis {
        &self.genesis
    }

    /// Nodes that are currently running.
    pub fn running(&self) -> impl Iterator<Item = &Node<E>> {
        self.nodes.iter().filter(|node| node.is_running())
    }

    /// Wait until every running node has seen every hash in `hashes` included.
    ///
    /// Nodes are awaited one after the other. Stopped nodes are skipped, as they
    /// are by the monitor waits; use [Node::await_transactions] to require a
    /// specific node, which fails with [node::Error::NotRunning] if it is stopped.
    pub async fn await_transactions(&self, hashes: &[Hash], deadline: &Deadline) -> Result<(), Error> {
        for node in &self.nodes {
            if !node.is_running() {
                debug!(node = node.id(), "skipping stopped node");
                continue;
            }
            node.await_transactions(hashes, deadline)
                .await
                .map_err(|source| Error::Node {
                    index: node.id(),
                    source,
                })?;
        }
        Ok(())
    }

    pub async fn wait_for_sync_complete(&self, deadline: &Deadline) -> Result<(), Error> {
        Ok(self
            .monitor
            .wait_for_sync_complete(&self.nodes, deadline)
            .await?)
    }

    pub async fn wait_for_network_to_start_mining(&self, deadline: &Deadline) -> Result<(), Error> {
        Ok(self
            .monitor
            .wait_for_network_to_start_mining(&self.nodes, deadline)
            .await?)
    }

    pub async fn wait_to_mine_n_blocks(
        &self,
        n: u64,
        deadline: &Deadline,
        verify_rate: bool,
    ) -> Result<(), Error> {
        Ok(self
            .monitor
            .wait_to_mine_n_blocks(&self.nodes, n, deadline, verify_rate)
            .await?)
    }

    pub async fn wait_for_height(&self, height: u64, deadline: &Deadline) -> Result<(), Error> {
        Ok(self
            .monitor
            .wait_for_height(&self.nodes, height, deadline)
            .await?)
    }

    /// Close every running node. Failures are logged and do not stop the others.
    pub fn shutdown(&mut self) {
        for node in self.nodes.iter_mut().filter(|node| node.is_running()) {
            if let Err(err) = node.close() {
                warn!(node = node.id(), error = ?err, "unable to close node");
            }
        }
        info!("network shut down");
    }

    /// Encode every metric registered by the network in the text exposition format.
    pub fn metrics(&self) -> String {
        self.context.encode()
    }
}

impl<E: Spawner + Clock + Metrics> Index<usize> for Network<E> {
    type Output = Node<E>;

    fn index(&self, index: usize) -> &Node<E> {
        &self.nodes[index]
    }
}

impl<E: Spawner + Clock + Metrics> IndexMut<usize> for Network<E> {
    fn index_mut(&mut self, index: usize) -> &mut Node<E> {
        &mut self.nodes[index]
    }
}

impl<E: Spawner + Clock + Metrics> Drop for Network<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner};
    use std::time::Duration;

    fn config(nodes: usize) -> Config {
        Config {
            nodes,
            seed: 7,
            ..Default::default()
        }
    }

    #[test_traced]
    fn test_new_starts_every_node() {
        let executor = deterministic::Runner::timed(Duration::from_secs(10));
        executor.start(|context| async move {
            let network = Network::new(context, config(3)).unwrap();
            assert_eq!(network.len(), 3);
            assert_eq!(network.running().count(), 3);
            assert_eq!(network.genesis().validators.len(), 3);
            for (index, node) in network.iter().enumerate() {
                assert_eq!(node.id(), index);
                assert_eq!(network.genesis().validators[index].identity, *node.identity());
            }
        });
    }

    #[test_traced]
    fn test_created_stopped() {
        let executor = deterministic::Runner::timed(Duration::from_secs(30));
        executor.start(|context| async move {
            let mut network = Network::new(
                context.clone(),
                Config {
                    start: false,
                    ..config(2)
                },
            )
            .unwrap();
            assert_eq!(network.running().count(), 0);
            let deadline = Deadline::after(&context, Duration::from_secs(5));
            assert_eq!(
                network.wait_for_network_to_start_mining(&deadline).await,
                Err(Error::Monitor(monitor::Error::NoRunningNodes))
            );
            assert_eq!(network.wait_for_height(10, &deadline).await, Ok(()));

            network.start().unwrap();
            let deadline = Deadline::after(&context, Duration::from_secs(10));
            network.wait_for_network_to_start_mining(&deadline).await.unwrap();
        });
    }

    #[test_traced]
    fn test_await_transactions_on_every_node() {
        let executor = deterministic::Runner::timed(Duration::from_secs(30));
        executor.start(|context| async move {
            let mut network = Network::new(context.clone(), config(2)).unwrap();
            let recipient = Address([3u8; 20]);
            let hash = network[0].send_value(&recipient, 42).unwrap();
            let deadline = Deadline::after(&context, Duration::from_secs(10));
            network.await_transactions(&[hash], &deadline).await.unwrap();
            for node in network.iter() {
                assert!(node.processed_tx_block(&hash).is_some());
                assert_eq!(node.balance(&recipient).unwrap(), 42);
            }
        });
    }

    #[test_traced]
    fn test_await_transactions_skips_stopped_nodes() {
        let executor = deterministic::Runner::timed(Duration::from_secs(30));
        executor.start(|context| async move {
            let mut network = Network::new(context.clone(), config(3)).unwrap();
            network[2].close().unwrap();
            let recipient = Address([3u8; 20]);
            let hash = network[0].send_value(&recipient, 7).unwrap();
            let deadline = Deadline::after(&context, Duration::from_secs(10));
            network.await_transactions(&[hash], &deadline).await.unwrap();
            assert!(network[1].processed_tx_block(&hash).is_some());

            // Awaiting the stopped node directly reports it.
            assert_eq!(
                network[2].await_transactions(&[hash], &deadline).await,
                Err(node::Error::NotRunning(2))
            );
        });
    }

    #[test_traced]
    fn test_await_transactions_deadline() {
        let executor = deterministic::Runner::timed(Duration::from_secs(10));
        executor.start(|context| async move {
            let network = Network::new(context.clone(), config(1)).unwrap();
            let deadline = Deadline::after(&context, Duration::from_secs(3));
            assert_eq!(
                network.await_transactions(&[Hash([1u8; 32])], &deadline).await,
                Err(Error::Node {
                    index: 0,
                    source: node::Error::Tracker(crate::tracker::Error::DeadlineExceeded),
                })
            );
        });
    }

    #[test_traced]
    fn test_shutdown_and_metrics() {
        let executor = deterministic::Runner::timed(Duration::from_secs(30));
        executor.start(|context| async move {
            let mut network = Network::new(context.clone(), config(2)).unwrap();
            let deadline = Deadline::after(&context, Duration::from_secs(10));
            network.wait_for_height(2, &deadline).await.unwrap();

            let metrics = network.metrics();
            assert!(metrics.contains("node_0_blocks_imported"));
            assert!(metrics.contains("execution_dials"));

            network.shutdown();
            assert_eq!(network.running().count(), 0);
            assert!(network[0].chain_height().is_err());
        });
    }
}
