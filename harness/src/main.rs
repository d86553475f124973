use anyhow::{bail, Context};
use clap::{value_parser, Arg, ArgAction, Command};
use cluster_harness::{
    deadline::Deadline,
    network::{self, Network},
    types::{Address, Hash},
};
use commonware_runtime::{tokio, Clock, Metrics, Runner, Spawner};
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// A cluster run, as read from a YAML file or assembled from flags.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
struct Scenario {
    nodes: usize,
    seed: u64,
    block_period: u64,
    transfers: usize,
    value: u64,
    blocks: u64,
    timeout_secs: u64,
    verify_rate: bool,
    stop_node: Option<usize>,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            nodes: 4,
            seed: 0,
            block_period: 1,
            transfers: 10,
            value: 1_000,
            blocks: 5,
            timeout_secs: 60,
            verify_rate: false,
            stop_node: None,
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Parse arguments
    let matches = Command::new("cluster-harness")
        .about("run a scenario against an in-process validator cluster")
        .arg(
            Arg::new("config")
                .long("config")
                .help("YAML scenario file (overrides the other scenario flags)"),
        )
        .arg(
            Arg::new("nodes")
                .long("nodes")
                .default_value("4")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .default_value("0")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("transfers")
                .long("transfers")
                .default_value("10")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("blocks")
                .long("blocks")
                .default_value("5")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .help("seconds allowed for each wait")
                .default_value("60")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("stop-node")
                .long("stop-node")
                .help("index of a node to stop and restart after mining")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("verify-rate")
                .long("verify-rate")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("emit logs as JSON")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    // Create logger
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if matches.get_flag("json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_line_number(true)
            .with_file(true)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Load scenario
    let scenario = match matches.get_one::<String>("config") {
        Some(path) => {
            let file = std::fs::read_to_string(path)
                .with_context(|| format!("could not read scenario file {path}"))?;
            serde_yaml::from_str::<Scenario>(&file).context("could not parse scenario file")?
        }
        None => Scenario {
            nodes: *matches.get_one::<usize>("nodes").unwrap_or(&4),
            seed: *matches.get_one::<u64>("seed").unwrap_or(&0),
            transfers: *matches.get_one::<usize>("transfers").unwrap_or(&10),
            blocks: *matches.get_one::<u64>("blocks").unwrap_or(&5),
            timeout_secs: *matches.get_one::<u64>("timeout").unwrap_or(&60),
            stop_node: matches.get_one::<usize>("stop-node").copied(),
            verify_rate: matches.get_flag("verify-rate"),
            ..Default::default()
        },
    };
    if scenario.nodes == 0 {
        bail!("scenario needs at least one node");
    }
    if let Some(index) = scenario.stop_node {
        if index >= scenario.nodes {
            bail!("cannot stop node {index} of {}", scenario.nodes);
        }
    }
    info!(?scenario, "loaded scenario");

    // Start runtime
    let executor = tokio::Runner::default();
    executor.start(|context| run(context, scenario))
}

async fn run<E: Spawner + Clock + Metrics>(context: E, scenario: Scenario) -> anyhow::Result<()> {
    let timeout = Duration::from_secs(scenario.timeout_secs);
    let mut network = Network::new(
        context.clone(),
        network::Config {
            nodes: scenario.nodes,
            seed: scenario.seed,
            block_period: scenario.block_period,
            ..Default::default()
        },
    )?;

    // Wait for the first blocks
    network
        .wait_for_network_to_start_mining(&Deadline::after(&context, timeout))
        .await
        .context("network did not start mining")?;
    info!(nodes = network.len(), "network is mining");

    // Send transfers round-robin to an address outside the validator set
    let recipient = Address([0xaa; 20]);
    let mut hashes: Vec<Hash> = Vec::with_capacity(scenario.transfers);
    for i in 0..scenario.transfers {
        let index = i % network.len();
        let hash = network[index].send_value(&recipient, scenario.value)?;
        hashes.push(hash);
    }
    network
        .await_transactions(&hashes, &Deadline::after(&context, timeout))
        .await
        .context("transfers were not included")?;
    info!(transfers = hashes.len(), "transfers included");

    // Check progress
    network
        .wait_to_mine_n_blocks(
            scenario.blocks,
            &Deadline::after(&context, timeout),
            scenario.verify_rate,
        )
        .await
        .context("network stalled")?;
    info!(blocks = scenario.blocks, "mined blocks");

    // Stop and restart a node
    if let Some(index) = scenario.stop_node {
        network[index].close()?;
        info!(node = index, "stopped node");
        network
            .wait_to_mine_n_blocks(scenario.blocks, &Deadline::after(&context, timeout), false)
            .await
            .context("network stalled without stopped node")?;
        network[index].start()?;
        info!(node = index, "restarted node");
        network
            .wait_for_sync_complete(&Deadline::after(&context, timeout))
            .await
            .context("restarted node did not sync")?;
        network
            .wait_for_network_to_start_mining(&Deadline::after(&context, timeout))
            .await
            .context("network did not resume mining")?;
    }

    // Summarize
    for node in network.iter() {
        match node.chain_height() {
            Ok(height) => info!(node = node.id(), height, "final height"),
            Err(err) => warn!(node = node.id(), error = ?err, "unable to read height"),
        }
    }
    let received = network[0].balance(&recipient)?;
    info!(%recipient, received, "recipient balance");
    if let Some(hash) = hashes.first() {
        info!(%hash, fee = network[0].tx_fee(hash)?, "first transfer fee");
    }
    println!("{}", network.metrics());
    network.shutdown();
    Ok(())
}
