//! SPoS Local Network Simulator
//!
//! Wires a set of validators of one shard to an in-process network and runs
//! consensus rounds on the wall clock, printing what every round committed.
//!
//! ## Usage
//!
//! ```bash
//! # Four validators, groups of three, half-second rounds
//! spos-sim --validators 4 --group-size 3 --round-ms 500 --rounds 20
//!
//! # Settings from a TOML file, one validator offline
//! spos-sim --config spos.toml --offline 2
//! ```

use alloy_primitives::Bytes;
use chrono::TimeDelta;
use clap::Parser;
use reth_consensus_spos::{
    block::BlockHeader,
    broadcast::LocalNetwork,
    factory::{build_consensus_node_with_span, ConsensusNode, ConsensusNodeArgs},
    hashing::hasher_for,
    sharding::{
        ChainParameters, ChainParametersHolder, EpochNodesConfig, IndexHashedNodesCoordinator,
        IndexHashedNodesCoordinatorArgs, NodesCoordinatorHandle, ShardCoordinator, Validator,
    },
    shard_name,
    signing::{BlsKeyPair, KeysHandler},
    RoundOutcome, SposConfig, SyncTimer, SystemSyncTimer,
};
use std::{collections::BTreeMap, path::PathBuf, sync::Arc};
use tracing::{info, info_span, warn};
use tracing_subscriber::EnvFilter;

/// SPoS simulator CLI
#[derive(Debug, Parser)]
#[command(name = "spos-sim")]
#[command(about = "Run SPoS consensus rounds over a local network")]
struct Cli {
    /// Number of validators in the shard
    #[arg(long, default_value = "4")]
    validators: usize,

    /// Consensus group size
    #[arg(long, default_value = "3")]
    group_size: u32,

    /// Round duration in milliseconds, overrides the config file
    #[arg(long)]
    round_ms: Option<u64>,

    /// Rounds to run
    #[arg(long, default_value = "10")]
    rounds: usize,

    /// Shard the validators belong to
    #[arg(long, default_value = "0")]
    shard: u32,

    /// Consensus settings in TOML
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Validators kept off the network, by position
    #[arg(long, value_delimiter = ',')]
    offline: Vec<usize>,
}

impl Cli {
    fn spos_config(&self) -> eyre::Result<SposConfig> {
        let mut config = match &self.config {
            Some(path) => SposConfig::load(path)?,
            None => SposConfig::default().with_round_duration_ms(500),
        };
        if let Some(round_ms) = self.round_ms {
            config = config.with_round_duration_ms(round_ms);
        }
        config.validate()?;
        Ok(config)
    }
}

/// Validators of one shard joined to a local network
#[derive(Debug)]
struct Simulation {
    network: Arc<LocalNetwork>,
    nodes: Vec<Arc<ConsensusNode>>,
}

impl Simulation {
    /// Wire `cli.validators` nodes, registry known for `epochs` epochs
    ///
    /// The clock starts at the beginning of round 1.
    fn new(
        cli: &Cli,
        config: SposConfig,
        epochs: u32,
        sync_timer: Arc<dyn SyncTimer>,
    ) -> eyre::Result<Self> {
        if cli.validators < cli.group_size as usize {
            eyre::bail!(
                "{} validators cannot fill consensus groups of {}",
                cli.validators,
                cli.group_size
            );
        }
        let keys = (1..=cli.validators)
            .map(|i| BlsKeyPair::from_seed(&(i as u64).to_be_bytes().repeat(4)))
            .collect::<Result<Vec<_>, _>>()?;
        let validators = keys
            .iter()
            .enumerate()
            .map(|(i, key)| Ok(Arc::new(Validator::new(key.public_key().clone(), 1, i as u32)?)))
            .collect::<eyre::Result<Vec<_>>>()?;
        let nodes_config = EpochNodesConfig {
            num_shards: 1,
            eligible: BTreeMap::from([(cli.shard, validators)]),
            ..Default::default()
        };

        let round_duration = TimeDelta::milliseconds(i64::try_from(config.round_duration_ms)?);
        let genesis_time = sync_timer.current_time() - round_duration;
        let genesis_header = BlockHeader {
            shard_id: cli.shard,
            rand_seed: Bytes::from_static(b"spos-sim genesis"),
            chain_id: Bytes::copy_from_slice(config.chain_id.as_bytes()),
            ..Default::default()
        };
        let network = LocalNetwork::with_span(info_span!("network"));
        let shard_coordinator = Arc::new(ShardCoordinator::new(1, cli.shard)?);

        let mut nodes = Vec::with_capacity(keys.len());
        for (i, key) in keys.into_iter().enumerate() {
            let coordinator = IndexHashedNodesCoordinator::new(IndexHashedNodesCoordinatorArgs {
                hasher: Some(hasher_for(config.hasher)),
                chain_parameters: Some(ChainParametersHolder::single(ChainParameters {
                    round_duration_ms: config.round_duration_ms,
                    shard_consensus_group_size: cli.group_size,
                    shard_min_num_nodes: cli.group_size,
                    meta_consensus_group_size: cli.group_size,
                    meta_min_num_nodes: cli.group_size,
                    ..Default::default()
                })?),
                self_public_key: key.public_key().clone(),
                start_epoch: 0,
                shard_id_as_observer: cli.shard,
                consensus_group_cache_size: config.consensus_group_cache_size,
                nodes_config: nodes_config.clone(),
            })?;
            for epoch in 1..=epochs {
                coordinator.set_nodes_config_for_epoch(epoch, nodes_config.clone())?;
            }

            let pid = Bytes::from(format!("validator-{i}").into_bytes());
            let node = build_consensus_node_with_span(
                ConsensusNodeArgs {
                    config: config.clone(),
                    genesis_time,
                    genesis_header: genesis_header.clone(),
                    keys_handler: Some(Arc::new(KeysHandler::new(key, pid))),
                    nodes_coordinator: Some(NodesCoordinatorHandle::Active(Arc::new(coordinator))),
                    shard_coordinator: Some(shard_coordinator.clone()),
                    network: Some(network.clone()),
                    sync_timer: Some(sync_timer.clone()),
                },
                info_span!("node", index = i),
            )?;
            nodes.push(Arc::new(node));
        }

        for &index in &cli.offline {
            let Some(node) = nodes.get(index) else {
                eyre::bail!("no validator at position {index}");
            };
            network.set_online(node.pid(), false);
            warn!(index, pub_key = %hex_prefix(node.public_key()), "Validator offline");
        }

        info!(
            validators = nodes.len(),
            group_size = cli.group_size,
            shard = %shard_name(cli.shard),
            round_ms = config.round_duration_ms,
            "Simulation wired"
        );
        Ok(Self { network, nodes })
    }

    /// Run `rounds` rounds on every node, outcomes per node
    async fn run(&self, rounds: usize) -> eyre::Result<Vec<Vec<RoundOutcome>>> {
        let handles: Vec<_> = self
            .nodes
            .iter()
            .map(|node| {
                let node = Arc::clone(node);
                tokio::spawn(async move { node.engine().run_rounds(rounds).await })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            outcomes.push(handle.await?);
        }
        for node in &self.nodes {
            node.close();
        }
        Ok(outcomes)
    }
}

/// Per-round view across nodes
#[derive(Debug, PartialEq, Eq)]
struct RoundSummary {
    round: i64,
    nonce: Option<u64>,
    signers: usize,
    finished: usize,
    aborted: usize,
}

fn summarize(outcomes: &[Vec<RoundOutcome>]) -> Vec<RoundSummary> {
    let rounds = outcomes.iter().map(Vec::len).max().unwrap_or_default();
    (0..rounds)
        .map(|r| {
            let column: Vec<&RoundOutcome> = outcomes.iter().filter_map(|node| node.get(r)).collect();
            let committed = column.iter().find_map(|outcome| match outcome {
                RoundOutcome::Finished { header, proof, .. } => {
                    Some((header.nonce, proof.signers_count()))
                }
                RoundOutcome::Aborted { .. } => None,
            });
            let finished = column.iter().filter(|outcome| outcome.is_finished()).count();
            RoundSummary {
                round: column.first().map(|outcome| outcome.round()).unwrap_or_default(),
                nonce: committed.map(|(nonce, _)| nonce),
                signers: committed.map(|(_, signers)| signers).unwrap_or_default(),
                finished,
                aborted: column.len() - finished,
            }
        })
        .collect()
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

fn print_summary(summaries: &[RoundSummary]) {
    println!("{:>6}  {:>6}  {:>7}  {:>8}  {:>7}", "round", "nonce", "signers", "finished", "aborted");
    for s in summaries {
        let nonce = s.nonce.map_or_else(|| "-".to_string(), |n| n.to_string());
        println!(
            "{:>6}  {:>6}  {:>7}  {:>8}  {:>7}",
            s.round, nonce, s.signers, s.finished, s.aborted
        );
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.spos_config()?;
    let epochs = match config.rounds_per_epoch {
        0 => 0,
        per_epoch => (cli.rounds as u64 / per_epoch + 1).try_into()?,
    };

    let simulation = Simulation::new(&cli, config, epochs, Arc::new(SystemSyncTimer))?;
    let outcomes = simulation.run(cli.rounds).await?;
    let summaries = summarize(&outcomes);
    print_summary(&summaries);

    let committed = summaries.iter().filter(|s| s.nonce.is_some()).count();
    info!(
        rounds = cli.rounds,
        committed,
        published = simulation.network.published_on(""),
        "Simulation finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reth_consensus_spos::TokioSyncTimer;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(core::iter::once("spos-sim").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_defaults_and_overrides() {
        let parsed = cli(&[]);
        assert_eq!(parsed.validators, 4);
        assert_eq!(parsed.group_size, 3);
        assert_eq!(parsed.spos_config().unwrap().round_duration_ms, 500);

        let parsed = cli(&["--round-ms", "40", "--offline", "1,2"]);
        assert_eq!(parsed.spos_config().unwrap().round_duration_ms, 40);
        assert_eq!(parsed.offline, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulation_commits_every_round() {
        let cli = cli(&["--rounds", "3", "--round-ms", "20"]);
        let config = cli.spos_config().unwrap().with_chain_id("sim");
        let timer = Arc::new(TokioSyncTimer::new(chrono::Utc::now()));
        let simulation = Simulation::new(&cli, config, 0, timer).unwrap();

        let summaries = summarize(&simulation.run(cli.rounds).await.unwrap());
        let nonces: Vec<_> = summaries.iter().map(|s| s.nonce).collect();
        assert_eq!(nonces, vec![Some(1), Some(2), Some(3)]);
        assert!(summaries.iter().all(|s| s.finished == 4 && s.aborted == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_unknown_offline_validator() {
        let cli = cli(&["--offline", "9"]);
        let timer = Arc::new(TokioSyncTimer::new(chrono::Utc::now()));
        let err = Simulation::new(&cli, cli.spos_config().unwrap(), 0, timer).unwrap_err();
        assert!(err.to_string().contains("position 9"));
    }
}
