//! Synchronous Replicas Coordinator
//!
//! This binary runs a complete in-process job: one chief and N replicas as
//! tokio tasks, aggregating a synthetic workload for a fixed number of rounds.
//!
//! # Usage
//!
//! ```bash
//! # Four replicas, quorum of three, ten rounds
//! syncrep-coordinator
//!
//! # Two backup replicas and an sgd step instead of plain averaging
//! syncrep-coordinator --replicas 5 --quorum 3 --update-rule sgd --learning-rate 0.1
//!
//! # Start with configuration file
//! syncrep-coordinator --config syncrep.toml --rounds 100
//! ```

mod source;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::future::join_all;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use source::SyntheticSource;
use syncrep_core::{
    DenseTensor, Parameter, ParameterSet, RuntimeConfig, RuntimeError, SparseTable, SyncReplicas,
    UpdateRuleKind,
};

/// Synchronous Replicas Coordinator
#[derive(Parser, Debug)]
#[command(name = "syncrep-coordinator")]
#[command(about = "Runs a synchronous-replica aggregation job in process")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Total replicas, backups included
    #[arg(long)]
    replicas: Option<u32>,

    /// Contributions needed to finalize a round
    #[arg(long)]
    quorum: Option<u32>,

    /// Rounds to run before shutting down
    #[arg(long, default_value = "10")]
    rounds: u64,

    /// Learning rate for the sgd update rule
    #[arg(long)]
    learning_rate: Option<f32>,

    /// Update rule (add, sgd)
    #[arg(long)]
    update_rule: Option<String>,

    /// Upper bound on the random delay each replica adds per round
    #[arg(long, default_value = "50")]
    max_straggle_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> syncrep_core::Result<RuntimeConfig> {
    let mut config = match &args.config {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::with_replicas(3, 4),
    }
    .with_env_overrides();

    if let Some(replicas) = args.replicas {
        config.aggregation.total_replicas = replicas;
    }
    if let Some(quorum) = args.quorum {
        config.aggregation.replicas_to_aggregate = quorum;
    }
    if let Some(learning_rate) = args.learning_rate {
        config.update.learning_rate = learning_rate;
    }
    if let Some(rule) = &args.update_rule {
        config.update.rule = match rule.to_lowercase().as_str() {
            "add" => UpdateRuleKind::Add,
            "sgd" => UpdateRuleKind::Sgd,
            _ => {
                tracing::warn!("Unknown update rule '{}', defaulting to add", rule);
                UpdateRuleKind::Add
            }
        };
    }

    config.validate()?;
    Ok(config)
}

fn initial_parameters() -> syncrep_core::Result<ParameterSet> {
    Ok(ParameterSet::new()
        .with("bias", Parameter::Dense(DenseTensor::scalar(0.0)))
        .with("weights", Parameter::Dense(DenseTensor::new(vec![2, 2], vec![1.0; 4])?))
        .with("embeddings", Parameter::Sparse(SparseTable::new(vec![vec![0.0; 3]; 8])?)))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;
    let job_id = Uuid::new_v4();

    tracing::info!("Starting synchronous replicas job {}", job_id);
    tracing::info!("  Replicas: {}", config.aggregation.total_replicas);
    tracing::info!("  Quorum: {}", config.aggregation.replicas_to_aggregate);
    tracing::info!("  Update rule: {:?}", config.update.rule);
    tracing::info!("  Replenish mode: {:?}", config.aggregation.replenish_mode);
    tracing::info!("  Rounds: {}", args.rounds);

    let source = Arc::new(SyntheticSource::new(Duration::from_millis(args.max_straggle_ms)));
    let job = Arc::new(SyncReplicas::new(config, source)?);
    let target = args.rounds;

    // Replicas start first and park until the chief releases them.
    let workers: Vec<_> = job
        .replicas()
        .iter()
        .cloned()
        .map(|replica| {
            let job = job.clone();
            tokio::spawn(async move {
                replica.wait_until_ready().await?;
                let mut contributed = 0u64;
                while job.current_round() < target {
                    match replica.run_round().await {
                        Ok(report) if report.outcome.is_stale() => {
                            tracing::debug!(
                                "Replica {} dropped late work for round {}",
                                report.replica_id,
                                report.local_round
                            );
                        }
                        Ok(_) => contributed += 1,
                        Err(RuntimeError::Transport { .. }) => break,
                        Err(e) => {
                            if e.is_fatal_to_round() {
                                tracing::error!("Replica {} froze the round: {}", replica.id(), e);
                            }
                            return Err(e);
                        }
                    }
                }
                Ok::<_, RuntimeError>((replica.id(), contributed))
            })
        })
        .collect();

    job.bootstrap_chief(initial_parameters()?).await?;

    // Start background progress reporting
    let progress_job = job.clone();
    let progress = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            tracing::info!(
                "Round {} ({} tokens queued)",
                progress_job.current_round(),
                progress_job.token_depth()
            );
        }
    });

    let mut poll = tokio::time::interval(Duration::from_millis(10));
    tokio::select! {
        _ = async {
            while job.current_round() < target {
                poll.tick().await;
            }
        } => {
            tracing::info!("Reached round {}", job.current_round());
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Interrupted at round {}", job.current_round());
        }
    }

    tracing::info!("Shutting down job {}...", job_id);
    job.shutdown().await;
    progress.abort();

    for result in join_all(workers).await {
        match result? {
            Ok((id, contributed)) => {
                tracing::info!("Replica {} contributed {} times", id, contributed)
            }
            Err(e) => tracing::error!("Replica failed: {}", e),
        }
    }

    let params = job.parameters().await?;
    for (name, param) in params.iter() {
        match param {
            Parameter::Dense(tensor) => {
                tracing::info!("{} = {:?}", name, tensor.values())
            }
            Parameter::Sparse(table) => {
                tracing::info!("{} = {:?}", name, table.rows())
            }
        }
    }

    Ok(())
}
