// syncrep-core/src/sync.rs

//! Top-level orchestration of a synchronous-replica job.
//!
//! `SyncReplicas` wires the token dispenser, quorum coordinator, parameter
//! store and chief together and exposes the calls replicas make.
//!
//! # Example
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use syncrep_core::aggregation::Delta;
//! use syncrep_core::parameters::{DenseTensor, Parameter, ParameterSet};
//! use syncrep_core::{ContributionSource, RuntimeConfig, SyncReplicas};
//!
//! struct Constant;
//!
//! #[async_trait]
//! impl ContributionSource for Constant {
//!     async fn produce(
//!         &self,
//!         _replica_id: u32,
//!         _snapshot: &ParameterSet,
//!     ) -> syncrep_core::Result<BTreeMap<String, Delta>> {
//!         let mut deltas = BTreeMap::new();
//!         deltas.insert("v0".to_string(), Delta::Dense(vec![0.1]));
//!         Ok(deltas)
//!     }
//! }
//!
//! # async fn example() -> syncrep_core::Result<()> {
//! let job = SyncReplicas::new(RuntimeConfig::with_replicas(2, 2), Arc::new(Constant))?;
//! job.bootstrap_chief(
//!     ParameterSet::new().with("v0", Parameter::Dense(DenseTensor::scalar(0.0))),
//! )
//! .await?;
//!
//! job.run_round(0).await?;
//! job.run_round(1).await?;
//! assert_eq!(job.current_round(), 1);
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;

use crate::chief::{BootstrapState, Chief};
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::parameters::{InMemoryParameterStore, ParameterSet, ParameterStore};
use crate::quorum::QuorumCoordinator;
use crate::replica::{ContributionSource, Replica, RoundReport};
use crate::tokens::TokenDispenser;

/// A synchronous-replica job: one chief, `total_replicas` replicas.
pub struct SyncReplicas {
    config: RuntimeConfig,
    store: Arc<dyn ParameterStore>,
    dispenser: Arc<TokenDispenser>,
    coordinator: Arc<QuorumCoordinator>,
    chief: Chief,
    replicas: Vec<Arc<Replica>>,
}

impl SyncReplicas {
    /// Creates a job backed by an in-memory parameter store.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: RuntimeConfig, source: Arc<dyn ContributionSource>) -> Result<Self> {
        Self::with_store(config, Arc::new(InMemoryParameterStore::new()), source)
    }

    /// Creates a job from a configuration file.
    ///
    /// The configuration file should be in TOML format. Environment variable
    /// overrides are applied after loading the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_config_file(
        path: impl AsRef<Path>,
        source: Arc<dyn ContributionSource>,
    ) -> Result<Self> {
        let config = RuntimeConfig::from_file(path)?.with_env_overrides();
        Self::new(config, source)
    }

    /// Creates a job on top of an existing parameter store.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_store(
        config: RuntimeConfig,
        store: Arc<dyn ParameterStore>,
        source: Arc<dyn ContributionSource>,
    ) -> Result<Self> {
        config.validate()?;

        let dispenser = Arc::new(TokenDispenser::new());
        let coordinator = Arc::new(QuorumCoordinator::new(&config, dispenser.clone(), store.clone()));
        let chief = Chief::new(
            config.aggregation.chief_index,
            config.aggregation.seed_tokens(),
            store.clone(),
            dispenser.clone(),
            coordinator.clone(),
        );

        let replicas = (0..config.aggregation.total_replicas)
            .map(|id| {
                Arc::new(Replica::new(
                    id,
                    id == config.aggregation.chief_index,
                    chief.subscribe(),
                    dispenser.clone(),
                    coordinator.clone(),
                    store.clone(),
                    source.clone(),
                ))
            })
            .collect();

        tracing::debug!(
            total_replicas = config.aggregation.total_replicas,
            replicas_to_aggregate = config.aggregation.replicas_to_aggregate,
            chief = config.aggregation.chief_index,
            "created synchronous replica job"
        );

        Ok(Self {
            config,
            store,
            dispenser,
            coordinator,
            chief,
            replicas,
        })
    }

    /// Runs the chief's one-time bootstrap with the starting parameters.
    ///
    /// # Errors
    ///
    /// Returns a `Bootstrap` error if bootstrap already ran.
    pub async fn bootstrap_chief(&self, initial: ParameterSet) -> Result<()> {
        self.chief.bootstrap(initial).await
    }

    /// Runs one round attempt for `replica_id`.
    ///
    /// # Errors
    ///
    /// See [`Replica::run_round`]; also `UnknownReplica` for an id outside
    /// the job.
    pub async fn run_round(&self, replica_id: u32) -> Result<RoundReport> {
        self.replica(replica_id)?.run_round().await
    }

    /// Current round counter; lock-free.
    pub fn current_round(&self) -> u64 {
        self.coordinator.current_round()
    }

    /// Round of the last token `replica_id` consumed.
    ///
    /// # Errors
    ///
    /// Returns `UnknownReplica` for an id outside the job.
    pub fn local_round_of(&self, replica_id: u32) -> Result<u64> {
        Ok(self.replica(replica_id)?.local_round())
    }

    /// Handle for driving one replica from its own task.
    ///
    /// # Errors
    ///
    /// Returns `UnknownReplica` for an id outside the job.
    pub fn replica(&self, replica_id: u32) -> Result<Arc<Replica>> {
        self.replicas
            .get(replica_id as usize)
            .cloned()
            .ok_or_else(|| {
                RuntimeError::unknown_replica(replica_id, self.config.aggregation.total_replicas)
            })
    }

    pub fn replicas(&self) -> &[Arc<Replica>] {
        &self.replicas
    }

    /// Suspends until the chief has released replicas.
    ///
    /// # Errors
    ///
    /// Returns a `Transport` error if the readiness channel closed.
    pub async fn wait_until_ready(&self) -> Result<()> {
        let mut readiness = self.chief.subscribe();
        readiness
            .wait_for(|state| *state == BootstrapState::Running)
            .await
            .map_err(|e| RuntimeError::transport_with_source("chief readiness channel closed", e))?;
        Ok(())
    }

    pub fn bootstrap_state(&self) -> BootstrapState {
        self.chief.state()
    }

    /// Current parameter snapshot.
    ///
    /// # Errors
    ///
    /// Returns any error from the parameter store.
    pub async fn parameters(&self) -> Result<Arc<ParameterSet>> {
        self.store.snapshot().await
    }

    /// Number of tokens currently queued.
    pub fn token_depth(&self) -> usize {
        self.dispenser.depth()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Stops the chief's watcher and wakes every replica waiting for a token
    /// with a `Transport` error.
    pub async fn shutdown(&self) {
        self.chief.stop().await;
        self.dispenser.close();
        tracing::info!(round = self.current_round(), "job shut down");
    }
}
