// syncrep-core/src/replica.rs

//! The replica role: take a token, compute, tag, submit.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::aggregation::Delta;
use crate::chief::BootstrapState;
use crate::error::{Result, RuntimeError};
use crate::parameters::{ParameterSet, ParameterStore};
use crate::quorum::{ContributeOutcome, QuorumCoordinator};
use crate::tokens::TokenDispenser;

/// Produces a replica's per-parameter deltas from a parameter snapshot.
///
/// Implementations must not touch coordination state; they only compute.
#[async_trait]
pub trait ContributionSource: Send + Sync {
    /// Computes deltas for some or all parameters in `snapshot`.
    ///
    /// # Errors
    ///
    /// Any error aborts the replica's round attempt. The token it consumed is
    /// not returned.
    async fn produce(
        &self,
        replica_id: u32,
        snapshot: &ParameterSet,
    ) -> Result<BTreeMap<String, Delta>>;
}

/// What one `run_round` call did.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundReport {
    pub replica_id: u32,
    /// Round of the token consumed, and the tag on every contribution.
    pub local_round: u64,
    pub outcome: ContributeOutcome,
}

/// One worker taking part in synchronous aggregation.
pub struct Replica {
    id: u32,
    is_chief: bool,
    local_round: AtomicU64,
    readiness: watch::Receiver<BootstrapState>,
    dispenser: Arc<TokenDispenser>,
    coordinator: Arc<QuorumCoordinator>,
    store: Arc<dyn ParameterStore>,
    source: Arc<dyn ContributionSource>,
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("id", &self.id)
            .field("is_chief", &self.is_chief)
            .field("local_round", &self.local_round())
            .finish()
    }
}

impl Replica {
    pub(crate) fn new(
        id: u32,
        is_chief: bool,
        readiness: watch::Receiver<BootstrapState>,
        dispenser: Arc<TokenDispenser>,
        coordinator: Arc<QuorumCoordinator>,
        store: Arc<dyn ParameterStore>,
        source: Arc<dyn ContributionSource>,
    ) -> Self {
        Self {
            id,
            is_chief,
            local_round: AtomicU64::new(0),
            readiness,
            dispenser,
            coordinator,
            store,
            source,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_chief(&self) -> bool {
        self.is_chief
    }

    /// Round of the last token this replica consumed.
    pub fn local_round(&self) -> u64 {
        self.local_round.load(Ordering::Acquire)
    }

    /// True once the chief has released replicas into the protocol.
    pub fn is_ready(&self) -> bool {
        *self.readiness.borrow() == BootstrapState::Running
    }

    /// Suspends until the chief signals readiness.
    ///
    /// # Errors
    ///
    /// Returns a `Transport` error if the chief went away before signalling.
    pub async fn wait_until_ready(&self) -> Result<()> {
        let mut readiness = self.readiness.clone();
        readiness
            .wait_for(|state| *state == BootstrapState::Running)
            .await
            .map_err(|e| RuntimeError::transport_with_source("chief readiness channel closed", e))?;
        Ok(())
    }

    /// Runs one round attempt.
    ///
    /// Waits for a token, computes against the current parameters, and
    /// submits tagged with the token's round. A token that went stale while
    /// queued yields a rejected contribution, reported in the outcome.
    ///
    /// # Errors
    ///
    /// - `BootstrapOrderViolation` before the chief's readiness signal.
    /// - `Transport` if the token dispenser was closed.
    /// - Errors from the contribution source, store or coordinator.
    pub async fn run_round(&self) -> Result<RoundReport> {
        if !self.is_ready() {
            return Err(RuntimeError::bootstrap_order(self.id));
        }

        let token = self.dispenser.dequeue().await?;
        let local_round = token.round();
        self.local_round.store(local_round, Ordering::Release);

        let snapshot = self.store.snapshot().await?;
        let deltas = self.source.produce(self.id, &snapshot).await?;
        let contributions = deltas
            .into_iter()
            .map(|(name, delta)| (name, delta.tag(local_round)))
            .collect();

        let outcome = self.coordinator.contribute(self.id, contributions).await?;
        tracing::debug!(
            replica_id = self.id,
            local_round,
            accepted = outcome.accepted.len(),
            stale = outcome.stale.len(),
            "round attempt complete"
        );

        Ok(RoundReport {
            replica_id: self.id,
            local_round,
            outcome,
        })
    }
}
