// syncrep-core/src/chief.rs

//! Chief bootstrap: parameter init, token seeding, readiness.
//!
//! ```text
//! AwaitingParameterInit --init params--> Seeding --seed tokens--> Running
//! ```
//!
//! `Running` is the one-time `ready_for_local_init` signal that releases the
//! other replicas.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::error::{Result, RuntimeError};
use crate::parameters::{ParameterSet, ParameterStore};
use crate::quorum::QuorumCoordinator;
use crate::tokens::TokenDispenser;

/// Bootstrap progress as seen by every replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    AwaitingParameterInit,
    Seeding,
    Running,
}

/// Bootstrap authority, owned by the elected chief replica.
pub struct Chief {
    replica_id: u32,
    seed_tokens: u32,
    started: AtomicBool,
    state: watch::Sender<BootstrapState>,
    store: Arc<dyn ParameterStore>,
    dispenser: Arc<TokenDispenser>,
    coordinator: Arc<QuorumCoordinator>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Chief {
    pub fn new(
        replica_id: u32,
        seed_tokens: u32,
        store: Arc<dyn ParameterStore>,
        dispenser: Arc<TokenDispenser>,
        coordinator: Arc<QuorumCoordinator>,
    ) -> Self {
        let (state, _) = watch::channel(BootstrapState::AwaitingParameterInit);
        Self {
            replica_id,
            seed_tokens,
            started: AtomicBool::new(false),
            state,
            store,
            dispenser,
            coordinator,
            watcher: Mutex::new(None),
        }
    }

    pub fn replica_id(&self) -> u32 {
        self.replica_id
    }

    pub fn state(&self) -> BootstrapState {
        *self.state.borrow()
    }

    /// Readiness channel handed to every replica.
    pub fn subscribe(&self) -> watch::Receiver<BootstrapState> {
        self.state.subscribe()
    }

    /// Initializes parameters, seeds tokens for round 0, starts the
    /// replenishment watcher if configured, then signals readiness.
    ///
    /// # Errors
    ///
    /// Returns a `Bootstrap` error on a second call, or any store error from
    /// initialization (the state then stays `AwaitingParameterInit`).
    pub async fn bootstrap(&self, initial: ParameterSet) -> Result<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RuntimeError::bootstrap("chief bootstrap already ran"));
        }

        if let Err(e) = self.store.initialize(initial.clone()).await {
            self.started.store(false, Ordering::Release);
            return Err(e);
        }
        self.coordinator.track(&initial).await;
        self.state.send_replace(BootstrapState::Seeding);
        tracing::info!(
            chief = self.replica_id,
            parameters = initial.len(),
            "parameters initialized"
        );

        let round = self.coordinator.current_round();
        self.dispenser.seed(self.seed_tokens, round)?;

        if let Some(mut events) = self.coordinator.take_round_events() {
            let dispenser = self.dispenser.clone();
            let count = self.coordinator.tokens_per_round();
            let handle = tokio::spawn(async move {
                while let Some(round) = events.recv().await {
                    dispenser.replenish(count, round);
                }
                tracing::debug!("replenishment watcher stopped");
            });
            *self.watcher.lock().await = Some(handle);
            tracing::info!(chief = self.replica_id, "started replenishment watcher");
        }

        self.state.send_replace(BootstrapState::Running);
        tracing::info!(chief = self.replica_id, round, "replicas released");
        Ok(())
    }

    /// Stops the replenishment watcher, if one is running.
    pub async fn stop(&self) {
        if let Some(handle) = self.watcher.lock().await.take() {
            handle.abort();
        }
    }
}
