// syncrep-core/src/quorum.rs

//! Round orchestration: submit, check quorum, apply, advance.
//!
//! Every `contribute` call runs inside one critical section that covers all
//! accumulators. Whichever call completes the quorum performs the finalize
//! inline; concurrent callers serialize on the lock, so exactly one of them
//! advances the round. Nobody waits for quorum: a call that does not complete
//! it returns as soon as its contributions are recorded.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};

use crate::aggregation::{Admission, Contribution, ContributionAccumulator, UpdateRule};
use crate::config::{ReplenishMode, RuntimeConfig};
use crate::error::{Result, RuntimeError};
use crate::parameters::{ParameterSet, ParameterStore};
use crate::tokens::TokenDispenser;

/// Record of one finalized round.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundSummary {
    /// The round whose contributions were averaged.
    pub round: u64,
    /// Replicas whose contributions made the quorum, in arrival order.
    pub contributors: Vec<u32>,
    pub finalized_at: DateTime<Utc>,
}

impl RoundSummary {
    /// Round counter value after this finalize.
    pub fn next_round(&self) -> u64 {
        self.round + 1
    }
}

/// Result of a single `contribute` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContributeOutcome {
    /// Parameters whose contribution was recorded for the expected round.
    pub accepted: Vec<String>,
    /// Parameters whose contribution was dropped as stale.
    pub stale: Vec<String>,
    /// Set when this call completed the quorum and advanced the round.
    pub finalized: Option<RoundSummary>,
    /// Set when this call applied a round that was already complete but whose
    /// earlier apply failed.
    pub recovered: Option<RoundSummary>,
}

impl ContributeOutcome {
    /// True when nothing was recorded because every contribution was stale.
    pub fn is_stale(&self) -> bool {
        self.accepted.is_empty() && !self.stale.is_empty()
    }
}

/// Accumulators and per-round bookkeeping guarded by the coordinator lock.
#[derive(Debug, Default)]
struct RoundState {
    accumulators: BTreeMap<String, ContributionAccumulator>,
    contributors: Vec<u32>,
}

impl RoundState {
    /// Every accumulator holds a full quorum that has not been applied yet.
    fn is_complete(&self) -> bool {
        !self.accumulators.is_empty() && self.accumulators.values().all(|a| a.is_ready())
    }
}

enum Replenisher {
    Inline,
    /// Finalized rounds are handed to the chief's watcher.
    Chief(mpsc::UnboundedSender<u64>),
}

/// Owner of the round counter and the accumulators.
pub struct QuorumCoordinator {
    round: AtomicU64,
    required_count: usize,
    tokens_per_round: u32,
    update_rule: UpdateRule,
    state: Mutex<RoundState>,
    dispenser: Arc<TokenDispenser>,
    store: Arc<dyn ParameterStore>,
    replenisher: Replenisher,
    round_events: std::sync::Mutex<Option<mpsc::UnboundedReceiver<u64>>>,
}

impl QuorumCoordinator {
    pub fn new(
        config: &RuntimeConfig,
        dispenser: Arc<TokenDispenser>,
        store: Arc<dyn ParameterStore>,
    ) -> Self {
        let (replenisher, round_events) = match config.aggregation.replenish_mode {
            ReplenishMode::Inline => (Replenisher::Inline, None),
            ReplenishMode::Chief => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Replenisher::Chief(tx), Some(rx))
            }
        };

        Self {
            round: AtomicU64::new(0),
            required_count: config.aggregation.replicas_to_aggregate as usize,
            tokens_per_round: config.aggregation.tokens_per_round(),
            update_rule: UpdateRule::from_config(&config.update),
            state: Mutex::new(RoundState::default()),
            dispenser,
            store,
            replenisher,
            round_events: std::sync::Mutex::new(round_events),
        }
    }

    /// Current round counter. Never takes the coordinator lock.
    pub fn current_round(&self) -> u64 {
        self.round.load(Ordering::Acquire)
    }

    pub fn required_count(&self) -> usize {
        self.required_count
    }

    pub fn tokens_per_round(&self) -> u32 {
        self.tokens_per_round
    }

    /// Hands out the stream of finalized rounds when replenishment is the
    /// chief's job. Returns `None` in inline mode or if already taken.
    pub fn take_round_events(&self) -> Option<mpsc::UnboundedReceiver<u64>> {
        let mut events = self.round_events.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("round event slot was poisoned, recovering");
            poisoned.into_inner()
        });
        events.take()
    }

    /// Creates one accumulator per parameter in `params`, expecting the
    /// current round.
    pub async fn track(&self, params: &ParameterSet) {
        let mut state = self.state.lock().await;
        let round = self.current_round();
        for (name, layout) in params.layouts() {
            let acc = ContributionAccumulator::new(name.clone(), layout, self.required_count, round);
            state.accumulators.insert(name, acc);
        }
        tracing::debug!(parameters = state.accumulators.len(), round, "tracking parameters");
    }

    /// Names of every tracked parameter.
    pub async fn tracked(&self) -> Vec<String> {
        self.state.lock().await.accumulators.keys().cloned().collect()
    }

    /// Records a replica's contributions and finalizes the round if this
    /// completes quorum on every tracked parameter.
    ///
    /// # Errors
    ///
    /// - `Parameter` if a contribution names an untracked parameter or does
    ///   not fit its layout; nothing is recorded.
    /// - `QuorumMismatch` if accepting would exceed quorum; the round is
    ///   frozen and nothing from this call is recorded.
    /// - Any error from the parameter store; the round is left as it was.
    ///   A round left complete by a failed apply is applied again by the
    ///   next call, before that call's contributions are looked at. While
    ///   the store keeps failing every call returns its error and records
    ///   nothing.
    pub async fn contribute(
        &self,
        replica_id: u32,
        contributions: BTreeMap<String, Contribution>,
    ) -> Result<ContributeOutcome> {
        let mut state = self.state.lock().await;

        let mut outcome = ContributeOutcome::default();
        if state.is_complete() {
            tracing::info!(
                round = self.current_round(),
                replica_id,
                "retrying apply of a completed round"
            );
            outcome.recovered = Some(self.finalize(&mut state).await?);
        }

        // Validate everything before recording anything.
        for (name, contribution) in &contributions {
            let acc = state
                .accumulators
                .get(name)
                .ok_or_else(|| RuntimeError::parameter(name.as_str(), "not tracked"))?;
            if let Err(e) = acc.classify(contribution) {
                if e.is_fatal_to_round() {
                    if let Some(acc) = state.accumulators.get_mut(name) {
                        acc.mark_faulted();
                    }
                }
                return Err(e);
            }
        }

        for (name, contribution) in contributions {
            let tagged = contribution.round;
            let acc = state
                .accumulators
                .get_mut(&name)
                .ok_or_else(|| RuntimeError::parameter(name.as_str(), "not tracked"))?;
            match acc.submit(contribution)? {
                Admission::Accepted => outcome.accepted.push(name),
                Admission::Stale => {
                    tracing::warn!(
                        replica_id,
                        parameter = %name,
                        tagged,
                        expected = acc.expected_round(),
                        "rejected stale contribution"
                    );
                    outcome.stale.push(name);
                }
            }
        }
        if outcome.accepted.is_empty() {
            return Ok(outcome);
        }
        state.contributors.push(replica_id);

        if !state.is_complete() {
            return Ok(outcome);
        }

        outcome.finalized = Some(self.finalize(&mut state).await?);
        Ok(outcome)
    }

    async fn finalize(&self, state: &mut RoundState) -> Result<RoundSummary> {
        let round = self.current_round();

        let mut increments = BTreeMap::new();
        for (name, acc) in &state.accumulators {
            if let Some(averaged) = acc.try_finalize()? {
                increments.insert(name.clone(), self.update_rule.increment(averaged));
            }
        }

        // Nothing is cleared until the store has taken the whole batch.
        self.store.apply_batch(&increments).await?;

        let next = round + 1;
        for acc in state.accumulators.values_mut() {
            acc.advance(next);
        }
        self.round.store(next, Ordering::Release);
        let contributors = std::mem::take(&mut state.contributors);

        match &self.replenisher {
            Replenisher::Inline => self.dispenser.replenish(self.tokens_per_round, next),
            Replenisher::Chief(events) => {
                if events.send(next).is_err() {
                    tracing::warn!(round = next, "chief replenishment watcher is gone");
                }
            }
        }

        tracing::info!(
            round,
            next,
            contributors = ?contributors,
            "finalized round"
        );

        Ok(RoundSummary {
            round,
            contributors,
            finalized_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{Delta, SparseDelta};
    use crate::config::UpdateRuleKind;
    use crate::parameters::{DenseTensor, InMemoryParameterStore, Parameter, SparseTable};
    use async_trait::async_trait;

    fn config(quorum: u32, total: u32) -> RuntimeConfig {
        let mut config = RuntimeConfig::with_replicas(quorum, total);
        config.update.rule = UpdateRuleKind::Add;
        config
    }

    async fn setup(
        config: &RuntimeConfig,
    ) -> (QuorumCoordinator, Arc<TokenDispenser>, Arc<InMemoryParameterStore>) {
        let dispenser = Arc::new(TokenDispenser::new());
        let store = Arc::new(InMemoryParameterStore::new());
        let params = ParameterSet::new().with("v0", Parameter::Dense(DenseTensor::scalar(0.0)));
        store.initialize(params.clone()).await.unwrap();

        let coordinator = QuorumCoordinator::new(config, dispenser.clone(), store.clone());
        coordinator.track(&params).await;
        (coordinator, dispenser, store)
    }

    fn dense(round: u64, value: f32) -> BTreeMap<String, Contribution> {
        let mut map = BTreeMap::new();
        map.insert("v0".to_string(), Delta::Dense(vec![value]).tag(round));
        map
    }

    async fn v0(store: &InMemoryParameterStore) -> f32 {
        store.snapshot().await.unwrap().get("v0").unwrap().as_dense().unwrap().values()[0]
    }

    #[tokio::test]
    async fn test_two_replicas_finalize() {
        let (coordinator, dispenser, store) = setup(&config(2, 2)).await;

        let first = coordinator.contribute(0, dense(0, 0.1)).await.unwrap();
        assert_eq!(first.accepted, vec!["v0".to_string()]);
        assert!(first.finalized.is_none());
        assert_eq!(coordinator.current_round(), 0);

        let second = coordinator.contribute(1, dense(0, 0.9)).await.unwrap();
        let summary = second.finalized.unwrap();
        assert_eq!(summary.round, 0);
        assert_eq!(summary.next_round(), 1);
        assert_eq!(summary.contributors, vec![0, 1]);

        assert_eq!(coordinator.current_round(), 1);
        assert!((v0(&store).await - 0.5).abs() < 1e-6);
        assert_eq!(dispenser.depth(), 2);
        assert_eq!(dispenser.try_dequeue().unwrap().round(), 1);
    }

    #[tokio::test]
    async fn test_stale_contribution_has_no_effect() {
        let (coordinator, dispenser, store) = setup(&config(1, 2)).await;

        coordinator.contribute(0, dense(0, 1.0)).await.unwrap();
        assert_eq!(coordinator.current_round(), 1);
        let depth = dispenser.depth();

        let outcome = coordinator.contribute(1, dense(0, 100.0)).await.unwrap();
        assert!(outcome.is_stale());
        assert!(outcome.finalized.is_none());
        assert_eq!(coordinator.current_round(), 1);
        assert_eq!(dispenser.depth(), depth);
        assert!((v0(&store).await - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_untracked_parameter_records_nothing() {
        let (coordinator, _, _) = setup(&config(2, 2)).await;

        let mut map = dense(0, 1.0);
        map.insert("missing".to_string(), Delta::Dense(vec![1.0]).tag(0));

        let err = coordinator.contribute(0, map).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Parameter { .. }));

        // v0 was not recorded: two more contributions are still needed
        assert!(coordinator.contribute(0, dense(0, 1.0)).await.unwrap().finalized.is_none());
        assert!(coordinator.contribute(1, dense(0, 1.0)).await.unwrap().finalized.is_some());
    }

    #[tokio::test]
    async fn test_finalize_requires_every_parameter() {
        let config = config(2, 2);
        let dispenser = Arc::new(TokenDispenser::new());
        let store = Arc::new(InMemoryParameterStore::new());
        let params = ParameterSet::new()
            .with("v0", Parameter::Dense(DenseTensor::scalar(0.0)))
            .with("emb", Parameter::Sparse(SparseTable::new(vec![vec![3.0], vec![4.0]]).unwrap()));
        store.initialize(params.clone()).await.unwrap();
        let coordinator = QuorumCoordinator::new(&config, dispenser, store.clone());
        coordinator.track(&params).await;

        // v0 reaches quorum, emb does not
        coordinator.contribute(0, dense(0, 1.0)).await.unwrap();
        let outcome = coordinator.contribute(1, dense(0, 1.0)).await.unwrap();
        assert!(outcome.finalized.is_none());
        assert_eq!(coordinator.current_round(), 0);

        // A third v0 contribution for the round is a quorum violation
        let err = coordinator.contribute(2, dense(0, 1.0)).await.unwrap_err();
        assert!(matches!(err, RuntimeError::QuorumMismatch { .. }));
        assert_eq!(coordinator.current_round(), 0);
        assert!((v0(&store).await - 0.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_sparse_and_dense_in_one_batch() {
        let mut config = RuntimeConfig::with_replicas(2, 2);
        config.update.rule = UpdateRuleKind::Sgd;
        config.update.learning_rate = 2.0;
        let dispenser = Arc::new(TokenDispenser::new());
        let store = Arc::new(InMemoryParameterStore::new());
        let params = ParameterSet::new()
            .with("v0", Parameter::Dense(DenseTensor::scalar(0.0)))
            .with("emb", Parameter::Sparse(SparseTable::new(vec![vec![3.0], vec![4.0]]).unwrap()));
        store.initialize(params.clone()).await.unwrap();
        let coordinator = QuorumCoordinator::new(&config, dispenser, store.clone());
        coordinator.track(&params).await;

        for (replica, grad) in [(0u32, 0.1f32), (1, 0.3)] {
            let mut map = BTreeMap::new();
            map.insert("v0".to_string(), Delta::Dense(vec![grad]).tag(0));
            map.insert(
                "emb".to_string(),
                Delta::Sparse(SparseDelta::new(vec![(1, vec![grad])]).unwrap()).tag(0),
            );
            coordinator.contribute(replica, map).await.unwrap();
        }

        assert_eq!(coordinator.current_round(), 1);
        let snapshot = store.snapshot().await.unwrap();
        let v0 = snapshot.get("v0").unwrap().as_dense().unwrap().values()[0];
        assert!((v0 - (-0.4)).abs() < 1e-6);
        let emb = snapshot.get("emb").unwrap().as_sparse().unwrap();
        assert_eq!(emb.row(0).unwrap(), &[3.0]);
        assert!((emb.row(1).unwrap()[0] - 3.6).abs() < 1e-6);
    }

    struct FailingStore {
        inner: InMemoryParameterStore,
        failing: std::sync::atomic::AtomicBool,
    }

    impl FailingStore {
        fn new() -> Self {
            Self {
                inner: InMemoryParameterStore::new(),
                failing: std::sync::atomic::AtomicBool::new(true),
            }
        }

        fn recover(&self) {
            self.failing.store(false, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ParameterStore for FailingStore {
        async fn initialize(&self, params: ParameterSet) -> Result<()> {
            self.inner.initialize(params).await
        }

        async fn snapshot(&self) -> Result<Arc<ParameterSet>> {
            self.inner.snapshot().await
        }

        async fn apply_batch(&self, deltas: &BTreeMap<String, Delta>) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(RuntimeError::transport("parameter server unreachable"));
            }
            self.inner.apply_batch(deltas).await
        }
    }

    #[tokio::test]
    async fn test_store_failure_leaves_round_open() {
        let config = config(1, 1);
        let dispenser = Arc::new(TokenDispenser::new());
        let store = Arc::new(FailingStore::new());
        let params = ParameterSet::new().with("v0", Parameter::Dense(DenseTensor::scalar(0.0)));
        store.initialize(params.clone()).await.unwrap();
        let coordinator = QuorumCoordinator::new(&config, dispenser.clone(), store.clone());
        coordinator.track(&params).await;

        let err = coordinator.contribute(0, dense(0, 1.0)).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Transport { .. }));
        assert_eq!(coordinator.current_round(), 0);
        assert_eq!(dispenser.depth(), 0);

        // While the store is down, neither an extra on-time contribution nor a
        // stale one faults the round or moves it.
        let err = coordinator.contribute(1, dense(0, 5.0)).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Transport { .. }));
        let err = coordinator.contribute(1, dense(7, 5.0)).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Transport { .. }));
        let err = coordinator.contribute(1, BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Transport { .. }));
        assert_eq!(coordinator.current_round(), 0);
        assert_eq!(dispenser.depth(), 0);
        assert_eq!(v0(&store.inner).await, 0.0);

        // Once it is back, the next call applies the completed round exactly
        // once and its own late contribution is dropped.
        store.recover();
        let outcome = coordinator.contribute(1, dense(0, 5.0)).await.unwrap();
        let recovered = outcome.recovered.as_ref().unwrap();
        assert_eq!(recovered.round, 0);
        assert_eq!(recovered.contributors, vec![0]);
        assert!(outcome.is_stale());
        assert!(outcome.finalized.is_none());
        assert_eq!(coordinator.current_round(), 1);
        assert_eq!(dispenser.depth(), 1);
        assert!((v0(&store.inner).await - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_stale_call_never_finalizes() {
        let (coordinator, dispenser, store) = setup(&config(2, 3)).await;

        coordinator.contribute(0, dense(0, 1.0)).await.unwrap();
        let outcome = coordinator.contribute(2, dense(3, 1.0)).await.unwrap();
        assert!(outcome.is_stale());
        let outcome = coordinator.contribute(2, BTreeMap::new()).await.unwrap();
        assert!(outcome.finalized.is_none());

        assert_eq!(coordinator.current_round(), 0);
        assert_eq!(dispenser.depth(), 0);
        assert_eq!(v0(&store).await, 0.0);
    }

    #[test]
    fn test_round_events_survive_poisoned_lock() {
        let mut config = config(1, 1);
        config.aggregation.replenish_mode = ReplenishMode::Chief;
        let store: Arc<dyn ParameterStore> = Arc::new(InMemoryParameterStore::new());
        let coordinator = QuorumCoordinator::new(&config, Arc::new(TokenDispenser::new()), store);

        let poisoned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = coordinator.round_events.lock().unwrap();
            panic!("poison the event slot");
        }));
        assert!(poisoned.is_err());
        assert!(coordinator.round_events.is_poisoned());

        assert!(coordinator.take_round_events().is_some());
    }

    #[tokio::test]
    async fn test_chief_mode_publishes_rounds() {
        let mut config = config(1, 1);
        config.aggregation.replenish_mode = ReplenishMode::Chief;
        let (coordinator, dispenser, _) = setup(&config).await;

        let mut events = coordinator.take_round_events().unwrap();
        assert!(coordinator.take_round_events().is_none());

        coordinator.contribute(0, dense(0, 1.0)).await.unwrap();
        assert_eq!(events.recv().await, Some(1));
        // replenishing is left to the watcher
        assert_eq!(dispenser.depth(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_contributors_finalize_once() {
        let coordinator = Arc::new(setup(&config(4, 4)).await.0);

        let handles: Vec<_> = (0..4u32)
            .map(|replica| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.contribute(replica, dense(0, 1.0)).await })
            })
            .collect();

        let mut finalized = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().finalized.is_some() {
                finalized += 1;
            }
        }
        assert_eq!(finalized, 1);
        assert_eq!(coordinator.current_round(), 1);
    }
}
