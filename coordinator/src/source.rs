//! Synthetic gradients for the in-process driver.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use syncrep_core::{ContributionSource, Delta, Parameter, ParameterSet, SparseDelta};

/// Produces fixed per-replica deltas after a random delay, so replicas finish
/// in a different order every round and backups actually fall behind.
pub struct SyntheticSource {
    max_straggle: Duration,
}

impl SyntheticSource {
    pub fn new(max_straggle: Duration) -> Self {
        Self { max_straggle }
    }

    fn straggle(&self) -> Duration {
        let max = self.max_straggle.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

#[async_trait]
impl ContributionSource for SyntheticSource {
    async fn produce(
        &self,
        replica_id: u32,
        snapshot: &ParameterSet,
    ) -> syncrep_core::Result<BTreeMap<String, Delta>> {
        tokio::time::sleep(self.straggle()).await;

        let gradient = 0.1 + 0.2 * replica_id as f32;
        let mut deltas = BTreeMap::new();
        for (name, param) in snapshot.iter() {
            let delta = match param {
                Parameter::Dense(tensor) => Delta::Dense(vec![gradient; tensor.values().len()]),
                Parameter::Sparse(table) => {
                    let row = replica_id as usize % table.num_rows().max(1);
                    Delta::Sparse(SparseDelta::new(vec![(
                        row,
                        vec![gradient; table.row_width()],
                    )])?)
                }
            };
            deltas.insert(name.clone(), delta);
        }
        Ok(deltas)
    }
}
