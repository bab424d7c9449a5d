// syncrep-core/src/parameters/memory.rs

//! In-process parameter store.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::set::ParameterSet;
use super::traits::ParameterStore;
use crate::aggregation::Delta;
use crate::error::Result;

/// Parameter store holding an immutable snapshot behind a swap-on-write
/// pointer. Readers clone the `Arc` and never observe a half-applied batch.
#[derive(Debug, Default)]
pub struct InMemoryParameterStore {
    current: RwLock<Arc<ParameterSet>>,
}

impl InMemoryParameterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ParameterStore for InMemoryParameterStore {
    async fn initialize(&self, params: ParameterSet) -> Result<()> {
        *self.current.write().await = Arc::new(params);
        Ok(())
    }

    async fn snapshot(&self) -> Result<Arc<ParameterSet>> {
        Ok(self.current.read().await.clone())
    }

    async fn apply_batch(&self, deltas: &BTreeMap<String, Delta>) -> Result<()> {
        let mut current = self.current.write().await;
        let next = current.with_deltas(deltas)?;
        *current = Arc::new(next);
        Ok(())
    }
}
