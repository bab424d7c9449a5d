// syncrep-core/src/parameters/traits.rs

//! Store abstraction for the shared parameter set.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::set::ParameterSet;
use crate::aggregation::Delta;
use crate::error::Result;

/// Backing store for the shared parameters.
///
/// Implementations may live in process or behind a remote parameter server;
/// either way `apply_batch` must be linearizable and all-or-nothing.
#[async_trait]
pub trait ParameterStore: Send + Sync {
    /// Replaces the stored parameters with their starting values.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    async fn initialize(&self, params: ParameterSet) -> Result<()>;

    /// Returns a read-only view of the current parameters.
    ///
    /// The returned set never changes; later updates produce a new one.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    async fn snapshot(&self) -> Result<Arc<ParameterSet>>;

    /// Adds every delta to its parameter as one atomic step.
    ///
    /// # Errors
    ///
    /// Returns an error, with nothing applied, if any delta names an unknown
    /// parameter or does not match its layout.
    async fn apply_batch(&self, deltas: &BTreeMap<String, Delta>) -> Result<()>;
}
