// syncrep-core/src/parameters/mod.rs

//! Shared parameters and the store that holds them.
//!
//! Parameters are either dense tensors or sparse row tables. A
//! [`ParameterStore`] exposes an immutable snapshot for replicas to read and
//! an all-or-nothing batched update used once per finalized round.
//!
//! # Example
//!
//! ```no_run
//! use syncrep_core::parameters::{
//!     DenseTensor, InMemoryParameterStore, Parameter, ParameterSet, ParameterStore,
//! };
//!
//! # async fn example() -> syncrep_core::Result<()> {
//! let store = InMemoryParameterStore::new();
//! store
//!     .initialize(ParameterSet::new().with("v0", Parameter::Dense(DenseTensor::scalar(0.0))))
//!     .await?;
//!
//! let snapshot = store.snapshot().await?;
//! assert_eq!(snapshot.len(), 1);
//! # Ok(())
//! # }
//! ```

mod memory;
mod set;
mod traits;

pub use memory::InMemoryParameterStore;
pub use set::{DenseTensor, Parameter, ParameterLayout, ParameterSet, SparseTable};
pub use traits::ParameterStore;
