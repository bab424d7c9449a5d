// syncrep-core/src/lib.rs

//! Synchronous Replicas - Core Library
//!
//! This crate provides a round-gated aggregation barrier for data-parallel
//! training: replicas take round tokens, submit tagged contributions, and
//! the first quorum of on-time contributions per round is averaged and
//! applied to shared parameters. Late contributions are dropped.

pub mod aggregation;
pub mod chief;
pub mod config;
pub mod error;
pub mod parameters;
pub mod quorum;
pub mod replica;
pub mod sync;
pub mod tokens;

// Re-export commonly used types for convenience
pub use config::{ReplenishMode, RuntimeConfig, TokenPolicy, UpdateRuleKind};
pub use error::{Result, RuntimeError};

pub use aggregation::{Contribution, Delta, SparseDelta, UpdateRule};
pub use chief::BootstrapState;
pub use parameters::{
    DenseTensor, InMemoryParameterStore, Parameter, ParameterSet, ParameterStore, SparseTable,
};
pub use quorum::{ContributeOutcome, RoundSummary};
pub use replica::{ContributionSource, Replica, RoundReport};
pub use sync::SyncReplicas;
pub use tokens::RoundToken;
