// syncrep-core/src/aggregation/mod.rs

//! Contribution tagging, per-parameter accumulation and averaging.
//!
//! - [`Delta`] / [`Contribution`]: what a replica submits for one parameter,
//!   tagged with the round of the token it consumed.
//! - [`ContributionAccumulator`]: collects contributions for the expected
//!   round, drops stale ones and averages at quorum.
//! - [`UpdateRule`]: how an averaged delta is folded into a parameter.

mod accumulator;
mod contribution;
mod update;

pub use accumulator::{Admission, ContributionAccumulator};
pub use contribution::{Contribution, Delta, SparseDelta};
pub use update::UpdateRule;
