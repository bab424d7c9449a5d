// syncrep-core/src/aggregation/accumulator.rs

//! Per-parameter collection of round-tagged contributions.
//!
//! An accumulator only ever holds contributions for one round: the round the
//! coordinator currently expects. Anything tagged with another round is
//! dropped on arrival. Accumulators take `&mut self` and never block; the
//! coordinator serializes access to them.

use std::collections::BTreeMap;

use super::{Contribution, Delta, SparseDelta};
use crate::error::{Result, RuntimeError};
use crate::parameters::ParameterLayout;

/// What happened to a submitted contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Tagged with a round other than the expected one; discarded.
    Stale,
}

/// Collects contributions for one parameter until quorum.
#[derive(Debug)]
pub struct ContributionAccumulator {
    name: String,
    layout: ParameterLayout,
    required_count: usize,
    expected_round: u64,
    pending: Vec<Delta>,
    faulted: bool,
}

impl ContributionAccumulator {
    pub fn new(
        name: impl Into<String>,
        layout: ParameterLayout,
        required_count: usize,
        expected_round: u64,
    ) -> Self {
        Self {
            name: name.into(),
            layout,
            required_count,
            expected_round,
            pending: Vec::with_capacity(required_count),
            faulted: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expected_round(&self) -> u64 {
        self.expected_round
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn required_count(&self) -> usize {
        self.required_count
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    /// True once exactly `required_count` contributions are pending.
    pub fn is_ready(&self) -> bool {
        !self.faulted && self.pending.len() == self.required_count
    }

    /// Decides what `submit` would do with `contribution`, without recording
    /// anything.
    ///
    /// # Errors
    ///
    /// Returns a `Parameter` error for a delta that does not fit this
    /// parameter, and `QuorumMismatch` when accepting would exceed quorum or
    /// the round is already frozen.
    pub fn classify(&self, contribution: &Contribution) -> Result<Admission> {
        contribution.delta.check_layout(&self.name, self.layout)?;

        if contribution.round != self.expected_round {
            return Ok(Admission::Stale);
        }
        if self.faulted || self.pending.len() >= self.required_count {
            return Err(RuntimeError::quorum_mismatch(
                self.name.as_str(),
                self.expected_round,
                self.pending.len() + 1,
                self.required_count,
            ));
        }
        Ok(Admission::Accepted)
    }

    /// Records `contribution` if it is tagged with the expected round.
    ///
    /// A quorum overflow freezes the round: this and every later contribution
    /// for it is refused, and the accumulator never reports ready for it.
    pub fn submit(&mut self, contribution: Contribution) -> Result<Admission> {
        match self.classify(&contribution) {
            Ok(Admission::Accepted) => {
                self.pending.push(contribution.delta);
                Ok(Admission::Accepted)
            }
            Ok(Admission::Stale) => {
                tracing::debug!(
                    parameter = %self.name,
                    tagged = contribution.round,
                    expected = self.expected_round,
                    "dropping stale contribution"
                );
                Ok(Admission::Stale)
            }
            Err(e) => {
                if e.is_fatal_to_round() {
                    self.mark_faulted();
                }
                Err(e)
            }
        }
    }

    /// Freezes the current round.
    pub fn mark_faulted(&mut self) {
        if !self.faulted {
            tracing::error!(
                parameter = %self.name,
                round = self.expected_round,
                pending = self.pending.len(),
                required = self.required_count,
                "quorum exceeded, freezing round"
            );
        }
        self.faulted = true;
    }

    /// Returns the averaged delta iff quorum is met, without clearing state.
    ///
    /// Call [`advance`](Self::advance) once the average has been applied.
    ///
    /// # Errors
    ///
    /// Returns `QuorumMismatch` if the round is frozen.
    pub fn try_finalize(&self) -> Result<Option<Delta>> {
        if self.faulted {
            return Err(RuntimeError::quorum_mismatch(
                self.name.as_str(),
                self.expected_round,
                self.pending.len(),
                self.required_count,
            ));
        }
        if self.pending.len() != self.required_count {
            return Ok(None);
        }
        Ok(Some(match self.layout {
            ParameterLayout::Dense { len } => average_dense(&self.pending, len),
            ParameterLayout::Sparse { .. } => average_sparse(&self.pending),
        }))
    }

    /// Clears pending contributions and starts expecting `round`.
    pub fn advance(&mut self, round: u64) {
        self.pending.clear();
        self.expected_round = round;
        self.faulted = false;
    }
}

fn average_dense(pending: &[Delta], len: usize) -> Delta {
    let mut sum = vec![0.0f32; len];
    for delta in pending {
        if let Delta::Dense(values) = delta {
            for (s, v) in sum.iter_mut().zip(values) {
                *s += v;
            }
        }
    }
    let n = pending.len() as f32;
    sum.iter_mut().for_each(|s| *s /= n);
    Delta::Dense(sum)
}

// Rows are averaged over the deltas that touched them, not over quorum.
fn average_sparse(pending: &[Delta]) -> Delta {
    let mut rows: BTreeMap<usize, (Vec<f32>, u32)> = BTreeMap::new();
    for delta in pending {
        if let Delta::Sparse(sparse) = delta {
            for (index, row) in sparse.rows() {
                let (sum, count) = rows
                    .entry(*index)
                    .or_insert_with(|| (vec![0.0; row.len()], 0));
                for (s, v) in sum.iter_mut().zip(row) {
                    *s += v;
                }
                *count += 1;
            }
        }
    }

    let rows = rows
        .into_iter()
        .map(|(index, (mut sum, count))| {
            let n = count as f32;
            sum.iter_mut().for_each(|s| *s /= n);
            (index, sum)
        })
        .collect();
    Delta::Sparse(SparseDelta::from_sorted_unique(rows))
}
