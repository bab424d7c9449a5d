// syncrep-core/src/aggregation/update.rs

//! Rules for folding an averaged delta into a parameter.

use crate::config::{UpdateConfig, UpdateRuleKind};

use super::Delta;

/// The update applied to the averaged delta of each finalized round.
///
/// The parameter store only ever adds; a rule decides what gets added.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpdateRule {
    /// Add the averaged delta unchanged.
    Add,
    /// Treat the averaged delta as a gradient and step against it.
    Sgd { learning_rate: f32 },
}

impl UpdateRule {
    pub fn from_config(config: &UpdateConfig) -> Self {
        match config.rule {
            UpdateRuleKind::Add => Self::Add,
            UpdateRuleKind::Sgd => Self::Sgd {
                learning_rate: config.learning_rate,
            },
        }
    }

    /// Turns an averaged delta into the increment written to the store.
    pub fn increment(&self, averaged: Delta) -> Delta {
        match self {
            Self::Add => averaged,
            Self::Sgd { learning_rate } => averaged.scaled(-learning_rate),
        }
    }
}
