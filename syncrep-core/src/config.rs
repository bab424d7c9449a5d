// syncrep-core/src/config.rs

//! Configuration management for synchronous replica aggregation.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::error::{Result, RuntimeError};

// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub aggregation: AggregationConfig,
    pub update: UpdateConfig,
}

/// How many tokens are pushed into the dispenser after each finalize.
///
/// In TOML a policy is `"quorum"`, `"total_replicas"`, a bare count such as
/// `3`, or `{ fixed = 3 }`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "TokenPolicyRepr")]
pub enum TokenPolicy {
    /// One token per required contribution.
    #[default]
    Quorum,
    /// One token per replica in the job.
    TotalReplicas,
    /// A fixed number of tokens.
    Fixed(u32),
}

impl TokenPolicy {
    /// Resolves the policy to a token count for the given job shape.
    pub fn count(&self, replicas_to_aggregate: u32, total_replicas: u32) -> u32 {
        match self {
            Self::Quorum => replicas_to_aggregate,
            Self::TotalReplicas => total_replicas,
            Self::Fixed(n) => *n,
        }
    }
}

// Every TOML spelling a token policy may take.
#[derive(Deserialize)]
#[serde(untagged)]
enum TokenPolicyRepr {
    Count(u32),
    Named(String),
    Table { fixed: u32 },
}

impl TryFrom<TokenPolicyRepr> for TokenPolicy {
    type Error = RuntimeError;

    fn try_from(repr: TokenPolicyRepr) -> Result<Self> {
        match repr {
            TokenPolicyRepr::Count(n) | TokenPolicyRepr::Table { fixed: n } => Ok(Self::Fixed(n)),
            TokenPolicyRepr::Named(name) => name.parse(),
        }
    }
}

impl FromStr for TokenPolicy {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "quorum" => Ok(Self::Quorum),
            "total_replicas" | "total-replicas" => Ok(Self::TotalReplicas),
            other => other
                .parse::<u32>()
                .map(Self::Fixed)
                .map_err(|e| RuntimeError::config_with_source(
                    format!("invalid token policy '{}'", s),
                    e,
                )),
        }
    }
}

/// Who pushes tokens after a finalize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplenishMode {
    /// The call that completed the quorum replenishes before returning.
    #[default]
    Inline,
    /// The chief's background watcher replenishes.
    Chief,
}

/// Rule used to fold an averaged delta into a parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateRuleKind {
    /// `param += avg`
    #[default]
    Add,
    /// `param -= learning_rate * avg`
    Sgd,
}

// Aggregation barrier options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    // Contributions needed to finalize a round.
    pub replicas_to_aggregate: u32,
    // Replicas in the job, backups included.
    pub total_replicas: u32,
    // Index of the replica acting as chief.
    pub chief_index: u32,
    // Tokens pushed after every finalize.
    pub tokens_per_round: TokenPolicy,
    // Tokens pushed by the chief at bootstrap.
    pub seed_tokens: TokenPolicy,
    pub replenish_mode: ReplenishMode,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            replicas_to_aggregate: 1,
            total_replicas: 1,
            chief_index: 0,
            tokens_per_round: TokenPolicy::Quorum,
            seed_tokens: TokenPolicy::Quorum,
            replenish_mode: ReplenishMode::Inline,
        }
    }
}

impl AggregationConfig {
    /// Number of tokens pushed after each finalize.
    pub fn tokens_per_round(&self) -> u32 {
        self.tokens_per_round
            .count(self.replicas_to_aggregate, self.total_replicas)
    }

    /// Number of tokens the chief seeds at bootstrap.
    pub fn seed_tokens(&self) -> u32 {
        self.seed_tokens
            .count(self.replicas_to_aggregate, self.total_replicas)
    }
}

/// Update rule options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    pub rule: UpdateRuleKind,
    /// Step size for the `sgd` rule; ignored by `add`.
    pub learning_rate: f32,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            rule: UpdateRuleKind::Add,
            learning_rate: 1.0,
        }
    }
}

impl FromStr for RuntimeConfig {
    type Err = RuntimeError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| RuntimeError::config_with_source("failed to parse TOML config", e))
    }
}

impl RuntimeConfig {
    /// Builds a configuration for `total_replicas` replicas aggregating
    /// `replicas_to_aggregate` contributions per round.
    pub fn with_replicas(replicas_to_aggregate: u32, total_replicas: u32) -> Self {
        Self {
            aggregation: AggregationConfig {
                replicas_to_aggregate,
                total_replicas,
                ..Default::default()
            },
            update: UpdateConfig::default(),
        }
    }

    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::io_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `SYNCREP_`. For example:
    // - `SYNCREP_REPLICAS_TO_AGGREGATE` overrides `aggregation.replicas_to_aggregate`
    // - `SYNCREP_TOKENS_PER_ROUND` overrides `aggregation.tokens_per_round`
    //   ("quorum", "total_replicas" or a number)
    // - `SYNCREP_UPDATE_RULE` overrides `update.rule` ("add" or "sgd")
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("SYNCREP_REPLICAS_TO_AGGREGATE") {
            if let Ok(v) = val.parse() {
                self.aggregation.replicas_to_aggregate = v;
            }
        }
        if let Ok(val) = std::env::var("SYNCREP_TOTAL_REPLICAS") {
            if let Ok(v) = val.parse() {
                self.aggregation.total_replicas = v;
            }
        }
        if let Ok(val) = std::env::var("SYNCREP_CHIEF_INDEX") {
            if let Ok(v) = val.parse() {
                self.aggregation.chief_index = v;
            }
        }
        if let Ok(val) = std::env::var("SYNCREP_TOKENS_PER_ROUND") {
            if let Ok(v) = val.parse() {
                self.aggregation.tokens_per_round = v;
            }
        }
        if let Ok(val) = std::env::var("SYNCREP_SEED_TOKENS") {
            if let Ok(v) = val.parse() {
                self.aggregation.seed_tokens = v;
            }
        }
        if let Ok(val) = std::env::var("SYNCREP_REPLENISH_MODE") {
            match val.to_lowercase().as_str() {
                "inline" => self.aggregation.replenish_mode = ReplenishMode::Inline,
                "chief" => self.aggregation.replenish_mode = ReplenishMode::Chief,
                _ => {} // ignore invalid values
            }
        }

        if let Ok(val) = std::env::var("SYNCREP_UPDATE_RULE") {
            match val.to_lowercase().as_str() {
                "add" => self.update.rule = UpdateRuleKind::Add,
                "sgd" => self.update.rule = UpdateRuleKind::Sgd,
                _ => {}
            }
        }
        if let Ok(val) = std::env::var("SYNCREP_LEARNING_RATE") {
            if let Ok(v) = val.parse() {
                self.update.learning_rate = v;
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        let agg = &self.aggregation;

        if agg.replicas_to_aggregate == 0 {
            return Err(RuntimeError::config(
                "aggregation.replicas_to_aggregate must be greater than 0",
            ));
        }
        if agg.total_replicas < agg.replicas_to_aggregate {
            return Err(RuntimeError::config(format!(
                "aggregation.total_replicas ({}) must be at least replicas_to_aggregate ({})",
                agg.total_replicas, agg.replicas_to_aggregate
            )));
        }
        if agg.chief_index >= agg.total_replicas {
            return Err(RuntimeError::config(format!(
                "aggregation.chief_index ({}) must be less than total_replicas ({})",
                agg.chief_index, agg.total_replicas
            )));
        }
        if agg.tokens_per_round() == 0 {
            return Err(RuntimeError::config(
                "aggregation.tokens_per_round must resolve to at least 1 token",
            ));
        }
        if agg.seed_tokens() == 0 {
            return Err(RuntimeError::config(
                "aggregation.seed_tokens must resolve to at least 1 token",
            ));
        }

        if self.update.rule == UpdateRuleKind::Sgd
            && !(self.update.learning_rate.is_finite() && self.update.learning_rate > 0.0)
        {
            return Err(RuntimeError::config(
                "update.learning_rate must be a positive finite number",
            ));
        }

        Ok(())
    }
}
