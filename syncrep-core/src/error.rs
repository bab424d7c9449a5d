// syncrep-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {

    #[error("Replica {replica_id} called run_round before the chief signalled readiness")]
    BootstrapOrderViolation {
        replica_id: u32,
    },

    #[error("Bootstrap error: {message}")]
    Bootstrap {
        message: String,
    },

    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Quorum mismatch on '{parameter}' in round {round}: {accepted} contributions accepted, quorum is {required}")]
    QuorumMismatch {
        parameter: String,
        round: u64,
        accepted: usize,
        required: usize,
    },

    #[error("Parameter '{name}' error: {message}")]
    Parameter {
        name: String,
        message: String,
    },

    #[error("Replica {replica_id} out of range (total replicas: {total_replicas})")]
    UnknownReplica {
        replica_id: u32,
        total_replicas: u32,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("I/O error at '{path}': {message}")]
    Io {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

// Convenience constructors
impl RuntimeError {

    pub fn bootstrap_order(replica_id: u32) -> Self {
        Self::BootstrapOrderViolation { replica_id }
    }

    pub fn bootstrap(message: impl Into<String>) -> Self {
        Self::Bootstrap {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn quorum_mismatch(
        parameter: impl Into<String>,
        round: u64,
        accepted: usize,
        required: usize,
    ) -> Self {
        Self::QuorumMismatch {
            parameter: parameter.into(),
            round,
            accepted,
            required,
        }
    }

    pub fn parameter(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parameter {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn unknown_replica(replica_id: u32, total_replicas: u32) -> Self {
        Self::UnknownReplica { replica_id, total_replicas }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn io_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Io {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    /// Returns true for errors that leave the aggregation state unusable for
    /// the current round.
    pub fn is_fatal_to_round(&self) -> bool {
        matches!(self, Self::QuorumMismatch { .. })
    }
}
