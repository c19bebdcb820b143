use thiserror::Error;

use crate::sharding::DeviceMeshError;

/// Errors raised by sharding, propagation, collectives and the FSDP runtime.
#[derive(Error, Debug)]
pub enum DistError {
    /// An unsupported or inconsistent combination of options.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The auto-wrap policy is malformed.
    #[error("invalid auto-wrap policy: {0}")]
    InvalidPolicy(String),

    /// No rule and no strategy are registered for an operator.
    #[error("Operator {0} does not have a sharding strategy registered.")]
    NoShardingStrategy(String),

    /// A sharding rule or strategy failed for an operator.
    #[error("Sharding propagation failed on op {op}: {reason}")]
    PropagationFailed {
        /// Operator name.
        op: String,
        /// Underlying failure.
        reason: String,
    },

    /// The requested combination is recognized but not supported.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// An operation was attempted in the wrong training state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A collective failed or its peers disagreed.
    #[error("collective error: {0}")]
    Collective(String),

    /// A deadline expired.
    #[error("timed out after {timeout_ms}ms waiting for {what}")]
    Timeout {
        /// What was being waited on.
        what: String,
        /// The deadline that expired.
        timeout_ms: u128,
    },

    /// A rendezvous store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Device mesh construction failed.
    #[error(transparent)]
    Mesh(#[from] DeviceMeshError),

    /// A tensor operation failed.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Reading or writing a file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// (De)serialization failed.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, DistError>;
