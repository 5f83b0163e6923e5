//! Error types for every failure class of a federated run.
//!
//! Library code returns these typed errors; binaries and the model boundary
//! work with `anyhow`. [`ClientError`] is the only type that crosses the RPC
//! boundary and converts to and from [`tonic::Status`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::common::ClientId;

/// Parameter set validation failures.
#[derive(Debug, Error)]
pub enum ParamError {
    #[error("parameter set has {actual} tensors, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("tensor {index} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        index: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("tensor {index} carries {actual} values for shape {shape:?}")]
    Malformed {
        index: usize,
        shape: Vec<usize>,
        actual: usize,
    },

    #[error("missing parameters in message")]
    Missing,

    #[error("cannot access parameter file `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot decode parameter file `{path}`: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// FedAvg aggregation failures.
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("no contributions to aggregate")]
    NoContributions,

    #[error("total contribution weight is zero")]
    ZeroTotalWeight,

    #[error("contribution from client {client_id} does not match: {source}")]
    Shape {
        client_id: ClientId,
        #[source]
        source: ParamError,
    },
}

/// Metrics computation and metrics log failures.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("cannot compute metrics over zero rows")]
    Empty,

    #[error("prediction shape {actual:?} does not match target shape {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("cannot append to metrics log `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write metrics row to `{path}`: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Partition loading failures.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("cannot read partition `{path}`: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("partition `{path}` has no column `{column}`")]
    MissingColumn { path: PathBuf, column: String },

    #[error("partition `{path}` row {row}, column `{column}`: cannot parse `{value}` as a number")]
    Parse {
        path: PathBuf,
        row: usize,
        column: String,
        value: String,
    },

    #[error("partition `{0}` has no rows")]
    Empty(PathBuf),

    #[error("features have {features} rows but targets have {targets}")]
    RowMismatch { features: usize, targets: usize },

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

/// Configuration validation and loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("cannot read config file `{path}`: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Failures of a single client call, seen from either side of the wire.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("global parameters rejected: {0}")]
    Parameters(#[from] ParamError),

    #[error("training partition is empty")]
    EmptyTrainingPartition,

    #[error("metrics: {0}")]
    Metrics(#[from] MetricsError),

    #[error("local model failure: {0}")]
    Model(String),

    #[error("local task aborted: {0}")]
    Join(String),

    #[error("rpc failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("transport failure: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("no response within {0:?}")]
    Timeout(Duration),
}

impl From<ClientError> for tonic::Status {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Rpc(status) => status,
            ClientError::Parameters(e) => tonic::Status::invalid_argument(e.to_string()),
            ClientError::EmptyTrainingPartition => {
                tonic::Status::failed_precondition(err.to_string())
            }
            ClientError::Timeout(_) => tonic::Status::deadline_exceeded(err.to_string()),
            other => tonic::Status::internal(other.to_string()),
        }
    }
}

/// Which half of a round an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fit,
    Evaluate,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Fit => write!(f, "fit"),
            Phase::Evaluate => write!(f, "evaluate"),
        }
    }
}

/// A round that could not complete. The global parameters are untouched.
#[derive(Debug, Error)]
pub enum RoundError {
    #[error("round {round}: {available} clients available, {required} required")]
    InsufficientClients {
        round: u64,
        available: usize,
        required: usize,
    },

    #[error("round {round} {phase}: {accepted} usable contributions, {required} required")]
    InsufficientParticipation {
        round: u64,
        phase: Phase,
        accepted: usize,
        required: usize,
    },

    #[error("round {round} aggregation failed: {source}")]
    Aggregation {
        round: u64,
        #[source]
        source: AggregationError,
    },
}

impl RoundError {
    /// Whether the retry policy may run the round again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RoundError::InsufficientClients { .. } | RoundError::InsufficientParticipation { .. }
        )
    }
}

/// A training run that stopped before its configured number of rounds.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("no initial parameters: {0}")]
    NoInitialParameters(String),

    #[error("round {round} failed after {attempts} attempt(s): {source}")]
    Round {
        round: u64,
        attempts: u32,
        #[source]
        source: RoundError,
    },
}
