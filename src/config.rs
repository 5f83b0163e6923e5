//! Run configuration for the coordinator and the clients.
//!
//! Both configs deserialize from JSON with per-field defaults, so a file only
//! needs the values it overrides. Binaries apply CLI flags on top and call
//! `validate()` before anything is started.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::common::{BATCH_SIZE, LOCAL_EPOCHS, TEST_METRICS_FILE, TRAIN_METRICS_FILE, TRAIN_ROWS};
use crate::error::ConfigError;

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn check_fraction(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::invalid(field, format!("must be in [0, 1], got {value}")));
    }
    Ok(())
}

/// Client selection thresholds for the FedAvg strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Share of available clients sampled for training. Default: **1.0**.
    pub fraction_fit: f64,
    /// Share of available clients sampled for evaluation; `0` disables
    /// evaluation. Default: **1.0**.
    pub fraction_evaluate: f64,
    /// Fewest usable fit contributions a round may aggregate. Default: **10**.
    pub min_fit_clients: usize,
    /// Fewest clients sampled for evaluation. Default: **2**.
    pub min_evaluate_clients: usize,
    /// Clients that must be registered before a round starts. Default: **10**.
    pub min_available_clients: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            fraction_fit: 1.0,
            fraction_evaluate: 1.0,
            min_fit_clients: 10,
            min_evaluate_clients: 2,
            min_available_clients: 10,
        }
    }
}

impl StrategyConfig {
    /// Same threshold for every phase, the usual setup for small deployments.
    pub fn with_min_clients(n: usize) -> Self {
        Self {
            min_fit_clients: n,
            min_evaluate_clients: n,
            min_available_clients: n,
            ..Self::default()
        }
    }

    /// `max(floor(available * fraction_fit), min_fit_clients)`.
    pub fn num_fit_clients(&self, available: usize) -> usize {
        sample_size(available, self.fraction_fit, self.min_fit_clients)
    }

    /// `max(floor(available * fraction_evaluate), min_evaluate_clients)`.
    pub fn num_evaluate_clients(&self, available: usize) -> usize {
        sample_size(available, self.fraction_evaluate, self.min_evaluate_clients)
    }

    pub fn evaluation_enabled(&self) -> bool {
        self.fraction_evaluate > 0.0
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_fraction("fraction_fit", self.fraction_fit)?;
        check_fraction("fraction_evaluate", self.fraction_evaluate)?;
        if self.fraction_fit == 0.0 {
            return Err(ConfigError::invalid("fraction_fit", "must be > 0"));
        }
        if self.min_fit_clients == 0 {
            return Err(ConfigError::invalid("min_fit_clients", "must be >= 1"));
        }
        if self.min_available_clients < self.min_fit_clients {
            return Err(ConfigError::invalid(
                "min_available_clients",
                format!(
                    "must be >= min_fit_clients ({}), got {}",
                    self.min_fit_clients, self.min_available_clients
                ),
            ));
        }
        if self.evaluation_enabled() && self.min_available_clients < self.min_evaluate_clients {
            return Err(ConfigError::invalid(
                "min_available_clients",
                format!(
                    "must be >= min_evaluate_clients ({}), got {}",
                    self.min_evaluate_clients, self.min_available_clients
                ),
            ));
        }
        Ok(())
    }
}

fn sample_size(available: usize, fraction: f64, min: usize) -> usize {
    let share = (available as f64 * fraction).floor() as usize;
    share.max(min)
}

/// What to do when a round cannot gather enough clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Extra attempts per round after the first. `0` aborts immediately.
    pub max_retries: u32,
    /// Pause between attempts, in milliseconds.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Number of rounds in a run. Default: **10**.
    pub num_rounds: u64,
    /// Bound on every single client call. Default: **600 s**.
    pub round_timeout_secs: u64,
    /// How long a round waits for `min_available_clients`. Default: **300 s**.
    pub availability_timeout_secs: u64,
    pub retry: RetryPolicy,
    /// Seed for client sampling; `None` draws from entropy.
    pub seed: Option<u64>,
    pub strategy: StrategyConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            num_rounds: 10,
            round_timeout_secs: 600,
            availability_timeout_secs: 300,
            retry: RetryPolicy::default(),
            seed: None,
            strategy: StrategyConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        read_json(path)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_secs(self.round_timeout_secs)
    }

    pub fn availability_timeout(&self) -> Duration {
        Duration::from_secs(self.availability_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_rounds == 0 {
            return Err(ConfigError::invalid("num_rounds", "must be >= 1"));
        }
        if self.round_timeout_secs == 0 {
            return Err(ConfigError::invalid("round_timeout_secs", "must be > 0"));
        }
        self.strategy.validate()
    }
}

/// Client configuration: local training hyper-parameters and file locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Local passes over the training rows per Fit call. Default: **5**.
    pub local_epochs: usize,
    /// Default: **4**.
    pub batch_size: usize,
    /// Leading rows used for training; the rest are held out. Default: **8**.
    pub train_rows: usize,
    /// Hidden layer widths of the regressor.
    pub hidden_units: Vec<usize>,
    /// Adam step size. Default: **1e-3**.
    pub learning_rate: f32,
    /// Seed for weight initialisation and batch shuffling.
    pub seed: u64,
    pub data_dir: PathBuf,
    pub train_metrics: PathBuf,
    pub test_metrics: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            local_epochs: LOCAL_EPOCHS,
            batch_size: BATCH_SIZE,
            train_rows: TRAIN_ROWS,
            hidden_units: vec![64, 32, 16, 8, 4],
            learning_rate: 1e-3,
            seed: 0,
            data_dir: PathBuf::from("data"),
            train_metrics: PathBuf::from(TRAIN_METRICS_FILE),
            test_metrics: PathBuf::from(TEST_METRICS_FILE),
        }
    }
}

impl ClientConfig {
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        read_json(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_epochs == 0 {
            return Err(ConfigError::invalid("local_epochs", "must be >= 1"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be >= 1"));
        }
        if self.train_rows == 0 {
            return Err(ConfigError::invalid("train_rows", "must be >= 1"));
        }
        if self.hidden_units.iter().any(|&u| u == 0) {
            return Err(ConfigError::invalid("hidden_units", "layer widths must be > 0"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ConfigError::invalid(
                "learning_rate",
                format!("must be a positive finite number, got {}", self.learning_rate),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ServerConfig::default().validate().unwrap();
        ClientConfig::default().validate().unwrap();
    }

    #[test]
    fn sample_size_honours_fraction_and_floor() {
        let s = StrategyConfig {
            fraction_fit: 0.5,
            min_fit_clients: 2,
            ..StrategyConfig::with_min_clients(2)
        };
        assert_eq!(s.num_fit_clients(10), 5);
        assert_eq!(s.num_fit_clients(3), 2);
        assert_eq!(StrategyConfig::with_min_clients(3).num_fit_clients(4), 4);
    }

    #[test]
    fn min_available_below_min_fit_is_rejected() {
        let s = StrategyConfig {
            min_fit_clients: 3,
            min_available_clients: 2,
            ..StrategyConfig::default()
        };
        match s.validate() {
            Err(ConfigError::InvalidValue { field, .. }) => {
                assert_eq!(field, "min_available_clients")
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn fractions_outside_unit_interval_are_rejected() {
        let s = StrategyConfig {
            fraction_evaluate: 1.5,
            ..StrategyConfig::default()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn zero_rounds_are_rejected() {
        let cfg = ServerConfig {
            num_rounds: 0,
            ..ServerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.json");
        std::fs::write(
            &path,
            r#"{
                "num_rounds": 2,
                "strategy": { "min_fit_clients": 3, "min_available_clients": 3 }
            }"#,
        )
        .unwrap();
        let cfg = ServerConfig::from_json(&path).unwrap();
        assert_eq!(cfg.num_rounds, 2);
        assert_eq!(cfg.strategy.min_fit_clients, 3);
        assert_eq!(cfg.strategy.fraction_fit, 1.0);
        assert_eq!(cfg.retry.max_retries, 0);
        cfg.validate().unwrap();
    }

    #[test]
    fn malformed_json_reports_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            ClientConfig::from_json(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
