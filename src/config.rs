use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::{FedError, Result};

/// Seed shared by every worker's sketch so that all of them hash coordinates the same way.
pub const DEFAULT_SKETCH_SEED: u64 = 42;

/// Hyperparameters of a federated sketched-SGD run.
///
/// Every worker receives the same copy; the sketch shape and the sketching
/// rules must match across workers for aggregation to be meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FedConfig {
    pub num_workers: usize,
    /// Final amount of sketched coordinates kept per round.
    pub k: usize,
    /// Over-recovery multiplier, `p2 * k` candidates are pulled from the sketch.
    pub p2: usize,
    pub num_rows: usize,
    pub num_cols: usize,
    #[serde(default = "default_num_blocks")]
    pub num_blocks: usize,
    pub lr: f32,
    #[serde(default)]
    pub momentum: f32,
    #[serde(default)]
    pub dampening: f32,
    #[serde(default)]
    pub weight_decay: f32,
    #[serde(default)]
    pub nesterov: bool,
    pub participation_rate: f64,
    #[serde(default)]
    pub sketch_biases: bool,
    #[serde(default)]
    pub sketch_params_larger_than: usize,
    /// Participant sampling seed, OS entropy when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_sketch_seed")]
    pub sketch_seed: u64,
}

fn default_num_blocks() -> usize {
    1
}

fn default_sketch_seed() -> u64 {
    DEFAULT_SKETCH_SEED
}

impl FedConfig {
    /// Parses and validates a configuration from a JSON string.
    ///
    /// # Arguments
    /// * `raw` - The JSON document.
    ///
    /// # Returns
    /// A validated `FedConfig` or the parse/validation error.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a configuration file.
    ///
    /// # Arguments
    /// * `path` - Path to a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Checks the invariants the rest of the crate relies on.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("num_workers", self.num_workers),
            ("k", self.k),
            ("p2", self.p2),
            ("num_rows", self.num_rows),
            ("num_cols", self.num_cols),
            ("num_blocks", self.num_blocks),
        ];

        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(FedError::InvalidConfig(format!("{name} must be positive")));
        }

        if !(self.participation_rate > 0.0 && self.participation_rate <= 1.0) {
            return Err(FedError::InvalidConfig(format!(
                "participation_rate must be in (0, 1], got {}",
                self.participation_rate
            )));
        }

        if !self.lr.is_finite() || self.lr < 0.0 {
            return Err(FedError::InvalidConfig(format!(
                "lr must be a non negative number, got {}",
                self.lr
            )));
        }

        Ok(())
    }

    /// Amount of workers sampled on each training round, `ceil(rate * num_workers)`.
    pub fn participants_per_round(&self) -> usize {
        let exact = self.participation_rate * self.num_workers as f64;

        // 0.3 * 10 is not exactly 3.0 in floating point.
        let count = if (exact - exact.round()).abs() < 1e-9 {
            exact.round()
        } else {
            exact.ceil()
        };

        (count as usize).clamp(1, self.num_workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = r#"{
        "num_workers": 4,
        "k": 10,
        "p2": 2,
        "num_rows": 5,
        "num_cols": 100,
        "lr": 0.1,
        "momentum": 0.9,
        "participation_rate": 0.5
    }"#;

    #[test]
    fn parsing_fills_in_defaults() {
        let config = FedConfig::from_json_str(RAW).unwrap();

        assert_eq!(config.num_blocks, 1);
        assert_eq!(config.sketch_seed, DEFAULT_SKETCH_SEED);
        assert_eq!(config.weight_decay, 0.0);
        assert!(!config.nesterov);
        assert!(!config.sketch_biases);
        assert_eq!(config.seed, None);
    }

    #[test]
    fn zero_sized_sketch_is_rejected() {
        let raw = RAW.replace("\"num_cols\": 100", "\"num_cols\": 0");
        let err = FedConfig::from_json_str(&raw).unwrap_err();
        assert!(matches!(err, FedError::InvalidConfig(msg) if msg.contains("num_cols")));
    }

    #[test]
    fn participation_rate_out_of_range_is_rejected() {
        let raw = RAW.replace("0.5", "1.5");
        assert!(FedConfig::from_json_str(&raw).is_err());

        let raw = RAW.replace("0.5", "0.0");
        assert!(FedConfig::from_json_str(&raw).is_err());
    }

    #[test]
    fn malformed_json_is_a_json_error() {
        let err = FedConfig::from_json_str("{ \"k\": ").unwrap_err();
        assert!(matches!(err, FedError::Json(_)));
    }

    #[test]
    fn participants_per_round_rounds_up() {
        let mut config = FedConfig::from_json_str(RAW).unwrap();
        assert_eq!(config.participants_per_round(), 2);

        config.participation_rate = 0.3;
        config.num_workers = 10;
        assert_eq!(config.participants_per_round(), 3);

        config.participation_rate = 0.25;
        config.num_workers = 5;
        assert_eq!(config.participants_per_round(), 2);

        config.participation_rate = 0.01;
        assert_eq!(config.participants_per_round(), 1);
    }
}
