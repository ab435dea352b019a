//! Engine and sync configuration.
//!
//! Every section has serde defaults so a partial config file (or none at all)
//! yields a working instance. The numeric defaults match the constants the
//! engine was tuned with: 1 s push throttle, sqrt(2) backoff factor, 20%
//! jitter, 2000 Monte-Carlo trials, 0.9 predictor decay.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub history: HistoryConfig,
    pub forecast: ForecastConfig,
    pub predictor: PredictorConfig,
    pub logging: LoggingConfig,
}

/// Push throttle, retry backoff, and batching knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Steady-state delay between queued remote calls, in milliseconds.
    pub interval_ms: u64,
    /// First retry delay after a failed remote call.
    pub min_retry_ms: u64,
    /// Backoff ceiling.
    pub max_retry_ms: u64,
    /// Multiplier applied to the retry delay after each failure.
    pub retry_factor: f64,
    /// Uniform jitter ratio applied to both throttle and retry delays.
    pub jitter_ratio: f64,
    /// Patches pushed per `CreatePatches` batch.
    pub push_batch: usize,
    /// Page size when draining remote pending patches.
    pub pull_page: usize,
    /// When chain replay takes longer than this, a snapshot is written to
    /// bound the next load.
    pub snapshot_threshold_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            min_retry_ms: 1_000,
            max_retry_ms: 300_000,
            retry_factor: std::f64::consts::SQRT_2,
            jitter_ratio: 0.2,
            push_batch: 200,
            pull_page: 2_000,
            snapshot_threshold_ms: 750,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn min_retry(&self) -> Duration {
        Duration::from_millis(self.min_retry_ms)
    }

    pub fn max_retry(&self) -> Duration {
        Duration::from_millis(self.max_retry_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Oldest undo entries beyond this count are discarded.
    pub max_entries: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { max_entries: 1_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    /// Monte-Carlo trial count.
    pub trials: usize,
    /// Recency half-life for calibration-sample weights, in milliseconds.
    pub half_life_ms: u64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            trials: 2_000,
            // ~1 year
            half_life_ms: (365.25 * 86_400.0 * 1_000.0) as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    /// Multiplier applied to existing counts before each increment.
    pub decay: f64,
    /// Suggestions returned by `predicted_next_nodes`.
    pub top_n: usize,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            decay: 0.9,
            top_n: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `BRAID_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_deserializes_to_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.sync.interval_ms, 1_000);
        assert_eq!(config.sync.push_batch, 200);
        assert_eq!(config.forecast.trials, 2_000);
        assert_eq!(config.predictor.top_n, 10);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: Config = serde_json::from_str(r#"{"sync":{"push_batch":50}}"#).unwrap();
        assert_eq!(config.sync.push_batch, 50);
        assert_eq!(config.sync.max_retry_ms, 300_000);
    }
}
