//! Configuration for the Drover engine
//!
//! Loaded from `drover.toml` when present, otherwise compiled defaults.
//! All tunables the scheduler, resilience layer, and health sweep consult
//! live here so that tests can construct tight-timing configs directly.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::Result;

/// Engine-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroverConfig {
    /// Soft-dependency priority adjustment K: +K when all "prefers" are
    /// satisfied, -K while any is outstanding. Flat, all-or-nothing.
    #[serde(default = "default_soft_dep_boost")]
    pub soft_dep_boost: i32,

    /// Retry policy for failed tasks
    #[serde(default)]
    pub retry: RetryConfig,

    /// Circuit breaker policy per assignment target
    #[serde(default)]
    pub circuit: CircuitConfig,

    /// Timeouts and sweep cadence
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Retry/backoff policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Absolute retry cap; exceeding it dead-letters the task
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Jitter fraction in [0.0, 1.0] applied to each computed delay
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

/// Circuit breaker policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Failures within the rolling window before the circuit trips
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Rolling window for counting failures, milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Initial open-state cool-down, milliseconds
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Cool-down ceiling for repeated half-open failures, milliseconds
    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,

    /// Jitter fraction applied to the cool-down
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

/// Timeouts and sweep cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// An assignment with no progress within this window is failed
    #[serde(default = "default_assignment_timeout_ms")]
    pub assignment_timeout_ms: u64,

    /// Queued/ready tasks older than this are reported as stuck
    #[serde(default = "default_stuck_timeout_ms")]
    pub stuck_timeout_ms: u64,

    /// Health sweep interval; a safety net, not the primary trigger
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

// Default value providers
fn default_soft_dep_boost() -> i32 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_window_ms() -> u64 {
    30_000
}

fn default_cooldown_ms() -> u64 {
    5_000
}

fn default_max_cooldown_ms() -> u64 {
    60_000
}

fn default_assignment_timeout_ms() -> u64 {
    60_000
}

fn default_stuck_timeout_ms() -> u64 {
    120_000
}

fn default_sweep_interval_ms() -> u64 {
    5_000
}

impl DroverConfig {
    /// Load configuration from `drover.toml` under `root`, or use defaults
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let config_path = root.join("drover.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&content).map_err(|e| {
                crate::DroverError::Other(format!("Failed to parse config file: {}", e))
            })?)
        } else {
            Ok(Self::default())
        }
    }

    /// Write default configuration to `drover.toml` under `root`
    pub fn write_default(root: &Path) -> Result<()> {
        let config_path = root.join("drover.toml");
        let config = Self::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| crate::DroverError::Other(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }
}

impl TimeoutConfig {
    pub fn assignment_timeout(&self) -> Duration {
        Duration::from_millis(self.assignment_timeout_ms)
    }

    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_millis(self.stuck_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for DroverConfig {
    fn default() -> Self {
        Self {
            soft_dep_boost: default_soft_dep_boost(),
            retry: RetryConfig::default(),
            circuit: CircuitConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_ms: default_window_ms(),
            cooldown_ms: default_cooldown_ms(),
            max_cooldown_ms: default_max_cooldown_ms(),
            jitter: default_jitter(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            assignment_timeout_ms: default_assignment_timeout_ms(),
            stuck_timeout_ms: default_stuck_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = DroverConfig::default();
        assert_eq!(config.soft_dep_boost, 5);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.circuit.failure_threshold, 3);
        assert_eq!(config.timeouts.sweep_interval_ms, 5_000);
    }

    #[test]
    fn test_load_missing_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let config = DroverConfig::load_or_default(temp.path()).unwrap();
        assert_eq!(config.soft_dep_boost, 5);
    }

    #[test]
    fn test_write_then_load() {
        let temp = TempDir::new().unwrap();
        DroverConfig::write_default(temp.path()).unwrap();

        let config = DroverConfig::load_or_default(temp.path()).unwrap();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.circuit.cooldown_ms, 5_000);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("drover.toml"),
            "soft_dep_boost = 10\n\n[retry]\nmax_retries = 1\n",
        )
        .unwrap();

        let config = DroverConfig::load_or_default(temp.path()).unwrap();
        assert_eq!(config.soft_dep_boost, 10);
        assert_eq!(config.retry.max_retries, 1);
        // Unspecified sections fall back to defaults
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.circuit.failure_threshold, 3);
    }

    #[test]
    fn test_malformed_config_rejected() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("drover.toml"), "soft_dep_boost = \"lots\"").unwrap();

        assert!(DroverConfig::load_or_default(temp.path()).is_err());
    }

    #[test]
    fn test_duration_accessors() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(timeouts.sweep_interval(), Duration::from_secs(5));
        assert_eq!(timeouts.assignment_timeout(), Duration::from_secs(60));
    }
}
