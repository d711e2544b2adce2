//! Projection configuration
//!
//! All tunable parameters in one place. Loaded from TOML at startup,
//! falls back to defaults if no config file exists.

use avatarlink_core::{Error, Result};
use avatarlink_governance::{
    ConsentPolicy, HarmPolicy, RegexHarmPolicy, SafetyValidator, TokenHarmPolicy,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Top-level projection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ProjectionConfig {
    /// Per-session channel sizing.
    pub queues: QueueConfig,
    /// Deadlines for driver calls.
    pub driver: DriverConfig,
    /// Emergency withdrawal budget.
    pub emergency: EmergencyConfig,
    /// Health thresholds watched during a session.
    pub watchdog: WatchdogConfig,
    /// Harm policy and allowlist extensions.
    pub safety: SafetyConfig,
    pub consent: ConsentConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub command_capacity: usize,
    pub sensor_capacity: usize,
    /// How long `send_command` waits for room before failing with QueueFull.
    pub enqueue_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DriverConfig {
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub disconnect_timeout_ms: u64,
    /// Sensor read cadence. Drivers are pull-based.
    pub sensor_interval_ms: u64,
    /// Upper bound on waiting for queued commands during graceful withdrawal.
    pub drain_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmergencyConfig {
    /// The state transition must be visible within this budget.
    pub budget_ms: u64,
    /// Detached disconnect deadline after an emergency.
    pub disconnect_timeout_ms: u64,
}

/// Bounds on a numeric sensor field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct FieldLimit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub min_battery: f64,
    pub max_temperature: f64,
    /// Extra limits keyed by top-level payload field.
    pub limits: BTreeMap<String, FieldLimit>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SafetyConfig {
    /// Substring tokens added to the default harm list.
    pub extra_harm_patterns: Vec<String>,
    /// Case-insensitive regular expressions checked after the tokens.
    pub harm_regexes: Vec<String>,
    pub extra_safe_actions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ConsentConfig {
    pub policy: ConsentPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AuditConfig {
    /// Append session records and checkpoints as JSON lines.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonl_path: Option<PathBuf>,
}

// ============================================================
// Defaults
// ============================================================

impl Default for QueueConfig {
    fn default() -> Self {
        Self { command_capacity: 100, sensor_capacity: 1000, enqueue_timeout_ms: 1000 }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            command_timeout_ms: 2000,
            disconnect_timeout_ms: 2000,
            sensor_interval_ms: 100,
            drain_timeout_ms: 5000,
        }
    }
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self { budget_ms: 100, disconnect_timeout_ms: 500 }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { enabled: true, min_battery: 0.1, max_temperature: 70.0, limits: BTreeMap::new() }
    }
}

// ============================================================
// Loading
// ============================================================

impl ProjectionConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match Self::from_toml_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}; using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Strict parse: syntax and range errors are reported.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the current config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.queues.command_capacity == 0 || self.queues.sensor_capacity == 0 {
            return Err(Error::Config("queue capacities must be positive".into()));
        }
        if self.emergency.budget_ms == 0 {
            return Err(Error::Config("emergency.budget_ms must be positive".into()));
        }
        if self.driver.sensor_interval_ms == 0 {
            return Err(Error::Config("driver.sensor_interval_ms must be positive".into()));
        }
        for (field, limit) in &self.watchdog.limits {
            if let (Some(min), Some(max)) = (limit.min, limit.max) {
                if min > max {
                    return Err(Error::Config(format!("watchdog limit {} has min > max", field)));
                }
            }
        }
        Ok(())
    }
}

impl QueueConfig {
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }
}

impl DriverConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn sensor_interval(&self) -> Duration {
        Duration::from_millis(self.sensor_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl EmergencyConfig {
    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}

impl SafetyConfig {
    /// Default validator extended with the configured patterns and actions.
    pub fn build_validator(&self) -> Result<SafetyValidator> {
        let mut tokens = TokenHarmPolicy::default();
        tokens.extend(self.extra_harm_patterns.iter().cloned());
        let mut policies: Vec<Arc<dyn HarmPolicy>> = vec![Arc::new(tokens)];
        if !self.harm_regexes.is_empty() {
            policies.push(Arc::new(RegexHarmPolicy::new(&self.harm_regexes)?));
        }
        Ok(SafetyValidator::new()
            .with_policies(policies)
            .with_safe_actions(self.extra_safe_actions.iter().cloned()))
    }
}
