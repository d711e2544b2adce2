//! Emergency withdrawal watchdog
//!
//! One task per active session, parked on the sensor notification channel and
//! an explicit signal channel. It never polls: it wakes only when a reading
//! arrives, a signal is sent, or the session is cancelled.

use crate::config::{FieldLimit, WatchdogConfig};
use avatarlink_core::{Result, SensorSnapshot, SessionId};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SIGNAL_CAPACITY: usize = 8;

/// Whatever can carry out an emergency withdrawal. Must not block.
pub trait EmergencyHandler: Send + Sync {
    fn emergency_withdraw(&self, session: &SessionId, reason: &str) -> Result<()>;
}

/// Health limits applied to each sensor payload.
#[derive(Clone, Debug, PartialEq)]
pub struct HealthThresholds {
    pub min_battery: f64,
    pub max_temperature: f64,
    pub limits: BTreeMap<String, FieldLimit>,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self::from(&WatchdogConfig::default())
    }
}

impl From<&WatchdogConfig> for HealthThresholds {
    fn from(config: &WatchdogConfig) -> Self {
        Self {
            min_battery: config.min_battery,
            max_temperature: config.max_temperature,
            limits: config.limits.clone(),
        }
    }
}

fn number(payload: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| payload.get(*k).and_then(Value::as_f64))
}

fn flag(payload: &Value, keys: &[&str]) -> bool {
    keys.iter()
        .any(|k| payload.get(*k).and_then(Value::as_bool).unwrap_or(false))
}

impl HealthThresholds {
    /// The first breach found in a payload, described for the audit log.
    pub fn check(&self, payload: &Value) -> Option<String> {
        if flag(payload, &["emergency", "emergency_stop"]) {
            return Some("avatar raised an emergency signal".to_string());
        }
        if let Some(battery) = number(payload, &["battery", "battery_level"]) {
            if battery < self.min_battery {
                return Some(format!(
                    "battery {:.2} below minimum {:.2}",
                    battery, self.min_battery
                ));
            }
        }
        if let Some(temp) = number(payload, &["temperature", "temp"]) {
            if temp > self.max_temperature {
                return Some(format!(
                    "temperature {:.1} above maximum {:.1}",
                    temp, self.max_temperature
                ));
            }
        }
        for (field, limit) in &self.limits {
            let Some(v) = payload.get(field).and_then(Value::as_f64) else {
                continue;
            };
            if let Some(min) = limit.min {
                if v < min {
                    return Some(format!("{} {} below minimum {}", field, v, min));
                }
            }
            if let Some(max) = limit.max {
                if v > max {
                    return Some(format!("{} {} above maximum {}", field, v, max));
                }
            }
        }
        None
    }
}

/// Handle to a running watchdog.
pub struct WatchdogHandle {
    signal: mpsc::Sender<String>,
    join: JoinHandle<()>,
}

impl WatchdogHandle {
    /// Explicit guardian- or consciousness-initiated emergency.
    /// Returns false if the watchdog has already stopped.
    pub fn trigger(&self, reason: impl Into<String>) -> bool {
        self.signal.try_send(reason.into()).is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn join(self) {
        if let Err(e) = self.join.await {
            if !e.is_cancelled() {
                error!("Watchdog task panicked: {}", e);
            }
        }
    }
}

pub struct EmergencyWithdrawalController;

impl EmergencyWithdrawalController {
    pub fn spawn(
        session: SessionId,
        thresholds: HealthThresholds,
        mut sensors: broadcast::Receiver<SensorSnapshot>,
        handler: Arc<dyn EmergencyHandler>,
        cancel: CancellationToken,
    ) -> WatchdogHandle {
        let (signal, mut signals) = mpsc::channel::<String>(SIGNAL_CAPACITY);
        let join = tokio::spawn(async move {
            debug!(session = %session, "Watchdog started");
            let reason = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break None,
                    Some(reason) = signals.recv() => break Some(reason),
                    reading = sensors.recv() => match reading {
                        Ok(snapshot) => {
                            if let Some(breach) = thresholds.check(&snapshot.payload) {
                                warn!(session = %session, sequence = snapshot.sequence, breach = %breach, "Health threshold breached");
                                break Some(breach);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(session = %session, skipped, "Watchdog lagged behind sensor stream");
                        }
                        Err(broadcast::error::RecvError::Closed) => break None,
                    },
                }
            };

            if let Some(reason) = reason {
                info!(session = %session, reason = %reason, "Watchdog invoking emergency withdrawal");
                if let Err(e) = handler.emergency_withdraw(&session, &reason) {
                    warn!(session = %session, error = %e, "Emergency withdrawal from watchdog failed");
                }
            }
            debug!(session = %session, "Watchdog stopped");
        });
        WatchdogHandle { signal, join }
    }
}
