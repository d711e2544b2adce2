//! Driver trait and dispatch table
//!
//! A driver is the only thing that talks to a physical or virtual actuator.
//! Every call takes a cancellation token and callers wrap it with [`bounded`]
//! so that a stuck device can never hold a session hostage.

use avatarlink_core::{
    AvatarInterface, AvatarType, Command, CommandOutcome, ConsciousnessId, InterfaceId,
    SensorSnapshot,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Live connection to an avatar, returned by [`AvatarDriver::connect`].
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionHandle {
    pub id: String,
    pub driver: String,
    pub interface: InterfaceId,
    pub consciousness: ConsciousnessId,
    pub connected_at: DateTime<Utc>,
}

impl ConnectionHandle {
    pub fn new(
        driver: impl Into<String>,
        interface: InterfaceId,
        consciousness: ConsciousnessId,
    ) -> Self {
        Self {
            id: format!("conn_{}", uuid::Uuid::new_v4().simple()),
            driver: driver.into(),
            interface,
            consciousness,
            connected_at: Utc::now(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unsupported avatar type: {0}")]
    Unsupported(AvatarType),
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// The AvatarDriver trait: implement this to bridge a real device.
#[async_trait::async_trait]
pub trait AvatarDriver: Send + Sync {
    /// Short driver name used in logs and connection handles.
    fn name(&self) -> &str;

    /// Whether this driver can embody the given avatar type.
    fn supports(&self, _avatar_type: AvatarType) -> bool {
        true
    }

    async fn connect(
        &self,
        cancel: &CancellationToken,
        interface: &AvatarInterface,
        consciousness: &ConsciousnessId,
    ) -> DriverResult<ConnectionHandle>;

    async fn disconnect(
        &self,
        cancel: &CancellationToken,
        conn: &ConnectionHandle,
    ) -> DriverResult<()>;

    async fn execute(
        &self,
        cancel: &CancellationToken,
        conn: &ConnectionHandle,
        command: &Command,
    ) -> DriverResult<CommandOutcome>;

    async fn read_state(
        &self,
        cancel: &CancellationToken,
        conn: &ConnectionHandle,
    ) -> DriverResult<SensorSnapshot>;
}

/// Race a driver future against cancellation and a deadline.
///
/// Cancellation wins ties, so a cancelled session never observes a late success.
pub async fn bounded<T, F>(cancel: &CancellationToken, timeout: Duration, fut: F) -> DriverResult<T>
where
    F: Future<Output = DriverResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DriverError::Cancelled),
        res = tokio::time::timeout(timeout, fut) => match res {
            Ok(inner) => inner,
            Err(_) => Err(DriverError::Timeout(timeout)),
        },
    }
}

/// Picks the driver responsible for an avatar type.
#[derive(Clone, Default)]
pub struct DriverSet {
    by_type: HashMap<AvatarType, Arc<dyn AvatarDriver>>,
    fallback: Option<Arc<dyn AvatarDriver>>,
}

impl DriverSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A set where one driver serves every avatar type.
    pub fn single(driver: Arc<dyn AvatarDriver>) -> Self {
        Self {
            by_type: HashMap::new(),
            fallback: Some(driver),
        }
    }

    pub fn register(&mut self, avatar_type: AvatarType, driver: Arc<dyn AvatarDriver>) {
        self.by_type.insert(avatar_type, driver);
    }

    pub fn with_fallback(mut self, driver: Arc<dyn AvatarDriver>) -> Self {
        self.fallback = Some(driver);
        self
    }

    pub fn resolve(&self, avatar_type: AvatarType) -> DriverResult<Arc<dyn AvatarDriver>> {
        if let Some(d) = self.by_type.get(&avatar_type) {
            return Ok(d.clone());
        }
        match &self.fallback {
            Some(d) if d.supports(avatar_type) => Ok(d.clone()),
            _ => Err(DriverError::Unsupported(avatar_type)),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_type.values().map(|d| d.name()).collect();
        if let Some(d) = &self.fallback {
            names.push(d.name());
        }
        names.sort();
        names.dedup();
        names
    }
}
