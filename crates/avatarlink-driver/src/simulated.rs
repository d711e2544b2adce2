//! SimulatedDriver: deterministic in-process avatar for tests and the demo
//!
//! Each driver call follows a configurable [`SimBehavior`]. Telemetry is
//! scripted: queued readings are returned first, then the default reading.

use crate::driver::{AvatarDriver, ConnectionHandle, DriverError, DriverResult};
use avatarlink_core::{
    AvatarInterface, Command, CommandOutcome, ConsciousnessId, SensorSnapshot,
};
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How a simulated call responds.
#[derive(Clone, Debug, PartialEq)]
pub enum SimBehavior {
    /// Respond immediately with success
    Succeed,
    /// Respond immediately with an error
    Fail(String),
    /// Never respond, even when cancelled
    Hang,
    /// Respond after a delay unless cancelled first
    Delay(Duration),
}

pub struct SimulatedDriver {
    name: String,
    connect_behavior: SimBehavior,
    disconnect_behavior: SimBehavior,
    execute_behavior: SimBehavior,
    failing_actions: HashSet<String>,
    telemetry: Mutex<VecDeque<Value>>,
    default_telemetry: Mutex<Value>,
    executed: Mutex<Vec<String>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    reads: AtomicUsize,
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new("simulated")
    }
}

impl SimulatedDriver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connect_behavior: SimBehavior::Succeed,
            disconnect_behavior: SimBehavior::Succeed,
            execute_behavior: SimBehavior::Succeed,
            failing_actions: HashSet::new(),
            telemetry: Mutex::new(VecDeque::new()),
            default_telemetry: Mutex::new(json!({"battery": 0.9, "temperature": 35.0})),
            executed: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
        }
    }

    /// Connects fine, then never answers another call.
    pub fn hanging() -> Self {
        Self::new("hanging")
            .with_disconnect(SimBehavior::Hang)
            .with_execute(SimBehavior::Hang)
    }

    pub fn failing_connect(reason: impl Into<String>) -> Self {
        Self::new("failing").with_connect(SimBehavior::Fail(reason.into()))
    }

    /// Every call takes `delay` to answer.
    pub fn slow(delay: Duration) -> Self {
        Self::new("slow")
            .with_connect(SimBehavior::Delay(delay))
            .with_disconnect(SimBehavior::Delay(delay))
            .with_execute(SimBehavior::Delay(delay))
    }

    pub fn with_connect(mut self, behavior: SimBehavior) -> Self {
        self.connect_behavior = behavior;
        self
    }

    pub fn with_disconnect(mut self, behavior: SimBehavior) -> Self {
        self.disconnect_behavior = behavior;
        self
    }

    pub fn with_execute(mut self, behavior: SimBehavior) -> Self {
        self.execute_behavior = behavior;
        self
    }

    /// Commands with this action fail during execution.
    pub fn with_failing_action(mut self, action: impl Into<String>) -> Self {
        self.failing_actions.insert(action.into());
        self
    }

    pub fn with_telemetry(self, readings: Vec<Value>) -> Self {
        Self {
            telemetry: Mutex::new(readings.into()),
            ..self
        }
    }

    pub fn with_default_telemetry(self, reading: Value) -> Self {
        Self {
            default_telemetry: Mutex::new(reading),
            ..self
        }
    }

    pub async fn push_telemetry(&self, reading: Value) {
        self.telemetry.lock().await.push_back(reading);
    }

    pub async fn set_default_telemetry(&self, reading: Value) {
        *self.default_telemetry.lock().await = reading;
    }

    /// Ids of executed commands, in dispatch order.
    pub async fn executed(&self) -> Vec<String> {
        self.executed.lock().await.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    async fn behave(
        behavior: &SimBehavior,
        cancel: &CancellationToken,
        fail: fn(String) -> DriverError,
    ) -> DriverResult<()> {
        match behavior {
            SimBehavior::Succeed => Ok(()),
            SimBehavior::Fail(reason) => Err(fail(reason.clone())),
            SimBehavior::Hang => std::future::pending().await,
            SimBehavior::Delay(d) => {
                tokio::select! {
                    _ = tokio::time::sleep(*d) => Ok(()),
                    _ = cancel.cancelled() => Err(DriverError::Cancelled),
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl AvatarDriver for SimulatedDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(
        &self,
        cancel: &CancellationToken,
        interface: &AvatarInterface,
        consciousness: &ConsciousnessId,
    ) -> DriverResult<ConnectionHandle> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Self::behave(&self.connect_behavior, cancel, DriverError::Connect).await?;
        let conn = ConnectionHandle::new(&self.name, interface.id.clone(), consciousness.clone());
        debug!(driver = %self.name, conn = %conn.id, interface = %interface.id, "Simulated connect");
        Ok(conn)
    }

    async fn disconnect(
        &self,
        cancel: &CancellationToken,
        conn: &ConnectionHandle,
    ) -> DriverResult<()> {
        Self::behave(&self.disconnect_behavior, cancel, DriverError::NotConnected).await?;
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        debug!(driver = %self.name, conn = %conn.id, "Simulated disconnect");
        Ok(())
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        conn: &ConnectionHandle,
        command: &Command,
    ) -> DriverResult<CommandOutcome> {
        Self::behave(&self.execute_behavior, cancel, DriverError::Execution).await?;
        if self.failing_actions.contains(command.action()) {
            return Err(DriverError::Execution(format!(
                "action '{}' rejected by avatar",
                command.action()
            )));
        }
        self.executed.lock().await.push(command.id.clone());
        Ok(CommandOutcome::executed(
            command.id.clone(),
            json!({
                "conn": conn.id,
                "kind": command.payload.kind(),
                "action": command.action(),
            }),
        ))
    }

    async fn read_state(
        &self,
        cancel: &CancellationToken,
        _conn: &ConnectionHandle,
    ) -> DriverResult<SensorSnapshot> {
        if cancel.is_cancelled() {
            return Err(DriverError::Cancelled);
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        let scripted = self.telemetry.lock().await.pop_front();
        let payload = match scripted {
            Some(v) => v,
            None => self.default_telemetry.lock().await.clone(),
        };
        Ok(SensorSnapshot::new(payload))
    }
}
