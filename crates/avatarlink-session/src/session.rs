//! Projection session record and live handle

use crate::queue::{CommandQueue, SensorStream};
use crate::watchdog::WatchdogHandle;
use avatarlink_core::{
    AvatarInterface, AvatarType, Checkpoint, Command, CommandOutcome, ConsciousnessId,
    ConsentDecision, ConsentRecord, Error, InterfaceId, ProjectionState, Result, SensorSnapshot,
    SessionId,
};
use avatarlink_driver::{AvatarDriver, ConnectionHandle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A command accepted into the queue and what became of it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CommandLogEntry {
    pub command: Command,
    pub accepted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<CommandOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Transition {
    pub from: ProjectionState,
    pub to: ProjectionState,
    pub at: DateTime<Utc>,
}

/// The full audit record of one projection.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProjectionSession {
    pub id: SessionId,
    pub consciousness_id: ConsciousnessId,
    pub interface_id: InterfaceId,
    pub avatar_type: AvatarType,
    pub state: ProjectionState,
    pub intent: String,
    pub estimated_duration_minutes: u64,
    pub started_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub consent: Vec<ConsentRecord>,
    pub command_log: Vec<CommandLogEntry>,
    /// Filled from the sensor stream when the session ends.
    pub sensor_log: Vec<SensorSnapshot>,
    pub sensor_evicted: u64,
    pub checkpoints: Vec<Checkpoint>,
    pub transitions: Vec<Transition>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub withdrawal_reason: Option<String>,
    pub failure_reason: Option<String>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ProjectionSession {
    pub fn new(
        id: SessionId,
        consciousness_id: ConsciousnessId,
        interface: &AvatarInterface,
        intent: impl Into<String>,
        estimated_duration_minutes: u64,
    ) -> Self {
        Self {
            id,
            consciousness_id,
            interface_id: interface.id.clone(),
            avatar_type: interface.avatar_type,
            state: ProjectionState::Inactive,
            intent: intent.into(),
            estimated_duration_minutes,
            started_at: Utc::now(),
            activated_at: None,
            consent: Vec::new(),
            command_log: Vec::new(),
            sensor_log: Vec::new(),
            sensor_evicted: 0,
            checkpoints: Vec::new(),
            transitions: Vec::new(),
            last_heartbeat: None,
            withdrawal_reason: None,
            failure_reason: None,
            ended_at: None,
        }
    }

    /// Move along the state graph and checkpoint the event.
    pub fn transition(
        &mut self,
        next: ProjectionState,
        event: impl Into<String>,
    ) -> Result<Checkpoint> {
        if !self.state.can_transition_to(next) {
            return Err(Error::invalid_transition(
                self.id.as_str(),
                self.state,
                format!("move to {}", next),
            ));
        }
        let at = Utc::now();
        self.transitions.push(Transition {
            from: self.state,
            to: next,
            at,
        });
        self.state = next;
        if next == ProjectionState::Active {
            self.activated_at = Some(at);
        }
        if next.is_terminal() {
            self.ended_at = Some(at);
        }
        Ok(self.checkpoint(event))
    }

    /// Record an event without changing state.
    pub fn checkpoint(&mut self, event: impl Into<String>) -> Checkpoint {
        let cp = Checkpoint {
            event: event.into(),
            state: self.state,
            at: Utc::now(),
        };
        self.checkpoints.push(cp.clone());
        cp
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn consent_decision(&self) -> Option<ConsentDecision> {
        self.consent.last().map(|r| r.decision)
    }

    pub fn record_outcome(&mut self, command_id: &str, result: std::result::Result<CommandOutcome, String>) {
        if let Some(entry) = self
            .command_log
            .iter_mut()
            .rev()
            .find(|e| e.command.id == command_id)
        {
            match result {
                Ok(outcome) => entry.outcome = Some(outcome),
                Err(e) => entry.error = Some(e),
            }
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }

    pub fn events(&self) -> Vec<&str> {
        self.checkpoints.iter().map(|c| c.event.as_str()).collect()
    }
}

/// Point-in-time view of a session returned to callers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub consciousness_id: ConsciousnessId,
    pub interface_id: InterfaceId,
    pub state: ProjectionState,
    pub consent: Option<ConsentDecision>,
    pub started_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub commands_accepted: usize,
    pub commands_executed: usize,
    pub commands_failed: usize,
    pub pending_commands: usize,
    pub sensor_readings: usize,
    pub sensor_evicted: u64,
    pub latest_sensor: Option<SensorSnapshot>,
    pub checkpoints: usize,
    pub withdrawal_reason: Option<String>,
    pub failure_reason: Option<String>,
}

/// Driver-facing resources that exist only while connected.
pub struct SessionRuntime {
    pub driver: Arc<dyn AvatarDriver>,
    pub conn: ConnectionHandle,
    pub queue: CommandQueue,
    pub sensors: Arc<SensorStream>,
    pub tasks: SessionTasks,
}

/// Background tasks of a connected session. Taken out by whoever stops them.
#[derive(Default)]
pub struct SessionTasks {
    pub command: Option<JoinHandle<()>>,
    pub sensor: Option<JoinHandle<()>>,
    pub watchdog: Option<WatchdogHandle>,
}

/// Record and runtime share one lock so state changes and resource hand-off are atomic.
pub struct SessionSlot {
    pub record: ProjectionSession,
    pub runtime: Option<SessionRuntime>,
}

impl SessionSlot {
    /// Copy buffered sensor readings into the record before it is finalized.
    pub fn capture_sensor_log(&mut self) {
        if let Some(rt) = &self.runtime {
            self.record.sensor_log = rt.sensors.snapshot();
            self.record.sensor_evicted = rt.sensors.evicted();
        }
    }
}

/// A live session in the manager's table.
pub struct SessionHandle {
    pub id: SessionId,
    pub consciousness_id: ConsciousnessId,
    pub interface: Arc<AvatarInterface>,
    slot: Mutex<SessionSlot>,
    cancel: CancellationToken,
    drain: CancellationToken,
}

impl SessionHandle {
    pub fn new(record: ProjectionSession, interface: Arc<AvatarInterface>) -> Self {
        Self {
            id: record.id.clone(),
            consciousness_id: record.consciousness_id.clone(),
            interface,
            slot: Mutex::new(SessionSlot {
                record,
                runtime: None,
            }),
            cancel: CancellationToken::new(),
            drain: CancellationToken::new(),
        }
    }

    /// Never held across an await.
    pub fn lock(&self) -> MutexGuard<'_, SessionSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ProjectionState {
        self.lock().record.state
    }

    pub fn record(&self) -> ProjectionSession {
        let slot = self.lock();
        let mut record = slot.record.clone();
        if let Some(rt) = &slot.runtime {
            record.sensor_log = rt.sensors.snapshot();
            record.sensor_evicted = rt.sensors.evicted();
        }
        record
    }

    pub fn touch(&self) {
        self.lock().record.last_heartbeat = Some(Utc::now());
    }

    /// Cancels every in-flight driver call and stops the session's tasks.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Asks the command loop to finish what is queued and stop.
    pub fn drain_token(&self) -> &CancellationToken {
        &self.drain
    }

    pub fn status(&self) -> SessionStatus {
        let slot = self.lock();
        let r = &slot.record;
        let (pending, readings, evicted, latest) = match &slot.runtime {
            Some(rt) => (
                rt.queue.pending(),
                rt.sensors.len(),
                rt.sensors.evicted(),
                rt.sensors.latest(),
            ),
            None => (0, r.sensor_log.len(), r.sensor_evicted, r.sensor_log.last().cloned()),
        };
        SessionStatus {
            session_id: r.id.clone(),
            consciousness_id: r.consciousness_id.clone(),
            interface_id: r.interface_id.clone(),
            state: r.state,
            consent: r.consent_decision(),
            started_at: r.started_at,
            activated_at: r.activated_at,
            ended_at: r.ended_at,
            last_heartbeat: r.last_heartbeat,
            commands_accepted: r.command_log.len(),
            commands_executed: r.command_log.iter().filter(|e| e.outcome.is_some()).count(),
            commands_failed: r.command_log.iter().filter(|e| e.error.is_some()).count(),
            pending_commands: pending,
            sensor_readings: readings,
            sensor_evicted: evicted,
            latest_sensor: latest,
            checkpoints: r.checkpoints.len(),
            withdrawal_reason: r.withdrawal_reason.clone(),
            failure_reason: r.failure_reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> ProjectionSession {
        let iface = AvatarInterface::new("g", "G", AvatarType::GameCharacter);
        ProjectionSession::new(SessionId::generate(), "c".into(), &iface, "explore", 10)
    }

    #[test]
    fn invalid_transition_leaves_state() {
        let mut s = session();
        let err = s.transition(ProjectionState::Active, "skip").unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { from: ProjectionState::Inactive, .. }));
        assert_eq!(s.state, ProjectionState::Inactive);
        assert!(s.checkpoints.is_empty());
    }

    #[test]
    fn terminal_transition_sets_ended_at() {
        let mut s = session();
        s.transition(ProjectionState::NegotiatingConsent, "start").unwrap();
        s.transition(ProjectionState::Failed, "denied").unwrap();
        assert!(s.ended_at.is_some());
        assert!(s.duration().is_some());
        assert_eq!(s.events(), vec!["start", "denied"]);
    }
}
