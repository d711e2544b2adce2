//! ProjectionSessionManager - owns every session and drives its lifecycle
//!
//! Each session gets three tasks once connected: a command loop that
//! dispatches queued commands in order, a sensor loop that pulls readings at
//! the configured interval, and a watchdog parked on the sensor stream.
//! Emergency withdrawal is synchronous: it flips state under the session lock,
//! cancels the session token and leaves driver cleanup to a detached task.

use crate::audit::{JsonlSink, MultiSink, PersistenceSink, TracingSink};
use crate::config::ProjectionConfig;
use crate::queue::{CommandQueue, SensorStream};
use crate::session::{
    CommandLogEntry, ProjectionSession, SessionHandle, SessionRuntime, SessionSlot, SessionStatus,
    SessionTasks,
};
use crate::watchdog::{EmergencyHandler, EmergencyWithdrawalController, HealthThresholds};
use avatarlink_core::{
    AvatarCategory, AvatarInterface, AvatarType, Checkpoint, Command, ConsciousnessId,
    ConsentDecision, ConsentRecord, Error, EventMessage, Indicators, InterfaceId,
    ProjectionState, ReadinessAssessment, ReadinessTier, Result, SessionId,
};
use avatarlink_driver::{bounded, AvatarDriver, ConnectionHandle, DriverError, DriverSet};
use avatarlink_governance::{
    AvatarFilter, AvatarInterfaceRegistry, AvatarPreferences, AvatarRecommendation,
    ConsentNegotiator, GovernanceDecision, ReadinessAssessor, RegisteredAvatar, SafetyContext,
    SafetyValidator, TierChange,
};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

use ProjectionState::*;

// ---------------------------------------------------------------------------
// Events, receipts, reports
// ---------------------------------------------------------------------------

/// Broadcast to subscribers as sessions progress.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        session_id: SessionId,
        from: ProjectionState,
        to: ProjectionState,
        event: String,
    },
    CommandAccepted {
        session_id: SessionId,
        command_id: String,
    },
    CommandExecuted {
        session_id: SessionId,
        command_id: String,
    },
    CommandFailed {
        session_id: SessionId,
        command_id: String,
        error: String,
    },
    SensorReading {
        session_id: SessionId,
        sequence: u64,
    },
    EmergencyTimeout {
        session_id: SessionId,
        elapsed_ms: u64,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::StateChanged { session_id, .. }
            | Self::CommandAccepted { session_id, .. }
            | Self::CommandExecuted { session_id, .. }
            | Self::CommandFailed { session_id, .. }
            | Self::SensorReading { session_id, .. }
            | Self::EmergencyTimeout { session_id, .. } => session_id,
        }
    }

    /// Wire form pushed to RPC clients.
    pub fn to_message(&self) -> EventMessage {
        EventMessage::new(
            "session",
            serde_json::to_value(self).unwrap_or(serde_json::Value::Null),
        )
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct CommandReceipt {
    pub session_id: SessionId,
    pub command_id: String,
    pub queued_at: DateTime<Utc>,
    /// Commands ahead of and including this one.
    pub pending: usize,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct EmergencyReport {
    pub session_id: SessionId,
    pub previous_state: ProjectionState,
    pub reason: String,
    pub elapsed_us: u64,
    pub within_budget: bool,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ProjectionStatistics {
    pub registered_avatars: usize,
    pub avatar_types: BTreeSet<AvatarType>,
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub completed_sessions: u64,
    pub failed_sessions: u64,
    pub emergency_withdrawals: u64,
    pub refused_requests: u64,
    pub commands_accepted: u64,
    pub commands_rejected: u64,
    pub commands_executed: u64,
    pub commands_failed: u64,
    pub queue_full: u64,
    pub emergency_timeouts: u64,
}

#[derive(Default)]
struct Counters {
    refused: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    emergencies: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    executed: AtomicU64,
    command_failures: AtomicU64,
    queue_full: AtomicU64,
    emergency_timeouts: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ManagerBuilder {
    config: ProjectionConfig,
    drivers: Option<DriverSet>,
    registry: Option<Arc<AvatarInterfaceRegistry>>,
    readiness: Option<Arc<ReadinessAssessor>>,
    sink: Option<Arc<dyn PersistenceSink>>,
}

impl ManagerBuilder {
    pub fn config(mut self, config: ProjectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn drivers(mut self, drivers: DriverSet) -> Self {
        self.drivers = Some(drivers);
        self
    }

    /// One driver for every avatar type.
    pub fn driver(self, driver: Arc<dyn AvatarDriver>) -> Self {
        self.drivers(DriverSet::single(driver))
    }

    pub fn registry(mut self, registry: Arc<AvatarInterfaceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn readiness(mut self, readiness: Arc<ReadinessAssessor>) -> Self {
        self.readiness = Some(readiness);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<ProjectionSessionManager> {
        self.config.validate()?;
        let drivers = self
            .drivers
            .ok_or_else(|| Error::Config("no avatar driver configured".into()))?;
        let safety = self.config.safety.build_validator()?;
        let sink: Arc<dyn PersistenceSink> = match (self.sink, &self.config.audit.jsonl_path) {
            (Some(sink), _) => sink,
            (None, Some(path)) => Arc::new(
                MultiSink::new()
                    .with(Arc::new(TracingSink))
                    .with(Arc::new(JsonlSink::open(path)?)),
            ),
            (None, None) => Arc::new(TracingSink),
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        info!(
            drivers = ?drivers.names(),
            consent_policy = ?self.config.consent.policy,
            harm_policies = ?safety.policy_names(),
            "Projection session manager ready"
        );
        Ok(ProjectionSessionManager {
            inner: Arc::new(ManagerInner {
                consent: ConsentNegotiator::new(self.config.consent.policy),
                config: self.config,
                drivers,
                registry: self.registry.unwrap_or_default(),
                readiness: self.readiness.unwrap_or_default(),
                safety,
                sink,
                sessions: DashMap::new(),
                pairs: DashMap::new(),
                events,
                counters: Arc::new(Counters::default()),
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct ManagerInner {
    config: ProjectionConfig,
    drivers: DriverSet,
    registry: Arc<AvatarInterfaceRegistry>,
    readiness: Arc<ReadinessAssessor>,
    consent: ConsentNegotiator,
    safety: SafetyValidator,
    sink: Arc<dyn PersistenceSink>,
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    /// At most one live session per (consciousness, interface).
    pairs: DashMap<(ConsciousnessId, InterfaceId), SessionId>,
    events: broadcast::Sender<SessionEvent>,
    counters: Arc<Counters>,
}

/// Cheap to clone; all clones share one session table.
#[derive(Clone)]
pub struct ProjectionSessionManager {
    inner: Arc<ManagerInner>,
}

/// Lets the watchdog reach the manager without keeping it alive.
struct WeakManager(Weak<ManagerInner>);

impl EmergencyHandler for WeakManager {
    fn emergency_withdraw(&self, session: &SessionId, reason: &str) -> Result<()> {
        match self.0.upgrade() {
            Some(inner) => ProjectionSessionManager { inner }
                .emergency_withdraw(session, reason)
                .map(|_| ()),
            None => Ok(()),
        }
    }
}

impl ProjectionSessionManager {
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::default()
    }

    pub fn config(&self) -> &ProjectionConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<AvatarInterfaceRegistry> {
        &self.inner.registry
    }

    pub fn readiness(&self) -> &Arc<ReadinessAssessor> {
        &self.inner.readiness
    }

    pub fn consent(&self) -> &ConsentNegotiator {
        &self.inner.consent
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    fn handle(&self, id: &SessionId) -> Result<Arc<SessionHandle>> {
        self.inner
            .sessions
            .get(id)
            .map(|h| h.clone())
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// Transition under the caller's lock, then checkpoint and announce it.
    fn apply(
        &self,
        handle: &SessionHandle,
        slot: &mut SessionSlot,
        next: ProjectionState,
        event: impl Into<String>,
    ) -> Result<()> {
        let from = slot.record.state;
        let checkpoint = slot.record.transition(next, event)?;
        self.inner.sink.record_checkpoint(&handle.id, &checkpoint);
        self.announce(&handle.id, from, next, &checkpoint);
        Ok(())
    }

    fn announce(
        &self,
        id: &SessionId,
        from: ProjectionState,
        to: ProjectionState,
        checkpoint: &Checkpoint,
    ) {
        info!(session = %id, %from, %to, event = %checkpoint.event, "Session state changed");
        self.emit(SessionEvent::StateChanged {
            session_id: id.clone(),
            from,
            to,
            event: checkpoint.event.clone(),
        });
    }

    fn note(&self, handle: &SessionHandle, slot: &mut SessionSlot, event: impl Into<String>) {
        let checkpoint = slot.record.checkpoint(event);
        debug!(session = %handle.id, event = %checkpoint.event, "Checkpoint");
        self.inner.sink.record_checkpoint(&handle.id, &checkpoint);
    }

    /// Persist a session that just reached a terminal state.
    fn finalize(&self, handle: &SessionHandle) {
        let record = handle.record();
        self.release(&record);
        self.inner.sink.record_session(&record);
    }

    /// Free the pair and consent state of a terminal session and count it.
    fn release(&self, record: &ProjectionSession) {
        let pair = (record.consciousness_id.clone(), record.interface_id.clone());
        self.inner.pairs.remove_if(&pair, |_, owner| owner == &record.id);
        self.inner.consent.forget(&record.id);
        let c = &self.inner.counters;
        match record.state {
            Completed => bump(&c.completed),
            Failed => bump(&c.failed),
            EmergencyWithdrawal => bump(&c.emergencies),
            _ => {}
        }
        info!(
            session = %record.id,
            state = %record.state,
            commands = record.command_log.len(),
            sensor_readings = record.sensor_log.len(),
            "Session closed"
        );
    }

    // -----------------------------------------------------------------------
    // Governance passthroughs
    // -----------------------------------------------------------------------

    pub fn register_avatar_interface(&self, interface: AvatarInterface) -> Result<AvatarCategory> {
        self.inner.registry.register(interface)
    }

    pub fn unregister_avatar_interface(&self, id: &InterfaceId) -> Result<()> {
        self.inner.registry.unregister(id)
    }

    pub fn list_avatar_interfaces(&self) -> Vec<RegisteredAvatar> {
        self.inner.registry.list()
    }

    pub fn set_avatar_preferences(&self, preferences: AvatarPreferences) {
        self.inner.registry.set_preferences(preferences)
    }

    pub fn avatar_preferences(&self, consciousness_id: &ConsciousnessId) -> Option<AvatarPreferences> {
        self.inner.registry.preferences(consciousness_id)
    }

    /// Best-fitting interfaces the consciousness may project into at its current tier.
    pub fn recommend_avatars(
        &self,
        consciousness_id: &ConsciousnessId,
        limit: usize,
    ) -> Vec<AvatarRecommendation> {
        let tier = self.inner.readiness.current_tier(consciousness_id);
        self.inner.registry.recommend(consciousness_id, tier, limit)
    }

    pub fn search_avatars(&self, query: &str, filter: &AvatarFilter) -> Vec<RegisteredAvatar> {
        self.inner.registry.search(query, filter)
    }

    pub fn assess_readiness(
        &self,
        consciousness_id: &ConsciousnessId,
        indicators: Indicators,
    ) -> ReadinessAssessment {
        self.inner.readiness.assess(consciousness_id, indicators)
    }

    pub fn approve_tier_change(
        &self,
        consciousness_id: &ConsciousnessId,
        tier: ReadinessTier,
        decision: GovernanceDecision,
    ) -> Result<TierChange> {
        self.inner
            .readiness
            .approve_tier_change(consciousness_id, tier, decision)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Open a session in NEGOTIATING_CONSENT after the tier gate.
    pub fn request_projection(
        &self,
        consciousness_id: &ConsciousnessId,
        interface_id: &InterfaceId,
        intent: &str,
        estimated_duration_minutes: u64,
    ) -> Result<SessionId> {
        let inner = &self.inner;
        let registered = inner
            .registry
            .get(interface_id)
            .ok_or_else(|| Error::InterfaceNotFound(interface_id.to_string()))?;

        let current = inner.readiness.current_tier(consciousness_id);
        if current < registered.required_tier {
            bump(&inner.counters.refused);
            let suitable = inner.registry.available_for(current);
            let guidance = inner
                .readiness
                .guidance(consciousness_id, registered.required_tier, suitable);
            info!(
                consciousness = %consciousness_id,
                interface = %interface_id,
                %current,
                required = %registered.required_tier,
                "Projection refused: readiness insufficient"
            );
            return Err(Error::readiness_insufficient(
                current,
                registered.required_tier,
                guidance,
            ));
        }

        let session_id = SessionId::generate();
        match inner
            .pairs
            .entry((consciousness_id.clone(), interface_id.clone()))
        {
            Entry::Occupied(existing) => {
                let owner = existing.get().clone();
                let state = inner
                    .sessions
                    .get(&owner)
                    .map(|h| h.state())
                    .unwrap_or(Inactive);
                return Err(Error::invalid_transition(
                    owner.as_str(),
                    state,
                    format!("open a second projection into {} alongside", interface_id),
                ));
            }
            Entry::Vacant(slot) => {
                slot.insert(session_id.clone());
            }
        }

        let record = ProjectionSession::new(
            session_id.clone(),
            consciousness_id.clone(),
            &registered.interface,
            intent,
            estimated_duration_minutes,
        );
        let handle = Arc::new(SessionHandle::new(record, registered.interface.clone()));
        inner.sessions.insert(session_id.clone(), handle.clone());

        let pending = match inner.consent.request_consent(
            &session_id,
            consciousness_id,
            &registered.interface,
            intent,
            estimated_duration_minutes,
        ) {
            Ok(record) => record,
            Err(e) => {
                inner.sessions.remove(&session_id);
                inner
                    .pairs
                    .remove(&(consciousness_id.clone(), interface_id.clone()));
                return Err(e);
            }
        };

        {
            let mut slot = handle.lock();
            self.apply(&handle, &mut slot, NegotiatingConsent, "Consent negotiation started")?;
            slot.record.consent.push(pending);
        }
        info!(session = %session_id, consciousness = %consciousness_id, interface = %interface_id, "Projection requested");

        if let Some(granted) = inner.consent.auto_decision() {
            self.record_consent(&session_id, granted)?;
        }
        Ok(session_id)
    }

    /// Deliver the consciousness' decision. A denial fails the session.
    pub fn record_consent(&self, session_id: &SessionId, granted: bool) -> Result<ConsentRecord> {
        let handle = self.handle(session_id)?;
        let mut slot = handle.lock();
        let state = slot.record.state;
        if state != NegotiatingConsent {
            return Err(Error::invalid_transition(
                session_id.as_str(),
                state,
                "record consent for",
            ));
        }
        let record = self.inner.consent.decide(session_id, granted)?;
        slot.record.consent.push(record.clone());

        if granted {
            self.note(&handle, &mut slot, "Consent granted");
            return Ok(record);
        }
        slot.record.failure_reason = Some("consent denied".into());
        self.apply(&handle, &mut slot, Failed, "Consent denied")?;
        drop(slot);
        self.finalize(&handle);
        Err(Error::ConsentDenied(session_id.to_string()))
    }

    /// Revoke granted consent and withdraw whatever is running.
    pub async fn withdraw_consent(&self, session_id: &SessionId) -> Result<ConsentRecord> {
        let handle = self.handle(session_id)?;
        let (record, state) = {
            let mut slot = handle.lock();
            if slot.record.is_terminal() {
                return Err(Error::invalid_transition(
                    session_id.as_str(),
                    slot.record.state,
                    "withdraw consent for",
                ));
            }
            let record = self.inner.consent.withdraw(session_id, slot.record.state)?;
            slot.record.consent.push(record.clone());
            self.note(&handle, &mut slot, "Consent withdrawn");
            if slot.record.state == NegotiatingConsent {
                slot.record.failure_reason = Some("consent withdrawn".into());
                self.apply(&handle, &mut slot, Failed, "Projection failed: consent withdrawn")?;
            }
            (record, slot.record.state)
        };
        match state {
            Failed => self.finalize(&handle),
            Active | Projecting => self.withdraw(session_id, "consent withdrawn").await?,
            _ => {}
        }
        Ok(record)
    }

    /// Connect the avatar and start the session's tasks.
    pub async fn begin_projection(&self, session_id: &SessionId) -> Result<()> {
        let handle = self.handle(session_id)?;
        {
            let mut slot = handle.lock();
            let state = slot.record.state;
            if state != NegotiatingConsent {
                return Err(Error::invalid_transition(
                    session_id.as_str(),
                    state,
                    "begin projection for",
                ));
            }
            if slot.record.consent_decision() != Some(ConsentDecision::Granted) {
                return Err(Error::invalid_transition(
                    session_id.as_str(),
                    state,
                    "begin projection without granted consent for",
                ));
            }
            self.apply(&handle, &mut slot, Projecting, "Projection initiated")?;
        }

        let cfg = &self.inner.config;
        let driver = match self.inner.drivers.resolve(handle.interface.avatar_type) {
            Ok(driver) => driver,
            Err(e) => return Err(self.fail_projection(&handle, e.to_string())),
        };

        let cancel = handle.cancel_token().clone();
        let connected = bounded(
            &cancel,
            cfg.driver.connect_timeout(),
            driver.connect(&cancel, &handle.interface, &handle.consciousness_id),
        )
        .await;
        let conn = match connected {
            Ok(conn) => conn,
            Err(DriverError::Cancelled) => {
                return Err(Error::invalid_transition(
                    session_id.as_str(),
                    handle.state(),
                    "activate",
                ))
            }
            Err(e) => {
                error!(session = %session_id, driver = driver.name(), error = %e, "Avatar connect failed");
                return Err(self.fail_projection(&handle, e.to_string()));
            }
        };
        info!(session = %session_id, driver = driver.name(), connection = %conn.id, "Avatar connected");

        let (queue, rx) = CommandQueue::bounded(
            session_id.clone(),
            cfg.queues.command_capacity,
            cfg.queues.enqueue_timeout(),
        );
        let sensors = Arc::new(SensorStream::new(cfg.queues.sensor_capacity));
        let watch = sensors.subscribe();
        let ctx = LoopContext {
            handle: handle.clone(),
            driver: driver.clone(),
            conn: conn.clone(),
            events: self.inner.events.clone(),
            counters: self.inner.counters.clone(),
            timeout: cfg.driver.command_timeout(),
        };
        let tasks = SessionTasks {
            command: Some(tokio::spawn(command_loop(ctx.clone(), rx))),
            sensor: Some(tokio::spawn(sensor_loop(
                ctx,
                sensors.clone(),
                cfg.driver.sensor_interval(),
            ))),
            watchdog: cfg.watchdog.enabled.then(|| {
                EmergencyWithdrawalController::spawn(
                    session_id.clone(),
                    HealthThresholds::from(&cfg.watchdog),
                    watch,
                    Arc::new(WeakManager(Arc::downgrade(&self.inner))),
                    cancel.clone(),
                )
            }),
        };
        let runtime = SessionRuntime {
            driver,
            conn,
            queue,
            sensors,
            tasks,
        };

        let mut slot = handle.lock();
        let state = slot.record.state;
        if state == Projecting {
            slot.runtime = Some(runtime);
            self.apply(&handle, &mut slot, Active, "Projection activated")?;
            return Ok(());
        }
        drop(slot);

        // Withdrawn or stopped while connecting.
        cancel.cancel();
        self.detach_disconnect(
            session_id.clone(),
            runtime.driver,
            runtime.conn,
            cfg.driver.disconnect_timeout(),
            false,
        );
        Err(Error::invalid_transition(session_id.as_str(), state, "activate"))
    }

    fn fail_projection(&self, handle: &SessionHandle, reason: String) -> Error {
        let mut slot = handle.lock();
        if slot.record.state == Projecting {
            slot.record.failure_reason = Some(reason.clone());
            if self
                .apply(handle, &mut slot, Failed, format!("Projection failed: {}", reason))
                .is_ok()
            {
                drop(slot);
                self.finalize(handle);
            }
        }
        Error::connection_failed(handle.id.as_str(), reason)
    }

    /// Validate and queue a command for an active session.
    pub async fn send_command(
        &self,
        session_id: &SessionId,
        command: Command,
    ) -> Result<CommandReceipt> {
        let handle = self.handle(session_id)?;
        let queue = {
            let mut slot = handle.lock();
            let state = slot.record.state;
            if state != Active {
                return Err(Error::invalid_transition(
                    session_id.as_str(),
                    state,
                    "send a command to",
                ));
            }
            let ctx = SafetyContext::new(&handle.consciousness_id)
                .with_avatar_type(handle.interface.avatar_type);
            if let Err(e) = self.inner.safety.check(&command, &ctx) {
                bump(&self.inner.counters.rejected);
                return Err(e);
            }
            let queue = slot
                .runtime
                .as_ref()
                .map(|rt| rt.queue.clone())
                .ok_or_else(|| Error::Internal(format!("active session {} has no runtime", session_id)))?;
            slot.record.command_log.push(CommandLogEntry {
                command: command.clone(),
                accepted_at: Utc::now(),
                outcome: None,
                error: None,
            });
            queue
        };

        let command_id = command.id.clone();
        match queue.enqueue(command).await {
            Ok(()) => {
                bump(&self.inner.counters.accepted);
                self.emit(SessionEvent::CommandAccepted {
                    session_id: session_id.clone(),
                    command_id: command_id.clone(),
                });
                Ok(CommandReceipt {
                    session_id: session_id.clone(),
                    command_id,
                    queued_at: Utc::now(),
                    pending: queue.pending(),
                })
            }
            Err(e) => {
                let mut slot = handle.lock();
                if let Some(pos) = slot
                    .record
                    .command_log
                    .iter()
                    .rposition(|entry| entry.command.id == command_id)
                {
                    slot.record.command_log.remove(pos);
                }
                match e {
                    Error::QueueFull(_) => {
                        bump(&self.inner.counters.queue_full);
                        Err(e)
                    }
                    _ => Err(Error::invalid_transition(
                        session_id.as_str(),
                        slot.record.state,
                        "send a command to",
                    )),
                }
            }
        }
    }

    /// Graceful exit: drain queued commands, stop tasks, disconnect, complete.
    pub async fn withdraw(&self, session_id: &SessionId, reason: &str) -> Result<()> {
        let handle = self.handle(session_id)?;
        let cfg = &self.inner.config;
        let tasks = {
            let mut slot = handle.lock();
            let state = slot.record.state;
            if !matches!(state, Active | Projecting) {
                return Err(Error::invalid_transition(session_id.as_str(), state, "withdraw"));
            }
            slot.record.withdrawal_reason = Some(reason.to_string());
            self.apply(
                &handle,
                &mut slot,
                Withdrawing,
                format!("Withdrawal initiated: {}", reason),
            )?;
            slot.runtime
                .as_mut()
                .map(|rt| std::mem::take(&mut rt.tasks))
                .unwrap_or_default()
        };

        handle.drain_token().cancel();
        if let Some(mut task) = tasks.command {
            match tokio::time::timeout(cfg.driver.drain_timeout(), &mut task).await {
                Ok(_) => debug!(session = %session_id, "Command queue drained"),
                Err(_) => {
                    warn!(session = %session_id, "Command drain timed out; abandoning queued commands");
                    task.abort();
                }
            }
        }
        handle.cancel_token().cancel();
        if let Some(task) = tasks.sensor {
            let _ = task.await;
        }
        if let Some(watchdog) = tasks.watchdog {
            watchdog.join().await;
        }

        let target = {
            let slot = handle.lock();
            if slot.record.state != Withdrawing {
                // An emergency finished the session while draining.
                return Ok(());
            }
            slot.runtime
                .as_ref()
                .map(|rt| (rt.driver.clone(), rt.conn.clone()))
        };
        if let Some((driver, conn)) = target {
            let token = CancellationToken::new();
            match bounded(
                &token,
                cfg.driver.disconnect_timeout(),
                driver.disconnect(&token, &conn),
            )
            .await
            {
                Ok(()) => info!(session = %session_id, connection = %conn.id, "Avatar disconnected"),
                Err(e) => warn!(session = %session_id, error = %e, "Disconnect failed during withdrawal"),
            }
        }

        {
            let mut slot = handle.lock();
            if slot.record.state != Withdrawing {
                return Ok(());
            }
            slot.capture_sensor_log();
            slot.runtime = None;
            self.apply(&handle, &mut slot, Completed, "Projection completed")?;
        }
        self.finalize(&handle);
        Ok(())
    }

    /// Immediate exit from any non-terminal state. Never awaits the driver
    /// and never waits on the persistence sink.
    pub fn emergency_withdraw(&self, session_id: &SessionId, reason: &str) -> Result<EmergencyReport> {
        let started = Instant::now();
        let handle = self.handle(session_id)?;
        let (previous_state, runtime, checkpoint) = {
            let mut slot = handle.lock();
            let state = slot.record.state;
            if state.is_terminal() || state == Inactive {
                return Err(Error::invalid_transition(
                    session_id.as_str(),
                    state,
                    "emergency withdraw",
                ));
            }
            handle.cancel_token().cancel();
            slot.record.withdrawal_reason = Some(reason.to_string());
            let checkpoint = slot.record.transition(
                EmergencyWithdrawal,
                format!("EMERGENCY WITHDRAWAL ACTIVATED: {}", reason),
            )?;
            slot.capture_sensor_log();
            (state, slot.runtime.take(), checkpoint)
        };
        self.announce(session_id, previous_state, EmergencyWithdrawal, &checkpoint);
        warn!(session = %session_id, from = %previous_state, reason = %reason, "EMERGENCY WITHDRAWAL");

        let cfg = &self.inner.config;
        if let Some(rt) = runtime {
            // Tasks stop on the cancelled token; their handles are released here.
            self.detach_disconnect(
                session_id.clone(),
                rt.driver,
                rt.conn,
                cfg.emergency.disconnect_timeout(),
                true,
            );
        }

        let record = handle.record();
        self.release(&record);
        self.persist_detached(checkpoint, record);

        let elapsed = started.elapsed();
        let within_budget = elapsed <= cfg.emergency.budget();
        if !within_budget {
            let err = Error::EmergencyTimeoutExceeded {
                session: session_id.to_string(),
                budget_ms: cfg.emergency.budget_ms,
                elapsed_ms: millis(elapsed),
            };
            warn!(error = %err, "Emergency transition over budget");
            bump(&self.inner.counters.emergency_timeouts);
        }
        Ok(EmergencyReport {
            session_id: session_id.clone(),
            previous_state,
            reason: reason.to_string(),
            elapsed_us: u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
            within_budget,
        })
    }

    /// Write the emergency checkpoint and the closed record off the caller's path.
    fn persist_detached(&self, checkpoint: Checkpoint, record: ProjectionSession) {
        let sink = self.inner.sink.clone();
        let write = move || {
            sink.record_checkpoint(&record.id, &checkpoint);
            sink.record_session(&record);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }

    /// Route an emergency through the session's watchdog when it is running.
    pub fn signal_emergency(&self, session_id: &SessionId, reason: &str) -> Result<()> {
        let handle = self.handle(session_id)?;
        let delivered = {
            let slot = handle.lock();
            slot.runtime
                .as_ref()
                .and_then(|rt| rt.tasks.watchdog.as_ref())
                .is_some_and(|w| !w.is_finished() && w.trigger(reason))
        };
        if delivered {
            debug!(session = %session_id, "Emergency signalled to watchdog");
            return Ok(());
        }
        self.emergency_withdraw(session_id, reason).map(|_| ())
    }

    /// Pull every live session of one consciousness out at once.
    pub fn emergency_withdraw_all(
        &self,
        consciousness_id: &ConsciousnessId,
        reason: &str,
    ) -> Vec<EmergencyReport> {
        let ids: Vec<SessionId> = self
            .inner
            .sessions
            .iter()
            .filter(|e| &e.consciousness_id == consciousness_id && !e.state().is_terminal())
            .map(|e| e.key().clone())
            .collect();
        ids.iter()
            .filter_map(|id| match self.emergency_withdraw(id, reason) {
                Ok(report) => Some(report),
                Err(e) => {
                    debug!(session = %id, error = %e, "Skipped during emergency sweep");
                    None
                }
            })
            .collect()
    }

    fn detach_disconnect(
        &self,
        session_id: SessionId,
        driver: Arc<dyn AvatarDriver>,
        conn: ConnectionHandle,
        timeout: Duration,
        emergency: bool,
    ) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(session = %session_id, "No async runtime; avatar left connected");
            return;
        };
        let counters = self.inner.counters.clone();
        let events = self.inner.events.clone();
        runtime.spawn(async move {
            let token = CancellationToken::new();
            let started = Instant::now();
            match bounded(&token, timeout, driver.disconnect(&token, &conn)).await {
                Ok(()) => debug!(session = %session_id, connection = %conn.id, "Detached disconnect finished"),
                Err(DriverError::Timeout(_)) if emergency => {
                    let elapsed_ms = millis(started.elapsed());
                    let err = Error::EmergencyTimeoutExceeded {
                        session: session_id.to_string(),
                        budget_ms: millis(timeout),
                        elapsed_ms,
                    };
                    warn!(error = %err, "Emergency disconnect timed out");
                    bump(&counters.emergency_timeouts);
                    let _ = events.send(SessionEvent::EmergencyTimeout {
                        session_id,
                        elapsed_ms,
                    });
                }
                Err(e) => warn!(session = %session_id, error = %e, "Detached disconnect failed"),
            }
        });
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get_session_status(&self, session_id: &SessionId) -> Result<SessionStatus> {
        Ok(self.handle(session_id)?.status())
    }

    pub fn session_record(&self, session_id: &SessionId) -> Result<ProjectionSession> {
        Ok(self.handle(session_id)?.record())
    }

    pub fn sessions_for(&self, consciousness_id: &ConsciousnessId) -> Vec<SessionStatus> {
        let mut out: Vec<SessionStatus> = self
            .inner
            .sessions
            .iter()
            .filter(|e| &e.consciousness_id == consciousness_id)
            .map(|e| e.status())
            .collect();
        out.sort_by_key(|s| s.started_at);
        out
    }

    pub fn active_sessions(&self) -> Vec<SessionStatus> {
        let mut out: Vec<SessionStatus> = self
            .inner
            .sessions
            .iter()
            .map(|e| e.status())
            .filter(|s| !s.state.is_terminal())
            .collect();
        out.sort_by_key(|s| s.started_at);
        out
    }

    pub fn statistics(&self) -> ProjectionStatistics {
        let c = &self.inner.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        ProjectionStatistics {
            registered_avatars: self.inner.registry.len(),
            avatar_types: self.inner.registry.avatar_types(),
            total_sessions: self.inner.sessions.len(),
            active_sessions: self
                .inner
                .sessions
                .iter()
                .filter(|e| !e.state().is_terminal())
                .count(),
            completed_sessions: load(&c.completed),
            failed_sessions: load(&c.failed),
            emergency_withdrawals: load(&c.emergencies),
            refused_requests: load(&c.refused),
            commands_accepted: load(&c.accepted),
            commands_rejected: load(&c.rejected),
            commands_executed: load(&c.executed),
            commands_failed: load(&c.command_failures),
            queue_full: load(&c.queue_full),
            emergency_timeouts: load(&c.emergency_timeouts),
        }
    }

    /// Withdraw connected sessions and fail the ones still negotiating.
    pub async fn shutdown(&self, reason: &str) -> usize {
        let live: Vec<(SessionId, ProjectionState)> = self
            .inner
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.state()))
            .filter(|(_, s)| !s.is_terminal())
            .collect();
        info!(sessions = live.len(), reason = %reason, "Shutting down projection sessions");

        let mut closed = 0;
        for (id, state) in live {
            let result = match state {
                Active | Projecting => self.withdraw(&id, reason).await,
                NegotiatingConsent => self.fail_negotiation(&id, reason),
                _ => continue,
            };
            match result {
                Ok(()) => closed += 1,
                Err(e) => warn!(session = %id, error = %e, "Session did not close cleanly"),
            }
        }
        closed
    }

    fn fail_negotiation(&self, session_id: &SessionId, reason: &str) -> Result<()> {
        let handle = self.handle(session_id)?;
        {
            let mut slot = handle.lock();
            slot.record.failure_reason = Some(reason.to_string());
            self.apply(&handle, &mut slot, Failed, format!("Projection failed: {}", reason))?;
        }
        self.finalize(&handle);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session tasks
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct LoopContext {
    handle: Arc<SessionHandle>,
    driver: Arc<dyn AvatarDriver>,
    conn: ConnectionHandle,
    events: broadcast::Sender<SessionEvent>,
    counters: Arc<Counters>,
    timeout: Duration,
}

impl LoopContext {
    async fn dispatch(&self, command: Command) {
        let cancel = self.handle.cancel_token();
        let session_id = self.handle.id.clone();
        debug!(session = %session_id, command = %command.id, action = command.action(), "Dispatching command");
        let result = bounded(cancel, self.timeout, self.driver.execute(cancel, &self.conn, &command)).await;

        let event = {
            let mut slot = self.handle.lock();
            match result {
                Ok(outcome) => {
                    slot.record.record_outcome(&command.id, Ok(outcome));
                    slot.record.last_heartbeat = Some(Utc::now());
                    bump(&self.counters.executed);
                    SessionEvent::CommandExecuted {
                        session_id,
                        command_id: command.id,
                    }
                }
                Err(e) => {
                    if e != DriverError::Cancelled {
                        error!(session = %session_id, command = %command.id, error = %e, "Command execution failed");
                        bump(&self.counters.command_failures);
                    }
                    slot.record.record_outcome(&command.id, Err(e.to_string()));
                    SessionEvent::CommandFailed {
                        session_id,
                        command_id: command.id,
                        error: e.to_string(),
                    }
                }
            }
        };
        let _ = self.events.send(event);
    }
}

/// Dispatch in submission order until cancelled or drained.
async fn command_loop(ctx: LoopContext, mut rx: mpsc::Receiver<Command>) {
    let cancel = ctx.handle.cancel_token().clone();
    let drain = ctx.handle.drain_token().clone();
    let mut draining = false;
    loop {
        let command = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = drain.cancelled(), if !draining => {
                draining = true;
                rx.close();
                continue;
            }
            next = rx.recv() => match next {
                Some(command) => command,
                None => break,
            },
        };
        ctx.dispatch(command).await;
    }
    debug!(session = %ctx.handle.id, draining, "Command loop stopped");
}

async fn sensor_loop(ctx: LoopContext, sensors: Arc<SensorStream>, interval: Duration) {
    let cancel = ctx.handle.cancel_token().clone();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match bounded(&cancel, ctx.timeout, ctx.driver.read_state(&cancel, &ctx.conn)).await {
            Ok(snapshot) => {
                let snapshot = sensors.push(snapshot);
                ctx.handle.touch();
                let _ = ctx.events.send(SessionEvent::SensorReading {
                    session_id: ctx.handle.id.clone(),
                    sequence: snapshot.sequence,
                });
            }
            Err(DriverError::Cancelled) => break,
            Err(e) => debug!(session = %ctx.handle.id, error = %e, "Sensor read failed"),
        }
    }
    debug!(session = %ctx.handle.id, readings = sensors.len(), "Sensor loop stopped");
}
