//! Informed consent negotiation
//!
//! Records are append-only per session: a decision never mutates the pending
//! entry, it appends a new one. The latest entry is the effective decision.

use avatarlink_core::{
    AvatarInterface, ConsciousnessId, ConsentDecision, ConsentPayload, ConsentRecord, Error,
    ProjectionState, Result, SessionId,
};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Options every disclosure offers regardless of the interface.
const BASELINE_WITHDRAWAL_OPTIONS: [&str; 2] = ["consciousness_initiated", "guardian_initiated"];

/// Who decides once a disclosure has been presented.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsentPolicy {
    AutoGrant,
    AutoDeny,
    /// Wait for an explicit decision.
    #[default]
    Manual,
}

pub struct ConsentNegotiator {
    policy: ConsentPolicy,
    records: DashMap<SessionId, Vec<ConsentRecord>>,
}

impl Default for ConsentNegotiator {
    fn default() -> Self {
        Self::new(ConsentPolicy::default())
    }
}

impl ConsentNegotiator {
    pub fn new(policy: ConsentPolicy) -> Self {
        Self {
            policy,
            records: DashMap::new(),
        }
    }

    pub fn policy(&self) -> ConsentPolicy {
        self.policy
    }

    /// Decision the policy makes without waiting, if any.
    pub fn auto_decision(&self) -> Option<bool> {
        match self.policy {
            ConsentPolicy::AutoGrant => Some(true),
            ConsentPolicy::AutoDeny => Some(false),
            ConsentPolicy::Manual => None,
        }
    }

    pub fn build_payload(
        interface: &AvatarInterface,
        intent: &str,
        estimated_duration_minutes: u64,
    ) -> ConsentPayload {
        let mut withdrawal_options = interface.withdrawal_mechanisms.clone();
        for opt in BASELINE_WITHDRAWAL_OPTIONS {
            if !withdrawal_options.iter().any(|o| o == opt) {
                withdrawal_options.push(opt.to_string());
            }
        }
        ConsentPayload {
            avatar_name: interface.name.clone(),
            avatar_type: interface.avatar_type,
            avatar_description: interface.description.clone(),
            capabilities: interface.capabilities.iter().cloned().collect(),
            safety_features: interface.safety_features.iter().cloned().collect(),
            intent: intent.to_string(),
            estimated_duration_minutes,
            withdrawal_options,
            consent_requirements: interface.consent_requirements.clone(),
        }
    }

    /// Open negotiation for a session. Returns the pending record.
    pub fn request_consent(
        &self,
        session_id: &SessionId,
        consciousness_id: &ConsciousnessId,
        interface: &AvatarInterface,
        intent: &str,
        estimated_duration_minutes: u64,
    ) -> Result<ConsentRecord> {
        let record = ConsentRecord {
            session_id: session_id.clone(),
            consciousness_id: consciousness_id.clone(),
            decision: ConsentDecision::Pending,
            payload: Self::build_payload(interface, intent, estimated_duration_minutes),
            recorded_at: Utc::now(),
        };

        match self.records.entry(session_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::invalid_transition(
                    session_id.as_str(),
                    ProjectionState::NegotiatingConsent,
                    "request consent twice for",
                ));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(vec![record.clone()]);
            }
        }

        info!(session = %session_id, consciousness = %consciousness_id, avatar = %interface.name, "Consent requested");
        Ok(record)
    }

    fn append(
        &self,
        session_id: &SessionId,
        expect: ConsentDecision,
        next: ConsentDecision,
        operation: &str,
        state: ProjectionState,
    ) -> Result<ConsentRecord> {
        let mut history = self
            .records
            .get_mut(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        let latest = history
            .last()
            .cloned()
            .ok_or_else(|| Error::Internal(format!("empty consent history for {}", session_id)))?;
        if latest.decision != expect {
            return Err(Error::invalid_transition(session_id.as_str(), state, operation));
        }
        let record = ConsentRecord {
            decision: next,
            recorded_at: Utc::now(),
            ..latest
        };
        history.push(record.clone());
        Ok(record)
    }

    /// Deliver the consciousness' decision. Write-once.
    pub fn decide(&self, session_id: &SessionId, granted: bool) -> Result<ConsentRecord> {
        let next = if granted {
            ConsentDecision::Granted
        } else {
            ConsentDecision::Denied
        };
        let record = self.append(
            session_id,
            ConsentDecision::Pending,
            next,
            "decide consent for",
            ProjectionState::NegotiatingConsent,
        )?;
        info!(session = %session_id, granted, "Consent decided");
        Ok(record)
    }

    /// Revoke granted consent. Appends a terminal withdrawn entry.
    /// `state` is the session's current state, reported if the revocation is refused.
    pub fn withdraw(&self, session_id: &SessionId, state: ProjectionState) -> Result<ConsentRecord> {
        let record = self.append(
            session_id,
            ConsentDecision::Granted,
            ConsentDecision::Withdrawn,
            "withdraw consent for",
            state,
        )?;
        info!(session = %session_id, "Consent withdrawn");
        Ok(record)
    }

    pub fn latest(&self, session_id: &SessionId) -> Option<ConsentRecord> {
        self.records.get(session_id).and_then(|h| h.last().cloned())
    }

    pub fn is_granted(&self, session_id: &SessionId) -> bool {
        self.latest(session_id).is_some_and(|r| r.is_granted())
    }

    pub fn history(&self, session_id: &SessionId) -> Vec<ConsentRecord> {
        self.records
            .get(session_id)
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Drop a session's records once it has been persisted elsewhere.
    pub fn forget(&self, session_id: &SessionId) {
        if self.records.remove(session_id).is_some() {
            debug!(session = %session_id, "Consent history released");
        }
    }
}
