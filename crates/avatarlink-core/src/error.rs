//! Error types for avatar projection

use crate::types::{Guidance, ProjectionState, ReadinessTier};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("avatar interface {interface} is not compliant: missing {}", missing.join(", "))]
    NonCompliantInterface {
        interface: String,
        missing: Vec<String>,
    },

    #[error("avatar interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("readiness insufficient: current tier {current}, required {required}")]
    ReadinessInsufficient {
        current: ReadinessTier,
        required: ReadinessTier,
        guidance: Box<Guidance>,
    },

    #[error("consent denied for session {0}")]
    ConsentDenied(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid state transition: cannot {operation} session {session} in state {from}")]
    InvalidStateTransition {
        session: String,
        from: ProjectionState,
        operation: String,
    },

    #[error("connection failed for session {session}: {reason}")]
    ConnectionFailed { session: String, reason: String },

    #[error("safety violation: {0}")]
    SafetyViolation(String),

    #[error("command queue full for session {0}")]
    QueueFull(String),

    #[error("emergency withdrawal of {session} exceeded {budget_ms}ms budget ({elapsed_ms}ms)")]
    EmergencyTimeoutExceeded {
        session: String,
        budget_ms: u64,
        elapsed_ms: u64,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn non_compliant(interface: impl Into<String>, missing: Vec<String>) -> Self {
        Self::NonCompliantInterface {
            interface: interface.into(),
            missing,
        }
    }

    pub fn invalid_transition(
        session: impl Into<String>,
        from: ProjectionState,
        operation: impl Into<String>,
    ) -> Self {
        Self::InvalidStateTransition {
            session: session.into(),
            from,
            operation: operation.into(),
        }
    }

    pub fn connection_failed(session: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            session: session.into(),
            reason: reason.into(),
        }
    }

    pub fn readiness_insufficient(
        current: ReadinessTier,
        required: ReadinessTier,
        guidance: Guidance,
    ) -> Self {
        Self::ReadinessInsufficient {
            current,
            required,
            guidance: Box::new(guidance),
        }
    }

    /// Validation errors are returned to the caller and never touch session state.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::NonCompliantInterface { .. }
                | Self::SafetyViolation(_)
                | Self::ReadinessInsufficient { .. }
                | Self::QueueFull(_)
        )
    }

    /// Stable numeric code used on the RPC surface.
    pub fn code(&self) -> i32 {
        match self {
            Self::NonCompliantInterface { .. } => -32010,
            Self::InterfaceNotFound(_) => -32011,
            Self::ReadinessInsufficient { .. } => -32012,
            Self::ConsentDenied(_) => -32013,
            Self::SessionNotFound(_) => -32014,
            Self::InvalidStateTransition { .. } => -32015,
            Self::ConnectionFailed { .. } => -32016,
            Self::SafetyViolation(_) => -32017,
            Self::QueueFull(_) => -32018,
            Self::EmergencyTimeoutExceeded { .. } => -32019,
            Self::Config(_) | Self::Json(_) => -32602,
            Self::Io(_) | Self::Internal(_) => -32603,
        }
    }
}
