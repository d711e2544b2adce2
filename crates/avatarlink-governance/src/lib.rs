//! Avatarlink Governance - who may project, into what, and with which commands
//!
//! Four independent judges consulted by the session manager: the interface
//! registry, the readiness assessor, the consent negotiator, and the safety
//! validator. None of them holds a session.

pub mod consent;
pub mod readiness;
pub mod registry;
pub mod safety;

pub use consent::{ConsentNegotiator, ConsentPolicy};
pub use readiness::{GovernanceDecision, ReadinessAssessor, TierChange, TierChangeKind};
pub use registry::{
    AvatarFilter, AvatarInterfaceRegistry, AvatarPreferences, AvatarRecommendation, ComfortLevel,
    RegisteredAvatar,
};
pub use safety::{
    HarmPolicy, RegexHarmPolicy, SafetyContext, SafetyValidator, TokenHarmPolicy, Violation,
};
