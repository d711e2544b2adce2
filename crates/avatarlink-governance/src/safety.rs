//! Command safety validation
//!
//! The validator fails closed: a command passes only when it is attributed to
//! the projecting consciousness, free of harm patterns, and either on the safe
//! allowlist, kind by pattern, or flagged reversible by its issuer.

use avatarlink_core::{AvatarType, Command, ConsciousnessId, Error, Result};
use regex::{Regex, RegexBuilder};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_HARM_PATTERNS: &[&str] = &[
    "kill",
    "destroy",
    "grief",
    "tnt",
    "lava",
    "fire",
    "ban",
    "kick",
    "delete",
    "remove_player",
    "harm_others",
];

pub const DEFAULT_SAFE_ACTIONS: &[&str] = &[
    "move",
    "look",
    "chat",
    "place_block",
    "break_block",
    "inventory",
    "craft",
    "explore",
    "observe",
    "build",
    "help",
    "give",
    "share",
    "teach",
    "learn",
    "create",
    "place_flower",
    "plant",
    "decorate",
    "beautify",
    "teleport",
    "speak",
    "wave",
];

pub const KIND_PATTERNS: &[&str] = &[
    "place_", "plant", "give", "help", "share", "teach", "flower", "gift",
];

/// Pluggable harm detection.
pub trait HarmPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// The first harmful fragment found in `text`, if any. `text` is lowercase.
    fn find_harm(&self, text: &str) -> Option<String>;
}

/// Substring match against a token list.
pub struct TokenHarmPolicy {
    tokens: Vec<String>,
}

impl Default for TokenHarmPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_HARM_PATTERNS.iter().map(|s| s.to_string()))
    }
}

impl TokenHarmPolicy {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: tokens
                .into_iter()
                .map(|t| t.to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    pub fn extend(&mut self, tokens: impl IntoIterator<Item = String>) {
        for t in tokens {
            let t = t.to_lowercase();
            if !t.is_empty() && !self.tokens.contains(&t) {
                self.tokens.push(t);
            }
        }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }
}

impl HarmPolicy for TokenHarmPolicy {
    fn name(&self) -> &str {
        "tokens"
    }

    fn find_harm(&self, text: &str) -> Option<String> {
        self.tokens.iter().find(|t| text.contains(t.as_str())).cloned()
    }
}

/// Case-insensitive regular expressions, typically loaded from configuration.
pub struct RegexHarmPolicy {
    patterns: Vec<Regex>,
}

impl RegexHarmPolicy {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| Error::Config(format!("invalid harm pattern '{}': {}", p, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }
}

impl HarmPolicy for RegexHarmPolicy {
    fn name(&self) -> &str {
        "regex"
    }

    fn find_harm(&self, text: &str) -> Option<String> {
        self.patterns
            .iter()
            .find_map(|re| re.find(text).map(|m| m.as_str().to_string()))
    }
}

/// Who is projecting and into what.
#[derive(Clone, Copy, Debug)]
pub struct SafetyContext<'a> {
    pub consciousness_id: &'a ConsciousnessId,
    pub avatar_type: Option<AvatarType>,
}

impl<'a> SafetyContext<'a> {
    pub fn new(consciousness_id: &'a ConsciousnessId) -> Self {
        Self {
            consciousness_id,
            avatar_type: None,
        }
    }

    pub fn with_avatar_type(mut self, avatar_type: AvatarType) -> Self {
        self.avatar_type = Some(avatar_type);
        self
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Violation {
    #[error("command {command} is not attributed to any consciousness")]
    Unattributed { command: String },

    #[error("command {command} is attributed to {claimed}, not the projecting consciousness {expected}")]
    Misattributed {
        command: String,
        claimed: String,
        expected: String,
    },

    #[error("command {command} matches harm pattern '{pattern}' ({policy})")]
    HarmPattern {
        command: String,
        pattern: String,
        policy: String,
    },

    #[error("action '{action}' is not known to be safe and is not flagged reversible")]
    NotReversible { action: String },
}

pub struct SafetyValidator {
    policies: Vec<Arc<dyn HarmPolicy>>,
    safe_actions: HashSet<String>,
}

impl Default for SafetyValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyValidator {
    /// Default token policy and allowlist.
    pub fn new() -> Self {
        Self {
            policies: vec![Arc::new(TokenHarmPolicy::default()) as Arc<dyn HarmPolicy>],
            safe_actions: DEFAULT_SAFE_ACTIONS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Replace every harm policy.
    pub fn with_policies(mut self, policies: Vec<Arc<dyn HarmPolicy>>) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn HarmPolicy>) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn with_safe_actions(mut self, actions: impl IntoIterator<Item = String>) -> Self {
        self.safe_actions
            .extend(actions.into_iter().map(|a| a.to_lowercase()));
        self
    }

    pub fn policy_names(&self) -> Vec<&str> {
        self.policies.iter().map(|p| p.name()).collect()
    }

    fn is_kind(action: &str) -> bool {
        KIND_PATTERNS.iter().any(|p| action.contains(p))
    }

    pub fn validate(&self, command: &Command, ctx: &SafetyContext<'_>) -> std::result::Result<(), Violation> {
        let claimed = match &command.consciousness_id {
            Some(id) => id,
            None => {
                return Err(Violation::Unattributed {
                    command: command.id.clone(),
                })
            }
        };
        if claimed != ctx.consciousness_id {
            return Err(Violation::Misattributed {
                command: command.id.clone(),
                claimed: claimed.to_string(),
                expected: ctx.consciousness_id.to_string(),
            });
        }

        let text = command.inspectable_text().to_lowercase();
        for policy in &self.policies {
            if let Some(pattern) = policy.find_harm(&text) {
                return Err(Violation::HarmPattern {
                    command: command.id.clone(),
                    pattern,
                    policy: policy.name().to_string(),
                });
            }
        }

        let action = command.action().to_lowercase();
        if self.safe_actions.contains(&action) || Self::is_kind(&action) || command.reversible {
            debug!(command = %command.id, %action, "Command passed safety validation");
            return Ok(());
        }
        Err(Violation::NotReversible { action })
    }

    pub fn is_safe(&self, command: &Command, ctx: &SafetyContext<'_>) -> bool {
        self.validate(command, ctx).is_ok()
    }

    /// `validate` mapped into the crate-wide error type.
    pub fn check(&self, command: &Command, ctx: &SafetyContext<'_>) -> Result<()> {
        self.validate(command, ctx).map_err(|v| {
            warn!(command = %command.id, consciousness = %ctx.consciousness_id, violation = %v, "Command rejected");
            Error::SafetyViolation(v.to_string())
        })
    }
}
