//! Line-delimited JSON-RPC style control protocol
//!
//! Wire format:
//!
//! Client to server (request):
//!   { "id": "req-1", "method": "projection.request", "params": { "consciousness_id": "c1", "interface_id": "robot-1" } }
//!
//! Server to client (response):
//!   { "id": "req-1", "result": { "session_id": "avatar_session_1a2b3c4d" } }
//!   { "id": "req-1", "error": { "code": -32012, "message": "readiness insufficient ..." } }
//!
//! Server to client (event push, no id):
//!   { "event": "session", "data": { "session_id": "...", "state": "ACTIVE" } }

use serde::{Deserialize, Serialize};

pub mod methods {
    pub const PROJECTION_REQUEST: &str = "projection.request";
    pub const PROJECTION_CONSENT: &str = "projection.consent";
    pub const PROJECTION_WITHDRAW_CONSENT: &str = "projection.withdraw_consent";
    pub const PROJECTION_BEGIN: &str = "projection.begin";
    pub const PROJECTION_COMMAND: &str = "projection.command";
    pub const PROJECTION_STATUS: &str = "projection.status";
    pub const PROJECTION_WITHDRAW: &str = "projection.withdraw";
    pub const PROJECTION_EMERGENCY: &str = "projection.emergency";
    pub const PROJECTION_EMERGENCY_ALL: &str = "projection.emergency_all";
    pub const READINESS_ASSESS: &str = "readiness.assess";
    pub const READINESS_APPROVE: &str = "readiness.approve";
    pub const AVATAR_REGISTER: &str = "avatar.register";
    pub const AVATAR_UNREGISTER: &str = "avatar.unregister";
    pub const AVATAR_LIST: &str = "avatar.list";
    pub const AVATAR_PREFERENCES: &str = "avatar.preferences";
    pub const AVATAR_RECOMMEND: &str = "avatar.recommend";
    pub const AVATAR_SEARCH: &str = "avatar.search";
    pub const STATS: &str = "stats";
}

/// RPC request from client.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// RPC response to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn method_not_found(id: impl Into<String>, method: &str) -> Self {
        Self::err(id, -32601, format!("Method not found: {}", method))
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::err("", -32700, message)
    }

    pub fn busy(id: impl Into<String>) -> Self {
        Self::err(id, -32000, "Too many pending requests")
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// RPC error detail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl From<&crate::Error> for RpcError {
    fn from(err: &crate::Error) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Server-pushed event (no request correlation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub event: String,
    pub data: serde_json::Value,
}

impl EventMessage {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}
