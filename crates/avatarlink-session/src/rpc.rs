//! RPC router - dispatches projection method calls to the session manager
//!
//! Requests and responses are single JSON lines. `serve` runs the loop over
//! any async reader/writer pair and interleaves session events as pushes.

use crate::manager::ProjectionSessionManager;
use avatarlink_core::{
    methods, AvatarInterface, Command, ConsciousnessId, Error, Indicators, InterfaceId,
    ReadinessIndicator, ReadinessTier, RpcRequest, RpcResponse, SessionId,
};
use avatarlink_governance::{AvatarFilter, AvatarPreferences, GovernanceDecision, RegisteredAvatar};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Result type for RPC handlers.
pub type RpcResult = Result<Value, (i32, String)>;

fn rpc_err(err: Error) -> (i32, String) {
    let message = match &err {
        Error::ReadinessInsufficient { guidance, .. } => {
            format!("{}: {}", err, guidance.message)
        }
        _ => err.to_string(),
    };
    (err.code(), message)
}

fn invalid_params(message: impl Into<String>) -> (i32, String) {
    (-32602, message.into())
}

fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, (i32, String)> {
    params[key]
        .as_str()
        .ok_or_else(|| invalid_params(format!("Missing required param: {}", key)))
}

fn session_param(params: &Value) -> Result<SessionId, (i32, String)> {
    required_str(params, "session_id").map(SessionId::from)
}

fn to_value<T: serde::Serialize>(value: T) -> RpcResult {
    serde_json::to_value(value).map_err(|e| (-32603, e.to_string()))
}

/// Route an RPC method call to the appropriate handler.
pub async fn route(method: &str, params: Value, manager: &ProjectionSessionManager) -> RpcResult {
    match method {
        methods::PROJECTION_REQUEST => handle_request(params, manager),
        methods::PROJECTION_CONSENT => handle_consent(params, manager),
        methods::PROJECTION_WITHDRAW_CONSENT => handle_withdraw_consent(params, manager).await,
        methods::PROJECTION_BEGIN => handle_begin(params, manager).await,
        methods::PROJECTION_COMMAND => handle_command(params, manager).await,
        methods::PROJECTION_STATUS => {
            let id = session_param(&params)?;
            to_value(manager.get_session_status(&id).map_err(rpc_err)?)
        }
        methods::PROJECTION_WITHDRAW => {
            let id = session_param(&params)?;
            let reason = params["reason"].as_str().unwrap_or("requested");
            manager.withdraw(&id, reason).await.map_err(rpc_err)?;
            to_value(manager.get_session_status(&id).map_err(rpc_err)?)
        }
        methods::PROJECTION_EMERGENCY => {
            let id = session_param(&params)?;
            let reason = params["reason"].as_str().unwrap_or("emergency requested");
            to_value(manager.emergency_withdraw(&id, reason).map_err(rpc_err)?)
        }
        methods::PROJECTION_EMERGENCY_ALL => {
            let cid = ConsciousnessId::from(required_str(&params, "consciousness_id")?);
            let reason = params["reason"].as_str().unwrap_or("emergency requested");
            to_value(manager.emergency_withdraw_all(&cid, reason))
        }
        methods::READINESS_ASSESS => handle_assess(params, manager),
        methods::READINESS_APPROVE => handle_approve(params, manager),
        methods::AVATAR_REGISTER => handle_register(params, manager),
        methods::AVATAR_UNREGISTER => {
            let id = InterfaceId::from(required_str(&params, "interface_id")?);
            manager.unregister_avatar_interface(&id).map_err(rpc_err)?;
            Ok(json!({ "interface_id": id }))
        }
        methods::AVATAR_LIST => Ok(json!({
            "avatars": summarize(&manager.list_avatar_interfaces()),
        })),
        methods::AVATAR_PREFERENCES => handle_preferences(params, manager),
        methods::AVATAR_RECOMMEND => {
            let cid = ConsciousnessId::from(required_str(&params, "consciousness_id")?);
            let limit = params["limit"].as_u64().unwrap_or(10) as usize;
            Ok(json!({ "recommendations": manager.recommend_avatars(&cid, limit) }))
        }
        methods::AVATAR_SEARCH => handle_search(params, manager),
        methods::STATS => to_value(manager.statistics()),
        _ => Err((-32601, format!("Method not found: {}", method))),
    }
}

/// Convert an RPC result to an RpcResponse.
pub fn to_response(id: &str, result: RpcResult) -> RpcResponse {
    match result {
        Ok(value) => RpcResponse::ok(id, value),
        Err((code, message)) => RpcResponse::err(id, code, message),
    }
}

pub async fn dispatch(request: RpcRequest, manager: &ProjectionSessionManager) -> RpcResponse {
    debug!(id = %request.id, method = %request.method, "RPC request");
    let result = route(&request.method, request.params, manager).await;
    if let Err((code, message)) = &result {
        debug!(id = %request.id, code, message = %message, "RPC error");
    }
    to_response(&request.id, result)
}

// ---------------------------------------------------------------------------
// projection.*
// ---------------------------------------------------------------------------

fn handle_request(params: Value, manager: &ProjectionSessionManager) -> RpcResult {
    let cid = ConsciousnessId::from(required_str(&params, "consciousness_id")?);
    let iid = InterfaceId::from(required_str(&params, "interface_id")?);
    let intent = params["intent"].as_str().unwrap_or("exploration");
    let minutes = params["estimated_duration_minutes"].as_u64().unwrap_or(30);

    let session_id = manager
        .request_projection(&cid, &iid, intent, minutes)
        .map_err(rpc_err)?;
    let status = manager.get_session_status(&session_id).map_err(rpc_err)?;
    Ok(json!({ "session_id": session_id, "state": status.state, "consent": status.consent }))
}

fn handle_consent(params: Value, manager: &ProjectionSessionManager) -> RpcResult {
    let id = session_param(&params)?;
    let granted = params["granted"]
        .as_bool()
        .ok_or_else(|| invalid_params("Missing required param: granted"))?;
    to_value(manager.record_consent(&id, granted).map_err(rpc_err)?)
}

async fn handle_withdraw_consent(params: Value, manager: &ProjectionSessionManager) -> RpcResult {
    let id = session_param(&params)?;
    to_value(manager.withdraw_consent(&id).await.map_err(rpc_err)?)
}

async fn handle_begin(params: Value, manager: &ProjectionSessionManager) -> RpcResult {
    let id = session_param(&params)?;
    manager.begin_projection(&id).await.map_err(rpc_err)?;
    to_value(manager.get_session_status(&id).map_err(rpc_err)?)
}

async fn handle_command(params: Value, manager: &ProjectionSessionManager) -> RpcResult {
    let id = session_param(&params)?;
    let command: Command = serde_json::from_value(params["command"].clone())
        .map_err(|e| invalid_params(format!("Invalid command: {}", e)))?;
    to_value(manager.send_command(&id, command).await.map_err(rpc_err)?)
}

// ---------------------------------------------------------------------------
// readiness.*
// ---------------------------------------------------------------------------

fn handle_assess(params: Value, manager: &ProjectionSessionManager) -> RpcResult {
    let cid = ConsciousnessId::from(required_str(&params, "consciousness_id")?);
    let raw = params["indicators"]
        .as_object()
        .ok_or_else(|| invalid_params("Missing required param: indicators"))?;
    let mut indicators = Indicators::new();
    for (name, score) in raw {
        let indicator: ReadinessIndicator = name.parse().map_err(invalid_params)?;
        let score = score
            .as_f64()
            .ok_or_else(|| invalid_params(format!("Indicator {} must be a number", name)))?;
        indicators.insert(indicator, score);
    }
    to_value(manager.assess_readiness(&cid, indicators))
}

fn handle_approve(params: Value, manager: &ProjectionSessionManager) -> RpcResult {
    let cid = ConsciousnessId::from(required_str(&params, "consciousness_id")?);
    let tier: ReadinessTier = required_str(&params, "tier")?
        .parse()
        .map_err(invalid_params)?;
    let mut decision = GovernanceDecision::new(
        required_str(&params, "approver")?,
        params["reason"].as_str().unwrap_or(""),
    );
    if params["override"].as_bool().unwrap_or(false) {
        decision = decision.overriding();
    }
    to_value(
        manager
            .approve_tier_change(&cid, tier, decision)
            .map_err(rpc_err)?,
    )
}

// ---------------------------------------------------------------------------
// avatar.*
// ---------------------------------------------------------------------------

fn handle_register(params: Value, manager: &ProjectionSessionManager) -> RpcResult {
    let interface: AvatarInterface = serde_json::from_value(params["interface"].clone())
        .map_err(|e| invalid_params(format!("Invalid interface: {}", e)))?;
    let id = interface.id.clone();
    let category = manager
        .register_avatar_interface(interface)
        .map_err(rpc_err)?;
    info!("avatar.register: {} ({})", id, category);
    Ok(json!({
        "interface_id": id,
        "category": category,
        "required_tier": manager.registry().required_tier(&id),
    }))
}

fn summarize(entries: &[RegisteredAvatar]) -> Vec<Value> {
    entries
        .iter()
        .map(|r| {
            json!({
                "id": r.interface.id,
                "name": r.interface.name,
                "avatar_type": r.interface.avatar_type,
                "category": r.category,
                "required_tier": r.required_tier,
            })
        })
        .collect()
}

fn handle_preferences(params: Value, manager: &ProjectionSessionManager) -> RpcResult {
    let cid = ConsciousnessId::from(required_str(&params, "consciousness_id")?);
    if params.get("preferences").is_none() {
        return Ok(json!({ "preferences": manager.avatar_preferences(&cid) }));
    }
    let mut body = params["preferences"].clone();
    if let Some(map) = body.as_object_mut() {
        map.insert("consciousness_id".into(), json!(cid));
    }
    let preferences: AvatarPreferences = serde_json::from_value(body)
        .map_err(|e| invalid_params(format!("Invalid preferences: {}", e)))?;
    manager.set_avatar_preferences(preferences);
    Ok(json!({ "preferences": manager.avatar_preferences(&cid) }))
}

fn handle_search(params: Value, manager: &ProjectionSessionManager) -> RpcResult {
    let query = params["query"].as_str().unwrap_or("");
    let filter: AvatarFilter = match params.get("filter") {
        Some(raw) if !raw.is_null() => serde_json::from_value(raw.clone())
            .map_err(|e| invalid_params(format!("Invalid filter: {}", e)))?,
        _ => AvatarFilter::default(),
    };
    Ok(json!({ "avatars": summarize(&manager.search_avatars(query, &filter)) }))
}

// ---------------------------------------------------------------------------
// Line transport
// ---------------------------------------------------------------------------

/// Requests that may wait on a driver, a queue or a drain. They run in
/// arrival order on a per-connection worker so the reader stays free.
fn runs_on_worker(method: &str) -> bool {
    matches!(
        method,
        methods::PROJECTION_BEGIN
            | methods::PROJECTION_COMMAND
            | methods::PROJECTION_WITHDRAW
            | methods::PROJECTION_WITHDRAW_CONSENT
    )
}

/// Pending worker requests per connection before new ones are refused.
const WORKER_BACKLOG: usize = 64;

/// Serve newline-delimited requests until the reader closes.
///
/// Driver-bound calls are handed to a worker task; everything else,
/// emergency withdrawal included, is answered as soon as its line is read.
/// Session events are written as push messages between responses.
pub async fn serve<R, W>(
    reader: R,
    mut writer: W,
    manager: ProjectionSessionManager,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut events = manager.subscribe();

    let (work_tx, mut work_rx) = mpsc::channel::<RpcRequest>(WORKER_BACKLOG);
    let (done_tx, mut done_rx) = mpsc::channel::<RpcResponse>(WORKER_BACKLOG);
    let worker_manager = manager.clone();
    tokio::spawn(async move {
        while let Some(request) = work_rx.recv().await {
            let response = dispatch(request, &worker_manager).await;
            if done_tx.send(response).await.is_err() {
                break;
            }
        }
    });
    // Cleared at end of input; the loop then drains worker responses.
    let mut work_tx = Some(work_tx);

    loop {
        let out = tokio::select! {
            line = lines.next_line(), if work_tx.is_some() => {
                let Some(line) = line? else {
                    work_tx = None;
                    continue;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let response = match serde_json::from_str::<RpcRequest>(line) {
                    Ok(request) if runs_on_worker(&request.method) => {
                        match hand_off(work_tx.as_ref(), request) {
                            Some(refused) => refused,
                            None => continue,
                        }
                    }
                    Ok(request) => dispatch(request, &manager).await,
                    Err(e) => {
                        warn!("Unparseable request: {}", e);
                        RpcResponse::parse_error(format!("Parse error: {}", e))
                    }
                };
                serde_json::to_string(&response)
            }
            Some(response) = done_rx.recv() => serde_json::to_string(&response),
            event = events.recv(), if work_tx.is_some() => match event {
                Ok(event) => serde_json::to_string(&event.to_message()),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event push lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            else => break,
        };
        let mut text = out.map_err(std::io::Error::other)?;
        text.push('\n');
        writer.write_all(text.as_bytes()).await?;
        writer.flush().await?;
    }
    info!("RPC stream closed");
    Ok(())
}

/// Queue a request for the worker. Returns the response to send instead
/// when the backlog is full.
fn hand_off(
    worker: Option<&mpsc::Sender<RpcRequest>>,
    request: RpcRequest,
) -> Option<RpcResponse> {
    let Some(worker) = worker else {
        return Some(RpcResponse::err(&request.id, -32603, "RPC stream closing"));
    };
    match worker.try_send(request) {
        Ok(()) => None,
        Err(e) => {
            let request = e.into_inner();
            warn!(id = %request.id, method = %request.method, "Worker backlog full");
            Some(RpcResponse::busy(&request.id))
        }
    }
}
