//! Where finished sessions and checkpoints go

use crate::session::ProjectionSession;
use avatarlink_core::{Checkpoint, Result, SessionId};
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// Receives every checkpoint as it happens and each session record once it ends.
///
/// Called from inside the emergency path, so implementations must not block
/// for long. Failures are logged by the sink and never surface to callers.
pub trait PersistenceSink: Send + Sync {
    fn record_checkpoint(&self, session: &SessionId, checkpoint: &Checkpoint);
    fn record_session(&self, session: &ProjectionSession);
}

/// Keeps everything in memory. Used by tests and the demo.
#[derive(Default)]
pub struct MemorySink {
    checkpoints: Mutex<Vec<(SessionId, Checkpoint)>>,
    sessions: Mutex<Vec<ProjectionSession>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoints(&self) -> Vec<(SessionId, Checkpoint)> {
        self.checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn checkpoints_for(&self, session: &SessionId) -> Vec<Checkpoint> {
        self.checkpoints()
            .into_iter()
            .filter(|(s, _)| s == session)
            .map(|(_, c)| c)
            .collect()
    }

    pub fn sessions(&self) -> Vec<ProjectionSession> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl PersistenceSink for MemorySink {
    fn record_checkpoint(&self, session: &SessionId, checkpoint: &Checkpoint) {
        self.checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((session.clone(), checkpoint.clone()));
    }

    fn record_session(&self, session: &ProjectionSession) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(session.clone());
    }
}

/// Emits checkpoints as structured log events.
#[derive(Default)]
pub struct TracingSink;

impl PersistenceSink for TracingSink {
    fn record_checkpoint(&self, session: &SessionId, checkpoint: &Checkpoint) {
        info!(
            target: "avatarlink::audit",
            session = %session,
            state = %checkpoint.state,
            event = %checkpoint.event,
            "checkpoint"
        );
    }

    fn record_session(&self, session: &ProjectionSession) {
        info!(
            target: "avatarlink::audit",
            session = %session.id,
            consciousness = %session.consciousness_id,
            state = %session.state,
            commands = session.command_log.len(),
            sensor_readings = session.sensor_log.len(),
            "session closed"
        );
    }
}

/// Appends one JSON object per line.
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!("Audit log at {}", path.display());
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: serde_json::Value) {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(file, "{}", line) {
            warn!("Failed to append to {}: {}", self.path.display(), e);
        }
    }
}

impl PersistenceSink for JsonlSink {
    fn record_checkpoint(&self, session: &SessionId, checkpoint: &Checkpoint) {
        self.append(json!({
            "kind": "checkpoint",
            "session_id": session,
            "checkpoint": checkpoint,
        }));
    }

    fn record_session(&self, session: &ProjectionSession) {
        self.append(json!({
            "kind": "session",
            "session": session,
        }));
    }
}

/// Fans out to several sinks.
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<std::sync::Arc<dyn PersistenceSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: std::sync::Arc<dyn PersistenceSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl PersistenceSink for MultiSink {
    fn record_checkpoint(&self, session: &SessionId, checkpoint: &Checkpoint) {
        for sink in &self.sinks {
            sink.record_checkpoint(session, checkpoint);
        }
    }

    fn record_session(&self, session: &ProjectionSession) {
        for sink in &self.sinks {
            sink.record_session(session);
        }
    }
}
