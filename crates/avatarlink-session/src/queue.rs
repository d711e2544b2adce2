//! Per-session channels between a session and its driver
//!
//! Commands flow through a bounded mpsc channel: senders wait up to a deadline
//! for room, then give up with `QueueFull`. Sensor readings go into a ring
//! buffer that never blocks and drops the oldest reading on overflow.

use avatarlink_core::{Command, Error, Result, SensorSnapshot, SessionId};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

const SENSOR_NOTIFY_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// CommandQueue
// ---------------------------------------------------------------------------

/// Sending half of a session's command channel.
#[derive(Clone, Debug)]
pub struct CommandQueue {
    session: SessionId,
    tx: mpsc::Sender<Command>,
    capacity: usize,
    timeout: Duration,
}

impl CommandQueue {
    pub fn bounded(
        session: SessionId,
        capacity: usize,
        timeout: Duration,
    ) -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                session,
                tx,
                capacity: capacity.max(1),
                timeout,
            },
            rx,
        )
    }

    /// Wait for room up to the configured timeout. A full queue drops the command.
    pub async fn enqueue(&self, command: Command) -> Result<()> {
        let id = command.id.clone();
        match self.tx.send_timeout(command, self.timeout).await {
            Ok(()) => {
                debug!(session = %self.session, command = %id, "Command enqueued");
                Ok(())
            }
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!(session = %self.session, command = %id, "Command queue full; command dropped");
                Err(Error::QueueFull(self.session.to_string()))
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(Error::Internal(format!(
                "command queue for {} is closed",
                self.session
            ))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Commands waiting to be dispatched.
    pub fn pending(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ---------------------------------------------------------------------------
// SensorStream
// ---------------------------------------------------------------------------

/// Bounded ring of sensor readings with gap-revealing sequence numbers.
pub struct SensorStream {
    buffer: Mutex<VecDeque<SensorSnapshot>>,
    capacity: usize,
    next_sequence: AtomicU64,
    evicted: AtomicU64,
    notify: broadcast::Sender<SensorSnapshot>,
}

impl SensorStream {
    pub fn new(capacity: usize) -> Self {
        let (notify, _) = broadcast::channel(SENSOR_NOTIFY_CAPACITY);
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            next_sequence: AtomicU64::new(1),
            evicted: AtomicU64::new(0),
            notify,
        }
    }

    /// Stamp and store a reading. Never blocks on consumers.
    pub fn push(&self, mut snapshot: SensorSnapshot) -> SensorSnapshot {
        snapshot.sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        {
            let mut buf = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            while buf.len() >= self.capacity {
                buf.pop_front();
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
            buf.push_back(snapshot.clone());
        }
        // no receivers is fine
        let _ = self.notify.send(snapshot.clone());
        snapshot
    }

    pub fn latest(&self) -> Option<SensorSnapshot> {
        self.buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .back()
            .cloned()
    }

    /// Copy of the buffered readings, oldest first.
    pub fn snapshot(&self) -> Vec<SensorSnapshot> {
        self.buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Readings dropped to make room.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SensorSnapshot> {
        self.notify.subscribe()
    }
}
