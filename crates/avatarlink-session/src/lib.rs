//! Avatarlink Session - projection lifecycle, per-session queues and the emergency watchdog

pub mod audit;
pub mod config;
pub mod manager;
pub mod queue;
pub mod rpc;
pub mod session;
pub mod watchdog;

pub use audit::{JsonlSink, MemorySink, MultiSink, PersistenceSink, TracingSink};
pub use config::ProjectionConfig;
pub use manager::{
    CommandReceipt, EmergencyReport, ManagerBuilder, ProjectionSessionManager,
    ProjectionStatistics, SessionEvent,
};
pub use queue::{CommandQueue, SensorStream};
pub use session::{CommandLogEntry, ProjectionSession, SessionHandle, SessionStatus, Transition};
pub use watchdog::{EmergencyHandler, EmergencyWithdrawalController, HealthThresholds, WatchdogHandle};
