//! Avatarlink Driver - the boundary between a session and an actuator
//!
//! Concrete device bridges (browser automation, RCON, robot middleware) live
//! outside this workspace and implement [`AvatarDriver`]. The bundled
//! [`SimulatedDriver`] backs the tests and the demo CLI.

pub mod driver;
pub mod simulated;

pub use driver::{bounded, AvatarDriver, ConnectionHandle, DriverError, DriverResult, DriverSet};
pub use simulated::{SimBehavior, SimulatedDriver};
