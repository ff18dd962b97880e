//! fleetbeat-node: the telemetry agent. A session to the collector plus the
//! healthbeat that feeds it.

pub mod healthbeat;
pub mod session;

pub use healthbeat::Healthbeat;
pub use session::{Session, SessionOptions, SessionTasks, RECONNECT_ATTEMPTS};
