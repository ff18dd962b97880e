//! Collector side of fleetbeat: accepts node links and routes their samples.

pub mod dispatch;
pub mod listener;

pub use dispatch::Dispatcher;
pub use listener::{ListenerContext, NodeListener};
