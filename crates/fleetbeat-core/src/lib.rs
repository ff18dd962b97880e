//! fleetbeat-core: wire format, identity records, configuration and the
//! ring buffer behind the outbound queue. All other fleetbeat crates depend
//! on this one.

pub mod config;
pub mod identity;
pub mod queue;
pub mod snapshot;
pub mod wire;

pub use identity::NodeIdentity;
pub use snapshot::ConfigSnapshot;
pub use wire::{Envelope, EnvelopeView, Kind, MessageId, WireError};
