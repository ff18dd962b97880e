//! fleetbeat-services: session plumbing shared by the node and the
//! collector: the outbound queue, the link writer, the session registry and
//! the collaborators (samplers, identity stores, metrics sinks) behind them.

pub mod handshake;
pub mod link;
pub mod node_session;
pub mod outbound;
pub mod registry;
pub mod sampler;
pub mod samples;
pub mod shutdown;
pub mod sink;
pub mod state;
pub mod store;

pub use handshake::{Accepted, HandshakeError};
pub use link::{Control, Inbound, Link, LinkGate, LinkWriter, ReadOutcome, WriterHandle};
pub use node_session::{new_node_registry, NodeInfo, NodeRegistry, NodeSession};
pub use outbound::{OutboundQueue, QueueEntry};
pub use registry::SessionRegistry;
pub use sampler::{host_samplers, Sampler};
pub use samples::Sample;
pub use shutdown::{Shutdown, ShutdownSignal};
pub use sink::{FanoutSink, JsonlSink, LogSink, MemorySink, MetricsSink, SampleBatch};
pub use state::{SessionState, StateCell};
pub use store::{FileIdentityStore, IdentityStore, MemoryIdentityStore};
