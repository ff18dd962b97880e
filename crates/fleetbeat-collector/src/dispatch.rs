//! Routes envelopes received from nodes by kind.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use fleetbeat_core::wire::{EnvelopeView, Kind};
use fleetbeat_services::samples::unix_ms;
use fleetbeat_services::{MetricsSink, NodeSession, Sample, SampleBatch};

/// Decodes metric envelopes and hands them to the sink. Every other kind is
/// logged and dropped.
pub struct Dispatcher {
    sink: Arc<dyn MetricsSink>,
}

impl Dispatcher {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }

    /// Dispatch one received data frame. Malformed input is counted and
    /// dropped; it never ends the session.
    pub fn dispatch(&self, session: &NodeSession, bytes: &[u8]) {
        let view = match EnvelopeView::parse(bytes) {
            Ok(view) => view,
            Err(e) => {
                session.decode_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(node = format_args!("{:08x}", session.id()), error = %e, "malformed envelope");
                return;
            }
        };

        let kind = view.kind();
        if !kind.is_metric() {
            match kind {
                Kind::Command => tracing::info!(
                    node = format_args!("{:08x}", session.id()),
                    command = %String::from_utf8_lossy(view.payload()),
                    "command from node ignored"
                ),
                _ => tracing::debug!(kind = kind.name(), id = %view.id(), "no handler for envelope"),
            }
            return;
        }

        // The payload borrows the receive buffer; decoding copies it out.
        let sample = match Sample::decode(kind, view.payload()) {
            Ok(sample) => sample,
            Err(e) => {
                session.decode_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(kind = kind.name(), error = %e, "undecodable sample");
                return;
            }
        };

        session.samples_in.fetch_add(1, Ordering::Relaxed);
        let batch = SampleBatch {
            node_id: session.id(),
            hostname: session.identity().hostname,
            received_ms: unix_ms(),
            samples: vec![sample],
        };
        if let Err(e) = self.sink.accept(&batch) {
            tracing::warn!(sink = self.sink.name(), error = %e, "sink rejected samples");
        }
    }
}
