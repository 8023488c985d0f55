use leadflow_core::events::{DomainEvent, EventSink};
use tracing::info;

/// Publishes domain events as structured log records.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: DomainEvent) {
        info!(
            event_name = "domain.event",
            event_id = %event.event_id,
            event_type = event.event_type.as_str(),
            subject_id = %event.subject_id,
            occurred_at = %event.occurred_at.to_rfc3339(),
            payload = %event.payload,
            "domain event emitted"
        );
    }
}
