//! Telemetry event bus: trait for emitting paywall lifecycle events.
//!
//! Components accept an `Arc<dyn EventSink>`; the host application routes
//! the events to its analytics backend.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaywallEventKind {
    TriggerFire,
    PaywallOpen,
    PaywallClose,
    PaywallDecline,
    TransactionStart,
    TransactionComplete,
    TransactionFail,
    TransactionRestore,
    LoadTimeout,
    DeepLink,
    UnitEvicted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaywallEvent {
    pub event_id: Uuid,
    pub kind: PaywallEventKind,
    pub user_id: Option<String>,
    pub paywall_id: Option<String>,
    pub experiment_id: Option<String>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl PaywallEvent {
    pub fn with_experiment(mut self, experiment_id: impl Into<String>) -> Self {
        self.experiment_id = Some(experiment_id.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: PaywallEvent);
}

/// No-op sink for hosts that don't collect telemetry.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: PaywallEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<PaywallEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<PaywallEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_kind(&self, kind: PaywallEventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: PaywallEvent) {
        self.events.lock().push(event);
    }
}

/// Convenience builder for creating a `PaywallEvent` with minimal boilerplate.
pub fn make_event(
    kind: PaywallEventKind,
    user_id: Option<String>,
    paywall_id: Option<String>,
) -> PaywallEvent {
    PaywallEvent {
        event_id: Uuid::new_v4(),
        kind,
        user_id,
        paywall_id,
        experiment_id: None,
        detail: None,
        timestamp: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        assert_eq!(sink.count(), 0);

        sink.emit(make_event(
            PaywallEventKind::TriggerFire,
            Some("user-1".into()),
            None,
        ));
        sink.emit(
            make_event(
                PaywallEventKind::PaywallOpen,
                Some("user-1".into()),
                Some("pw_123".into()),
            )
            .with_experiment("exp_1"),
        );

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_kind(PaywallEventKind::PaywallOpen), 1);

        let events = sink.events();
        assert_eq!(events[1].paywall_id.as_deref(), Some("pw_123"));
        assert_eq!(events[1].experiment_id.as_deref(), Some("exp_1"));

        sink.clear();
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_noop_sink() {
        let sink = noop_sink();
        sink.emit(make_event(PaywallEventKind::UnitEvicted, None, None));
    }
}
