//! Prepared, reusable display surface for one paywall identity.

use std::sync::atomic::{AtomicBool, Ordering};

use paywall_core::event_bus::PaywallEvent;
use paywall_core::types::{PaywallIdentity, RenderedUnit};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Building,
    Ready,
    Presenting,
    Dismissed,
}

/// A unit is owned by the `PaywallCache`; the coordinator borrows it for one
/// presentation at a time.
#[derive(Debug)]
pub struct PresentationUnit {
    identity: PaywallIdentity,
    rendered: RenderedUnit,
    content_hash: String,
    status: Mutex<UnitStatus>,
    valid: AtomicBool,
    content_loaded: AtomicBool,
    torn_down: AtomicBool,
    /// Telemetry recorded while presenting, flushed by the cache.
    telemetry: Mutex<Vec<PaywallEvent>>,
}

impl PresentationUnit {
    pub fn new(identity: PaywallIdentity, rendered: RenderedUnit, content_hash: String) -> Self {
        Self {
            identity,
            rendered,
            content_hash,
            status: Mutex::new(UnitStatus::Ready),
            valid: AtomicBool::new(true),
            content_loaded: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            telemetry: Mutex::new(Vec::new()),
        }
    }

    pub fn identity(&self) -> &PaywallIdentity {
        &self.identity
    }

    pub fn rendered(&self) -> &RenderedUnit {
        &self.rendered
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn status(&self) -> UnitStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: UnitStatus) {
        *self.status.lock() = status;
    }

    pub fn is_presenting(&self) -> bool {
        self.status() == UnitStatus::Presenting
    }

    /// False once the unit's content no longer matches the config or the
    /// cache was cleared. An invalid unit is never handed to a request made
    /// after the invalidation.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    /// Whether the surface finished loading its content at least once.
    pub fn is_content_loaded(&self) -> bool {
        self.content_loaded.load(Ordering::Acquire)
    }

    pub fn mark_content_loaded(&self) {
        self.content_loaded.store(true, Ordering::Release);
    }

    /// Buffer a telemetry event until the cache flushes this unit.
    pub fn record(&self, event: PaywallEvent) {
        self.telemetry.lock().push(event);
    }

    pub fn pending_telemetry(&self) -> usize {
        self.telemetry.lock().len()
    }

    pub(crate) fn drain_telemetry(&self) -> Vec<PaywallEvent> {
        std::mem::take(&mut *self.telemetry.lock())
    }

    pub(crate) fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Returns true exactly once, for the caller that should tear down.
    pub(crate) fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }
}
