//! Identity-keyed store of prepared presentation units.
//!
//! At most one build runs per identity; concurrent requests for the same
//! identity wait on that build and all receive its result. Retained units are
//! capped LRU-style, and a unit that is presenting is never torn down until
//! it is released.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use paywall_core::collaborators::{ConfigStore, ContentRenderer};
use paywall_core::event_bus::{make_event, EventSink, PaywallEventKind};
use paywall_core::types::{CampaignConfig, PaywallIdentity, RenderedUnit};
use paywall_core::{PaywallError, PaywallResult};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::unit::{PresentationUnit, UnitStatus};

type BuildResult = Result<Arc<PresentationUnit>, String>;

struct InFlight {
    build_id: u64,
    content_hash: String,
    receiver: watch::Receiver<Option<BuildResult>>,
    /// Set when the identity was invalidated mid-build; the result is still
    /// delivered to waiters but not retained.
    stale: bool,
}

#[derive(Default)]
struct CacheState {
    units: HashMap<PaywallIdentity, Arc<PresentationUnit>>,
    /// Front is least recently used.
    recency: VecDeque<PaywallIdentity>,
    in_flight: HashMap<PaywallIdentity, InFlight>,
    /// Units waiting for telemetry drain and renderer teardown.
    retired: Vec<Arc<PresentationUnit>>,
    /// Builds that finished after invalidation. Torn down once no waiter
    /// still holds or presents them.
    orphans: Vec<Arc<PresentationUnit>>,
    next_build_id: u64,
}

impl CacheState {
    fn touch(&mut self, identity: &PaywallIdentity) {
        self.recency.retain(|id| id != identity);
        self.recency.push_back(identity.clone());
    }

    fn detach(&mut self, identity: &PaywallIdentity) -> Option<Arc<PresentationUnit>> {
        self.recency.retain(|id| id != identity);
        self.units.remove(identity)
    }

    /// Drops `identity` from the cache. Idle units are queued for teardown;
    /// a presenting unit is only detached and retires on release.
    fn discard(&mut self, identity: &PaywallIdentity) -> bool {
        match self.detach(identity) {
            Some(unit) => {
                unit.invalidate();
                if !unit.is_presenting() {
                    self.retired.push(unit);
                }
                true
            }
            None => false,
        }
    }

    /// Moves orphaned units nobody else references onto `retired`.
    fn collect_orphans(&mut self) {
        for unit in std::mem::take(&mut self.orphans) {
            if unit.is_torn_down() {
                continue;
            }
            if Arc::strong_count(&unit) == 1 && !unit.is_presenting() {
                self.retired.push(unit);
            } else {
                self.orphans.push(unit);
            }
        }
    }

    /// `protect` shields a unit that was just inserted.
    fn enforce_capacity(&mut self, max_units: usize, protect: Option<&PaywallIdentity>) {
        while self.units.len() > max_units {
            let victim = self
                .recency
                .iter()
                .filter(|id| Some(*id) != protect)
                .find(|id| self.units.get(*id).map_or(false, |u| !u.is_presenting()))
                .cloned();

            match victim {
                Some(identity) => {
                    if let Some(unit) = self.detach(&identity) {
                        metrics::counter!("paywall.cache.evicted").increment(1);
                        debug!(identity = %identity, "Evicting least recently used unit");
                        self.retired.push(unit);
                    }
                }
                None => {
                    debug!(
                        retained = self.units.len(),
                        max_units, "Every retained unit is presenting, eviction deferred"
                    );
                    break;
                }
            }
        }
    }
}

struct CacheInner {
    renderer: Arc<dyn ContentRenderer>,
    config_store: Arc<dyn ConfigStore>,
    sink: Arc<dyn EventSink>,
    max_units: usize,
    state: Mutex<CacheState>,
}

impl CacheInner {
    fn complete_build(
        &self,
        identity: &PaywallIdentity,
        build_id: u64,
        content_hash: String,
        result: PaywallResult<RenderedUnit>,
    ) -> BuildResult {
        let mut state = self.state.lock();
        let stale = match state.in_flight.remove(identity) {
            Some(flight) if flight.build_id == build_id => flight.stale,
            Some(other) => {
                state.in_flight.insert(identity.clone(), other);
                true
            }
            None => true,
        };

        match result {
            Ok(rendered) => {
                let unit = Arc::new(PresentationUnit::new(
                    identity.clone(),
                    rendered,
                    content_hash,
                ));
                if stale {
                    unit.invalidate();
                    state.orphans.push(unit.clone());
                    info!(identity = %identity, "Build finished after invalidation, not retaining");
                } else {
                    state.units.insert(identity.clone(), unit.clone());
                    state.touch(identity);
                    state.enforce_capacity(self.max_units, Some(identity));
                    info!(identity = %identity, retained = state.units.len(), "Unit built");
                }
                Ok(unit)
            }
            Err(e) => {
                metrics::counter!("paywall.cache.build_failed").increment(1);
                warn!(identity = %identity, error = %e, "Unit build failed");
                Err(match e {
                    PaywallError::Build(message) => message,
                    other => other.to_string(),
                })
            }
        }
    }

    async fn drain_retired(&self) {
        let retired = {
            let mut state = self.state.lock();
            state.collect_orphans();
            std::mem::take(&mut state.retired)
        };
        for unit in retired {
            self.retire(unit).await;
        }
    }

    /// Buffered telemetry is flushed before the renderer tears the unit down.
    async fn retire(&self, unit: Arc<PresentationUnit>) {
        if !unit.begin_teardown() {
            return;
        }
        let pending = unit.drain_telemetry();
        let flushed = pending.len();
        for event in pending {
            self.sink.emit(event);
        }
        self.sink.emit(
            make_event(
                PaywallEventKind::UnitEvicted,
                None,
                Some(unit.identity().identifier.clone()),
            )
            .with_detail(unit.identity().to_string()),
        );
        self.renderer.teardown(unit.rendered()).await;
        info!(identity = %unit.identity(), flushed, "Unit torn down");
    }
}

/// Removes the in-flight entry if the build task dies before completing.
struct FlightGuard {
    inner: Arc<CacheInner>,
    identity: PaywallIdentity,
    build_id: u64,
    armed: bool,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.inner.state.lock();
        if state
            .in_flight
            .get(&self.identity)
            .map_or(false, |f| f.build_id == self.build_id)
        {
            state.in_flight.remove(&self.identity);
            warn!(identity = %self.identity, "Unit build aborted");
        }
    }
}

#[derive(Clone)]
pub struct PaywallCache {
    inner: Arc<CacheInner>,
}

impl PaywallCache {
    pub fn new(
        renderer: Arc<dyn ContentRenderer>,
        config_store: Arc<dyn ConfigStore>,
        sink: Arc<dyn EventSink>,
        max_units: usize,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                renderer,
                config_store,
                sink,
                max_units: max_units.max(1),
                state: Mutex::new(CacheState::default()),
            }),
        }
    }

    /// Returns a prepared unit for `identity`, building it on a miss.
    pub async fn get(&self, identity: &PaywallIdentity) -> PaywallResult<Arc<PresentationUnit>> {
        let config = self.inner.config_store.current_config();
        let definition = config.paywall(&identity.identifier).cloned().ok_or_else(|| {
            PaywallError::Build(format!(
                "paywall {} is not in the campaign config",
                identity.identifier
            ))
        })?;
        let content_hash = definition.content_hash();

        let mut receiver = {
            let mut state = self.inner.state.lock();

            if let Some(unit) = state.units.get(identity).cloned() {
                if unit.is_valid() && unit.content_hash() == content_hash {
                    state.touch(identity);
                    metrics::counter!("paywall.cache.hit").increment(1);
                    debug!(identity = %identity, "Cache hit");
                    return Ok(unit);
                }
                info!(identity = %identity, "Cached unit is stale, rebuilding");
                state.discard(identity);
            }

            // A build started before an invalidation or from an older
            // definition only serves the requests that already joined it.
            let joinable = state
                .in_flight
                .get(identity)
                .filter(|flight| !flight.stale && flight.content_hash == content_hash)
                .map(|flight| flight.receiver.clone());

            match joinable {
                Some(receiver) => {
                    debug!(identity = %identity, "Joining in-flight build");
                    receiver
                }
                None => {
                    if state.in_flight.contains_key(identity) {
                        info!(identity = %identity, "In-flight build is stale, starting a fresh one");
                    }
                    metrics::counter!("paywall.cache.miss").increment(1);
                    state.next_build_id += 1;
                    let build_id = state.next_build_id;
                    let (sender, receiver) = watch::channel(None);
                    state.in_flight.insert(
                        identity.clone(),
                        InFlight {
                            build_id,
                            content_hash: content_hash.clone(),
                            receiver: receiver.clone(),
                            stale: false,
                        },
                    );

                    let inner = self.inner.clone();
                    let identity = identity.clone();
                    debug!(identity = %identity, build_id, "Starting unit build");
                    tokio::spawn(async move {
                        let mut guard = FlightGuard {
                            inner: inner.clone(),
                            identity: identity.clone(),
                            build_id,
                            armed: true,
                        };
                        let result = inner.renderer.build(&identity, &definition).await;
                        let outcome =
                            inner.complete_build(&identity, build_id, content_hash, result);
                        guard.armed = false;
                        let _ = sender.send(Some(outcome));
                        drop(sender);
                        inner.drain_retired().await;
                    });
                    receiver
                }
            }
        };

        self.inner.drain_retired().await;

        loop {
            if let Some(result) = receiver.borrow_and_update().clone() {
                return result.map_err(PaywallError::Build);
            }
            if receiver.changed().await.is_err() {
                return match receiver.borrow().clone() {
                    Some(result) => result.map_err(PaywallError::Build),
                    None => Err(PaywallError::Build(format!(
                        "build for {identity} was abandoned"
                    ))),
                };
            }
        }
    }

    /// Marks `unit` as presenting. Presenting units are exempt from eviction.
    pub fn checkout(&self, unit: &Arc<PresentationUnit>) -> PaywallResult<()> {
        let mut state = self.inner.state.lock();
        if unit.is_presenting() {
            return Err(PaywallError::Rejected(format!(
                "unit {} is already presenting",
                unit.identity()
            )));
        }
        unit.set_status(UnitStatus::Presenting);
        if state.units.contains_key(unit.identity()) {
            state.touch(unit.identity());
        }
        debug!(identity = %unit.identity(), "Unit checked out");
        Ok(())
    }

    /// Hands `unit` back after a presentation. A still-valid unit returns to
    /// `Ready` for reuse; anything else is torn down.
    pub async fn release(&self, unit: &Arc<PresentationUnit>) {
        {
            let mut state = self.inner.state.lock();
            if unit.is_presenting() {
                unit.set_status(UnitStatus::Dismissed);
            }
            let retained = state
                .units
                .get(unit.identity())
                .map_or(false, |u| Arc::ptr_eq(u, unit));

            if retained && unit.is_valid() {
                unit.set_status(UnitStatus::Ready);
                debug!(identity = %unit.identity(), "Unit returned for reuse");
            } else {
                if retained {
                    state.detach(unit.identity());
                }
                state.retired.push(unit.clone());
            }
            state.enforce_capacity(self.inner.max_units, None);
        }
        self.inner.drain_retired().await;
    }

    /// Drops the unit for `identity`. A presenting unit is torn down once it
    /// is released; an in-flight build is not retained when it completes.
    pub fn invalidate(&self, identity: &PaywallIdentity) -> bool {
        let discarded = {
            let mut state = self.inner.state.lock();
            if let Some(flight) = state.in_flight.get_mut(identity) {
                flight.stale = true;
            }
            state.discard(identity)
        };
        if discarded {
            info!(identity = %identity, "Unit invalidated");
            self.schedule_drain();
        }
        discarded
    }

    /// Drops every unit, e.g. when the user identity is reset.
    pub fn evict_all(&self) -> usize {
        let count = {
            let mut state = self.inner.state.lock();
            for flight in state.in_flight.values_mut() {
                flight.stale = true;
            }
            let identities: Vec<PaywallIdentity> = state.units.keys().cloned().collect();
            for identity in &identities {
                state.discard(identity);
            }
            identities.len()
        };
        info!(count, "Evicted all units");
        self.schedule_drain();
        count
    }

    /// Invalidates units whose paywall changed or disappeared in `config`.
    pub fn handle_config_changed(&self, config: &CampaignConfig) -> usize {
        let changed: Vec<PaywallIdentity> = {
            let state = self.inner.state.lock();
            let mut changed: Vec<PaywallIdentity> = state
                .units
                .iter()
                .filter(|(identity, unit)| {
                    config
                        .paywall(&identity.identifier)
                        .map_or(true, |p| p.content_hash() != unit.content_hash())
                })
                .map(|(identity, _)| identity.clone())
                .collect();
            // Builds started from the previous snapshot.
            changed.extend(
                state
                    .in_flight
                    .iter()
                    .filter(|(identity, flight)| {
                        config
                            .paywall(&identity.identifier)
                            .map_or(true, |p| p.content_hash() != flight.content_hash)
                    })
                    .map(|(identity, _)| identity.clone()),
            );
            changed
        };

        let mut count = 0;
        for identity in &changed {
            if self.invalidate(identity) {
                count += 1;
            }
        }
        if count > 0 {
            info!(count, "Config change invalidated units");
        }
        count
    }

    /// Flushes buffered telemetry of retained units and tears down retired
    /// ones. Call this periodically from a background task.
    pub async fn maintenance(&self) -> usize {
        let units: Vec<Arc<PresentationUnit>> =
            self.inner.state.lock().units.values().cloned().collect();
        let mut flushed = 0;
        for unit in units {
            for event in unit.drain_telemetry() {
                self.inner.sink.emit(event);
                flushed += 1;
            }
        }
        self.inner.drain_retired().await;
        if flushed > 0 {
            debug!(flushed, "Flushed unit telemetry");
        }
        flushed
    }

    pub fn status(&self, identity: &PaywallIdentity) -> Option<UnitStatus> {
        let state = self.inner.state.lock();
        match state.units.get(identity) {
            Some(unit) => Some(unit.status()),
            None if state.in_flight.contains_key(identity) => Some(UnitStatus::Building),
            None => None,
        }
    }

    pub fn contains(&self, identity: &PaywallIdentity) -> bool {
        self.inner.state.lock().units.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().units.is_empty()
    }

    fn schedule_drain(&self) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            handle.spawn(async move { inner.drain_retired().await });
        }
    }
}
