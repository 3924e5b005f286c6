//! Presentation coordinator: owns the single presentation slot and runs the
//! track → evaluate → resolve → present → dismiss pipeline.
//!
//! Every tracked event gets a `ResultChannel` that terminates exactly once.
//! The teardown sequence after a presentation is fixed: stop the loading
//! state machine, hide the surface, hand the unit back to the cache, free
//! the slot, then deliver the terminal event.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use paywall_cache::{PaywallCache, PresentationUnit};
use paywall_core::collaborators::{
    AssignmentStore, ConfigStore, ContentRenderer, PurchaseExecutor, PurchaseOutcome,
    SubscriptionOracle,
};
use paywall_core::event_bus::{make_event, EventSink, PaywallEvent, PaywallEventKind};
use paywall_core::types::{
    CampaignConfig, DismissalResult, Event, Outcome, Parameters, PaywallIdentity, PaywallInfo,
    SkipReason, UserContext,
};
use paywall_core::{AppConfig, PaywallError, PaywallResult};
use paywall_triggers::{ExperimentAssigner, TriggerEvaluator};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{result_channel, ResultChannel, ResultSender};
use crate::request::{PaywallAction, PaywallOverrides};
use crate::state_machine::{LoadingState, PresentationStateMachine};

/// Collaborators the coordinator is wired to.
pub struct Dependencies {
    pub config_store: Arc<dyn ConfigStore>,
    pub renderer: Arc<dyn ContentRenderer>,
    pub subscriptions: Arc<dyn SubscriptionOracle>,
    pub purchases: Arc<dyn PurchaseExecutor>,
    pub assignments: Arc<dyn AssignmentStore>,
    pub sink: Arc<dyn EventSink>,
}

/// Occupancy of the process-wide presentation slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Idle,
    Evaluating,
    Resolving,
    Presenting,
    Dismissing,
}

struct ActivePresentation {
    request_id: Uuid,
    dismiss_tx: Option<oneshot::Sender<DismissalResult>>,
    machine: Option<PresentationStateMachine>,
    unit: Option<Arc<PresentationUnit>>,
    info: Option<PaywallInfo>,
}

struct Slot {
    state: SlotState,
    active: Option<ActivePresentation>,
}

struct PresentationRequest {
    request_id: Uuid,
    event: Event,
    overrides: PaywallOverrides,
    sender: ResultSender,
}

struct CoordinatorInner {
    config_store: Arc<dyn ConfigStore>,
    evaluator: TriggerEvaluator,
    cache: PaywallCache,
    renderer: Arc<dyn ContentRenderer>,
    subscriptions: Arc<dyn SubscriptionOracle>,
    purchases: Arc<dyn PurchaseExecutor>,
    sink: Arc<dyn EventSink>,
    settings: AppConfig,
    user: RwLock<UserContext>,
    slot: Mutex<Slot>,
}

#[derive(Clone)]
pub struct PresentationCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl PresentationCoordinator {
    pub fn new(deps: Dependencies, settings: AppConfig) -> Self {
        let assigner = Arc::new(ExperimentAssigner::new(deps.assignments.clone()));
        Self::with_assigner(deps, assigner, settings)
    }

    /// Uses a caller-provided assigner, e.g. a seeded one for simulations.
    pub fn with_assigner(
        deps: Dependencies,
        assigner: Arc<ExperimentAssigner>,
        settings: AppConfig,
    ) -> Self {
        let cache = PaywallCache::new(
            deps.renderer.clone(),
            deps.config_store.clone(),
            deps.sink.clone(),
            settings.cache.max_units,
        );

        let inner = Arc::new(CoordinatorInner {
            config_store: deps.config_store,
            evaluator: TriggerEvaluator::new(assigner),
            cache,
            renderer: deps.renderer,
            subscriptions: deps.subscriptions,
            purchases: deps.purchases,
            sink: deps.sink,
            settings,
            user: RwLock::new(UserContext::anonymous()),
            slot: Mutex::new(Slot {
                state: SlotState::Idle,
                active: None,
            }),
        });

        let weak: Weak<CoordinatorInner> = Arc::downgrade(&inner);
        inner
            .config_store
            .on_config_changed(Box::new(move |config: &Arc<CampaignConfig>| {
                if let Some(inner) = weak.upgrade() {
                    let invalidated = inner.cache.handle_config_changed(config);
                    info!(invalidated, "Campaign config changed");
                }
            }));

        Self { inner }
    }

    /// Tracks `event_name` and returns the channel its presentation result
    /// is delivered on. Never blocks; the pipeline runs on a spawned task.
    pub fn track(
        &self,
        event_name: impl Into<String>,
        parameters: Parameters,
        overrides: PaywallOverrides,
    ) -> ResultChannel {
        let event_name = event_name.into();
        let request_id = Uuid::new_v4();
        let (sender, channel) = result_channel(request_id);

        if self
            .inner
            .settings
            .events
            .reserved_names
            .iter()
            .any(|name| *name == event_name)
        {
            warn!(event = %event_name, "Refusing to track reserved event name");
            sender.skipped(SkipReason::Error {
                message: format!("event name {event_name} is reserved"),
            });
            return channel;
        }

        let (dismiss_tx, dismiss_rx) = oneshot::channel();
        {
            let mut slot = self.inner.slot.lock();
            if slot.state != SlotState::Idle {
                let busy_state = slot.state;
                drop(slot);
                metrics::counter!("paywall.presentation.rejected").increment(1);
                info!(
                    request_id = %request_id,
                    event = %event_name,
                    slot = ?busy_state,
                    "Presentation slot occupied, rejecting request"
                );
                sender.skipped(SkipReason::Busy);
                return channel;
            }
            slot.state = SlotState::Evaluating;
            slot.active = Some(ActivePresentation {
                request_id,
                dismiss_tx: Some(dismiss_tx),
                machine: None,
                unit: None,
                info: None,
            });
        }

        let event = Event::new(event_name, parameters)
            .sanitized(&self.inner.settings.events.reserved_prefix);
        debug!(request_id = %request_id, event = %event.name, "Event tracked");

        let request = PresentationRequest {
            request_id,
            event,
            overrides,
            sender,
        };
        tokio::spawn(self.inner.clone().run(request, dismiss_rx));
        channel
    }

    /// Applies an action reported by the paywall currently on screen.
    pub async fn handle_action(&self, action: PaywallAction) -> PaywallResult<()> {
        let (machine, unit, info) = self.inner.presenting()?;
        debug!(action = action.name(), paywall_id = %info.paywall_id, "Paywall action");

        match action {
            PaywallAction::ContentLoadStarted => machine.begin_loading(),
            PaywallAction::ContentLoaded => {
                unit.mark_content_loaded();
                machine.mark_ready()
            }
            PaywallAction::Refresh => machine.begin_manual_reload(),
            PaywallAction::Close => {
                if machine.state() == LoadingState::LoadingPurchase {
                    return Err(PaywallError::Rejected(
                        "close is unavailable while a transaction is in progress".to_string(),
                    ));
                }
                self.inner.request_dismiss(DismissalResult::Closed);
                Ok(())
            }
            PaywallAction::Exit => {
                self.inner.request_dismiss(DismissalResult::Closed);
                Ok(())
            }
            PaywallAction::DeepLink { url } => {
                unit.record(
                    self.inner
                        .paywall_event(PaywallEventKind::DeepLink, &info)
                        .with_detail(url),
                );
                self.inner.request_dismiss(DismissalResult::Closed);
                Ok(())
            }
            PaywallAction::Purchase { product_id } => {
                self.inner.purchase(&machine, &unit, &info, product_id).await
            }
            PaywallAction::Restore => self.inner.restore(&machine, &unit, &info).await,
        }
    }

    /// Requests dismissal of the active presentation. Before anything was
    /// shown this cancels the request. Returns false if nothing was active
    /// or a dismissal was already requested.
    pub fn dismiss_active(&self) -> bool {
        self.inner.request_dismiss(DismissalResult::Closed)
    }

    pub fn slot_state(&self) -> SlotState {
        self.inner.slot.lock().state
    }

    pub fn active_request(&self) -> Option<Uuid> {
        self.inner.slot.lock().active.as_ref().map(|a| a.request_id)
    }

    pub fn active_state_machine(&self) -> Option<PresentationStateMachine> {
        self.inner
            .slot
            .lock()
            .active
            .as_ref()
            .and_then(|a| a.machine.clone())
    }

    pub fn identify(&self, user_id: impl Into<String>) {
        let user_id = user_id.into();
        let mut user = self.inner.user.write();
        if user.user_id != user_id {
            info!(user_id = %user_id, "User identified");
            user.user_id = user_id;
        }
    }

    /// Merges `traits` into the current user's traits.
    pub fn set_user_traits(&self, traits: Parameters) {
        self.inner.user.write().traits.extend(traits);
    }

    /// Starts a new anonymous user and drops every cached unit.
    pub fn reset(&self) -> usize {
        *self.inner.user.write() = UserContext::anonymous();
        let evicted = self.inner.cache.evict_all();
        info!(evicted, "User reset");
        evicted
    }

    pub fn user(&self) -> UserContext {
        self.inner.user.read().clone()
    }

    pub fn cache(&self) -> &PaywallCache {
        &self.inner.cache
    }

    /// Flushes buffered telemetry and tears down retired units.
    pub async fn maintenance(&self) -> usize {
        self.inner.cache.maintenance().await
    }

    /// Dismisses whatever is active and releases every cached unit.
    pub async fn shutdown(&self) -> usize {
        self.dismiss_active();
        let evicted = self.inner.cache.evict_all();
        self.inner.cache.maintenance().await;
        info!(evicted, "Presentation coordinator shut down");
        evicted
    }
}

impl CoordinatorInner {
    async fn run(
        self: Arc<Self>,
        request: PresentationRequest,
        mut dismiss_rx: oneshot::Receiver<DismissalResult>,
    ) {
        let PresentationRequest {
            request_id,
            event,
            overrides,
            sender,
        } = request;
        let _guard = SlotGuard {
            inner: self.clone(),
            request_id,
        };
        let user = self.user.read().clone();

        let evaluation = {
            let evaluator = self.evaluator.clone();
            let config = self.config_store.current_config();
            let event = event.clone();
            let user = user.clone();
            tokio::task::spawn_blocking(move || evaluator.evaluate(&event, &config, &user))
        };
        let outcome = tokio::select! {
            joined = evaluation => joined.unwrap_or_else(|e| Outcome::Error {
                reason: format!("evaluation task failed: {e}"),
            }),
            _ = &mut dismiss_rx => return self.skip(request_id, sender, SkipReason::Cancelled),
        };

        let mut fire = make_event(
            PaywallEventKind::TriggerFire,
            Some(user.user_id.clone()),
            None,
        )
        .with_detail(outcome.label());
        if let Outcome::Paywall {
            experiment,
            paywall_id,
        } = &outcome
        {
            fire.paywall_id = Some(paywall_id.clone());
            fire = fire.with_experiment(experiment.id.clone());
        }
        self.sink.emit(fire);

        let (experiment, paywall_id) = match outcome {
            Outcome::Paywall {
                experiment,
                paywall_id,
            } => (experiment, paywall_id),
            other => return self.skip(request_id, sender, skip_reason(other)),
        };

        if !overrides.ignore_subscription_status {
            let subscribed = tokio::select! {
                subscribed = self.subscriptions.is_subscribed() => subscribed,
                _ = &mut dismiss_rx => return self.skip(request_id, sender, SkipReason::Cancelled),
            };
            if subscribed {
                return self.skip(request_id, sender, SkipReason::UserIsSubscribed);
            }
        }

        self.set_state(request_id, SlotState::Resolving);
        let locale = overrides
            .locale
            .clone()
            .unwrap_or_else(|| self.settings.presentation.default_locale.clone());
        let identity = PaywallIdentity::new(paywall_id.clone(), locale);

        let unit = tokio::select! {
            result = self.cache.get(&identity) => match result {
                Ok(unit) => unit,
                Err(e) => {
                    warn!(request_id = %request_id, identity = %identity, error = %e, "Failed to prepare paywall");
                    return self.skip(request_id, sender, SkipReason::Error { message: e.to_string() });
                }
            },
            _ = &mut dismiss_rx => return self.skip(request_id, sender, SkipReason::Cancelled),
        };
        if !matches!(
            dismiss_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ) {
            return self.skip(request_id, sender, SkipReason::Cancelled);
        }

        let config = self.config_store.current_config();
        let Some(definition) = config.paywall(&paywall_id) else {
            return self.skip(
                request_id,
                sender,
                SkipReason::Error {
                    message: format!("paywall {paywall_id} was removed from the campaign config"),
                },
            );
        };
        if let Err(e) = self.cache.checkout(&unit) {
            return self.skip(request_id, sender, SkipReason::Error { message: e.to_string() });
        }

        let info = PaywallInfo {
            request_id,
            paywall_id,
            locale: identity.locale.clone(),
            event_name: event.name.clone(),
            experiment,
            presentation_style: overrides
                .presentation_style
                .unwrap_or(definition.presentation_style),
            products: overrides
                .products
                .clone()
                .unwrap_or_else(|| definition.products.clone()),
            presented_at: Utc::now(),
        };
        let machine = self.state_machine_for(&unit, &info);
        self.attach(request_id, &machine, &unit, &info);

        if let Err(e) = self
            .renderer
            .show(unit.rendered(), info.presentation_style)
            .await
        {
            warn!(request_id = %request_id, identity = %identity, error = %e, "Failed to show paywall");
            self.teardown(request_id, &machine, &unit, false).await;
            sender.skipped(SkipReason::Error {
                message: e.to_string(),
            });
            return;
        }

        let loading = if unit.is_content_loaded() {
            machine.begin_loading().and_then(|_| machine.mark_ready())
        } else {
            machine.begin_loading()
        };
        if let Err(e) = loading {
            warn!(request_id = %request_id, error = %e, "Unexpected loading state");
        }

        unit.record(self.paywall_event(PaywallEventKind::PaywallOpen, &info));
        sender.presented(info.clone());
        info!(
            request_id = %request_id,
            paywall_id = %info.paywall_id,
            locale = %info.locale,
            experiment_id = %info.experiment.id,
            "Paywall presented"
        );

        let result = (&mut dismiss_rx).await.unwrap_or(DismissalResult::Closed);

        unit.record(
            self.paywall_event(PaywallEventKind::PaywallClose, &info)
                .with_detail(dismissal_label(&result)),
        );
        if result == DismissalResult::Closed {
            unit.record(self.paywall_event(PaywallEventKind::PaywallDecline, &info));
        }
        self.teardown(request_id, &machine, &unit, true).await;

        info!(
            request_id = %request_id,
            paywall_id = %info.paywall_id,
            result = dismissal_label(&result),
            "Paywall dismissed"
        );
        sender.dismissed(info, result);
    }

    /// Frees the slot and terminates the request without a presentation.
    fn skip(&self, request_id: Uuid, sender: ResultSender, reason: SkipReason) {
        self.vacate(request_id);
        info!(request_id = %request_id, reason = %reason, "Presentation skipped");
        sender.skipped(reason);
    }

    async fn teardown(
        &self,
        request_id: Uuid,
        machine: &PresentationStateMachine,
        unit: &Arc<PresentationUnit>,
        shown: bool,
    ) {
        self.set_state(request_id, SlotState::Dismissing);
        machine.dismiss();
        if shown {
            self.renderer.hide(unit.rendered()).await;
        }
        self.cache.release(unit).await;
        self.vacate(request_id);
    }

    fn state_machine_for(
        &self,
        unit: &Arc<PresentationUnit>,
        info: &PaywallInfo,
    ) -> PresentationStateMachine {
        let timeout = Duration::from_millis(self.settings.presentation.watchdog_timeout_ms);
        let timeout_event = self
            .paywall_event(PaywallEventKind::LoadTimeout, info)
            .with_detail(format!("{}ms", timeout.as_millis()));
        let unit = Arc::downgrade(unit);
        PresentationStateMachine::with_timeout_hook(timeout, move || {
            if let Some(unit) = unit.upgrade() {
                let mut event = timeout_event.clone();
                event.event_id = Uuid::new_v4();
                event.timestamp = Utc::now();
                unit.record(event);
            }
        })
    }

    fn attach(
        &self,
        request_id: Uuid,
        machine: &PresentationStateMachine,
        unit: &Arc<PresentationUnit>,
        info: &PaywallInfo,
    ) {
        let mut slot = self.slot.lock();
        let Some(active) = slot.active.as_mut().filter(|a| a.request_id == request_id) else {
            return;
        };
        active.machine = Some(machine.clone());
        active.unit = Some(unit.clone());
        active.info = Some(info.clone());
        if slot.state != SlotState::Dismissing {
            slot.state = SlotState::Presenting;
        }
    }

    fn set_state(&self, request_id: Uuid, state: SlotState) {
        let mut slot = self.slot.lock();
        if slot.active.as_ref().map(|a| a.request_id) == Some(request_id) {
            slot.state = state;
        }
    }

    fn vacate(&self, request_id: Uuid) -> Option<ActivePresentation> {
        let mut slot = self.slot.lock();
        if slot.active.as_ref().map(|a| a.request_id) != Some(request_id) {
            return None;
        }
        slot.state = SlotState::Idle;
        slot.active.take()
    }

    fn request_dismiss(&self, result: DismissalResult) -> bool {
        let mut slot = self.slot.lock();
        let Some(dismiss_tx) = slot.active.as_mut().and_then(|a| a.dismiss_tx.take()) else {
            return false;
        };
        if slot.state == SlotState::Presenting {
            slot.state = SlotState::Dismissing;
        }
        drop(slot);
        debug!(result = dismissal_label(&result), "Dismissal requested");
        dismiss_tx.send(result).is_ok()
    }

    fn presenting(
        &self,
    ) -> PaywallResult<(PresentationStateMachine, Arc<PresentationUnit>, PaywallInfo)> {
        let slot = self.slot.lock();
        let active = slot
            .active
            .as_ref()
            .filter(|_| slot.state == SlotState::Presenting);
        match active.map(|a| (a.machine.clone(), a.unit.clone(), a.info.clone())) {
            Some((Some(machine), Some(unit), Some(info))) => Ok((machine, unit, info)),
            _ => Err(PaywallError::Rejected(
                "no paywall is presenting".to_string(),
            )),
        }
    }

    async fn purchase(
        &self,
        machine: &PresentationStateMachine,
        unit: &PresentationUnit,
        info: &PaywallInfo,
        product_id: String,
    ) -> PaywallResult<()> {
        if !info.products.contains(&product_id) {
            return Err(PaywallError::Rejected(format!(
                "product {product_id} is not offered by paywall {}",
                info.paywall_id
            )));
        }
        machine.begin_purchase()?;
        unit.record(
            self.paywall_event(PaywallEventKind::TransactionStart, info)
                .with_detail(product_id.clone()),
        );

        let outcome = self.purchases.purchase(&product_id).await;
        if let Err(e) = machine.finish_purchase() {
            debug!(error = %e, "Presentation ended during transaction");
        }

        match outcome {
            PurchaseOutcome::Purchased => {
                unit.record(
                    self.paywall_event(PaywallEventKind::TransactionComplete, info)
                        .with_detail(product_id.clone()),
                );
                info!(paywall_id = %info.paywall_id, product_id = %product_id, "Purchase completed");
                self.request_dismiss(DismissalResult::Purchased { product_id });
                Ok(())
            }
            PurchaseOutcome::Cancelled | PurchaseOutcome::Pending => {
                info!(paywall_id = %info.paywall_id, product_id = %product_id, outcome = ?outcome, "Purchase not completed");
                Ok(())
            }
            PurchaseOutcome::Failed(message) => {
                unit.record(
                    self.paywall_event(PaywallEventKind::TransactionFail, info)
                        .with_detail(message.clone()),
                );
                warn!(paywall_id = %info.paywall_id, product_id = %product_id, error = %message, "Purchase failed");
                Err(PaywallError::Purchase(message))
            }
        }
    }

    async fn restore(
        &self,
        machine: &PresentationStateMachine,
        unit: &PresentationUnit,
        info: &PaywallInfo,
    ) -> PaywallResult<()> {
        machine.begin_purchase()?;
        let restored = self.purchases.restore().await;
        if let Err(e) = machine.finish_purchase() {
            debug!(error = %e, "Presentation ended during restore");
        }

        if restored {
            unit.record(self.paywall_event(PaywallEventKind::TransactionRestore, info));
            info!(paywall_id = %info.paywall_id, "Purchases restored");
            self.request_dismiss(DismissalResult::Restored);
        } else {
            info!(paywall_id = %info.paywall_id, "Nothing to restore");
        }
        Ok(())
    }

    fn paywall_event(&self, kind: PaywallEventKind, info: &PaywallInfo) -> PaywallEvent {
        make_event(
            kind,
            Some(self.user.read().user_id.clone()),
            Some(info.paywall_id.clone()),
        )
        .with_experiment(info.experiment.id.clone())
    }
}

/// Frees the slot if the pipeline task ends without running its teardown,
/// e.g. on panic.
struct SlotGuard {
    inner: Arc<CoordinatorInner>,
    request_id: Uuid,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let Some(active) = self.inner.vacate(self.request_id) else {
            return;
        };
        warn!(request_id = %self.request_id, "Presentation pipeline exited without teardown");
        if let Some(machine) = &active.machine {
            machine.dismiss();
        }
        if let (Some(unit), Ok(handle)) = (active.unit, tokio::runtime::Handle::try_current()) {
            let cache = self.inner.cache.clone();
            handle.spawn(async move { cache.release(&unit).await });
        }
    }
}

fn skip_reason(outcome: Outcome) -> SkipReason {
    match outcome {
        Outcome::TriggerNotFound => SkipReason::TriggerNotFound,
        Outcome::NoMatch => SkipReason::NoRuleMatch,
        Outcome::Holdout { experiment } => SkipReason::Holdout { experiment },
        Outcome::Error { reason } => SkipReason::Error { message: reason },
        Outcome::Paywall { paywall_id, .. } => SkipReason::Error {
            message: format!("paywall {paywall_id} was not presented"),
        },
    }
}

fn dismissal_label(result: &DismissalResult) -> &'static str {
    match result {
        DismissalResult::Closed => "closed",
        DismissalResult::Purchased { .. } => "purchased",
        DismissalResult::Restored => "restored",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcomes_map_to_skip_reasons() {
        assert_eq!(skip_reason(Outcome::NoMatch), SkipReason::NoRuleMatch);
        assert_eq!(
            skip_reason(Outcome::TriggerNotFound),
            SkipReason::TriggerNotFound
        );
        assert_eq!(
            skip_reason(Outcome::Error {
                reason: "bad rule".into()
            })
            .to_string(),
            "error(bad rule)"
        );
    }

    #[test]
    fn test_dismissal_labels() {
        assert_eq!(dismissal_label(&DismissalResult::Closed), "closed");
        assert_eq!(
            dismissal_label(&DismissalResult::Purchased {
                product_id: "monthly".into()
            }),
            "purchased"
        );
        assert_eq!(
            serde_json::to_value(SlotState::Presenting).unwrap(),
            json!("presenting")
        );
    }
}
