use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use paywall_core::{PaywallError, PaywallResult};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Loading state of the surface that is currently presenting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadingState {
    Unknown,
    LoadingUrl,
    Ready,
    ManualLoading,
    LoadingPurchase,
    Dismissing,
}

/// Recovery controls shown to the user when content is slow to load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affordances {
    pub refresh_visible: bool,
    pub exit_visible: bool,
}

/// Describes a single valid state transition for a presenting surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: LoadingState,
    pub to: LoadingState,
    pub trigger: String,
}

fn transition_table() -> Vec<StateTransition> {
    use LoadingState::*;

    let mut transitions: Vec<StateTransition> = [
        (Unknown, LoadingUrl, "load_started"),
        // A new load re-arms the watchdog.
        (LoadingUrl, LoadingUrl, "load_restarted"),
        (LoadingUrl, Ready, "content_loaded"),
        (LoadingUrl, ManualLoading, "refresh"),
        (Ready, LoadingUrl, "load_started"),
        (Ready, ManualLoading, "refresh"),
        (Ready, LoadingPurchase, "purchase_started"),
        (ManualLoading, LoadingUrl, "load_started"),
        (ManualLoading, Ready, "content_loaded"),
        (LoadingPurchase, Ready, "purchase_finished"),
    ]
    .into_iter()
    .map(|(from, to, trigger)| StateTransition {
        from,
        to,
        trigger: trigger.to_string(),
    })
    .collect();

    // Dismissal is accepted from every state.
    for from in [Unknown, LoadingUrl, Ready, ManualLoading, LoadingPurchase] {
        transitions.push(StateTransition {
            from,
            to: Dismissing,
            trigger: "dismiss".to_string(),
        });
    }
    transitions
}

type TimeoutHook = Box<dyn Fn() + Send + Sync>;

struct MachineState {
    current: LoadingState,
    watchdog: Option<JoinHandle<()>>,
    /// Bumped whenever the watchdog is cancelled or re-armed. A watchdog only
    /// acts if its generation is still current.
    generation: u64,
}

struct MachineInner {
    state: Mutex<MachineState>,
    transitions: Vec<StateTransition>,
    affordances: watch::Sender<Affordances>,
    watchdog_timeout: Duration,
    on_timeout: Option<TimeoutHook>,
}

/// Tracks the loading state of one presentation and runs the load watchdog.
///
/// Entering `LoadingUrl` arms a timer; if content has not loaded when it
/// fires, the refresh and exit affordances become visible. Every exit from
/// `LoadingUrl` cancels the timer, and `Dismissing` is terminal.
#[derive(Clone)]
pub struct PresentationStateMachine {
    inner: Arc<MachineInner>,
}

impl PresentationStateMachine {
    pub fn new(watchdog_timeout: Duration) -> Self {
        Self::build(watchdog_timeout, None)
    }

    /// Like `new`, calling `hook` each time the watchdog fires.
    pub fn with_timeout_hook<F>(watchdog_timeout: Duration, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::build(watchdog_timeout, Some(Box::new(hook)))
    }

    fn build(watchdog_timeout: Duration, on_timeout: Option<TimeoutHook>) -> Self {
        let (affordances, _) = watch::channel(Affordances::default());
        Self {
            inner: Arc::new(MachineInner {
                state: Mutex::new(MachineState {
                    current: LoadingState::Unknown,
                    watchdog: None,
                    generation: 0,
                }),
                transitions: transition_table(),
                affordances,
                watchdog_timeout,
                on_timeout,
            }),
        }
    }

    pub fn state(&self) -> LoadingState {
        self.inner.state.lock().current
    }

    pub fn affordances(&self) -> Affordances {
        *self.inner.affordances.borrow()
    }

    pub fn subscribe_affordances(&self) -> watch::Receiver<Affordances> {
        self.inner.affordances.subscribe()
    }

    pub fn is_watchdog_armed(&self) -> bool {
        self.inner
            .state
            .lock()
            .watchdog
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(&self, from: LoadingState, to: LoadingState) -> bool {
        self.inner
            .transitions
            .iter()
            .any(|t| t.from == from && t.to == to)
    }

    /// Attempts to move the machine to `to`. Returns an error if the
    /// transition is not permitted.
    pub fn transition(&self, to: LoadingState) -> PaywallResult<()> {
        let mut state = self.inner.state.lock();
        let from = state.current;

        if from == LoadingState::Dismissing && to == LoadingState::Dismissing {
            return Ok(());
        }
        if !self.can_transition(from, to) {
            return Err(PaywallError::InvalidTransition {
                from: format!("{from:?}"),
                to: format!("{to:?}"),
            });
        }

        cancel_watchdog(&mut state);
        state.current = to;
        debug!(?from, ?to, "Loading state changed");

        match to {
            LoadingState::LoadingUrl => self.arm_watchdog(&mut state),
            LoadingState::Ready | LoadingState::Dismissing => {
                self.inner.affordances.send_replace(Affordances::default());
            }
            _ => {}
        }
        Ok(())
    }

    pub fn begin_loading(&self) -> PaywallResult<()> {
        self.transition(LoadingState::LoadingUrl)
    }

    pub fn mark_ready(&self) -> PaywallResult<()> {
        self.transition(LoadingState::Ready)
    }

    pub fn begin_manual_reload(&self) -> PaywallResult<()> {
        self.transition(LoadingState::ManualLoading)
    }

    pub fn begin_purchase(&self) -> PaywallResult<()> {
        self.transition(LoadingState::LoadingPurchase)
    }

    pub fn finish_purchase(&self) -> PaywallResult<()> {
        self.transition(LoadingState::Ready)
    }

    /// Moves to `Dismissing`, cancelling the watchdog. Idempotent.
    pub fn dismiss(&self) {
        if let Err(e) = self.transition(LoadingState::Dismissing) {
            warn!(error = %e, "Dismiss rejected");
        }
    }

    fn arm_watchdog(&self, state: &mut MachineState) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available, load watchdog not armed");
            return;
        };

        let generation = state.generation;
        let timeout = self.inner.watchdog_timeout;
        let inner = Arc::downgrade(&self.inner);
        state.watchdog = Some(handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = inner.upgrade() {
                watchdog_fired(&inner, generation);
            }
        }));
    }
}

fn cancel_watchdog(state: &mut MachineState) {
    state.generation = state.generation.wrapping_add(1);
    if let Some(handle) = state.watchdog.take() {
        handle.abort();
    }
}

fn watchdog_fired(inner: &MachineInner, generation: u64) {
    {
        let mut state = inner.state.lock();
        if state.generation != generation || state.current != LoadingState::LoadingUrl {
            return;
        }
        state.watchdog = None;
    }

    warn!(
        timeout_ms = inner.watchdog_timeout.as_millis() as u64,
        "Paywall content did not load in time"
    );
    inner.affordances.send_replace(Affordances {
        refresh_visible: true,
        exit_visible: true,
    });
    if let Some(hook) = &inner.on_timeout {
        hook();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TIMEOUT: Duration = Duration::from_millis(5000);

    fn counting_machine() -> (PresentationStateMachine, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let machine = PresentationStateMachine::with_timeout_hook(TIMEOUT, {
            let fired = fired.clone();
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });
        (machine, fired)
    }

    #[test]
    fn test_transition_table() {
        let machine = PresentationStateMachine::new(TIMEOUT);
        assert!(machine.can_transition(LoadingState::Unknown, LoadingState::LoadingUrl));
        assert!(machine.can_transition(LoadingState::Ready, LoadingState::LoadingPurchase));
        assert!(!machine.can_transition(LoadingState::LoadingUrl, LoadingState::LoadingPurchase));
        assert!(!machine.can_transition(LoadingState::Dismissing, LoadingState::Ready));
        for from in [
            LoadingState::Unknown,
            LoadingState::LoadingUrl,
            LoadingState::Ready,
            LoadingState::ManualLoading,
            LoadingState::LoadingPurchase,
        ] {
            assert!(machine.can_transition(from, LoadingState::Dismissing));
        }
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let machine = PresentationStateMachine::new(TIMEOUT);
        let err = machine.begin_purchase().unwrap_err();
        assert!(matches!(err, PaywallError::InvalidTransition { .. }));
        assert_eq!(machine.state(), LoadingState::Unknown);
    }

    #[test]
    fn test_dismissing_is_terminal() {
        let machine = PresentationStateMachine::new(TIMEOUT);
        machine.dismiss();
        machine.dismiss();
        assert_eq!(machine.state(), LoadingState::Dismissing);
        assert!(machine.mark_ready().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_shows_affordances_after_timeout() {
        let (machine, fired) = counting_machine();
        let mut affordances = machine.subscribe_affordances();

        machine.begin_loading().unwrap();
        assert!(machine.is_watchdog_armed());

        tokio::time::sleep(TIMEOUT - Duration::from_millis(1)).await;
        assert_eq!(machine.affordances(), Affordances::default());

        tokio::time::sleep(Duration::from_millis(2)).await;
        affordances.changed().await.unwrap();
        assert_eq!(
            *affordances.borrow(),
            Affordances {
                refresh_visible: true,
                exit_visible: true
            }
        );
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(machine.state(), LoadingState::LoadingUrl);

        // Content arriving late hides the affordances again.
        machine.mark_ready().unwrap();
        assert_eq!(machine.affordances(), Affordances::default());
        assert!(!machine.is_watchdog_armed());

        tokio::time::sleep(TIMEOUT * 2).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(machine.affordances(), Affordances::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_before_timeout_cancels_watchdog() {
        let (machine, fired) = counting_machine();
        machine.begin_loading().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        machine.mark_ready().unwrap();
        assert!(!machine.is_watchdog_armed());

        tokio::time::sleep(TIMEOUT * 2).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(machine.affordances(), Affordances::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dismiss_cancels_watchdog() {
        let (machine, fired) = counting_machine();
        machine.begin_loading().unwrap();
        machine.dismiss();

        tokio::time::sleep(TIMEOUT * 2).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_rearms_watchdog() {
        let (machine, fired) = counting_machine();
        machine.begin_loading().unwrap();
        tokio::time::sleep(TIMEOUT / 2).await;

        machine.begin_loading().unwrap();
        tokio::time::sleep(TIMEOUT / 2 + Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(TIMEOUT).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_purchase_cycle() {
        let machine = PresentationStateMachine::new(TIMEOUT);
        machine.begin_loading().unwrap();
        machine.mark_ready().unwrap();
        machine.begin_purchase().unwrap();
        assert_eq!(machine.state(), LoadingState::LoadingPurchase);
        machine.finish_purchase().unwrap();
        assert_eq!(machine.state(), LoadingState::Ready);
    }
}
