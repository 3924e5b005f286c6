//! Ordered, exactly-once-terminating result stream for one presentation
//! request.
//!
//! The producer side (`ResultSender`) is owned by the coordinator. Consumers
//! hold `ResultChannel` handles and observe the sequence either as a stream
//! or through a callback; the callback form is a task draining a stream.

use std::sync::Arc;

use paywall_core::types::{DismissalResult, PaywallInfo, PresentationEvent, SkipReason};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub type ResultStream = UnboundedReceiverStream<PresentationEvent>;

#[derive(Default)]
struct ChannelState {
    history: Vec<PresentationEvent>,
    finished: bool,
    subscribers: Vec<mpsc::UnboundedSender<PresentationEvent>>,
}

impl ChannelState {
    fn push(&mut self, event: PresentationEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
        if event.is_terminal() {
            self.finished = true;
            // Dropping the senders ends every subscriber stream.
            self.subscribers.clear();
        }
        self.history.push(event);
    }
}

/// Creates the producer and consumer halves for `request_id`.
pub fn result_channel(request_id: Uuid) -> (ResultSender, ResultChannel) {
    let state = Arc::new(Mutex::new(ChannelState::default()));
    (
        ResultSender {
            request_id,
            state: state.clone(),
        },
        ResultChannel { request_id, state },
    )
}

/// Single producer of a request's events. Dropping it before a terminal
/// event was sent emits `skipped(error)`, so a request never ends silently.
pub struct ResultSender {
    request_id: Uuid,
    state: Arc<Mutex<ChannelState>>,
}

impl ResultSender {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Emits `presented`. Ignored after a previous `presented` or after the
    /// terminal event.
    pub fn presented(&self, info: PaywallInfo) -> bool {
        let mut state = self.state.lock();
        let already_presented = state
            .history
            .iter()
            .any(|e| matches!(e, PresentationEvent::Presented { .. }));
        if state.finished || already_presented {
            warn!(request_id = %self.request_id, "Dropping out-of-order presented event");
            return false;
        }
        state.push(PresentationEvent::Presented { info });
        true
    }

    pub fn dismissed(&self, info: PaywallInfo, result: DismissalResult) -> bool {
        self.finish(PresentationEvent::Dismissed { info, result })
    }

    pub fn skipped(&self, reason: SkipReason) -> bool {
        self.finish(PresentationEvent::Skipped { reason })
    }

    fn finish(&self, event: PresentationEvent) -> bool {
        let mut state = self.state.lock();
        if state.finished {
            debug!(request_id = %self.request_id, "Channel already finished, dropping terminal event");
            return false;
        }
        debug!(request_id = %self.request_id, ?event, "Channel finished");
        state.push(event);
        true
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }
}

impl Drop for ResultSender {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if !state.finished {
            warn!(request_id = %self.request_id, "Presentation ended without a result");
            state.push(PresentationEvent::Skipped {
                reason: SkipReason::Error {
                    message: "presentation was abandoned".to_string(),
                },
            });
        }
    }
}

/// Consumer handle. Cheap to clone; every subscriber sees the full sequence
/// from the start, including events sent before it subscribed.
#[derive(Clone)]
pub struct ResultChannel {
    request_id: Uuid,
    state: Arc<Mutex<ChannelState>>,
}

impl ResultChannel {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn stream(&self) -> ResultStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        for event in &state.history {
            let _ = sender.send(event.clone());
        }
        if !state.finished {
            state.subscribers.push(sender);
        }
        UnboundedReceiverStream::new(receiver)
    }

    /// Invokes `callback` for every event, in order, on a background task.
    pub fn on_event<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(PresentationEvent) + Send + 'static,
    {
        let mut stream = self.stream();
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                callback(event);
            }
        })
    }

    /// Waits for the terminal event.
    pub async fn outcome(&self) -> PresentationEvent {
        let mut stream = self.stream();
        while let Some(event) = stream.next().await {
            if event.is_terminal() {
                return event;
            }
        }
        PresentationEvent::Skipped {
            reason: SkipReason::Error {
                message: "result channel closed".to_string(),
            },
        }
    }

    pub fn events(&self) -> Vec<PresentationEvent> {
        self.state.lock().history.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use paywall_core::types::{ExperimentRef, PresentationStyle};

    fn info() -> PaywallInfo {
        PaywallInfo {
            request_id: Uuid::new_v4(),
            paywall_id: "pw_123".into(),
            locale: "en_US".into(),
            event_name: "MyEvent".into(),
            experiment: ExperimentRef {
                id: "exp_1".into(),
                group_id: "grp_1".into(),
                variant_id: "a".into(),
            },
            presentation_style: PresentationStyle::Modal,
            products: vec![],
            presented_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_terminal_event_is_emitted_once() {
        let (sender, channel) = result_channel(Uuid::new_v4());
        assert!(sender.presented(info()));
        assert!(!sender.presented(info()));
        assert!(sender.dismissed(info(), DismissalResult::Closed));
        assert!(!sender.skipped(SkipReason::Cancelled));
        assert!(!sender.presented(info()));
        drop(sender);

        let events: Vec<PresentationEvent> = channel.stream().collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], PresentationEvent::Presented { .. }));
        assert!(matches!(
            events[1],
            PresentationEvent::Dismissed {
                result: DismissalResult::Closed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_dropped_sender_terminates_channel() {
        let (sender, channel) = result_channel(Uuid::new_v4());
        let outcome = tokio::spawn({
            let channel = channel.clone();
            async move { channel.outcome().await }
        });
        drop(sender);

        match outcome.await.unwrap() {
            PresentationEvent::Skipped {
                reason: SkipReason::Error { .. },
            } => {}
            other => panic!("Expected abandoned error, got {:?}", other),
        }
        assert!(channel.is_finished());
    }

    #[tokio::test]
    async fn test_stream_and_callback_see_the_same_sequence() {
        let (sender, channel) = result_channel(Uuid::new_v4());
        let live = channel.stream();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let callback = channel.on_event({
            let seen = seen.clone();
            move |event| seen.lock().push(event)
        });

        sender.presented(info());
        sender.skipped(SkipReason::Cancelled);

        let streamed: Vec<PresentationEvent> = live.collect().await;
        callback.await.unwrap();
        assert_eq!(streamed, *seen.lock());

        // A late subscriber replays the history and ends.
        let late: Vec<PresentationEvent> = channel.stream().collect().await;
        assert_eq!(late, streamed);
        assert_eq!(channel.events(), streamed);
    }
}
