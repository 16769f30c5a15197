//! Debounced notifications of server-side queue state.
//!
//! Every future that receives a `TryAgain` reply reports the queue state it saw.
//! The observer collapses those reports so a sink hears about a paused queue
//! once per debounce window, however many futures are waiting on it.

use gradwire_abstraction::QueueState;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Default suppression window for repeated notifications of the same state.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_secs(60);

/// A structured backpressure notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStateNotification {
    /// The queue state being reported.
    pub state: QueueState,
    /// Why requests are waiting.
    pub reason: String,
}

/// Receiver of backpressure notifications.
pub trait QueueStateSink: Send + Sync {
    fn notify(&self, notification: &QueueStateNotification);
}

/// Logs notifications as warnings.
#[derive(Debug, Default)]
pub struct TracingSink;

impl QueueStateSink for TracingSink {
    fn notify(&self, notification: &QueueStateNotification) {
        warn!(
            queue_state = %notification.state,
            reason = %notification.reason,
            "Training requests are paused by the server"
        );
    }
}

/// Discards notifications.
#[derive(Debug, Default)]
pub struct NoopSink;

impl QueueStateSink for NoopSink {
    fn notify(&self, _notification: &QueueStateNotification) {}
}

#[derive(Debug, Default)]
struct DebounceState {
    last_notified_state: Option<QueueState>,
    last_notified_at: Option<Instant>,
}

/// Per-client queue state observer.
///
/// Owned by one client instance; two clients never suppress each other's notifications.
pub struct QueueStateObserver {
    sink: Arc<dyn QueueStateSink>,
    debounce_window: Duration,
    state: Mutex<DebounceState>,
}

impl QueueStateObserver {
    /// Creates an observer that forwards to `sink` with the default window.
    pub fn new(sink: Arc<dyn QueueStateSink>) -> Self {
        Self {
            sink,
            debounce_window: DEFAULT_DEBOUNCE_WINDOW,
            state: Mutex::new(DebounceState::default()),
        }
    }

    /// An observer that logs through `tracing`.
    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingSink))
    }

    /// An observer that drops every notification.
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopSink))
    }

    /// Sets the debounce window.
    #[must_use]
    pub fn with_debounce_window(mut self, debounce_window: Duration) -> Self {
        self.debounce_window = debounce_window;
        self
    }

    /// The configured debounce window.
    pub fn debounce_window(&self) -> Duration {
        self.debounce_window
    }

    /// Reports a queue state; returns whether the sink was notified.
    ///
    /// `Active` is the quiescent state and is never notified. A state equal to
    /// the last notified one is suppressed until the debounce window has passed.
    pub fn on_state_change(&self, state: QueueState, reason: &str) -> bool {
        if state == QueueState::Active {
            return false;
        }

        let now = Instant::now();
        {
            let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let within_window = guard
                .last_notified_at
                .is_some_and(|at| now.saturating_duration_since(at) < self.debounce_window);
            if guard.last_notified_state == Some(state) && within_window {
                return false;
            }
            guard.last_notified_state = Some(state);
            guard.last_notified_at = Some(now);
        }

        self.sink.notify(&QueueStateNotification { state, reason: reason.to_string() });
        true
    }
}

impl fmt::Debug for QueueStateObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueStateObserver")
            .field("debounce_window", &self.debounce_window)
            .finish_non_exhaustive()
    }
}
