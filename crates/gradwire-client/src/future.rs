//! Handles for submitted operations.

use gradwire_abstraction::{
    ClientError, ClientResult, OperationKind, QueueState, RequestEnvelope, RequestId,
};
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Client-side identifier of a future, used to correlate log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FutureId(Uuid);

impl FutureId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for FutureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a future whose result decodes as `T`.
#[derive(Debug, Clone, PartialEq)]
pub enum FutureStatus<T = Value> {
    /// Submitted (or awaiting resubmission) with no verdict yet.
    Pending,
    /// The server asked the client to come back later.
    TryAgain {
        /// Queue state reported with the reply.
        queue_state: QueueState,
        /// Server-suggested delay, if any.
        retry_after: Option<Duration>,
    },
    /// Terminal: the operation produced this result.
    Completed(T),
    /// Terminal: the operation failed.
    Failed(ClientError),
}

impl<T> FutureStatus<T> {
    /// Whether the status can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }
}

/// The eventual result of a submitted operation, decoded as `T`.
///
/// A future is driven by [`crate::FutureController::poll`]. Once it reaches a
/// terminal status it never changes again, and polling it returns the same
/// outcome without touching the network.
pub struct ApiFuture<T> {
    id: FutureId,
    request: RequestEnvelope,
    resubmittable: bool,
    request_id: Option<RequestId>,
    status: FutureStatus<T>,
    queue_state: QueueState,
    transport_failures: u32,
    server_retries: u32,
    try_again_count: u32,
    next_delay: Duration,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ApiFuture<T> {
    pub(crate) fn new(request: RequestEnvelope) -> Self {
        Self {
            id: FutureId::new(),
            request,
            resubmittable: true,
            request_id: None,
            status: FutureStatus::Pending,
            queue_state: QueueState::Active,
            transport_failures: 0,
            server_retries: 0,
            try_again_count: 0,
            next_delay: Duration::ZERO,
            _marker: PhantomData,
        }
    }

    /// A future for a request submitted elsewhere; it cannot be resubmitted.
    pub(crate) fn attached(op: OperationKind, request_id: RequestId) -> Self {
        let mut future = Self::new(RequestEnvelope::new(op, Value::Null));
        future.resubmittable = false;
        future.request_id = Some(request_id);
        future
    }

    /// Client-side identifier.
    pub fn id(&self) -> FutureId {
        self.id
    }

    /// The operation this future belongs to.
    pub fn op(&self) -> OperationKind {
        self.request.op
    }

    /// The server's request id, once the request has been admitted.
    pub fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    /// Current status.
    pub fn status(&self) -> &FutureStatus<T> {
        &self.status
    }

    /// Last queue state the server reported for this future.
    pub fn queue_state(&self) -> QueueState {
        self.queue_state
    }

    /// Consecutive transport failures since the last protocol-level reply.
    pub fn transport_failures(&self) -> u32 {
        self.transport_failures
    }

    /// Number of try-again replies received.
    pub fn try_again_count(&self) -> u32 {
        self.try_again_count
    }

    /// Whether the future has reached its final state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn request(&self) -> &RequestEnvelope {
        &self.request
    }

    pub(crate) fn can_resubmit(&self) -> bool {
        self.resubmittable
    }

    pub(crate) fn next_delay(&self) -> Duration {
        self.next_delay
    }

    pub(crate) fn set_next_delay(&mut self, delay: Duration) {
        self.next_delay = delay;
    }

    pub(crate) fn admit(&mut self, request_id: RequestId) {
        self.request_id = Some(request_id);
        self.transport_failures = 0;
        if !self.is_terminal() {
            self.status = FutureStatus::Pending;
        }
    }

    /// Drops the request id so the next call resubmits the envelope.
    pub(crate) fn rewind(&mut self) {
        self.request_id = None;
        if !self.is_terminal() {
            self.status = FutureStatus::Pending;
        }
    }

    pub(crate) fn record_transport_failure(&mut self) -> u32 {
        self.transport_failures += 1;
        self.transport_failures
    }

    pub(crate) fn record_server_retry(&mut self) -> u32 {
        self.server_retries += 1;
        self.server_retries
    }

    /// Records a try-again reply; returns whether the queue state changed.
    pub(crate) fn record_try_again(
        &mut self,
        queue_state: QueueState,
        retry_after: Option<Duration>,
    ) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.try_again_count += 1;
        self.transport_failures = 0;
        self.status = FutureStatus::TryAgain { queue_state, retry_after };
        let changed = self.queue_state != queue_state;
        self.queue_state = queue_state;
        changed
    }

    /// Moves to a terminal state; a future that is already terminal is left untouched.
    pub(crate) fn finish(&mut self, status: FutureStatus<T>) -> bool {
        debug_assert!(status.is_terminal());
        if self.is_terminal() {
            return false;
        }
        self.status = status;
        true
    }
}

impl<T: Clone> ApiFuture<T> {
    /// The outcome, if the future is terminal.
    pub fn outcome(&self) -> Option<ClientResult<T>> {
        match &self.status {
            FutureStatus::Completed(result) => Some(Ok(result.clone())),
            FutureStatus::Failed(error) => Some(Err(error.clone())),
            FutureStatus::Pending | FutureStatus::TryAgain { .. } => None,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ApiFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiFuture")
            .field("id", &self.id)
            .field("op", &self.request.op)
            .field("request_id", &self.request_id)
            .field("status", &self.status)
            .field("queue_state", &self.queue_state)
            .field("try_again_count", &self.try_again_count)
            .finish_non_exhaustive()
    }
}

/// Per-call options for [`crate::FutureController::poll`].
#[derive(Debug, Clone, Default)]
pub struct PollOptions {
    /// Give up waiting after this long; `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Cooperative cancellation, checked between loop iterations.
    pub cancel: Option<CancellationToken>,
}

impl PollOptions {
    /// Options with a deadline.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout: Some(timeout), cancel: None }
    }

    /// Attaches a cancellation token.
    #[must_use]
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}
