//! Submit → poll → terminal lifecycle of operations.

use crate::future::{ApiFuture, FutureStatus, PollOptions};
use crate::observer::QueueStateObserver;
use crate::retry::{BackpressurePolicy, RetryPolicy};
use gradwire_abstraction::{
    ClientError, ClientResult, OperationKind, RequestEnvelope, RequestId, RetrieveResponse,
    ServerError, SubmitResponse, Transport, TransportError, TryAgain,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What the poll loop does after applying a reply.
enum Next {
    Terminal,
    Wait(Duration),
}

/// Drives futures through the submit/retrieve protocol.
///
/// The controller holds no per-future state, so one instance can poll any
/// number of futures concurrently. It never reorders requests: callers that
/// need B to follow A await A's future before submitting B.
pub struct FutureController {
    transport: Arc<dyn Transport>,
    observer: Arc<QueueStateObserver>,
    retry_policy: RetryPolicy,
    backpressure: BackpressurePolicy,
}

impl FutureController {
    /// Creates a controller with default retry and backpressure policies.
    pub fn new(transport: Arc<dyn Transport>, observer: Arc<QueueStateObserver>) -> Self {
        Self {
            transport,
            observer,
            retry_policy: RetryPolicy::default(),
            backpressure: BackpressurePolicy::default(),
        }
    }

    /// Sets the transport retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Sets the backpressure policy.
    #[must_use]
    pub fn with_backpressure_policy(mut self, backpressure: BackpressurePolicy) -> Self {
        self.backpressure = backpressure;
        self
    }

    /// The queue state observer shared by every future of this controller.
    pub fn observer(&self) -> &Arc<QueueStateObserver> {
        &self.observer
    }

    /// The transport retry policy.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// The backpressure policy.
    pub fn backpressure_policy(&self) -> &BackpressurePolicy {
        &self.backpressure
    }

    /// Submits an operation with exactly one transport call.
    ///
    /// An inline result makes the future terminal right away; a deferred id
    /// leaves it pending until polled. Admission backpressure and retryable
    /// transport failures leave it pending in its submission phase, and the
    /// first `poll` resubmits after the appropriate delay.
    pub async fn submit<T: DeserializeOwned>(
        &self,
        op: OperationKind,
        body: Value,
    ) -> ApiFuture<T> {
        let mut future = ApiFuture::new(RequestEnvelope::new(op, body));
        debug!(future_id = %future.id(), op = %op, "Submitting request");

        let outcome = self.transport.submit(future.request()).await;
        let next = self.apply_submit(&mut future, outcome);
        if let Next::Wait(delay) = next {
            future.set_next_delay(delay);
        }
        future
    }

    /// Re-attaches to a request submitted earlier, e.g. by another process.
    pub fn attach<T>(&self, op: OperationKind, request_id: RequestId) -> ApiFuture<T> {
        ApiFuture::attached(op, request_id)
    }

    /// Waits for a future to reach a terminal state and returns its decoded result.
    ///
    /// With a timeout, an elapsed deadline returns `TimeoutExceeded` and leaves
    /// the future valid for a later call. Without one, the loop keeps waiting
    /// for as long as the server answers try-again (subject to the
    /// backpressure policy). Cancellation is checked between iterations; a
    /// call already in flight is allowed to finish and its reply is discarded.
    pub async fn poll<T: DeserializeOwned + Clone>(
        &self,
        future: &mut ApiFuture<T>,
        options: &PollOptions,
    ) -> ClientResult<T> {
        let started = Instant::now();
        let deadline = options.timeout.map(|timeout| started + timeout);

        loop {
            if let Some(outcome) = future.outcome() {
                return outcome;
            }
            if options.is_cancelled() {
                debug!(future_id = %future.id(), "Polling cancelled");
                return Err(ClientError::Cancelled);
            }

            let pending_delay = future.next_delay();
            if !pending_delay.is_zero() {
                let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
                if remaining.is_some_and(|r| r.is_zero()) {
                    return Err(timeout_exceeded(future, started));
                }
                let sleep_for = remaining.map_or(pending_delay, |r| pending_delay.min(r));
                if sleep_or_cancel(sleep_for, options.cancel.as_ref()).await {
                    debug!(future_id = %future.id(), "Polling cancelled while waiting");
                    return Err(ClientError::Cancelled);
                }
                future.set_next_delay(pending_delay.saturating_sub(sleep_for));
                continue;
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(timeout_exceeded(future, started));
            }

            let next = match future.request_id().cloned() {
                Some(request_id) => {
                    let outcome = self.transport.retrieve(&request_id).await;
                    if options.is_cancelled() {
                        debug!(
                            future_id = %future.id(),
                            "Discarding reply received after cancellation"
                        );
                        return Err(ClientError::Cancelled);
                    }
                    self.apply_retrieve(future, outcome)
                }
                None => {
                    let outcome = self.transport.submit(future.request()).await;
                    if options.is_cancelled() {
                        keep_admission(future, outcome);
                        return Err(ClientError::Cancelled);
                    }
                    self.apply_submit(future, outcome)
                }
            };

            match next {
                Next::Terminal => {}
                Next::Wait(delay) => future.set_next_delay(delay),
            }
        }
    }

    fn apply_submit<T: DeserializeOwned>(
        &self,
        future: &mut ApiFuture<T>,
        outcome: Result<SubmitResponse, TransportError>,
    ) -> Next {
        match outcome {
            Ok(SubmitResponse::Inline(payload)) => {
                debug!(future_id = %future.id(), "Request completed inline");
                complete(future, payload)
            }
            Ok(SubmitResponse::Deferred(request_id)) => {
                debug!(future_id = %future.id(), request_id = %request_id, "Request admitted");
                future.admit(request_id);
                Next::Wait(Duration::ZERO)
            }
            Ok(SubmitResponse::TryAgain(signal)) => self.apply_try_again(future, &signal),
            Ok(SubmitResponse::Rejected(error)) => self.apply_server_failure(future, error),
            Err(error) => self.apply_transport_error(future, error),
        }
    }

    fn apply_retrieve<T: DeserializeOwned>(
        &self,
        future: &mut ApiFuture<T>,
        outcome: Result<RetrieveResponse, TransportError>,
    ) -> Next {
        match outcome {
            Ok(RetrieveResponse::Completed(payload)) => {
                debug!(future_id = %future.id(), "Request completed");
                complete(future, payload)
            }
            Ok(RetrieveResponse::Failed(error)) => self.apply_server_failure(future, error),
            Ok(RetrieveResponse::TryAgain(signal)) => self.apply_try_again(future, &signal),
            Err(error) => self.apply_transport_error(future, error),
        }
    }

    fn apply_try_again<T>(&self, future: &mut ApiFuture<T>, signal: &TryAgain) -> Next {
        let retry_after = signal.retry_after_ms.map(Duration::from_millis);
        if future.record_try_again(signal.queue_state, retry_after) {
            self.observer.on_state_change(signal.queue_state, signal.reason());
        }

        if self.backpressure.is_exhausted(future.try_again_count()) {
            warn!(
                future_id = %future.id(),
                queue_state = %signal.queue_state,
                attempts = future.try_again_count(),
                "Backpressure bound reached"
            );
            future.finish(FutureStatus::Failed(ClientError::BackpressureExhausted {
                queue_state: signal.queue_state,
                attempts: future.try_again_count(),
            }));
            return Next::Terminal;
        }

        let delay = self.backpressure.next_delay(retry_after);
        debug!(
            future_id = %future.id(),
            queue_state = %signal.queue_state,
            try_again_count = future.try_again_count(),
            delay_ms = delay.as_millis() as u64,
            "Server asked to try again"
        );
        Next::Wait(delay)
    }

    fn apply_transport_error<T>(&self, future: &mut ApiFuture<T>, error: TransportError) -> Next {
        if !error.is_retryable() {
            warn!(future_id = %future.id(), error = %error, "Non-retryable transport failure");
            future.finish(FutureStatus::Failed(ClientError::Transport(error)));
            return Next::Terminal;
        }

        let failures = future.record_transport_failure();
        if !self.retry_policy.allows_retry(failures) {
            warn!(
                future_id = %future.id(),
                attempts = failures,
                error = %error,
                "Transport retries exhausted"
            );
            future.finish(FutureStatus::Failed(ClientError::TransportExhausted {
                attempts: failures,
                last_error: error,
            }));
            return Next::Terminal;
        }

        let delay = self.retry_policy.next_delay(failures - 1);
        debug!(
            future_id = %future.id(),
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transport failure, retrying after backoff"
        );
        Next::Wait(delay)
    }

    fn apply_server_failure<T>(&self, future: &mut ApiFuture<T>, error: ServerError) -> Next {
        if error.retryable && future.can_resubmit() {
            let retries = future.record_server_retry();
            if retries <= self.retry_policy.max_retries {
                let delay = self.retry_policy.next_delay(retries - 1);
                debug!(
                    future_id = %future.id(),
                    retry = retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retryable server failure, resubmitting"
                );
                future.rewind();
                return Next::Wait(delay);
            }
        }

        debug!(future_id = %future.id(), error = %error, "Request failed");
        future.finish(FutureStatus::Failed(ClientError::Server(error)));
        Next::Terminal
    }
}

impl fmt::Debug for FutureController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureController")
            .field("retry_policy", &self.retry_policy)
            .field("backpressure", &self.backpressure)
            .finish_non_exhaustive()
    }
}

/// Completes a future, failing it instead if the payload does not decode as `T`.
fn complete<T: DeserializeOwned>(future: &mut ApiFuture<T>, payload: Value) -> Next {
    let status = match serde_json::from_value::<T>(payload) {
        Ok(result) => FutureStatus::Completed(result),
        Err(error) => {
            warn!(future_id = %future.id(), error = %error, "Result payload did not decode");
            FutureStatus::Failed(ClientError::from(error))
        }
    };
    future.finish(status);
    Next::Terminal
}

/// Records an admission that raced with cancellation, so the next poll
/// retrieves the request instead of submitting it a second time.
fn keep_admission<T: DeserializeOwned>(
    future: &mut ApiFuture<T>,
    outcome: Result<SubmitResponse, TransportError>,
) {
    match outcome {
        Ok(SubmitResponse::Deferred(request_id)) => {
            debug!(
                future_id = %future.id(),
                request_id = %request_id,
                "Request admitted while cancelling"
            );
            future.admit(request_id);
        }
        Ok(SubmitResponse::Inline(payload)) => {
            complete(future, payload);
        }
        _ => debug!(future_id = %future.id(), "Discarding reply received after cancellation"),
    }
}

fn timeout_exceeded<T>(future: &ApiFuture<T>, started: Instant) -> ClientError {
    let elapsed = started.elapsed();
    debug!(
        future_id = %future.id(),
        elapsed_ms = elapsed.as_millis() as u64,
        "Poll deadline exceeded; future stays attachable"
    );
    ClientError::TimeoutExceeded { elapsed }
}

/// Sleeps for `duration`; returns `true` if the token fired first.
async fn sleep_or_cancel(duration: Duration, cancel: Option<&CancellationToken>) -> bool {
    match cancel {
        Some(token) => tokio::select! {
            () = tokio::time::sleep(duration) => false,
            () = token.cancelled() => true,
        },
        None => {
            tokio::time::sleep(duration).await;
            false
        }
    }
}
