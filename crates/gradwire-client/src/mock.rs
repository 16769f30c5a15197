//! A scripted transport for tests and offline development.

use async_trait::async_trait;
use gradwire_abstraction::{
    RequestEnvelope, RequestId, RetrieveResponse, SubmitResponse, Transport, TransportError,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// One call observed by a [`ScriptedTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    /// A submission and its envelope.
    Submit(RequestEnvelope),
    /// A retrieval and its request id.
    Retrieve(RequestId),
}

type SubmitHandler =
    Arc<dyn Fn(&RequestEnvelope) -> Result<SubmitResponse, TransportError> + Send + Sync>;

#[derive(Default)]
struct Script {
    submits: VecDeque<Result<SubmitResponse, TransportError>>,
    retrieves: VecDeque<Result<RetrieveResponse, TransportError>>,
    submit_handler: Option<SubmitHandler>,
    retrieve_fallback: Option<Result<RetrieveResponse, TransportError>>,
    calls: Vec<TransportCall>,
    next_request: u64,
}

/// Transport that replays scripted replies and records every call.
///
/// Submit replies are taken from the submit script, then from the submit
/// handler, and otherwise default to a deferred id (`req-1`, `req-2`, ...).
/// Retrieve replies are taken from the retrieve script, then repeat the
/// fallback; with neither, retrieval fails with a non-retryable 404.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<Script>,
}

impl ScriptedTransport {
    /// Creates an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_script(self, edit: impl FnOnce(&mut Script)) -> Self {
        edit(&mut self.script.lock().unwrap_or_else(PoisonError::into_inner));
        self
    }

    /// Queues a submit reply.
    #[must_use]
    pub fn on_submit(self, reply: SubmitResponse) -> Self {
        self.with_script(|s| s.submits.push_back(Ok(reply)))
    }

    /// Queues a submit transport failure.
    #[must_use]
    pub fn on_submit_error(self, error: TransportError) -> Self {
        self.with_script(|s| s.submits.push_back(Err(error)))
    }

    /// Answers submits with `handler` once the submit script is empty.
    #[must_use]
    pub fn with_submit_handler<F>(self, handler: F) -> Self
    where
        F: Fn(&RequestEnvelope) -> Result<SubmitResponse, TransportError> + Send + Sync + 'static,
    {
        self.with_script(|s| s.submit_handler = Some(Arc::new(handler)))
    }

    /// Queues a retrieve reply.
    #[must_use]
    pub fn on_retrieve(self, reply: RetrieveResponse) -> Self {
        self.with_script(|s| s.retrieves.push_back(Ok(reply)))
    }

    /// Queues a retrieve transport failure.
    #[must_use]
    pub fn on_retrieve_error(self, error: TransportError) -> Self {
        self.with_script(|s| s.retrieves.push_back(Err(error)))
    }

    /// Repeats `reply` for every retrieve once the retrieve script is empty.
    #[must_use]
    pub fn retrieve_fallback(self, reply: RetrieveResponse) -> Self {
        self.with_script(|s| s.retrieve_fallback = Some(Ok(reply)))
    }

    /// Repeats `error` for every retrieve once the retrieve script is empty.
    #[must_use]
    pub fn retrieve_error_fallback(self, error: TransportError) -> Self {
        self.with_script(|s| s.retrieve_fallback = Some(Err(error)))
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner).calls.clone()
    }

    /// Envelopes of every submit call, in order.
    pub fn submitted(&self) -> Vec<RequestEnvelope> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Submit(envelope) => Some(envelope),
                TransportCall::Retrieve(_) => None,
            })
            .collect()
    }

    /// Number of submit calls.
    pub fn submit_count(&self) -> usize {
        self.submitted().len()
    }

    /// Number of retrieve calls.
    pub fn retrieve_count(&self) -> usize {
        self.calls().iter().filter(|call| matches!(call, TransportCall::Retrieve(_))).count()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn submit(&self, request: &RequestEnvelope) -> Result<SubmitResponse, TransportError> {
        let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        script.calls.push(TransportCall::Submit(request.clone()));
        if let Some(reply) = script.submits.pop_front() {
            return reply;
        }
        if let Some(handler) = script.submit_handler.clone() {
            drop(script);
            return handler(request);
        }
        script.next_request += 1;
        Ok(SubmitResponse::Deferred(RequestId(format!("req-{}", script.next_request))))
    }

    async fn retrieve(&self, request_id: &RequestId) -> Result<RetrieveResponse, TransportError> {
        let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        script.calls.push(TransportCall::Retrieve(request_id.clone()));
        if let Some(reply) = script.retrieves.pop_front() {
            return reply;
        }
        script.retrieve_fallback.clone().unwrap_or_else(|| {
            Err(TransportError::Status {
                status: 404,
                body: format!("no scripted reply for {}", request_id),
            })
        })
    }
}
