//! Entry point owning one transport, observer and controller.

use crate::config::ClientConfig;
use crate::controller::FutureController;
use crate::http::HttpTransport;
use crate::observer::QueueStateObserver;
use crate::training::TrainingClient;
use gradwire_abstraction::{ClientResult, Transport};
use std::sync::Arc;
use tracing::info;

/// A connection to the training service.
///
/// Each instance has its own queue state observer, so notifications of one
/// client are never suppressed by another.
#[derive(Debug, Clone)]
pub struct ServiceClient {
    controller: Arc<FutureController>,
}

impl ServiceClient {
    /// Builds an HTTP client from configuration.
    ///
    /// # Errors
    /// Returns `ClientError::Config` if the configuration is invalid.
    pub fn from_config(config: &ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        let base_url = config.base_url.clone().unwrap_or_default();

        let mut transport = match config.request_timeout() {
            Some(timeout) => HttpTransport::with_request_timeout(base_url, timeout)?,
            None => HttpTransport::new(base_url),
        };
        if let Some(api_key) = &config.api_key {
            transport = transport.with_api_key(api_key.clone());
        }
        info!(base_url = transport.base_url(), "Connecting to training service");

        let mut observer = QueueStateObserver::tracing();
        if let Some(window) = config.debounce_window() {
            observer = observer.with_debounce_window(window);
        }

        let controller = FutureController::new(Arc::new(transport), Arc::new(observer))
            .with_retry_policy(config.retry_policy())
            .with_backpressure_policy(config.backpressure_policy());
        Ok(Self::with_controller(controller))
    }

    /// A client over any transport with default policies.
    pub fn with_transport(transport: Arc<dyn Transport>, observer: QueueStateObserver) -> Self {
        Self::with_controller(FutureController::new(transport, Arc::new(observer)))
    }

    /// A client over a fully configured controller.
    pub fn with_controller(controller: FutureController) -> Self {
        Self { controller: Arc::new(controller) }
    }

    /// A training handle for `model_id`.
    pub fn training_client(&self, model_id: impl Into<String>) -> TrainingClient {
        TrainingClient::new(Arc::clone(&self.controller), model_id)
    }

    /// The shared controller.
    pub fn controller(&self) -> &Arc<FutureController> {
        &self.controller
    }

    /// This client's queue state observer.
    pub fn observer(&self) -> &Arc<QueueStateObserver> {
        self.controller.observer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_from_config_applies_policies() {
        let mut config = ClientConfig::default().with_base_url("http://localhost:8000");
        config.debounce_secs = Some(5);
        config.retry.max_retries = Some(1);
        config.backpressure.max_attempts = Some(3);

        let client = ServiceClient::from_config(&config).unwrap();
        assert_eq!(client.observer().debounce_window(), Duration::from_secs(5));
        assert_eq!(client.controller().retry_policy().max_retries, 1);
        assert_eq!(client.controller().backpressure_policy().max_attempts, Some(3));
    }

    #[test]
    fn test_from_config_requires_base_url() {
        let error = ServiceClient::from_config(&ClientConfig::default()).unwrap_err();
        assert_eq!(error.tag(), "config_error");
    }

    #[test]
    fn test_clients_have_independent_observers() {
        let config = ClientConfig::default().with_base_url("http://localhost:8000");
        let a = ServiceClient::from_config(&config).unwrap();
        let b = ServiceClient::from_config(&config).unwrap();
        assert!(!Arc::ptr_eq(a.observer(), b.observer()));
    }
}
