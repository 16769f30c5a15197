//! Command implementations for the gradwire CLI.

pub mod config;
pub mod ops;
pub mod relay;
pub mod types;

use anyhow::Result;
use gradwire_client::{ClientConfig, PollOptions, ServiceClient};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Builds a client from the effective configuration.
pub fn connect(config: &ClientConfig) -> Result<ServiceClient> {
    Ok(ServiceClient::from_config(config)?)
}

/// Poll options with an optional deadline, cancelled by Ctrl-C.
pub fn poll_options(timeout_secs: Option<u64>) -> PollOptions {
    let token = CancellationToken::new();

    // Register SIGINT handler for graceful shutdown
    let cancel = token.clone();
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            warn!("Interrupted; abandoning the wait (the request keeps running on the server)");
            cancel.cancel();
        }
    });

    let options = PollOptions::default().cancel_on(token);
    match timeout_secs {
        Some(secs) => PollOptions { timeout: Some(Duration::from_secs(secs)), ..options },
        None => options,
    }
}

/// Prints a result as pretty JSON on stdout.
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
