//! gradwire CLI - Command-line interface for a remote training service
//!
//! This CLI provides a `gradwire` command that submits forward,
//! forward-backward and optimizer-step operations, trains with built-in
//! custom losses through the gradient relay, and re-attaches to earlier
//! requests.

mod commands;
mod config;
mod data;

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use commands::types::{ConfigCommand, LossFnArg, OpArg, RelayLossArg};
use commands::{config as config_cmd, ops, relay};

/// gradwire - client for a remote neural-network training service
#[derive(Parser, Debug)]
#[command(
    name = "gradwire",
    author,
    version,
    about = "gradwire - submit and await training operations on a remote service"
)]
struct Args {
    /// Log level (trace, debug, info, warn, error); overrides config and RUST_LOG
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Configuration file layered over ~/.gradwire/config.toml and ./.gradwirerc
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Base URL of the training service (overrides GRADWIRE_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Model to train (overrides GRADWIRE_MODEL_ID)
    #[arg(short, long, global = true)]
    model_id: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a forward pass over a JSONL data file
    Forward {
        /// JSONL file with one datum per line
        #[arg(short, long)]
        data: PathBuf,

        /// Server-side loss function
        #[arg(long, value_enum, default_value_t = LossFnArg::CrossEntropy)]
        loss_fn: LossFnArg,

        /// Give up waiting after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Run a forward-backward pass, accumulating gradients on the server
    ForwardBackward {
        /// JSONL file with one datum per line
        #[arg(short, long)]
        data: PathBuf,

        /// Server-side loss function
        #[arg(long, value_enum, default_value_t = LossFnArg::CrossEntropy)]
        loss_fn: LossFnArg,

        /// Give up waiting after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Run a forward-backward pass with a locally differentiated loss
    Relay {
        /// JSONL file with one datum per line
        #[arg(short, long)]
        data: PathBuf,

        /// Loss over the forward pass logprobs
        #[arg(long, value_enum, default_value_t = RelayLossArg::Sum)]
        loss: RelayLossArg,

        /// Give up waiting on each RPC after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Apply accumulated gradients with Adam
    OptimStep {
        /// Step size
        #[arg(long, default_value_t = 1e-4)]
        learning_rate: f64,

        /// First moment decay
        #[arg(long)]
        beta1: Option<f64>,

        /// Second moment decay
        #[arg(long)]
        beta2: Option<f64>,

        /// Numerical stability term
        #[arg(long)]
        eps: Option<f64>,

        /// Give up waiting after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Wait for the result of a request submitted earlier
    Retrieve {
        /// Server request id
        #[arg(long)]
        request_id: String,

        /// Operation the request belongs to
        #[arg(long, value_enum, default_value_t = OpArg::Forward)]
        op: OpArg,

        /// Give up waiting after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let overrides = config::Overrides {
        config_path: args.config.clone(),
        base_url: args.base_url.clone(),
        model_id: args.model_id.clone(),
    };
    let client_config = config::load_config(&overrides)?;

    init_logging(args.log_level.as_deref().or(client_config.log_level.as_deref()));

    // If no command provided, show help
    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    match command {
        Command::Forward { data, loss_fn, timeout_secs } => {
            ops::forward(&client_config, &data, loss_fn.into(), timeout_secs).await?;
        }
        Command::ForwardBackward { data, loss_fn, timeout_secs } => {
            ops::forward_backward(&client_config, &data, loss_fn.into(), timeout_secs).await?;
        }
        Command::Relay { data, loss, timeout_secs } => {
            relay::execute(&client_config, &data, loss, timeout_secs).await?;
        }
        Command::OptimStep { learning_rate, beta1, beta2, eps, timeout_secs } => {
            let params = ops::adam_params(learning_rate, beta1, beta2, eps);
            ops::optim_step(&client_config, params, timeout_secs).await?;
        }
        Command::Retrieve { request_id, op, timeout_secs } => {
            ops::retrieve(&client_config, request_id, op.into(), timeout_secs).await?;
        }
        Command::Config(command) => {
            config_cmd::execute(&client_config, command)?;
        }
    }

    Ok(())
}

/// Logs go to stderr so stdout carries only results.
fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .try_init();
}
