//! Argument types shared between main.rs and the commands.

use clap::{Subcommand, ValueEnum};
use gradwire_abstraction::{LossKind, OperationKind};

/// Server-side loss functions.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossFnArg {
    CrossEntropy,
    ImportanceSampling,
    Ppo,
}

impl From<LossFnArg> for LossKind {
    fn from(arg: LossFnArg) -> Self {
        match arg {
            LossFnArg::CrossEntropy => Self::CrossEntropy,
            LossFnArg::ImportanceSampling => Self::ImportanceSampling,
            LossFnArg::Ppo => Self::Ppo,
        }
    }
}

/// Built-in losses for the relay command.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayLossArg {
    /// Negative log-likelihood summed over all tokens
    Sum,
    /// Negative log-likelihood averaged over all tokens
    Mean,
}

/// Operations a request id can belong to.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpArg {
    Forward,
    ForwardBackward,
    OptimStep,
}

impl OpArg {
    /// The value `--op` takes for this operation.
    pub fn flag(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::ForwardBackward => "forward-backward",
            Self::OptimStep => "optim-step",
        }
    }
}

impl From<OperationKind> for OpArg {
    fn from(op: OperationKind) -> Self {
        match op {
            OperationKind::Forward => Self::Forward,
            OperationKind::ForwardBackward => Self::ForwardBackward,
            OperationKind::OptimStep => Self::OptimStep,
        }
    }
}

impl From<OpArg> for OperationKind {
    fn from(arg: OpArg) -> Self {
        match arg {
            OpArg::Forward => Self::Forward,
            OpArg::ForwardBackward => Self::ForwardBackward,
            OpArg::OptimStep => Self::OptimStep,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommand {
    /// Show the effective configuration (API key masked)
    Show,

    /// Check that the configuration can build a client
    Validate,
}
