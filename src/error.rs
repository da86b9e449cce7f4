use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::cni::PluginStep;
use crate::libcni::CNIError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The task config cannot describe a valid topology. Raised before any
    /// plugin runs.
    #[error("invalid task network config: {0}")]
    Validation(String),

    #[error("{step} plugin failed: {source}")]
    Invocation {
        step: PluginStep,
        #[source]
        source: CNIError,
    },

    #[error("{step} plugin did not finish within {timeout:?}")]
    Timeout { step: PluginStep, timeout: Duration },

    /// Setup failed and at least one completed step could not be undone.
    #[error("{original}; unwind incomplete: {}", describe(.failures))]
    Unwind {
        #[source]
        original: Box<Error>,
        failures: Vec<StepFailure>,
    },

    #[error("cleanup failed: {}", describe(.failures))]
    Cleanup { failures: Vec<StepFailure> },

    #[error("unable to get version of plugin {plugin}: {source}")]
    Version {
        plugin: String,
        #[source]
        source: CNIError,
    },
}

#[derive(Debug)]
pub struct StepFailure {
    pub step: PluginStep,
    pub error: Error,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.error)
    }
}

fn describe(failures: &[StepFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    pub(crate) fn from_cni(step: PluginStep, source: CNIError) -> Self {
        match source {
            CNIError::Timeout { timeout, .. } => Error::Timeout { step, timeout },
            source => Error::Invocation { step, source },
        }
    }

    /// True when the namespace may still hold state from this call.
    pub fn is_partial(&self) -> bool {
        matches!(self, Error::Unwind { .. } | Error::Cleanup { .. })
    }

    /// Steps that failed during an unwind or a cleanup, in the order they ran.
    pub fn failed_steps(&self) -> Vec<PluginStep> {
        match self {
            Error::Unwind { failures, .. } | Error::Cleanup { failures } => {
                failures.iter().map(|f| f.step).collect()
            }
            _ => Vec::new(),
        }
    }
}
