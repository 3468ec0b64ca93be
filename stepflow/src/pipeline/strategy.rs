//! Error strategies applied when a pipeline step fails.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What the pipeline does when a step returns an error.
///
/// Cancellation and control-flow errors always abort the run, whatever the
/// strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// Abort and return the step's error.
    #[default]
    Stop,
    /// Record the failure under the step and continue with the next one.
    Skip,
    /// Run the compensation steps, then abort.
    Compensate,
}

impl ErrorStrategy {
    /// Returns the configuration spelling of the strategy.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Skip => "skip",
            Self::Compensate => "compensate",
        }
    }
}

impl fmt::Display for ErrorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "stop" => Ok(Self::Stop),
            "skip" => Ok(Self::Skip),
            "compensate" => Ok(Self::Compensate),
            other => Err(format!(
                "unknown error strategy {other:?} (expected stop, skip or compensate)"
            )),
        }
    }
}
