//! Configuration parsing helpers shared by the step factories.

use super::StepConfig;
use crate::errors::StepflowError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;
use thiserror::Error;

/// Deserializes a step's raw configuration into a typed config struct.
///
/// # Errors
///
/// Returns a `Config` error naming the step type and step.
pub fn parse_config<T: DeserializeOwned>(
    step_type: &str,
    name: &str,
    config: &StepConfig,
) -> Result<T, StepflowError> {
    serde_json::from_value(serde_json::Value::Object(config.clone()))
        .map_err(|e| StepflowError::config(step_type, name, e.to_string()))
}

/// Error parsing a duration string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid duration {input:?}: {reason}")]
pub struct DurationParseError {
    /// The rejected input.
    pub input: String,
    /// What was wrong with it.
    pub reason: String,
}

impl DurationParseError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// Parses durations such as `"250ms"`, `"1s"`, `"1m30s"` or `"1.5h"`.
///
/// Units: `ns`, `us` (or `µs`), `ms`, `s`, `m`, `h`. A bare `"0"` is zero.
pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(DurationParseError::new(input, "empty duration"));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let is_numeric = |c: char| c.is_ascii_digit() || c == '.';
    let mut total_nanos = 0.0_f64;
    let mut rest = s;
    while !rest.is_empty() {
        let number_end = rest.find(|c: char| !is_numeric(c)).unwrap_or(rest.len());
        if number_end == 0 {
            return Err(DurationParseError::new(input, "expected a number"));
        }
        let value: f64 = rest[..number_end]
            .parse()
            .map_err(|_| DurationParseError::new(input, "malformed number"))?;
        rest = &rest[number_end..];

        let unit_end = rest.find(is_numeric).unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(DurationParseError::new(input, "missing unit")),
            other => {
                return Err(DurationParseError::new(input, format!("unknown unit {other:?}")))
            }
        };
        total_nanos += value * scale;
        rest = &rest[unit_end..];
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(DurationParseError::new(input, "out of range"));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let nanos = total_nanos.round() as u64;
    Ok(Duration::from_nanos(nanos))
}

/// A duration in step configuration.
///
/// Accepts a duration string (`"1s"`) or an integer number of milliseconds.
/// Serializes back to milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDuration(pub Duration);

impl From<ConfigDuration> for Duration {
    fn from(value: ConfigDuration) -> Self {
        value.0
    }
}

impl<'de> Deserialize<'de> for ConfigDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Millis(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Ok(Self(Duration::from_millis(ms))),
            Raw::Text(text) => parse_duration(&text)
                .map(Self)
                .map_err(serde::de::Error::custom),
        }
    }
}

impl Serialize for ConfigDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(self.0.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }
}
