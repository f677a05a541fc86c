//! Partitioner configuration.

use serde::{Deserialize, Serialize};

use crate::{
    constants::{
        DEFAULT_DIMENSIONS, DEFAULT_IMBALANCE_TOL, DEFAULT_MAX_ITERATIONS, MAX_DIMENSIONS,
    },
    error::{RcbError, RcbResult},
};

/// Options recognised by the recursive coordinate bisection.
///
/// ### Default Values
/// - `imbalance_tol`: `0.03`
/// - `max_iterations`: `30`
/// - `dimensions`: `3`
/// - `keep_history`: `false`
/// - `check_geometry`: `true`
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RcbConfig {
    /// Allowed relative deviation of a process's weight from its exact share.
    #[serde(default = "default_imbalance_tol")]
    pub imbalance_tol: f64,

    /// Cap on median-search iterations per level.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Number of coordinates per dot (1, 2 or 3). Must agree on all processes.
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Record the weight split of every level on this process's path.
    #[serde(default)]
    pub keep_history: bool,

    /// Verify conservation and region containment after partitioning.
    #[serde(default = "default_check_geometry")]
    pub check_geometry: bool,
}

fn default_imbalance_tol() -> f64 {
    DEFAULT_IMBALANCE_TOL
}
fn default_max_iterations() -> usize {
    DEFAULT_MAX_ITERATIONS
}
fn default_dimensions() -> usize {
    DEFAULT_DIMENSIONS
}
fn default_check_geometry() -> bool {
    true
}

impl Default for RcbConfig {
    fn default() -> Self {
        RcbConfig {
            imbalance_tol: DEFAULT_IMBALANCE_TOL,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            dimensions: DEFAULT_DIMENSIONS,
            keep_history: false,
            check_geometry: true,
        }
    }
}

impl RcbConfig {
    /// Configuration with the given dimensionality and defaults otherwise.
    pub fn with_dimensions(dimensions: usize) -> Self {
        RcbConfig {
            dimensions,
            ..Default::default()
        }
    }

    /// Build a configuration from `(name, value)` string pairs.
    ///
    /// Names are case insensitive. Recognised names are `IMBALANCE_TOL`,
    /// `MAX_ITERATIONS`, `DIMENSIONS`, `KEEP_HISTORY` and `CHECK_GEOMETRY`.
    /// Options not mentioned keep their default value.
    pub fn from_params(params: &[(&str, &str)]) -> RcbResult<Self> {
        let mut config = RcbConfig::default();

        for &(name, value) in params {
            let value = value.trim();
            match name.trim().to_ascii_uppercase().as_str() {
                "IMBALANCE_TOL" => config.imbalance_tol = parse_value(name, value)?,
                "MAX_ITERATIONS" => config.max_iterations = parse_value(name, value)?,
                "DIMENSIONS" => config.dimensions = parse_value(name, value)?,
                "KEEP_HISTORY" => config.keep_history = parse_flag(name, value)?,
                "CHECK_GEOMETRY" => config.check_geometry = parse_flag(name, value)?,
                _ => {
                    return Err(RcbError::Configuration(format!(
                        "unknown parameter '{}'",
                        name
                    )))
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that every option is in its admissible range.
    pub fn validate(&self) -> RcbResult<()> {
        if !(self.imbalance_tol >= 0.0 && self.imbalance_tol < 1.0) {
            return Err(RcbError::Configuration(format!(
                "imbalance tolerance {} is outside [0, 1)",
                self.imbalance_tol
            )));
        }

        if self.max_iterations == 0 {
            return Err(RcbError::Configuration(
                "maximum number of median iterations must be positive".to_string(),
            ));
        }

        if self.dimensions == 0 || self.dimensions > MAX_DIMENSIONS {
            return Err(RcbError::Configuration(format!(
                "dimensionality {} is outside the valid range 1-{}",
                self.dimensions, MAX_DIMENSIONS
            )));
        }

        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(name: &str, value: &str) -> RcbResult<T> {
    value.parse::<T>().map_err(|_| {
        RcbError::Configuration(format!("invalid value '{}' for parameter '{}'", value, name))
    })
}

fn parse_flag(name: &str, value: &str) -> RcbResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(RcbError::Configuration(format!(
            "invalid flag '{}' for parameter '{}'",
            value, name
        ))),
    }
}
