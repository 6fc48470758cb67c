//! Output and telemetry sections.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where and how results are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory for output files. Unset means next to each input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,

    /// Appended to the input stem for orchestrated files.
    /// Default: _orchestrated
    #[serde(default = "OutputConfig::default_suffix")]
    pub suffix: String,

    /// Write a side-by-side CSV next to each output.
    /// Default: false
    #[serde(default)]
    pub write_table: bool,

    /// Allowed onset/duration drift in ticks when verifying a round-trip.
    /// Default: 1
    #[serde(default = "OutputConfig::default_round_trip_tolerance")]
    pub round_trip_tolerance: u64,
}

impl OutputConfig {
    fn default_suffix() -> String {
        "_orchestrated".to_string()
    }

    fn default_round_trip_tolerance() -> u64 {
        1
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: None,
            suffix: Self::default_suffix(),
            write_table: false,
            round_trip_tolerance: Self::default_round_trip_tolerance(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Filter directive for the tracing subscriber (trace, debug, info, warn,
    /// error, or a full `EnvFilter` string).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}
