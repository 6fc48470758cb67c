//! Configuration loading for pianorch.
//!
//! The orchestration policy (layer thresholds, combo schedule and the
//! channel/instrument table) lives in config rather than in code, alongside
//! output and logging settings.
//!
//! # Usage
//!
//! ```rust,no_run
//! use orchconf::OrchConfig;
//!
//! let config = OrchConfig::load().expect("Failed to load config");
//! let table = config.orchestra_table();
//! println!("melody above pitch {}", table.layers.melody_above);
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins, tables merge key by key):
//! 1. `/etc/pianorch/config.toml` (system)
//! 2. `~/.config/pianorch/config.toml` (user)
//! 3. `./pianorch.toml` or the `--config` path
//! 4. Environment variables (`PIANORCH_*`, `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [layers]
//! melody_above = 60
//! rhythm_below = 50
//!
//! [schedule]
//! combo1_beats = 16
//! combo2_beats = 8
//!
//! [combos.combo2.melody]
//! channel = 4
//! name = "Oboe"
//! program = 68
//! low = 58
//! high = 91
//!
//! [output]
//! dir = "~/midi/orchestrated"
//! write_table = true
//!
//! [telemetry]
//! log_level = "debug"
//! ```

pub mod loader;
pub mod sections;

pub use loader::{discover_config_files, expand_home, ConfigSources};
pub use sections::{OutputConfig, TelemetryConfig};

use notematrix::{ComboSchedule, ComboTable, Layer, LayerThresholds, OrchestraTable};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete pianorch configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OrchConfig {
    #[serde(default)]
    pub layers: LayerThresholds,

    #[serde(default)]
    pub schedule: ComboSchedule,

    #[serde(default)]
    pub combos: ComboTable,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl OrchConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/pianorch/config.toml`
    /// 3. `~/.config/pianorch/config.toml`
    /// 4. `./pianorch.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with an explicit file replacing `./pianorch.toml`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let files = loader::discover_config_files(config_path);
        let (mut config, mut sources) = Self::from_files(&files)?;

        loader::apply_env_overrides(&mut config, &mut sources);
        config.validate()?;

        debug!(
            files = sources.files.len(),
            env_overrides = sources.env_overrides.len(),
            "configuration loaded"
        );
        Ok((config, sources))
    }

    /// Merge the given files over the compiled defaults, without consulting
    /// the environment.
    pub fn from_files(files: &[PathBuf]) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = Self::default_table()?;

        for path in files {
            let table = loader::load_table(path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path.clone());
        }

        let origin = sources
            .files
            .last()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("<defaults>"));
        let config = Self::from_table(merged, origin)?;

        Ok((config, sources))
    }

    /// Parse a single TOML document over the defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let mut merged = Self::default_table()?;
        loader::merge_tables(&mut merged, loader::parse_table(contents, Path::new("<string>"))?);
        let config = Self::from_table(merged, PathBuf::from("<string>"))?;
        config.validate()?;
        Ok(config)
    }

    fn from_table(merged: toml::Table, origin: PathBuf) -> Result<Self, ConfigError> {
        let mut config: OrchConfig =
            toml::Value::Table(merged)
                .try_into()
                .map_err(|e: toml::de::Error| ConfigError::Parse {
                    path: origin,
                    message: e.to_string(),
                })?;

        if let Some(dir) = &config.output.dir {
            config.output.dir = Some(expand_home(dir));
        }
        Ok(config)
    }

    fn default_table() -> Result<toml::Table, ConfigError> {
        match toml::Value::try_from(Self::default()) {
            Ok(toml::Value::Table(table)) => Ok(table),
            Ok(_) => Err(ConfigError::Invalid(
                "defaults did not serialize to a table".to_string(),
            )),
            Err(e) => Err(ConfigError::Invalid(e.to_string())),
        }
    }

    /// The orchestration policy handed to `notematrix::Orchestrator`.
    pub fn orchestra_table(&self) -> OrchestraTable {
        OrchestraTable {
            layers: self.layers,
            schedule: self.schedule,
            combos: self.combos.clone(),
        }
    }

    /// Reject tables the orchestrator would refuse.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.orchestra_table()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        // A GM name paired with another GM program is legal but probably a typo
        for combo in notematrix::Combo::ALL {
            for layer in Layer::ALL {
                let instrument = &self.combos.slot(combo, layer).instrument;
                if let Some(named) = notematrix::gm::program_by_name(&instrument.name) {
                    if named != instrument.program {
                        warn!(
                            slot = %format_args!("{combo}.{layer}"),
                            name = %instrument.name,
                            program = instrument.program,
                            gm_program = named,
                            "instrument name does not match its program"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        // Built by hand for stable section order and comments
        let mut output = String::new();

        output.push_str("# pianorch configuration\n\n");

        output.push_str("[layers]\n");
        let _ = writeln!(output, "melody_above = {}", self.layers.melody_above);
        let _ = writeln!(output, "rhythm_below = {}", self.layers.rhythm_below);

        output.push_str("\n[schedule]\n");
        let _ = writeln!(output, "combo1_beats = {}", self.schedule.combo1_beats);
        let _ = writeln!(output, "combo2_beats = {}", self.schedule.combo2_beats);

        for combo in notematrix::Combo::ALL {
            for layer in Layer::ALL {
                let slot = self.combos.slot(combo, layer);
                let _ = writeln!(output, "\n[combos.{combo}.{layer}]");
                let _ = writeln!(output, "channel = {}", slot.channel);
                let _ = writeln!(output, "name = {}", toml::Value::from(slot.instrument.name.as_str()));
                let _ = writeln!(
                    output,
                    "program = {}  # {}",
                    slot.instrument.program,
                    notematrix::gm::program_name(slot.instrument.program)
                );
                let _ = writeln!(output, "low = {}", slot.instrument.low);
                let _ = writeln!(output, "high = {}", slot.instrument.high);
            }
        }

        output.push_str("\n[output]\n");
        if let Some(dir) = &self.output.dir {
            let _ = writeln!(
                output,
                "dir = {}",
                toml::Value::from(dir.to_string_lossy().as_ref())
            );
        }
        let _ = writeln!(output, "suffix = {}", toml::Value::from(self.output.suffix.as_str()));
        let _ = writeln!(output, "write_table = {}", self.output.write_table);
        let _ = writeln!(
            output,
            "round_trip_tolerance = {}",
            self.output.round_trip_tolerance
        );

        output.push_str("\n[telemetry]\n");
        let _ = writeln!(
            output,
            "log_level = {}",
            toml::Value::from(self.telemetry.log_level.as_str())
        );

        output
    }
}
