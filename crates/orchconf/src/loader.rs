//! Config file discovery, table merging, and environment variable overlay.

use crate::{ConfigError, OrchConfig};
use std::env;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Config files in load order: system, user, then `cli_path` or the local
/// `./pianorch.toml`.
///
/// Standard locations are returned only when they exist. A missing
/// `cli_path` is still returned so loading reports it.
pub fn discover_config_files(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/pianorch/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("pianorch/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        files.push(path.to_path_buf());
        return files;
    }

    let local = PathBuf::from("pianorch.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file into a raw table.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_table(&contents, path)
}

pub(crate) fn parse_table(contents: &str, path: &Path) -> Result<toml::Table, ConfigError> {
    contents
        .parse()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Recursively merge `overlay` into `base`. Tables merge key by key, any
/// other value replaces what was there.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut OrchConfig, sources: &mut ConfigSources) {
    apply_overrides_from(config, sources, |name| env::var(name).ok());
}

/// Apply overrides read through `lookup`, so tests need not touch the
/// process environment.
pub fn apply_overrides_from<F>(config: &mut OrchConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(beats) = parse_var(&lookup, "PIANORCH_COMBO1_BEATS", sources) {
        config.schedule.combo1_beats = beats;
    }
    if let Some(beats) = parse_var(&lookup, "PIANORCH_COMBO2_BEATS", sources) {
        config.schedule.combo2_beats = beats;
    }
    if let Some(pitch) = parse_var(&lookup, "PIANORCH_MELODY_ABOVE", sources) {
        config.layers.melody_above = pitch;
    }
    if let Some(pitch) = parse_var(&lookup, "PIANORCH_RHYTHM_BELOW", sources) {
        config.layers.rhythm_below = pitch;
    }
    if let Some(dir) = lookup("PIANORCH_OUTPUT_DIR") {
        config.output.dir = Some(expand_home(Path::new(&dir)));
        sources.env_overrides.push("PIANORCH_OUTPUT_DIR".to_string());
    }

    if let Some(level) = lookup("PIANORCH_LOG_LEVEL") {
        config.telemetry.log_level = level;
        sources.env_overrides.push("PIANORCH_LOG_LEVEL".to_string());
    }
    // RUST_LOG beats everything
    if let Some(level) = lookup("RUST_LOG") {
        config.telemetry.log_level = level;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, sources: &mut ConfigSources) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => {
            sources.env_overrides.push(name.to_string());
            Some(value)
        }
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring unparsable override");
            None
        }
    }
}

/// Resolve a leading `~` component against the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), directories::BaseDirs::new()) {
        (Ok(rest), Some(dirs)) => dirs.home_dir().join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_expand_home_tilde() {
        let expanded = expand_home(Path::new("~/midi/out"));
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.ends_with("midi/out"));
    }

    #[test]
    fn test_expand_home_leaves_other_paths() {
        assert_eq!(expand_home(Path::new("/srv/midi")), PathBuf::from("/srv/midi"));
        assert_eq!(expand_home(Path::new("out")), PathBuf::from("out"));
        // another user's home is not ours
        assert_eq!(expand_home(Path::new("~bob/out")), PathBuf::from("~bob/out"));
    }

    #[test]
    fn test_discover_keeps_cli_path() {
        let files = discover_config_files(Some(Path::new("/nonexistent/p.toml")));
        assert_eq!(files.last(), Some(&PathBuf::from("/nonexistent/p.toml")));
    }

    #[test]
    fn test_merge_tables_is_deep() {
        let mut base: toml::Table = r#"
[schedule]
combo1_beats = 16
combo2_beats = 8

[combos.combo1.melody]
channel = 1
name = "Violin"
"#
        .parse()
        .unwrap();
        let overlay: toml::Table = r#"
[schedule]
combo2_beats = 4

[combos.combo1.melody]
name = "Viola"
"#
        .parse()
        .unwrap();

        merge_tables(&mut base, overlay);

        assert_eq!(base["schedule"]["combo1_beats"].as_integer(), Some(16));
        assert_eq!(base["schedule"]["combo2_beats"].as_integer(), Some(4));
        assert_eq!(base["combos"]["combo1"]["melody"]["channel"].as_integer(), Some(1));
        assert_eq!(base["combos"]["combo1"]["melody"]["name"].as_str(), Some("Viola"));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PIANORCH_COMBO1_BEATS", "12"),
            ("PIANORCH_MELODY_ABOVE", " 64 "),
            ("PIANORCH_RHYTHM_BELOW", "low"),
            ("PIANORCH_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = OrchConfig::default();
        let mut sources = ConfigSources::default();
        apply_overrides_from(&mut config, &mut sources, |name| {
            vars.get(name).map(|v| v.to_string())
        });

        assert_eq!(config.schedule.combo1_beats, 12);
        assert_eq!(config.schedule.combo2_beats, 8);
        assert_eq!(config.layers.melody_above, 64);
        // unparsable value ignored
        assert_eq!(config.layers.rhythm_below, 50);
        assert_eq!(config.telemetry.log_level, "debug");
        assert_eq!(
            sources.env_overrides,
            vec![
                "PIANORCH_COMBO1_BEATS",
                "PIANORCH_MELODY_ABOVE",
                "PIANORCH_LOG_LEVEL"
            ]
        );
    }

    #[test]
    fn test_rust_log_wins() {
        let mut config = OrchConfig::default();
        let mut sources = ConfigSources::default();
        apply_overrides_from(&mut config, &mut sources, |name| match name {
            "PIANORCH_LOG_LEVEL" => Some("warn".to_string()),
            "RUST_LOG" => Some("notematrix=trace".to_string()),
            _ => None,
        });
        assert_eq!(config.telemetry.log_level, "notematrix=trace");
    }

    #[test]
    fn test_parse_error_names_file() {
        let err = parse_table("[schedule\ncombo1_beats = 1", Path::new("bad.toml")).unwrap_err();
        match err {
            ConfigError::Parse { path, .. } => assert_eq!(path, PathBuf::from("bad.toml")),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
