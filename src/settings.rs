//! Engine settings and logging setup

use crate::error::Error;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding `parallelism`
pub const PARALLELISM_ENV: &str = "TERRACE_PARALLELISM";
/// Environment variable overriding `log_level`
pub const LOG_ENV: &str = "TERRACE_LOG";

/// Get the settings directory path
pub fn settings_dir() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("Could not determine config directory")?;
    Ok(dir.join("terrace"))
}

/// Tunables for walks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Maximum number of nodes visited at once
    pub parallelism: usize,
    /// Hand every confirmed mutation to the state store
    pub persist_state: bool,
    /// `env_logger` filter, e.g. `debug` or `terrace=trace`
    pub log_level: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            parallelism: 10,
            persist_state: true,
            log_level: None,
        }
    }
}

impl EngineSettings {
    /// Load settings from `path`, or defaults when the file doesn't exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("Settings file {} does not exist, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let settings: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid settings file {}", path.display()))?;
        Ok(settings)
    }

    /// Load `settings.toml` from the settings directory, then apply
    /// environment overrides
    pub fn load() -> std::result::Result<Self, Error> {
        let path = settings_dir().map_err(Error::Settings)?.join("settings.toml");
        let settings = Self::load_from(&path).map_err(Error::Settings)?;
        settings
            .apply_env_with(|key| std::env::var(key).ok())
            .map_err(Error::Settings)
    }

    /// Apply overrides from a variable lookup
    pub fn apply_env_with(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(raw) = lookup(PARALLELISM_ENV) {
            self.parallelism = raw
                .trim()
                .parse()
                .with_context(|| format!("{PARALLELISM_ENV} must be a number, got {raw:?}"))?;
        }
        if let Some(level) = lookup(LOG_ENV).filter(|l| !l.trim().is_empty()) {
            self.log_level = Some(level);
        }
        Ok(self)
    }

    /// Effective parallelism, never below one
    pub fn parallelism(&self) -> usize {
        self.parallelism.max(1)
    }
}

/// Initialise `env_logger` with the given filter (warnings only when unset)
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging(level: Option<&str>) {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(log::LevelFilter::Warn)
        .format_timestamp(None);
    if let Some(level) = level {
        builder.parse_filters(level);
    }
    let _ = builder.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.parallelism, 10);
        assert!(settings.persist_state);
        assert_eq!(settings.log_level, None);
    }

    #[test]
    fn test_load_from_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = EngineSettings::load_from(&dir.path().join("settings.toml")).unwrap();
        assert_eq!(settings, EngineSettings::default());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "parallelism = 3\nlog_level = \"debug\"\n").unwrap();

        let settings = EngineSettings::load_from(&path).unwrap();
        assert_eq!(settings.parallelism, 3);
        assert!(settings.persist_state);
        assert_eq!(settings.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "parallelism = \"many\"").unwrap();
        assert!(EngineSettings::load_from(&path).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [(PARALLELISM_ENV, " 4 "), (LOG_ENV, "trace")].into();
        let settings = EngineSettings::default()
            .apply_env_with(|k| env.get(k).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(settings.parallelism, 4);
        assert_eq!(settings.log_level.as_deref(), Some("trace"));

        let bad = EngineSettings::default().apply_env_with(|k| {
            (k == PARALLELISM_ENV).then(|| "lots".to_string())
        });
        assert!(bad.is_err());
    }

    #[test]
    fn test_parallelism_floor() {
        let settings = EngineSettings {
            parallelism: 0,
            ..EngineSettings::default()
        };
        assert_eq!(settings.parallelism(), 1);
    }
}
