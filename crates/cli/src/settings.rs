//! Configuration resolution
//!
//! Later sources win: built-in defaults, then the TOML file, then the
//! `DEBOUNCED_*` environment variables, then command-line flags.

use anyhow::{Context, Result};
use debounce_core::DebounceConfig;
use std::path::{Path, PathBuf};

/// Values given on the command line
#[derive(Debug, Default)]
pub struct Overrides {
    pub config_file: Option<PathBuf>,
    pub socket: Option<PathBuf>,
    pub timeout: Option<f64>,
}

/// Final configuration and the file it was read from, if any
#[derive(Debug)]
pub struct Resolved {
    pub config: DebounceConfig,
    pub source: Option<PathBuf>,
}

/// `<config dir>/debounced/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("debounced").join("config.toml"))
}

pub fn resolve<F>(overrides: &Overrides, lookup: F) -> Result<Resolved>
where
    F: Fn(&str) -> Option<String>,
{
    resolve_with(overrides, default_config_path().as_deref(), lookup)
}

fn resolve_with<F>(overrides: &Overrides, default_file: Option<&Path>, lookup: F) -> Result<Resolved>
where
    F: Fn(&str) -> Option<String>,
{
    // An explicit --config must exist; the default location is optional
    let (mut config, source) = match (&overrides.config_file, default_file) {
        (Some(path), _) => (DebounceConfig::load(path)?, Some(path.clone())),
        (None, Some(path)) if path.exists() => (DebounceConfig::load(path)?, Some(path.to_path_buf())),
        (None, _) => (DebounceConfig::default(), None),
    };

    config.apply_env(lookup)?;

    if let Some(socket) = &overrides.socket {
        config.socket_path = socket.clone();
    }
    if let Some(timeout) = overrides.timeout {
        config.wait_timeout_secs = timeout;
    }

    config.validate().context("Invalid debounced configuration")?;
    Ok(Resolved { config, source })
}
