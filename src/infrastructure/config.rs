//! Configuration file loading.
//!
//! Export settings can be kept in a TOML file; flags given on the command
//! line override it.

use std::fs;
use std::path::Path;

use crate::domain::{AppError, ExportConfig, Result};

/// Load export settings from a TOML file. Missing keys take their defaults.
///
/// # Errors
/// Returns error if file cannot be read or parsed.
pub fn load_config_from_file(path: &Path) -> Result<ExportConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| AppError::io(format!("read config file {}", path.display()), e))?;

    let config: ExportConfig = toml::from_str(&content).map_err(|e| AppError::Config {
        message: format!("parse config file {}: {e}", path.display()),
    })?;

    tracing::info!(path = %path.display(), "Loaded configuration");
    Ok(config)
}
