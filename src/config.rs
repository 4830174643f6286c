//! Configuration loading and schema definitions for xcfleet.
//!
//! This module provides types and functions for loading xcfleet configuration
//! from TOML files or strings. The schema describes the test plan, the fleet
//! of remote hosts and their targets, and reporting.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads xcfleet configuration from a TOML file.
///
/// The file must be valid TOML, conform to the schema and pass
/// [`Config::validate`].
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema or is inconsistent
///
/// # Example
///
/// ```no_run
/// use xcfleet::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("xcfleet.toml"))?;
/// println!("Rerun limit: {}", config.run.rerun_limit);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config file: {}", path.display()))?;

    Ok(config)
}

/// Loads xcfleet configuration from a TOML string.
///
/// # Example
///
/// ```
/// use xcfleet::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [run]
///     xctestrun_path = "App.xctestrun"
///     rerun_limit = 2
///
///     [[nodes]]
///     name = "mini-1"
///     host = "localhost"
///     username = "ci"
///     deployment_path = "/tmp/xcfleet"
///
///     [nodes.targets]
///     simulators = ["SIM-1"]
/// "#)?;
///
/// assert_eq!(config.run.rerun_limit, 2);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;
    config.validate().context("Invalid config")?;

    Ok(config)
}
