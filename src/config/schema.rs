//! Configuration schema definitions for xcfleet.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── RunConfig              - Core settings (plan, retries, batching, timeouts)
//! ├── NodeConfig[]           - One entry per remote macOS host
//! │   └── TargetPools        - Declared simulator / device / mac identifiers
//! └── ReportConfig           - Output and reporting settings
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Root configuration structure for xcfleet.
///
/// # TOML Structure
///
/// ```toml
/// [run]
/// xctestrun_path = "build/App.xctestrun"
/// rerun_limit = 1
/// bucket_size = 2
///
/// [[nodes]]
/// name = "mini-1"
/// host = "10.0.0.5"
/// username = "ci"
/// deployment_path = "/Users/ci/xcfleet"
///
/// [nodes.targets]
/// simulators = ["2B3A1A7E-0000-4E27-9C4B-3C4A1F0B9A11"]
///
/// [report]
/// junit = true
/// ```
///
/// # Example
///
/// ```
/// use xcfleet::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [run]
///     xctestrun_path = "App.xctestrun"
///
///     [[nodes]]
///     name = "mini-1"
///     host = "localhost"
///     username = "ci"
///     deployment_path = "/tmp/xcfleet"
///
///     [nodes.targets]
///     mac = ["00006000-000A1C2E0C38801E"]
/// "#).unwrap();
/// assert_eq!(config.nodes.len(), 1);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Core run settings.
    pub run: RunConfig,

    /// Remote hosts taking part in the run.
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    /// Report configuration for output generation (optional, has defaults).
    #[serde(default)]
    pub report: ReportConfig,
}

impl Config {
    /// Checks invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.run.bucket_size == 0 {
            bail!("run.bucket_size must be at least 1");
        }
        if self.run.poll_interval_secs == 0 {
            bail!("run.poll_interval_secs must be at least 1");
        }
        if self.nodes.is_empty() {
            bail!("at least one [[nodes]] entry is required");
        }
        for node in &self.nodes {
            if node.targets.is_empty() {
                bail!("node '{}' declares no targets", node.name);
            }
        }
        Ok(())
    }
}

/// Core run settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `output_dir` | `"results"` |
/// | `rerun_limit` | 1 |
/// | `bucket_size` | 1 |
/// | `execution_timeout_secs` | 300 |
/// | `poll_interval_secs` | 3 |
/// | `global_timeout_secs` | None (no deadline) |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// Path to the `.xctestrun` descriptor produced by `build-for-testing`.
    pub xctestrun_path: PathBuf,

    /// Local directory receiving result bundles and reports.
    ///
    /// Emptied at the start of every run.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Extra attempts granted to a test that did not pass.
    ///
    /// A test is re-queued while its attempt count is at most this value,
    /// so 0 disables retries entirely.
    #[serde(default = "default_rerun_limit")]
    pub rerun_limit: u32,

    /// Maximum number of tests handed to one target per batch.
    #[serde(default = "default_bucket_size")]
    pub bucket_size: usize,

    /// Per-batch timeout in seconds.
    ///
    /// Applied both to the remote test runner and, via the plan, to
    /// individual test execution allowances.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: u64,

    /// Interval between polls of a running batch's exit-status file.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Deadline for the whole run. The run is cancelled when it elapses.
    pub global_timeout_secs: Option<u64>,

    /// Script run on the coordinator before each batch.
    ///
    /// A non-zero exit status skips the batch.
    pub setup_script: Option<PathBuf>,

    /// Script run on the coordinator after each batch.
    pub teardown_script: Option<PathBuf>,

    /// Restrict the plan (and the runner) to one test configuration.
    pub only_test_configuration: Option<String>,

    /// Exclude one test configuration when running.
    pub skip_test_configuration: Option<String>,

    /// Newline-separated list of test identifiers to run instead of the
    /// identifiers enumerated from the plan.
    pub tests_path: Option<PathBuf>,

    /// Pass `--legacy` to `xcresulttool get` (required by Xcode 16+).
    #[serde(default)]
    pub xcresulttool_legacy: bool,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_rerun_limit() -> u32 {
    1
}

fn default_bucket_size() -> usize {
    1
}

fn default_execution_timeout() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    3
}

/// A remote macOS host and the execution targets it exposes.
///
/// Authentication is key based; the system `ssh` binary is used in batch
/// mode so password prompts are never answered.
///
/// # Example
///
/// ```toml
/// [[nodes]]
/// name = "mini-1"
/// host = "10.0.0.5"
/// port = 22
/// username = "ci"
/// private_key = "~/.ssh/id_ed25519"
/// deployment_path = "/Users/ci/xcfleet"
/// xcode_path = "/Applications/Xcode-15.4.app"
/// arch = "arm64"
/// env = { API_URL = "https://staging.example.com" }
///
/// [nodes.targets]
/// simulators = ["2B3A1A7E-0000-4E27-9C4B-3C4A1F0B9A11"]
/// devices = ["00008110-001A2C3E0C38801E"]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Human-readable node name used in logs.
    pub name: String,

    /// Hostname or IP address.
    pub host: String,

    /// SSH port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Login user.
    pub username: String,

    /// Private key for authentication. `~` is expanded.
    pub private_key: Option<PathBuf>,

    /// Working directory on the host. Emptied during deployment.
    pub deployment_path: String,

    /// Xcode installation used for `DEVELOPER_DIR`.
    #[serde(default = "default_xcode_path")]
    pub xcode_path: String,

    /// Architecture prefix for remote commands (`arch -<arch> ...`).
    pub arch: Option<String>,

    /// Verify host keys against `known_hosts`.
    #[serde(default)]
    pub strict_host_key_checking: bool,

    /// Environment variables injected into every test target of the plan.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Declared execution targets, grouped by kind.
    #[serde(default)]
    pub targets: TargetPools,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_xcode_path() -> String {
    "/Applications/Xcode.app".to_string()
}

/// Target identifiers declared by a node, one list per kind.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TargetPools {
    /// Simulator UDIDs.
    #[serde(default)]
    pub simulators: Vec<String>,

    /// Physical device UDIDs.
    #[serde(default)]
    pub devices: Vec<String>,

    /// Mac identifiers, for macOS test bundles run on the host itself.
    #[serde(default)]
    pub mac: Vec<String>,
}

impl TargetPools {
    /// Total number of declared targets.
    pub fn len(&self) -> usize {
        self.simulators.len() + self.devices.len() + self.mac.len()
    }

    /// Returns `true` if no target is declared.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Configuration for test result reporting.
///
/// Report files are written to `{run.output_dir}/final/`.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `junit` | `true` |
/// | `junit_file` | `"final_result.xml"` |
/// | `summary_file` | `"final_result.txt"` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Whether to generate a JUnit XML report.
    #[serde(default = "default_true")]
    pub junit: bool,

    /// Filename for the JUnit XML report.
    #[serde(default = "default_junit_file")]
    pub junit_file: String,

    /// Filename for the plain-text summary.
    #[serde(default = "default_summary_file")]
    pub summary_file: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            junit: true,
            junit_file: default_junit_file(),
            summary_file: default_summary_file(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_junit_file() -> String {
    "final_result.xml".to_string()
}

fn default_summary_file() -> String {
    "final_result.txt".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [run]
        xctestrun_path = "App.xctestrun"

        [[nodes]]
        name = "mini-1"
        host = "10.0.0.5"
        username = "ci"
        deployment_path = "/Users/ci/xcfleet"

        [nodes.targets]
        simulators = ["SIM-1", "SIM-2"]
    "#;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();

        assert_eq!(config.run.output_dir, PathBuf::from("results"));
        assert_eq!(config.run.rerun_limit, 1);
        assert_eq!(config.run.bucket_size, 1);
        assert_eq!(config.run.execution_timeout_secs, 300);
        assert_eq!(config.run.poll_interval_secs, 3);
        assert!(config.run.global_timeout_secs.is_none());

        let node = &config.nodes[0];
        assert_eq!(node.port, 22);
        assert_eq!(node.xcode_path, "/Applications/Xcode.app");
        assert!(!node.strict_host_key_checking);
        assert_eq!(node.targets.len(), 2);

        assert!(config.report.junit);
        assert_eq!(config.report.junit_file, "final_result.xml");
        assert_eq!(config.report.summary_file, "final_result.txt");
    }

    #[test]
    fn test_node_env_and_pools() {
        let config: Config = toml::from_str(
            r#"
            [run]
            xctestrun_path = "App.xctestrun"
            bucket_size = 4

            [[nodes]]
            name = "mini-2"
            host = "mini-2.local"
            username = "ci"
            deployment_path = "/tmp/xcfleet"
            arch = "x86_64"
            env = { API_URL = "https://staging", LOCALE = "en_US" }

            [nodes.targets]
            devices = ["DEV-1"]
            mac = ["MAC-1"]
            "#,
        )
        .unwrap();

        let node = &config.nodes[0];
        assert_eq!(node.arch.as_deref(), Some("x86_64"));
        assert_eq!(node.env.get("LOCALE").map(String::as_str), Some("en_US"));
        assert_eq!(node.targets.devices, vec!["DEV-1"]);
        assert_eq!(node.targets.mac, vec!["MAC-1"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_node() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.nodes[0].targets = TargetPools::default();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("mini-1"));
    }

    #[test]
    fn test_validate_rejects_zero_bucket() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.run.bucket_size = 0;
        assert!(config.validate().is_err());
    }
}
