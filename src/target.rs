//! Execution targets: simulators, devices and Macs that run test batches.
//!
//! A target runs one batch at a time on one node. Every variant shares the
//! same protocol:
//!
//! ```text
//!   idle ──► ready() ──► run(batch) ──► ran ───────────────► run(next batch)
//!                              │
//!                              ├─► Execution error ──► reset() ──► run(next batch)
//!                              │
//!                              └─► Skipped (setup hook veto) ──► run(next batch)
//! ```
//!
//! The batch itself is executed by [`runner::BatchRunner`], which launches
//! `xcodebuild` detached on the node and polls a status file for its exit
//! code.
//!
//! # Exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | `0` | Batch ran, all tests passed |
//! | `65` | Batch ran, some tests failed |
//! | `143` | Batch timed out and was terminated |
//! | other | Runner failed before producing a result |

pub mod device;
pub mod runner;
pub mod simulator;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{NodeConfig, RunConfig};
use crate::transport::{Command, Session, TransportError, TransportResult};

pub use device::Device;
pub use runner::BatchRunner;
pub use simulator::Simulator;

/// Runner exit code for a batch whose tests all passed.
pub const EXIT_PASSED: i32 = 0;

/// Runner exit code for a batch with failing tests.
pub const EXIT_TESTS_FAILED: i32 = 65;

/// Exit code reported when a batch exceeds its timeout.
pub const EXIT_TIMEOUT: i32 = 143;

/// Consecutive execution errors a target tolerates before it stops.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 2;

/// Result type for target operations.
pub type TargetResult<T> = Result<T, TargetError>;

/// Ways a batch can end without producing a result.
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    /// The batch was empty; the caller should stop requesting work.
    #[error("No tests for execution")]
    NoTestsForExecution,

    /// The runner failed or timed out.
    #[error("Execution error: {description}")]
    Execution {
        description: String,
        tests: Vec<String>,
    },

    /// The setup hook vetoed the batch.
    #[error("Batch skipped by setup hook")]
    Skipped,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// The kind of environment a target provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Simulator,
    Device,
    Mac,
}

impl TargetKind {
    /// Platform name used in `xcodebuild -destination`.
    pub fn destination_platform(self) -> &'static str {
        match self {
            TargetKind::Simulator => "iOS Simulator",
            TargetKind::Device => "iOS",
            TargetKind::Mac => "macOS",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TargetKind::Simulator => "simulator",
            TargetKind::Device => "device",
            TargetKind::Mac => "mac",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution target on one node.
///
/// Each target owns its session; nothing about a target is shared with
/// other tasks.
#[async_trait]
pub trait Target: Send + Sync {
    /// What kind of target this is.
    fn kind(&self) -> TargetKind;

    /// Target identifier (simulator or device UDID).
    fn udid(&self) -> &str;

    /// Prepares the target, returning `false` if it cannot take work.
    async fn ready(&self) -> bool;

    /// Runs one batch, returning the tests that ran.
    ///
    /// # Errors
    ///
    /// - [`TargetError::NoTestsForExecution`] - `tests` is empty
    /// - [`TargetError::Skipped`] - the setup hook vetoed the batch
    /// - [`TargetError::Execution`] - the runner failed or timed out
    async fn run(&self, tests: &[String]) -> TargetResult<Vec<String>>;

    /// Returns the target to a clean state.
    async fn reset(&self) -> TargetResult<()>;

    /// Uninstalls an app. Failures are ignored.
    async fn delete_app(&self, bundle_id: &str);

    /// Downloads the newest result bundle of this target, zipped, into
    /// `local_dir`, and removes it from the node.
    async fn fetch_results(&self, local_dir: &Path) -> TransportResult<PathBuf>;
}

/// Per-batch settings shared by every target of a node.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// Node name, for logs and hooks.
    pub node: String,
    /// Node host, for hooks.
    pub host: String,
    /// Working directory on the node.
    pub deployment_path: String,
    /// Xcode installation for `DEVELOPER_DIR`.
    pub xcode_path: String,
    /// Path of the test plan on the node.
    pub xctestrun_path: String,
    pub only_test_configuration: Option<String>,
    pub skip_test_configuration: Option<String>,
    /// Per-batch timeout in seconds.
    pub execution_timeout_secs: u64,
    /// Status file polling interval in seconds.
    pub poll_interval_secs: u64,
}

impl BatchSettings {
    /// Builds settings for `node`, with the plan uploaded as `plan_file`
    /// into its deployment path.
    pub fn new(node: &NodeConfig, run: &RunConfig, plan_file: &str) -> Self {
        let deployment_path = node.deployment_path.trim_end_matches('/').to_string();
        Self {
            node: node.name.clone(),
            host: node.host.clone(),
            xctestrun_path: format!("{}/{}", deployment_path, plan_file),
            deployment_path,
            xcode_path: node.xcode_path.clone(),
            only_test_configuration: run.only_test_configuration.clone(),
            skip_test_configuration: run.skip_test_configuration.clone(),
            execution_timeout_secs: run.execution_timeout_secs,
            poll_interval_secs: run.poll_interval_secs,
        }
    }

    /// `DEVELOPER_DIR` value for this node.
    pub fn developer_dir(&self) -> String {
        format!("{}/Contents/Developer", self.xcode_path.trim_end_matches('/'))
    }
}

/// Pre- and post-batch scripts run on the coordinator host.
pub struct Hooks {
    local: Arc<dyn Session>,
    setup: Option<PathBuf>,
    teardown: Option<PathBuf>,
}

/// Which hook to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Setup,
    Teardown,
}

/// Identity of the batch a hook runs for.
pub struct HookContext<'a> {
    pub node: &'a str,
    pub host: &'a str,
    pub target: &'a str,
    pub kind: TargetKind,
    pub tests: &'a [String],
}

impl Hooks {
    pub fn new(local: Arc<dyn Session>, setup: Option<PathBuf>, teardown: Option<PathBuf>) -> Self {
        Self {
            local,
            setup,
            teardown,
        }
    }

    /// Builds hooks from the run configuration.
    pub fn from_config(local: Arc<dyn Session>, run: &RunConfig) -> Self {
        Self::new(local, run.setup_script.clone(), run.teardown_script.clone())
    }

    fn command(script: &Path, ctx: &HookContext<'_>) -> Command {
        Command::new(script.to_string_lossy())
            .env("XCFLEET_NODE", ctx.node)
            .env("XCFLEET_HOST", ctx.host)
            .env("XCFLEET_TARGET", ctx.target)
            .env("XCFLEET_TARGET_KIND", ctx.kind.as_str())
            .env("XCFLEET_TESTS", ctx.tests.join(" "))
    }

    /// Runs the hook for `phase`, returning `true` if it is absent or
    /// succeeded.
    pub async fn run(&self, phase: HookPhase, ctx: &HookContext<'_>) -> bool {
        let script = match phase {
            HookPhase::Setup => self.setup.as_deref(),
            HookPhase::Teardown => self.teardown.as_deref(),
        };
        let Some(script) = script else {
            return true;
        };

        match self.local.exec(&Self::command(script, ctx)).await {
            Ok(result) if result.success() => true,
            Ok(result) => {
                tracing::warn!(
                    "[{}] {}: {:?} hook exited with status {}: {}",
                    ctx.node,
                    ctx.target,
                    phase,
                    result.exit_code,
                    result.stderr.trim()
                );
                false
            }
            Err(e) => {
                tracing::warn!("[{}] {}: {:?} hook failed: {}", ctx.node, ctx.target, phase, e);
                false
            }
        }
    }
}

/// Bounded recovery budget of one target.
///
/// Counts consecutive execution errors; a batch that runs resets the count.
#[derive(Debug, Clone)]
pub struct FailureBudget {
    limit: u32,
    consecutive: u32,
}

impl FailureBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            consecutive: 0,
        }
    }

    /// Records an execution error; returns `true` once the budget is spent.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        self.is_exhausted()
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn is_exhausted(&self) -> bool {
        self.consecutive > self.limit
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

impl Default for FailureBudget {
    fn default() -> Self {
        Self::new(MAX_CONSECUTIVE_FAILURES)
    }
}

/// Creates a target of `kind` over its own session.
pub fn create_target<S: Session + 'static>(
    kind: TargetKind,
    udid: &str,
    session: S,
    settings: Arc<BatchSettings>,
    hooks: Option<Arc<Hooks>>,
) -> Box<dyn Target> {
    let runner = BatchRunner::new(session, kind, udid, settings, hooks);
    match kind {
        TargetKind::Simulator => Box::new(Simulator::new(runner)),
        TargetKind::Device | TargetKind::Mac => Box::new(Device::new(runner)),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, load_config_str};
    use crate::transport::testing::MockSession;

    fn config() -> Config {
        load_config_str(
            r#"
            [run]
            xctestrun_path = "build/App.xctestrun"
            only_test_configuration = "Debug"

            [[nodes]]
            name = "mini-1"
            host = "10.0.0.5"
            username = "ci"
            deployment_path = "/Users/ci/xcfleet/"
            xcode_path = "/Applications/Xcode-15.app"

            [nodes.targets]
            simulators = ["SIM-1"]
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_batch_settings_from_config() {
        let config = config();
        let settings = BatchSettings::new(&config.nodes[0], &config.run, "App.xctestrun");

        assert_eq!(settings.deployment_path, "/Users/ci/xcfleet");
        assert_eq!(settings.xctestrun_path, "/Users/ci/xcfleet/App.xctestrun");
        assert_eq!(settings.developer_dir(), "/Applications/Xcode-15.app/Contents/Developer");
        assert_eq!(settings.only_test_configuration.as_deref(), Some("Debug"));
        assert_eq!(settings.execution_timeout_secs, 300);
    }

    #[test]
    fn test_failure_budget() {
        let mut budget = FailureBudget::default();
        assert!(!budget.record_failure());
        assert!(!budget.record_failure());
        budget.record_success();
        assert_eq!(budget.consecutive(), 0);

        assert!(!budget.record_failure());
        assert!(!budget.record_failure());
        assert!(budget.record_failure());
        assert!(budget.is_exhausted());
    }

    #[test]
    fn test_kind_platforms() {
        assert_eq!(TargetKind::Simulator.destination_platform(), "iOS Simulator");
        assert_eq!(TargetKind::Device.destination_platform(), "iOS");
        assert_eq!(TargetKind::Mac.to_string(), "mac");
    }

    #[tokio::test]
    async fn test_hooks_export_batch_identity() {
        let local = MockSession::new().on("pre.sh", 0, "");
        let hooks = Hooks::new(Arc::new(local.clone()), Some("/ci/pre.sh".into()), None);
        let tests = vec!["App/A/t1()".to_string(), "App/A/t2()".to_string()];
        let ctx = HookContext {
            node: "mini-1",
            host: "10.0.0.5",
            target: "SIM-1",
            kind: TargetKind::Simulator,
            tests: &tests,
        };

        assert!(hooks.run(HookPhase::Setup, &ctx).await);
        assert!(hooks.run(HookPhase::Teardown, &ctx).await);

        let commands = local.commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].contains("export XCFLEET_TARGET=SIM-1;"));
        assert!(commands[0].contains("export XCFLEET_TESTS='App/A/t1() App/A/t2()';"));
        assert!(commands[0].ends_with("/ci/pre.sh"));
    }

    #[tokio::test]
    async fn test_failing_setup_hook_reports_false() {
        let local = MockSession::new().on("pre.sh", 3, "");
        let hooks = Hooks::new(Arc::new(local), Some("/ci/pre.sh".into()), None);
        let ctx = HookContext {
            node: "n",
            host: "h",
            target: "t",
            kind: TargetKind::Device,
            tests: &[],
        };
        assert!(!hooks.run(HookPhase::Setup, &ctx).await);
    }
}
