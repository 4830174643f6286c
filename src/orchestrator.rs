//! Run coordination across nodes.
//!
//! The orchestrator owns the [`Ledger`] and drives one
//! [`NodeSupervisor`](node::NodeSupervisor) per configured node. Targets
//! on every node pull batches from the shared ledger until it runs dry.
//!
//! # Architecture
//!
//! ```text
//!   tests ──► Ledger (shuffled)
//!                 ▲  │ next_batch / record_outcome
//!                 │  ▼
//!   ┌─────────────┴───────────────┬─────────────────────────┐
//!   │ NodeSupervisor (mini-1)     │ NodeSupervisor (mini-2) │  ...
//!   │   target ─► target ─► ...   │   target ─► ...         │
//!   └─────────────┬───────────────┴────────────┬────────────┘
//!                 │ result bundles             │
//!                 ▼                            ▼
//!            xcresulttool merge ──► final/final_result.xcresult
//!                 │
//!                 ▼
//!             Reporter (console, JUnit, summary)
//! ```
//!
//! # Execution Flow
//!
//! 1. **Packaging**: zip the plan's dependent files into `build.zip`
//! 2. **Ledger**: register every test, shuffled
//! 3. **Nodes**: deploy and run all nodes concurrently
//! 4. **Merge**: combine collected result bundles
//! 5. **Reporting**: notify reporters with the final ledger state
//!
//! A global timeout or an external cancellation abandons in-flight work;
//! the ledger state at that moment is reported.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use tokio_util::sync::CancellationToken;
//! use xcfleet::config::load_config;
//! use xcfleet::orchestrator::Orchestrator;
//! use xcfleet::plan::XcTestRun;
//! use xcfleet::report::ConsoleReporter;
//! use xcfleet::transport::local::LocalSession;
//! use xcfleet::transport::ssh::SshTransport;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(Path::new("xcfleet.toml"))?;
//!     let plan = XcTestRun::load(&LocalSession::new(), &config.run.xctestrun_path, None).await?;
//!     let tests = vec!["AppTests/LoginTests/testValid()".to_string()];
//!
//!     let orchestrator = Orchestrator::new(config, SshTransport::new(), ConsoleReporter::new(false));
//!     let result = orchestrator.run(tests, &plan, CancellationToken::new()).await?;
//!
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod artifact;
pub mod node;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::ledger::{Ledger, TestCase, TestState};
use crate::plan::XcTestRun;
use crate::report::Reporter;
use crate::target::Hooks;
use crate::transport::local::LocalSession;
use crate::transport::{Command, Session, Transport};
use crate::xcresult::{ObjectSource, XcResultTool};

pub use artifact::FINAL_DIR;
pub use node::{BUILD_ARCHIVE, NodeReport, NodeSupervisor, RunContext};

/// File name of the merged result bundle under `<output>/final`.
pub const MERGED_BUNDLE: &str = "final_result.xcresult";

/// Aggregated results of an entire run.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Every test passed |
/// | 1 | Some test failed, was never executed, or the run was cancelled |
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Number of tests in the run.
    pub total: usize,

    /// Tests whose last attempt passed.
    pub passed: usize,

    /// Tests whose last attempt failed.
    pub failed: usize,

    /// Tests that never produced a result.
    pub unexecuted: usize,

    /// Extra attempts across all tests.
    pub reran: usize,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// Wall-clock duration of the run.
    pub duration: Duration,

    /// Final state of every test, sorted by identifier.
    pub tests: Vec<TestCase>,

    /// Whether the run was cut short by a timeout or signal.
    pub cancelled: bool,

    /// Result bundles collected from all nodes.
    pub bundles: Vec<PathBuf>,

    /// The merged result bundle, if merging succeeded.
    pub merged: Option<PathBuf>,
}

impl RunResult {
    /// Builds a result from final test states.
    ///
    /// ```
    /// use std::time::Duration;
    /// use xcfleet::ledger::{TestCase, TestState};
    /// use xcfleet::orchestrator::RunResult;
    ///
    /// let mut flaky = TestCase::new("AppTests/A/testFlaky()");
    /// flaky.state = TestState::Pass;
    /// flaky.attempts = 2;
    ///
    /// let result = RunResult::new(vec![flaky], Duration::from_secs(60));
    /// assert_eq!(result.reran, 1);
    /// assert!(result.success());
    /// ```
    pub fn new(mut tests: Vec<TestCase>, duration: Duration) -> Self {
        tests.sort_by(|a, b| a.id.cmp(&b.id));
        let count = |state: TestState| tests.iter().filter(|t| t.state == state).count();
        Self {
            total: tests.len(),
            passed: count(TestState::Pass),
            failed: count(TestState::Failed),
            unexecuted: count(TestState::Unexecuted),
            reran: tests
                .iter()
                .map(|t| t.attempts.saturating_sub(1) as usize)
                .sum(),
            started_at: Utc::now(),
            duration,
            tests,
            cancelled: false,
            bundles: Vec::new(),
            merged: None,
        }
    }

    /// Returns `true` if every test passed and the run was not cut short.
    pub fn success(&self) -> bool {
        self.failed == 0 && self.unexecuted == 0 && !self.cancelled
    }

    /// Returns an appropriate process exit code for this result.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

/// The main orchestrator that coordinates a distributed run.
///
/// # Type Parameters
///
/// - `T`: The transport used to reach nodes
/// - `R`: The reporter type
pub struct Orchestrator<T, R> {
    config: Config,
    transport: T,
    reporter: R,
    local: Arc<dyn Session>,
    source: Arc<dyn ObjectSource>,
}

impl<T, R> Orchestrator<T, R>
where
    T: Transport,
    R: Reporter,
{
    /// Creates an orchestrator that runs local work as child processes.
    pub fn new(config: Config, transport: T, reporter: R) -> Self {
        let local: Arc<dyn Session> = Arc::new(LocalSession::new());
        let source = Arc::new(XcResultTool::new(
            Arc::clone(&local),
            config.run.xcresulttool_legacy,
        ));
        Self {
            config,
            transport,
            reporter,
            local,
            source,
        }
    }

    /// Replaces the coordinator-host session.
    pub fn with_local(mut self, local: Arc<dyn Session>) -> Self {
        self.local = local;
        self
    }

    /// Replaces the source result bundles are decoded from.
    pub fn with_source(mut self, source: Arc<dyn ObjectSource>) -> Self {
        self.source = source;
        self
    }

    /// Runs `tests` across every configured node.
    ///
    /// # Errors
    ///
    /// Returns an error only if the run cannot start: the output directory
    /// cannot be created or the build cannot be packaged. Node failures
    /// degrade to unexecuted tests.
    pub async fn run(
        &self,
        tests: Vec<String>,
        plan: &XcTestRun,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunResult> {
        let start = std::time::Instant::now();
        let started_at = Utc::now();
        let run = &self.config.run;

        // Clear output directory to avoid stale results
        let output_dir = &run.output_dir;
        if output_dir.exists() {
            std::fs::remove_dir_all(output_dir).ok();
        }
        let final_dir = output_dir.join(FINAL_DIR);
        tokio::fs::create_dir_all(&final_dir)
            .await
            .with_context(|| format!("Failed to create {}", final_dir.display()))?;

        let ledger = Ledger::new(tests.into_iter().map(TestCase::new).collect(), run.rerun_limit);
        if ledger.is_empty() {
            warn!("No tests to run");
            let mut result = RunResult::new(Vec::new(), start.elapsed());
            result.started_at = started_at;
            self.reporter.on_run_complete(&result).await;
            return Ok(result);
        }

        let build = self.package(plan).await?;
        info!(
            "Scheduling {} tests on {} node(s), rerun limit {}",
            ledger.len(),
            self.config.nodes.len(),
            run.rerun_limit
        );
        self.reporter.on_run_start(&ledger.snapshot()).await;

        let ctx = RunContext {
            run,
            transport: &self.transport,
            ledger: &ledger,
            reporter: &self.reporter,
            local: &self.local,
            source: self.source.as_ref(),
            hooks: Some(Arc::new(Hooks::from_config(Arc::clone(&self.local), run))),
            build: &build,
            plan,
        };
        let nodes = join_all(
            self.config
                .nodes
                .iter()
                .map(|node| NodeSupervisor::new(node, &ctx).run()),
        );
        let deadline = async {
            match run.global_timeout_secs {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => std::future::pending().await,
            }
        };

        let (reports, cancelled) = tokio::select! {
            reports = nodes => (reports, false),
            _ = cancel.cancelled() => {
                warn!("Run cancelled, abandoning in-flight batches");
                (Vec::new(), true)
            }
            _ = deadline => {
                error!(
                    "Global timeout of {}s reached, abandoning in-flight batches",
                    run.global_timeout_secs.unwrap_or_default()
                );
                (Vec::new(), true)
            }
        };

        if !cancelled && !ledger.is_complete() {
            warn!(
                "No target left to run {} retried test(s); {} dispensed test(s) never reported",
                ledger.pending_retries(),
                ledger.in_flight()
            );
        }

        let bundles: Vec<PathBuf> = reports.into_iter().flat_map(|r| r.bundles).collect();
        let merged = self.merge(&bundles).await;

        let mut result = RunResult::new(ledger.snapshot(), start.elapsed());
        result.started_at = started_at;
        result.cancelled = cancelled;
        result.bundles = bundles;
        result.merged = merged;

        self.reporter.on_run_complete(&result).await;

        Ok(result)
    }

    /// Zips the plan's dependent files into `<output>/build.zip`.
    async fn package(&self, plan: &XcTestRun) -> anyhow::Result<PathBuf> {
        let archive = std::path::absolute(self.config.run.output_dir.join(BUILD_ARCHIVE))
            .context("Failed to resolve output directory")?;
        let files = plan.dependent_files();
        if files.is_empty() {
            bail!("Test plan {} references no files", plan.file_name());
        }

        info!("Packaging {} file(s) from {}", files.len(), plan.test_root().display());
        let cmd = Command::new("zip")
            .args(["-r", "-X", "-q", "-0"])
            .arg(archive.to_string_lossy())
            .args(files)
            .working_dir(plan.test_root().to_string_lossy());
        let result = self.local.exec(&cmd).await?;
        if !result.success() {
            bail!("Failed to package build: {}", result.stderr.trim());
        }
        Ok(archive)
    }

    /// Merges collected bundles into `final/final_result.xcresult`.
    async fn merge(&self, bundles: &[PathBuf]) -> Option<PathBuf> {
        if bundles.is_empty() {
            return None;
        }
        let merged = self.config.run.output_dir.join(FINAL_DIR).join(MERGED_BUNDLE);
        let tool = XcResultTool::new(Arc::clone(&self.local), self.config.run.xcresulttool_legacy);
        match tool.merge(bundles, &merged).await {
            Ok(()) => {
                info!("Merged {} result bundle(s) into {}", bundles.len(), merged.display());
                Some(merged)
            }
            Err(e) => {
                warn!("Failed to merge result bundles: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::artifact::testing::FakeLocal;
    use super::*;
    use crate::config::load_config_str;
    use crate::transport::testing::{MockSession, MockTransport};
    use crate::xcresult::testing::{bundle, leaf};

    #[derive(Default)]
    struct Completions(Mutex<Vec<RunResult>>);

    #[async_trait]
    impl Reporter for Arc<Completions> {
        async fn on_run_start(&self, _tests: &[TestCase]) {}
        async fn on_test_complete(&self, _test: &TestCase, _requeued: bool) {}
        async fn on_node_complete(&self, _node: &str) {}
        async fn on_run_complete(&self, result: &RunResult) {
            self.0.lock().unwrap().push(result.clone());
        }
    }

    fn config(output: &Path, extra: &str) -> Config {
        load_config_str(&format!(
            r#"
[run]
xctestrun_path = "/build/App.xctestrun"
output_dir = "{}"
rerun_limit = 1
bucket_size = 2
execution_timeout_secs = 30
poll_interval_secs = 1
{}

[[nodes]]
name = "mini-1"
host = "10.0.0.5"
username = "ci"
deployment_path = "/Users/ci/xcfleet"
[nodes.targets]
devices = ["DEV-1"]

[[nodes]]
name = "mini-2"
host = "10.0.0.6"
username = "ci"
deployment_path = "/Users/ci/xcfleet"
[nodes.targets]
mac = ["MAC-1"]
"#,
            output.join("results").display(),
            extra
        ))
        .unwrap()
    }

    fn plan() -> XcTestRun {
        XcTestRun::from_json(
            Path::new("/build/App.xctestrun"),
            json!({
                "AppTests": {
                    "ProductModuleName": "AppTests",
                    "TestBundlePath": "__TESTHOST__/PlugIns/AppTests.xctest",
                    "TestHostPath": "__TESTROOT__/Debug-iphonesimulator/App.app",
                    "DependentProductPaths": [
                        "__TESTROOT__/Debug-iphonesimulator/App.app",
                        "__TESTROOT__/Debug-iphonesimulator/AppTests.xctest"
                    ]
                }
            }),
            None,
        )
        .unwrap()
    }

    fn tests() -> Vec<String> {
        ["testA()", "testB()", "testC()", "testD()"]
            .iter()
            .map(|t| format!("AppTests/SuiteTests/{}", t))
            .collect()
    }

    fn source() -> Arc<dyn ObjectSource> {
        Arc::new(bundle(vec![
            leaf("SuiteTests/testA()", "Success", None),
            leaf("SuiteTests/testB()", "Success", None),
            leaf("SuiteTests/testC()", "Success", None),
            leaf("SuiteTests/testD()", "Success", None),
        ]))
    }

    fn remote() -> MockSession {
        MockSession::new()
            .on("nohup", 0, "4242\n")
            .on("cat ", 0, "0\n")
            .on("grep .xcresult", 0, "Test-App.xcresult\n")
    }

    #[test]
    fn test_run_result_exit_codes() {
        let mut pass = TestCase::new("A/B/testPass()");
        pass.state = TestState::Pass;
        pass.attempts = 1;
        let ok = RunResult::new(vec![pass.clone()], Duration::ZERO);
        assert_eq!(ok.exit_code(), 0);

        let mut cancelled = ok.clone();
        cancelled.cancelled = true;
        assert_eq!(cancelled.exit_code(), 1);

        let lost = RunResult::new(vec![pass, TestCase::new("A/B/testLost()")], Duration::ZERO);
        assert_eq!(lost.unexecuted, 1);
        assert_eq!(lost.exit_code(), 1);
        assert_eq!(lost.tests[0].id, "A/B/testLost()");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_across_two_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let local = FakeLocal::new();
        let completions = Arc::new(Completions::default());
        let transport = MockTransport {
            session: remote(),
            unreachable: vec![],
        };

        let orchestrator = Orchestrator::new(config(dir.path(), ""), transport, Arc::clone(&completions))
            .with_local(Arc::new(local.clone()))
            .with_source(source());
        let result = orchestrator
            .run(tests(), &plan(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.total, 4);
        assert_eq!(result.passed, 4);
        assert!(result.success());
        assert!(!result.bundles.is_empty());
        assert_eq!(
            result.merged,
            Some(dir.path().join("results").join(FINAL_DIR).join(MERGED_BUNDLE))
        );

        let programs = local.programs();
        assert_eq!(programs.first().map(String::as_str), Some("zip"));
        assert!(programs.iter().any(|p| p == "xcrun"));
        assert_eq!(completions.0.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_node_does_not_stop_run() {
        let dir = tempfile::tempdir().unwrap();
        let completions = Arc::new(Completions::default());
        let transport = MockTransport {
            session: remote(),
            unreachable: vec!["mini-1".into()],
        };

        let result = Orchestrator::new(config(dir.path(), ""), transport, Arc::clone(&completions))
            .with_local(Arc::new(FakeLocal::new()))
            .with_source(source())
            .run(tests(), &plan(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.passed, 4);
        assert_eq!(completions.0.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_reports_current_state() {
        let dir = tempfile::tempdir().unwrap();
        let completions = Arc::new(Completions::default());
        // No status ever appears, so every batch waits out its timeout.
        let transport = MockTransport {
            session: MockSession::new().on("nohup", 0, "4242\n"),
            unreachable: vec![],
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let result = Orchestrator::new(config(dir.path(), ""), transport, Arc::clone(&completions))
            .with_local(Arc::new(FakeLocal::new()))
            .with_source(source())
            .run(tests(), &plan(), cancel)
            .await
            .unwrap();

        assert!(result.cancelled);
        assert_eq!(result.exit_code(), 1);
        assert_eq!(result.unexecuted, 4);
        assert!(result.merged.is_none());
        assert_eq!(completions.0.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let completions = Arc::new(Completions::default());
        let transport = MockTransport {
            session: MockSession::new().on("nohup", 0, "4242\n"),
            unreachable: vec![],
        };

        let result = Orchestrator::new(
            config(dir.path(), "global_timeout_secs = 10"),
            transport,
            Arc::clone(&completions),
        )
        .with_local(Arc::new(FakeLocal::new()))
        .with_source(source())
        .run(tests(), &plan(), CancellationToken::new())
        .await
        .unwrap();

        assert!(result.cancelled);
        assert!(!result.success());
        assert_eq!(completions.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_run_completes_once() {
        let dir = tempfile::tempdir().unwrap();
        let completions = Arc::new(Completions::default());

        let result = Orchestrator::new(
            config(dir.path(), ""),
            MockTransport::default(),
            Arc::clone(&completions),
        )
        .with_local(Arc::new(FakeLocal::new()))
        .run(Vec::new(), &plan(), CancellationToken::new())
        .await
        .unwrap();

        assert_eq!(result.total, 0);
        assert!(result.success());
        assert_eq!(completions.0.lock().unwrap().len(), 1);
    }
}
