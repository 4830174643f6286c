//! Detached `xcodebuild` execution with status-file polling.
//!
//! A session cannot both hold a long-lived test process and stay
//! interruptible, so the runner launches the process in the background on
//! the node and polls for its exit status:
//!
//! ```text
//!  launch ──► nohup sh -c '<xcodebuild ...>; echo $? > <status>' &  ──► pid
//!     │
//!     └─► every poll_interval: cat <status>
//!             ├─ status found ──► exit code
//!             └─ timeout elapsed ──► kill pid ──► 143
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    BatchSettings, EXIT_PASSED, EXIT_TESTS_FAILED, EXIT_TIMEOUT, HookContext, HookPhase, Hooks,
    TargetError, TargetKind, TargetResult,
};
use crate::transport::{Command, ExecResult, Session, TransportError, TransportResult, shell_quote};

/// Runs batches for one target over its own session.
pub struct BatchRunner<S> {
    session: S,
    kind: TargetKind,
    udid: String,
    settings: Arc<BatchSettings>,
    hooks: Option<Arc<Hooks>>,
}

impl<S: Session> BatchRunner<S> {
    pub fn new(
        session: S,
        kind: TargetKind,
        udid: impl Into<String>,
        settings: Arc<BatchSettings>,
        hooks: Option<Arc<Hooks>>,
    ) -> Self {
        Self {
            session,
            kind,
            udid: udid.into(),
            settings,
            hooks,
        }
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn udid(&self) -> &str {
        &self.udid
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// Runs a command on the target's node.
    pub async fn exec(&self, cmd: &Command) -> TransportResult<ExecResult> {
        self.session.exec(cmd).await
    }

    /// Directory holding this target's derived data on the node.
    pub fn derived_data_path(&self) -> String {
        format!("{}/{}", self.settings.deployment_path, self.udid)
    }

    /// Renders the `xcodebuild` invocation for `tests`.
    pub fn xcodebuild_command(&self, tests: &[String]) -> Command {
        let settings = &self.settings;
        let mut cmd = Command::new("xcodebuild")
            .arg("-quiet")
            .arg("-xctestrun")
            .arg(&settings.xctestrun_path)
            .arg("-destination")
            .arg(format!(
                "platform={},id={}",
                self.kind.destination_platform(),
                self.udid
            ))
            .arg("-derivedDataPath")
            .arg(self.derived_data_path())
            .args(["-test-timeouts-enabled", "YES"]);
        if let Some(config) = &settings.only_test_configuration {
            cmd = cmd.arg("-only-test-configuration").arg(config);
        }
        if let Some(config) = &settings.skip_test_configuration {
            cmd = cmd.arg("-skip-test-configuration").arg(config);
        }
        cmd.args(tests.iter().map(|test| format!("-only-testing:{}", test)))
            .arg("test-without-building")
            .env("DEVELOPER_DIR", settings.developer_dir())
    }

    /// Launches `cmd` in the background, returning its pid and status file.
    async fn launch(&self, cmd: &Command) -> TransportResult<(String, String)> {
        let status_path = format!(
            "{}/xcfleet-{}.status",
            self.derived_data_path(),
            uuid::Uuid::new_v4()
        );
        let inner = format!("{}; echo $? > {}", cmd.to_script(), shell_quote(&status_path));
        let launcher = format!(
            "mkdir -p {dir} && nohup /bin/sh -c {inner} > /dev/null 2>&1 & echo $!",
            dir = shell_quote(&self.derived_data_path()),
            inner = shell_quote(&inner),
        );

        let result = self.session.exec(&Command::shell(launcher)).await?;
        let pid = result.stdout.trim().to_string();
        if !result.success() || pid.is_empty() {
            return Err(TransportError::ExecFailed(format!(
                "failed to launch xcodebuild: {}",
                result.stderr.trim()
            )));
        }
        Ok((pid, status_path))
    }

    async fn read_status(&self, status_path: &str) -> TransportResult<Option<i32>> {
        let result = self
            .session
            .exec(&Command::shell(format!("cat {} 2>/dev/null", shell_quote(status_path))))
            .await?;
        Ok(result.stdout.trim().parse().ok())
    }

    async fn terminate(&self, pid: &str) {
        let script = format!("pkill -TERM -P {pid}; kill -TERM {pid}", pid = shell_quote(pid));
        if let Err(e) = self.session.exec(&Command::shell(script)).await {
            warn!("[{}] {}: failed to terminate pid {}: {}", self.settings.node, self.udid, pid, e);
        }
    }

    /// Runs `cmd` detached and waits for its exit code.
    ///
    /// Returns [`EXIT_TIMEOUT`] if no status appears within the batch
    /// timeout; the process is terminated in that case.
    pub async fn run_detached(&self, cmd: &Command) -> TransportResult<i32> {
        let (pid, status_path) = self.launch(cmd).await?;
        debug!("[{}] {}: launched pid {}", self.settings.node, self.udid, pid);

        let timeout = Duration::from_secs(self.settings.execution_timeout_secs);
        let interval = Duration::from_secs(self.settings.poll_interval_secs.max(1));
        let start = Instant::now();

        let code = loop {
            match self.read_status(&status_path).await {
                Ok(Some(code)) => break Ok(code),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "[{}] {}: lost track of pid {}: {}",
                        self.settings.node, self.udid, pid, e
                    );
                    self.terminate(&pid).await;
                    break Err(e);
                }
            }
            if start.elapsed() >= timeout {
                warn!(
                    "[{}] {}: batch timed out after {}s",
                    self.settings.node,
                    self.udid,
                    timeout.as_secs()
                );
                self.terminate(&pid).await;
                break Ok(EXIT_TIMEOUT);
            }
            tokio::time::sleep(interval).await;
        };

        self.remove_status(&status_path).await;
        code
    }

    async fn remove_status(&self, status_path: &str) {
        let cmd = Command::new("rm").arg("-f").arg(status_path);
        match self.session.exec(&cmd).await {
            Ok(result) if !result.success() => warn!(
                "[{}] {}: failed to remove {}: {}",
                self.settings.node,
                self.udid,
                status_path,
                result.stderr.trim()
            ),
            Ok(_) => {}
            Err(e) => warn!(
                "[{}] {}: failed to remove {}: {}",
                self.settings.node, self.udid, status_path, e
            ),
        }
    }

    async fn hook(&self, phase: HookPhase, tests: &[String]) -> bool {
        let Some(hooks) = &self.hooks else {
            return true;
        };
        let ctx = HookContext {
            node: &self.settings.node,
            host: &self.settings.host,
            target: &self.udid,
            kind: self.kind,
            tests,
        };
        hooks.run(phase, &ctx).await
    }

    /// Runs one batch: setup hook, runner, teardown hook.
    pub async fn run_batch(&self, tests: &[String]) -> TargetResult<Vec<String>> {
        if tests.is_empty() {
            return Err(TargetError::NoTestsForExecution);
        }

        if !self.hook(HookPhase::Setup, tests).await {
            self.hook(HookPhase::Teardown, tests).await;
            return Err(TargetError::Skipped);
        }

        info!(
            "[{}] {}: running {} test(s)",
            self.settings.node,
            self.udid,
            tests.len()
        );
        let status = self.run_detached(&self.xcodebuild_command(tests)).await;

        self.hook(HookPhase::Teardown, tests).await;

        match status {
            Ok(EXIT_PASSED | EXIT_TESTS_FAILED) => Ok(tests.to_vec()),
            Ok(EXIT_TIMEOUT) => Err(TargetError::Execution {
                description: format!(
                    "{} {}: status {} - timeout: {}s",
                    self.kind, self.udid, EXIT_TIMEOUT, self.settings.execution_timeout_secs
                ),
                tests: tests.to_vec(),
            }),
            Ok(code) => Err(TargetError::Execution {
                description: format!("{} {}: status {}", self.kind, self.udid, code),
                tests: tests.to_vec(),
            }),
            Err(e) => Err(TargetError::Execution {
                description: format!("{} {}: {}", self.kind, self.udid, e),
                tests: tests.to_vec(),
            }),
        }
    }

    /// Zips the newest result bundle on the node and downloads it into
    /// `local_dir`. The remote bundle and archive are removed afterwards.
    pub async fn fetch_results(&self, local_dir: &Path) -> TransportResult<PathBuf> {
        let logs = format!("{}/Logs/Test", self.derived_data_path());
        let listing = self
            .session
            .exec(&Command::shell(format!(
                "ls -1 {} | grep .xcresult",
                shell_quote(&logs)
            )))
            .await?;

        let Some(bundle) = newest_bundle(&listing.stdout) else {
            return Err(TransportError::DownloadFailed(format!(
                "no result bundle in {}",
                logs
            )));
        };

        let archive = format!("{}-{}.zip", self.udid, uuid::Uuid::new_v4());
        let zip = self
            .session
            .exec(&Command::shell(format!(
                "cd {} && zip -r -X -q {} {}",
                shell_quote(&logs),
                shell_quote(&archive),
                shell_quote(&bundle)
            )))
            .await?;
        if !zip.success() {
            return Err(TransportError::DownloadFailed(format!(
                "failed to zip {}: {}",
                bundle,
                zip.stderr.trim()
            )));
        }

        let remote = PathBuf::from(&logs).join(&archive);
        let local = local_dir.join(&archive);
        let downloaded = self.session.download(&remote, &local).await;

        let cleanup = Command::new("rm")
            .arg("-rf")
            .arg(format!("{}/{}", logs, bundle))
            .arg(remote.to_string_lossy());
        if let Err(e) = self.session.exec(&cleanup).await {
            warn!("[{}] {}: failed to remove {}: {}", self.settings.node, self.udid, bundle, e);
        }

        downloaded?;
        Ok(local)
    }
}

/// Picks the newest bundle from an `ls -1` listing.
///
/// Bundle names embed a sortable timestamp, so the greatest name wins.
fn newest_bundle(listing: &str) -> Option<String> {
    listing
        .lines()
        .map(str::trim)
        .filter(|name| name.ends_with(".xcresult"))
        .max()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::testing::settings;
    use crate::transport::testing::MockSession;

    fn runner(session: MockSession) -> BatchRunner<MockSession> {
        BatchRunner::new(session, TargetKind::Simulator, "SIM-1", settings(), None)
    }

    fn tests() -> Vec<String> {
        vec!["AppTests/LoginTests/testValid".into(), "AppTests/LoginTests/testInvalid".into()]
    }

    #[test]
    fn test_xcodebuild_command() {
        let runner = runner(MockSession::new());
        let script = runner.xcodebuild_command(&tests()).to_script();

        assert_eq!(
            script,
            "export DEVELOPER_DIR=/Applications/Xcode.app/Contents/Developer; \
             xcodebuild -quiet -xctestrun /Users/ci/xcfleet/App.xctestrun \
             -destination 'platform=iOS Simulator,id=SIM-1' \
             -derivedDataPath /Users/ci/xcfleet/SIM-1 -test-timeouts-enabled YES \
             -skip-test-configuration Release \
             -only-testing:AppTests/LoginTests/testValid \
             -only-testing:AppTests/LoginTests/testInvalid test-without-building"
        );
    }

    #[test]
    fn test_newest_bundle() {
        let listing = "Test-App-2024.01.01_10-00-00-+0000.xcresult\n\
                       Test-App-2024.03.01_09-00-00-+0000.xcresult\n\
                       notes.txt\n";
        assert_eq!(
            newest_bundle(listing).as_deref(),
            Some("Test-App-2024.03.01_09-00-00-+0000.xcresult")
        );
        assert!(newest_bundle("").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_batch_polls_until_status() {
        let session = MockSession::new()
            .on("nohup", 0, "4242\n")
            .on("cat ", 0, "")
            .on("cat ", 0, "")
            .on("cat ", 0, "65\n");
        let runner = runner(session.clone());

        let ran = runner.run_batch(&tests()).await.unwrap();
        assert_eq!(ran, tests());

        let polls = session.commands().iter().filter(|c| c.contains("cat ")).count();
        assert_eq!(polls, 3);
        assert!(session.ran("rm -f"));
        assert!(!session.ran("pkill"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_batch_timeout_kills_and_reports_143() {
        let session = MockSession::new().on("nohup", 0, "4242\n");
        let runner = runner(session.clone());

        let err = runner.run_batch(&tests()).await.unwrap_err();
        match err {
            TargetError::Execution { description, tests: failed } => {
                assert!(description.contains("status 143"));
                assert_eq!(failed.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(session.ran("pkill -TERM -P 4242; kill -TERM 4242"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_poll_terminates_and_cleans_up() {
        let session = MockSession::new().on("nohup", 0, "4242\n").break_on("cat ");
        let runner = BatchRunner::new(session.clone(), TargetKind::Device, "DEV-1", settings(), None);

        let err = runner.run_batch(&tests()).await.unwrap_err();
        match err {
            TargetError::Execution { description, tests: failed } => {
                assert!(description.contains("broken pipe"));
                assert_eq!(failed, tests());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(session.ran("pkill -TERM -P 4242; kill -TERM 4242"));
        assert!(session.ran("rm -f"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_status_cleanup_keeps_exit_code() {
        let session = MockSession::new()
            .on("nohup", 0, "4242\n")
            .on("cat ", 0, "0\n")
            .break_on("rm -f");
        let ran = runner(session.clone()).run_batch(&tests()).await.unwrap();
        assert_eq!(ran, tests());
        assert!(session.ran("rm -f"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_batch_other_status_is_execution_error() {
        let session = MockSession::new()
            .on("nohup", 0, "7\n")
            .on("cat ", 0, "70\n");
        let err = runner(session).run_batch(&tests()).await.unwrap_err();
        assert!(matches!(err, TargetError::Execution { .. }));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let err = runner(MockSession::new()).run_batch(&[]).await.unwrap_err();
        assert!(matches!(err, TargetError::NoTestsForExecution));
    }

    #[tokio::test]
    async fn test_setup_veto_skips_batch() {
        let local = MockSession::new().on("pre.sh", 1, "");
        let hooks = Arc::new(Hooks::new(
            Arc::new(local.clone()),
            Some("/ci/pre.sh".into()),
            Some("/ci/post.sh".into()),
        ));
        let remote = MockSession::new();
        let runner = BatchRunner::new(remote.clone(), TargetKind::Device, "DEV-1", settings(), Some(hooks));

        let err = runner.run_batch(&tests()).await.unwrap_err();
        assert!(matches!(err, TargetError::Skipped));
        assert!(remote.commands().is_empty());
        assert!(local.ran("/ci/post.sh"));
    }

    #[tokio::test]
    async fn test_fetch_results_downloads_newest_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let session = MockSession::new().on(
            "grep .xcresult",
            0,
            "Run-1.xcresult\nRun-2.xcresult\n",
        );
        let runner = runner(session.clone());

        let local = runner.fetch_results(dir.path()).await.unwrap();

        assert!(local.starts_with(dir.path()));
        let name = local.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("SIM-1-") && name.ends_with(".zip"));
        assert!(session.ran("zip -r -X -q"));
        assert!(session.ran("Run-2.xcresult"));
        assert!(session.ran("rm -rf /Users/ci/xcfleet/SIM-1/Logs/Test/Run-2.xcresult"));
        assert_eq!(session.downloads().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_results_without_bundle_fails() {
        let dir = tempfile::tempdir().unwrap();
        let session = MockSession::new().on("grep .xcresult", 1, "");
        let err = runner(session.clone()).fetch_results(dir.path()).await.unwrap_err();
        assert!(matches!(err, TransportError::DownloadFailed(_)));
        assert!(session.downloads().is_empty());
    }
}
