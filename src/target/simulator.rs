//! Simulator targets driven through `xcrun simctl`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{BatchRunner, Target, TargetError, TargetKind, TargetResult};
use crate::transport::{Command, Session, TransportResult};

/// Lists UDIDs of booted simulators, one per line.
const BOOTED_UDIDS: &str = r#"xcrun simctl list devices | grep "(Booted)" | grep -E -o -i "([0-9a-f]{8}-([0-9a-f]{4}-){3}[0-9a-f]{12})""#;

/// A simulator on a node.
pub struct Simulator<S> {
    runner: BatchRunner<S>,
}

impl<S: Session> Simulator<S> {
    pub fn new(runner: BatchRunner<S>) -> Self {
        Self { runner }
    }

    fn simctl(&self, script: String) -> Command {
        Command::shell(script).env("DEVELOPER_DIR", self.runner.settings().developer_dir())
    }

    async fn is_booted(&self) -> TransportResult<bool> {
        let result = self.runner.exec(&self.simctl(BOOTED_UDIDS.to_string())).await?;
        let udid = self.runner.udid();
        Ok(result
            .stdout
            .lines()
            .any(|line| line.trim().eq_ignore_ascii_case(udid)))
    }

    async fn boot(&self) -> TransportResult<bool> {
        let script = format!("xcrun simctl boot {}", self.runner.udid());
        Ok(self.runner.exec(&self.simctl(script)).await?.success())
    }
}

#[async_trait]
impl<S: Session> Target for Simulator<S> {
    fn kind(&self) -> TargetKind {
        TargetKind::Simulator
    }

    fn udid(&self) -> &str {
        self.runner.udid()
    }

    async fn ready(&self) -> bool {
        let node = &self.runner.settings().node;
        let udid = self.runner.udid();

        match self.is_booted().await {
            Ok(true) => return true,
            Ok(false) => debug!("[{}] {}: not booted", node, udid),
            Err(e) => {
                warn!("[{}] {}: failed to query simulators: {}", node, udid, e);
                return false;
            }
        }

        info!("[{}] {}: booting", node, udid);
        if matches!(self.boot().await, Ok(true)) {
            return true;
        }

        warn!("[{}] {}: boot failed, erasing", node, udid);
        match self.reset().await {
            Ok(()) => true,
            Err(e) => {
                warn!("[{}] {}: {}", node, udid, e);
                false
            }
        }
    }

    async fn run(&self, tests: &[String]) -> TargetResult<Vec<String>> {
        self.runner.run_batch(tests).await
    }

    async fn reset(&self) -> TargetResult<()> {
        let udid = self.runner.udid();

        // Shutting down an already shut down simulator fails; ignore it.
        self.runner
            .exec(&self.simctl(format!("xcrun simctl shutdown {udid}")))
            .await?;

        for step in ["erase", "boot"] {
            let result = self
                .runner
                .exec(&self.simctl(format!("xcrun simctl {step} {udid}")))
                .await?;
            if !result.success() {
                return Err(TargetError::Execution {
                    description: format!(
                        "simulator {}: {} failed with status {}: {}",
                        udid,
                        step,
                        result.exit_code,
                        result.stderr.trim()
                    ),
                    tests: Vec::new(),
                });
            }
        }
        Ok(())
    }

    async fn delete_app(&self, bundle_id: &str) {
        let script = format!("xcrun simctl uninstall {} {}", self.runner.udid(), bundle_id);
        if let Err(e) = self.runner.exec(&self.simctl(script)).await {
            debug!("{}: uninstall {} failed: {}", self.runner.udid(), bundle_id, e);
        }
    }

    async fn fetch_results(&self, local_dir: &Path) -> TransportResult<PathBuf> {
        self.runner.fetch_results(local_dir).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::testing::settings;
    use crate::transport::testing::MockSession;

    const UDID: &str = "2B3A1A7E-1C0D-4E27-9C4B-3C4A1F0B9A11";

    fn simulator(session: MockSession) -> Simulator<MockSession> {
        Simulator::new(BatchRunner::new(session, TargetKind::Simulator, UDID, settings(), None))
    }

    #[tokio::test]
    async fn test_ready_when_already_booted() {
        let session = MockSession::new().on(
            "(Booted)",
            0,
            "0F1E2D3C-0000-4000-8000-000000000000\n2b3a1a7e-1c0d-4e27-9c4b-3c4a1f0b9a11\n",
        );
        let sim = simulator(session.clone());

        assert!(sim.ready().await);
        assert!(!session.ran("simctl boot"));
    }

    #[tokio::test]
    async fn test_ready_boots_when_needed() {
        let session = MockSession::new().on("(Booted)", 1, "");
        let sim = simulator(session.clone());

        assert!(sim.ready().await);
        assert!(session.ran(&format!("xcrun simctl boot {}", UDID)));
        assert!(!session.ran("simctl erase"));
    }

    #[tokio::test]
    async fn test_ready_erases_when_boot_fails() {
        let session = MockSession::new()
            .on("(Booted)", 1, "")
            .on("simctl shutdown", 0, "")
            .on("simctl boot", 149, "");
        let sim = simulator(session.clone());

        assert!(sim.ready().await);
        assert!(session.ran("simctl erase"));
    }

    #[tokio::test]
    async fn test_reset_script() {
        let session = MockSession::new();
        let sim = simulator(session.clone());

        sim.reset().await.unwrap();

        let commands = session.commands();
        assert_eq!(commands.len(), 3);
        assert!(commands.iter().all(|c| c.starts_with(
            "export DEVELOPER_DIR=/Applications/Xcode.app/Contents/Developer;"
        )));
        assert!(commands[0].contains(&format!("xcrun simctl shutdown {UDID}")));
        assert!(commands[1].contains(&format!("xcrun simctl erase {UDID}")));
        assert!(commands[2].contains(&format!("xcrun simctl boot {UDID}")));
    }

    #[tokio::test]
    async fn test_reset_tolerates_shutdown_failure() {
        let session = MockSession::new().on("simctl shutdown", 149, "");
        simulator(session.clone()).reset().await.unwrap();
        assert!(session.ran("simctl boot"));
    }

    #[tokio::test]
    async fn test_failed_erase_fails_reset() {
        let session = MockSession::new().on("simctl erase", 1, "");
        let err = simulator(session.clone()).reset().await.unwrap_err();
        match err {
            TargetError::Execution { description, .. } => {
                assert!(description.contains("erase failed with status 1"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!session.ran("simctl boot"));
    }

    #[tokio::test]
    async fn test_delete_app() {
        let session = MockSession::new();
        simulator(session.clone()).delete_app("com.example.App").await;
        assert!(session.ran(&format!("xcrun simctl uninstall {} com.example.App", UDID)));
    }
}
