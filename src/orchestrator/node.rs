//! Node supervision: deploy to one node and drive its targets.
//!
//! ```text
//!   connect ──► deploy build ──► upload plan ──► open targets
//!                                                    │
//!                       ┌────────────────────────────┼──────────────┐
//!                       ▼                            ▼              ▼
//!                  target loop                  target loop    target loop
//!                  next_batch ─► run ─► ingest ─► next_batch ... (until empty)
//!                       │                            │              │
//!                       └────────────────────────────┴──────────────┘
//!                                                    ▼
//!                                             host cleanup ──► done
//! ```
//!
//! A node that cannot be reached contributes nothing; the run continues
//! with the remaining nodes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use super::artifact;
use crate::config::{NodeConfig, RunConfig};
use crate::ledger::{Ledger, NOT_EXECUTED_MESSAGE, Recorded, TestState, normalize_test_id};
use crate::plan::XcTestRun;
use crate::report::Reporter;
use crate::target::{
    BatchSettings, FailureBudget, Hooks, Target, TargetError, TargetKind, create_target,
};
use crate::transport::{Command, Session, Transport, shell_quote};
use crate::xcresult::{self, ObjectSource, TestOutcome};

/// File name of the build archive uploaded to every node.
pub const BUILD_ARCHIVE: &str = "build.zip";

const SIMULATOR_SERVICE: &str =
    "ps axc -o pid -o command | grep -E 'com.apple.CoreSimulator.CoreSimulatorService'";

/// Run-wide state shared by every node supervisor.
pub struct RunContext<'a, T, R: ?Sized> {
    pub run: &'a RunConfig,
    pub transport: &'a T,
    pub ledger: &'a Ledger,
    pub reporter: &'a R,
    /// Session on the coordinator host.
    pub local: &'a Arc<dyn Session>,
    pub source: &'a dyn ObjectSource,
    pub hooks: Option<Arc<Hooks>>,
    /// Build archive produced by the coordinator.
    pub build: &'a Path,
    pub plan: &'a XcTestRun,
}

/// What a node contributed to the run.
#[derive(Debug, Clone, Default)]
pub struct NodeReport {
    pub name: String,
    /// Number of targets that took part.
    pub targets: usize,
    /// Result bundles collected under `<output>/final`.
    pub bundles: Vec<PathBuf>,
}

/// Supervises one node for the duration of a run.
pub struct NodeSupervisor<'a, T, R: ?Sized> {
    node: &'a NodeConfig,
    ctx: &'a RunContext<'a, T, R>,
}

impl<'a, T, R> NodeSupervisor<'a, T, R>
where
    T: Transport,
    R: Reporter + ?Sized,
{
    pub fn new(node: &'a NodeConfig, ctx: &'a RunContext<'a, T, R>) -> Self {
        Self { node, ctx }
    }

    /// Runs the node until its targets run out of work.
    ///
    /// Never fails: setup errors are logged and yield an empty report.
    pub async fn run(self) -> NodeReport {
        let name = &self.node.name;
        let mut report = NodeReport {
            name: name.clone(),
            ..Default::default()
        };

        let session = match self.ctx.transport.connect(self.node).await {
            Ok(session) => session,
            Err(e) => {
                error!("[{}] failed to connect to {}: {}", name, self.node.host, e);
                self.ctx.reporter.on_node_complete(name).await;
                return report;
            }
        };

        let settings = match self.deploy(&session).await {
            Ok(settings) => Arc::new(settings),
            Err(e) => {
                error!("[{}] deployment failed: {:#}", name, e);
                self.ctx.reporter.on_node_complete(name).await;
                return report;
            }
        };

        let targets = self.open_targets(&settings).await;
        report.targets = targets.len();
        if targets.is_empty() {
            warn!("[{}] no usable targets", name);
            self.ctx.reporter.on_node_complete(name).await;
            return report;
        }

        info!("[{}] running on {} target(s)", name, targets.len());
        let bundles = join_all(targets.iter().map(|t| self.drive(t.as_ref()))).await;
        report.bundles = bundles.into_iter().flatten().collect();

        self.cleanup(&session, &targets, &settings).await;
        info!("[{}] finished", name);
        self.ctx.reporter.on_node_complete(name).await;
        report
    }

    /// Uploads and unpacks the build, then writes this node's plan.
    async fn deploy<S: Session>(&self, session: &S) -> anyhow::Result<BatchSettings> {
        let name = &self.node.name;
        let deploy = self.node.deployment_path.trim_end_matches('/');
        let quoted = shell_quote(deploy);

        info!("[{}] deploying to {}:{}", name, self.node.host, deploy);
        let prepared = session
            .exec(&Command::shell(format!(
                "mkdir -p {dir} && rm -rf {dir}/*",
                dir = quoted
            )))
            .await?;
        if !prepared.success() {
            bail!("Failed to prepare {}: {}", deploy, prepared.stderr.trim());
        }

        let remote_build = PathBuf::from(deploy).join(BUILD_ARCHIVE);
        session
            .upload(self.ctx.build, &remote_build)
            .await
            .context("Failed to upload build")?;
        let unpacked = session
            .exec(&Command::shell(format!(
                "cd {dir} && unzip -q -o {zip} && rm -f {zip}",
                dir = quoted,
                zip = BUILD_ARCHIVE
            )))
            .await?;
        if !unpacked.success() {
            bail!("Failed to unpack build: {}", unpacked.stderr.trim());
        }

        let mut plan = self.ctx.plan.clone();
        plan.add_environment_variables(&self.node.env);
        plan.add_timeout(self.ctx.run.execution_timeout_secs);

        let plan_file = plan.file_name().to_string();
        let local_plan = self.ctx.run.output_dir.join(format!("{}-{}", name, plan_file));
        plan.write_plist(self.ctx.local.as_ref(), &local_plan).await?;
        session
            .upload(&local_plan, &PathBuf::from(deploy).join(&plan_file))
            .await
            .context("Failed to upload test plan")?;
        if let Err(e) = tokio::fs::remove_file(&local_plan).await {
            debug!("[{}] failed to remove {}: {}", name, local_plan.display(), e);
        }

        Ok(BatchSettings::new(self.node, self.ctx.run, &plan_file))
    }

    /// Opens one session per declared target.
    async fn open_targets(&self, settings: &Arc<BatchSettings>) -> Vec<Box<dyn Target>> {
        let pools = &self.node.targets;
        let declared = pools
            .simulators
            .iter()
            .map(|id| (TargetKind::Simulator, id))
            .chain(pools.devices.iter().map(|id| (TargetKind::Device, id)))
            .chain(pools.mac.iter().map(|id| (TargetKind::Mac, id)));

        let mut targets = Vec::with_capacity(pools.len());
        for (kind, udid) in declared {
            match self.ctx.transport.connect(self.node).await {
                Ok(session) => targets.push(create_target(
                    kind,
                    udid,
                    session,
                    Arc::clone(settings),
                    self.ctx.hooks.clone(),
                )),
                Err(e) => warn!("[{}] {} {}: failed to open session: {}", self.node.name, kind, udid, e),
            }
        }
        targets
    }

    /// The per-target loop. Returns the bundles it collected.
    async fn drive(&self, target: &dyn Target) -> Vec<PathBuf> {
        let node = &self.node.name;
        let udid = target.udid();
        let mut bundles = Vec::new();

        if !target.ready().await {
            error!("[{}] {} {}: not ready, skipping", node, target.kind(), udid);
            return bundles;
        }

        let mut budget = FailureBudget::default();
        loop {
            let batch = self.ctx.ledger.next_batch(self.ctx.run.bucket_size);
            if batch.is_empty() {
                break;
            }

            match target.run(&batch).await {
                Ok(ran) => {
                    budget.record_success();
                    match self.collect(target, &ran).await {
                        Ok((bundle, outcomes)) => {
                            bundles.push(bundle);
                            self.ingest(&ran, &outcomes).await;
                        }
                        Err(e) => {
                            warn!("[{}] {}: no usable results: {:#}", node, udid, e);
                            self.record_all(&ran, NOT_EXECUTED_MESSAGE).await;
                            self.reset(target).await;
                        }
                    }
                }
                Err(TargetError::NoTestsForExecution) => break,
                Err(TargetError::Skipped) => {
                    info!("[{}] {}: batch skipped by setup hook", node, udid);
                    self.ctx.ledger.release(&batch);
                }
                Err(e) => {
                    error!("[{}] {}: {}", node, udid, e);
                    self.record_all(&batch, &e.to_string()).await;
                    self.reset(target).await;
                    if budget.record_failure() {
                        error!(
                            "[{}] {}: {} consecutive failures, stopping",
                            node,
                            udid,
                            budget.consecutive()
                        );
                        break;
                    }
                }
            }
        }

        debug!("[{}] {}: idle", node, udid);
        bundles
    }

    /// Downloads, unpacks and decodes the results of the last batch.
    async fn collect(
        &self,
        target: &dyn Target,
        ran: &[String],
    ) -> anyhow::Result<(PathBuf, Vec<TestOutcome>)> {
        let output_dir = &self.ctx.run.output_dir;
        let archive = target
            .fetch_results(output_dir)
            .await
            .context("Failed to fetch results")?;
        let bundle = artifact::unpack(self.ctx.local.as_ref(), &archive, output_dir).await?;
        debug!(
            "[{}] {}: {} test(s) in {}",
            self.node.name,
            target.udid(),
            ran.len(),
            bundle.display()
        );
        let outcomes = xcresult::test_outcomes(self.ctx.source, &bundle).await?;
        Ok((bundle, outcomes))
    }

    /// Records decoded outcomes; batch tests missing from them are unexecuted.
    async fn ingest(&self, ran: &[String], outcomes: &[TestOutcome]) {
        let by_id: HashMap<&str, &TestOutcome> = outcomes
            .iter()
            .map(|o| (normalize_test_id(&o.id), o))
            .collect();

        for id in ran {
            let recorded = match by_id.get(normalize_test_id(id)) {
                Some(outcome) => {
                    let state = if outcome.passed() {
                        TestState::Pass
                    } else {
                        TestState::Failed
                    };
                    self.ctx
                        .ledger
                        .record_outcome(id, state, outcome.duration, outcome.message.clone())
                }
                None => self.ctx.ledger.record_outcome(
                    id,
                    TestState::Unexecuted,
                    Duration::ZERO,
                    NOT_EXECUTED_MESSAGE,
                ),
            };
            if let Some(recorded) = recorded {
                self.report(recorded).await;
            }
        }
    }

    async fn record_all(&self, tests: &[String], message: &str) {
        for id in tests {
            if let Some(recorded) =
                self.ctx
                    .ledger
                    .record_outcome(id, TestState::Unexecuted, Duration::ZERO, message)
            {
                self.report(recorded).await;
            }
        }
    }

    async fn report(&self, recorded: Recorded) {
        let test = &recorded.test;
        match test.state {
            TestState::Pass => debug!("[{}] PASS {}", self.node.name, test.id),
            TestState::Failed => warn!(
                "[{}] FAIL {} (attempt {}): {}",
                self.node.name, test.id, test.attempts, test.message
            ),
            TestState::Unexecuted => error!(
                "[{}] UNEXECUTED {} (attempt {}): {}",
                self.node.name, test.id, test.attempts, test.message
            ),
        }
        self.ctx
            .reporter
            .on_test_complete(test, recorded.requeued)
            .await;
    }

    async fn reset(&self, target: &dyn Target) {
        if let Err(e) = target.reset().await {
            warn!("[{}] {}: reset failed: {}", self.node.name, target.udid(), e);
        }
    }

    /// Best-effort host cleanup once every target is idle.
    async fn cleanup<S: Session>(
        &self,
        session: &S,
        targets: &[Box<dyn Target>],
        settings: &BatchSettings,
    ) {
        for target in targets {
            self.reset(target.as_ref()).await;
        }

        let simulators = &self.node.targets.simulators;
        if simulators.is_empty() {
            return;
        }

        let name = &self.node.name;
        match session.exec(&Command::shell(SIMULATOR_SERVICE)).await {
            Ok(result) => {
                let pids = result
                    .stdout
                    .lines()
                    .filter_map(|line| line.split_whitespace().next())
                    .filter(|pid| pid.chars().all(|c| c.is_ascii_digit()))
                    .map(str::to_string)
                    .collect::<Vec<_>>();
                if !pids.is_empty() {
                    let kill = Command::new("kill").arg("-3").args(pids);
                    if let Err(e) = session.exec(&kill).await {
                        warn!("[{}] failed to stop simulator service: {}", name, e);
                    }
                }
            }
            Err(e) => warn!("[{}] failed to find simulator service: {}", name, e),
        }

        for udid in simulators {
            let boot = Command::new("xcrun")
                .args(["simctl", "boot", udid.as_str()])
                .env("DEVELOPER_DIR", settings.developer_dir());
            match session.exec(&boot).await {
                Ok(result) if !result.success() => {
                    debug!("[{}] {}: boot exited with {}", name, udid, result.exit_code)
                }
                Ok(_) => {}
                Err(e) => warn!("[{}] {}: boot failed: {}", name, udid, e),
            }
        }
    }
}
