//! Plain-text run summary.

use std::fmt::Write as _;
use std::path::PathBuf;

use async_trait::async_trait;

use super::Reporter;
use crate::ledger::{TestCase, TestState};
use crate::orchestrator::RunResult;

/// Writes totals and the non-passing tests to a text file.
pub struct SummaryReporter {
    output_path: PathBuf,
}

impl SummaryReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    pub fn render(result: &RunResult) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Total Tests: {}", result.total);
        let _ = writeln!(out, "Passed: {}", result.passed);
        let _ = writeln!(out, "Reran: {}", result.reran);
        let _ = writeln!(out, "Failed: {}", result.failed);
        let _ = writeln!(out, "Unexecuted: {}", result.unexecuted);
        let _ = writeln!(out, "Time: {:.3}s", result.duration.as_secs_f64());
        if result.cancelled {
            let _ = writeln!(out, "Cancelled: yes");
        }

        for (title, state) in [("Failed", TestState::Failed), ("Unexecuted", TestState::Unexecuted)] {
            let tests: Vec<&TestCase> = result.tests.iter().filter(|t| t.state == state).collect();
            if tests.is_empty() {
                continue;
            }
            let _ = writeln!(out, "\n{} tests:", title);
            for test in tests {
                let _ = writeln!(out, "{}", test.id);
            }
        }

        out
    }
}

#[async_trait]
impl Reporter for SummaryReporter {
    async fn on_run_start(&self, _tests: &[TestCase]) {}

    async fn on_test_complete(&self, _test: &TestCase, _requeued: bool) {}

    async fn on_node_complete(&self, _node: &str) {}

    async fn on_run_complete(&self, result: &RunResult) {
        if let Some(parent) = self.output_path.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            tracing::error!("Failed to create output directory: {}", e);
            return;
        }

        match std::fs::write(&self.output_path, Self::render(result)) {
            Ok(()) => tracing::info!("Summary written to: {}", self.output_path.display()),
            Err(e) => tracing::error!("Failed to write summary: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_render() {
        let mut reran = TestCase::new("AppTests/A/testFlaky()");
        reran.state = TestState::Pass;
        reran.attempts = 3;
        let mut failed = TestCase::new("AppTests/A/testBroken()");
        failed.state = TestState::Failed;
        failed.attempts = 1;
        let lost = TestCase::new("AppTests/B/testLost()");

        let result = RunResult::new(vec![reran, failed, lost], Duration::from_millis(1500));
        let text = SummaryReporter::render(&result);

        assert_eq!(
            text,
            "Total Tests: 3\nPassed: 1\nReran: 2\nFailed: 1\nUnexecuted: 1\nTime: 1.500s\n\
             \nFailed tests:\nAppTests/A/testBroken()\n\
             \nUnexecuted tests:\nAppTests/B/testLost()\n"
        );
    }
}
