//! Run reporting: progress, JUnit XML and the plain-text summary.

pub mod junit;
pub mod summary;

use std::sync::Mutex;

use async_trait::async_trait;

use crate::ledger::{TestCase, TestState};
use crate::orchestrator::RunResult;

pub use junit::JUnitReporter;
pub use summary::SummaryReporter;

/// A reporter receives events during a run.
///
/// Events for different tests can arrive from different nodes in any
/// order. `on_run_complete` is called exactly once.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once the ledger is built, before any node starts.
    async fn on_run_start(&self, tests: &[TestCase]);

    /// Called after each recorded attempt.
    async fn on_test_complete(&self, test: &TestCase, requeued: bool);

    /// Called when every target of a node has finished.
    async fn on_node_complete(&self, node: &str);

    /// Called when the run is over.
    async fn on_run_complete(&self, result: &RunResult);
}

/// A reporter that does nothing (for testing or when output is not needed).
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_run_start(&self, _tests: &[TestCase]) {}
    async fn on_test_complete(&self, _test: &TestCase, _requeued: bool) {}
    async fn on_node_complete(&self, _node: &str) {}
    async fn on_run_complete(&self, _result: &RunResult) {}
}

/// A reporter that combines multiple reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    /// Create a new multi-reporter.
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    /// Add a reporter to the multi-reporter.
    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_run_start(&self, tests: &[TestCase]) {
        for reporter in &self.reporters {
            reporter.on_run_start(tests).await;
        }
    }

    async fn on_test_complete(&self, test: &TestCase, requeued: bool) {
        for reporter in &self.reporters {
            reporter.on_test_complete(test, requeued).await;
        }
    }

    async fn on_node_complete(&self, node: &str) {
        for reporter in &self.reporters {
            reporter.on_node_complete(node).await;
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        for reporter in &self.reporters {
            reporter.on_run_complete(result).await;
        }
    }
}

/// Console reporter that shows progress in the terminal.
///
/// The bar counts tests with a final outcome; re-queued attempts are
/// printed but do not advance it.
pub struct ConsoleReporter {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    /// Create a new console reporter.
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn bar(&self) -> std::sync::MutexGuard<'_, Option<indicatif::ProgressBar>> {
        self.progress.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_run_start(&self, tests: &[TestCase]) {
        println!("Scheduling {} tests", tests.len());

        let pb = indicatif::ProgressBar::new(tests.len() as u64);
        if let Ok(style) = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        *self.bar() = Some(pb);
    }

    async fn on_test_complete(&self, test: &TestCase, requeued: bool) {
        let bar = self.bar();
        let Some(pb) = bar.as_ref() else {
            return;
        };
        if !requeued {
            pb.inc(1);
        }

        let status = match (test.state, requeued) {
            (TestState::Pass, _) => console::style("PASS ").green(),
            (_, true) => console::style("RETRY").yellow(),
            (TestState::Failed, false) => console::style("FAIL ").red(),
            (TestState::Unexecuted, false) => console::style("UNEX ").red().bold(),
        };

        if self.verbose || test.state != TestState::Pass {
            pb.println(format!("{} {}", status, test.id));
        }
    }

    async fn on_node_complete(&self, node: &str) {
        if let Some(pb) = self.bar().as_ref() {
            pb.println(format!("{} {}", console::style("DONE ").cyan(), node));
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        if let Some(pb) = self.bar().take() {
            pb.finish_and_clear();
        }

        println!();
        println!("Test Results:");
        println!("  Total:      {}", result.total);
        println!("  Passed:     {}", console::style(result.passed).green());
        println!("  Reran:      {}", console::style(result.reran).yellow());
        println!("  Failed:     {}", console::style(result.failed).red());
        if result.unexecuted > 0 {
            println!("  Unexecuted: {}", console::style(result.unexecuted).red().bold());
        }
        println!("  Duration:   {:.3}s", result.duration.as_secs_f64());

        if result.cancelled {
            println!();
            println!("{}", console::style("Run was cancelled before completion.").red().bold());
        }

        let reran: Vec<&TestCase> = result.tests.iter().filter(|t| t.attempts > 1).collect();
        if !reran.is_empty() {
            println!();
            println!("Reran tests:");
            for test in reran {
                println!("  - {} ({} times)", test.id, test.attempts - 1);
            }
        }

        if result.success() {
            println!();
            println!("{}", console::style("All tests passed!").green().bold());
            return;
        }

        println!();
        println!("{}", console::style("Some tests did not pass.").red().bold());
        for test in &result.tests {
            match test.state {
                TestState::Pass => continue,
                TestState::Failed => println!("  - {}", test.id),
                TestState::Unexecuted => {
                    println!("  - {} {}", test.id, console::style("(unexecuted)").dim())
                }
            }
            if !test.message.is_empty() {
                println!("    {}", console::style(&test.message).dim());
            }
        }
    }
}

/// Splits `Module/Class/testName()` into module, class and test name.
///
/// Classes nested deeper than one level keep their inner path.
pub(crate) fn split_test_id(id: &str) -> (&str, &str, &str) {
    let (module, rest) = id.split_once('/').unwrap_or(("", id));
    match rest.rsplit_once('/') {
        Some((class, name)) => (module, class, name),
        None => (module, "", rest),
    }
}
