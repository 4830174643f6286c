//! JUnit XML report generation.
//!
//! Tests are grouped into one `<testsuite>` per test class, named
//! `Module.Class`. Each test carries its final state:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="3" failures="1" errors="1" time="84.120">
//!   <testsuite name="AppTests.LoginTests" tests="3" failures="1" errors="1" skipped="0" time="3.500" timestamp="2026-03-02T09:14:05">
//!     <testcase classname="AppTests.LoginTests" name="testValid()" time="1.200"/>
//!     <testcase classname="AppTests.LoginTests" name="testExpired()" time="2.300">
//!       <failure message="Failed">XCTAssertEqual failed: ("401") is not equal to ("200")</failure>
//!     </testcase>
//!     <testcase classname="AppTests.LoginTests" name="testLocked()" time="0.000">
//!       <error message="was not executed" type="Unexecuted"/>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::{Reporter, split_test_id};
use crate::ledger::{NOT_EXECUTED_MESSAGE, TestCase, TestState};
use crate::orchestrator::RunResult;

/// Reporter that writes a JUnit XML file when the run completes.
///
/// Parent directories are created if they don't exist.
pub struct JUnitReporter {
    output_path: PathBuf,
}

impl JUnitReporter {
    /// Creates a new JUnit reporter that writes to the given path.
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    /// Generate JUnit XML content from the final test states.
    pub fn generate_xml(&self, run_result: &RunResult) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let mut suites: BTreeMap<String, Vec<&TestCase>> = BTreeMap::new();
        for test in &run_result.tests {
            suites.entry(suite_name(&test.id)).or_default().push(test);
        }

        let timestamp = run_result
            .started_at
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string();

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("tests", run_result.total.to_string().as_str()));
        testsuites.push_attribute(("failures", run_result.failed.to_string().as_str()));
        testsuites.push_attribute(("errors", run_result.unexecuted.to_string().as_str()));
        testsuites.push_attribute((
            "time",
            format!("{:.3}", run_result.duration.as_secs_f64()).as_str(),
        ));
        writer.write_event(Event::Start(testsuites))?;

        for (name, tests) in &suites {
            write_testsuite(&mut writer, name, tests, &timestamp)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        Ok(String::from_utf8(writer.into_inner())?)
    }
}

fn suite_name(id: &str) -> String {
    match split_test_id(id) {
        (module, "", _) => module.to_string(),
        (module, class, _) => format!("{}.{}", module, class.replace('/', ".")),
    }
}

fn write_testsuite<W: std::io::Write>(
    writer: &mut Writer<W>,
    name: &str,
    tests: &[&TestCase],
    timestamp: &str,
) -> anyhow::Result<()> {
    let count = |state: TestState| tests.iter().filter(|t| t.state == state).count();
    let time: f64 = tests.iter().map(|t| t.duration.as_secs_f64()).sum();

    let mut testsuite = BytesStart::new("testsuite");
    testsuite.push_attribute(("name", name));
    testsuite.push_attribute(("tests", tests.len().to_string().as_str()));
    testsuite.push_attribute(("failures", count(TestState::Failed).to_string().as_str()));
    testsuite.push_attribute(("errors", count(TestState::Unexecuted).to_string().as_str()));
    testsuite.push_attribute(("skipped", "0"));
    testsuite.push_attribute(("time", format!("{:.3}", time).as_str()));
    testsuite.push_attribute(("timestamp", timestamp));
    writer.write_event(Event::Start(testsuite))?;

    for test in tests {
        write_testcase(writer, name, test)?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    Ok(())
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    classname: &str,
    test: &TestCase,
) -> anyhow::Result<()> {
    let (_, _, name) = split_test_id(&test.id);

    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", classname));
    testcase.push_attribute(("name", name));
    testcase.push_attribute((
        "time",
        format!("{:.3}", test.duration.as_secs_f64()).as_str(),
    ));

    match test.state {
        TestState::Pass => {
            writer.write_event(Event::Empty(testcase))?;
        }
        TestState::Failed => {
            writer.write_event(Event::Start(testcase))?;

            let mut failure = BytesStart::new("failure");
            failure.push_attribute(("message", "Failed"));
            writer.write_event(Event::Start(failure))?;
            let message = strip_invalid_chars(&test.message);
            if !message.is_empty() {
                writer.write_event(Event::Text(BytesText::new(&message)))?;
            }
            writer.write_event(Event::End(BytesEnd::new("failure")))?;

            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
        TestState::Unexecuted => {
            writer.write_event(Event::Start(testcase))?;

            let message = if test.message.is_empty() {
                NOT_EXECUTED_MESSAGE.to_string()
            } else {
                strip_invalid_chars(&test.message)
            };
            let mut error = BytesStart::new("error");
            error.push_attribute(("message", message.as_str()));
            error.push_attribute(("type", "Unexecuted"));
            writer.write_event(Event::Empty(error))?;

            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
    }

    Ok(())
}

/// Drops characters XML 1.0 cannot carry. Escaping is left to the writer.
fn strip_invalid_chars(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_run_start(&self, _tests: &[TestCase]) {}

    async fn on_test_complete(&self, _test: &TestCase, _requeued: bool) {}

    async fn on_node_complete(&self, _node: &str) {}

    async fn on_run_complete(&self, result: &RunResult) {
        match self.generate_xml(result) {
            Ok(xml) => {
                if let Some(parent) = self.output_path.parent()
                    && !parent.exists()
                    && let Err(e) = std::fs::create_dir_all(parent)
                {
                    tracing::error!("Failed to create output directory: {}", e);
                    return;
                }

                if let Err(e) = std::fs::write(&self.output_path, xml) {
                    tracing::error!("Failed to write JUnit XML: {}", e);
                } else {
                    tracing::info!("JUnit XML written to: {}", self.output_path.display());
                }
            }
            Err(e) => {
                tracing::error!("Failed to generate JUnit XML: {}", e);
            }
        }
    }
}
