//! Result bundle decoding.
//!
//! A batch run leaves an `.xcresult` bundle behind. Its content is a graph
//! of self-describing objects obtained one node at a time from
//! `xcresulttool`: the root record, then any referenced object by id. This
//! module walks that graph and reduces it to one [`TestOutcome`] per test.
//!
//! # Decoding pipeline
//!
//! ```text
//!   ObjectSource::fetch(None) ──► ActionsInvocationRecord
//!        │                              │ actions[].actionResult.testsRef
//!        │ fetch(Some(id)) ◄────────────┘
//!        ▼
//!   ActionTestPlanRunSummaries ──► testable summaries ──► leaf metadata
//!                                                            │
//!         status == "Success" ──► outcome(duration)          │
//!         otherwise ──► fetch(summaryRef) ──► outcome(duration, message)
//! ```
//!
//! Shapes are resolved through [`registry`]; see there for the supertype
//! fallback rules.
//!
//! # Errors
//!
//! Every failure is a [`DecodeError`]. Callers treat the whole batch as
//! unexecuted when decoding fails.

pub mod model;
pub mod registry;
pub mod value;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};

use crate::ledger::normalize_test_id;
use crate::transport::{Command, Session, TransportError};
use model::{
    ActionTestMetadata, ActionTestPlanRunSummaries, ActionTestSummary, ActionTestableSummary,
    ActionsInvocationRecord, Record, Reference,
};
use registry::Shape;
use value::Object;

/// Test status reported for passing tests.
pub const STATUS_SUCCESS: &str = "Success";

/// Result type for decoding operations.
pub type DecodeResult<T> = Result<T, DecodeError>;

/// Errors raised while reading a result bundle.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The bundle does not exist or holds no result.
    #[error("Result bundle not found: {0}")]
    MissingArtifact(PathBuf),

    /// The tool output is not valid JSON or a header is malformed.
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// No type in the declared chain is known.
    #[error("Unresolvable type '{0}'")]
    UnresolvedType(String),

    /// The object resolved to a different record than required.
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },

    /// A required field is absent.
    #[error("{record} is missing field '{field}'")]
    MissingField {
        record: &'static str,
        field: &'static str,
    },

    /// A field holds a value of the wrong form.
    #[error("Invalid value for '{field}': {value}")]
    InvalidValue { field: String, value: String },

    /// Fetching an object from the bundle failed.
    #[error("Failed to read result bundle: {0}")]
    Fetch(String),
}

impl From<TransportError> for DecodeError {
    fn from(err: TransportError) -> Self {
        DecodeError::Fetch(err.to_string())
    }
}

/// One decoded test result.
#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcome {
    /// `Target/Class/testMethod()` identifier.
    pub id: String,
    /// Raw status string (`Success`, `Failure`, `Skipped`, ...).
    pub status: String,
    pub duration: Duration,
    /// Failure description; empty for passing tests.
    pub message: String,
}

impl TestOutcome {
    /// Returns `true` if the test passed.
    pub fn passed(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

/// Supplier of JSON object graphs from result bundles.
#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Returns the JSON for the object `id`, or the root record when `None`.
    async fn fetch(&self, bundle: &Path, id: Option<&str>) -> DecodeResult<String>;
}

/// [`ObjectSource`] backed by `xcrun xcresulttool` run through a session.
pub struct XcResultTool<S> {
    session: S,
    legacy: bool,
}

impl<S: Session> XcResultTool<S> {
    /// Creates a tool wrapper. `legacy` adds `--legacy` (Xcode 16+).
    pub fn new(session: S, legacy: bool) -> Self {
        Self { session, legacy }
    }

    fn command(&self, subcommand: &str) -> Command {
        let cmd = Command::new("xcrun").arg("xcresulttool").arg(subcommand);
        if self.legacy && subcommand == "get" {
            cmd.arg("--legacy")
        } else {
            cmd
        }
    }

    /// Merges several bundles into one.
    pub async fn merge(&self, bundles: &[PathBuf], output: &Path) -> DecodeResult<()> {
        let cmd = self
            .command("merge")
            .args(bundles.iter().map(|b| b.to_string_lossy().into_owned()))
            .arg("--output-path")
            .arg(output.to_string_lossy());
        let result = self.session.exec(&cmd).await?;
        if !result.success() {
            return Err(DecodeError::Fetch(result.stderr.trim().to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: Session> ObjectSource for XcResultTool<S> {
    async fn fetch(&self, bundle: &Path, id: Option<&str>) -> DecodeResult<String> {
        let mut cmd = self.command("get").args(["--format", "json"]);
        if let Some(id) = id {
            cmd = cmd.arg("--id").arg(id);
        }
        cmd = cmd.arg("--path").arg(bundle.to_string_lossy());

        let result = self.session.exec(&cmd).await?;
        if !result.success() {
            return Err(DecodeError::Fetch(result.stderr.trim().to_string()));
        }
        Ok(result.stdout)
    }
}

/// A decoded view of one result bundle.
///
/// Indices are computed on first use and cached: the root record, the
/// identifier → metadata map, and per-test summaries fetched on demand.
pub struct ResultBundle<'s, S: ?Sized> {
    path: PathBuf,
    source: &'s S,
    record: OnceCell<ActionsInvocationRecord>,
    metadata: OnceCell<HashMap<String, ActionTestMetadata>>,
    summaries: Mutex<HashMap<String, ActionTestSummary>>,
}

impl<'s, S: ObjectSource + ?Sized> ResultBundle<'s, S> {
    /// Opens the bundle at `path`.
    pub fn open(path: impl Into<PathBuf>, source: &'s S) -> DecodeResult<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(DecodeError::MissingArtifact(path));
        }
        Ok(Self {
            path,
            source,
            record: OnceCell::new(),
            metadata: OnceCell::new(),
            summaries: Mutex::new(HashMap::new()),
        })
    }

    /// Path of the bundle on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn fetch_as<T: Record>(&self, id: Option<&str>) -> DecodeResult<T> {
        let json = self.source.fetch(&self.path, id).await?;
        let value: serde_json::Value = serde_json::from_str(&json)?;
        model::decode(&Object::from_value(&value)?)
    }

    /// Follows a reference, checking its declared target type first.
    pub async fn resolve<T: Record>(&self, reference: &Reference) -> DecodeResult<T> {
        match reference.target_shape() {
            None => {}
            Some(Shape::Known(family)) if family == T::FAMILY => {}
            Some(Shape::Known(family)) => {
                return Err(DecodeError::TypeMismatch {
                    expected: T::FAMILY.name(),
                    found: family.name().to_string(),
                });
            }
            Some(Shape::Untyped) => {
                let name = reference
                    .target_type
                    .as_ref()
                    .map(|t| t.name.clone())
                    .unwrap_or_default();
                return Err(DecodeError::UnresolvedType(name));
            }
        }
        self.fetch_as(Some(&reference.id)).await
    }

    /// The root record.
    pub async fn record(&self) -> DecodeResult<&ActionsInvocationRecord> {
        self.record.get_or_try_init(|| self.fetch_as(None)).await
    }

    /// Testable summaries of every test action in the bundle.
    pub async fn testable_summaries(&self) -> DecodeResult<Vec<ActionTestableSummary>> {
        let mut testables = Vec::new();
        for action in &self.record().await?.actions {
            let Some(tests_ref) = &action.action_result.tests_ref else {
                continue;
            };
            let plan_runs: ActionTestPlanRunSummaries = self.resolve(tests_ref).await?;
            for run in plan_runs.summaries {
                testables.extend(run.testable_summaries);
            }
        }
        Ok(testables)
    }

    /// Leaf metadata keyed by normalized identifier.
    ///
    /// When a test appears more than once (repetitions), a successful entry
    /// wins over others.
    pub async fn metadata(&self) -> DecodeResult<&HashMap<String, ActionTestMetadata>> {
        self.metadata
            .get_or_try_init(|| async move {
                let mut index: HashMap<String, ActionTestMetadata> = HashMap::new();
                for testable in self.testable_summaries().await? {
                    for leaf in testable.test_metadata() {
                        let key = normalize_test_id(&leaf.identifier).to_string();
                        let keep_existing = index
                            .get(&key)
                            .is_some_and(|existing| existing.test_status == STATUS_SUCCESS);
                        if !keep_existing {
                            index.insert(key, leaf);
                        }
                    }
                }
                Ok::<_, DecodeError>(index)
            })
            .await
    }

    /// Full summary of one test, fetched once and cached.
    pub async fn summary(&self, test_id: &str) -> DecodeResult<Option<ActionTestSummary>> {
        let key = normalize_test_id(test_id).to_string();
        if let Some(summary) = self.summaries.lock().await.get(&key) {
            return Ok(Some(summary.clone()));
        }

        let Some(reference) = self
            .metadata()
            .await?
            .get(&key)
            .and_then(|m| m.summary_ref.clone())
        else {
            return Ok(None);
        };

        let summary: ActionTestSummary = self.resolve(&reference).await?;
        self.summaries.lock().await.insert(key, summary.clone());
        Ok(Some(summary))
    }

    /// Reduces the bundle to one outcome per test.
    pub async fn test_outcomes(&self) -> DecodeResult<Vec<TestOutcome>> {
        let mut outcomes = Vec::new();
        for metadata in self.metadata().await?.values() {
            let duration = metadata
                .duration
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .unwrap_or_default();

            let message = if metadata.test_status == STATUS_SUCCESS {
                String::new()
            } else {
                self.summary(&metadata.identifier)
                    .await?
                    .map(|summary| summary.failure_message())
                    .unwrap_or_default()
            };

            outcomes.push(TestOutcome {
                id: metadata.identifier.clone(),
                status: metadata.test_status.clone(),
                duration,
                message,
            });
        }
        outcomes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(outcomes)
    }
}

/// Decodes every test outcome in the bundle at `path`.
pub async fn test_outcomes<S: ObjectSource + ?Sized>(
    source: &S,
    path: &Path,
) -> DecodeResult<Vec<TestOutcome>> {
    ResultBundle::open(path, source)?.test_outcomes().await
}

#[cfg(test)]
pub(crate) mod testing {
    //! An in-memory result graph for tests.

    use std::collections::HashMap;
    use std::path::Path;

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::{DecodeError, DecodeResult, ObjectSource};

    /// Serves a fixed root and referenced objects.
    #[derive(Default)]
    pub struct FakeSource {
        pub root: Option<Value>,
        pub objects: HashMap<String, Value>,
        pub fetches: std::sync::Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl ObjectSource for FakeSource {
        async fn fetch(&self, _bundle: &Path, id: Option<&str>) -> DecodeResult<String> {
            self.fetches.lock().unwrap().push(id.map(str::to_string));
            let value = match id {
                None => self.root.as_ref(),
                Some(id) => self.objects.get(id),
            };
            value
                .map(Value::to_string)
                .ok_or_else(|| DecodeError::Fetch(format!("no object {:?}", id)))
        }
    }

    pub fn s(value: &str) -> Value {
        json!({ "_type": { "_name": "String" }, "_value": value })
    }

    pub fn reference(id: &str, target: &str) -> Value {
        json!({
            "_type": { "_name": "Reference" },
            "id": s(id),
            "targetType": { "_type": { "_name": "TypeDefinition" }, "name": s(target) }
        })
    }

    pub fn leaf(identifier: &str, status: &str, summary_id: Option<&str>) -> Value {
        let mut leaf = json!({
            "_type": { "_name": "ActionTestMetadata" },
            "identifier": s(identifier),
            "testStatus": s(status),
            "duration": { "_type": { "_name": "Double" }, "_value": "0.5" }
        });
        if let Some(id) = summary_id {
            leaf["summaryRef"] = reference(id, "ActionTestSummary");
        }
        leaf
    }

    /// A bundle for target `AppTests` with the given leaves.
    pub fn bundle(leaves: Vec<Value>) -> FakeSource {
        let root = json!({
            "_type": { "_name": "ActionsInvocationRecord" },
            "actions": { "_type": { "_name": "Array" }, "_values": [{
                "_type": { "_name": "ActionRecord" },
                "actionResult": {
                    "_type": { "_name": "ActionResult" },
                    "testsRef": reference("tests-1", "ActionTestPlanRunSummaries")
                }
            }]}
        });
        let plan = json!({
            "_type": { "_name": "ActionTestPlanRunSummaries" },
            "summaries": { "_type": { "_name": "Array" }, "_values": [{
                "_type": { "_name": "ActionTestPlanRunSummary" },
                "testableSummaries": { "_type": { "_name": "Array" }, "_values": [{
                    "_type": { "_name": "ActionTestableSummary" },
                    "targetName": s("AppTests"),
                    "tests": { "_type": { "_name": "Array" }, "_values": [{
                        "_type": { "_name": "ActionTestSummaryGroup" },
                        "subtests": { "_type": { "_name": "Array" }, "_values": leaves }
                    }]}
                }]}
            }]}
        });

        let mut objects = HashMap::new();
        objects.insert("tests-1".to_string(), plan);
        FakeSource {
            root: Some(root),
            objects,
            fetches: Default::default(),
        }
    }

    pub fn failure_summary(message: &str) -> Value {
        json!({
            "_type": { "_name": "ActionTestSummary" },
            "testStatus": s("Failure"),
            "failureSummaries": { "_type": { "_name": "Array" }, "_values": [{
                "_type": { "_name": "ActionTestFailureSummary" },
                "message": s(message)
            }]}
        })
    }
}
