//! Test plan loading, test enumeration and filtering.
//!
//! The plan is an `.xctestrun` property list. It is converted to JSON with
//! `plutil` on the coordinator host and kept as a [`serde_json::Value`] so
//! keys this crate does not know about survive re-serialization untouched.
//!
//! Two layouts exist:
//!
//! | Layout | Shape |
//! |--------|-------|
//! | V1 | top-level map of blueprint name → test target (plus `__xctestrun_metadata__`) |
//! | V2 | `TestConfigurations[].TestTargets[]` |

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, bail};
use regex::Regex;
use serde_json::{Map, Value};

use crate::ledger::normalize_test_id;
use crate::transport::{Command, Session, shell_quote};

const METADATA_KEY: &str = "__xctestrun_metadata__";
const TEST_ROOT: &str = "__TESTROOT__";
const TEST_HOST: &str = "__TESTHOST__";
const RUNNER_APP: &str = "-Runner.app";

/// One test bundle: its module name and the path of its executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestTarget {
    pub module: String,
    pub executable: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    V1,
    V2,
}

/// A parsed `.xctestrun` file.
#[derive(Debug, Clone)]
pub struct XcTestRun {
    test_root: PathBuf,
    file_name: String,
    configuration: Option<String>,
    layout: Layout,
    root: Map<String, Value>,
}

impl XcTestRun {
    /// Builds a plan from the JSON form of the file at `path`.
    ///
    /// `configuration` selects a named test configuration (V2 only); when
    /// `None`, the first configuration is used.
    pub fn from_json(
        path: &Path,
        json: Value,
        configuration: Option<String>,
    ) -> anyhow::Result<Self> {
        let Value::Object(root) = json else {
            bail!("Test plan {} is not a dictionary", path.display());
        };
        let layout = if root.get("TestConfigurations").is_some_and(Value::is_array) {
            Layout::V2
        } else {
            Layout::V1
        };
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .with_context(|| format!("Test plan path has no file name: {}", path.display()))?;

        Ok(Self {
            test_root: path.parent().map(Path::to_path_buf).unwrap_or_default(),
            file_name,
            configuration,
            layout,
            root,
        })
    }

    /// Loads the plan at `path` by converting it with `plutil` through `local`.
    pub async fn load<S: Session + ?Sized>(
        local: &S,
        path: &Path,
        configuration: Option<String>,
    ) -> anyhow::Result<Self> {
        let cmd = Command::new("plutil").args(["-convert", "json", "-o", "-"]).arg(path.to_string_lossy());
        let result = local
            .exec(&cmd)
            .await
            .with_context(|| format!("Failed to convert {}", path.display()))?;
        if !result.success() {
            bail!(
                "plutil failed for {}: {}",
                path.display(),
                result.stderr.trim()
            );
        }
        let json: Value = serde_json::from_str(&result.stdout)
            .with_context(|| format!("Invalid test plan JSON for {}", path.display()))?;
        Self::from_json(path, json, configuration)
    }

    /// Directory containing the plan; `__TESTROOT__` expands to this.
    pub fn test_root(&self) -> &Path {
        &self.test_root
    }

    /// File name of the plan.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    fn selected_targets(&self) -> Vec<&Map<String, Value>> {
        match self.layout {
            Layout::V1 => self
                .root
                .iter()
                .filter(|(key, _)| key.as_str() != METADATA_KEY)
                .filter_map(|(_, target)| target.as_object())
                .collect(),
            Layout::V2 => {
                let configurations = self
                    .root
                    .get("TestConfigurations")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                let selected = configurations.iter().find(|config| match &self.configuration {
                    None => true,
                    Some(name) => config.get("Name").and_then(Value::as_str) == Some(name),
                });
                selected
                    .and_then(|config| config.get("TestTargets"))
                    .and_then(Value::as_array)
                    .map(|targets| targets.iter().filter_map(Value::as_object).collect())
                    .unwrap_or_default()
            }
        }
    }

    /// Every test target in every configuration, for in-place updates.
    fn all_targets_mut(&mut self) -> Vec<&mut Map<String, Value>> {
        match self.layout {
            Layout::V1 => self
                .root
                .iter_mut()
                .filter(|(key, _)| key.as_str() != METADATA_KEY)
                .filter_map(|(_, target)| target.as_object_mut())
                .collect(),
            Layout::V2 => self
                .root
                .get_mut("TestConfigurations")
                .and_then(Value::as_array_mut)
                .into_iter()
                .flatten()
                .filter_map(|config| config.get_mut("TestTargets"))
                .filter_map(Value::as_array_mut)
                .flatten()
                .filter_map(Value::as_object_mut)
                .collect(),
        }
    }

    fn expand_root(&self, raw: &str) -> String {
        raw.replace(TEST_ROOT, &self.test_root.to_string_lossy())
    }

    /// Test bundles with their executable paths.
    pub fn targets(&self) -> Vec<TestTarget> {
        self.selected_targets()
            .into_iter()
            .filter_map(|target| {
                let module = target.get("ProductModuleName")?.as_str()?.to_string();
                let executable = bundle_executable(target, &module)?;
                Some(TestTarget {
                    executable: PathBuf::from(self.expand_root(&executable)),
                    module,
                })
            })
            .collect()
    }

    /// Files the build needs on a node, relative to the test root.
    ///
    /// Paths inside a `*-Runner.app` bundle collapse to the bundle itself.
    pub fn dependent_files(&self) -> Vec<String> {
        let root = format!("{}/", self.test_root.to_string_lossy());
        let files: BTreeSet<String> = self
            .selected_targets()
            .into_iter()
            .filter_map(|target| target.get("DependentProductPaths")?.as_array())
            .flatten()
            .filter_map(Value::as_str)
            .map(|raw| {
                let path = self.expand_root(raw);
                let path = match path.find(RUNNER_APP) {
                    Some(idx) => path[..idx + RUNNER_APP.len()].to_string(),
                    None => path,
                };
                path.strip_prefix(&root).map(str::to_string).unwrap_or(path)
            })
            .collect();
        files.into_iter().collect()
    }

    fn identifiers(&self, key: &str) -> HashMap<String, Vec<String>> {
        self.selected_targets()
            .into_iter()
            .filter_map(|target| {
                let module = target.get("ProductModuleName")?.as_str()?.to_string();
                let ids = target
                    .get(key)
                    .and_then(Value::as_array)
                    .map(|ids| ids.iter().filter_map(Value::as_str).map(str::to_string).collect())
                    .unwrap_or_default();
                Some((module, ids))
            })
            .collect()
    }

    /// `OnlyTestIdentifiers` keyed by module.
    pub fn only_test_ids(&self) -> HashMap<String, Vec<String>> {
        self.identifiers("OnlyTestIdentifiers")
    }

    /// `SkipTestIdentifiers` keyed by module.
    pub fn skip_test_ids(&self) -> HashMap<String, Vec<String>> {
        self.identifiers("SkipTestIdentifiers")
    }

    /// Merges `values` into every target's `EnvironmentVariables`.
    /// Existing keys are overwritten.
    pub fn add_environment_variables(&mut self, values: &BTreeMap<String, String>) {
        if values.is_empty() {
            return;
        }
        for target in self.all_targets_mut() {
            let env = target
                .entry("EnvironmentVariables")
                .or_insert_with(|| Value::Object(Map::new()));
            if !env.is_object() {
                *env = Value::Object(Map::new());
            }
            if let Some(env) = env.as_object_mut() {
                for (key, value) in values {
                    env.insert(key.clone(), Value::String(value.clone()));
                }
            }
        }
    }

    /// Enables per-test timeouts with the given allowance in seconds.
    pub fn add_timeout(&mut self, secs: u64) {
        for target in self.all_targets_mut() {
            target.insert("TestTimeoutsEnabled".into(), Value::Bool(true));
            target.insert("DefaultTestExecutionTimeAllowance".into(), Value::from(secs));
        }
    }

    /// The plan as JSON.
    pub fn to_json(&self) -> Value {
        Value::Object(self.root.clone())
    }

    /// Writes the plan to `path` as an XML property list.
    pub async fn write_plist<S: Session + ?Sized>(
        &self,
        local: &S,
        path: &Path,
    ) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(&self.to_json())?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        let cmd = Command::new("plutil").args(["-convert", "xml1"]).arg(path.to_string_lossy());
        let result = local.exec(&cmd).await?;
        if !result.success() {
            bail!("plutil failed for {}: {}", path.display(), result.stderr.trim());
        }
        Ok(())
    }
}

/// Path of a test bundle's executable, with `__TESTHOST__` expanded.
fn bundle_executable(target: &Map<String, Value>, module: &str) -> Option<String> {
    let bundle = target.get("TestBundlePath")?.as_str()?;
    let name = bundle
        .rsplit('/')
        .next()
        .and_then(|last| last.split('.').next())
        .filter(|name| !name.is_empty())
        .unwrap_or(module);
    let path = if target_platform(target) == Some("MacOSX") {
        format!("{}/Contents/MacOS/{}", bundle, name)
    } else {
        format!("{}/{}", bundle, name)
    };
    match target.get("TestHostPath").and_then(Value::as_str) {
        Some(host) => Some(path.replace(TEST_HOST, host)),
        None => Some(path),
    }
}

/// Platform a target was built for, inferred from its library search paths.
fn target_platform(target: &Map<String, Value>) -> Option<&'static str> {
    let env = target.get("TestingEnvironmentVariables")?;
    for key in ["DYLD_FALLBACK_LIBRARY_PATH", "DYLD_LIBRARY_PATH"] {
        if let Some(paths) = env.get(key).and_then(Value::as_str) {
            if paths.contains("MacOSX.platform") {
                return Some("MacOSX");
            }
            if paths.contains("iPhoneSimulator.platform") {
                return Some("iPhoneSimulator");
            }
            return None;
        }
    }
    env.get("DYLD_INSERT_LIBRARIES")
        .and_then(Value::as_str)
        .filter(|libs| libs.contains("iPhoneOS.platform"))
        .map(|_| "iPhoneOS")
}

/// Shell pipeline listing the demangled symbols exported by a test executable.
fn dump_script(executable: &Path) -> String {
    format!(
        "nm -gU {} | cut -d' ' -f3 | xargs -s 131072 xcrun swift-demangle | cut -d' ' -f3",
        shell_quote(&executable.to_string_lossy()),
    )
}

static TEST_SYMBOL: OnceLock<Option<Regex>> = OnceLock::new();

/// Matches demangled test methods such as `AppTests.LoginTests.testValid()`.
fn is_test_symbol(line: &str) -> bool {
    TEST_SYMBOL
        .get_or_init(|| Regex::new(r"^[0-9a-zA-Z_.]+\.test[0-9a-zA-Z_]*\(\)$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(line))
}

/// Turns demangled `Module.Class.testName()` lines into test identifiers.
fn parse_dump(module: &str, output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| is_test_symbol(line))
        .filter_map(|line| {
            let mut components: Vec<&str> = line.split('.').collect();
            if components.len() < 2 {
                return None;
            }
            components[0] = module;
            Some(components.join("/"))
        })
        .collect()
}

/// Enumerates tests of every bundle in the plan.
///
/// A bundle whose executable cannot be read is logged and contributes no
/// tests.
pub async fn dump_tests<S: Session + ?Sized>(local: &S, plan: &XcTestRun) -> anyhow::Result<Vec<String>> {
    let mut tests = BTreeSet::new();
    for target in plan.targets() {
        let module = target
            .executable
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| target.module.clone());

        let result = local.exec(&Command::shell(dump_script(&target.executable))).await?;
        if !result.success() {
            tracing::error!(
                "Failed to list tests of {}: {}",
                target.executable.display(),
                result.stderr.trim()
            );
            continue;
        }

        let found = parse_dump(&module, &result.stdout);
        tracing::info!("{}: {} tests", target.module, found.len());
        tests.extend(found);
    }
    Ok(tests.into_iter().collect())
}

/// Whether `pattern` (without module) matches `components` component-wise.
fn matches_components(pattern: &str, components: &[&str]) -> bool {
    let parts: Vec<&str> = pattern.split('/').collect();
    parts.len() <= components.len()
        && parts
            .iter()
            .zip(components)
            .all(|(part, component)| normalize_test_id(part) == component.replace("()", ""))
}

/// Applies a plan's only/skip identifier lists to enumerated tests.
///
/// A module with no only-list keeps all its tests. Skip-lists always apply.
pub fn filter_tests(
    tests: Vec<String>,
    only: &HashMap<String, Vec<String>>,
    skip: &HashMap<String, Vec<String>>,
) -> Vec<String> {
    tests
        .into_iter()
        .filter(|test| {
            let mut components = test.split('/');
            let module = components.next().unwrap_or_default();
            let rest: Vec<&str> = components.collect();

            let included = match only.get(module) {
                Some(patterns) if !patterns.is_empty() => {
                    patterns.iter().any(|p| matches_components(p, &rest))
                }
                _ => true,
            };
            let skipped = skip
                .get(module)
                .is_some_and(|patterns| patterns.iter().any(|p| matches_components(p, &rest)));

            included && !skipped
        })
        .collect()
}

/// Parses an explicit test list: one identifier per line, `#` comments.
pub fn parse_test_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Reads an explicit test list from a file.
pub async fn read_test_list(path: &Path) -> anyhow::Result<Vec<String>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read test list {}", path.display()))?;
    Ok(parse_test_list(&content))
}
