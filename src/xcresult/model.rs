//! Record types decoded from a result graph.
//!
//! Only the records on the path from the invocation root to individual
//! test outcomes are modeled:
//!
//! ```text
//! ActionsInvocationRecord
//! └── actions[]: ActionRecord
//!     └── actionResult: ActionResult
//!         └── testsRef ─ ─► ActionTestPlanRunSummaries        (separate fetch)
//!                           └── summaries[]: ActionTestPlanRunSummary
//!                               └── testableSummaries[]: ActionTestableSummary
//!                                   └── tests[]: Group | Metadata (recursive)
//!                                                   └── summaryRef ─ ─► ActionTestSummary
//! ```

use super::registry::{ObjectType, Shape, TypeFamily, resolve_chain};
use super::value::Object;
use super::{DecodeError, DecodeResult};

/// A record that can be decoded from an object node of one family.
pub trait Record: Sized {
    /// The family an object must resolve to.
    const FAMILY: TypeFamily;

    /// Decodes the fields of an object already known to be of [`Self::FAMILY`].
    fn decode_fields(obj: &Object<'_>) -> DecodeResult<Self>;
}

/// Decodes `obj` as `T`, checking its resolved shape first.
pub fn decode<T: Record>(obj: &Object<'_>) -> DecodeResult<T> {
    let header = obj.object_type()?;
    match header.resolve() {
        Shape::Known(family) if family == T::FAMILY => T::decode_fields(obj),
        Shape::Known(family) => Err(DecodeError::TypeMismatch {
            expected: T::FAMILY.name(),
            found: family.name().to_string(),
        }),
        Shape::Untyped => Err(DecodeError::UnresolvedType(header.name)),
    }
}

fn decode_array<T: Record>(obj: &Object<'_>, key: &str) -> DecodeResult<Vec<T>> {
    obj.array(key)?.iter().map(decode).collect()
}

fn decode_optional<T: Record>(obj: &Object<'_>, key: &str) -> DecodeResult<Option<T>> {
    obj.object(key).as_ref().map(decode).transpose()
}

/// Root of a result bundle.
#[derive(Debug, Clone)]
pub struct ActionsInvocationRecord {
    pub actions: Vec<ActionRecord>,
}

impl Record for ActionsInvocationRecord {
    const FAMILY: TypeFamily = TypeFamily::ActionsInvocationRecord;

    fn decode_fields(obj: &Object<'_>) -> DecodeResult<Self> {
        Ok(Self {
            actions: decode_array(obj, "actions")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub title: Option<String>,
    pub action_result: ActionResult,
}

impl Record for ActionRecord {
    const FAMILY: TypeFamily = TypeFamily::ActionRecord;

    fn decode_fields(obj: &Object<'_>) -> DecodeResult<Self> {
        let action_result = decode_optional(obj, "actionResult")?.ok_or(
            DecodeError::MissingField {
                record: "ActionRecord",
                field: "actionResult",
            },
        )?;
        Ok(Self {
            title: obj.string("title"),
            action_result,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ActionResult {
    pub status: Option<String>,
    pub tests_ref: Option<Reference>,
}

impl Record for ActionResult {
    const FAMILY: TypeFamily = TypeFamily::ActionResult;

    fn decode_fields(obj: &Object<'_>) -> DecodeResult<Self> {
        Ok(Self {
            status: obj.string("status"),
            tests_ref: decode_optional(obj, "testsRef")?,
        })
    }
}

/// A content-addressed pointer to another object in the same bundle.
#[derive(Debug, Clone)]
pub struct Reference {
    pub id: String,
    pub target_type: Option<TypeDefinition>,
}

impl Record for Reference {
    const FAMILY: TypeFamily = TypeFamily::Reference;

    fn decode_fields(obj: &Object<'_>) -> DecodeResult<Self> {
        Ok(Self {
            id: obj.require_string("Reference", "id")?,
            target_type: decode_optional(obj, "targetType")?,
        })
    }
}

impl Reference {
    /// The shape the referenced object is declared to have.
    pub fn target_shape(&self) -> Option<Shape> {
        self.target_type
            .as_ref()
            .map(|definition| resolve_chain(definition.chain()))
    }
}

/// A type description embedded in a [`Reference`].
///
/// Unlike the `_type` header, its name is a wrapped `String` value and its
/// parent is a nested `TypeDefinition` object.
#[derive(Debug, Clone)]
pub struct TypeDefinition {
    pub name: String,
    pub supertype: Option<Box<TypeDefinition>>,
}

impl Record for TypeDefinition {
    const FAMILY: TypeFamily = TypeFamily::TypeDefinition;

    fn decode_fields(obj: &Object<'_>) -> DecodeResult<Self> {
        Ok(Self {
            name: obj.require_string("TypeDefinition", "name")?,
            supertype: decode_optional::<TypeDefinition>(obj, "supertype")?.map(Box::new),
        })
    }
}

impl TypeDefinition {
    /// Type names from this definition up to the root.
    pub fn chain(&self) -> impl Iterator<Item = &str> {
        std::iter::successors(Some(self), |t| t.supertype.as_deref()).map(|t| t.name.as_str())
    }
}

impl From<&TypeDefinition> for ObjectType {
    fn from(definition: &TypeDefinition) -> Self {
        ObjectType {
            name: definition.name.clone(),
            supertype: definition
                .supertype
                .as_deref()
                .map(|parent| Box::new(ObjectType::from(parent))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActionTestPlanRunSummaries {
    pub summaries: Vec<ActionTestPlanRunSummary>,
}

impl Record for ActionTestPlanRunSummaries {
    const FAMILY: TypeFamily = TypeFamily::ActionTestPlanRunSummaries;

    fn decode_fields(obj: &Object<'_>) -> DecodeResult<Self> {
        Ok(Self {
            summaries: decode_array(obj, "summaries")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ActionTestPlanRunSummary {
    pub name: Option<String>,
    pub testable_summaries: Vec<ActionTestableSummary>,
}

impl Record for ActionTestPlanRunSummary {
    const FAMILY: TypeFamily = TypeFamily::ActionTestPlanRunSummary;

    fn decode_fields(obj: &Object<'_>) -> DecodeResult<Self> {
        Ok(Self {
            name: obj.string("name"),
            testable_summaries: decode_array(obj, "testableSummaries")?,
        })
    }
}

/// All tests of one test bundle (one module).
#[derive(Debug, Clone)]
pub struct ActionTestableSummary {
    pub name: Option<String>,
    pub target_name: Option<String>,
    pub tests: Vec<TestNode>,
}

impl Record for ActionTestableSummary {
    const FAMILY: TypeFamily = TypeFamily::ActionTestableSummary;

    fn decode_fields(obj: &Object<'_>) -> DecodeResult<Self> {
        Ok(Self {
            name: obj.string("name"),
            target_name: obj.string("targetName"),
            tests: decode_test_nodes(obj, "tests")?,
        })
    }
}

impl ActionTestableSummary {
    /// Every leaf test, with identifiers prefixed by the target name.
    pub fn test_metadata(&self) -> Vec<ActionTestMetadata> {
        let mut leaves = Vec::new();
        collect_leaves(&self.tests, &mut leaves);
        if let Some(target) = self.target_name.as_deref().or(self.name.as_deref()) {
            for leaf in &mut leaves {
                leaf.identifier = format!("{}/{}", target, leaf.identifier);
            }
        }
        leaves
    }
}

fn collect_leaves(nodes: &[TestNode], leaves: &mut Vec<ActionTestMetadata>) {
    for node in nodes {
        match node {
            TestNode::Group(group) => collect_leaves(&group.subtests, leaves),
            TestNode::Metadata(metadata) => leaves.push(metadata.clone()),
        }
    }
}

/// An element of a polymorphic test tree.
#[derive(Debug, Clone)]
pub enum TestNode {
    Group(ActionTestSummaryGroup),
    Metadata(ActionTestMetadata),
}

/// Decodes a polymorphic test list.
///
/// Elements resolving to a known record outside the test tree are skipped;
/// elements with no resolvable ancestor are an error.
fn decode_test_nodes(obj: &Object<'_>, key: &str) -> DecodeResult<Vec<TestNode>> {
    let mut nodes = Vec::new();
    for item in obj.array(key)? {
        let header = item.object_type()?;
        match header.resolve() {
            Shape::Known(TypeFamily::ActionTestSummaryGroup) => {
                nodes.push(TestNode::Group(ActionTestSummaryGroup::decode_fields(&item)?));
            }
            Shape::Known(TypeFamily::ActionTestMetadata) => {
                nodes.push(TestNode::Metadata(ActionTestMetadata::decode_fields(&item)?));
            }
            Shape::Known(other) => {
                tracing::debug!("skipping {} in {}", other.name(), key);
            }
            Shape::Untyped => return Err(DecodeError::UnresolvedType(header.name)),
        }
    }
    Ok(nodes)
}

#[derive(Debug, Clone)]
pub struct ActionTestSummaryGroup {
    pub name: Option<String>,
    pub identifier: Option<String>,
    pub duration: Option<f64>,
    pub subtests: Vec<TestNode>,
}

impl Record for ActionTestSummaryGroup {
    const FAMILY: TypeFamily = TypeFamily::ActionTestSummaryGroup;

    fn decode_fields(obj: &Object<'_>) -> DecodeResult<Self> {
        Ok(Self {
            name: obj.string("name"),
            identifier: obj.string("identifier"),
            duration: obj.double("duration")?,
            subtests: decode_test_nodes(obj, "subtests")?,
        })
    }
}

/// A leaf test as listed in the test tree.
#[derive(Debug, Clone)]
pub struct ActionTestMetadata {
    pub identifier: String,
    pub name: Option<String>,
    pub test_status: String,
    pub duration: Option<f64>,
    pub summary_ref: Option<Reference>,
}

impl Record for ActionTestMetadata {
    const FAMILY: TypeFamily = TypeFamily::ActionTestMetadata;

    fn decode_fields(obj: &Object<'_>) -> DecodeResult<Self> {
        Ok(Self {
            identifier: obj.require_string("ActionTestMetadata", "identifier")?,
            name: obj.string("name"),
            test_status: obj.require_string("ActionTestMetadata", "testStatus")?,
            duration: obj.double("duration")?,
            summary_ref: decode_optional(obj, "summaryRef")?,
        })
    }
}

/// Full detail of one test run, fetched through [`ActionTestMetadata::summary_ref`].
#[derive(Debug, Clone)]
pub struct ActionTestSummary {
    pub identifier: Option<String>,
    pub name: Option<String>,
    pub test_status: Option<String>,
    pub duration: Option<f64>,
    pub failure_summaries: Vec<ActionTestFailureSummary>,
    pub activity_summaries: Vec<ActionTestActivitySummary>,
}

impl Record for ActionTestSummary {
    const FAMILY: TypeFamily = TypeFamily::ActionTestSummary;

    fn decode_fields(obj: &Object<'_>) -> DecodeResult<Self> {
        Ok(Self {
            identifier: obj.string("identifier"),
            name: obj.string("name"),
            test_status: obj.string("testStatus"),
            duration: obj.double("duration")?,
            failure_summaries: decode_array(obj, "failureSummaries")?,
            activity_summaries: decode_array(obj, "activitySummaries")?,
        })
    }
}

/// Activity type of XCTest assertion failures.
pub const ASSERTION_FAILURE_ACTIVITY: &str = "com.apple.dt.xctest.activity-type.testAssertionFailure";

impl ActionTestSummary {
    /// Human-readable failure description.
    ///
    /// Structured failure messages joined by spaces, or, when there are
    /// none, the titles of assertion-failure activities joined by newlines.
    pub fn failure_message(&self) -> String {
        let messages: Vec<&str> = self
            .failure_summaries
            .iter()
            .filter_map(|f| f.message.as_deref())
            .collect();
        if !messages.is_empty() {
            return messages.join(" ");
        }

        let mut titles = Vec::new();
        collect_assertion_titles(&self.activity_summaries, &mut titles);
        titles.join("\n")
    }
}

fn collect_assertion_titles<'a>(
    activities: &'a [ActionTestActivitySummary],
    titles: &mut Vec<&'a str>,
) {
    for activity in activities {
        if activity.activity_type.as_deref() == Some(ASSERTION_FAILURE_ACTIVITY) {
            titles.push(&activity.title);
        }
        collect_assertion_titles(&activity.subactivities, titles);
    }
}

#[derive(Debug, Clone)]
pub struct ActionTestFailureSummary {
    pub message: Option<String>,
    pub file_name: Option<String>,
    pub line_number: Option<i64>,
}

impl Record for ActionTestFailureSummary {
    const FAMILY: TypeFamily = TypeFamily::ActionTestFailureSummary;

    fn decode_fields(obj: &Object<'_>) -> DecodeResult<Self> {
        Ok(Self {
            message: obj.string("message"),
            file_name: obj.string("fileName"),
            line_number: obj.int("lineNumber")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ActionTestActivitySummary {
    pub title: String,
    pub activity_type: Option<String>,
    pub subactivities: Vec<ActionTestActivitySummary>,
}

impl Record for ActionTestActivitySummary {
    const FAMILY: TypeFamily = TypeFamily::ActionTestActivitySummary;

    fn decode_fields(obj: &Object<'_>) -> DecodeResult<Self> {
        Ok(Self {
            title: obj.string("title").unwrap_or_default(),
            activity_type: obj.string("activityType"),
            subactivities: decode_array(obj, "subactivities")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    fn s(value: &str) -> Value {
        json!({ "_type": { "_name": "String" }, "_value": value })
    }

    fn metadata(identifier: &str, status: &str) -> Value {
        json!({
            "_type": { "_name": "ActionTestMetadata",
                       "_supertype": { "_name": "ActionTestSummaryIdentifiableObject" } },
            "identifier": s(identifier),
            "testStatus": s(status),
            "duration": { "_type": { "_name": "Double" }, "_value": "1.5" }
        })
    }

    fn testable(tests: Vec<Value>) -> Value {
        json!({
            "_type": { "_name": "ActionTestableSummary" },
            "targetName": s("AppTests"),
            "tests": { "_type": { "_name": "Array" }, "_values": tests }
        })
    }

    #[test]
    fn test_testable_flattens_groups_and_prefixes_target() {
        let value = testable(vec![json!({
            "_type": { "_name": "ActionTestSummaryGroup" },
            "name": s("AppTests.xctest"),
            "subtests": { "_type": { "_name": "Array" }, "_values": [
                {
                    "_type": { "_name": "ActionTestSummaryGroup" },
                    "name": s("LoginTests"),
                    "subtests": { "_type": { "_name": "Array" }, "_values": [
                        metadata("LoginTests/testValid()", "Success"),
                        metadata("LoginTests/testInvalid()", "Failure")
                    ]}
                }
            ]}
        })]);

        let summary: ActionTestableSummary = decode(&Object::from_value(&value).unwrap()).unwrap();
        let leaves = summary.test_metadata();

        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0].identifier, "AppTests/LoginTests/testValid()");
        assert_eq!(leaves[1].test_status, "Failure");
        assert_eq!(leaves[1].duration, Some(1.5));
    }

    #[test]
    fn test_unknown_subtype_decodes_as_ancestor() {
        let value = testable(vec![json!({
            "_type": { "_name": "ActionTestMetadataV2",
                       "_supertype": { "_name": "ActionTestMetadata" } },
            "identifier": s("LoginTests/testValid()"),
            "testStatus": s("Success")
        })]);

        let summary: ActionTestableSummary = decode(&Object::from_value(&value).unwrap()).unwrap();
        assert_eq!(summary.test_metadata().len(), 1);
    }

    #[test]
    fn test_unresolvable_subtype_is_an_error() {
        let value = testable(vec![json!({
            "_type": { "_name": "QuantumTest", "_supertype": { "_name": "QuantumBase" } }
        })]);

        let err = decode::<ActionTestableSummary>(&Object::from_value(&value).unwrap()).unwrap_err();
        assert!(matches!(err, DecodeError::UnresolvedType(name) if name == "QuantumTest"));
    }

    #[test]
    fn test_known_foreign_record_is_skipped() {
        let value = testable(vec![
            json!({ "_type": { "_name": "ActionTestAttachment" } }),
            metadata("LoginTests/testValid()", "Success"),
        ]);

        let summary: ActionTestableSummary = decode(&Object::from_value(&value).unwrap()).unwrap();
        assert_eq!(summary.tests.len(), 1);
    }

    #[test]
    fn test_type_mismatch() {
        let value = metadata("LoginTests/testValid()", "Success");
        let err = decode::<ActionTestSummary>(&Object::from_value(&value).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::TypeMismatch { expected: "ActionTestSummary", .. }
        ));
    }

    #[test]
    fn test_reference_target_shape() {
        let value = json!({
            "_type": { "_name": "Reference" },
            "id": s("0~abc"),
            "targetType": {
                "_type": { "_name": "TypeDefinition" },
                "name": s("ActionTestSummaryV3"),
                "supertype": {
                    "_type": { "_name": "TypeDefinition" },
                    "name": s("ActionTestSummary")
                }
            }
        });

        let reference: Reference = decode(&Object::from_value(&value).unwrap()).unwrap();
        assert_eq!(reference.id, "0~abc");
        assert_eq!(
            reference.target_shape(),
            Some(Shape::Known(TypeFamily::ActionTestSummary))
        );
        let header = ObjectType::from(reference.target_type.as_ref().unwrap());
        assert_eq!(header.chain().count(), 2);
    }

    #[test]
    fn test_failure_message_prefers_structured_messages() {
        let summary = ActionTestSummary {
            identifier: None,
            name: None,
            test_status: Some("Failure".into()),
            duration: None,
            failure_summaries: vec![
                ActionTestFailureSummary {
                    message: Some("XCTAssertEqual failed".into()),
                    file_name: None,
                    line_number: Some(12),
                },
                ActionTestFailureSummary {
                    message: Some("(\"1\") is not equal to (\"2\")".into()),
                    file_name: None,
                    line_number: None,
                },
            ],
            activity_summaries: vec![],
        };
        assert_eq!(
            summary.failure_message(),
            "XCTAssertEqual failed (\"1\") is not equal to (\"2\")"
        );
    }

    #[test]
    fn test_failure_message_falls_back_to_assertion_titles() {
        let activity = |title: &str, kind: &str, sub: Vec<ActionTestActivitySummary>| {
            ActionTestActivitySummary {
                title: title.into(),
                activity_type: Some(kind.into()),
                subactivities: sub,
            }
        };
        let summary = ActionTestSummary {
            identifier: None,
            name: None,
            test_status: Some("Failure".into()),
            duration: None,
            failure_summaries: vec![],
            activity_summaries: vec![activity(
                "Start Test",
                "com.apple.dt.xctest.activity-type.internal",
                vec![
                    activity("Tap button", "com.apple.dt.xctest.activity-type.userCreated", vec![]),
                    activity("Button not found", ASSERTION_FAILURE_ACTIVITY, vec![]),
                ],
            )],
        };
        assert_eq!(summary.failure_message(), "Button not found");
    }
}
