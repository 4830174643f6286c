//! Closed registry of record shapes and supertype-chain resolution.
//!
//! Every object in a result graph declares its type:
//!
//! ```json
//! { "_type": { "_name": "ActionTestMetadata",
//!              "_supertype": { "_name": "ActionTestSummaryIdentifiableObject",
//!                              "_supertype": { "_name": "ActionAbstractTestSummary" } } } }
//! ```
//!
//! A name found in the registry resolves directly. An unknown name resolves
//! to its nearest known ancestor, so newer tool versions that introduce
//! subtypes still decode. A chain with no known member resolves to
//! [`Shape::Untyped`].

use serde::Deserialize;

macro_rules! type_families {
    ($($name:ident),+ $(,)?) => {
        /// A record type known to the decoder.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum TypeFamily {
            $($name),+
        }

        impl TypeFamily {
            /// Looks up a declared type name.
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $(stringify!($name) => Some(Self::$name),)+
                    _ => None,
                }
            }

            /// The declared type name of this family.
            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$name => stringify!($name),)+
                }
            }
        }
    };
}

type_families! {
    ActionAbstractTestSummary,
    ActionDeviceRecord,
    ActionPlatformRecord,
    ActionRecord,
    ActionResult,
    ActionRunDestinationRecord,
    ActionSDKRecord,
    ActionTestActivitySummary,
    ActionTestAttachment,
    ActionTestFailureSummary,
    ActionTestMetadata,
    ActionTestPerformanceMetricSummary,
    ActionTestPlanRunSummaries,
    ActionTestPlanRunSummary,
    ActionTestSummary,
    ActionTestSummaryGroup,
    ActionTestSummaryIdentifiableObject,
    ActionTestableSummary,
    ActionsInvocationMetadata,
    ActionsInvocationRecord,
    ActivityLogAnalyzerControlFlowStep,
    ActivityLogAnalyzerControlFlowStepEdge,
    ActivityLogAnalyzerEventStep,
    ActivityLogAnalyzerResultMessage,
    ActivityLogAnalyzerStep,
    ActivityLogAnalyzerWarningMessage,
    ActivityLogCommandInvocationSection,
    ActivityLogMajorSection,
    ActivityLogMessage,
    ActivityLogMessageAnnotation,
    ActivityLogSection,
    ActivityLogTargetBuildSection,
    ActivityLogUnitTestSection,
    ArchiveInfo,
    Array,
    Bool,
    CodeCoverageInfo,
    Date,
    DocumentLocation,
    Double,
    EntityIdentifier,
    Int,
    IssueSummary,
    ObjectID,
    Reference,
    ResultIssueSummaries,
    ResultMetrics,
    SortedKeyValueArray,
    SortedKeyValueArrayPair,
    String,
    TestFailureIssueSummary,
    TypeDefinition,
}

impl TypeFamily {
    /// Returns `true` for the scalar wrappers (`{"_type": ..., "_value": ...}`).
    pub fn is_scalar(self) -> bool {
        matches!(
            self,
            Self::Bool | Self::Date | Self::Double | Self::Int | Self::String
        )
    }
}

/// The runtime shape of an object after resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// The declared type, or its nearest ancestor, is in the registry.
    Known(TypeFamily),
    /// Nothing in the chain is known.
    Untyped,
}

/// The `_type` header carried by every object.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ObjectType {
    /// Declared type name.
    #[serde(rename = "_name")]
    pub name: String,

    /// Declared parent type.
    #[serde(rename = "_supertype")]
    pub supertype: Option<Box<ObjectType>>,
}

impl ObjectType {
    /// Creates a header with no supertype.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            supertype: None,
        }
    }

    /// Type names from the declared type up to the root.
    pub fn chain(&self) -> impl Iterator<Item = &str> {
        std::iter::successors(Some(self), |t| t.supertype.as_deref()).map(|t| t.name.as_str())
    }

    /// Resolves this header against the registry.
    pub fn resolve(&self) -> Shape {
        resolve_chain(self.chain())
    }
}

/// Resolves the first known name in a type chain.
///
/// ```
/// use xcfleet::xcresult::registry::{Shape, TypeFamily, resolve_chain};
///
/// let shape = resolve_chain(["ActionTestMetadataV9", "ActionTestMetadata"]);
/// assert_eq!(shape, Shape::Known(TypeFamily::ActionTestMetadata));
/// assert_eq!(resolve_chain(["Mystery", "Enigma"]), Shape::Untyped);
/// ```
pub fn resolve_chain<'a>(names: impl IntoIterator<Item = &'a str>) -> Shape {
    names
        .into_iter()
        .find_map(TypeFamily::from_name)
        .map_or(Shape::Untyped, Shape::Known)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> ObjectType {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_known_name_resolves_directly() {
        let ty = parse(r#"{"_name": "ActionTestSummaryGroup"}"#);
        assert_eq!(ty.resolve(), Shape::Known(TypeFamily::ActionTestSummaryGroup));
    }

    #[test]
    fn test_unknown_name_falls_back_to_nearest_ancestor() {
        let ty = parse(
            r#"{"_name": "ActionTestRepetitionGroup",
                "_supertype": {"_name": "ActionTestSummaryGroup",
                               "_supertype": {"_name": "ActionTestSummaryIdentifiableObject"}}}"#,
        );
        assert_eq!(ty.resolve(), Shape::Known(TypeFamily::ActionTestSummaryGroup));
    }

    #[test]
    fn test_exhausted_chain_is_untyped() {
        let ty = parse(r#"{"_name": "Future", "_supertype": {"_name": "FutureBase"}}"#);
        assert_eq!(ty.resolve(), Shape::Untyped);
        assert_eq!(ty.chain().collect::<Vec<_>>(), vec!["Future", "FutureBase"]);
    }

    #[test]
    fn test_name_round_trip_and_scalars() {
        assert_eq!(TypeFamily::from_name("Double"), Some(TypeFamily::Double));
        assert_eq!(TypeFamily::ActionsInvocationRecord.name(), "ActionsInvocationRecord");
        assert!(TypeFamily::Date.is_scalar());
        assert!(!TypeFamily::Array.is_scalar());
        assert!(TypeFamily::from_name("actionrecord").is_none());
    }
}
