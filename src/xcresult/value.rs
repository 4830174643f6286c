//! Typed accessors over the raw JSON object graph.
//!
//! Field values in a result graph are never bare JSON scalars. Strings and
//! numbers are wrapped, arrays carry their elements under `_values`:
//!
//! ```json
//! { "identifier": { "_type": { "_name": "String" }, "_value": "LoginTests/testValid()" },
//!   "duration":   { "_type": { "_name": "Double" }, "_value": "0.42" },
//!   "subtests":   { "_type": { "_name": "Array" },  "_values": [ ... ] } }
//! ```

use serde::Deserialize;
use serde_json::{Map, Value};

use super::registry::{ObjectType, Shape};
use super::{DecodeError, DecodeResult};

/// A borrowed view of one object node.
#[derive(Debug, Clone, Copy)]
pub struct Object<'a> {
    fields: &'a Map<String, Value>,
}

impl<'a> Object<'a> {
    /// Wraps a JSON value that must be an object.
    pub fn from_value(value: &'a Value) -> DecodeResult<Self> {
        value
            .as_object()
            .map(|fields| Self { fields })
            .ok_or_else(|| DecodeError::InvalidValue {
                field: "<object>".to_string(),
                value: truncate(&value.to_string()),
            })
    }

    /// The `_type` header of this node.
    pub fn object_type(&self) -> DecodeResult<ObjectType> {
        let header = self
            .fields
            .get("_type")
            .ok_or_else(|| DecodeError::MissingField {
                record: "object",
                field: "_type",
            })?;
        Ok(ObjectType::deserialize(header)?)
    }

    /// Resolves this node's runtime shape.
    pub fn shape(&self) -> DecodeResult<Shape> {
        Ok(self.object_type()?.resolve())
    }

    /// A nested object field.
    pub fn object(&self, key: &str) -> Option<Object<'a>> {
        self.fields
            .get(key)
            .and_then(Value::as_object)
            .map(|fields| Object { fields })
    }

    /// A wrapped scalar field, as its raw string form.
    pub fn string(&self, key: &str) -> Option<String> {
        self.fields
            .get(key)
            .and_then(|v| v.get("_value"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// A wrapped scalar field that must be present.
    pub fn require_string(&self, record: &'static str, key: &'static str) -> DecodeResult<String> {
        self.string(key).ok_or(DecodeError::MissingField { record, field: key })
    }

    /// A wrapped `Double` field.
    pub fn double(&self, key: &str) -> DecodeResult<Option<f64>> {
        self.parsed(key)
    }

    /// A wrapped `Int` field.
    pub fn int(&self, key: &str) -> DecodeResult<Option<i64>> {
        self.parsed(key)
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> DecodeResult<Option<T>> {
        match self.string(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| DecodeError::InvalidValue {
                    field: key.to_string(),
                    value: raw,
                }),
        }
    }

    /// Elements of an `Array` field. A missing field is an empty array.
    pub fn array(&self, key: &str) -> DecodeResult<Vec<Object<'a>>> {
        let Some(values) = self.fields.get(key).and_then(|v| v.get("_values")) else {
            return Ok(Vec::new());
        };
        values
            .as_array()
            .ok_or_else(|| DecodeError::InvalidValue {
                field: key.to_string(),
                value: truncate(&values.to_string()),
            })?
            .iter()
            .map(Object::from_value)
            .collect()
    }
}

fn truncate(raw: &str) -> String {
    const LIMIT: usize = 80;
    match raw.char_indices().nth(LIMIT) {
        Some((idx, _)) => format!("{}...", &raw[..idx]),
        None => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::xcresult::registry::TypeFamily;

    fn node() -> Value {
        json!({
            "_type": { "_name": "ActionTestMetadata" },
            "identifier": { "_type": { "_name": "String" }, "_value": "LoginTests/testValid()" },
            "duration": { "_type": { "_name": "Double" }, "_value": "0.25" },
            "bogus": { "_type": { "_name": "Double" }, "_value": "fast" },
            "subtests": { "_type": { "_name": "Array" }, "_values": [
                { "_type": { "_name": "ActionTestSummaryGroup" } },
                { "_type": { "_name": "ActionTestMetadata" } }
            ]}
        })
    }

    #[test]
    fn test_scalars() {
        let value = node();
        let obj = Object::from_value(&value).unwrap();

        assert_eq!(obj.string("identifier").as_deref(), Some("LoginTests/testValid()"));
        assert_eq!(obj.double("duration").unwrap(), Some(0.25));
        assert_eq!(obj.double("missing").unwrap(), None);
        assert!(matches!(
            obj.double("bogus"),
            Err(DecodeError::InvalidValue { .. })
        ));
        assert!(matches!(
            obj.require_string("ActionTestMetadata", "testStatus"),
            Err(DecodeError::MissingField { field: "testStatus", .. })
        ));
    }

    #[test]
    fn test_arrays_and_shapes() {
        let value = node();
        let obj = Object::from_value(&value).unwrap();

        let items = obj.array("subtests").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[0].shape().unwrap(),
            Shape::Known(TypeFamily::ActionTestSummaryGroup)
        );
        assert!(obj.array("nothing").unwrap().is_empty());
    }

    #[test]
    fn test_non_object_is_rejected() {
        let value = json!([1, 2, 3]);
        assert!(Object::from_value(&value).is_err());
    }
}
