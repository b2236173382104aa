//! Semantic variable typing shared by the canvas, the compiled schema and
//! the validator.
//!
//! Every node input and output is described by a [`Variable`]: a name, a
//! recursive [`DataType`], and optionally a [`VariableSource`] saying where
//! the value comes from at execution time (a literal, or a field produced by
//! another node). Type compatibility between a consumer's declared type and
//! its producer's declared type is the `unifies_with` relation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Recursive type of a workflow variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataType {
    String,
    Integer,
    /// Floating point. An `Integer` producer unifies with a `Number` consumer.
    Number,
    Boolean,
    /// Opaque file reference resolved through object storage.
    File,
    Object {
        #[serde(default)]
        fields: BTreeMap<String, DataType>,
    },
    List {
        element: Box<DataType>,
    },
}

impl DataType {
    pub fn object(fields: impl IntoIterator<Item = (String, DataType)>) -> Self {
        DataType::Object {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn list_of(element: DataType) -> Self {
        DataType::List {
            element: Box::new(element),
        }
    }

    /// An empty-field object, the canvas default for untyped object outputs.
    pub fn any_object() -> Self {
        DataType::Object {
            fields: BTreeMap::new(),
        }
    }

    pub fn is_list_of_object(&self) -> bool {
        matches!(self, DataType::List { element } if matches!(**element, DataType::Object { .. }))
    }

    /// Whether a producer of `self` satisfies a consumer declared as `other`.
    ///
    /// Scalars must match exactly, except `Integer → Number` widening. An
    /// object producer satisfies an object consumer when every field the
    /// consumer declares is present and unifies; extra producer fields are
    /// allowed, and a consumer with no declared fields accepts any object.
    pub fn unifies_with(&self, other: &DataType) -> bool {
        match (self, other) {
            (DataType::Integer, DataType::Number) => true,
            (DataType::Object { fields: produced }, DataType::Object { fields: wanted }) => wanted
                .iter()
                .all(|(name, want)| produced.get(name).is_some_and(|have| have.unifies_with(want))),
            (DataType::List { element: produced }, DataType::List { element: wanted }) => {
                produced.unifies_with(wanted)
            }
            (a, b) => a == b,
        }
    }

    /// Descend into the type along a field path. A step of `"*"` descends a
    /// list into its element type; other steps select object fields.
    pub fn at_path(&self, path: &[String]) -> Option<&DataType> {
        let mut current = self;
        for step in path {
            current = match current {
                DataType::Object { fields } => fields.get(step)?,
                DataType::List { element } if step == "*" => element,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::String => write!(f, "string"),
            DataType::Integer => write!(f, "integer"),
            DataType::Number => write!(f, "number"),
            DataType::Boolean => write!(f, "boolean"),
            DataType::File => write!(f, "file"),
            DataType::Object { .. } => write!(f, "object"),
            DataType::List { element } => write!(f, "list<{}>", element),
        }
    }
}

/// Where a variable's value comes from at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VariableSource {
    /// A constant value authored on the canvas.
    Literal { value: Value },
    /// A field produced by another node, addressed by node key and path.
    Reference {
        node_key: String,
        #[serde(default)]
        path: Vec<String>,
    },
}

impl VariableSource {
    pub fn literal(value: Value) -> Self {
        VariableSource::Literal { value }
    }

    pub fn reference(node_key: impl Into<String>, path: &[&str]) -> Self {
        VariableSource::Reference {
            node_key: node_key.into(),
            path: path.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn referenced_node(&self) -> Option<&str> {
        match self {
            VariableSource::Reference { node_key, .. } => Some(node_key),
            VariableSource::Literal { .. } => None,
        }
    }
}

/// A named, typed variable slot on a canvas node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: DataType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<VariableSource>,
}

impl Variable {
    pub fn new(name: impl Into<String>, var_type: DataType) -> Self {
        Self {
            name: name.into(),
            var_type,
            required: false,
            source: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_source(mut self, source: VariableSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_literal(self, value: Value) -> Self {
        self.with_source(VariableSource::literal(value))
    }

    pub fn with_reference(self, node_key: impl Into<String>, path: &[&str]) -> Self {
        self.with_source(VariableSource::reference(node_key, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integer_widens_to_number() {
        assert!(DataType::Integer.unifies_with(&DataType::Number));
        assert!(!DataType::Number.unifies_with(&DataType::Integer));
    }

    #[test]
    fn object_unification_is_structural() {
        let produced = DataType::object([
            ("answer".to_string(), DataType::String),
            ("score".to_string(), DataType::Integer),
        ]);
        let wanted = DataType::object([("answer".to_string(), DataType::String)]);
        assert!(produced.unifies_with(&wanted));
        assert!(!wanted.unifies_with(&produced));
        assert!(produced.unifies_with(&DataType::any_object()));
    }

    #[test]
    fn list_element_types_recurse() {
        let produced = DataType::list_of(DataType::object([(
            "answer".to_string(),
            DataType::String,
        )]));
        assert!(produced.is_list_of_object());
        assert!(produced.unifies_with(&DataType::list_of(DataType::any_object())));
        assert!(!produced.unifies_with(&DataType::list_of(DataType::String)));
    }

    #[test]
    fn at_path_descends_objects_and_lists() {
        let ty = DataType::object([(
            "items".to_string(),
            DataType::list_of(DataType::object([("id".to_string(), DataType::Integer)])),
        )]);
        let path: Vec<String> = ["items", "*", "id"].iter().map(|s| s.to_string()).collect();
        assert_eq!(ty.at_path(&path), Some(&DataType::Integer));
        let missing: Vec<String> = ["items", "nope"].iter().map(|s| s.to_string()).collect();
        assert_eq!(ty.at_path(&missing), None);
    }

    #[test]
    fn variable_round_trips_through_json() {
        let var = Variable::new("query", DataType::String)
            .required()
            .with_reference("entry", &["input"]);
        let raw = serde_json::to_value(&var).unwrap();
        assert_eq!(raw["type"]["type"], json!("string"));
        let back: Variable = serde_json::from_value(raw).unwrap();
        assert_eq!(back, var);
    }
}
