//! Execution-equivalence between compiled schemas.
//!
//! Two schemas are execution-equivalent when they would schedule and execute
//! identically: the connection-id sets match and every node matches on its
//! logical fields. Cosmetic canvas metadata (titles, descriptions, node
//! positions) never reaches the compiled schema, so moving nodes around or
//! retitling them keeps equivalence — which is exactly what lets a saved
//! draft inherit its predecessor's `test_run_success` flag.

use std::collections::BTreeMap;

use super::{NodeSchema, WorkflowSchema};

impl WorkflowSchema {
    /// Whether `self` and `other` execute identically.
    pub fn execution_equivalent(&self, other: &WorkflowSchema) -> bool {
        if self.connection_id_set() != other.connection_id_set() {
            return false;
        }

        let mine: BTreeMap<&str, &NodeSchema> =
            self.nodes.iter().map(|n| (n.key.as_str(), n)).collect();
        let theirs: BTreeMap<&str, &NodeSchema> =
            other.nodes.iter().map(|n| (n.key.as_str(), n)).collect();

        if mine.len() != theirs.len() {
            return false;
        }

        mine.iter().all(|(key, a)| {
            theirs
                .get(key)
                .is_some_and(|b| node_execution_equivalent(a, b))
        })
    }
}

fn node_execution_equivalent(a: &NodeSchema, b: &NodeSchema) -> bool {
    if a.name != b.name
        || a.node_type != b.node_type
        || a.configs != b.configs
        || a.input_types != b.input_types
        || a.input_sources != b.input_sources
        || a.output_types != b.output_types
        || a.output_sources != b.output_sources
        || a.exception_configs != b.exception_configs
        || a.sub_workflow_basic != b.sub_workflow_basic
    {
        return false;
    }

    // A change at any depth of a referenced sub-workflow is breaking.
    match (&a.sub_workflow_schema, &b.sub_workflow_schema) {
        (None, None) => true,
        (Some(x), Some(y)) => x.execution_equivalent(y),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::node_type::NodeType;
    use crate::schema::configs::{CodeLanguage, NodeConfigs};
    use crate::schema::{Connection, StreamConfig};
    use crate::types::DataType;

    fn schema_with_code(code: &str, name: &str) -> WorkflowSchema {
        let node = NodeSchema {
            key: "coder".to_string(),
            node_type: NodeType::CodeRunner,
            name: name.to_string(),
            input_sources: Vec::new(),
            output_sources: Vec::new(),
            input_types: BTreeMap::new(),
            output_types: BTreeMap::from([("result".to_string(), DataType::String)]),
            configs: NodeConfigs::CodeRunner {
                language: CodeLanguage::Python,
                code: code.to_string(),
            },
            exception_configs: None,
            stream_configs: StreamConfig::default(),
            sub_workflow_basic: None,
            sub_workflow_schema: None,
        };
        let mut schema = WorkflowSchema {
            nodes: vec![node],
            connections: vec![Connection::new("coder", "900001")],
            ..Default::default()
        };
        schema.init();
        schema
    }

    #[test]
    fn identical_schemas_are_equivalent() {
        let a = schema_with_code("print(1)", "coder");
        let b = schema_with_code("print(1)", "coder");
        assert!(a.execution_equivalent(&b));
    }

    #[test]
    fn config_change_breaks_equivalence() {
        let a = schema_with_code("print(1)", "coder");
        let b = schema_with_code("print(2)", "coder");
        assert!(!a.execution_equivalent(&b));
    }

    #[test]
    fn name_change_breaks_equivalence() {
        // The node *name* is a logical field: prompts and references can
        // address nodes by name, so renames reset the test-run flag.
        let a = schema_with_code("print(1)", "coder");
        let b = schema_with_code("print(1)", "renamed");
        assert!(!a.execution_equivalent(&b));
    }

    #[test]
    fn connection_change_breaks_equivalence() {
        let a = schema_with_code("print(1)", "coder");
        let mut b = schema_with_code("print(1)", "coder");
        b.connections[0].from_port = Some("branch_0".to_string());
        assert!(!a.execution_equivalent(&b));
    }
}
