//! # Node Adaptor Registry
//!
//! Adaptors translate one canvas node into one typed [`NodeSchema`]. The
//! registry maps every member of the closed [`NodeType`] set to its adaptor;
//! the compiler looks nodes up here and rejects unknown types. Adaptors are
//! stateless factories: each call parses the node's raw `configs` JSON into
//! a fresh [`NodeConfigs`] variant.
//!
//! The process-wide registry is write-once at startup; tests swap adaptors
//! by building their own registry through [`AdaptorRegistry::builder`] and
//! handing it to the compiler.

mod composite;
mod conversation;
mod io;
mod logic;
mod resource;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;

use crate::canvas::{CanvasNode, ExceptionSettings};
use crate::error::WorkflowError;
use crate::node_type::NodeType;
use crate::schema::{ExceptionConfig, FieldInfo, NodeConfigs, NodeSchema, ProcessType, StreamConfig};
use crate::types::{DataType, Variable};

/// Converts a canvas node of one specific type into its schema.
pub trait NodeAdaptor: Send + Sync {
    fn node_type(&self) -> NodeType;

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError>;
}

/// Maps node types to adaptors.
pub struct AdaptorRegistry {
    map: HashMap<NodeType, Arc<dyn NodeAdaptor>>,
}

impl AdaptorRegistry {
    pub fn builder() -> AdaptorRegistryBuilder {
        AdaptorRegistryBuilder {
            map: HashMap::new(),
        }
    }

    /// The process-wide registry with every built-in adaptor installed.
    /// Write-once: tests wanting different adaptors build their own registry
    /// and hand it to the compiler instead of mutating this one.
    pub fn global() -> Arc<AdaptorRegistry> {
        static GLOBAL: Lazy<Arc<AdaptorRegistry>> =
            Lazy::new(|| Arc::new(AdaptorRegistry::builder().with_defaults().build()));
        Arc::clone(&GLOBAL)
    }

    pub fn adaptor(&self, node_type: NodeType) -> Option<&dyn NodeAdaptor> {
        self.map.get(&node_type).map(|a| a.as_ref())
    }
}

pub struct AdaptorRegistryBuilder {
    map: HashMap<NodeType, Arc<dyn NodeAdaptor>>,
}

impl AdaptorRegistryBuilder {
    pub fn register(mut self, adaptor: Arc<dyn NodeAdaptor>) -> Self {
        self.map.insert(adaptor.node_type(), adaptor);
        self
    }

    /// Install every built-in adaptor. Later `register` calls override.
    pub fn with_defaults(mut self) -> Self {
        for adaptor in builtin_adaptors() {
            self.map.insert(adaptor.node_type(), adaptor);
        }
        self
    }

    pub fn build(self) -> AdaptorRegistry {
        AdaptorRegistry { map: self.map }
    }
}

fn builtin_adaptors() -> Vec<Arc<dyn NodeAdaptor>> {
    let mut adaptors: Vec<Arc<dyn NodeAdaptor>> = Vec::new();
    adaptors.extend(io::adaptors());
    adaptors.extend(logic::adaptors());
    adaptors.extend(composite::adaptors());
    adaptors.extend(resource::adaptors());
    adaptors.extend(conversation::adaptors());
    adaptors
}

// ---------------------------------------------------------------------------
// Shared adaptation helpers
// ---------------------------------------------------------------------------

/// Build the parts of a [`NodeSchema`] every adaptor produces the same way:
/// name, typed IO slots, exception policy. Type-specific configs and stream
/// flags are filled in by the caller.
pub(crate) fn base_schema(
    node: &CanvasNode,
    node_type: NodeType,
    configs: NodeConfigs,
) -> Result<NodeSchema, WorkflowError> {
    Ok(NodeSchema {
        key: node.id.clone(),
        node_type,
        name: node
            .data
            .name
            .clone()
            .unwrap_or_else(|| node_type.display_name().to_string()),
        input_sources: field_infos(&node.data.inputs),
        output_sources: field_infos(&node.data.outputs),
        input_types: field_types(&node.data.inputs),
        output_types: field_types(&node.data.outputs),
        configs,
        exception_configs: exception_config(&node.id, node_type, node.data.settings.as_ref())?,
        stream_configs: StreamConfig::default(),
        sub_workflow_basic: None,
        sub_workflow_schema: None,
    })
}

pub(crate) fn field_infos(vars: &[Variable]) -> Vec<FieldInfo> {
    vars.iter()
        .map(|v| FieldInfo {
            path: vec![v.name.clone()],
            source: v.source.clone(),
        })
        .collect()
}

pub(crate) fn field_types(vars: &[Variable]) -> BTreeMap<String, DataType> {
    vars.iter()
        .map(|v| (v.name.clone(), v.var_type.clone()))
        .collect()
}

/// Compile the canvas exception settings. `process_type` falls back to
/// `ReturnDefaultData` when the author enabled the switch and provided
/// default data without picking a policy; the timeout falls back to the
/// node-type default.
pub(crate) fn exception_config(
    node_key: &str,
    node_type: NodeType,
    settings: Option<&ExceptionSettings>,
) -> Result<Option<ExceptionConfig>, WorkflowError> {
    let Some(settings) = settings else {
        return Ok(None);
    };

    let process_type = match settings.process_type {
        Some(pt) => pt,
        None if settings.switch == Some(true) && settings.data_on_err.is_some() => {
            ProcessType::ReturnDefaultData
        }
        None => ProcessType::Throw,
    };

    if let Some(retries) = settings.max_retry {
        if retries > 10 {
            return Err(WorkflowError::conversion(
                node_key,
                format!("max_retry {retries} exceeds the limit of 10"),
            ));
        }
    }

    Ok(Some(ExceptionConfig {
        timeout_ms: settings.timeout_ms.or_else(|| node_type.default_timeout_ms()),
        max_retry: settings.max_retry.unwrap_or(0),
        process_type,
        data_on_err: settings.data_on_err.clone(),
        backup_llm_param: settings
            .ext
            .as_ref()
            .and_then(|e| e.backup_llm_param.clone()),
    }))
}

/// Parse the node's raw `configs` JSON into a typed config value, mapping
/// failures to [`WorkflowError::SchemaConversionFail`] keyed by the node.
pub(crate) fn parse_configs<T: DeserializeOwned>(node: &CanvasNode) -> Result<T, WorkflowError> {
    serde_json::from_value(node.data.configs.clone())
        .map_err(|e| WorkflowError::conversion(&node.id, format!("bad configs: {e}")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::canvas::{ExceptionExt, NodeData};

    #[test]
    fn global_registry_covers_every_adaptable_type() {
        let registry = AdaptorRegistry::global();
        for ty in NodeType::all() {
            if *ty == NodeType::Comment {
                assert!(registry.adaptor(*ty).is_none(), "comments are skipped");
            } else {
                assert!(registry.adaptor(*ty).is_some(), "missing adaptor for {}", ty.as_str());
            }
        }
    }

    #[test]
    fn builder_can_override_an_adaptor() {
        struct NullEntry;
        impl NodeAdaptor for NullEntry {
            fn node_type(&self) -> NodeType {
                NodeType::Entry
            }
            fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
                base_schema(node, NodeType::Entry, NodeConfigs::Entry)
            }
        }

        let registry = AdaptorRegistry::builder()
            .with_defaults()
            .register(Arc::new(NullEntry))
            .build();
        assert!(registry.adaptor(NodeType::Entry).is_some());
    }

    #[test]
    fn implied_return_default_data() {
        let settings = ExceptionSettings {
            switch: Some(true),
            data_on_err: Some("{\"answer\": \"fallback\"}".to_string()),
            ..Default::default()
        };
        let cfg = exception_config("n1", NodeType::Llm, Some(&settings))
            .unwrap()
            .unwrap();
        assert_eq!(cfg.process_type, ProcessType::ReturnDefaultData);
        // LLM default timeout applies when none was authored.
        assert_eq!(cfg.timeout_ms, Some(60_000));
    }

    #[test]
    fn backup_llm_param_is_carried() {
        let settings = ExceptionSettings {
            process_type: Some(ProcessType::Throw),
            max_retry: Some(2),
            ext: Some(ExceptionExt {
                backup_llm_param: Some(json!({ "model": "fallback-model" })),
            }),
            ..Default::default()
        };
        let cfg = exception_config("n1", NodeType::Llm, Some(&settings))
            .unwrap()
            .unwrap();
        assert_eq!(cfg.backup_llm_param, Some(json!({ "model": "fallback-model" })));
    }

    #[test]
    fn excessive_retries_are_rejected() {
        let settings = ExceptionSettings {
            max_retry: Some(99),
            ..Default::default()
        };
        let err = exception_config("n1", NodeType::HttpRequester, Some(&settings)).unwrap_err();
        assert!(matches!(err, WorkflowError::SchemaConversionFail { .. }));
    }

    #[test]
    fn base_schema_prefers_semantic_name() {
        let node = CanvasNode {
            id: "n1".to_string(),
            node_type: "code_runner".to_string(),
            data: NodeData {
                name: Some("summarize".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let schema = base_schema(
            &node,
            NodeType::CodeRunner,
            NodeConfigs::CodeRunner {
                language: crate::schema::configs::CodeLanguage::Python,
                code: String::new(),
            },
        )
        .unwrap();
        assert_eq!(schema.name, "summarize");
    }
}
