//! # Node Executors
//!
//! [`ExecutorSet`] turns one compiled node plus its resolved inputs into a
//! [`NodeOutput`]. It owns the external collaborator ports and is shared by
//! the scheduler and the composite runners. Composite nodes (Loop, Batch,
//! SubWorkflow) are orchestrated by the scheduler and never reach this
//! dispatch.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::debug;

use canvasflow_core::error::WorkflowError;
use canvasflow_core::node_type::NodeType;
use canvasflow_core::schema::configs::{
    AnswerType, CompareOp, DbClause, DbCondition, HttpBody, HttpConfig, HttpMethod,
    IntentDetectorConfig, LlmConfig, LlmParam, LlmToolRef, LogicOp, NodeConfigs, OutputFormat,
    QuestionAnswerConfig, SelectorClause, TerminatePlan, TextProcessorConfig,
};
use canvasflow_core::schema::{NodeSchema, WorkflowSchema};

use crate::context::{render_template, resolve_source, ExecutionContext, ValueScope};
use crate::ports::{
    ChatMessage, ChatRequest, ChatRole, CodeSandbox, ConversationStore, DatabaseService,
    ExecutionEvent, KnowledgeService, LlmFactory, PluginRegistry, ToolSpec,
};
use crate::streaming::{stream_channel, StreamChunk};

/// Loop-scope control emitted by Break and Continue nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Break,
    Continue,
}

/// What one node execution produced.
#[derive(Debug)]
pub enum NodeOutput {
    /// Plain output object.
    Value(Value),
    /// A branch decision: exactly one outgoing port fires.
    Decision { port: String, value: Value },
    /// Break/Continue signal to the enclosing loop.
    Control(LoopControl),
    /// The node needs caller input that was not provided; the execution
    /// suspends at this node.
    Suspend { prompt: Value },
}

/// The collaborator bundle. Every port is optional at construction; a node
/// that needs an unwired port fails with a clear error instead of a panic.
#[derive(Clone, Default)]
pub struct ExecutorSet {
    llm: Option<Arc<dyn LlmFactory>>,
    knowledge: Option<Arc<dyn KnowledgeService>>,
    plugins: Option<Arc<dyn PluginRegistry>>,
    database: Option<Arc<dyn DatabaseService>>,
    conversations: Option<Arc<dyn ConversationStore>>,
    sandbox: Option<Arc<dyn CodeSandbox>>,
    http: Option<reqwest::Client>,
}

impl ExecutorSet {
    pub fn builder() -> ExecutorSetBuilder {
        ExecutorSetBuilder {
            set: ExecutorSet::default(),
        }
    }

    fn llm(&self) -> Result<&Arc<dyn LlmFactory>, WorkflowError> {
        self.llm
            .as_ref()
            .ok_or_else(|| WorkflowError::operation("LLM factory is not wired"))
    }

    fn knowledge(&self) -> Result<&Arc<dyn KnowledgeService>, WorkflowError> {
        self.knowledge
            .as_ref()
            .ok_or_else(|| WorkflowError::operation("knowledge service is not wired"))
    }

    fn plugins(&self) -> Result<&Arc<dyn PluginRegistry>, WorkflowError> {
        self.plugins
            .as_ref()
            .ok_or_else(|| WorkflowError::operation("plugin registry is not wired"))
    }

    fn database(&self) -> Result<&Arc<dyn DatabaseService>, WorkflowError> {
        self.database
            .as_ref()
            .ok_or_else(|| WorkflowError::operation("database service is not wired"))
    }

    fn conversations(&self) -> Result<&Arc<dyn ConversationStore>, WorkflowError> {
        self.conversations
            .as_ref()
            .ok_or_else(|| WorkflowError::operation("conversation store is not wired"))
    }

    fn sandbox(&self) -> Result<&Arc<dyn CodeSandbox>, WorkflowError> {
        self.sandbox
            .as_ref()
            .ok_or_else(|| WorkflowError::operation("code sandbox is not wired"))
    }

    fn http(&self) -> Result<&reqwest::Client, WorkflowError> {
        self.http
            .as_ref()
            .ok_or_else(|| WorkflowError::operation("HTTP client is not wired"))
    }

    /// Execute one non-composite node. `attempt` is the zero-based retry
    /// counter from the exception policy.
    pub async fn execute(
        &self,
        schema: &WorkflowSchema,
        node: &NodeSchema,
        inputs: Value,
        scope: &ValueScope,
        ctx: &ExecutionContext,
        attempt: u32,
    ) -> Result<NodeOutput, WorkflowError> {
        ctx.check_live()?;
        debug!(node_key = %node.key, node_type = node.node_type.as_str(), attempt, "executing node");

        match (&node.configs, node.node_type) {
            (NodeConfigs::Entry, _) => Ok(NodeOutput::Value(inputs)),
            (NodeConfigs::Exit { terminate_plan }, _) => {
                self.run_exit(node, terminate_plan, inputs, ctx).await
            }
            (NodeConfigs::Selector { clauses }, _) => {
                self.run_selector(clauses, scope, inputs).await
            }
            (NodeConfigs::Break, _) => Ok(NodeOutput::Control(LoopControl::Break)),
            (NodeConfigs::Continue, _) => Ok(NodeOutput::Control(LoopControl::Continue)),
            (NodeConfigs::InputReceiver, _) => Ok(self.run_input_receiver(node, ctx)),
            (NodeConfigs::JsonSerialization, _) => run_json_serialize(&inputs),
            (NodeConfigs::JsonDeserialization, _) => run_json_deserialize(node, &inputs),
            (NodeConfigs::VariableAssigner, _) => self.run_assigner(ctx, inputs).await,
            (NodeConfigs::VariableAssignerWithinLoop, _) => {
                self.run_loop_assigner(schema, node, scope, inputs).await
            }
            (NodeConfigs::VariableAggregator { groups }, _) => {
                Ok(NodeOutput::Value(aggregate(groups, &inputs)))
            }
            (NodeConfigs::Plugin(cfg), _) => {
                let out = self
                    .plugins()?
                    .invoke_tool(cfg.plugin_id, cfg.tool_id, inputs)
                    .await?;
                Ok(NodeOutput::Value(out))
            }
            (NodeConfigs::CodeRunner { language, code }, _) => {
                let out = self.sandbox()?.run(*language, code, inputs).await?;
                Ok(NodeOutput::Value(out))
            }
            (NodeConfigs::OutputEmitter { content, .. }, _) => {
                self.run_emitter(node, content, inputs, ctx).await
            }
            (NodeConfigs::TextProcessor(cfg), _) => run_text_processor(node, cfg, &inputs),
            (NodeConfigs::IntentDetector(cfg), _) => self.run_intent(cfg, &inputs).await,
            (NodeConfigs::QuestionAnswer(cfg), _) => self.run_question(node, cfg, ctx),
            (NodeConfigs::HttpRequester(cfg), _) => self.run_http(cfg, &inputs).await,
            (NodeConfigs::Llm(cfg), _) => self.run_llm(node, cfg, &inputs, ctx, attempt).await,
            (NodeConfigs::KnowledgeIndexer { knowledge_id }, _) => {
                let document_id = self.knowledge()?.index(*knowledge_id, inputs).await?;
                Ok(NodeOutput::Value(json!({ "document_id": document_id })))
            }
            (NodeConfigs::KnowledgeRetriever(cfg), _) => {
                let query = first_string(&inputs).unwrap_or_default();
                let chunks = self
                    .knowledge()?
                    .retrieve(&cfg.knowledge_ids, &query, cfg.top_k, cfg.min_score, cfg.strategy)
                    .await?;
                Ok(NodeOutput::Value(json!({ "chunks": chunks })))
            }
            (NodeConfigs::KnowledgeDeleter { knowledge_id }, _) => {
                let document_id = inputs
                    .get("document_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.knowledge()?.delete(*knowledge_id, &document_id).await?;
                Ok(NodeOutput::Value(json!({ "is_success": true })))
            }
            (NodeConfigs::DatabaseInsert { database_id }, _) => {
                let row = self.database()?.insert(*database_id, inputs).await?;
                Ok(NodeOutput::Value(json!({ "row": row })))
            }
            (NodeConfigs::DatabaseUpdate { database_id, condition }, _) => {
                let cond = resolve_condition(condition, scope).await?;
                let count = self.database()?.update(*database_id, cond, inputs).await?;
                Ok(NodeOutput::Value(json!({ "row_count": count })))
            }
            (
                NodeConfigs::DatabaseQuery {
                    database_id,
                    condition,
                    select_fields,
                    order_by,
                    limit,
                },
                _,
            ) => {
                let cond = match condition {
                    Some(c) => Some(resolve_condition(c, scope).await?),
                    None => None,
                };
                let rows = self
                    .database()?
                    .query(*database_id, cond, select_fields, order_by.as_ref(), *limit)
                    .await?;
                let row_count = rows.len();
                Ok(NodeOutput::Value(json!({ "rows": rows, "row_count": row_count })))
            }
            (NodeConfigs::DatabaseDelete { database_id, condition }, _) => {
                let cond = resolve_condition(condition, scope).await?;
                let count = self.database()?.delete(*database_id, cond).await?;
                Ok(NodeOutput::Value(json!({ "row_count": count })))
            }
            (NodeConfigs::DatabaseCustomSql { database_id, sql }, _) => {
                let out = self.database()?.custom_sql(*database_id, sql, inputs).await?;
                Ok(NodeOutput::Value(out))
            }
            (configs, node_type) if node_type.is_conversation_related() => {
                self.run_conversation(node_type, configs, &inputs, ctx).await
            }
            (_, node_type) => Err(WorkflowError::operation(format!(
                "node type {} is not executable here",
                node_type.as_str()
            ))),
        }
    }

    fn run_input_receiver(&self, node: &NodeSchema, ctx: &ExecutionContext) -> NodeOutput {
        match ctx.provided_inputs.get(&node.key) {
            Some(value) => NodeOutput::Value(value.clone()),
            None => NodeOutput::Suspend {
                prompt: json!({
                    "fields": node.output_types.keys().collect::<Vec<_>>(),
                }),
            },
        }
    }

    fn run_question(
        &self,
        node: &NodeSchema,
        cfg: &QuestionAnswerConfig,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutput, WorkflowError> {
        let Some(answer) = ctx.provided_inputs.get(&node.key) else {
            return Ok(NodeOutput::Suspend {
                prompt: json!({ "question": cfg.question, "options": cfg.options }),
            });
        };
        match cfg.answer_type {
            AnswerType::Text => Ok(NodeOutput::Value(json!({ "answer": answer }))),
            AnswerType::Option => {
                let picked = answer.as_str().unwrap_or_default();
                let index = cfg
                    .options
                    .iter()
                    .position(|o| o == picked)
                    .or_else(|| answer.as_u64().map(|i| i as usize))
                    .filter(|i| *i < cfg.options.len());
                match index {
                    Some(i) => Ok(NodeOutput::Decision {
                        port: format!("branch_{i}"),
                        value: json!({ "answer": cfg.options[i] }),
                    }),
                    None => Ok(NodeOutput::Decision {
                        port: "default".to_string(),
                        value: json!({ "answer": picked }),
                    }),
                }
            }
        }
    }

    async fn run_exit(
        &self,
        node: &NodeSchema,
        plan: &TerminatePlan,
        inputs: Value,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutput, WorkflowError> {
        match plan {
            TerminatePlan::ReturnVariables => Ok(NodeOutput::Value(inputs)),
            TerminatePlan::UseAnswerContent { content, streaming_output } => {
                let answer = render_template(content, &inputs)?;
                if *streaming_output {
                    ctx.emit(ExecutionEvent::AnswerDelta {
                        chunk: StreamChunk::delta(&node.key, "answer", answer.clone()),
                    })
                    .await;
                    ctx.emit(ExecutionEvent::AnswerDelta {
                        chunk: StreamChunk::finish(&node.key, "answer"),
                    })
                    .await;
                }
                Ok(NodeOutput::Value(json!({ "answer": answer })))
            }
        }
    }

    async fn run_selector(
        &self,
        clauses: &[SelectorClause],
        scope: &ValueScope,
        inputs: Value,
    ) -> Result<NodeOutput, WorkflowError> {
        for (index, clause) in clauses.iter().enumerate() {
            let mut values = Vec::with_capacity(clause.conditions.len());
            for condition in &clause.conditions {
                let left = resolve_source(&condition.left, scope).await?;
                let right = match &condition.right {
                    Some(source) => Some(resolve_source(source, scope).await?),
                    None => None,
                };
                values.push(compare(&left, condition.op, right.as_ref()));
            }
            let hit = match clause.logic {
                LogicOp::And => values.iter().all(|v| *v),
                LogicOp::Or => values.iter().any(|v| *v),
            };
            if hit {
                return Ok(NodeOutput::Decision {
                    port: format!("branch_{index}"),
                    value: inputs,
                });
            }
        }
        // No clause matched: fall through to the default branch.
        Ok(NodeOutput::Decision {
            port: "default".to_string(),
            value: inputs,
        })
    }

    async fn run_assigner(
        &self,
        ctx: &ExecutionContext,
        inputs: Value,
    ) -> Result<NodeOutput, WorkflowError> {
        if let Value::Object(fields) = &inputs {
            let mut variables = ctx.variables.write().await;
            for (name, value) in fields {
                variables.insert(name.clone(), value.clone());
            }
        }
        Ok(NodeOutput::Value(inputs))
    }

    /// Merge the assigned fields into the enclosing loop's variable view so
    /// later iterations observe the new values.
    async fn run_loop_assigner(
        &self,
        schema: &WorkflowSchema,
        node: &NodeSchema,
        scope: &ValueScope,
        inputs: Value,
    ) -> Result<NodeOutput, WorkflowError> {
        let parent = schema.hierarchy.get(&node.key).ok_or_else(|| {
            WorkflowError::operation(format!(
                "loop assigner {} is not inside a loop",
                node.key
            ))
        })?;
        let mut view = scope
            .get(parent)
            .await
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        if let Value::Object(fields) = &inputs {
            for (name, value) in fields {
                view.insert(name.clone(), value.clone());
            }
        }
        scope.set(parent, Value::Object(view)).await;
        Ok(NodeOutput::Value(inputs))
    }

    async fn run_emitter(
        &self,
        node: &NodeSchema,
        content: &str,
        inputs: Value,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutput, WorkflowError> {
        let text = render_template(content, &inputs)?;
        ctx.emit(ExecutionEvent::AnswerDelta {
            chunk: StreamChunk::delta(&node.key, "output", text.clone()),
        })
        .await;
        Ok(NodeOutput::Value(json!({ "output": text })))
    }

    async fn run_intent(
        &self,
        cfg: &IntentDetectorConfig,
        inputs: &Value,
    ) -> Result<NodeOutput, WorkflowError> {
        let query = first_string(inputs).unwrap_or_default();
        let listing = cfg
            .intents
            .iter()
            .enumerate()
            .map(|(i, intent)| {
                format!(
                    "{i}: {} — {}",
                    intent.name,
                    intent.description.as_deref().unwrap_or("")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let request = ChatRequest {
            system: Some(
                "Classify the user query into exactly one intent. Reply with the intent number only."
                    .to_string(),
            ),
            messages: vec![ChatMessage {
                role: ChatRole::User,
                content: format!("Intents:\n{listing}\n\nQuery: {query}"),
            }],
            json_output: false,
            tools: Vec::new(),
        };
        let model = self.llm()?.build(&cfg.param).await?;
        let reply = model.generate(request).await?;
        let index = reply
            .content
            .trim()
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse::<usize>()
            .ok()
            .filter(|i| *i < cfg.intents.len());
        Ok(match index {
            Some(i) => NodeOutput::Decision {
                port: format!("branch_{i}"),
                value: json!({ "intent": cfg.intents[i].name }),
            },
            None => NodeOutput::Decision {
                port: "default".to_string(),
                value: json!({ "intent": null }),
            },
        })
    }

    async fn run_llm(
        &self,
        node: &NodeSchema,
        cfg: &LlmConfig,
        inputs: &Value,
        ctx: &ExecutionContext,
        attempt: u32,
    ) -> Result<NodeOutput, WorkflowError> {
        // Retries switch to the backup parameters when the author provided
        // them.
        let param: LlmParam = if attempt > 0 {
            match node
                .exception_configs
                .as_ref()
                .and_then(|c| c.backup_llm_param.as_ref())
            {
                Some(backup) => serde_json::from_value(backup.clone()).map_err(|e| {
                    WorkflowError::invalid_parameter(format!("backup_llm_param: {e}"))
                })?,
                None => cfg.param.clone(),
            }
        } else {
            cfg.param.clone()
        };

        let mut messages = Vec::new();
        if let (Some(history), Some(conversation_id)) = (&cfg.chat_history, ctx.conversation_id) {
            if history.enabled {
                for message in self
                    .conversations()?
                    .history(conversation_id, history.rounds)
                    .await?
                {
                    messages.push(ChatMessage {
                        role: message.role,
                        content: message.content,
                    });
                }
            }
        }
        messages.push(ChatMessage {
            role: ChatRole::User,
            content: render_template(&cfg.user_prompt, inputs)?,
        });

        let request = ChatRequest {
            system: cfg.system_prompt.clone(),
            messages,
            json_output: cfg.output_format == OutputFormat::Json,
            tools: cfg
                .tools
                .iter()
                .map(|t| match t {
                    LlmToolRef::Workflow { workflow_id, version } => ToolSpec::Workflow {
                        workflow_id: *workflow_id,
                        version: version.clone(),
                    },
                    LlmToolRef::Plugin { plugin_id, tool_id } => ToolSpec::Plugin {
                        plugin_id: *plugin_id,
                        tool_id: *tool_id,
                    },
                })
                .collect(),
        };

        // The reply lands under the node's declared output field.
        let field = node
            .output_sources
            .first()
            .and_then(|f| f.path.first())
            .cloned()
            .unwrap_or_else(|| "output".to_string());

        let model = self.llm()?.build(&param).await?;
        let content = if node.stream_configs.can_generate_stream {
            let (tx, mut rx) = stream_channel();
            let forward_ctx = ctx.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    forward_ctx
                        .emit(ExecutionEvent::AnswerDelta { chunk })
                        .await;
                }
            });
            let response = model
                .stream(request, node.key.clone(), field.clone(), tx)
                .await?;
            // The sender side is closed once stream() returns.
            let _ = forwarder.await;
            response.content
        } else {
            model.generate(request).await?.content
        };

        let output = match cfg.output_format {
            OutputFormat::Json => serde_json::from_str(&content)
                .unwrap_or_else(|_| Value::String(content.clone())),
            _ => Value::String(content),
        };
        let mut object = Map::new();
        object.insert(field, output);
        Ok(NodeOutput::Value(Value::Object(object)))
    }

    async fn run_http(
        &self,
        cfg: &HttpConfig,
        inputs: &Value,
    ) -> Result<NodeOutput, WorkflowError> {
        let url = render_template(&cfg.url, inputs)?;
        let client = self.http()?;
        let mut request = match cfg.method {
            HttpMethod::Get => client.get(&url),
            HttpMethod::Post => client.post(&url),
            HttpMethod::Put => client.put(&url),
            HttpMethod::Patch => client.patch(&url),
            HttpMethod::Delete => client.delete(&url),
            HttpMethod::Head => client.head(&url),
        };
        for (name, value) in &cfg.headers {
            request = request.header(name, render_template(value, inputs)?);
        }
        let params: Vec<(String, String)> = cfg
            .params
            .iter()
            .map(|(k, v)| Ok((k.clone(), render_template(v, inputs)?)))
            .collect::<Result<_, WorkflowError>>()?;
        if !params.is_empty() {
            request = request.query(&params);
        }
        match &cfg.body {
            Some(HttpBody::Json { data }) => request = request.json(data),
            Some(HttpBody::FormUrlencoded { fields }) => request = request.form(fields),
            Some(HttpBody::RawText { text }) => {
                request = request.body(render_template(text, inputs)?)
            }
            None => {}
        }
        if let Some(ms) = cfg.timeout_ms {
            request = request.timeout(Duration::from_millis(ms));
        }

        let response = request
            .send()
            .await
            .map_err(|e| WorkflowError::operation(format!("http request failed: {e}")))?;
        let status_code = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| WorkflowError::operation(format!("http body read failed: {e}")))?;
        Ok(NodeOutput::Value(json!({
            "status_code": status_code,
            "body": body,
        })))
    }

    async fn run_conversation(
        &self,
        node_type: NodeType,
        configs: &NodeConfigs,
        inputs: &Value,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutput, WorkflowError> {
        let store = self.conversations()?;
        let conversation_id = inputs
            .get("conversation_id")
            .and_then(Value::as_i64)
            .or(ctx.conversation_id);
        let need_conversation = || {
            conversation_id.ok_or_else(|| {
                WorkflowError::invalid_parameter("no conversation bound to this execution")
            })
        };

        let value = match node_type {
            NodeType::CreateConversation => {
                let name = inputs.get("name").and_then(Value::as_str).unwrap_or_default();
                serde_json::to_value(store.create_conversation(name).await?)?
            }
            NodeType::UpdateConversation => {
                let name = inputs.get("name").and_then(Value::as_str).unwrap_or_default();
                serde_json::to_value(store.update_conversation(need_conversation()?, name).await?)?
            }
            NodeType::DeleteConversation => {
                store.delete_conversation(need_conversation()?).await?;
                json!({ "is_success": true })
            }
            NodeType::ListConversation => {
                json!({ "conversations": store.list_conversations().await? })
            }
            NodeType::ConversationHistory => {
                let rounds = match configs {
                    NodeConfigs::ConversationHistory { rounds } => *rounds,
                    _ => 1,
                };
                json!({ "messages": store.history(need_conversation()?, rounds).await? })
            }
            NodeType::ClearConversationHistory => {
                store.clear_history(need_conversation()?).await?;
                json!({ "is_success": true })
            }
            NodeType::CreateMessage => {
                let content = inputs.get("content").and_then(Value::as_str).unwrap_or_default();
                serde_json::to_value(
                    store
                        .create_message(need_conversation()?, ChatRole::User, content)
                        .await?,
                )?
            }
            NodeType::EditMessage => {
                let message_id = inputs.get("message_id").and_then(Value::as_i64).ok_or_else(
                    || WorkflowError::invalid_parameter("edit_message needs message_id"),
                )?;
                let content = inputs.get("content").and_then(Value::as_str).unwrap_or_default();
                serde_json::to_value(store.edit_message(message_id, content).await?)?
            }
            NodeType::DeleteMessage => {
                let message_id = inputs.get("message_id").and_then(Value::as_i64).ok_or_else(
                    || WorkflowError::invalid_parameter("delete_message needs message_id"),
                )?;
                store.delete_message(message_id).await?;
                json!({ "is_success": true })
            }
            NodeType::MessageList => {
                let limit = inputs.get("limit").and_then(Value::as_u64).map(|v| v as u32);
                json!({ "messages": store.list_messages(need_conversation()?, limit).await? })
            }
            other => {
                return Err(WorkflowError::operation(format!(
                    "{} is not a conversation node",
                    other.as_str()
                )))
            }
        };
        Ok(NodeOutput::Value(value))
    }
}

pub struct ExecutorSetBuilder {
    set: ExecutorSet,
}

impl ExecutorSetBuilder {
    pub fn llm(mut self, factory: Arc<dyn LlmFactory>) -> Self {
        self.set.llm = Some(factory);
        self
    }

    pub fn knowledge(mut self, service: Arc<dyn KnowledgeService>) -> Self {
        self.set.knowledge = Some(service);
        self
    }

    pub fn plugins(mut self, registry: Arc<dyn PluginRegistry>) -> Self {
        self.set.plugins = Some(registry);
        self
    }

    pub fn database(mut self, service: Arc<dyn DatabaseService>) -> Self {
        self.set.database = Some(service);
        self
    }

    pub fn conversations(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.set.conversations = Some(store);
        self
    }

    pub fn sandbox(mut self, sandbox: Arc<dyn CodeSandbox>) -> Self {
        self.set.sandbox = Some(sandbox);
        self
    }

    pub fn http(mut self, client: reqwest::Client) -> Self {
        self.set.http = Some(client);
        self
    }

    pub fn build(self) -> ExecutorSet {
        self.set
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

fn run_json_serialize(inputs: &Value) -> Result<NodeOutput, WorkflowError> {
    let value = inputs
        .as_object()
        .and_then(|o| o.values().next())
        .cloned()
        .unwrap_or(Value::Null);
    Ok(NodeOutput::Value(json!({
        "output": serde_json::to_string(&value)?,
    })))
}

fn run_json_deserialize(node: &NodeSchema, inputs: &Value) -> Result<NodeOutput, WorkflowError> {
    let raw = first_string(inputs).ok_or_else(|| {
        WorkflowError::invalid_parameter(format!("node {}: nothing to parse", node.key))
    })?;
    let parsed: Value = serde_json::from_str(&raw)?;
    Ok(NodeOutput::Value(json!({ "output": parsed })))
}

fn run_text_processor(
    node: &NodeSchema,
    cfg: &TextProcessorConfig,
    inputs: &Value,
) -> Result<NodeOutput, WorkflowError> {
    match cfg {
        TextProcessorConfig::Concat { template } => {
            let text = render_template(template, inputs)?;
            Ok(NodeOutput::Value(json!({ "output": text })))
        }
        TextProcessorConfig::Split { separators } => {
            let text = first_string(inputs).ok_or_else(|| {
                WorkflowError::invalid_parameter(format!("node {}: nothing to split", node.key))
            })?;
            // Reduce all separators to the first, then split once.
            let Some((first, rest)) = separators.split_first() else {
                return Err(WorkflowError::invalid_parameter(format!(
                    "node {}: split without separators",
                    node.key
                )));
            };
            let mut unified = text;
            for sep in rest {
                unified = unified.replace(sep, first);
            }
            let parts: Vec<&str> = unified.split(first.as_str()).collect();
            Ok(NodeOutput::Value(json!({ "output": parts })))
        }
    }
}

/// First string-valued input, in object order. Several single-input nodes
/// (split, parse, retrieval query) address their payload this way.
fn first_string(inputs: &Value) -> Option<String> {
    inputs.as_object().and_then(|o| {
        o.values().find_map(|v| match v {
            Value::String(s) => Some(s.clone()),
            _ => None,
        })
    })
}

/// Group-wise first-non-null merge. Inputs belong to a group when named
/// exactly like it or prefixed `{group}_`. Without groups the first
/// non-null input wins as `output`.
fn aggregate(groups: &[String], inputs: &Value) -> Value {
    let empty = Map::new();
    let fields = inputs.as_object().unwrap_or(&empty);
    let mut out = Map::new();
    if groups.is_empty() {
        let value = fields.values().find(|v| !v.is_null()).cloned().unwrap_or(Value::Null);
        out.insert("output".to_string(), value);
    } else {
        for group in groups {
            let prefix = format!("{group}_");
            let value = fields
                .iter()
                .filter(|(name, _)| *name == group || name.starts_with(&prefix))
                .map(|(_, v)| v)
                .find(|v| !v.is_null())
                .cloned()
                .unwrap_or(Value::Null);
            out.insert(group.clone(), value);
        }
    }
    Value::Object(out)
}

async fn resolve_condition(
    condition: &DbCondition,
    scope: &ValueScope,
) -> Result<Value, WorkflowError> {
    let mut clauses = Vec::with_capacity(condition.clauses.len());
    for DbClause { field, op, value } in &condition.clauses {
        let resolved = match value {
            Some(source) => resolve_source(source, scope).await?,
            None => Value::Null,
        };
        clauses.push(json!({ "field": field, "op": op, "value": resolved }));
    }
    Ok(json!({ "logic": condition.logic, "clauses": clauses }))
}

/// Comparison semantics shared by selectors and database conditions.
fn compare(left: &Value, op: CompareOp, right: Option<&Value>) -> bool {
    match op {
        CompareOp::IsEmpty => is_empty(left),
        CompareOp::IsNotEmpty => !is_empty(left),
        _ => {
            let Some(right) = right else { return false };
            match op {
                CompareOp::Eq => values_equal(left, right),
                CompareOp::Ne => !values_equal(left, right),
                CompareOp::Gt | CompareOp::Ge | CompareOp::Lt | CompareOp::Le => {
                    match (as_number(left), as_number(right)) {
                        (Some(a), Some(b)) => match op {
                            CompareOp::Gt => a > b,
                            CompareOp::Ge => a >= b,
                            CompareOp::Lt => a < b,
                            _ => a <= b,
                        },
                        _ => false,
                    }
                }
                CompareOp::Contains => contains(left, right),
                CompareOp::NotContains => !contains(left, right),
                CompareOp::IsEmpty | CompareOp::IsNotEmpty => unreachable!("handled above"),
            }
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
        return a == b;
    }
    left == right
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn contains(left: &Value, right: &Value) -> bool {
    match left {
        Value::String(s) => right.as_str().is_some_and(|needle| s.contains(needle)),
        Value::Array(items) => items.iter().any(|item| values_equal(item, right)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_covers_the_operator_table() {
        assert!(compare(&json!(3), CompareOp::Gt, Some(&json!(2))));
        assert!(compare(&json!("3"), CompareOp::Eq, Some(&json!(3))));
        assert!(compare(&json!("hello"), CompareOp::Contains, Some(&json!("ell"))));
        assert!(compare(&json!([1, 2]), CompareOp::Contains, Some(&json!(2))));
        assert!(compare(&json!(""), CompareOp::IsEmpty, None));
        assert!(compare(&json!([1]), CompareOp::IsNotEmpty, None));
        assert!(!compare(&json!("abc"), CompareOp::Gt, Some(&json!(1))));
        assert!(compare(&json!(1), CompareOp::Ne, Some(&json!(2))));
    }

    #[test]
    fn aggregate_picks_first_non_null_per_group() {
        let inputs = json!({
            "res_1": null,
            "res_2": "value",
            "other": 7,
        });
        let merged = aggregate(&["res".to_string()], &inputs);
        assert_eq!(merged, json!({ "res": "value" }));

        let merged = aggregate(&[], &json!({ "a": null, "b": 1 }));
        assert_eq!(merged, json!({ "output": 1 }));
    }

    #[test]
    fn json_nodes_round_trip() {
        let out = run_json_serialize(&json!({ "value": { "x": 1 } })).unwrap();
        let NodeOutput::Value(v) = out else { panic!() };
        assert_eq!(v["output"], json!("{\"x\":1}"));

        let node = NodeSchema {
            key: "p".to_string(),
            node_type: NodeType::JsonDeserialization,
            name: "parse".to_string(),
            input_sources: Vec::new(),
            output_sources: Vec::new(),
            input_types: Default::default(),
            output_types: Default::default(),
            configs: NodeConfigs::JsonDeserialization,
            exception_configs: None,
            stream_configs: Default::default(),
            sub_workflow_basic: None,
            sub_workflow_schema: None,
        };
        let out = run_json_deserialize(&node, &json!({ "raw": "{\"x\":1}" })).unwrap();
        let NodeOutput::Value(v) = out else { panic!() };
        assert_eq!(v["output"], json!({ "x": 1 }));
    }

    #[test]
    fn split_handles_multiple_separators() {
        let node = NodeSchema {
            key: "t".to_string(),
            node_type: NodeType::TextProcessor,
            name: "split".to_string(),
            input_sources: Vec::new(),
            output_sources: Vec::new(),
            input_types: Default::default(),
            output_types: Default::default(),
            configs: NodeConfigs::TextProcessor(TextProcessorConfig::Split {
                separators: vec![",".to_string(), ";".to_string()],
            }),
            exception_configs: None,
            stream_configs: Default::default(),
            sub_workflow_basic: None,
            sub_workflow_schema: None,
        };
        let cfg = match &node.configs {
            NodeConfigs::TextProcessor(cfg) => cfg.clone(),
            _ => unreachable!(),
        };
        let out = run_text_processor(&node, &cfg, &json!({ "text": "a,b;c" })).unwrap();
        let NodeOutput::Value(v) = out else { panic!() };
        assert_eq!(v["output"], json!(["a", "b", "c"]));
    }
}
