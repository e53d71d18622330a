//! Node contract
//!
//! The engine never runs node logic itself; it drives values implementing
//! [`Node`]. A node is instantiated once per invocation through a factory
//! registered in the [`NodeRegistry`] and consumed by `run()`, which returns
//! a lazy stream of [`NodeEvent`] items. The node runner maps those items to
//! public engine events.
//!
//! # Writing a node
//!
//! ```rust,ignore
//! use async_stream::stream;
//! use graph_engine::{Node, NodeEvent, NodeEventStream, NodeInit, NodeRunResult};
//!
//! struct EchoNode {
//!     init: NodeInit,
//! }
//!
//! impl Node for EchoNode {
//!     fn run(self: Box<Self>) -> NodeEventStream {
//!         Box::pin(stream! {
//!             // a stopped run is reported cooperatively
//!             if self.init.runtime_state.stop_flag().is_stopped() {
//!                 yield Err(graph_engine::NodeError::Stopped);
//!                 return;
//!             }
//!             let mut outputs = serde_json::Map::new();
//!             outputs.insert("echo".into(), self.init.config.data.clone());
//!             yield Ok(NodeEvent::Completed(NodeRunResult::succeeded(outputs)));
//!         })
//!     }
//!     // ...identity accessors...
//! #   fn id(&self) -> &str { &self.init.id }
//! #   fn node_id(&self) -> &str { &self.init.config.id }
//! #   fn node_type(&self) -> graph_engine::NodeType { self.init.config.node_type }
//! #   fn node_data(&self) -> &serde_json::Value { &self.init.config.data }
//! }
//! ```

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::NodeError;
use crate::event::GraphEngineEvent;
use crate::graph::{Graph, NodeConfig, NodeType};
use crate::runtime::{GraphInitParams, GraphRuntimeState};

/// Terminal status a node reports for its own execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowNodeExecutionStatus {
    Running,
    Succeeded,
    Failed,
}

/// Well-known keys of [`NodeRunResult::metadata`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunMetadataKey {
    TotalTokens,
    TotalPrice,
    Currency,
    ParallelId,
    ParallelStartNodeId,
}

/// Token and price accounting reported by model-calling nodes.
///
/// Merged run-wide: token counts, price and latency accumulate; the currency
/// of the latest usage wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub total_price: f64,
    #[serde(default)]
    pub currency: String,
    pub latency: f64,
}

impl LlmUsage {
    pub fn merge(&mut self, other: &LlmUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.total_price += other.total_price;
        self.latency += other.latency;
        if !other.currency.is_empty() {
            self.currency = other.currency.clone();
        }
    }
}

/// Final result a node reports through [`NodeEvent::Completed`].
#[derive(Debug, Clone, Serialize)]
pub struct NodeRunResult {
    pub status: WorkflowNodeExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Map<String, Value>>,
    pub outputs: Map<String, Value>,
    pub metadata: HashMap<NodeRunMetadataKey, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_usage: Option<LlmUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Branch handle the node took, consumed by `branch_identify` run
    /// conditions on outgoing edges.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_source_handle: Option<String>,
}

impl NodeRunResult {
    pub fn succeeded(outputs: Map<String, Value>) -> Self {
        Self {
            status: WorkflowNodeExecutionStatus::Succeeded,
            inputs: None,
            outputs,
            metadata: HashMap::new(),
            llm_usage: None,
            error: None,
            edge_source_handle: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: WorkflowNodeExecutionStatus::Failed,
            inputs: None,
            outputs: Map::new(),
            metadata: HashMap::new(),
            llm_usage: None,
            error: Some(error.into()),
            edge_source_handle: None,
        }
    }

    pub fn with_inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs = Some(inputs);
        self
    }

    pub fn with_metadata(mut self, key: NodeRunMetadataKey, value: Value) -> Self {
        self.metadata.insert(key, value);
        self
    }

    pub fn with_llm_usage(mut self, usage: LlmUsage) -> Self {
        self.llm_usage = Some(usage);
        self
    }

    pub fn with_edge_source_handle(mut self, handle: impl Into<String>) -> Self {
        self.edge_source_handle = Some(handle.into());
        self
    }
}

/// Items a node's `run()` stream may yield.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// Incremental text produced while the node works (LLM tokens, rendered
    /// answer fragments). Order within one node is preserved end to end.
    StreamChunk {
        chunk_content: String,
        from_variable_selector: Option<Vec<String>>,
    },
    /// Retrieval citations produced by knowledge nodes.
    RetrieverResource {
        retriever_resources: Vec<Value>,
        context: String,
    },
    /// Terminal item; the runner stops consuming after this.
    Completed(NodeRunResult),
    /// Already-shaped engine event re-emitted verbatim (iteration events get
    /// the surrounding parallel tags stamped on).
    Engine(GraphEngineEvent),
}

/// Lazy node output sequence. Failures travel as `Err` items: a
/// [`NodeError::Stopped`] ends the branch quietly, anything else aborts the
/// run.
pub type NodeEventStream =
    Pin<Box<dyn Stream<Item = Result<NodeEvent, NodeError>> + Send>>;

/// One executable unit of the workflow graph.
pub trait Node: Send {
    /// Per-invocation unique identifier (the route state id).
    fn id(&self) -> &str;
    /// Authoring identifier from the graph.
    fn node_id(&self) -> &str;
    fn node_type(&self) -> NodeType;
    fn node_data(&self) -> &Value;
    /// Consume the instance and produce its lazy output sequence.
    fn run(self: Box<Self>) -> NodeEventStream;
}

/// Everything a node constructor receives.
///
/// Explicit values instead of ambient context: the runtime state carries the
/// variable pool and the stop flag, so nodes never reach for thread-locals.
#[derive(Clone)]
pub struct NodeInit {
    /// Per-invocation id, equal to the owning route state's id.
    pub id: String,
    pub config: NodeConfig,
    pub init_params: Arc<GraphInitParams>,
    pub graph: Arc<Graph>,
    pub runtime_state: Arc<GraphRuntimeState>,
    pub previous_node_id: Option<String>,
}

/// Constructor for one node type.
pub trait NodeFactory: Send + Sync {
    fn create(&self, init: NodeInit) -> Box<dyn Node>;
}

impl<F> NodeFactory for F
where
    F: Fn(NodeInit) -> Box<dyn Node> + Send + Sync,
{
    fn create(&self, init: NodeInit) -> Box<dyn Node> {
        self(init)
    }
}

/// Registry mapping a [`NodeType`] to its constructor.
///
/// [`NodeRegistry::default`] wires the built-in template nodes
/// (`start`, `end`, `answer`); applications register the rest.
pub struct NodeRegistry {
    factories: HashMap<NodeType, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    /// Empty registry without the built-in template nodes.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, node_type: NodeType, factory: Arc<dyn NodeFactory>) {
        self.factories.insert(node_type, factory);
    }

    pub fn get(&self, node_type: NodeType) -> Option<&Arc<dyn NodeFactory>> {
        self.factories.get(&node_type)
    }

    pub fn contains(&self, node_type: NodeType) -> bool {
        self.factories.contains_key(&node_type)
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        crate::nodes::register_builtin(&mut registry);
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llm_usage_merge_accumulates_and_takes_latest_currency() {
        let mut total = LlmUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
            total_price: 0.01,
            currency: "USD".into(),
            latency: 0.2,
        };
        total.merge(&LlmUsage {
            prompt_tokens: 1,
            completion_tokens: 2,
            total_tokens: 3,
            total_price: 0.005,
            currency: "EUR".into(),
            latency: 0.1,
        });
        assert_eq!(total.total_tokens, 18);
        assert_eq!(total.prompt_tokens, 11);
        assert_eq!(total.currency, "EUR");
        assert!((total.total_price - 0.015).abs() < f64::EPSILON);
    }

    #[test]
    fn run_result_builders_set_status() {
        let ok = NodeRunResult::succeeded(Map::new());
        assert_eq!(ok.status, WorkflowNodeExecutionStatus::Succeeded);
        assert!(ok.error.is_none());

        let failed = NodeRunResult::failed("boom");
        assert_eq!(failed.status, WorkflowNodeExecutionStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn default_registry_covers_template_nodes_only() {
        let registry = NodeRegistry::default();
        assert!(registry.contains(NodeType::Start));
        assert!(registry.contains(NodeType::End));
        assert!(registry.contains(NodeType::Answer));
        assert!(!registry.contains(NodeType::Llm));
    }

    #[test]
    fn metadata_keys_serialize_as_snake_case_strings() {
        let json = serde_json::to_string(&NodeRunMetadataKey::TotalTokens).unwrap();
        assert_eq!(json, "\"total_tokens\"");
        let json = serde_json::to_string(&NodeRunMetadataKey::ParallelStartNodeId).unwrap();
        assert_eq!(json, "\"parallel_start_node_id\"");
    }
}
