//! # graph-engine - Streaming Workflow Graph Execution
//!
//! Runtime that executes a user-authored directed graph of computational
//! nodes (LLM calls, branching conditions, answer emitters, end markers, ...)
//! and streams a totally ordered sequence of lifecycle events to its caller.
//!
//! ## Overview
//!
//! `graph-engine` provides:
//!
//! - **Graph traversal** - sequential edges, conditional branch selection
//!   (first matching condition wins), bounded parallel fan-out/fan-in
//! - **Streaming lifecycle events** - every node start, stream chunk,
//!   retrieval resource and completion is observable as it happens
//! - **Per-run variable pool** - node outputs published under
//!   `(node_id, key-path)` selectors with recursive insertion of nested
//!   structured values
//! - **Cooperative limits** - step budget, wall-clock budget and a
//!   caller-triggered stop flag
//! - **Stream post-processing** - chat runs reorder answer chunks into
//!   authored order; workflow runs suppress chunks that cannot reach the
//!   terminating end node
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      GraphEngine                         │
//! │   GraphRunStarted ── framing ── Succeeded / Failed       │
//! └───────────────┬──────────────────────────────────────────┘
//!                 │ selects by workflow kind
//!                 ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │   StreamProcessor (answer stream | end stream)           │
//! └───────────────┬──────────────────────────────────────────┘
//!                 │ bounded mpsc channel (backpressure)
//!                 ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │   GraphExecutor - one task per linear path               │
//! │     • limit checks, node instantiation via registry      │
//! │     • conditional advance, parallel fan-out/fan-in       │
//! └───────────────┬──────────────────────────────────────────┘
//!                 ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │   Node instances (trait objects from the NodeRegistry)   │
//! │     lazy event streams: chunks, resources, completion    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use futures::StreamExt;
//! use graph_engine::{
//!     Graph, GraphEngine, GraphEngineEvent, GraphEngineParams, InvokeFrom,
//!     NodeConfig, NodeType, UserFrom, VariablePool, WorkflowType,
//! };
//! use serde_json::json;
//!
//! # async fn example() {
//! let graph = Graph::builder()
//!     .node(NodeConfig::new("start", NodeType::Start))
//!     .node(NodeConfig::new("end", NodeType::End).with_data(json!({
//!         "outputs": [{"variable": "text", "value_selector": ["start", "query"]}]
//!     })))
//!     .edge("start", "end")
//!     .build()
//!     .unwrap();
//!
//! let engine = GraphEngine::new(GraphEngineParams {
//!     tenant_id: "tenant-1".into(),
//!     app_id: "app-1".into(),
//!     workflow_type: WorkflowType::Workflow,
//!     workflow_id: "wf-1".into(),
//!     user_id: "user-1".into(),
//!     user_from: UserFrom::EndUser,
//!     invoke_from: InvokeFrom::WebApp,
//!     call_depth: 0,
//!     graph,
//!     graph_config: json!({}),
//!     variable_pool: VariablePool::new()
//!         .with_system_variables([("query".into(), json!("hello"))]),
//!     max_execution_steps: 500,
//!     max_execution_time: Duration::from_secs(600),
//! });
//!
//! let mut events = engine.run();
//! while let Some(event) = events.next().await {
//!     if let GraphEngineEvent::GraphRunSucceeded { outputs } = event {
//!         println!("outputs: {outputs:?}");
//!     }
//! }
//! # }
//! ```
//!
//! ## Event Ordering Guarantees
//!
//! - `GraphRunStarted` precedes every other event; exactly one of
//!   `GraphRunSucceeded` / `GraphRunFailed` closes the stream.
//! - Within one branch, events appear in production order; across parallel
//!   branches the interleaving is nondeterministic, but every branch is
//!   framed by its `ParallelBranchRunStarted` / terminal branch event.
//! - `route_node_state.index` values on successive `NodeRunStarted` events
//!   of a sequential run are strictly monotonic, starting at 1.
//!
//! ## Failure Semantics
//!
//! All errors surface as a terminal `GraphRunFailed { error }`: limit
//! violations, configuration errors (unknown node, missing parallel group),
//! condition handler errors, node failures and parallel branch failures. A
//! failed node's variable-pool writes are whatever it already committed;
//! there is no rollback and no retry. Cancellation is cooperative: a
//! triggered stop flag makes nodes fail with `"Workflow stopped."` at their
//! next check, and abandoned branch work may briefly outlive the run.
//!
//! ## Module Organization
//!
//! - [`engine`] - [`GraphEngine`] facade and run framing
//! - `executor` - path traversal, node runner, parallel fan-out (internal)
//! - [`graph`] - [`Graph`], [`GraphBuilder`], edges, conditions, groups
//! - [`node`] - [`Node`] contract, [`NodeRegistry`], run results
//! - [`nodes`] - built-in `start` / `end` / `answer` template nodes
//! - [`event`] - [`GraphEngineEvent`] family
//! - [`variable_pool`] - run-scoped output store
//! - [`route`] - per-invocation route records
//! - [`condition`] - run-condition handlers
//! - [`stream_processor`] - answer / end stream post-processors
//! - [`runtime`] - init params, runtime state, stop flag
//! - [`error`] - error types

pub mod condition;
pub mod engine;
pub mod error;
pub mod event;
mod executor;
pub mod graph;
pub mod node;
pub mod nodes;
pub mod route;
pub mod runtime;
pub mod stream_processor;
pub mod variable_pool;

// Re-export main types
pub use condition::{condition_handler, ConditionHandler};
pub use engine::{GraphEngine, GraphEngineParams};
pub use error::{GraphEngineError, NodeError, Result};
pub use event::{
    GraphEngineEvent, GraphEngineEventStream, IterationEvent, IterationEventKind,
    NodeRunEventInfo,
};
pub use graph::{
    ComparisonOperator, Edge, Graph, GraphBuilder, NodeConfig, NodeType, ParallelGroup,
    RunCondition, VariableCondition,
};
pub use node::{
    LlmUsage, Node, NodeEvent, NodeEventStream, NodeFactory, NodeInit, NodeRegistry,
    NodeRunMetadataKey, NodeRunResult, WorkflowNodeExecutionStatus,
};
pub use nodes::{AnswerNode, EndNode, StartNode};
pub use route::{RouteNodeState, RouteNodeStatus, RouteState};
pub use runtime::{
    GraphInitParams, GraphRuntimeState, InvokeFrom, StopFlag, UserFrom, WorkflowType,
};
pub use stream_processor::{AnswerStreamProcessor, EndStreamProcessor, StreamProcessor};
pub use variable_pool::{VariablePool, VariableSelector};
