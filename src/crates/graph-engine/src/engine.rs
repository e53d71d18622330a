//! Engine facade
//!
//! [`GraphEngine`] owns everything a run needs (graph, init params, runtime
//! state, node registry, limits) and exposes a single [`GraphEngine::run`]
//! that yields the public event stream:
//!
//! ```text
//! GraphRunStarted
//!   └─ executor events ─► stream post-processor ─► caller
//! GraphRunSucceeded { outputs } | GraphRunFailed { error }
//! ```
//!
//! The post-processor is selected by workflow kind: chat workflows get the
//! answer stream, everything else the end stream. Run outputs are
//! accumulated here as `end` and `answer` nodes succeed.
//!
//! # Example
//!
//! ```rust,ignore
//! use futures::StreamExt;
//! use graph_engine::{GraphEngine, GraphEngineParams, GraphEngineEvent};
//!
//! let engine = GraphEngine::new(GraphEngineParams {
//!     graph,
//!     variable_pool,
//!     // ...identity, limits...
//! #   ..todo!()
//! });
//! let stop = engine.stop_flag();
//! let mut events = engine.run();
//! while let Some(event) = events.next().await {
//!     match event {
//!         GraphEngineEvent::GraphRunSucceeded { outputs } => println!("{outputs:?}"),
//!         GraphEngineEvent::GraphRunFailed { error } => eprintln!("{error}"),
//!         _ => {}
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::event::{GraphEngineEvent, GraphEngineEventStream};
use crate::executor::{GraphExecutor, EVENT_CHANNEL_CAPACITY};
use crate::graph::{Graph, NodeType};
use crate::node::NodeRegistry;
use crate::runtime::{
    GraphInitParams, GraphRuntimeState, InvokeFrom, StopFlag, UserFrom, WorkflowType,
};
use crate::stream_processor::{AnswerStreamProcessor, EndStreamProcessor, StreamProcessor};
use crate::variable_pool::VariablePool;

/// Construction-time parameters of a [`GraphEngine`].
pub struct GraphEngineParams {
    pub tenant_id: String,
    pub app_id: String,
    pub workflow_type: WorkflowType,
    pub workflow_id: String,
    pub user_id: String,
    pub user_from: UserFrom,
    pub invoke_from: InvokeFrom,
    pub call_depth: usize,
    pub graph: Graph,
    /// Raw application configuration, passed through to nodes untouched.
    pub graph_config: Value,
    pub variable_pool: VariablePool,
    pub max_execution_steps: usize,
    pub max_execution_time: Duration,
}

/// One-shot workflow run: construct, optionally grab the stop flag, `run()`.
pub struct GraphEngine {
    graph: Arc<Graph>,
    init_params: Arc<GraphInitParams>,
    runtime_state: Arc<GraphRuntimeState>,
    registry: Arc<NodeRegistry>,
    max_execution_steps: usize,
    max_execution_time: Duration,
}

impl GraphEngine {
    /// Engine with the default registry (built-in template nodes only).
    pub fn new(params: GraphEngineParams) -> Self {
        Self::with_registry(params, Arc::new(NodeRegistry::default()))
    }

    /// Engine with an application-supplied node registry.
    pub fn with_registry(params: GraphEngineParams, registry: Arc<NodeRegistry>) -> Self {
        let init_params = Arc::new(GraphInitParams {
            tenant_id: params.tenant_id,
            app_id: params.app_id,
            workflow_type: params.workflow_type,
            workflow_id: params.workflow_id,
            user_id: params.user_id,
            user_from: params.user_from,
            invoke_from: params.invoke_from,
            call_depth: params.call_depth,
            graph_config: params.graph_config,
        });
        Self {
            graph: Arc::new(params.graph),
            init_params,
            runtime_state: Arc::new(GraphRuntimeState::new(params.variable_pool)),
            registry,
            max_execution_steps: params.max_execution_steps,
            max_execution_time: params.max_execution_time,
        }
    }

    /// Shared runtime state (variable pool, counters, outputs).
    pub fn runtime_state(&self) -> Arc<GraphRuntimeState> {
        self.runtime_state.clone()
    }

    /// Cooperative stop signal for this run. Triggering it makes running
    /// nodes fail with `"Workflow stopped."` at their next check.
    pub fn stop_flag(&self) -> StopFlag {
        self.runtime_state.stop_flag().clone()
    }

    /// Execute the graph, yielding the framed public event stream.
    ///
    /// The executor runs as a background task connected through a bounded
    /// channel; consuming the returned stream is what drives the run
    /// forward, and dropping it abandons the run.
    pub fn run(self) -> GraphEngineEventStream {
        let executor = Arc::new(GraphExecutor {
            graph: self.graph.clone(),
            init_params: self.init_params.clone(),
            runtime: self.runtime_state.clone(),
            registry: self.registry.clone(),
            max_execution_steps: self.max_execution_steps,
            max_execution_time: self.max_execution_time,
        });
        let processor: Box<dyn StreamProcessor> = match self.init_params.workflow_type {
            WorkflowType::Chat => Box::new(AnswerStreamProcessor::new(&self.graph)),
            WorkflowType::Workflow => Box::new(EndStreamProcessor::new(&self.graph)),
        };
        let runtime = self.runtime_state.clone();
        let workflow_id = self.init_params.workflow_id.clone();
        let root_node_id = self.graph.root_node_id().to_owned();

        Box::pin(stream! {
            yield GraphEngineEvent::GraphRunStarted;
            tracing::debug!(workflow_id = %workflow_id, "graph run started");

            let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
            let handle = tokio::spawn(executor.run_path(root_node_id, None, tx));
            let mut processed = processor.process(Box::pin(ReceiverStream::new(rx)));

            while let Some(event) = processed.next().await {
                let failure = Self::observe(&runtime, &event);
                yield event;
                if let Some(error) = failure {
                    tracing::error!(workflow_id = %workflow_id, error = %error, "graph run failed");
                    yield GraphEngineEvent::GraphRunFailed { error };
                    handle.abort();
                    return;
                }
            }

            match handle.await {
                Ok(Ok(())) => {
                    tracing::debug!(workflow_id = %workflow_id, "graph run succeeded");
                    yield GraphEngineEvent::GraphRunSucceeded {
                        outputs: runtime.outputs(),
                    };
                }
                Ok(Err(error)) => {
                    tracing::error!(workflow_id = %workflow_id, error = %error, "graph run failed");
                    yield GraphEngineEvent::GraphRunFailed {
                        error: error.error_text(),
                    };
                }
                Err(join_error) => {
                    tracing::error!(workflow_id = %workflow_id, error = %join_error, "graph run task failed");
                    yield GraphEngineEvent::GraphRunFailed {
                        error: join_error.to_string(),
                    };
                }
            }
        })
    }

    /// Update run outputs from a passing event; returns the failure text
    /// when the event must terminate the run.
    fn observe(runtime: &GraphRuntimeState, event: &GraphEngineEvent) -> Option<String> {
        match event {
            GraphEngineEvent::NodeRunFailed { info, .. } => Some(
                info.route_node_state
                    .failed_reason
                    .clone()
                    .unwrap_or_else(|| "Unknown error.".to_string()),
            ),
            GraphEngineEvent::NodeRunSucceeded { info } => {
                match info.node_type {
                    NodeType::End => {
                        let outputs = info
                            .route_node_state
                            .node_run_result
                            .as_ref()
                            .map(|result| result.outputs.clone())
                            .unwrap_or_default();
                        runtime.set_outputs(outputs);
                    }
                    NodeType::Answer => {
                        let answer = info
                            .route_node_state
                            .node_run_result
                            .as_ref()
                            .and_then(|result| result.outputs.get("answer"))
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned();
                        runtime.update_outputs(|outputs| {
                            let existing = outputs
                                .get("answer")
                                .and_then(Value::as_str)
                                .unwrap_or_default();
                            let combined = format!("{existing}\n{answer}");
                            outputs.insert(
                                "answer".to_string(),
                                Value::String(combined.trim().to_owned()),
                            );
                        });
                    }
                    _ => {}
                }
                None
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NodeRunEventInfo;
    use crate::node::NodeRunResult;
    use crate::route::RouteNodeState;
    use serde_json::{json, Map};

    fn succeeded_event(node_id: &str, node_type: NodeType, outputs: Map<String, Value>) -> GraphEngineEvent {
        let mut route_state = RouteNodeState::new(node_id);
        route_state.set_finished(NodeRunResult::succeeded(outputs));
        GraphEngineEvent::NodeRunSucceeded {
            info: NodeRunEventInfo {
                id: route_state.id.clone(),
                node_id: node_id.to_owned(),
                node_type,
                node_data: Value::Null,
                route_node_state: route_state,
                parallel_id: None,
                parallel_start_node_id: None,
            },
        }
    }

    #[test]
    fn end_outputs_replace_run_outputs() {
        let runtime = GraphRuntimeState::new(VariablePool::new());
        let mut outputs = Map::new();
        outputs.insert("text".into(), json!("hi"));
        let failure = GraphEngine::observe(
            &runtime,
            &succeeded_event("end", NodeType::End, outputs),
        );
        assert!(failure.is_none());
        assert_eq!(runtime.outputs()["text"], json!("hi"));
    }

    #[test]
    fn answer_outputs_accumulate_with_newline_and_trim() {
        let runtime = GraphRuntimeState::new(VariablePool::new());
        for text in ["foo", "bar"] {
            let mut outputs = Map::new();
            outputs.insert("answer".into(), json!(text));
            GraphEngine::observe(
                &runtime,
                &succeeded_event("answer", NodeType::Answer, outputs),
            );
        }
        assert_eq!(runtime.outputs()["answer"], json!("foo\nbar"));
    }

    #[test]
    fn node_failure_yields_its_failed_reason() {
        let runtime = GraphRuntimeState::new(VariablePool::new());
        let mut route_state = RouteNodeState::new("llm");
        route_state.set_failed("boom");
        let event = GraphEngineEvent::NodeRunFailed {
            info: NodeRunEventInfo {
                id: route_state.id.clone(),
                node_id: "llm".into(),
                node_type: NodeType::Llm,
                node_data: Value::Null,
                route_node_state: route_state,
                parallel_id: None,
                parallel_start_node_id: None,
            },
            error: "boom".into(),
        };
        assert_eq!(GraphEngine::observe(&runtime, &event), Some("boom".into()));
    }
}
