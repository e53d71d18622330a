//! Public engine event family
//!
//! Everything the engine tells its caller travels as a [`GraphEngineEvent`].
//! Events are plain serializable values: node events embed a clone of the
//! owning [`RouteNodeState`] taken at emission time, so consumers never
//! observe later mutations.
//!
//! # Ordering guarantees
//!
//! - `GraphRunStarted` precedes every other event; exactly one of
//!   `GraphRunSucceeded` / `GraphRunFailed` is emitted last.
//! - `NodeRunStarted` for a node precedes every chunk, resource and
//!   completion event of that node.
//! - Within one parallel branch, events keep their production order; across
//!   branches the interleaving is nondeterministic, but a branch's
//!   `ParallelBranchRunStarted` precedes its first internal event and its
//!   terminal branch event follows all of them.

use std::pin::Pin;

use futures::Stream;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::graph::NodeType;
use crate::route::RouteNodeState;

/// Lazy engine event sequence, the currency of the whole pipeline.
pub type GraphEngineEventStream = Pin<Box<dyn Stream<Item = GraphEngineEvent> + Send>>;

/// Fields shared by every node-level event.
#[derive(Debug, Clone, Serialize)]
pub struct NodeRunEventInfo {
    /// Per-invocation node id (equals `route_node_state.id`).
    pub id: String,
    /// Authoring node id from the graph.
    pub node_id: String,
    pub node_type: NodeType,
    pub node_data: Value,
    pub route_node_state: RouteNodeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_start_node_id: Option<String>,
}

/// Phase of an iteration event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationEventKind {
    Started,
    Next,
    Succeeded,
    Failed,
}

/// Iteration lifecycle event produced by iterator nodes.
///
/// Opaque to the engine: the node runner only stamps the surrounding
/// parallel tags on before re-emitting.
#[derive(Debug, Clone, Serialize)]
pub struct IterationEvent {
    pub kind: IterationEventKind,
    pub id: String,
    pub node_id: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_start_node_id: Option<String>,
}

/// Events yielded by [`GraphEngine::run`](crate::engine::GraphEngine::run).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GraphEngineEvent {
    GraphRunStarted,
    GraphRunSucceeded {
        outputs: Map<String, Value>,
    },
    GraphRunFailed {
        error: String,
    },

    NodeRunStarted {
        #[serde(flatten)]
        info: NodeRunEventInfo,
        #[serde(skip_serializing_if = "Option::is_none")]
        predecessor_node_id: Option<String>,
    },
    NodeRunStreamChunk {
        #[serde(flatten)]
        info: NodeRunEventInfo,
        chunk_content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        from_variable_selector: Option<Vec<String>>,
    },
    NodeRunRetrieverResource {
        #[serde(flatten)]
        info: NodeRunEventInfo,
        retriever_resources: Vec<Value>,
        context: String,
    },
    NodeRunSucceeded {
        #[serde(flatten)]
        info: NodeRunEventInfo,
    },
    NodeRunFailed {
        #[serde(flatten)]
        info: NodeRunEventInfo,
        error: String,
    },

    ParallelBranchRunStarted {
        parallel_id: String,
        parallel_start_node_id: String,
    },
    ParallelBranchRunSucceeded {
        parallel_id: String,
        parallel_start_node_id: String,
    },
    ParallelBranchRunFailed {
        parallel_id: String,
        parallel_start_node_id: String,
        error: String,
    },

    Iteration(IterationEvent),
}

impl GraphEngineEvent {
    /// Shared node fields, for node-level events.
    pub fn node_info(&self) -> Option<&NodeRunEventInfo> {
        match self {
            Self::NodeRunStarted { info, .. }
            | Self::NodeRunStreamChunk { info, .. }
            | Self::NodeRunRetrieverResource { info, .. }
            | Self::NodeRunSucceeded { info }
            | Self::NodeRunFailed { info, .. } => Some(info),
            _ => None,
        }
    }

    /// The parallel group this event was produced in, if any.
    pub fn parallel_id(&self) -> Option<&str> {
        match self {
            Self::ParallelBranchRunStarted { parallel_id, .. }
            | Self::ParallelBranchRunSucceeded { parallel_id, .. }
            | Self::ParallelBranchRunFailed { parallel_id, .. } => Some(parallel_id),
            Self::Iteration(event) => event.parallel_id.as_deref(),
            other => other.node_info().and_then(|info| info.parallel_id.as_deref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn framing_events_carry_stable_tags() {
        let started = serde_json::to_value(GraphEngineEvent::GraphRunStarted).unwrap();
        assert_eq!(started, json!({"event": "graph_run_started"}));

        let failed = serde_json::to_value(GraphEngineEvent::GraphRunFailed {
            error: "boom".into(),
        })
        .unwrap();
        assert_eq!(
            failed,
            json!({"event": "graph_run_failed", "error": "boom"})
        );
    }

    #[test]
    fn node_events_flatten_shared_fields() {
        let info = NodeRunEventInfo {
            id: "state-1".into(),
            node_id: "llm".into(),
            node_type: NodeType::Llm,
            node_data: Value::Null,
            route_node_state: RouteNodeState::new("llm"),
            parallel_id: Some("p1".into()),
            parallel_start_node_id: Some("llm".into()),
        };
        let event = GraphEngineEvent::NodeRunStreamChunk {
            info,
            chunk_content: "hi".into(),
            from_variable_selector: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "node_run_stream_chunk");
        assert_eq!(value["node_id"], "llm");
        assert_eq!(value["chunk_content"], "hi");
        assert_eq!(value["parallel_id"], "p1");
        assert_eq!(event.parallel_id(), Some("p1"));
    }

    #[test]
    fn branch_events_expose_their_group() {
        let event = GraphEngineEvent::ParallelBranchRunFailed {
            parallel_id: "p1".into(),
            parallel_start_node_id: "a".into(),
            error: "boom".into(),
        };
        assert_eq!(event.parallel_id(), Some("p1"));
    }
}
