//! Stream post-processors
//!
//! A post-processor reshapes the raw executor event stream into the
//! caller-facing form. Two variants exist, selected by workflow kind:
//!
//! - [`AnswerStreamProcessor`] (chat) - orders answer-node chunks by
//!   authored answer order, buffering chunks that arrive ahead of turn.
//! - [`EndStreamProcessor`] (workflow) - suppresses chunks from nodes that
//!   cannot reach any `end` node.
//!
//! Processors are plain stream transducers: they pull from the input only as
//! fast as the caller pulls from them, so producer backpressure is
//! preserved.

mod answer;
mod end;

pub use answer::AnswerStreamProcessor;
pub use end::EndStreamProcessor;

use crate::event::GraphEngineEventStream;

/// Transducer from the raw engine event stream to the caller-facing stream.
pub trait StreamProcessor: Send {
    fn process(self: Box<Self>, input: GraphEngineEventStream) -> GraphEngineEventStream;
}

#[cfg(test)]
pub(crate) mod test_support {
    use serde_json::Value;

    use crate::event::{GraphEngineEvent, NodeRunEventInfo};
    use crate::graph::NodeType;
    use crate::route::RouteNodeState;

    pub(crate) fn info(node_id: &str, node_type: NodeType) -> NodeRunEventInfo {
        NodeRunEventInfo {
            id: format!("state-{node_id}"),
            node_id: node_id.to_owned(),
            node_type,
            node_data: Value::Null,
            route_node_state: RouteNodeState::new(node_id),
            parallel_id: None,
            parallel_start_node_id: None,
        }
    }

    pub(crate) fn chunk(node_id: &str, node_type: NodeType, text: &str) -> GraphEngineEvent {
        GraphEngineEvent::NodeRunStreamChunk {
            info: info(node_id, node_type),
            chunk_content: text.to_owned(),
            from_variable_selector: None,
        }
    }

    pub(crate) fn succeeded(node_id: &str, node_type: NodeType) -> GraphEngineEvent {
        GraphEngineEvent::NodeRunSucceeded {
            info: info(node_id, node_type),
        }
    }
}
