//! Workflow-mode post-processor.

use std::collections::{HashSet, VecDeque};

use async_stream::stream;
use futures::StreamExt;

use crate::event::{GraphEngineEvent, GraphEngineEventStream};
use crate::graph::{Graph, NodeType};

use super::StreamProcessor;

/// Passes events through unchanged but suppresses stream chunks produced by
/// nodes that cannot reach any `end` node; their text can never contribute
/// to the workflow result.
pub struct EndStreamProcessor {
    reaches_end: HashSet<String>,
}

impl EndStreamProcessor {
    pub fn new(graph: &Graph) -> Self {
        // reverse reachability from every end node
        let mut reaches_end: HashSet<String> = graph
            .node_ids()
            .filter(|id| {
                graph
                    .node_config(id)
                    .map(|config| config.node_type == NodeType::End)
                    .unwrap_or(false)
            })
            .map(str::to_owned)
            .collect();

        let mut queue: VecDeque<String> = reaches_end.iter().cloned().collect();
        while let Some(target) = queue.pop_front() {
            for edge in graph.edges() {
                if edge.target_node_id == target
                    && reaches_end.insert(edge.source_node_id.clone())
                {
                    queue.push_back(edge.source_node_id.clone());
                }
            }
        }

        Self { reaches_end }
    }
}

impl StreamProcessor for EndStreamProcessor {
    fn process(self: Box<Self>, mut input: GraphEngineEventStream) -> GraphEngineEventStream {
        Box::pin(stream! {
            while let Some(event) = input.next().await {
                if let GraphEngineEvent::NodeRunStreamChunk { info, .. } = &event {
                    if !self.reaches_end.contains(&info.node_id) {
                        continue;
                    }
                }
                yield event;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeConfig;
    use crate::stream_processor::test_support::{chunk, succeeded};

    fn fixture_graph() -> Graph {
        Graph::builder()
            .node(NodeConfig::new("start", NodeType::Start))
            .node(NodeConfig::new("llm", NodeType::Llm))
            .node(NodeConfig::new("side", NodeType::Code))
            .node(NodeConfig::new("end", NodeType::End))
            .edge("start", "llm")
            .edge("start", "side")
            .edge("llm", "end")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn chunks_off_the_end_path_are_suppressed() {
        let graph = fixture_graph();
        let processor = Box::new(EndStreamProcessor::new(&graph));

        let input: GraphEngineEventStream = Box::pin(tokio_stream::iter(vec![
            chunk("llm", NodeType::Llm, "kept"),
            chunk("side", NodeType::Code, "dropped"),
            succeeded("side", NodeType::Code),
        ]));
        let output: Vec<_> = processor.process(input).collect().await;

        assert_eq!(output.len(), 2, "side chunk must be dropped");
        assert!(matches!(
            &output[0],
            GraphEngineEvent::NodeRunStreamChunk { chunk_content, .. } if chunk_content == "kept"
        ));
        // non-chunk events pass through even off the end path
        assert!(matches!(&output[1], GraphEngineEvent::NodeRunSucceeded { info } if info.node_id == "side"));
    }
}
