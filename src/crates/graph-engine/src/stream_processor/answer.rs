//! Chat-mode post-processor.

use std::collections::{HashMap, HashSet};

use async_stream::stream;
use futures::StreamExt;

use crate::event::{GraphEngineEvent, GraphEngineEventStream};
use crate::graph::{Graph, NodeType};

use super::StreamProcessor;

/// Orders answer-node chunks by the authored order of the answer nodes.
///
/// Parallel branches may produce chunks for a later answer node while an
/// earlier one is still streaming. Chunks from the earliest unfinished
/// answer node (the frontier) pass through live; chunks from later answer
/// nodes are buffered and flushed once every answer node authored before
/// them has finished. All non-chunk events pass through unchanged.
pub struct AnswerStreamProcessor {
    answer_order: Vec<String>,
}

impl AnswerStreamProcessor {
    pub fn new(graph: &Graph) -> Self {
        let answer_order = graph
            .node_ids()
            .filter(|id| {
                graph
                    .node_config(id)
                    .map(|config| config.node_type == NodeType::Answer)
                    .unwrap_or(false)
            })
            .map(str::to_owned)
            .collect();
        Self { answer_order }
    }

    fn frontier<'a>(&'a self, finished: &HashSet<String>) -> Option<&'a str> {
        self.answer_order
            .iter()
            .map(String::as_str)
            .find(|id| !finished.contains(*id))
    }
}

impl StreamProcessor for AnswerStreamProcessor {
    fn process(self: Box<Self>, mut input: GraphEngineEventStream) -> GraphEngineEventStream {
        Box::pin(stream! {
            let mut finished: HashSet<String> = HashSet::new();
            let mut buffers: HashMap<String, Vec<GraphEngineEvent>> = HashMap::new();

            while let Some(event) = input.next().await {
                match &event {
                    GraphEngineEvent::NodeRunStreamChunk { info, .. }
                        if self.answer_order.iter().any(|id| id == &info.node_id) =>
                    {
                        let node_id = info.node_id.clone();
                        if self.frontier(&finished) == Some(node_id.as_str()) {
                            yield event;
                        } else {
                            buffers.entry(node_id).or_default().push(event);
                        }
                    }
                    GraphEngineEvent::NodeRunSucceeded { info }
                    | GraphEngineEvent::NodeRunFailed { info, .. }
                        if self.answer_order.iter().any(|id| id == &info.node_id) =>
                    {
                        finished.insert(info.node_id.clone());
                        yield event;
                        // flush buffers whose turn has come: every finished
                        // answer node in order, then the new frontier's
                        for id in &self.answer_order {
                            if let Some(buffered) = buffers.remove(id) {
                                for buffered_event in buffered {
                                    yield buffered_event;
                                }
                            }
                            if !finished.contains(id) {
                                break;
                            }
                        }
                    }
                    _ => yield event,
                }
            }

            // the run ended with unfinished answer nodes; drain what is left
            // in authored order rather than dropping it
            for id in &self.answer_order {
                if let Some(buffered) = buffers.remove(id) {
                    for buffered_event in buffered {
                        yield buffered_event;
                    }
                }
            }
        })
    }
}
