//! Terminal node: collects the run outputs from the variable pool.

use async_stream::stream;
use serde_json::{Map, Value};

use crate::error::NodeError;
use crate::graph::NodeType;
use crate::node::{Node, NodeEvent, NodeEventStream, NodeInit, NodeRunResult};

/// Resolves the configured output selectors against the variable pool; the
/// engine captures the result as the run's `outputs`.
///
/// Config shape:
/// `{"outputs": [{"variable": "text", "value_selector": ["llm", "text"]}]}`.
/// Unresolvable selectors yield `null`.
pub struct EndNode {
    pub(crate) init: NodeInit,
}

impl Node for EndNode {
    fn id(&self) -> &str {
        &self.init.id
    }

    fn node_id(&self) -> &str {
        &self.init.config.id
    }

    fn node_type(&self) -> NodeType {
        NodeType::End
    }

    fn node_data(&self) -> &Value {
        &self.init.config.data
    }

    fn run(self: Box<Self>) -> NodeEventStream {
        Box::pin(stream! {
            if self.init.runtime_state.stop_flag().is_stopped() {
                yield Err(NodeError::Stopped);
                return;
            }

            let pool = self.init.runtime_state.variable_pool();
            let mut outputs = Map::new();
            if let Some(entries) = self.init.config.data.get("outputs").and_then(Value::as_array) {
                for entry in entries {
                    let Some(name) = entry.get("variable").and_then(Value::as_str) else {
                        continue;
                    };
                    let selector: Vec<String> = entry
                        .get("value_selector")
                        .and_then(Value::as_array)
                        .map(|parts| {
                            parts
                                .iter()
                                .filter_map(Value::as_str)
                                .map(str::to_owned)
                                .collect()
                        })
                        .unwrap_or_default();
                    let value = pool.get(&selector).unwrap_or(Value::Null);
                    outputs.insert(name.to_owned(), value);
                }
            }
            yield Ok(NodeEvent::Completed(NodeRunResult::succeeded(outputs)));
        })
    }
}
