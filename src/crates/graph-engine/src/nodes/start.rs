//! Entry node: publishes the run inputs as its outputs.

use async_stream::stream;
use serde_json::{Map, Value};

use crate::error::NodeError;
use crate::graph::NodeType;
use crate::node::{Node, NodeEvent, NodeEventStream, NodeInit, NodeRunResult};

/// Copies the declared input variables from the `sys` section of the
/// variable pool into its outputs, making them addressable under the start
/// node's own id.
///
/// Config shape: `{"variables": [{"variable": "query"}, ...]}`; entries may
/// also be bare strings. Missing inputs resolve to `null`.
pub struct StartNode {
    pub(crate) init: NodeInit,
}

impl Node for StartNode {
    fn id(&self) -> &str {
        &self.init.id
    }

    fn node_id(&self) -> &str {
        &self.init.config.id
    }

    fn node_type(&self) -> NodeType {
        NodeType::Start
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
            for name in declared_variables(&self.init.config.data) {
                let selector = vec!["sys".to_string(), name.clone()];
                outputs.insert(name, pool.get(&selector).unwrap_or(Value::Null));
            }
            yield Ok(NodeEvent::Completed(NodeRunResult::succeeded(outputs)));
        })
    }
}

fn declared_variables(data: &Value) -> Vec<String> {
    data.get("variables")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| match entry {
                    Value::String(name) => Some(name.clone()),
                    Value::Object(map) => map
                        .get("variable")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn variables_accept_strings_and_objects() {
        let data = json!({"variables": ["query", {"variable": "lang"}, 42]});
        assert_eq!(declared_variables(&data), vec!["query", "lang"]);
        assert!(declared_variables(&Value::Null).is_empty());
    }
}
