//! Answer node: renders a template against the variable pool and streams it.

use async_stream::stream;
use serde_json::{Map, Value};

use crate::error::NodeError;
use crate::graph::NodeType;
use crate::node::{Node, NodeEvent, NodeEventStream, NodeInit, NodeRunResult};
use crate::variable_pool::VariablePool;

/// Renders the configured answer template, emits the rendered text as a
/// stream chunk, then completes with `{"answer": rendered}`.
///
/// Template references use `{{#node_id.key#}}` and resolve against the
/// variable pool; unresolvable references render as the empty string.
pub struct AnswerNode {
    pub(crate) init: NodeInit,
}

impl Node for AnswerNode {
    fn id(&self) -> &str {
        &self.init.id
    }

    fn node_id(&self) -> &str {
        &self.init.config.id
    }

    fn node_type(&self) -> NodeType {
        NodeType::Answer
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

            let template = self
                .init
                .config
                .data
                .get("answer")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let rendered =
                render_template(template, self.init.runtime_state.variable_pool());

            yield Ok(NodeEvent::StreamChunk {
                chunk_content: rendered.clone(),
                from_variable_selector: Some(vec![
                    self.init.config.id.clone(),
                    "answer".to_string(),
                ]),
            });

            let mut outputs = Map::new();
            outputs.insert("answer".to_string(), Value::String(rendered));
            yield Ok(NodeEvent::Completed(NodeRunResult::succeeded(outputs)));
        })
    }
}

/// Substitute every `{{#a.b.c#}}` reference with the pool value at
/// `["a", "b", "c"]`. String values render verbatim, other values as JSON.
fn render_template(template: &str, pool: &VariablePool) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{#") {
        rendered.push_str(&rest[..open]);
        let after_open = &rest[open + 3..];
        match after_open.find("#}}") {
            Some(close) => {
                let selector: Vec<String> = after_open[..close]
                    .split('.')
                    .map(|part| part.trim().to_owned())
                    .collect();
                match pool.get(&selector) {
                    Some(Value::String(text)) => rendered.push_str(&text),
                    Some(Value::Null) | None => {}
                    Some(other) => rendered.push_str(&other.to_string()),
                }
                rest = &after_open[close + 3..];
            }
            None => {
                // unterminated reference, keep the raw text
                rendered.push_str("{{#");
                rest = after_open;
            }
        }
    }
    rendered.push_str(rest);
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn template_references_resolve_from_pool() {
        let pool = VariablePool::new();
        pool.add(&["llm".into(), "text".into()], json!("hello"));
        pool.add(&["code".into(), "count".into()], json!(3));

        assert_eq!(
            render_template("say {{#llm.text#}} x{{#code.count#}}", &pool),
            "say hello x3"
        );
        assert_eq!(render_template("{{#missing.ref#}}!", &pool), "!");
        assert_eq!(render_template("plain", &pool), "plain");
        assert_eq!(render_template("open {{#llm.text", &pool), "open {{#llm.text");
    }
}
