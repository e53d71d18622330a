//! Built-in template nodes
//!
//! The engine special-cases the `start`, `end` and `answer` node types, so
//! their template implementations ship here and are wired into
//! [`NodeRegistry::default`](crate::node::NodeRegistry::default). Heavyweight
//! node kinds (LLM calls, HTTP requests, tools) are application concerns and
//! are registered by the embedding application.

use std::sync::Arc;

use crate::graph::NodeType;
use crate::node::NodeRegistry;

mod answer;
mod end;
mod start;

pub use answer::AnswerNode;
pub use end::EndNode;
pub use start::StartNode;

/// Register the template nodes on `registry`.
pub fn register_builtin(registry: &mut NodeRegistry) {
    registry.register(
        NodeType::Start,
        Arc::new(|init| Box::new(StartNode { init }) as Box<dyn crate::node::Node>),
    );
    registry.register(
        NodeType::End,
        Arc::new(|init| Box::new(EndNode { init }) as Box<dyn crate::node::Node>),
    );
    registry.register(
        NodeType::Answer,
        Arc::new(|init| Box::new(AnswerNode { init }) as Box<dyn crate::node::Node>),
    );
}
