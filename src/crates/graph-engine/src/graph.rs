//! Immutable workflow graph model
//!
//! A [`Graph`] describes the authored workflow: node configurations, ordered
//! outgoing edges per source node, and parallel-group descriptors for
//! fan-out/fan-in sections. Graphs are built once through [`GraphBuilder`],
//! validated, and then shared read-only across every executor task for the
//! duration of a run.
//!
//! # Structure
//!
//! ```text
//!                ┌────────────┐
//!                │   Start    │
//!                └─────┬──────┘
//!        unconditional │
//!              ┌───────┴────────┐      fan-out: all targets belong to
//!              ▼                ▼      one ParallelGroup
//!         ┌─────────┐      ┌─────────┐
//!         │ Branch A│      │ Branch B│
//!         └────┬────┘      └────┬────┘
//!              └───────┬────────┘
//!                      ▼               fan-in: the group's join node
//!                ┌────────────┐
//!                │    Join    │
//!                └─────┬──────┘
//!                      ▼
//!                ┌────────────┐
//!                │    End     │
//!                └────────────┘
//! ```
//!
//! Edges may carry a [`RunCondition`]. If any edge out of a source has one,
//! the whole set is treated as a conditional branch: edges are evaluated in
//! authored order and the first matching condition wins; unconditional
//! siblings are never taken in that mode.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GraphEngineError, Result};

/// Typed role of a workflow node.
///
/// The engine itself only special-cases [`NodeType::End`] (path termination,
/// output capture) and [`NodeType::Answer`] (answer accumulation); every
/// other type is resolved through the node registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    Start,
    End,
    Answer,
    Llm,
    KnowledgeRetrieval,
    IfElse,
    Code,
    TemplateTransform,
    QuestionClassifier,
    HttpRequest,
    Tool,
    VariableAggregator,
    Iteration,
}

impl NodeType {
    /// Wire name of the type tag, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Answer => "answer",
            Self::Llm => "llm",
            Self::KnowledgeRetrieval => "knowledge-retrieval",
            Self::IfElse => "if-else",
            Self::Code => "code",
            Self::TemplateTransform => "template-transform",
            Self::QuestionClassifier => "question-classifier",
            Self::HttpRequest => "http-request",
            Self::Tool => "tool",
            Self::VariableAggregator => "variable-aggregator",
            Self::Iteration => "iteration",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authored configuration of a single node.
///
/// `data` is an opaque blob owned by the node implementation; the engine only
/// reads the `node_type` tag and `title`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub data: Value,
}

impl NodeConfig {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            node_type,
            data: Value::Null,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Comparison operators usable in expression run-conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = "≠")]
    NotEqual,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "≥")]
    GreaterThanOrEqual,
    #[serde(rename = "≤")]
    LessThanOrEqual,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "not contains")]
    NotContains,
    #[serde(rename = "start with")]
    StartWith,
    #[serde(rename = "end with")]
    EndWith,
    #[serde(rename = "is")]
    Is,
    #[serde(rename = "is not")]
    IsNot,
    #[serde(rename = "empty")]
    Empty,
    #[serde(rename = "not empty")]
    NotEmpty,
}

/// A single variable comparison inside an expression condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableCondition {
    /// Variable-pool selector, leading entry is the source node id.
    pub variable_selector: Vec<String>,
    pub comparison_operator: ComparisonOperator,
    /// Right-hand operand; absent for unary operators such as `empty`.
    #[serde(default)]
    pub value: Option<Value>,
}

/// Declarative predicate gating an edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunCondition {
    /// Matches the `edge_source_handle` the previous node reported in its
    /// run result (if/else and classifier style routing).
    BranchIdentify { branch_identify: String },
    /// Evaluates variable comparisons against the variable pool; all
    /// conditions must hold.
    Condition { conditions: Vec<VariableCondition> },
}

/// Directed transition between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source_node_id: String,
    pub target_node_id: String,
    #[serde(default)]
    pub run_condition: Option<RunCondition>,
}

/// Fan-out section executed concurrently and re-converging at `join_node_id`.
///
/// `start_node_ids` are the direct targets of the multi-edge fan-out; a
/// missing join node means the branches run to completion and the path ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelGroup {
    pub id: String,
    pub start_node_ids: Vec<String>,
    #[serde(default)]
    pub join_node_id: Option<String>,
}

/// Immutable workflow description shared across all executor tasks.
#[derive(Debug, Clone)]
pub struct Graph {
    root_node_id: String,
    node_order: Vec<String>,
    node_configs: HashMap<String, NodeConfig>,
    edge_mapping: HashMap<String, Vec<Edge>>,
    node_parallel_mapping: HashMap<String, String>,
    parallel_mapping: HashMap<String, ParallelGroup>,
}

impl Graph {
    /// Start building a graph.
    pub fn builder() -> GraphBuilder {
        GraphBuilder::default()
    }

    /// The node the run starts from.
    pub fn root_node_id(&self) -> &str {
        &self.root_node_id
    }

    /// Configuration of `node_id`, if the node exists.
    pub fn node_config(&self, node_id: &str) -> Option<&NodeConfig> {
        self.node_configs.get(node_id)
    }

    /// Node ids in authored (insertion) order.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.node_order.iter().map(String::as_str)
    }

    /// Outgoing edges of `node_id` in authored order.
    pub fn edges_from(&self, node_id: &str) -> &[Edge] {
        self.edge_mapping.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every edge in the graph, grouped by source in authored order.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.node_order
            .iter()
            .filter_map(|id| self.edge_mapping.get(id))
            .flatten()
    }

    /// The parallel group `node_id` belongs to, if any.
    pub fn parallel_group_of(&self, node_id: &str) -> Option<&str> {
        self.node_parallel_mapping.get(node_id).map(String::as_str)
    }

    /// Descriptor of a parallel group.
    pub fn parallel_group(&self, parallel_id: &str) -> Option<&ParallelGroup> {
        self.parallel_mapping.get(parallel_id)
    }
}

/// Validating builder for [`Graph`].
///
/// Invariants enforced by [`GraphBuilder::build`]:
///
/// - the root node is set and exists,
/// - every edge endpoint exists,
/// - no two edges out of one source share a target,
/// - every parallel group has at least two existing start nodes and, when
///   present, an existing join node.
///
/// Parallel membership (the node→group index used by the executor's
/// re-entry guard) is derived: every node reachable from a group's start
/// nodes without passing through the join node belongs to the group.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    root_node_id: Option<String>,
    node_order: Vec<String>,
    node_configs: HashMap<String, NodeConfig>,
    edges: Vec<Edge>,
    parallel_groups: Vec<ParallelGroup>,
}

impl GraphBuilder {
    /// Add a node and, if it is the first one, make it the root.
    pub fn node(mut self, config: NodeConfig) -> Self {
        if self.root_node_id.is_none() {
            self.root_node_id = Some(config.id.clone());
        }
        if !self.node_configs.contains_key(&config.id) {
            self.node_order.push(config.id.clone());
        }
        self.node_configs.insert(config.id.clone(), config);
        self
    }

    /// Override the root node.
    pub fn root(mut self, node_id: impl Into<String>) -> Self {
        self.root_node_id = Some(node_id.into());
        self
    }

    /// Add an unconditional edge.
    pub fn edge(self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.edge_with(source, target, None)
    }

    /// Add an edge gated by a run-condition.
    pub fn conditional_edge(
        self,
        source: impl Into<String>,
        target: impl Into<String>,
        condition: RunCondition,
    ) -> Self {
        self.edge_with(source, target, Some(condition))
    }

    fn edge_with(
        mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        run_condition: Option<RunCondition>,
    ) -> Self {
        self.edges.push(Edge {
            source_node_id: source.into(),
            target_node_id: target.into(),
            run_condition,
        });
        self
    }

    /// Declare a parallel group.
    pub fn parallel_group(
        mut self,
        id: impl Into<String>,
        start_node_ids: impl IntoIterator<Item = impl Into<String>>,
        join_node_id: Option<&str>,
    ) -> Self {
        self.parallel_groups.push(ParallelGroup {
            id: id.into(),
            start_node_ids: start_node_ids.into_iter().map(Into::into).collect(),
            join_node_id: join_node_id.map(str::to_owned),
        });
        self
    }

    /// Validate and freeze the graph.
    pub fn build(self) -> Result<Graph> {
        let root_node_id = self
            .root_node_id
            .ok_or_else(|| GraphEngineError::InvalidGraph("no root node".into()))?;
        if !self.node_configs.contains_key(&root_node_id) {
            return Err(GraphEngineError::InvalidGraph(format!(
                "root node {root_node_id} does not exist"
            )));
        }

        let mut edge_mapping: HashMap<String, Vec<Edge>> = HashMap::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        for edge in self.edges {
            for endpoint in [&edge.source_node_id, &edge.target_node_id] {
                if !self.node_configs.contains_key(endpoint) {
                    return Err(GraphEngineError::InvalidGraph(format!(
                        "edge endpoint {endpoint} does not exist"
                    )));
                }
            }
            let key = (edge.source_node_id.clone(), edge.target_node_id.clone());
            if !seen.insert(key) {
                return Err(GraphEngineError::InvalidGraph(format!(
                    "duplicate edge {} -> {}",
                    edge.source_node_id, edge.target_node_id
                )));
            }
            edge_mapping
                .entry(edge.source_node_id.clone())
                .or_default()
                .push(edge);
        }

        let mut node_parallel_mapping = HashMap::new();
        let mut parallel_mapping = HashMap::new();
        for group in self.parallel_groups {
            if group.start_node_ids.len() < 2 {
                return Err(GraphEngineError::InvalidGraph(format!(
                    "parallel group {} needs at least two start nodes",
                    group.id
                )));
            }
            for node_id in group
                .start_node_ids
                .iter()
                .chain(group.join_node_id.iter())
            {
                if !self.node_configs.contains_key(node_id) {
                    return Err(GraphEngineError::InvalidGraph(format!(
                        "parallel group {} references unknown node {node_id}",
                        group.id
                    )));
                }
            }

            // Membership: reachable from the starts, stopping at the join.
            let mut queue: VecDeque<&str> =
                group.start_node_ids.iter().map(String::as_str).collect();
            while let Some(node_id) = queue.pop_front() {
                if Some(node_id) == group.join_node_id.as_deref() {
                    continue;
                }
                if node_parallel_mapping
                    .insert(node_id.to_owned(), group.id.clone())
                    .is_some()
                {
                    continue;
                }
                if let Some(edges) = edge_mapping.get(node_id) {
                    queue.extend(edges.iter().map(|e| e.target_node_id.as_str()));
                }
            }

            parallel_mapping.insert(group.id.clone(), group);
        }

        Ok(Graph {
            root_node_id,
            node_order: self.node_order,
            node_configs: self.node_configs,
            edge_mapping,
            node_parallel_mapping,
            parallel_mapping,
        })
    }
}
