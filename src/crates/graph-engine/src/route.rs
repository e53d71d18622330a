//! Per-run route state
//!
//! Every node invocation gets its own [`RouteNodeState`] record (a node may
//! be instantiated more than once in loops or re-entrant branches). The
//! [`RouteState`] store keeps all records of a run plus the forward edges
//! actually taken, for observability and condition evaluation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::node::{NodeRunResult, WorkflowNodeExecutionStatus};

/// Lifecycle status of one node invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteNodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Record of a single node invocation within the current run.
#[derive(Debug, Clone, Serialize)]
pub struct RouteNodeState {
    /// Unique per invocation; distinct from the authoring `node_id`.
    pub id: String,
    pub node_id: String,
    pub status: RouteNodeStatus,
    /// 1-based position in the run's start order, assigned when the node's
    /// `NodeRunStarted` event is emitted.
    pub index: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub node_run_result: Option<NodeRunResult>,
}

impl RouteNodeState {
    /// Fresh record for an invocation of `node_id`.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            node_id: node_id.into(),
            status: RouteNodeStatus::Pending,
            index: 0,
            started_at: Utc::now(),
            finished_at: None,
            failed_reason: None,
            node_run_result: None,
        }
    }

    /// Close the record with the node's run result.
    pub fn set_finished(&mut self, run_result: NodeRunResult) {
        self.status = match run_result.status {
            WorkflowNodeExecutionStatus::Succeeded => RouteNodeStatus::Succeeded,
            WorkflowNodeExecutionStatus::Failed => RouteNodeStatus::Failed,
            WorkflowNodeExecutionStatus::Running => RouteNodeStatus::Running,
        };
        self.failed_reason = run_result.error.clone();
        self.finished_at = Some(Utc::now());
        self.node_run_result = Some(run_result);
    }

    /// Close the record as failed without a run result.
    pub fn set_failed(&mut self, reason: impl Into<String>) {
        self.status = RouteNodeStatus::Failed;
        self.failed_reason = Some(reason.into());
        self.finished_at = Some(Utc::now());
    }
}

/// All route records of one run plus the forward edges taken.
#[derive(Debug, Default)]
pub struct RouteState {
    node_state_mapping: HashMap<String, RouteNodeState>,
    node_route_mapping: HashMap<String, Vec<String>>,
}

impl RouteState {
    /// Store (or update) a record under its invocation id.
    pub fn record(&mut self, state: RouteNodeState) {
        self.node_state_mapping.insert(state.id.clone(), state);
    }

    /// Record that the path advanced from one invocation to the next.
    pub fn add_route(&mut self, source_state_id: &str, target_state_id: &str) {
        self.node_route_mapping
            .entry(source_state_id.to_owned())
            .or_default()
            .push(target_state_id.to_owned());
    }

    pub fn get(&self, state_id: &str) -> Option<&RouteNodeState> {
        self.node_state_mapping.get(state_id)
    }

    pub fn routes_from(&self, state_id: &str) -> &[String] {
        self.node_route_mapping
            .get(state_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.node_state_mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_state_mapping.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeRunResult;
    use serde_json::Map;

    #[test]
    fn invocation_ids_are_unique_per_instantiation() {
        let a = RouteNodeState::new("n");
        let b = RouteNodeState::new("n");
        assert_ne!(a.id, b.id);
        assert_eq!(a.status, RouteNodeStatus::Pending);
    }

    #[test]
    fn set_finished_maps_result_status() {
        let mut state = RouteNodeState::new("n");
        state.set_finished(NodeRunResult::succeeded(Map::new()));
        assert_eq!(state.status, RouteNodeStatus::Succeeded);
        assert!(state.finished_at.is_some());
        assert!(state.failed_reason.is_none());

        let mut state = RouteNodeState::new("n");
        state.set_finished(NodeRunResult::failed("boom"));
        assert_eq!(state.status, RouteNodeStatus::Failed);
        assert_eq!(state.failed_reason.as_deref(), Some("boom"));
    }

    #[test]
    fn store_tracks_records_and_forward_routes() {
        let mut store = RouteState::default();
        let a = RouteNodeState::new("a");
        let b = RouteNodeState::new("b");
        let (a_id, b_id) = (a.id.clone(), b.id.clone());

        store.record(a);
        store.record(b);
        store.add_route(&a_id, &b_id);

        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&a_id).unwrap().node_id, "a");
        assert_eq!(store.routes_from(&a_id), &[b_id]);
    }
}
