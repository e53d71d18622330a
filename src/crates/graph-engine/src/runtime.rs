//! Per-run runtime state and construction-time parameters
//!
//! [`GraphInitParams`] is the immutable bundle handed to every node
//! constructor. [`GraphRuntimeState`] is the mutable side of a run: the
//! variable pool, route records, step and token counters, accumulated
//! outputs, and the cooperative stop flag. One instance exists per run and
//! is shared across parallel branch tasks; every mutable field is internally
//! synchronized.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::node::LlmUsage;
use crate::route::RouteState;
use crate::variable_pool::VariablePool;

/// Kind of workflow driving post-processor selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowType {
    Chat,
    Workflow,
}

/// Who the acting user is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UserFrom {
    Account,
    EndUser,
}

/// Entry point the run was triggered through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvokeFrom {
    ServiceApi,
    WebApp,
    Explore,
    Debugger,
}

/// Immutable construction-time parameters, shared with every node instance.
#[derive(Debug, Clone, Serialize)]
pub struct GraphInitParams {
    pub tenant_id: String,
    pub app_id: String,
    pub workflow_type: WorkflowType,
    pub workflow_id: String,
    pub user_id: String,
    pub user_from: UserFrom,
    pub invoke_from: InvokeFrom,
    pub call_depth: usize,
    /// Raw application configuration the graph was built from; opaque here.
    pub graph_config: Value,
}

/// Cooperative caller-initiated stop signal.
///
/// Cloned into every branch and readable by nodes; a triggered flag does not
/// preempt anything, nodes observe it at their own suspension points.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Mutable state of one run.
pub struct GraphRuntimeState {
    variable_pool: VariablePool,
    start_at: Instant,
    route_state: RwLock<RouteState>,
    node_run_steps: AtomicUsize,
    total_tokens: AtomicU64,
    llm_usage: Mutex<LlmUsage>,
    outputs: Mutex<Map<String, Value>>,
    stop: StopFlag,
}

impl GraphRuntimeState {
    pub fn new(variable_pool: VariablePool) -> Self {
        Self {
            variable_pool,
            start_at: Instant::now(),
            route_state: RwLock::new(RouteState::default()),
            node_run_steps: AtomicUsize::new(0),
            total_tokens: AtomicU64::new(0),
            llm_usage: Mutex::new(LlmUsage::default()),
            outputs: Mutex::new(Map::new()),
            stop: StopFlag::new(),
        }
    }

    pub fn variable_pool(&self) -> &VariablePool {
        &self.variable_pool
    }

    /// Wall-clock time since the run began.
    pub fn elapsed(&self) -> Duration {
        self.start_at.elapsed()
    }

    /// Number of node starts observed so far.
    pub fn node_run_steps(&self) -> usize {
        self.node_run_steps.load(Ordering::SeqCst)
    }

    /// Claim the next 1-based step index. Called once per node invocation,
    /// immediately before its `NodeRunStarted` event is emitted.
    pub fn next_step_index(&self) -> usize {
        self.node_run_steps.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens.load(Ordering::SeqCst)
    }

    pub fn add_tokens(&self, tokens: u64) {
        self.total_tokens.fetch_add(tokens, Ordering::SeqCst);
    }

    pub fn llm_usage(&self) -> LlmUsage {
        self.llm_usage.lock().clone()
    }

    pub fn merge_llm_usage(&self, usage: &LlmUsage) {
        self.llm_usage.lock().merge(usage);
    }

    /// Snapshot of the run outputs accumulated so far.
    pub fn outputs(&self) -> Map<String, Value> {
        self.outputs.lock().clone()
    }

    pub fn set_outputs(&self, outputs: Map<String, Value>) {
        *self.outputs.lock() = outputs;
    }

    /// Mutate the run outputs under the lock.
    pub fn update_outputs(&self, f: impl FnOnce(&mut Map<String, Value>)) {
        f(&mut self.outputs.lock());
    }

    /// Read access to the route records.
    pub fn with_route_state<R>(&self, f: impl FnOnce(&RouteState) -> R) -> R {
        f(&self.route_state.read())
    }

    /// Write access to the route records.
    pub fn with_route_state_mut<R>(&self, f: impl FnOnce(&mut RouteState) -> R) -> R {
        f(&mut self.route_state.write())
    }

    pub fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_indices_start_at_one_and_increase() {
        let state = GraphRuntimeState::new(VariablePool::new());
        assert_eq!(state.node_run_steps(), 0);
        assert_eq!(state.next_step_index(), 1);
        assert_eq!(state.next_step_index(), 2);
        assert_eq!(state.node_run_steps(), 2);
    }

    #[test]
    fn token_and_usage_accumulation() {
        let state = GraphRuntimeState::new(VariablePool::new());
        state.add_tokens(7);
        state.add_tokens(3);
        assert_eq!(state.total_tokens(), 10);

        state.merge_llm_usage(&LlmUsage {
            total_tokens: 10,
            ..LlmUsage::default()
        });
        state.merge_llm_usage(&LlmUsage {
            total_tokens: 5,
            ..LlmUsage::default()
        });
        assert_eq!(state.llm_usage().total_tokens, 15);
    }

    #[test]
    fn stop_flag_is_shared_across_clones() {
        let flag = StopFlag::new();
        let observer = flag.clone();
        assert!(!observer.is_stopped());
        flag.trigger();
        assert!(observer.is_stopped());
    }

    #[test]
    fn answer_style_output_update() {
        let state = GraphRuntimeState::new(VariablePool::new());
        state.update_outputs(|outputs| {
            outputs.insert("answer".into(), Value::String("foo".into()));
        });
        assert_eq!(state.outputs()["answer"], Value::String("foo".into()));
    }
}
