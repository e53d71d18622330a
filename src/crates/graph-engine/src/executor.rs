//! Graph traversal and node driving
//!
//! [`GraphExecutor`] walks one linear path of the graph at a time:
//! instantiate the node for the current id, drive its event stream, record
//! the route state, then advance along the outgoing edges. A multi-edge
//! fan-out without conditions spawns one branch task per target; branch
//! events are funneled through a bounded channel back into the parent path,
//! which counts branch completions and continues at the group's join node.
//!
//! ```text
//!  run_path ──► run_node ──► node.run() events ──► event channel ──► caller
//!     │
//!     ├─ single edge / conditional branch: advance in place
//!     └─ fan-out: spawn run_branch per target ─► drain ─► join node
//! ```
//!
//! Step and wall-clock limits are checked at the top of every iteration.
//! All limit, configuration and condition errors leave through
//! [`GraphEngineError::RunFailed`] and become the terminal `GraphRunFailed`.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::condition::condition_handler;
use crate::error::{GraphEngineError, NodeError, Result};
use crate::event::{GraphEngineEvent, NodeRunEventInfo};
use crate::graph::{Graph, NodeType, RunCondition};
use crate::node::{Node, NodeEvent, NodeInit, NodeRegistry, NodeRunMetadataKey};
use crate::route::{RouteNodeState, RouteNodeStatus};
use crate::runtime::{GraphInitParams, GraphRuntimeState};

/// Buffer size of every event channel in the engine.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 100;

type EventSender = mpsc::Sender<GraphEngineEvent>;

enum BranchTerminal {
    Succeeded,
    Failed(String),
}

fn branch_terminal(event: &GraphEngineEvent, parallel_id: &str) -> Option<BranchTerminal> {
    match event {
        GraphEngineEvent::ParallelBranchRunSucceeded {
            parallel_id: id, ..
        } if id == parallel_id => Some(BranchTerminal::Succeeded),
        GraphEngineEvent::ParallelBranchRunFailed {
            parallel_id: id,
            error,
            ..
        } if id == parallel_id => Some(BranchTerminal::Failed(error.clone())),
        _ => None,
    }
}

pub(crate) struct GraphExecutor {
    pub(crate) graph: Arc<Graph>,
    pub(crate) init_params: Arc<GraphInitParams>,
    pub(crate) runtime: Arc<GraphRuntimeState>,
    pub(crate) registry: Arc<NodeRegistry>,
    pub(crate) max_execution_steps: usize,
    pub(crate) max_execution_time: Duration,
}

impl GraphExecutor {
    /// Drive one linear path starting at `start_node_id`, emitting every
    /// produced event into `tx`.
    ///
    /// Boxed because branch tasks re-enter it recursively.
    pub(crate) fn run_path(
        self: Arc<Self>,
        start_node_id: String,
        in_parallel_id: Option<String>,
        tx: EventSender,
    ) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let parallel_start_node_id = in_parallel_id.as_ref().map(|_| start_node_id.clone());
            let mut next_node_id = start_node_id;
            let mut previous_route_state: Option<RouteNodeState> = None;

            loop {
                if self.runtime.node_run_steps() > self.max_execution_steps {
                    return Err(GraphEngineError::run_failed(format!(
                        "Max steps {} reached.",
                        self.max_execution_steps
                    )));
                }
                if self.runtime.elapsed() > self.max_execution_time {
                    return Err(GraphEngineError::run_failed(format!(
                        "Max execution time {}s reached.",
                        self.max_execution_time.as_secs()
                    )));
                }

                let mut route_state = RouteNodeState::new(&next_node_id);

                let node_config = self
                    .graph
                    .node_config(&next_node_id)
                    .ok_or_else(|| {
                        GraphEngineError::run_failed(format!(
                            "Node {next_node_id} config not found."
                        ))
                    })?
                    .clone();
                let node_type = node_config.node_type;
                let factory = self.registry.get(node_type).ok_or_else(|| {
                    GraphEngineError::run_failed(format!(
                        "Node {next_node_id} type {node_type} not found."
                    ))
                })?;

                let previous_node_id =
                    previous_route_state.as_ref().map(|s| s.node_id.clone());
                let node = factory.create(NodeInit {
                    id: route_state.id.clone(),
                    config: node_config,
                    init_params: self.init_params.clone(),
                    graph: self.graph.clone(),
                    runtime_state: self.runtime.clone(),
                    previous_node_id: previous_node_id.clone(),
                });

                self.run_node(
                    node,
                    &mut route_state,
                    previous_node_id,
                    in_parallel_id.as_deref(),
                    parallel_start_node_id.as_deref(),
                    &tx,
                )
                .await?;

                self.runtime.with_route_state_mut(|route| {
                    route.record(route_state.clone());
                    if let Some(previous) = &previous_route_state {
                        route.add_route(&previous.id, &route_state.id);
                    }
                });

                // A failed node ends this path; the facade converts the
                // already-emitted failure event into the terminal
                // GraphRunFailed.
                if route_state.status == RouteNodeStatus::Failed {
                    return Ok(());
                }
                if node_type == NodeType::End {
                    return Ok(());
                }

                let current_route_state = route_state;
                let edges = self.graph.edges_from(&next_node_id);
                if edges.is_empty() {
                    return Ok(());
                }

                let chosen = if edges.len() == 1 {
                    let edge = &edges[0];
                    let taken = match &edge.run_condition {
                        Some(condition) => self.check_condition(
                            condition,
                            &current_route_state,
                            &edge.target_node_id,
                        )?,
                        None => true,
                    };
                    taken.then(|| edge.target_node_id.clone())
                } else if edges.iter().any(|edge| edge.run_condition.is_some()) {
                    // Conditional branch: first matching condition wins.
                    // Unconditional siblings are never taken in this mode.
                    let mut winner = None;
                    for edge in edges {
                        if let Some(condition) = &edge.run_condition {
                            if self.check_condition(
                                condition,
                                &current_route_state,
                                &edge.target_node_id,
                            )? {
                                winner = Some(edge.target_node_id.clone());
                                break;
                            }
                        }
                    }
                    winner
                } else {
                    let targets: Vec<String> =
                        edges.iter().map(|e| e.target_node_id.clone()).collect();
                    self.fan_out(targets, &tx).await?
                };

                let Some(chosen) = chosen else {
                    return Ok(());
                };
                next_node_id = chosen;
                previous_route_state = Some(current_route_state);

                if let Some(parallel_id) = &in_parallel_id {
                    if self.graph.parallel_group_of(&next_node_id)
                        != Some(parallel_id.as_str())
                    {
                        // the join node is driven by the parent traversal
                        return Ok(());
                    }
                }
            }
        })
    }

    /// Fan out to all `targets` of one parallel group and drain their events
    /// until every branch reported a terminal branch event.
    ///
    /// Returns the group's join node id, or `None` when the group has no
    /// join and the path simply ends.
    async fn fan_out(
        self: &Arc<Self>,
        targets: Vec<String>,
        tx: &EventSender,
    ) -> Result<Option<String>> {
        let first_target = targets[0].clone();
        let parallel_id = self
            .graph
            .parallel_group_of(&first_target)
            .ok_or_else(|| {
                GraphEngineError::run_failed(format!(
                    "Node {first_target} related parallel not found."
                ))
            })?
            .to_owned();
        let group = self.graph.parallel_group(&parallel_id).ok_or_else(|| {
            GraphEngineError::run_failed(format!("Parallel {parallel_id} not found."))
        })?;
        let join_node_id = group.join_node_id.clone();

        let (branch_tx, mut branch_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(targets.len());
        for target in targets {
            handles.push(tokio::spawn(Self::run_branch(
                self.clone(),
                parallel_id.clone(),
                target,
                branch_tx.clone(),
            )));
        }
        drop(branch_tx);

        let branch_count = handles.len();
        let mut succeeded_count = 0usize;
        let mut branch_error: Option<String> = None;
        while let Some(event) = branch_rx.recv().await {
            let terminal = branch_terminal(&event, &parallel_id);
            // forward before classifying, so the branch event itself is
            // observable even when it aborts the run
            if tx.send(event).await.is_err() {
                for handle in &handles {
                    handle.abort();
                }
                return Err(GraphEngineError::StreamClosed);
            }
            match terminal {
                Some(BranchTerminal::Succeeded) => {
                    succeeded_count += 1;
                    tracing::debug!(
                        parallel_id = %parallel_id,
                        succeeded_count,
                        branch_count,
                        "parallel branch succeeded"
                    );
                    if succeeded_count == branch_count {
                        break;
                    }
                }
                Some(BranchTerminal::Failed(error)) => {
                    branch_error = Some(error);
                    break;
                }
                None => {}
            }
        }

        if let Some(error) = branch_error {
            // Remaining branches are cancelled best-effort; node bodies are
            // cooperative and may not stop promptly.
            for handle in &handles {
                handle.abort();
            }
            return Err(GraphEngineError::run_failed(error));
        }

        for handle in handles {
            let _ = handle.await;
        }
        Ok(join_node_id)
    }

    /// One spawned branch of a parallel group: frame the sub-traversal with
    /// `ParallelBranchRunStarted` / `...Succeeded` / `...Failed`.
    async fn run_branch(
        executor: Arc<Self>,
        parallel_id: String,
        start_node_id: String,
        tx: EventSender,
    ) {
        let started = GraphEngineEvent::ParallelBranchRunStarted {
            parallel_id: parallel_id.clone(),
            parallel_start_node_id: start_node_id.clone(),
        };
        if tx.send(started).await.is_err() {
            return;
        }

        let result = executor
            .clone()
            .run_path(start_node_id.clone(), Some(parallel_id.clone()), tx.clone())
            .await;

        let terminal = match result {
            Ok(()) => GraphEngineEvent::ParallelBranchRunSucceeded {
                parallel_id,
                parallel_start_node_id: start_node_id,
            },
            Err(GraphEngineError::StreamClosed) => return,
            Err(error) => {
                tracing::error!(
                    parallel_id = %parallel_id,
                    parallel_start_node_id = %start_node_id,
                    error = %error,
                    "parallel branch failed"
                );
                GraphEngineEvent::ParallelBranchRunFailed {
                    parallel_id,
                    parallel_start_node_id: start_node_id,
                    error: error.error_text(),
                }
            }
        };
        let _ = tx.send(terminal).await;
    }

    /// Drive a single node instance: emit `NodeRunStarted`, pump the node's
    /// event stream, apply success bookkeeping, emit the terminal node event.
    async fn run_node(
        &self,
        node: Box<dyn Node>,
        route_state: &mut RouteNodeState,
        predecessor_node_id: Option<String>,
        parallel_id: Option<&str>,
        parallel_start_node_id: Option<&str>,
        tx: &EventSender,
    ) -> Result<()> {
        let instance_id = node.id().to_owned();
        let node_id = node.node_id().to_owned();
        let node_type = node.node_type();
        let node_data = node.node_data().clone();

        route_state.status = RouteNodeStatus::Running;
        route_state.index = self.runtime.next_step_index();

        let make_info = |route_state: &RouteNodeState| NodeRunEventInfo {
            id: instance_id.clone(),
            node_id: node_id.clone(),
            node_type,
            node_data: node_data.clone(),
            route_node_state: route_state.clone(),
            parallel_id: parallel_id.map(str::to_owned),
            parallel_start_node_id: parallel_start_node_id.map(str::to_owned),
        };

        self.emit(
            tx,
            GraphEngineEvent::NodeRunStarted {
                info: make_info(route_state),
                predecessor_node_id,
            },
        )
        .await?;

        let mut stream = node.run();
        while let Some(item) = stream.next().await {
            match item {
                Ok(NodeEvent::Engine(mut event)) => {
                    if let GraphEngineEvent::Iteration(iteration) = &mut event {
                        iteration.parallel_id = parallel_id.map(str::to_owned);
                        iteration.parallel_start_node_id =
                            parallel_start_node_id.map(str::to_owned);
                    }
                    self.emit(tx, event).await?;
                }
                Ok(NodeEvent::StreamChunk {
                    chunk_content,
                    from_variable_selector,
                }) => {
                    self.emit(
                        tx,
                        GraphEngineEvent::NodeRunStreamChunk {
                            info: make_info(route_state),
                            chunk_content,
                            from_variable_selector,
                        },
                    )
                    .await?;
                }
                Ok(NodeEvent::RetrieverResource {
                    retriever_resources,
                    context,
                }) => {
                    self.emit(
                        tx,
                        GraphEngineEvent::NodeRunRetrieverResource {
                            info: make_info(route_state),
                            retriever_resources,
                            context,
                        },
                    )
                    .await?;
                }
                Ok(NodeEvent::Completed(run_result)) => {
                    route_state.set_finished(run_result);
                    match route_state.status {
                        RouteNodeStatus::Failed => {
                            let error = route_state
                                .failed_reason
                                .clone()
                                .unwrap_or_else(|| "Unknown error.".to_string());
                            self.emit(
                                tx,
                                GraphEngineEvent::NodeRunFailed {
                                    info: make_info(route_state),
                                    error,
                                },
                            )
                            .await?;
                        }
                        RouteNodeStatus::Succeeded => {
                            self.apply_success(
                                route_state,
                                &node_id,
                                parallel_id,
                                parallel_start_node_id,
                            );
                            self.emit(
                                tx,
                                GraphEngineEvent::NodeRunSucceeded {
                                    info: make_info(route_state),
                                },
                            )
                            .await?;
                        }
                        // a node reporting a non-terminal status ends its
                        // stream without a terminal node event
                        _ => {}
                    }
                    break;
                }
                Err(NodeError::Stopped) => {
                    route_state.set_failed("Workflow stopped.");
                    self.emit(
                        tx,
                        GraphEngineEvent::NodeRunFailed {
                            info: make_info(route_state),
                            error: "Workflow stopped.".to_string(),
                        },
                    )
                    .await?;
                    return Ok(());
                }
                Err(NodeError::Failed(error)) => {
                    tracing::error!(node_id = %node_id, error = %error, "node run failed");
                    route_state.set_failed(error.clone());
                    self.emit(
                        tx,
                        GraphEngineEvent::NodeRunFailed {
                            info: make_info(route_state),
                            error: error.clone(),
                        },
                    )
                    .await?;
                    return Err(GraphEngineError::run_failed(error));
                }
            }
        }
        Ok(())
    }

    /// Success bookkeeping: token and usage accounting, publishing outputs
    /// to the variable pool, stamping parallel tags on the result metadata.
    fn apply_success(
        &self,
        route_state: &mut RouteNodeState,
        node_id: &str,
        parallel_id: Option<&str>,
        parallel_start_node_id: Option<&str>,
    ) {
        let Some(run_result) = route_state.node_run_result.as_mut() else {
            return;
        };

        if let Some(tokens) = run_result
            .metadata
            .get(&NodeRunMetadataKey::TotalTokens)
            .and_then(Value::as_u64)
        {
            self.runtime.add_tokens(tokens);
        }
        if let Some(usage) = &run_result.llm_usage {
            self.runtime.merge_llm_usage(usage);
        }

        for (key, value) in run_result.outputs.clone() {
            let selector = vec![node_id.to_owned(), key];
            self.runtime.variable_pool().add(&selector, value);
        }

        if let (Some(parallel_id), Some(start)) = (parallel_id, parallel_start_node_id) {
            run_result.metadata.insert(
                NodeRunMetadataKey::ParallelId,
                Value::String(parallel_id.to_owned()),
            );
            run_result.metadata.insert(
                NodeRunMetadataKey::ParallelStartNodeId,
                Value::String(start.to_owned()),
            );
        }
    }

    fn check_condition(
        &self,
        condition: &RunCondition,
        previous_route_state: &RouteNodeState,
        target_node_id: &str,
    ) -> Result<bool> {
        condition_handler(&self.init_params, &self.graph, condition).check(
            &self.runtime,
            previous_route_state,
            target_node_id,
        )
    }

    async fn emit(&self, tx: &EventSender, event: GraphEngineEvent) -> Result<()> {
        tx.send(event)
            .await
            .map_err(|_| GraphEngineError::StreamClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeRegistry, NodeRunResult};
    use crate::runtime::{InvokeFrom, UserFrom, WorkflowType};
    use crate::variable_pool::VariablePool;
    use async_stream::stream;
    use serde_json::{json, Map};

    struct ScriptedNode {
        init: NodeInit,
        items: Vec<std::result::Result<NodeEvent, NodeError>>,
    }

    impl Node for ScriptedNode {
        fn id(&self) -> &str {
            &self.init.id
        }
        fn node_id(&self) -> &str {
            &self.init.config.id
        }
        fn node_type(&self) -> NodeType {
            self.init.config.node_type
        }
        fn node_data(&self) -> &Value {
            &self.init.config.data
        }
        fn run(self: Box<Self>) -> crate::node::NodeEventStream {
            Box::pin(stream! {
                for item in self.items {
                    yield item;
                }
            })
        }
    }

    fn executor_fixture() -> (Arc<GraphExecutor>, NodeInit) {
        let graph = Arc::new(
            Graph::builder()
                .node(crate::graph::NodeConfig::new("n", NodeType::Llm))
                .build()
                .unwrap(),
        );
        let init_params = Arc::new(GraphInitParams {
            tenant_id: "t".into(),
            app_id: "a".into(),
            workflow_type: WorkflowType::Workflow,
            workflow_id: "w".into(),
            user_id: "u".into(),
            user_from: UserFrom::Account,
            invoke_from: InvokeFrom::Debugger,
            call_depth: 0,
            graph_config: Value::Null,
        });
        let runtime = Arc::new(GraphRuntimeState::new(VariablePool::new()));
        let executor = Arc::new(GraphExecutor {
            graph: graph.clone(),
            init_params: init_params.clone(),
            runtime: runtime.clone(),
            registry: Arc::new(NodeRegistry::default()),
            max_execution_steps: 10,
            max_execution_time: Duration::from_secs(10),
        });
        let init = NodeInit {
            id: "state-1".into(),
            config: crate::graph::NodeConfig::new("n", NodeType::Llm),
            init_params,
            graph,
            runtime_state: runtime,
            previous_node_id: None,
        };
        (executor, init)
    }

    #[tokio::test]
    async fn runner_maps_chunks_and_completion() {
        let (executor, init) = executor_fixture();
        let mut route_state = RouteNodeState::new("n");
        let mut outputs = Map::new();
        outputs.insert("text".into(), json!("hi"));
        let node = Box::new(ScriptedNode {
            init,
            items: vec![
                Ok(NodeEvent::StreamChunk {
                    chunk_content: "h".into(),
                    from_variable_selector: None,
                }),
                Ok(NodeEvent::Completed(NodeRunResult::succeeded(outputs))),
            ],
        });

        let (tx, mut rx) = mpsc::channel(16);
        executor
            .run_node(node, &mut route_state, None, None, None, &tx)
            .await
            .unwrap();
        drop(tx);

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(serde_json::to_value(&event).unwrap()["event"].clone());
        }
        assert_eq!(
            kinds,
            vec![
                json!("node_run_started"),
                json!("node_run_stream_chunk"),
                json!("node_run_succeeded"),
            ]
        );
        assert_eq!(route_state.status, RouteNodeStatus::Succeeded);
        assert_eq!(route_state.index, 1);
        // outputs were published to the pool under the authoring node id
        assert_eq!(
            executor
                .runtime
                .variable_pool()
                .get(&["n".into(), "text".into()]),
            Some(json!("hi"))
        );
    }

    #[tokio::test]
    async fn stopped_node_fails_quietly_without_propagating() {
        let (executor, init) = executor_fixture();
        let mut route_state = RouteNodeState::new("n");
        let node = Box::new(ScriptedNode {
            init,
            items: vec![Err(NodeError::Stopped)],
        });

        let (tx, mut rx) = mpsc::channel(16);
        let result = executor
            .run_node(node, &mut route_state, None, None, None, &tx)
            .await;
        drop(tx);

        assert!(result.is_ok(), "stop must not propagate as an error");
        assert_eq!(route_state.status, RouteNodeStatus::Failed);
        assert_eq!(route_state.failed_reason.as_deref(), Some("Workflow stopped."));

        let mut last = None;
        while let Some(event) = rx.recv().await {
            last = Some(serde_json::to_value(&event).unwrap());
        }
        let last = last.unwrap();
        assert_eq!(last["event"], "node_run_failed");
        assert_eq!(last["error"], "Workflow stopped.");
    }

    #[tokio::test]
    async fn iteration_events_pass_through_with_parallel_tags() {
        let (executor, init) = executor_fixture();
        let mut route_state = RouteNodeState::new("n");
        let iteration = crate::event::IterationEvent {
            kind: crate::event::IterationEventKind::Started,
            id: "iter-1".into(),
            node_id: "n".into(),
            payload: Value::Null,
            parallel_id: None,
            parallel_start_node_id: None,
        };
        let node = Box::new(ScriptedNode {
            init,
            items: vec![
                Ok(NodeEvent::Engine(GraphEngineEvent::Iteration(iteration))),
                Ok(NodeEvent::Completed(NodeRunResult::succeeded(Map::new()))),
            ],
        });

        let (tx, mut rx) = mpsc::channel(16);
        executor
            .run_node(node, &mut route_state, None, Some("p1"), Some("n"), &tx)
            .await
            .unwrap();
        drop(tx);

        let mut stamped = false;
        while let Some(event) = rx.recv().await {
            if let GraphEngineEvent::Iteration(iteration) = &event {
                assert_eq!(iteration.parallel_id.as_deref(), Some("p1"));
                assert_eq!(iteration.parallel_start_node_id.as_deref(), Some("n"));
                stamped = true;
            }
        }
        assert!(stamped, "iteration event was not re-emitted");
    }

    #[tokio::test]
    async fn node_stream_error_emits_failure_event_then_propagates() {
        let (executor, init) = executor_fixture();
        let mut route_state = RouteNodeState::new("n");
        let node = Box::new(ScriptedNode {
            init,
            items: vec![Err(NodeError::failed("boom"))],
        });

        let (tx, mut rx) = mpsc::channel(16);
        let err = executor
            .run_node(node, &mut route_state, None, None, None, &tx)
            .await
            .unwrap_err();
        drop(tx);

        assert_eq!(err, GraphEngineError::run_failed("boom"));
        assert_eq!(route_state.failed_reason.as_deref(), Some("boom"));

        // the failure is observable as an event before the error propagates
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(serde_json::to_value(&event).unwrap());
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["event"], "node_run_started");
        assert_eq!(events[1]["event"], "node_run_failed");
        assert_eq!(events[1]["error"], "boom");
        assert_eq!(events[1]["node_id"], "n");
    }
}
