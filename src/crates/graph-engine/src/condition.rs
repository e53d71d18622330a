//! Run-condition evaluation
//!
//! Each [`RunCondition`] variant has a dedicated handler; the executor asks
//! [`condition_handler`] for one and calls [`ConditionHandler::check`] when
//! it weighs an outgoing edge. Handler errors abort the run.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{GraphEngineError, Result};
use crate::graph::{ComparisonOperator, Graph, RunCondition, VariableCondition};
use crate::route::RouteNodeState;
use crate::runtime::{GraphInitParams, GraphRuntimeState};
use crate::variable_pool::VariablePool;

/// Decides whether an edge gated by a run-condition may be taken.
pub trait ConditionHandler: Send + Sync {
    fn check(
        &self,
        runtime_state: &GraphRuntimeState,
        previous_route_state: &RouteNodeState,
        target_node_id: &str,
    ) -> Result<bool>;
}

/// Handler factory, dispatching on the condition variant.
///
/// `init_params` and `graph` are part of the factory seam so applications
/// can plug handlers that consult them; the built-in handlers do not.
pub fn condition_handler(
    _init_params: &Arc<GraphInitParams>,
    _graph: &Arc<Graph>,
    run_condition: &RunCondition,
) -> Box<dyn ConditionHandler> {
    match run_condition {
        RunCondition::BranchIdentify { branch_identify } => Box::new(BranchIdentifyHandler {
            branch_identify: branch_identify.clone(),
        }),
        RunCondition::Condition { conditions } => Box::new(ExpressionHandler {
            conditions: conditions.clone(),
        }),
    }
}

/// Matches the branch handle the previous node reported in its run result.
struct BranchIdentifyHandler {
    branch_identify: String,
}

impl ConditionHandler for BranchIdentifyHandler {
    fn check(
        &self,
        _runtime_state: &GraphRuntimeState,
        previous_route_state: &RouteNodeState,
        _target_node_id: &str,
    ) -> Result<bool> {
        let handle = previous_route_state
            .node_run_result
            .as_ref()
            .and_then(|result| result.edge_source_handle.as_deref());
        Ok(handle == Some(self.branch_identify.as_str()))
    }
}

/// Evaluates variable comparisons against the pool; all must hold.
struct ExpressionHandler {
    conditions: Vec<VariableCondition>,
}

impl ConditionHandler for ExpressionHandler {
    fn check(
        &self,
        runtime_state: &GraphRuntimeState,
        _previous_route_state: &RouteNodeState,
        _target_node_id: &str,
    ) -> Result<bool> {
        for condition in &self.conditions {
            if !evaluate(condition, runtime_state.variable_pool())? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn evaluate(condition: &VariableCondition, pool: &VariablePool) -> Result<bool> {
    let actual = pool.get(&condition.variable_selector);
    let expected = condition.value.as_ref();

    use ComparisonOperator::*;
    match condition.comparison_operator {
        Equal | Is => Ok(loose_eq(actual.as_ref(), expected)),
        NotEqual | IsNot => Ok(!loose_eq(actual.as_ref(), expected)),
        Contains => Ok(contains(actual.as_ref(), expected)),
        NotContains => Ok(!contains(actual.as_ref(), expected)),
        StartWith => Ok(str_pair(actual.as_ref(), expected)
            .map(|(a, e)| a.starts_with(e))
            .unwrap_or(false)),
        EndWith => Ok(str_pair(actual.as_ref(), expected)
            .map(|(a, e)| a.ends_with(e))
            .unwrap_or(false)),
        Empty => Ok(is_empty(actual.as_ref())),
        NotEmpty => Ok(!is_empty(actual.as_ref())),
        GreaterThan => numeric(condition, actual.as_ref(), expected, |a, e| a > e),
        LessThan => numeric(condition, actual.as_ref(), expected, |a, e| a < e),
        GreaterThanOrEqual => numeric(condition, actual.as_ref(), expected, |a, e| a >= e),
        LessThanOrEqual => numeric(condition, actual.as_ref(), expected, |a, e| a <= e),
    }
}

fn loose_eq(actual: Option<&Value>, expected: Option<&Value>) -> bool {
    match (actual, expected) {
        (None, None) => true,
        (Some(a), Some(e)) => match (a.as_f64(), e.as_f64()) {
            (Some(a), Some(e)) => a == e,
            _ => a == e,
        },
        _ => false,
    }
}

fn contains(actual: Option<&Value>, expected: Option<&Value>) -> bool {
    match (actual, expected) {
        (Some(Value::String(a)), Some(Value::String(e))) => a.contains(e.as_str()),
        (Some(Value::Array(items)), Some(e)) => items.contains(e),
        _ => false,
    }
}

fn str_pair<'a>(
    actual: Option<&'a Value>,
    expected: Option<&'a Value>,
) -> Option<(&'a str, &'a str)> {
    match (actual?, expected?) {
        (Value::String(a), Value::String(e)) => Some((a, e)),
        _ => None,
    }
}

fn is_empty(actual: Option<&Value>) -> bool {
    match actual {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

fn numeric(
    condition: &VariableCondition,
    actual: Option<&Value>,
    expected: Option<&Value>,
    cmp: impl Fn(f64, f64) -> bool,
) -> Result<bool> {
    let pair = actual
        .and_then(Value::as_f64)
        .zip(expected.and_then(Value::as_f64));
    match pair {
        Some((a, e)) => Ok(cmp(a, e)),
        None => Err(GraphEngineError::run_failed(format!(
            "Invalid number comparison for variable {}.",
            condition.variable_selector.join(".")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeRunResult;
    use serde_json::{json, Map};

    fn variable_condition(
        selector: &[&str],
        op: ComparisonOperator,
        value: Option<Value>,
    ) -> VariableCondition {
        VariableCondition {
            variable_selector: selector.iter().map(|s| s.to_string()).collect(),
            comparison_operator: op,
            value,
        }
    }

    #[test]
    fn branch_identify_matches_edge_source_handle() {
        let runtime = GraphRuntimeState::new(VariablePool::new());
        let mut previous = RouteNodeState::new("router");
        previous.set_finished(
            NodeRunResult::succeeded(Map::new()).with_edge_source_handle("true"),
        );

        let handler = BranchIdentifyHandler {
            branch_identify: "true".into(),
        };
        assert!(handler.check(&runtime, &previous, "n1").unwrap());

        let handler = BranchIdentifyHandler {
            branch_identify: "false".into(),
        };
        assert!(!handler.check(&runtime, &previous, "n1").unwrap());
    }

    #[test]
    fn branch_identify_without_result_never_matches() {
        let runtime = GraphRuntimeState::new(VariablePool::new());
        let previous = RouteNodeState::new("router");
        let handler = BranchIdentifyHandler {
            branch_identify: "true".into(),
        };
        assert!(!handler.check(&runtime, &previous, "n1").unwrap());
    }

    #[test]
    fn expression_operators() {
        let pool = VariablePool::new();
        pool.add(&["n".into(), "text".into()], json!("hello world"));
        pool.add(&["n".into(), "count".into()], json!(5));
        pool.add(&["n".into(), "tags".into()], json!(["a", "b"]));

        let cases = [
            (variable_condition(&["n", "text"], ComparisonOperator::Contains, Some(json!("world"))), true),
            (variable_condition(&["n", "text"], ComparisonOperator::StartWith, Some(json!("hello"))), true),
            (variable_condition(&["n", "text"], ComparisonOperator::EndWith, Some(json!("hello"))), false),
            (variable_condition(&["n", "tags"], ComparisonOperator::Contains, Some(json!("b"))), true),
            (variable_condition(&["n", "count"], ComparisonOperator::GreaterThan, Some(json!(3))), true),
            (variable_condition(&["n", "count"], ComparisonOperator::LessThanOrEqual, Some(json!(5))), true),
            (variable_condition(&["n", "count"], ComparisonOperator::Equal, Some(json!(5.0))), true),
            (variable_condition(&["n", "missing"], ComparisonOperator::Empty, None), true),
            (variable_condition(&["n", "text"], ComparisonOperator::NotEmpty, None), true),
        ];
        for (condition, expected) in cases {
            assert_eq!(
                evaluate(&condition, &pool).unwrap(),
                expected,
                "operator {:?}",
                condition.comparison_operator
            );
        }
    }

    #[test]
    fn numeric_comparison_on_non_number_is_an_error() {
        let pool = VariablePool::new();
        pool.add(&["n".into(), "text".into()], json!("abc"));
        let condition = variable_condition(
            &["n", "text"],
            ComparisonOperator::GreaterThan,
            Some(json!(1)),
        );
        let err = evaluate(&condition, &pool).unwrap_err();
        assert!(err.to_string().contains("Invalid number comparison"));
    }

    #[test]
    fn all_conditions_must_hold() {
        let runtime = GraphRuntimeState::new(VariablePool::new());
        runtime
            .variable_pool()
            .add(&["n".into(), "a".into()], json!(1));
        let previous = RouteNodeState::new("n");

        let handler = ExpressionHandler {
            conditions: vec![
                variable_condition(&["n", "a"], ComparisonOperator::Equal, Some(json!(1))),
                variable_condition(&["n", "a"], ComparisonOperator::Equal, Some(json!(2))),
            ],
        };
        assert!(!handler.check(&runtime, &previous, "t").unwrap());
    }
}
