mod common;

use boardcore::{
    Board, EngineError, EventBus, ExecutionEvent, ExecutionStatus, LogEvent, NodeEvent, NodeKind,
    NodeSpec, NodeStatus, RunRequest, ValidationError, Value,
};
use boardruntime::{ExecutionEngine, ExecutionStore, InMemoryExecutionStore, RuntimeConfig};
use common::{diamond_board, init_tracing, linear_board, task, Outcome, ScriptedExecutor};
use std::sync::Arc;
use std::time::Duration;

fn engine(
    board: Board,
    executor: &Arc<ScriptedExecutor>,
    store: &InMemoryExecutionStore,
) -> ExecutionEngine {
    ExecutionEngine::new(Arc::new(board), executor.clone(), Arc::new(store.clone()))
}

#[tokio::test]
async fn linear_board_completes() {
    init_tracing();
    let (board, [start, a, end]) = linear_board();
    let executor = Arc::new(ScriptedExecutor::new());
    let store = InMemoryExecutionStore::new();

    let exec = engine(board, &executor, &store)
        .run(RunRequest::manual("tester"))
        .await
        .unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.total_nodes, 3);
    assert_eq!(exec.completed_nodes, 3);
    assert_eq!(exec.failed_nodes, 0);
    assert_eq!(exec.skipped_nodes, 0);
    assert!(exec.duration_ms.is_some());
    assert_eq!(executor.calls(), vec![start, a, end]);

    let result = exec.result_data.as_ref().unwrap();
    assert!(!result.partial_failure);
    assert_eq!(result.node_states.get(&a), Some(&NodeStatus::Succeeded));
    assert_eq!(
        result.outputs.get(&a).and_then(|o| o.get("node")).and_then(Value::as_str),
        Some("A")
    );

    // what the store holds is what the caller got
    assert_eq!(store.get(exec.id).await.unwrap(), exec);

    let events: Vec<LogEvent> = exec.execution_log.iter().map(|e| e.event).collect();
    assert_eq!(events.first(), Some(&LogEvent::RunStarted));
    assert_eq!(events.last(), Some(&LogEvent::RunCompleted));
    for (i, entry) in exec.execution_log.iter().enumerate() {
        assert_eq!(entry.sequence, i as u64);
    }
}

#[tokio::test]
async fn failed_branch_is_tolerated() {
    init_tracing();
    let (board, [_, a, b, end]) = diamond_board();
    let executor = Arc::new(ScriptedExecutor::new());
    executor.fail(a, "agent refused");
    let store = InMemoryExecutionStore::new();

    let exec = engine(board, &executor, &store)
        .run(RunRequest::manual("tester"))
        .await
        .unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.failed_nodes, 1);
    assert_eq!(exec.completed_nodes, 3);
    assert_eq!(executor.call_count(end), 1);

    let result = exec.result_data.unwrap();
    assert!(result.partial_failure);
    assert_eq!(result.node_states.get(&a), Some(&NodeStatus::Failed));
    assert_eq!(result.node_states.get(&b), Some(&NodeStatus::Succeeded));
    assert_eq!(result.errors.len(), 1);
    assert!(!result.errors[0].propagated);
    assert!(result.errors[0].message.contains("agent refused"));

    // only the live predecessor feeds End
    let inputs = executor.inputs_of(end).unwrap();
    assert!(inputs.contains_key(&b.to_string()));
    assert!(!inputs.contains_key(&a.to_string()));
}

#[tokio::test]
async fn unsatisfied_condition_skips_target() {
    init_tracing();
    let mut board = Board::new("branch");
    let start = board.add_node(NodeSpec::new(NodeKind::Start));
    let a = board.add_node(task("A"));
    let b = board.add_node(task("B"));
    let end = board.add_node(NodeSpec::new(NodeKind::End));
    board.connect(start, a);
    board.connect_when(a, b, "output.score > 0.5");
    board.connect(a, end);
    board.connect(b, end);

    let executor = Arc::new(ScriptedExecutor::new());
    executor.succeed_with(a, "score", 0.3);
    let store = InMemoryExecutionStore::new();

    let exec = engine(board, &executor, &store)
        .run(RunRequest::manual("tester"))
        .await
        .unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.skipped_nodes, 1);
    assert_eq!(exec.failed_nodes, 0);
    assert_eq!(executor.call_count(b), 0);
    assert_eq!(executor.call_count(end), 1);
    let result = exec.result_data.unwrap();
    assert_eq!(result.node_states.get(&b), Some(&NodeStatus::Skipped));
    assert!(!result.partial_failure);
}

#[tokio::test]
async fn condition_reads_connection_config() {
    init_tracing();
    let mut board = Board::new("threshold");
    let start = board.add_node(NodeSpec::new(NodeKind::Start));
    let a = board.add_node(task("A"));
    let hi = board.add_node(task("High"));
    let lo = board.add_node(task("Low"));
    let end = board.add_node(NodeSpec::new(NodeKind::End));
    board.connect(start, a);
    board.add_connection(
        boardcore::Connection::new(a, hi)
            .with_condition("output.score >= config.threshold")
            .with_condition_config("threshold", 0.8),
    );
    board.add_connection(
        boardcore::Connection::new(a, lo)
            .with_condition("output.score < config.threshold")
            .with_condition_config("threshold", 0.8),
    );
    board.connect(hi, end);
    board.connect(lo, end);

    let executor = Arc::new(ScriptedExecutor::new());
    executor.succeed_with(a, "score", 0.9);
    let store = InMemoryExecutionStore::new();

    let exec = engine(board, &executor, &store)
        .run(RunRequest::manual("tester"))
        .await
        .unwrap();

    assert_eq!(executor.call_count(hi), 1);
    assert_eq!(executor.call_count(lo), 0);
    assert_eq!(exec.completed_nodes, 4);
    assert_eq!(exec.skipped_nodes, 1);
}

#[tokio::test]
async fn trigger_data_is_visible_to_conditions() {
    init_tracing();
    let mut board = Board::new("trigger");
    let start = board.add_node(NodeSpec::new(NodeKind::Start));
    let vip = board.add_node(task("Vip"));
    let end = board.add_node(NodeSpec::new(NodeKind::End));
    board.connect_when(start, vip, "trigger.tier == 'gold' && execution_type == 'webhook'");
    board.connect(start, end);
    board.connect(vip, end);

    let executor = Arc::new(ScriptedExecutor::new());
    let store = InMemoryExecutionStore::new();
    let request = RunRequest::manual("hook")
        .with_type("webhook")
        .with_trigger_data(Value::object().with("tier", "gold"));

    let exec = engine(board, &executor, &store).run(request).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(executor.call_count(vip), 1);
}

#[tokio::test]
async fn critical_failure_aborts_remaining_stages() {
    init_tracing();
    let mut board = Board::new("critical");
    let start = board.add_node(NodeSpec::new(NodeKind::Start));
    let a = board.add_node(task("A").critical());
    let b = board.add_node(task("B"));
    let c = board.add_node(task("C"));
    let end = board.add_node(NodeSpec::new(NodeKind::End));
    board.connect(start, a);
    board.connect(start, b);
    board.connect(b, c);
    board.connect(a, end);
    board.connect(c, end);

    let executor = Arc::new(ScriptedExecutor::new());
    executor.fail(a, "boom");
    let store = InMemoryExecutionStore::new();

    let exec = engine(board, &executor, &store)
        .run(RunRequest::manual("tester"))
        .await
        .unwrap();

    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert!(exec.error_message.as_deref().unwrap().contains("boom"));
    // B ran alongside A; nothing after that stage did
    assert_eq!(executor.call_count(b), 1);
    assert_eq!(executor.call_count(c), 0);
    assert_eq!(executor.call_count(end), 0);
    assert_eq!(exec.completed_nodes, 2);
    assert_eq!(exec.failed_nodes, 1);
    assert_eq!(exec.skipped_nodes, 2);
    assert_eq!(exec.resolved_nodes(), exec.total_nodes);
    assert_eq!(
        exec.execution_log.last().map(|e| e.event),
        Some(LogEvent::RunFailed)
    );
}

#[tokio::test]
async fn non_critical_dependents_of_failure_are_skipped() {
    init_tracing();
    let mut board = Board::new("downstream");
    let start = board.add_node(NodeSpec::new(NodeKind::Start));
    let a = board.add_node(task("A"));
    let c = board.add_node(task("C"));
    let end = board.add_node(NodeSpec::new(NodeKind::End));
    board.connect(start, a);
    board.connect(a, c);
    board.connect(c, end);
    board.connect(start, end);

    let executor = Arc::new(ScriptedExecutor::new());
    executor.fail(a, "nope");
    let store = InMemoryExecutionStore::new();

    let exec = engine(board, &executor, &store)
        .run(RunRequest::manual("tester"))
        .await
        .unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    let result = exec.result_data.as_ref().unwrap();
    assert_eq!(result.node_states.get(&c), Some(&NodeStatus::Skipped));
    assert_eq!(result.node_states.get(&end), Some(&NodeStatus::Succeeded));
    assert_eq!(exec.failed_nodes, 1);
    assert_eq!(exec.skipped_nodes, 1);
    assert_eq!(exec.completed_nodes, 2);
}

#[tokio::test]
async fn critical_node_behind_failure_fails_by_propagation() {
    init_tracing();
    let mut board = Board::new("propagation");
    let start = board.add_node(NodeSpec::new(NodeKind::Start));
    let a = board.add_node(task("A"));
    let c = board.add_node(task("C").critical());
    let end = board.add_node(NodeSpec::new(NodeKind::End));
    board.connect(start, a);
    board.connect(a, c);
    board.connect(c, end);

    let executor = Arc::new(ScriptedExecutor::new());
    executor.fail(a, "upstream broke");
    let store = InMemoryExecutionStore::new();

    let exec = engine(board, &executor, &store)
        .run(RunRequest::manual("tester"))
        .await
        .unwrap();

    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(executor.call_count(c), 0);
    assert_eq!(exec.failed_nodes, 2);
    assert_eq!(exec.skipped_nodes, 1);
    assert_eq!(exec.resolved_nodes(), exec.total_nodes);

    let result = exec.result_data.unwrap();
    assert_eq!(result.node_states.get(&c), Some(&NodeStatus::Failed));
    let propagated: Vec<_> = result.errors.iter().filter(|e| e.propagated).collect();
    assert_eq!(propagated.len(), 1);
    assert_eq!(propagated[0].node_id, c);
}

#[tokio::test]
async fn critical_node_fails_when_upstream_failure_is_transitive() {
    init_tracing();
    let mut board = Board::new("transitive");
    let start = board.add_node(NodeSpec::new(NodeKind::Start));
    let a = board.add_node(task("A"));
    let b = board.add_node(task("B"));
    let c = board.add_node(task("C").critical());
    let end = board.add_node(NodeSpec::new(NodeKind::End));
    board.connect(start, a);
    board.connect(a, b);
    board.connect(b, c);
    board.connect(c, end);

    let executor = Arc::new(ScriptedExecutor::new());
    executor.fail(a, "upstream broke");
    let store = InMemoryExecutionStore::new();

    let exec = engine(board, &executor, &store)
        .run(RunRequest::manual("tester"))
        .await
        .unwrap();

    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(executor.calls(), vec![start, a]);
    assert_eq!(exec.completed_nodes, 1);
    assert_eq!(exec.failed_nodes, 2);
    assert_eq!(exec.skipped_nodes, 2);
    assert_eq!(exec.resolved_nodes(), exec.total_nodes);

    let result = exec.result_data.unwrap();
    assert_eq!(result.node_states.get(&b), Some(&NodeStatus::Skipped));
    assert_eq!(result.node_states.get(&c), Some(&NodeStatus::Failed));
    assert_eq!(result.node_states.get(&end), Some(&NodeStatus::Skipped));
    let propagated: Vec<_> = result.errors.iter().filter(|e| e.propagated).collect();
    assert_eq!(propagated.len(), 1);
    assert_eq!(propagated[0].node_id, c);
}

#[tokio::test]
async fn skipped_branch_does_not_fail_critical_node() {
    init_tracing();
    let mut board = Board::new("gated");
    let start = board.add_node(NodeSpec::new(NodeKind::Start));
    let a = board.add_node(task("A"));
    let b = board.add_node(task("B"));
    let c = board.add_node(task("C").critical());
    let end = board.add_node(NodeSpec::new(NodeKind::End));
    board.connect(start, a);
    board.connect_when(a, b, "output.score > 0.5");
    board.connect(b, c);
    board.connect(c, end);
    board.connect(start, end);

    let executor = Arc::new(ScriptedExecutor::new());
    executor.succeed_with(a, "score", 0.1);
    let store = InMemoryExecutionStore::new();

    let exec = engine(board, &executor, &store)
        .run(RunRequest::manual("tester"))
        .await
        .unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    let result = exec.result_data.unwrap();
    assert_eq!(result.node_states.get(&b), Some(&NodeStatus::Skipped));
    assert_eq!(result.node_states.get(&c), Some(&NodeStatus::Skipped));
    assert!(result.errors.is_empty());
}

#[tokio::test]
async fn condition_can_address_node_by_id() {
    init_tracing();
    let mut board = Board::new("by-id");
    let start = board.add_node(NodeSpec::new(NodeKind::Start));
    let mut scorer = task("Scorer");
    scorer.id = uuid::Uuid::parse_str("3fa85f64-5717-4562-b3fc-2c963f66afa6").unwrap();
    let scorer = board.add_node(scorer);
    let high = board.add_node(task("High"));
    let low = board.add_node(task("Low"));
    let end = board.add_node(NodeSpec::new(NodeKind::End));
    board.connect(start, scorer);
    board.connect_when(scorer, high, format!("{}.score > 0.5", scorer));
    board.connect_when(scorer, low, format!("{}.score <= 0.5", scorer));
    board.connect(high, end);
    board.connect(low, end);

    let executor = Arc::new(ScriptedExecutor::new());
    executor.succeed_with(scorer, "score", 0.8);
    let store = InMemoryExecutionStore::new();

    let exec = engine(board, &executor, &store)
        .run(RunRequest::manual("tester"))
        .await
        .unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(executor.call_count(high), 1);
    assert_eq!(executor.call_count(low), 0);
    assert!(exec
        .execution_log
        .iter()
        .all(|e| e.event != LogEvent::ConditionError));
}

#[tokio::test]
async fn malformed_condition_is_unsatisfied() {
    init_tracing();
    let mut board = Board::new("malformed");
    let start = board.add_node(NodeSpec::new(NodeKind::Start));
    let a = board.add_node(task("A"));
    let b = board.add_node(task("B"));
    let end = board.add_node(NodeSpec::new(NodeKind::End));
    board.connect(start, a);
    board.connect_when(a, b, "output.score >");
    board.connect(a, end);
    board.connect(b, end);

    let executor = Arc::new(ScriptedExecutor::new());
    let store = InMemoryExecutionStore::new();

    let exec = engine(board, &executor, &store)
        .run(RunRequest::manual("tester"))
        .await
        .unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(executor.call_count(b), 0);
    assert!(exec
        .execution_log
        .iter()
        .any(|e| e.event == LogEvent::ConditionError && e.node_id == Some(b)));
}

#[tokio::test]
async fn condition_error_on_only_path_fails_critical_node() {
    init_tracing();
    let mut board = Board::new("malformed-critical");
    let start = board.add_node(NodeSpec::new(NodeKind::Start));
    let a = board.add_node(task("A"));
    let b = board.add_node(task("B").critical());
    let end = board.add_node(NodeSpec::new(NodeKind::End));
    board.connect(start, a);
    board.connect_when(a, b, "output.score > 'high'");
    board.connect(b, end);

    let executor = Arc::new(ScriptedExecutor::new());
    executor.succeed_with(a, "score", 0.7);
    let store = InMemoryExecutionStore::new();

    let exec = engine(board, &executor, &store)
        .run(RunRequest::manual("tester"))
        .await
        .unwrap();

    assert_eq!(exec.status, ExecutionStatus::Failed);
    let result = exec.result_data.unwrap();
    assert_eq!(result.node_states.get(&b), Some(&NodeStatus::Failed));
    assert_eq!(result.node_states.get(&end), Some(&NodeStatus::Skipped));
}

#[tokio::test]
async fn invalid_board_never_runs() {
    init_tracing();
    let mut board = Board::new("no-end");
    let start = board.add_node(NodeSpec::new(NodeKind::Start));
    let a = board.add_node(task("A"));
    board.connect(start, a);
    let board_id = board.id;

    let executor = Arc::new(ScriptedExecutor::new());
    let store = InMemoryExecutionStore::new();

    let err = engine(board, &executor, &store)
        .run(RunRequest::manual("tester"))
        .await
        .unwrap_err();

    let EngineError::Validation {
        board_id: failed_board,
        execution_id,
        source,
    } = err
    else {
        panic!("expected validation error, got {:?}", err);
    };
    assert_eq!(failed_board, board_id);
    assert_eq!(source, ValidationError::MissingEndNode);
    assert!(executor.calls().is_empty());

    let record = store.get(execution_id.unwrap()).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.execution_log.len(), 1);
    assert_eq!(record.execution_log[0].event, LogEvent::ValidationFailed);
    assert!(record.error_message.unwrap().contains("no active end node"));
}

#[tokio::test]
async fn cyclic_board_is_rejected_with_path() {
    init_tracing();
    let mut board = Board::new("cycle");
    let start = board.add_node(NodeSpec::new(NodeKind::Start));
    let a = board.add_node(task("A"));
    let b = board.add_node(task("B"));
    let end = board.add_node(NodeSpec::new(NodeKind::End));
    board.connect(start, a);
    board.connect(a, b);
    board.connect(b, a);
    board.connect(b, end);

    let executor = Arc::new(ScriptedExecutor::new());
    let store = InMemoryExecutionStore::new();

    let err = engine(board, &executor, &store)
        .run(RunRequest::manual("tester"))
        .await
        .unwrap_err();
    match err {
        EngineError::Validation { source, .. } => {
            assert_eq!(source, ValidationError::Cycle { path: vec![a, b, a] })
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn worker_pool_bounds_concurrency() {
    init_tracing();
    let mut board = Board::new("wide");
    let start = board.add_node(NodeSpec::new(NodeKind::Start));
    let end = board.add_node(NodeSpec::new(NodeKind::End));
    let executor = Arc::new(ScriptedExecutor::new());
    for i in 0..5 {
        let n = board.add_node(task(&format!("W{}", i)));
        board.connect(start, n);
        board.connect(n, end);
        executor.delay(n, Duration::from_millis(40));
    }
    let store = InMemoryExecutionStore::new();
    let config = RuntimeConfig {
        max_parallel_nodes: 2,
        ..RuntimeConfig::default()
    };

    let exec = engine(board, &executor, &store)
        .with_config(config)
        .run(RunRequest::manual("tester"))
        .await
        .unwrap();

    assert_eq!(exec.completed_nodes, 7);
    assert_eq!(executor.peak_concurrency(), 2);
}

#[tokio::test]
async fn stage_runs_concurrently_by_default() {
    init_tracing();
    let (board, [_, a, b, _]) = diamond_board();
    let executor = Arc::new(ScriptedExecutor::new());
    executor.delay(a, Duration::from_millis(40));
    executor.delay(b, Duration::from_millis(40));
    let store = InMemoryExecutionStore::new();

    engine(board, &executor, &store)
        .run(RunRequest::manual("tester"))
        .await
        .unwrap();
    assert_eq!(executor.peak_concurrency(), 2);
}

#[tokio::test]
async fn slow_node_times_out() {
    init_tracing();
    let (board, [_, a, _]) = linear_board();
    let executor = Arc::new(ScriptedExecutor::new());
    executor.delay(a, Duration::from_secs(5));
    let store = InMemoryExecutionStore::new();
    let config = RuntimeConfig {
        node_timeout_ms: Some(30),
        ..RuntimeConfig::default()
    };

    let exec = engine(board, &executor, &store)
        .with_config(config)
        .run(RunRequest::manual("tester"))
        .await
        .unwrap();

    let result = exec.result_data.unwrap();
    assert_eq!(result.node_states.get(&a), Some(&NodeStatus::Failed));
    assert!(result.errors[0].message.contains("Timeout after 30ms"));
    assert_eq!(exec.failed_nodes, 1);
    assert_eq!(exec.skipped_nodes, 1);
}

#[tokio::test]
async fn run_timeout_cancels_run() {
    init_tracing();
    let (board, [start, a, end]) = linear_board();
    let executor = Arc::new(ScriptedExecutor::new());
    executor.script(a, Outcome::Hang);
    let store = InMemoryExecutionStore::new();
    let config = RuntimeConfig {
        run_timeout_ms: Some(50),
        ..RuntimeConfig::default()
    };

    let exec = engine(board, &executor, &store)
        .with_config(config)
        .run(RunRequest::manual("tester"))
        .await
        .unwrap();

    assert_eq!(exec.status, ExecutionStatus::Cancelled);
    assert_eq!(exec.error_message.as_deref(), Some("timed out after 50ms"));
    let result = exec.result_data.as_ref().unwrap();
    assert_eq!(result.node_states.get(&start), Some(&NodeStatus::Succeeded));
    assert_eq!(result.node_states.get(&a), Some(&NodeStatus::Skipped));
    assert_eq!(result.node_states.get(&end), Some(&NodeStatus::Skipped));
    assert_eq!(exec.resolved_nodes(), exec.total_nodes);
}

#[tokio::test]
async fn cancellation_mid_stage_keeps_history() {
    init_tracing();
    let (board, [start, a, end]) = linear_board();
    let executor = Arc::new(ScriptedExecutor::new());
    executor.script(a, Outcome::Hang);
    let store = InMemoryExecutionStore::new();

    let engine = engine(board, &executor, &store);
    let token = engine.cancellation_token();
    let run = tokio::spawn(async move { engine.run(RunRequest::manual("tester")).await });

    executor.hung.notified().await;
    token.cancel();
    let exec = run.await.unwrap().unwrap();

    assert_eq!(exec.status, ExecutionStatus::Cancelled);
    assert_eq!(exec.error_message.as_deref(), Some("cancelled by request"));
    assert_eq!(executor.call_count(end), 0);
    assert_eq!(executor.cancelled().len(), 1);
    assert_eq!(executor.cancelled()[0].node_id, a);

    assert_eq!(exec.completed_nodes, 1);
    assert_eq!(exec.skipped_nodes, 2);
    assert_eq!(exec.failed_nodes, 0);

    let log = &exec.execution_log;
    assert!(log
        .iter()
        .any(|e| e.event == LogEvent::NodeSucceeded && e.node_id == Some(start)));
    assert!(log
        .iter()
        .any(|e| e.event == LogEvent::NodeCancelled && e.node_id == Some(a)));
    assert_eq!(log.last().map(|e| e.event), Some(LogEvent::RunCancelled));

    let stored = store.get(exec.id).await.unwrap();
    assert_eq!(stored.execution_log, exec.execution_log);
}

#[tokio::test]
async fn unavailable_executor_is_fatal() {
    init_tracing();
    let (board, [_, a, end]) = linear_board();
    let executor = Arc::new(ScriptedExecutor::new());
    executor.script(a, Outcome::Unavailable);
    let store = InMemoryExecutionStore::new();

    let err = engine(board, &executor, &store)
        .run(RunRequest::manual("tester"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ExecutorUnavailable(_)));
    assert_eq!(executor.call_count(end), 0);

    let records = store.list().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ExecutionStatus::Failed);
    assert_eq!(records[0].failed_nodes, 1);
    assert_eq!(records[0].resolved_nodes(), records[0].total_nodes);
}

#[tokio::test]
async fn loop_node_stops_when_condition_holds() {
    init_tracing();
    let mut board = Board::new("loop");
    let start = board.add_node(NodeSpec::new(NodeKind::Start));
    let retry = board.add_node(
        NodeSpec::new(NodeKind::Loop {
            max_iterations: 10,
            until: Some("output.count >= 3".into()),
        })
        .with_name("Retry"),
    );
    let end = board.add_node(NodeSpec::new(NodeKind::End));
    board.connect(start, retry);
    board.connect(retry, end);

    let executor = Arc::new(ScriptedExecutor::new());
    let store = InMemoryExecutionStore::new();

    let exec = engine(board, &executor, &store)
        .run(RunRequest::manual("tester"))
        .await
        .unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(executor.call_count(retry), 3);
    let output = exec.result_data.unwrap().outputs.remove(&retry).unwrap();
    assert_eq!(output.get("iterations"), Some(&Value::Number(3.0)));
    assert_eq!(output.get("count"), Some(&Value::Number(3.0)));
}

#[tokio::test]
async fn loop_node_reports_progress() {
    init_tracing();
    let mut board = Board::new("progress");
    let start = board.add_node(NodeSpec::new(NodeKind::Start));
    let poll = board.add_node(NodeSpec::new(NodeKind::Loop {
        max_iterations: 4,
        until: Some("output.count == 2".into()),
    }));
    let end = board.add_node(NodeSpec::new(NodeKind::End));
    board.connect(start, poll);
    board.connect(poll, end);

    let executor = Arc::new(ScriptedExecutor::new());
    let store = InMemoryExecutionStore::new();
    let bus = Arc::new(EventBus::new(64));
    let mut rx = bus.subscribe();

    engine(board, &executor, &store)
        .with_event_bus(bus.clone())
        .run(RunRequest::manual("tester"))
        .await
        .unwrap();

    let mut progress = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ExecutionEvent::NodeEvent {
            node_id,
            event: NodeEvent::Progress { percent, message },
            ..
        } = event
        {
            assert_eq!(node_id, poll);
            progress.push((percent, message));
        }
    }
    assert_eq!(
        progress,
        vec![
            (25.0, Some("iteration 1/4".to_string())),
            (50.0, Some("iteration 2/4".to_string())),
        ]
    );
}

#[tokio::test]
async fn loop_node_without_condition_runs_to_bound() {
    init_tracing();
    let mut board = Board::new("bounded");
    let start = board.add_node(NodeSpec::new(NodeKind::Start));
    let repeat = board.add_node(NodeSpec::new(NodeKind::Loop {
        max_iterations: 4,
        until: None,
    }));
    let end = board.add_node(NodeSpec::new(NodeKind::End));
    board.connect(start, repeat);
    board.connect(repeat, end);

    let executor = Arc::new(ScriptedExecutor::new());
    let store = InMemoryExecutionStore::new();

    engine(board, &executor, &store)
        .run(RunRequest::manual("tester"))
        .await
        .unwrap();
    assert_eq!(executor.call_count(repeat), 4);
}

#[tokio::test]
async fn loop_above_configured_limit_is_rejected() {
    init_tracing();
    let mut board = Board::new("too-many");
    let start = board.add_node(NodeSpec::new(NodeKind::Start));
    let repeat = board.add_node(NodeSpec::new(NodeKind::Loop {
        max_iterations: 50,
        until: None,
    }));
    let end = board.add_node(NodeSpec::new(NodeKind::End));
    board.connect(start, repeat);
    board.connect(repeat, end);

    let executor = Arc::new(ScriptedExecutor::new());
    let store = InMemoryExecutionStore::new();
    let config = RuntimeConfig {
        max_loop_iterations: 10,
        ..RuntimeConfig::default()
    };

    let err = engine(board, &executor, &store)
        .with_config(config)
        .run(RunRequest::manual("tester"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation {
            source: ValidationError::UnboundedLoop { limit: 10, .. },
            ..
        }
    ));
    assert!(executor.calls().is_empty());
}

#[tokio::test]
async fn concurrent_runs_keep_separate_context() {
    init_tracing();
    let (board, [_, a, _]) = linear_board();
    let board = Arc::new(board);
    let executor = Arc::new(ScriptedExecutor::new());
    executor.delay(a, Duration::from_millis(20));
    let store = InMemoryExecutionStore::new();

    let runs = (0..4).map(|i| {
        let engine =
            ExecutionEngine::new(board.clone(), executor.clone(), Arc::new(store.clone()));
        async move {
            let request = RunRequest::manual("tester")
                .with_trigger_data(Value::object().with("request", i as i64));
            engine.run(request).await
        }
    });
    let results = futures::future::join_all(runs).await;

    for (i, exec) in results.into_iter().enumerate() {
        let exec = exec.unwrap();
        let output = exec.result_data.unwrap().outputs.remove(&a).unwrap();
        assert_eq!(
            output.lookup_dotted("trigger.request"),
            Some(&Value::Number(i as f64))
        );
    }
    assert_eq!(store.len().await, 4);
}

#[tokio::test]
async fn events_bracket_the_run() {
    init_tracing();
    let (board, _) = linear_board();
    let executor = Arc::new(ScriptedExecutor::new());
    let store = InMemoryExecutionStore::new();
    let bus = Arc::new(EventBus::new(64));
    let mut rx = bus.subscribe();

    engine(board, &executor, &store)
        .with_event_bus(bus.clone())
        .run(RunRequest::manual("tester"))
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(
        events.first(),
        Some(ExecutionEvent::RunStarted { total_nodes: 3, .. })
    ));
    assert!(matches!(
        events.last(),
        Some(ExecutionEvent::RunFinished {
            status: ExecutionStatus::Completed,
            ..
        })
    ));
    let started = events
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::NodeStarted { .. }))
        .count();
    assert_eq!(started, 3);
}

#[tokio::test]
async fn inactive_nodes_are_not_counted() {
    init_tracing();
    let (mut board, [_, a, end]) = linear_board();
    let off = board.add_node(task("Off").inactive());
    board.connect(a, off);
    board.connect(off, end);

    let executor = Arc::new(ScriptedExecutor::new());
    let store = InMemoryExecutionStore::new();

    let exec = engine(board, &executor, &store)
        .run(RunRequest::manual("tester"))
        .await
        .unwrap();
    assert_eq!(exec.total_nodes, 3);
    assert_eq!(exec.completed_nodes, 3);
    assert_eq!(executor.call_count(off), 0);
}

#[tokio::test]
async fn finished_record_cannot_be_rerun() {
    init_tracing();
    let (board, _) = linear_board();
    let executor = Arc::new(ScriptedExecutor::new());
    let store = InMemoryExecutionStore::new();
    let engine = engine(board, &executor, &store);

    let exec = engine.run(RunRequest::manual("tester")).await.unwrap();
    let err = engine.run_execution(exec).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::IllegalTransition {
            from: ExecutionStatus::Completed,
            to: ExecutionStatus::Running,
        }
    );
}
