use crate::condition::{Condition, ConditionEvaluator};
use crate::context::RunContext;
use crate::graph::{ordered_inbound, BoardGraph};
use crate::planner::{plan_graph, ExecutionPlan};
use crate::runtime::RuntimeConfig;
use crate::store::ExecutionStore;
use crate::validator::Validator;
use boardcore::{
    Board, EngineError, EventBus, Execution, ExecutionEvent, ExecutionStatus, InvocationHandle,
    LogEvent, LoopIteration, NodeContext, NodeError, NodeExecutor, NodeFailure, NodeId, NodeKind,
    NodeOutput, NodeSpec, NodeStatus, RunRequest, RunResult, ValidationError, Value,
};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Drives a single execution of a board snapshot.
///
/// One engine per run: it owns the run's context and counters and shares no
/// mutable state with other runs. The board it holds is never mutated.
pub struct ExecutionEngine {
    board: Arc<Board>,
    config: RuntimeConfig,
    executor: Arc<dyn NodeExecutor>,
    store: Arc<dyn ExecutionStore>,
    events: Arc<EventBus>,
    cancellation: CancellationToken,
    evaluator: ConditionEvaluator,
}

/// How a run that was not stopped by a fatal error ended.
enum Outcome {
    Completed,
    Aborted(String),
    Cancelled,
}

/// Live per-node state of the run.
struct RunState {
    statuses: HashMap<NodeId, NodeStatus>,
    context: RunContext,
    failures: Vec<NodeFailure>,
    /// Skipped nodes whose every inbound path ran through a failure.
    blocked: HashSet<NodeId>,
}

/// Why a node may or may not run this stage.
enum Gate {
    Eligible(BTreeMap<String, Value>),
    Skip,
    Blocked,
    PropagatedFailure(String),
}

/// Result of evaluating one inbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeState {
    Live,
    ConditionFalse,
    ConditionError,
    SourceFailed,
    SourceSkipped,
}

type Invocation = (NodeId, Result<NodeOutput, NodeError>, u64);

impl ExecutionEngine {
    pub fn new(
        board: Arc<Board>,
        executor: Arc<dyn NodeExecutor>,
        store: Arc<dyn ExecutionStore>,
    ) -> Self {
        let config = RuntimeConfig::default();
        let events = Arc::new(EventBus::new(config.event_buffer_size));
        Self {
            board,
            config,
            executor,
            store,
            events,
            cancellation: CancellationToken::new(),
            evaluator: ConditionEvaluator::new(),
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Token that cancels this run when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    /// Create a fresh execution record for `request` and run it.
    pub async fn run(&self, request: RunRequest) -> Result<Execution, EngineError> {
        let execution = Execution::new(self.board.id, &request);
        self.store.create(&execution).await?;
        self.run_execution(execution).await
    }

    /// Run a pending execution record to a terminal state.
    ///
    /// Returns the terminal record for completed, failed and cancelled runs.
    /// Validation failures and fatal engine errors are returned as errors
    /// after the failed record has been persisted.
    pub async fn run_execution(&self, mut execution: Execution) -> Result<Execution, EngineError> {
        if execution.status != ExecutionStatus::Pending {
            return Err(EngineError::IllegalTransition {
                from: execution.status,
                to: ExecutionStatus::Running,
            });
        }

        let graph = BoardGraph::new(&self.board);
        let plan = match self.prepare(&graph) {
            Ok(plan) => plan,
            Err(e) => return self.reject(execution, e).await,
        };

        let mut state = RunState {
            statuses: graph
                .node_ids()
                .iter()
                .map(|id| (*id, NodeStatus::Pending))
                .collect(),
            context: RunContext::new(
                execution.execution_type.clone(),
                execution.trigger_data.clone(),
            ),
            failures: Vec::new(),
            blocked: HashSet::new(),
        };

        let run_token = self.cancellation.child_token();
        let timer = self.config.run_timeout().map(|limit| {
            let token = run_token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                token.cancel();
            })
        });

        let outcome = self
            .drive(&mut execution, &mut state, &plan, &graph, &run_token)
            .await;

        if let Some(timer) = timer {
            timer.abort();
        }

        self.finish(execution, state, &plan, outcome).await
    }

    fn prepare(&self, graph: &BoardGraph) -> Result<ExecutionPlan, ValidationError> {
        Validator::new()
            .strict(self.config.strict_schemas)
            .max_loop_iterations(self.config.max_loop_iterations)
            .validate(&self.board)?;
        plan_graph(&self.board, graph)
    }

    /// Fail the execution before any node runs.
    async fn reject(
        &self,
        mut execution: Execution,
        error: ValidationError,
    ) -> Result<Execution, EngineError> {
        tracing::warn!(
            execution_id = %execution.id,
            board_id = %self.board.id,
            "Board failed validation: {}",
            error
        );

        execution.log(None, LogEvent::ValidationFailed, Some(error.to_string()));
        execution.error_message = Some(error.to_string());
        execution.transition(ExecutionStatus::Failed)?;
        self.store.update(&execution).await?;

        self.events.emit(ExecutionEvent::RunFinished {
            execution_id: execution.id,
            status: execution.status,
            duration_ms: 0,
            timestamp: Utc::now(),
        });

        Err(EngineError::Validation {
            board_id: self.board.id,
            execution_id: Some(execution.id),
            source: error,
        })
    }

    async fn record(
        &self,
        execution: &mut Execution,
        node_id: Option<NodeId>,
        event: LogEvent,
        detail: Option<String>,
    ) -> Result<(), EngineError> {
        let entry = execution.log(node_id, event, detail).clone();
        self.store.append_log_entry(execution.id, &entry).await?;
        Ok(())
    }

    async fn drive(
        &self,
        execution: &mut Execution,
        state: &mut RunState,
        plan: &ExecutionPlan,
        graph: &BoardGraph,
        run_token: &CancellationToken,
    ) -> Result<Outcome, EngineError> {
        execution.total_nodes = graph.node_count();
        execution.transition(ExecutionStatus::Running)?;
        self.record(
            execution,
            None,
            LogEvent::RunStarted,
            Some(format!("{} node(s) in {} stage(s)", graph.node_count(), plan.len())),
        )
        .await?;
        self.store.update(execution).await?;

        tracing::info!(
            execution_id = %execution.id,
            board_id = %self.board.id,
            "Starting run of board '{}' ({} nodes, {} stages)",
            self.board.name,
            execution.total_nodes,
            plan.len()
        );
        self.events.emit(ExecutionEvent::RunStarted {
            execution_id: execution.id,
            board_id: self.board.id,
            total_nodes: execution.total_nodes,
            timestamp: Utc::now(),
        });

        for stage in &plan.stages {
            if run_token.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }

            self.record(
                execution,
                None,
                LogEvent::StageStarted,
                Some(format!("stage {} with {} node(s)", stage.index, stage.nodes.len())),
            )
            .await?;
            self.events.emit(ExecutionEvent::StageStarted {
                execution_id: execution.id,
                stage: stage.index,
                nodes: stage.nodes.clone(),
                timestamp: Utc::now(),
            });

            // Gate every node against the context left by earlier stages
            let mut eligible = Vec::new();
            let mut abort = None;
            for node_id in &stage.nodes {
                let Some(node) = self.board.find_node(*node_id) else {
                    continue;
                };
                match self.gate(execution, state, graph, node).await? {
                    Gate::Eligible(inputs) => eligible.push((node, inputs)),
                    Gate::Skip => {
                        self.resolve_skipped(execution, state, node.id, None).await?;
                    }
                    Gate::Blocked => {
                        state.blocked.insert(node.id);
                        self.resolve_skipped(execution, state, node.id, None).await?;
                    }
                    Gate::PropagatedFailure(reason) => {
                        tracing::error!(
                            execution_id = %execution.id,
                            node_id = %node.id,
                            "Critical node {} cannot run: {}",
                            node.label(),
                            reason
                        );
                        self.resolve_failed(execution, state, node, reason.clone(), true)
                            .await?;
                        abort.get_or_insert(format!(
                            "critical node {} failed: {}",
                            node.label(),
                            reason
                        ));
                    }
                }
            }
            if let Some(reason) = abort.take() {
                self.store.update(execution).await?;
                return Ok(Outcome::Aborted(reason));
            }

            let results = self
                .dispatch(execution, state, eligible.clone(), run_token)
                .await?;

            // Record outcomes in plan order
            let mut fatal = None;
            for (node, _) in &eligible {
                let Some((result, duration_ms)) = results.get(&node.id) else {
                    // never dispatched, left for the final sweep
                    state.statuses.insert(node.id, NodeStatus::Pending);
                    continue;
                };
                match result {
                    Ok(output) => {
                        self.resolve_succeeded(execution, state, node, output, *duration_ms)
                            .await?;
                    }
                    Err(NodeError::Cancelled) if run_token.is_cancelled() => {
                        self.resolve_skipped(
                            execution,
                            state,
                            node.id,
                            Some("cancelled while running".to_string()),
                        )
                        .await?;
                    }
                    Err(err) => {
                        tracing::error!(
                            execution_id = %execution.id,
                            node_id = %node.id,
                            "Node {} failed: {}",
                            node.label(),
                            err
                        );
                        self.resolve_failed(execution, state, node, err.to_string(), false)
                            .await?;
                        if let NodeError::Unavailable(msg) = err {
                            fatal.get_or_insert(EngineError::ExecutorUnavailable(msg.clone()));
                        } else if node.critical {
                            abort.get_or_insert(format!(
                                "critical node {} failed: {}",
                                node.label(),
                                err
                            ));
                        }
                    }
                }
            }

            self.store.update(execution).await?;

            if let Some(err) = fatal {
                return Err(err);
            }
            if let Some(reason) = abort {
                return Ok(Outcome::Aborted(reason));
            }
            if run_token.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }
        }

        Ok(Outcome::Completed)
    }

    /// Decide whether a node runs, from the state of its inbound connections.
    async fn gate(
        &self,
        execution: &mut Execution,
        state: &RunState,
        graph: &BoardGraph,
        node: &NodeSpec,
    ) -> Result<Gate, EngineError> {
        let inbound = ordered_inbound(&self.board, graph, node.id);
        if inbound.is_empty() {
            return Ok(Gate::Eligible(BTreeMap::new()));
        }

        let mut inputs = BTreeMap::new();
        let mut edges = Vec::with_capacity(inbound.len());
        for conn in inbound {
            let source_status = state
                .statuses
                .get(&conn.source_node_id)
                .copied()
                .unwrap_or(NodeStatus::Skipped);
            let edge = match source_status {
                NodeStatus::Succeeded => {
                    let scope = state.context.scope_for(conn);
                    match self.evaluator.try_evaluate(conn, &scope) {
                        Ok(true) => EdgeState::Live,
                        Ok(false) => EdgeState::ConditionFalse,
                        Err(e) => {
                            tracing::warn!(
                                execution_id = %execution.id,
                                connection = %conn.id,
                                "Condition on connection into {} not satisfied: {}",
                                node.label(),
                                e
                            );
                            self.record(
                                execution,
                                Some(node.id),
                                LogEvent::ConditionError,
                                Some(format!("connection {}: {}", conn.id, e)),
                            )
                            .await?;
                            self.events.emit(ExecutionEvent::ConditionFailed {
                                execution_id: execution.id,
                                node_id: node.id,
                                error: e.to_string(),
                                timestamp: Utc::now(),
                            });
                            EdgeState::ConditionError
                        }
                    }
                }
                NodeStatus::Failed => EdgeState::SourceFailed,
                _ if state.blocked.contains(&conn.source_node_id) => EdgeState::SourceFailed,
                _ => EdgeState::SourceSkipped,
            };
            if edge == EdgeState::Live {
                if let Some(output) = state.context.output(conn.source_node_id) {
                    inputs.insert(conn.source_node_id.to_string(), output.clone());
                }
            }
            edges.push(edge);
        }

        if edges.contains(&EdgeState::Live) {
            return Ok(Gate::Eligible(inputs));
        }
        let cut_off = edges.iter().all(|e| *e == EdgeState::SourceFailed);
        if !node.critical {
            return Ok(if cut_off { Gate::Blocked } else { Gate::Skip });
        }

        if cut_off {
            return Ok(Gate::PropagatedFailure(
                "every inbound path runs through a failed node".to_string(),
            ));
        }
        let viable: Vec<EdgeState> = edges
            .iter()
            .copied()
            .filter(|e| matches!(e, EdgeState::ConditionFalse | EdgeState::ConditionError))
            .collect();
        if !viable.is_empty() && viable.iter().all(|e| *e == EdgeState::ConditionError) {
            return Ok(Gate::PropagatedFailure(
                "condition on the only viable inbound path could not be evaluated".to_string(),
            ));
        }
        Ok(Gate::Skip)
    }

    /// Run the eligible nodes of one stage concurrently, bounded by the
    /// worker pool, and wait for all of them to resolve.
    async fn dispatch(
        &self,
        execution: &mut Execution,
        state: &mut RunState,
        eligible: Vec<(&NodeSpec, BTreeMap<String, Value>)>,
        run_token: &CancellationToken,
    ) -> Result<HashMap<NodeId, (Result<NodeOutput, NodeError>, u64)>, EngineError> {
        let mut results = HashMap::new();
        if eligible.is_empty() {
            return Ok(results);
        }

        let limit = self.config.max_parallel_nodes.max(1).min(eligible.len());
        let snapshot = Arc::new(state.context.to_value());
        let node_timeout = self.config.node_timeout();

        let mut pending = eligible.into_iter();
        let mut running = FuturesUnordered::new();
        let mut in_flight: HashMap<NodeId, InvocationHandle> = HashMap::new();
        let mut cancel_sent = false;

        loop {
            while !run_token.is_cancelled() && running.len() < limit {
                let Some((node, inputs)) = pending.next() else {
                    break;
                };

                let handle = InvocationHandle {
                    execution_id: execution.id,
                    node_id: node.id,
                };
                let ctx = NodeContext {
                    handle,
                    node: Arc::new(node.clone()),
                    inputs,
                    context: snapshot.clone(),
                    iteration: None,
                    events: self.events.create_emitter(execution.id, node.id),
                    cancellation: run_token.child_token(),
                };

                state.statuses.insert(node.id, NodeStatus::Running);
                self.record(
                    execution,
                    Some(node.id),
                    LogEvent::NodeStarted,
                    Some(node.kind.type_name().to_string()),
                )
                .await?;
                self.events.emit(ExecutionEvent::NodeStarted {
                    execution_id: execution.id,
                    node_id: node.id,
                    node_type: node.kind.type_name().to_string(),
                    timestamp: Utc::now(),
                });
                tracing::debug!(execution_id = %execution.id, node_id = %node.id, "Dispatching {}", node.label());

                let executor = self.executor.clone();
                let node_id = node.id;
                let task = tokio::spawn(async move {
                    let start = Instant::now();
                    let result = invoke(executor, ctx, node_timeout).await;
                    (result, start.elapsed().as_millis() as u64)
                });
                in_flight.insert(node_id, handle);
                running.push(async move {
                    match task.await {
                        Ok((result, duration_ms)) => (node_id, result, duration_ms),
                        Err(e) => (
                            node_id,
                            Err(NodeError::ExecutionFailed(format!("node task aborted: {}", e))),
                            0,
                        ),
                    }
                });
            }

            if running.is_empty() {
                break;
            }

            tokio::select! {
                _ = run_token.cancelled(), if !cancel_sent => {
                    cancel_sent = true;
                    tracing::info!(
                        execution_id = %execution.id,
                        "Cancelling {} in-flight node(s)",
                        in_flight.len()
                    );
                    for handle in in_flight.values() {
                        self.executor.cancel(*handle).await;
                    }
                }
                Some(done) = running.next() => {
                    let (node_id, result, duration_ms): Invocation = done;
                    in_flight.remove(&node_id);
                    results.insert(node_id, (result, duration_ms));
                }
            }
        }

        Ok(results)
    }

    async fn resolve_succeeded(
        &self,
        execution: &mut Execution,
        state: &mut RunState,
        node: &NodeSpec,
        output: &NodeOutput,
        duration_ms: u64,
    ) -> Result<(), EngineError> {
        tracing::info!(
            execution_id = %execution.id,
            node_id = %node.id,
            "Node {} completed in {}ms",
            node.label(),
            duration_ms
        );
        state.statuses.insert(node.id, NodeStatus::Succeeded);
        state
            .context
            .merge(node.id, node.name.as_deref(), output.to_value());
        execution.completed_nodes += 1;
        self.record(
            execution,
            Some(node.id),
            LogEvent::NodeSucceeded,
            Some(format!("{}ms", duration_ms)),
        )
        .await?;
        self.events.emit(ExecutionEvent::NodeSucceeded {
            execution_id: execution.id,
            node_id: node.id,
            duration_ms,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn resolve_failed(
        &self,
        execution: &mut Execution,
        state: &mut RunState,
        node: &NodeSpec,
        message: String,
        propagated: bool,
    ) -> Result<(), EngineError> {
        state.statuses.insert(node.id, NodeStatus::Failed);
        execution.failed_nodes += 1;
        state.failures.push(NodeFailure {
            node_id: node.id,
            message: message.clone(),
            propagated,
        });
        self.record(execution, Some(node.id), LogEvent::NodeFailed, Some(message.clone()))
            .await?;
        self.events.emit(ExecutionEvent::NodeFailed {
            execution_id: execution.id,
            node_id: node.id,
            error: message,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn resolve_skipped(
        &self,
        execution: &mut Execution,
        state: &mut RunState,
        node_id: NodeId,
        cancelled: Option<String>,
    ) -> Result<(), EngineError> {
        state.statuses.insert(node_id, NodeStatus::Skipped);
        execution.skipped_nodes += 1;
        let event = if cancelled.is_some() {
            LogEvent::NodeCancelled
        } else {
            LogEvent::NodeSkipped
        };
        self.record(execution, Some(node_id), event, cancelled).await?;
        self.events.emit(ExecutionEvent::NodeSkipped {
            execution_id: execution.id,
            node_id,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Sweep unresolved nodes, settle the terminal status and persist.
    async fn finish(
        &self,
        mut execution: Execution,
        mut state: RunState,
        plan: &ExecutionPlan,
        outcome: Result<Outcome, EngineError>,
    ) -> Result<Execution, EngineError> {
        let mut store_error: Option<EngineError> = None;

        let (status, message, event) = match &outcome {
            Ok(Outcome::Completed) => (ExecutionStatus::Completed, None, LogEvent::RunCompleted),
            Ok(Outcome::Aborted(reason)) => {
                (ExecutionStatus::Failed, Some(reason.clone()), LogEvent::RunFailed)
            }
            Ok(Outcome::Cancelled) => {
                let reason = if self.cancellation.is_cancelled() {
                    "cancelled by request".to_string()
                } else {
                    match self.config.run_timeout_ms {
                        Some(ms) => format!("timed out after {}ms", ms),
                        None => "cancelled".to_string(),
                    }
                };
                (ExecutionStatus::Cancelled, Some(reason), LogEvent::RunCancelled)
            }
            Err(e) => (ExecutionStatus::Failed, Some(e.to_string()), LogEvent::RunFailed),
        };

        let unresolved: Vec<NodeId> = plan
            .node_ids()
            .filter(|id| {
                state
                    .statuses
                    .get(id)
                    .map_or(true, |s| !s.is_resolved())
            })
            .collect();
        for node_id in unresolved {
            state.statuses.insert(node_id, NodeStatus::Skipped);
            execution.skipped_nodes += 1;
            let detail = Some(format!("not run: {}", message.as_deref().unwrap_or("run ended")));
            let entry = execution.log(Some(node_id), LogEvent::NodeSkipped, detail).clone();
            if let Err(e) = self.store.append_log_entry(execution.id, &entry).await {
                store_error.get_or_insert(EngineError::Store(e));
            }
        }

        let entry = execution.log(None, event, message.clone()).clone();
        if let Err(e) = self.store.append_log_entry(execution.id, &entry).await {
            store_error.get_or_insert(EngineError::Store(e));
        }

        execution.error_message = message;
        execution.result_data = Some(RunResult {
            partial_failure: execution.failed_nodes > 0,
            node_states: state.statuses.iter().map(|(k, v)| (*k, *v)).collect(),
            outputs: state.context.outputs().clone(),
            errors: std::mem::take(&mut state.failures),
        });

        if let Err(e) = execution.transition(status) {
            store_error.get_or_insert(e);
        }
        if let Err(e) = self.store.update(&execution).await {
            store_error.get_or_insert(EngineError::Store(e));
        }

        let duration_ms = execution.duration_ms.unwrap_or(0);
        tracing::info!(
            execution_id = %execution.id,
            board_id = %self.board.id,
            "Run finished {:?} in {}ms: {} completed, {} failed, {} skipped",
            execution.status,
            duration_ms,
            execution.completed_nodes,
            execution.failed_nodes,
            execution.skipped_nodes
        );
        self.events.emit(ExecutionEvent::RunFinished {
            execution_id: execution.id,
            status: execution.status,
            duration_ms,
            timestamp: Utc::now(),
        });

        match (outcome, store_error) {
            (Err(fatal), _) => Err(fatal),
            (Ok(_), Some(err)) => Err(err),
            (Ok(_), None) => Ok(execution),
        }
    }
}

/// Invoke the executor for one node, looping for loop nodes.
async fn invoke(
    executor: Arc<dyn NodeExecutor>,
    ctx: NodeContext,
    timeout: Option<Duration>,
) -> Result<NodeOutput, NodeError> {
    let node = ctx.node.clone();
    match &node.kind {
        NodeKind::Loop {
            max_iterations,
            until,
        } => run_loop(executor.as_ref(), ctx, *max_iterations, until.as_deref(), timeout).await,
        NodeKind::Start
        | NodeKind::End
        | NodeKind::AgentCall { .. }
        | NodeKind::Decision { .. }
        | NodeKind::Transform { .. }
        | NodeKind::Input { .. }
        | NodeKind::Output { .. } => invoke_once(executor.as_ref(), ctx, timeout).await,
    }
}

async fn invoke_once(
    executor: &dyn NodeExecutor,
    ctx: NodeContext,
    timeout: Option<Duration>,
) -> Result<NodeOutput, NodeError> {
    let start = Instant::now();
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, executor.execute(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(NodeError::Timeout {
                millis: limit.as_millis() as u64,
            }),
        },
        None => executor.execute(ctx).await,
    };
    let mut output = result?;
    output.metadata.execution_time_ms = start.elapsed().as_millis() as u64;
    Ok(output)
}

/// Repeat a loop node's invocation until `until` holds or the iteration
/// bound is reached. The output is the last iteration's plus `iterations`.
async fn run_loop(
    executor: &dyn NodeExecutor,
    ctx: NodeContext,
    max_iterations: u32,
    until: Option<&str>,
    timeout: Option<Duration>,
) -> Result<NodeOutput, NodeError> {
    let until = until
        .filter(|src| !src.trim().is_empty())
        .map(Condition::parse)
        .transpose()
        .map_err(|e| NodeError::InvalidConfig(e.to_string()))?;

    let mut previous: Option<Value> = None;
    let mut last = NodeOutput::new();
    let mut iterations = 0u32;

    for index in 0..max_iterations {
        if ctx.cancellation.is_cancelled() {
            return Err(NodeError::Cancelled);
        }

        let mut iteration_ctx = ctx.clone();
        iteration_ctx.iteration = Some(LoopIteration {
            index,
            max_iterations,
            previous: previous.clone(),
        });
        last = invoke_once(executor, iteration_ctx, timeout).await?;
        iterations = index + 1;
        ctx.events.progress(
            f64::from(iterations) * 100.0 / f64::from(max_iterations),
            Some(format!("iteration {}/{}", iterations, max_iterations)),
        );

        let value = last.to_value();
        if let Some(cond) = &until {
            let scope = ctx
                .context
                .as_ref()
                .clone()
                .with("output", value.clone())
                .with("iteration", index);
            if cond
                .evaluate(&scope)
                .map_err(|e| NodeError::InvalidConfig(e.to_string()))?
            {
                break;
            }
        }
        previous = Some(value);
    }

    Ok(last.with_output("iterations", iterations))
}
