#![allow(dead_code)]

use async_trait::async_trait;
use boardcore::{
    Board, InvocationHandle, NodeContext, NodeError, NodeExecutor, NodeId, NodeKind, NodeOutput,
    NodeSpec, Value,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// What a scripted node does when invoked.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Return these ports (plus `node` and `trigger`)
    Succeed(BTreeMap<String, Value>),
    Fail(String),
    Unavailable,
    /// Block until the invocation is cancelled
    Hang,
}

#[derive(Debug, Clone)]
struct Script {
    outcome: Outcome,
    delay: Option<Duration>,
}

/// Node executor driven by per-node scripts. Unscripted nodes succeed.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<NodeId, Script>>,
    calls: Mutex<Vec<NodeId>>,
    inputs: Mutex<HashMap<NodeId, BTreeMap<String, Value>>>,
    cancelled: Mutex<Vec<InvocationHandle>>,
    running: AtomicUsize,
    peak: AtomicUsize,
    /// Signalled when a `Hang` node starts waiting
    pub hung: Notify,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, node: NodeId, outcome: Outcome) -> &Self {
        self.scripts.lock().unwrap().insert(
            node,
            Script {
                outcome,
                delay: None,
            },
        );
        self
    }

    pub fn succeed_with(&self, node: NodeId, port: &str, value: impl Into<Value>) -> &Self {
        let mut ports = BTreeMap::new();
        ports.insert(port.to_string(), value.into());
        self.script(node, Outcome::Succeed(ports))
    }

    pub fn fail(&self, node: NodeId, message: &str) -> &Self {
        self.script(node, Outcome::Fail(message.to_string()))
    }

    /// Delay a node's outcome. The delay ends early on cancellation.
    pub fn delay(&self, node: NodeId, delay: Duration) -> &Self {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.entry(node).or_insert(Script {
            outcome: Outcome::Succeed(BTreeMap::new()),
            delay: None,
        });
        script.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<NodeId> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, node: NodeId) -> usize {
        self.calls().iter().filter(|n| **n == node).count()
    }

    pub fn inputs_of(&self, node: NodeId) -> Option<BTreeMap<String, Value>> {
        self.inputs.lock().unwrap().get(&node).cloned()
    }

    pub fn cancelled(&self) -> Vec<InvocationHandle> {
        self.cancelled.lock().unwrap().clone()
    }

    /// Highest number of invocations observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn perform(&self, ctx: &NodeContext) -> Result<NodeOutput, NodeError> {
        let script = self.scripts.lock().unwrap().get(&ctx.node_id()).cloned();
        let script = script.unwrap_or(Script {
            outcome: Outcome::Succeed(BTreeMap::new()),
            delay: None,
        });

        if let Some(delay) = script.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
            }
        }

        match script.outcome {
            Outcome::Succeed(ports) => {
                let mut output = NodeOutput::new()
                    .with_output("node", ctx.node.label())
                    .with_output("trigger", ctx.trigger().clone());
                if let Some(iteration) = &ctx.iteration {
                    output = output.with_output("count", iteration.index + 1);
                }
                output.outputs.extend(ports);
                Ok(output)
            }
            Outcome::Fail(message) => Err(NodeError::ExecutionFailed(message)),
            Outcome::Unavailable => Err(NodeError::Unavailable("backend offline".into())),
            Outcome::Hang => {
                self.hung.notify_one();
                ctx.cancellation.cancelled().await;
                Err(NodeError::Cancelled)
            }
        }
    }
}

#[async_trait]
impl NodeExecutor for ScriptedExecutor {
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        self.calls.lock().unwrap().push(ctx.node_id());
        self.inputs
            .lock()
            .unwrap()
            .insert(ctx.node_id(), ctx.inputs.clone());

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = self.perform(&ctx).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn cancel(&self, handle: InvocationHandle) {
        self.cancelled.lock().unwrap().push(handle);
    }
}

pub fn task(name: &str) -> NodeSpec {
    NodeSpec::new(NodeKind::AgentCall {
        agent_id: name.to_lowercase(),
        prompt: None,
    })
    .with_name(name)
}

/// `Start -> A -> End`
pub fn linear_board() -> (Board, [NodeId; 3]) {
    let mut board = Board::new("linear");
    let start = board.add_node(NodeSpec::new(NodeKind::Start).with_name("Start"));
    let a = board.add_node(task("A"));
    let end = board.add_node(NodeSpec::new(NodeKind::End).with_name("End"));
    board.connect(start, a);
    board.connect(a, end);
    (board, [start, a, end])
}

/// `Start -> {A, B} -> End`
pub fn diamond_board() -> (Board, [NodeId; 4]) {
    let mut board = Board::new("diamond");
    let start = board.add_node(NodeSpec::new(NodeKind::Start).with_name("Start"));
    let a = board.add_node(task("A"));
    let b = board.add_node(task("B"));
    let end = board.add_node(NodeSpec::new(NodeKind::End).with_name("End"));
    board.connect(start, a);
    board.connect(start, b);
    board.connect(a, end);
    board.connect(b, end);
    (board, [start, a, b, end])
}
