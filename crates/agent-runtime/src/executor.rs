//! Agent Command Executor (spec.md §4.10): a handler registry keyed by
//! `command_type`, invoking handlers with a progress reporter that emits
//! `CommandResponse` progress frames upstream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_wire::{CommandRequest, CommandResponse, CommandStatus};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Cooperative cancellation signal threaded into a handler's context.
/// Set when the command's deadline elapses; well-behaved handlers poll
/// it between units of work and return promptly (spec §4.10).
#[derive(Clone, Default)]
pub struct CancellationSignal(Arc<AtomicBool>);

impl CancellationSignal {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Per-invocation context passed to a handler alongside its request.
#[derive(Clone)]
pub struct HandlerContext {
    pub agent_id: String,
    pub command_id: String,
    pub cancel: CancellationSignal,
}

/// Emits progress frames upstream as `CommandResponse{status: Running}`
/// (spec §4.10: "Handlers must emit progress frames via the reporter as
/// `(progress_pct, message)`").
#[derive(Clone)]
pub struct ProgressReporter {
    command_id: String,
    sender: mpsc::Sender<CommandResponse>,
}

impl ProgressReporter {
    pub fn new(command_id: impl Into<String>, sender: mpsc::Sender<CommandResponse>) -> Self {
        Self {
            command_id: command_id.into(),
            sender,
        }
    }

    pub async fn report(&self, progress_pct: u32, message: impl Into<String>) {
        let frame = CommandResponse {
            command_id: self.command_id.clone(),
            status: CommandStatus::Running,
            progress: progress_pct.min(100),
            output: message.into(),
            error: String::new(),
        };
        if self.sender.send(frame).await.is_err() {
            debug!(command_id = %self.command_id, "progress reporter's upstream channel closed");
        }
    }
}

/// A domain command handler. The core never inspects command semantics
/// (spec §9) — it only mediates the envelope and the progress channel.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: HandlerContext,
        request: CommandRequest,
        progress: ProgressReporter,
    ) -> CommandResponse;
}

fn failed(command_id: String, error: impl Into<String>) -> CommandResponse {
    CommandResponse {
        command_id,
        status: CommandStatus::Failed,
        progress: 0,
        output: String::new(),
        error: error.into(),
    }
}

/// Handler registry keyed by `command_type` (spec §4.10).
#[derive(Default)]
pub struct CommandExecutor {
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, command_type: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        self.handlers.write().insert(command_type.into(), handler);
    }

    /// Invoke the handler registered for `request.command_type`, enforcing
    /// its `timeout_ms` deadline. Unknown types and handler panics both
    /// surface as a terminal `Failed` response rather than crashing the
    /// Agent (spec §4.10, §7 `HandlerError`).
    pub async fn execute(
        &self,
        agent_id: impl Into<String>,
        request: CommandRequest,
        progress: ProgressReporter,
    ) -> CommandResponse {
        let handler = self.handlers.read().get(&request.command_type).cloned();
        let Some(handler) = handler else {
            warn!(command_type = %request.command_type, "no handler registered for command type");
            return failed(
                request.command_id,
                format!("unknown command type: {}", request.command_type),
            );
        };

        let cancel = CancellationSignal::default();
        let ctx = HandlerContext {
            agent_id: agent_id.into(),
            command_id: request.command_id.clone(),
            cancel: cancel.clone(),
        };
        let command_id = request.command_id.clone();
        let timeout = Duration::from_millis(request.timeout_ms);

        let task = tokio::spawn(async move { handler.handle(ctx, request, progress).await });

        if timeout.is_zero() {
            return match task.await {
                Ok(response) => response,
                Err(err) => failed(command_id, format!("handler panicked: {err}")),
            };
        }

        tokio::select! {
            result = task => match result {
                Ok(response) => response,
                Err(err) => failed(command_id, format!("handler panicked: {err}")),
            },
            _ = tokio::time::sleep(timeout) => {
                cancel.cancel();
                warn!(%command_id, ?timeout, "handler exceeded its deadline, cancelling");
                failed(command_id, format!("handler did not complete within {timeout:?}"))
            }
        }
    }
}

/// Illustrative built-in handler: echoes its parameters back as output.
/// Domain handlers (process spawn, file transfer, package install,
/// precheck probes) are explicitly out of scope (spec §1); this one
/// exists so the executor is exercised end-to-end without inventing a
/// fake domain handler.
pub struct EchoHandler;

#[async_trait]
impl CommandHandler for EchoHandler {
    async fn handle(
        &self,
        _ctx: HandlerContext,
        request: CommandRequest,
        progress: ProgressReporter,
    ) -> CommandResponse {
        progress.report(50, "echo: preparing response").await;

        let mut pairs: Vec<String> = request
            .parameters
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        pairs.sort();
        let output = pairs.join(",");

        CommandResponse {
            command_id: request.command_id,
            status: CommandStatus::Success,
            progress: 100,
            output,
            error: String::new(),
        }
    }
}
