//! Cross-module Agent-runtime scenarios (spec.md §8): the Executor's
//! deadline enforcement and the Event Reporter's reconnect behaviour.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_agent_runtime::{
    CommandExecutor, CommandHandler, EventReporter, HandlerContext, ProcessEvent, ProgressReporter,
    ReportError, ReportSink,
};
use fleet_wire::{CommandRequest, CommandResponse, CommandStatus, ProcessEventType};

struct SlowPollingHandler;

#[async_trait]
impl CommandHandler for SlowPollingHandler {
    async fn handle(
        &self,
        ctx: HandlerContext,
        request: CommandRequest,
        progress: ProgressReporter,
    ) -> CommandResponse {
        for tick in 0..10u32 {
            if ctx.cancel.is_cancelled() {
                return CommandResponse {
                    command_id: request.command_id,
                    status: CommandStatus::Cancelled,
                    progress: tick,
                    output: "stopped early".to_string(),
                    error: String::new(),
                };
            }
            progress.report(tick * 10, "working").await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        CommandResponse {
            command_id: request.command_id,
            status: CommandStatus::Success,
            progress: 100,
            output: "finished".to_string(),
            error: String::new(),
        }
    }
}

#[tokio::test]
async fn executor_deadline_fires_before_slow_handler_checkpoints() {
    let executor = CommandExecutor::new();
    executor.register("poll", Arc::new(SlowPollingHandler));

    let (tx, _rx) = tokio::sync::mpsc::channel(32);
    let request = CommandRequest {
        command_id: "cmd-poll".to_string(),
        command_type: "poll".to_string(),
        parameters: Default::default(),
        // Far shorter than the handler's 50ms-per-tick cadence: the
        // executor's own deadline always wins the race.
        timeout_ms: 5,
    };
    let response = executor
        .execute("agent-1", request, ProgressReporter::new("cmd-poll", tx))
        .await;

    assert_eq!(response.status, CommandStatus::Failed);
    assert!(response.error.contains("did not complete"));
}

struct RecordingSink {
    batches: tokio::sync::Mutex<Vec<Vec<ProcessEvent>>>,
}

#[async_trait]
impl ReportSink for RecordingSink {
    async fn report(&self, batch: Vec<ProcessEvent>) -> Result<(), ReportError> {
        self.batches.lock().await.push(batch);
        Ok(())
    }
}

#[tokio::test]
async fn reporter_resumes_flushing_after_reconnect() {
    let reporter = EventReporter::new(10, 3);
    let sink = Arc::new(RecordingSink {
        batches: tokio::sync::Mutex::new(Vec::new()),
    });
    reporter.attach_sink(sink.clone());

    for i in 1..=3 {
        reporter.enqueue(ProcessEvent::new(ProcessEventType::Started, i, format!("p{i}")));
    }
    assert_eq!(reporter.len(), 3, "buffered while disconnected");

    reporter.set_connected(true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(reporter.is_empty(), "connect transition flushes the backlog");

    // Disconnect: newly enqueued events accumulate rather than flush.
    reporter.set_connected(false);
    for i in 4..=6 {
        reporter.enqueue(ProcessEvent::new(ProcessEventType::Stopped, i, format!("p{i}")));
    }
    assert_eq!(reporter.len(), 3);

    // Reconnect: the buffered events flush without loss.
    reporter.set_connected(true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(reporter.is_empty());

    let names: Vec<String> = sink
        .batches
        .lock()
        .await
        .iter()
        .flatten()
        .map(|e| e.name.clone())
        .collect();
    assert_eq!(names, vec!["p1", "p2", "p3", "p4", "p5", "p6"]);
}
