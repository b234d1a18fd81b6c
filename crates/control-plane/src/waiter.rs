//! The notification sink and output accumulator installed per in-flight
//! command (spec.md §3 "Agent Connection", §4.5 point 4).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Terminal result of a dispatched command, delivered once to whoever is
/// awaiting it.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub status: fleet_wire::CommandStatus,
    pub output: String,
    pub error: Option<String>,
}

/// Per-command waiter. Owned by the `AgentConnection` it was dispatched on;
/// populated by the Dispatcher, resolved by the Correlator or a timeout.
pub struct Waiter {
    done_tx: StdMutex<Option<oneshot::Sender<CommandOutcome>>>,
    output: StdMutex<String>,
    last_progress: AtomicU32,
    started: AtomicBool,
    timeout_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl Waiter {
    pub fn new(done_tx: oneshot::Sender<CommandOutcome>) -> Self {
        Self {
            done_tx: StdMutex::new(Some(done_tx)),
            output: StdMutex::new(String::new()),
            last_progress: AtomicU32::new(0),
            started: AtomicBool::new(false),
            timeout_handle: StdMutex::new(None),
        }
    }

    pub fn set_timeout_handle(&self, handle: JoinHandle<()>) {
        *self.timeout_handle.lock().unwrap() = Some(handle);
    }

    /// Clamp-and-enforce progress monotonicity (spec §9: enforced strictly,
    /// not merely clamped). Returns the accepted value, or `None` if the
    /// update was stale and should be ignored.
    pub fn accept_progress(&self, progress: u32) -> Option<u32> {
        let clamped = progress.min(100);
        let mut prev = self.last_progress.load(Ordering::SeqCst);
        loop {
            if clamped < prev {
                return None;
            }
            match self.last_progress.compare_exchange(
                prev,
                clamped,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(clamped),
                Err(actual) => prev = actual,
            }
        }
    }

    /// First call for a given waiter returns `true` (the Running
    /// transition); subsequent calls return `false`.
    pub fn mark_started(&self) -> bool {
        self.started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn append_output(&self, chunk: &str) -> String {
        if chunk.is_empty() {
            return self.output.lock().unwrap().clone();
        }
        let mut out = self.output.lock().unwrap();
        out.push_str(chunk);
        out.clone()
    }

    pub fn accumulated_output(&self) -> String {
        self.output.lock().unwrap().clone()
    }

    /// Resolve the waiter exactly once. Subsequent calls are no-ops.
    pub fn resolve(&self, outcome: CommandOutcome) {
        if let Some(handle) = self.timeout_handle.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(tx) = self.done_tx.lock().unwrap().take() {
            let _ = tx.send(outcome);
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.done_tx.lock().unwrap().is_none()
    }
}
