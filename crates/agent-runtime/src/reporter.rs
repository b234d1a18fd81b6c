//! Agent Event Reporter (spec.md §4.9): a per-Agent bounded ring buffer of
//! `ProcessEvent`s that ships batches upstream once a connection is live,
//! and silently drops the oldest entry on overflow while disconnected.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_wire::ProcessEventType;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

/// Agent-side process lifecycle event (spec §3 "Process Event (Agent-side)").
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessEvent {
    pub event_type: ProcessEventType,
    pub pid: u32,
    pub name: String,
    pub install_dir: String,
    pub role: String,
    pub cluster_id: String,
    pub node_id: String,
    pub host_id: String,
    pub details: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl ProcessEvent {
    /// Convenience constructor for the common case of reporting a bare
    /// lifecycle transition with no extra detail fields.
    pub fn new(event_type: ProcessEventType, pid: u32, name: impl Into<String>) -> Self {
        Self {
            event_type,
            pid,
            name: name.into(),
            install_dir: String::new(),
            role: String::new(),
            cluster_id: String::new(),
            node_id: String::new(),
            host_id: String::new(),
            details: HashMap::new(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
#[error("report sink rejected batch: {0}")]
pub struct ReportError(pub String);

/// The injected collaborator a flush sends batches through — in
/// production, the `LogStream`/event-upload leg of the control-plane
/// client; in tests, an in-memory recorder.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn report(&self, batch: Vec<ProcessEvent>) -> Result<(), ReportError>;
}

/// Bounded FIFO ring plus the connection-aware flush policy of §4.9.
///
/// `cache` holds at most `cache_size` entries; `enqueue` evicts the
/// oldest on overflow. `sink` starts unset — events stay cached until
/// the control-plane client attaches one once the stream is ready.
pub struct EventReporter {
    cache: Mutex<VecDeque<ProcessEvent>>,
    cache_size: usize,
    batch_size: usize,
    connected: AtomicBool,
    sink: Mutex<Option<Arc<dyn ReportSink>>>,
}

impl EventReporter {
    pub fn new(cache_size: usize, batch_size: usize) -> Arc<Self> {
        Arc::new(Self {
            cache: Mutex::new(VecDeque::with_capacity(cache_size)),
            cache_size,
            batch_size: batch_size.max(1),
            connected: AtomicBool::new(false),
            sink: Mutex::new(None),
        })
    }

    /// spec §4.9: "`cache` is a ring of up to `cache_size` entries; when
    /// full, the oldest is evicted on enqueue." Also the size-threshold
    /// push: once `batch_size` is reached while connected, flush
    /// immediately rather than waiting for the next tick.
    pub fn enqueue(self: &Arc<Self>, event: ProcessEvent) {
        let should_flush = {
            let mut cache = self.cache.lock();
            if cache.len() >= self.cache_size {
                cache.pop_front();
            }
            cache.push_back(event);
            self.connected.load(Ordering::SeqCst) && cache.len() >= self.batch_size
        };
        if should_flush {
            let reporter = self.clone();
            tokio::spawn(async move {
                reporter.flush().await;
            });
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// spec §4.9: "`report_func` is injected after the stream is ready."
    pub fn attach_sink(&self, sink: Arc<dyn ReportSink>) {
        *self.sink.lock() = Some(sink);
    }

    pub fn detach_sink(&self) {
        *self.sink.lock() = None;
    }

    /// spec §4.9: "`connected` flag flips with the command-stream state;
    /// on false-to-true transition, a flush is scheduled."
    pub fn set_connected(self: &Arc<Self>, connected: bool) {
        let was_connected = self.connected.swap(connected, Ordering::SeqCst);
        if connected && !was_connected {
            let reporter = self.clone();
            tokio::spawn(async move {
                reporter.flush().await;
            });
        }
    }

    /// spec §4.9: "sends consecutive batches of `batch_size`; on a
    /// transport error it stops (leaving events queued) and returns —
    /// next flush will retry."
    pub async fn flush(&self) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        let Some(sink) = self.sink.lock().clone() else {
            return;
        };

        loop {
            let batch: Vec<ProcessEvent> = {
                let mut cache = self.cache.lock();
                if cache.is_empty() {
                    return;
                }
                let n = self.batch_size.min(cache.len());
                cache.drain(..n).collect()
            };

            match sink.report(batch.clone()).await {
                Ok(()) => debug!(sent = batch.len(), "flushed event batch"),
                Err(err) => {
                    warn!(error = %err, dropped = false, "flush failed, re-queuing batch");
                    let mut cache = self.cache.lock();
                    for event in batch.into_iter().rev() {
                        cache.push_front(event);
                    }
                    return;
                }
            }
        }
    }

    /// Periodic flush loop (spec §3 `flush_interval`, default 10s).
    pub fn spawn_flush_loop(self: Arc<Self>, interval: std::time::Duration) -> ReporterHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let reporter = self;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(std::time::Duration::from_millis(1)));
            loop {
                ticker.tick().await;
                if stop_clone.load(Ordering::Relaxed) {
                    break;
                }
                reporter.flush().await;
            }
        });

        ReporterHandle { stop, handle }
    }

    /// `clear_cache` drops all events. Operator recovery only (spec §4.9).
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }
}

pub struct ReporterHandle {
    stop: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

impl ReporterHandle {
    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingSink {
        batches: AsyncMutex<Vec<Vec<ProcessEvent>>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                batches: AsyncMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ReportSink for RecordingSink {
        async fn report(&self, batch: Vec<ProcessEvent>) -> Result<(), ReportError> {
            self.batches.lock().await.push(batch);
            Ok(())
        }
    }

    fn event(name: &str) -> ProcessEvent {
        ProcessEvent::new(ProcessEventType::Started, 1, name)
    }

    #[test]
    fn scenario_s4_eviction_discipline() {
        let reporter = EventReporter::new(5, 2);
        for i in 1..=7 {
            reporter.enqueue(event(&format!("e{i}")));
        }
        let remaining: Vec<String> = reporter
            .cache
            .lock()
            .iter()
            .map(|e| e.name.clone())
            .collect();
        assert_eq!(remaining, vec!["e3", "e4", "e5", "e6", "e7"]);
    }

    #[tokio::test]
    async fn scenario_s4_flush_drains_in_batches() {
        let reporter = EventReporter::new(5, 2);
        for i in 1..=7 {
            reporter.enqueue(event(&format!("e{i}")));
        }
        let sink = RecordingSink::new();
        reporter.attach_sink(sink.clone());
        reporter.set_connected(true);

        // set_connected's spawned flush may still be running; drive it to
        // completion deterministically instead of racing it.
        reporter.flush().await;

        assert!(reporter.is_empty());
        let batches = sink.batches.lock().await;
        let flat: Vec<String> = batches
            .iter()
            .flatten()
            .map(|e| e.name.clone())
            .collect();
        assert_eq!(flat, vec!["e3", "e4", "e5", "e6", "e7"]);
        assert!(batches.iter().all(|b| b.len() <= 2));
    }

    #[tokio::test]
    async fn flush_is_noop_while_disconnected() {
        let reporter = EventReporter::new(5, 2);
        reporter.enqueue(event("e1"));
        let sink = RecordingSink::new();
        reporter.attach_sink(sink.clone());

        reporter.flush().await;

        assert_eq!(reporter.len(), 1);
        assert!(sink.batches.lock().await.is_empty());
    }

    #[tokio::test]
    async fn transport_error_leaves_batch_queued() {
        struct FailingSink;
        #[async_trait]
        impl ReportSink for FailingSink {
            async fn report(&self, _batch: Vec<ProcessEvent>) -> Result<(), ReportError> {
                Err(ReportError("disconnected".to_string()))
            }
        }

        let reporter = EventReporter::new(5, 2);
        reporter.enqueue(event("e1"));
        reporter.enqueue(event("e2"));
        reporter.attach_sink(Arc::new(FailingSink));
        reporter.set_connected(true);

        reporter.flush().await;

        assert_eq!(reporter.len(), 2);
    }

    #[test]
    fn clear_cache_drops_everything() {
        let reporter = EventReporter::new(5, 2);
        reporter.enqueue(event("e1"));
        reporter.enqueue(event("e2"));
        reporter.clear_cache();
        assert!(reporter.is_empty());
    }
}
