//! Agent-side runtime: the bounded Event Reporter, the Command Executor's
//! handler registry, and the control-plane client that drives
//! `Register`/`Heartbeat`/`CommandStream`/`LogStream` (spec.md §4.9,
//! §4.10, §4.1).

pub mod client;
pub mod errors;
pub mod executor;
pub mod reporter;

pub use client::AgentClient;
pub use errors::AgentRuntimeError;
pub use executor::{CancellationSignal, CommandExecutor, CommandHandler, EchoHandler, HandlerContext, ProgressReporter};
pub use reporter::{EventReporter, ProcessEvent, ReportError, ReportSink};
