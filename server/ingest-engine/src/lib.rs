//! Crash report ingestion core.
//!
//! Decodes versioned wire payloads, groups them into persistent issues by a
//! structural fingerprint, and records every occurrence atomically. Intake
//! either calls the [`Dispatcher`] directly or hands payloads to a
//! [`QueueBuffer`] drained by a single [`Worker`].

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fingerprint;
pub mod notify;
pub mod queue;
pub mod store;
pub mod types;
pub mod worker;

pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::{DecodeError, DecodeStage, IngestError, QueueError, StoreError, WorkerError};
pub use notify::{LogNotifier, Notifier, NotifierSet};
pub use queue::{MemoryQueue, PgQueue, QueueBuffer, SqliteQueue};
pub use store::{AggregationStore, PgStore, SqliteStore, Storage};
pub use types::{Outcome, Protocol, QueueMessage, RawPayload};
pub use worker::{Worker, WorkerReport, WorkerState};
