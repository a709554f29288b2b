//! Async worker: drains the queue buffer into the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::{IngestError, WorkerError};
use crate::notify::NotifierSet;
use crate::queue::QueueBuffer;
use crate::types::{Outcome, RawPayload};

/// Lifecycle of a worker, observable through [`Worker::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Running,
  /// Shutdown requested; finishing the in-flight payload.
  Draining,
  Stopped,
}

/// Counters returned when the worker stops cleanly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
  pub processed: u64,
  /// Payloads that failed to decode.
  pub dropped: u64,
}

pub struct Worker {
  dispatcher: Dispatcher,
  queue: Arc<dyn QueueBuffer>,
  notifier: NotifierSet,
  wait: Duration,
  cancel: CancellationToken,
  state: watch::Sender<WorkerState>,
}

impl Worker {
  pub fn new(
    dispatcher: Dispatcher,
    queue: Arc<dyn QueueBuffer>,
    notifier: NotifierSet,
    config: &Config,
    cancel: CancellationToken,
  ) -> Self {
    let (state, _) = watch::channel(WorkerState::Running);
    Self {
      dispatcher,
      queue,
      notifier,
      wait: config.dequeue_wait,
      cancel,
      state,
    }
  }

  pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
    self.state.subscribe()
  }

  /// Run until cancelled or until a queue or store failure.
  ///
  /// Cancellation is checked between dequeues, so a payload that has been
  /// taken off the queue is always processed before the worker exits. The
  /// state reads `Draining` from the moment shutdown is observed until then.
  pub async fn run(self) -> Result<WorkerReport, WorkerError> {
    let mut report = WorkerReport::default();
    info!(wait_ms = self.wait.as_millis() as u64, "worker started");

    while !self.cancel.is_cancelled() {
      let message = match self.queue.dequeue(self.wait).await {
        Ok(Some(message)) => message,
        Ok(None) => continue,
        Err(e) => {
          error!(error = %e, "dequeue failed, stopping worker");
          self.state.send_replace(WorkerState::Stopped);
          return Err(e.into());
        }
      };

      let raw = RawPayload::from(message);
      match self.process(&raw).await {
        Ok(outcome) => {
          report.processed += 1;
          self.notifier.dispatch(&outcome);
        }
        Err(IngestError::Decode(e)) => {
          report.dropped += 1;
          warn!(stage = %e.stage, reason = %e.reason, "dropping undecodable payload");
        }
        Err(IngestError::Store(e)) => {
          error!(error = %e, "store failure, stopping worker");
          self.state.send_replace(WorkerState::Stopped);
          return Err(e.into());
        }
      }
    }

    self.state.send_replace(WorkerState::Draining);
    debug!("worker draining");
    self.state.send_replace(WorkerState::Stopped);
    info!(
      processed = report.processed,
      dropped = report.dropped,
      "worker stopped"
    );
    Ok(report)
  }

  /// Process one payload to completion. A shutdown request arriving meanwhile
  /// moves the worker to `Draining` without interrupting the call.
  async fn process(&self, raw: &RawPayload) -> Result<Outcome, IngestError> {
    let call = self.dispatcher.process(raw);
    tokio::pin!(call);
    tokio::select! {
      biased;
      result = &mut call => result,
      _ = self.cancel.cancelled() => {
        self.state.send_replace(WorkerState::Draining);
        debug!("shutdown requested, finishing in-flight payload");
        call.await
      }
    }
  }
}
