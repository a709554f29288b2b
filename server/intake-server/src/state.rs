//! Shared state handed to every request.

use std::sync::Arc;

use ingest_engine::{Dispatcher, NotifierSet, QueueBuffer};

/// Where accepted payloads go.
#[derive(Clone)]
pub enum Intake {
  /// Process inside the request and answer with the issue id.
  Direct(Dispatcher),
  /// Enqueue and answer immediately; a worker records it later.
  Queued(Arc<dyn QueueBuffer>),
}

pub struct AppState {
  pub intake: Intake,
  /// Only consulted on the direct path; queued payloads notify from the worker.
  pub notifier: NotifierSet,
}

impl AppState {
  pub fn direct(dispatcher: Dispatcher, notifier: NotifierSet) -> Self {
    Self {
      intake: Intake::Direct(dispatcher),
      notifier,
    }
  }

  pub fn queued(queue: Arc<dyn QueueBuffer>) -> Self {
    Self {
      intake: Intake::Queued(queue),
      notifier: NotifierSet::new(),
    }
  }
}
