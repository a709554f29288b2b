//! Notification collaborators for processed outcomes.

use std::sync::Arc;

use tracing::{debug, info};

use crate::types::Outcome;

/// Receives every outcome whose issue is new or regressed.
///
/// Implementations must not block: they run on the ingest path.
pub trait Notifier: Send + Sync {
  fn notify(&self, outcome: &Outcome);
}

/// Emits one structured log line per notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
  fn notify(&self, outcome: &Outcome) {
    let kind = if outcome.is_new { "new" } else { "regression" };
    info!(
      issue_id = outcome.issue_id,
      kind,
      level = %outcome.level,
      server_name = %outcome.server_name,
      site = %outcome.site,
      "{}",
      outcome.message
    );
  }
}

/// Fan-out to all registered collaborators, filtered by `Outcome::should_notify`.
#[derive(Clone, Default)]
pub struct NotifierSet {
  notifiers: Vec<Arc<dyn Notifier>>,
}

impl NotifierSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, notifier: Arc<dyn Notifier>) -> Self {
    self.notifiers.push(notifier);
    self
  }

  pub fn len(&self) -> usize {
    self.notifiers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.notifiers.is_empty()
  }

  /// Returns whether the outcome was forwarded.
  pub fn dispatch(&self, outcome: &Outcome) -> bool {
    if !outcome.should_notify() {
      debug!(issue_id = outcome.issue_id, "repeat occurrence, not notifying");
      return false;
    }
    for notifier in &self.notifiers {
      notifier.notify(outcome);
    }
    true
  }
}
