//! Dispatcher: decode, fingerprint and record one payload.

use std::sync::Arc;

use tracing::debug;

use crate::codec;
use crate::error::IngestError;
use crate::fingerprint;
use crate::store::AggregationStore;
use crate::types::{Outcome, RawPayload};

/// Stateless processing path shared by direct intake and the worker.
#[derive(Clone)]
pub struct Dispatcher {
  store: Arc<dyn AggregationStore>,
}

impl Dispatcher {
  pub fn new(store: Arc<dyn AggregationStore>) -> Self {
    Self { store }
  }

  pub fn store(&self) -> &Arc<dyn AggregationStore> {
    &self.store
  }

  /// Process a single raw payload.
  ///
  /// The payload's transport project id takes priority over the project
  /// named inside the event. Decode failures are returned before anything
  /// touches the store.
  pub async fn process(&self, raw: &RawPayload) -> Result<Outcome, IngestError> {
    let event = codec::decode(raw)?;
    let fp = fingerprint::compute(&event);
    let project_id = raw
      .project_id
      .as_deref()
      .filter(|p| !p.is_empty())
      .unwrap_or(&event.project);

    let recorded = self.store.record(project_id, &fp, &event, raw).await?;
    debug!(
      project_id,
      fingerprint = %fp,
      issue_id = recorded.issue_id,
      "payload processed"
    );

    Ok(Outcome {
      issue_id: recorded.issue_id,
      is_new: recorded.is_new,
      is_regression: recorded.is_regression,
      message: event.message,
      server_name: event.server_name,
      level: event.level,
      site: event.site,
    })
  }
}
