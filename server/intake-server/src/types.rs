//! Request/response types for the intake endpoints.

use ingest_engine::Protocol;
use serde::Serialize;

/// Direct-mode reply: the issue the payload was recorded against.
#[derive(Debug, Serialize)]
pub struct StoredResponse {
  pub id: i64,
}

/// Queue-mode reply.
#[derive(Debug, Serialize)]
pub struct QueuedResponse {
  pub queued: bool,
}

/// Fields of an `X-Sentry-Auth` header the intake cares about.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SentryAuth {
  pub version: Option<String>,
  pub key: Option<String>,
  pub client: Option<String>,
}

impl SentryAuth {
  /// Parse `Sentry sentry_version=7, sentry_key=abc, sentry_client=raven-js/3.0`.
  ///
  /// Unknown keys are ignored; a malformed header yields empty fields.
  pub fn parse(header: &str) -> Self {
    let fields = header.trim();
    let fields = fields.strip_prefix("Sentry").unwrap_or(fields);

    let mut auth = Self::default();
    for pair in fields.split(',') {
      let Some((key, value)) = pair.split_once('=') else {
        continue;
      };
      let value = Some(value.trim().to_string());
      match key.trim() {
        "sentry_version" => auth.version = value,
        "sentry_key" => auth.key = value,
        "sentry_client" => auth.client = value,
        _ => {}
      }
    }
    auth
  }

  pub fn protocol(&self) -> Protocol {
    self
      .version
      .as_deref()
      .map(Protocol::from_sentry_version)
      .unwrap_or(Protocol::Legacy)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_version_and_key() {
    let auth = SentryAuth::parse("Sentry sentry_version=7, sentry_key=abc123, sentry_client=raven-js/3.27");
    assert_eq!(auth.version.as_deref(), Some("7"));
    assert_eq!(auth.key.as_deref(), Some("abc123"));
    assert_eq!(auth.client.as_deref(), Some("raven-js/3.27"));
    assert_eq!(auth.protocol(), Protocol::Modern);
  }

  #[test]
  fn older_or_missing_version_is_legacy() {
    assert_eq!(SentryAuth::parse("Sentry sentry_version=4").protocol(), Protocol::Legacy);
    assert_eq!(SentryAuth::parse("garbage").protocol(), Protocol::Legacy);
    assert_eq!(SentryAuth::default().protocol(), Protocol::Legacy);
  }
}
