//! Core types for the ingestion pipeline (wire contracts + internal models).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Protocol + raw payload
// ---------------------------------------------------------------------------

/// Wire protocol a payload was sent with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
  /// `base64(zlib(JSON))` with `sentry.interfaces.*` keys.
  Legacy,
  /// `base64(gzip(envelope))`, envelope = header line, item header line, JSON body.
  Modern,
}

impl Protocol {
  /// Map a `sentry_version` auth value to a protocol. Only version 7 speaks envelopes.
  pub fn from_sentry_version(version: &str) -> Self {
    if version.trim() == "7" {
      Self::Modern
    } else {
      Self::Legacy
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Legacy => "legacy",
      Self::Modern => "modern",
    }
  }
}

impl fmt::Display for Protocol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Payload bytes exactly as the codec consumes them (base64 text), tagged with protocol and project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
  pub body: Vec<u8>,
  pub protocol: Protocol,
  pub project_id: Option<String>,
}

impl RawPayload {
  pub fn new(body: impl Into<Vec<u8>>, protocol: Protocol) -> Self {
    Self {
      body: body.into(),
      protocol,
      project_id: None,
    }
  }

  pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
    self.project_id = Some(project_id.into());
    self
  }

  /// Content address of the payload; key of the `data` row.
  pub fn content_hash(&self) -> String {
    blake3::hash(&self.body).to_hex().to_string()
  }
}

// ---------------------------------------------------------------------------
// Inbound wire types (JSON contract: what SDKs send)
// ---------------------------------------------------------------------------

/// Treat an explicit JSON `null` like an absent field.
fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
  D: Deserializer<'de>,
  T: Default + Deserialize<'de>,
{
  Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Union of the legacy and modern packet layouts. Unknown fields are ignored;
/// missing or null fields take their zero value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WirePacket {
  #[serde(deserialize_with = "null_default")]
  pub server_name: String,
  #[serde(deserialize_with = "null_default")]
  pub environment: String,
  #[serde(deserialize_with = "null_default")]
  pub project: String,
  #[serde(deserialize_with = "null_default")]
  pub site: String,
  #[serde(deserialize_with = "null_default")]
  pub logger: String,
  #[serde(deserialize_with = "null_default")]
  pub level: String,
  #[serde(deserialize_with = "null_default")]
  pub platform: String,
  #[serde(deserialize_with = "null_default")]
  pub message: String,
  /// Legacy: RFC3339 string. Modern: fractional epoch seconds.
  pub timestamp: Value,
  #[serde(deserialize_with = "null_default")]
  pub user: BTreeMap<String, Value>,
  #[serde(deserialize_with = "null_default")]
  pub contexts: BTreeMap<String, Value>,
  #[serde(rename = "sentry.interfaces.User", deserialize_with = "null_default")]
  pub interface_user: BTreeMap<String, Value>,
  #[serde(rename = "sentry.interfaces.Http", deserialize_with = "null_default")]
  pub interface_http: WireRequest,
  #[serde(rename = "sentry.interfaces.Exception", deserialize_with = "null_default")]
  pub interface_exception: Option<WireLegacyException>,
  #[serde(rename = "sentry.interfaces.Stacktrace", deserialize_with = "null_default")]
  pub interface_stacktrace: WireStacktrace,
  #[serde(deserialize_with = "null_default")]
  pub request: WireRequest,
  #[serde(deserialize_with = "null_default")]
  pub exception: WireExceptionList,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WireRequest {
  #[serde(deserialize_with = "null_default")]
  pub url: String,
  #[serde(deserialize_with = "null_default")]
  pub method: String,
  #[serde(deserialize_with = "null_default")]
  pub query_string: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WireLegacyException {
  #[serde(rename = "type", deserialize_with = "null_default")]
  pub exception_type: String,
  #[serde(deserialize_with = "null_default")]
  pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WireExceptionList {
  #[serde(deserialize_with = "null_default")]
  pub values: Vec<WireExceptionValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WireExceptionValue {
  #[serde(rename = "type", deserialize_with = "null_default")]
  pub exception_type: String,
  #[serde(deserialize_with = "null_default")]
  pub value: String,
  #[serde(deserialize_with = "null_default")]
  pub stacktrace: WireStacktrace,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WireStacktrace {
  #[serde(deserialize_with = "null_default")]
  pub frames: Vec<WireFrame>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WireFrame {
  #[serde(deserialize_with = "null_default")]
  pub abs_path: String,
  #[serde(deserialize_with = "null_default")]
  pub filename: String,
  #[serde(deserialize_with = "null_default")]
  pub function: String,
  #[serde(deserialize_with = "null_default")]
  pub module: String,
  #[serde(deserialize_with = "null_default")]
  pub lineno: f64,
  #[serde(deserialize_with = "null_default")]
  pub context_line: String,
  #[serde(deserialize_with = "null_default")]
  pub pre_context: Vec<String>,
  #[serde(deserialize_with = "null_default")]
  pub post_context: Vec<String>,
  pub vars: Value,
}

// ---------------------------------------------------------------------------
// Internal normalized types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExceptionInfo {
  #[serde(rename = "type")]
  pub exception_type: String,
  pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackFrame {
  pub module: String,
  pub filename: String,
  pub abs_path: String,
  pub function: String,
  /// 0 when the client did not report one.
  pub line_number: u32,
  pub context_line: String,
  pub pre_context: Vec<String>,
  pub post_context: Vec<String>,
  pub variables: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpRequest {
  pub url: String,
  pub method: String,
  pub query_string: String,
}

/// Version-unified event produced by the codec.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedEvent {
  pub protocol: Protocol,
  pub project: String,
  pub server_name: String,
  pub site: String,
  pub logger: String,
  pub level: String,
  pub platform: String,
  pub message: String,
  pub environment: String,
  pub timestamp: DateTime<Utc>,
  pub request: Option<HttpRequest>,
  pub exception: Option<ExceptionInfo>,
  /// Outer-to-inner, as supplied by the client.
  pub stack_frames: Vec<StackFrame>,
  pub user: BTreeMap<String, Value>,
  pub context: BTreeMap<String, Value>,
}

impl NormalizedEvent {
  pub fn request_url(&self) -> Option<&str> {
    self.request.as_ref().map(|r| r.url.as_str()).filter(|u| !u.is_empty())
  }
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// A stable hex string identifying a unique issue group within a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

// ---------------------------------------------------------------------------
// Issue group
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStatus {
  Open,
  Resolved,
}

impl IssueStatus {
  /// Stored status column: 0 is open, anything else counts as resolved.
  pub fn from_code(code: i64) -> Self {
    if code == 0 {
      Self::Open
    } else {
      Self::Resolved
    }
  }

  pub fn code(self) -> i64 {
    match self {
      Self::Open => 0,
      Self::Resolved => 1,
    }
  }
}

/// Persistent, deduplicated issue group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
  pub id: i64,
  pub project_id: String,
  pub fingerprint: String,
  pub seen_count: i64,
  pub first_seen: DateTime<Utc>,
  pub last_seen: DateTime<Utc>,
  pub status: IssueStatus,
  pub logger: String,
  pub level: String,
  pub message: String,
  pub server_name: String,
  pub url: String,
  pub site: String,
  pub platform: String,
}

/// Result of one `AggregationStore::record` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
  pub issue_id: i64,
  pub is_new: bool,
  pub is_regression: bool,
}

// ---------------------------------------------------------------------------
// Output types (what collaborators receive)
// ---------------------------------------------------------------------------

/// Processing outcome handed to notification collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
  pub issue_id: i64,
  pub is_new: bool,
  pub is_regression: bool,
  pub message: String,
  pub server_name: String,
  pub level: String,
  pub site: String,
}

impl Outcome {
  /// Collaborators only act on first occurrences and reopened issues.
  pub fn should_notify(&self) -> bool {
    self.is_new || self.is_regression
  }
}

// ---------------------------------------------------------------------------
// Queue message
// ---------------------------------------------------------------------------

/// Record passed from intake to the worker through the queue buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
  #[serde(with = "base64_bytes")]
  pub body: Vec<u8>,
  pub protocol: Protocol,
  #[serde(default)]
  pub project_id: String,
}

impl From<RawPayload> for QueueMessage {
  fn from(raw: RawPayload) -> Self {
    Self {
      body: raw.body,
      protocol: raw.protocol,
      project_id: raw.project_id.unwrap_or_default(),
    }
  }
}

impl From<QueueMessage> for RawPayload {
  fn from(msg: QueueMessage) -> Self {
    Self {
      body: msg.body,
      protocol: msg.protocol,
      project_id: Some(msg.project_id).filter(|p| !p.is_empty()),
    }
  }
}

mod base64_bytes {
  use base64::engine::general_purpose::STANDARD;
  use base64::Engine;
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let text = String::deserialize(deserializer)?;
    STANDARD.decode(text).map_err(serde::de::Error::custom)
  }
}

// ---------------------------------------------------------------------------
// CLI / HTTP error wrapper
// ---------------------------------------------------------------------------

/// Structured error output for rejected payloads.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorOutput {
  pub error: bool,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub stage: Option<String>,
}

impl ErrorOutput {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      error: true,
      message: message.into(),
      stage: None,
    }
  }

  pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
    self.stage = Some(stage.into());
    self
  }
}
