//! Decode versioned wire payloads into the canonical NormalizedEvent.
//!
//! Legacy: `base64(zlib(JSON))`. Modern: `base64(gzip(header \n item_header \n JSON))`.
//! Both converge on the same [`NormalizedEvent`]; the codec is pure and never
//! fails on missing fields, only on malformed base64, compression or JSON.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde_json::Value;

use crate::error::{DecodeError, DecodeStage};
use crate::types::*;

/// Decode a raw payload, dispatching on its protocol tag.
pub fn decode(raw: &RawPayload) -> Result<NormalizedEvent, DecodeError> {
  // Line breaks inside the base64 text are tolerated.
  let text: Vec<u8> = raw
    .body
    .iter()
    .copied()
    .filter(|b| !b.is_ascii_whitespace())
    .collect();
  let compressed = STANDARD
    .decode(&text)
    .map_err(|e| DecodeError::new(DecodeStage::Base64, e.to_string()))?;

  match raw.protocol {
    Protocol::Legacy => {
      let json = inflate(ZlibDecoder::new(compressed.as_slice()))?;
      let packet = parse_packet(&json)?;
      Ok(normalize_legacy(packet, raw.project_id.as_deref()))
    }
    Protocol::Modern => {
      let envelope = inflate(GzDecoder::new(compressed.as_slice()))?;
      let body = envelope_body(&envelope)?;
      let packet = parse_packet(body)?;
      Ok(normalize_modern(packet, raw.project_id.as_deref()))
    }
  }
}

/// Produce wire bytes for a JSON packet (the inverse of [`decode`]'s framing).
pub fn encode(protocol: Protocol, json: &[u8]) -> std::io::Result<Vec<u8>> {
  let compressed = match protocol {
    Protocol::Legacy => {
      let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
      enc.write_all(json)?;
      enc.finish()?
    }
    Protocol::Modern => {
      let mut enc = GzEncoder::new(Vec::new(), Compression::default());
      enc.write_all(b"{}\n{\"type\":\"event\"}\n")?;
      enc.write_all(json)?;
      enc.finish()?
    }
  };
  Ok(STANDARD.encode(compressed).into_bytes())
}

fn inflate<R: Read>(mut decoder: R) -> Result<Vec<u8>, DecodeError> {
  let mut out = Vec::new();
  decoder
    .read_to_end(&mut out)
    .map_err(|e| DecodeError::new(DecodeStage::Decompress, e.to_string()))?;
  Ok(out)
}

/// Everything after the two header lines; the body itself may span lines.
fn envelope_body(envelope: &[u8]) -> Result<&[u8], DecodeError> {
  let trimmed = envelope.trim_ascii();
  let mut parts = trimmed.splitn(3, |&b| b == b'\n');
  match (parts.next(), parts.next(), parts.next()) {
    (Some(_), Some(_), Some(body)) => Ok(body),
    _ => Err(DecodeError::new(
      DecodeStage::Parse,
      "envelope: expected header, item header and body lines",
    )),
  }
}

fn parse_packet(json: &[u8]) -> Result<WirePacket, DecodeError> {
  serde_json::from_slice(json).map_err(|e| DecodeError::new(DecodeStage::Parse, e.to_string()))
}

fn normalize_legacy(packet: WirePacket, project_id: Option<&str>) -> NormalizedEvent {
  let project = if packet.project.is_empty() {
    project_id.unwrap_or_default().to_string()
  } else {
    packet.project
  };

  NormalizedEvent {
    protocol: Protocol::Legacy,
    project,
    server_name: packet.server_name,
    site: packet.site,
    logger: packet.logger,
    level: packet.level,
    platform: packet.platform,
    message: packet.message,
    environment: packet.environment,
    timestamp: parse_timestamp(&packet.timestamp),
    request: normalize_request(packet.interface_http).or_else(|| normalize_request(packet.request)),
    exception: packet.interface_exception.map(|e| ExceptionInfo {
      exception_type: e.exception_type,
      value: e.value,
    }),
    stack_frames: normalize_frames(packet.interface_stacktrace.frames),
    user: if packet.interface_user.is_empty() {
      packet.user
    } else {
      packet.interface_user
    },
    context: packet.contexts,
  }
}

/// Modern packets carry no top-level message/level/logger: they come from the
/// first exception entry and the platform.
fn normalize_modern(packet: WirePacket, project_id: Option<&str>) -> NormalizedEvent {
  let first = packet.exception.values.into_iter().next();
  let (message, level, exception, frames) = match first {
    Some(v) => (
      v.value.clone(),
      v.exception_type.clone(),
      Some(ExceptionInfo {
        exception_type: v.exception_type,
        value: v.value,
      }),
      v.stacktrace.frames,
    ),
    None => (String::new(), String::new(), None, Vec::new()),
  };

  NormalizedEvent {
    protocol: Protocol::Modern,
    project: project_id.unwrap_or_default().to_string(),
    server_name: packet.server_name,
    site: packet.site,
    logger: packet.platform.clone(),
    level,
    platform: packet.platform,
    message,
    environment: packet.environment,
    timestamp: parse_timestamp(&packet.timestamp),
    request: normalize_request(packet.request),
    exception,
    stack_frames: normalize_frames(frames),
    user: packet.user,
    context: packet.contexts,
  }
}

fn normalize_request(req: WireRequest) -> Option<HttpRequest> {
  if req.url.is_empty() && req.method.is_empty() && req.query_string.is_empty() {
    return None;
  }
  Some(HttpRequest {
    url: req.url,
    method: req.method,
    query_string: req.query_string,
  })
}

fn normalize_frames(frames: Vec<WireFrame>) -> Vec<StackFrame> {
  frames
    .into_iter()
    .map(|f| StackFrame {
      module: f.module,
      filename: f.filename,
      abs_path: f.abs_path,
      function: f.function,
      line_number: if f.lineno >= 1.0 && f.lineno <= u32::MAX as f64 {
        f.lineno as u32
      } else {
        0
      },
      context_line: f.context_line,
      pre_context: f.pre_context,
      post_context: f.post_context,
      variables: f.vars,
    })
    .collect()
}

/// Numbers are fractional epoch seconds; strings are RFC3339, or naive ISO8601
/// read as UTC. Anything else is the Unix epoch.
fn parse_timestamp(value: &Value) -> DateTime<Utc> {
  match value {
    Value::Number(n) => n
      .as_f64()
      .and_then(|secs| {
        let whole = secs.trunc();
        let nanos = ((secs - whole) * 1e9) as u32;
        DateTime::from_timestamp(whole as i64, nanos)
      })
      .unwrap_or_default(),
    Value::String(s) => DateTime::parse_from_rfc3339(s)
      .map(|dt| dt.with_timezone(&Utc))
      .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").map(|n| n.and_utc()))
      .unwrap_or_default(),
    _ => DateTime::<Utc>::default(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;
  use serde_json::json;

  fn legacy(json: Value) -> RawPayload {
    RawPayload::new(encode(Protocol::Legacy, json.to_string().as_bytes()).unwrap(), Protocol::Legacy)
  }

  fn modern(json: Value, project: &str) -> RawPayload {
    RawPayload::new(encode(Protocol::Modern, json.to_string().as_bytes()).unwrap(), Protocol::Modern)
      .with_project(project)
  }

  #[test]
  fn legacy_packet_fields_are_mapped() {
    let raw = legacy(json!({
      "project": "2",
      "server_name": "web-1",
      "site": "shop",
      "logger": "php",
      "level": "error",
      "platform": "php",
      "message": "Undefined index: id",
      "timestamp": "2024-03-01T12:00:00Z",
      "sentry.interfaces.Http": {"url": "https://shop.example/cart", "method": "POST"},
      "sentry.interfaces.User": {"id": "42"},
      "sentry.interfaces.Exception": {"type": "ErrorException", "value": "Undefined index: id"},
      "sentry.interfaces.Stacktrace": {"frames": [
        {"filename": "cart.php", "function": "add", "lineno": 17, "context_line": "$id = $_POST['id'];"}
      ]}
    }));

    let event = decode(&raw).unwrap();
    assert_eq!(event.protocol, Protocol::Legacy);
    assert_eq!(event.project, "2");
    assert_eq!(event.server_name, "web-1");
    assert_eq!(event.level, "error");
    assert_eq!(event.timestamp, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
    assert_eq!(event.request_url(), Some("https://shop.example/cart"));
    assert_eq!(event.exception.as_ref().unwrap().exception_type, "ErrorException");
    assert_eq!(event.stack_frames.len(), 1);
    assert_eq!(event.stack_frames[0].line_number, 17);
    assert_eq!(event.user["id"], json!("42"));
  }

  #[test]
  fn legacy_project_falls_back_to_payload_project() {
    let raw = legacy(json!({"message": "boom"})).with_project("11");
    assert_eq!(decode(&raw).unwrap().project, "11");
  }

  #[test]
  fn modern_synthesizes_message_level_logger() {
    let raw = modern(
      json!({
        "platform": "python",
        "server_name": "worker-3",
        "timestamp": 1709294400.25,
        "request": {"url": "https://api.example/v1/jobs"},
        "exception": {"values": [{
          "type": "KeyError",
          "value": "'job_id'",
          "stacktrace": {"frames": [
            {"module": "jobs.views", "function": "create", "lineno": 88, "context_line": "job = payload['job_id']"}
          ]}
        }]},
        "contexts": {"os": {"name": "Linux"}}
      }),
      "5",
    );

    let event = decode(&raw).unwrap();
    assert_eq!(event.protocol, Protocol::Modern);
    assert_eq!(event.project, "5");
    assert_eq!(event.message, "'job_id'");
    assert_eq!(event.level, "KeyError");
    assert_eq!(event.logger, "python");
    assert_eq!(event.timestamp.timestamp(), 1709294400);
    assert_eq!(event.timestamp.timestamp_subsec_millis(), 250);
    assert_eq!(event.stack_frames[0].module, "jobs.views");
    assert_eq!(event.context["os"]["name"], json!("Linux"));
  }

  #[test]
  fn modern_without_exception_values_decodes_empty() {
    let event = decode(&modern(json!({"platform": "node"}), "1")).unwrap();
    assert!(event.exception.is_none());
    assert!(event.stack_frames.is_empty());
    assert_eq!(event.message, "");
  }

  #[test]
  fn missing_fields_default_to_zero_values() {
    let event = decode(&legacy(json!({}))).unwrap();
    assert_eq!(event.message, "");
    assert_eq!(event.timestamp, DateTime::<Utc>::default());
    assert!(event.request.is_none());
    assert!(event.exception.is_none());
  }

  #[test]
  fn naive_timestamp_is_utc() {
    let event = decode(&legacy(json!({"timestamp": "2012-11-11T17:41:36"}))).unwrap();
    assert_eq!(event.timestamp, Utc.with_ymd_and_hms(2012, 11, 11, 17, 41, 36).unwrap());
  }

  #[test]
  fn malformed_base64_fails_at_base64_stage() {
    let raw = RawPayload::new("%%% not base64 %%%", Protocol::Legacy);
    assert_eq!(decode(&raw).unwrap_err().stage, DecodeStage::Base64);
  }

  #[test]
  fn uncompressed_body_fails_at_decompress_stage() {
    let raw = RawPayload::new(STANDARD.encode(b"{\"message\":\"plain\"}"), Protocol::Legacy);
    assert_eq!(decode(&raw).unwrap_err().stage, DecodeStage::Decompress);

    let raw = RawPayload::new(STANDARD.encode(b"{\"message\":\"plain\"}"), Protocol::Modern);
    assert_eq!(decode(&raw).unwrap_err().stage, DecodeStage::Decompress);
  }

  #[test]
  fn invalid_json_fails_at_parse_stage() {
    let raw = RawPayload::new(encode(Protocol::Legacy, b"{\"message\": ").unwrap(), Protocol::Legacy);
    assert_eq!(decode(&raw).unwrap_err().stage, DecodeStage::Parse);
  }

  #[test]
  fn short_envelope_fails_at_parse_stage() {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(b"{}\n{\"message\":\"x\"}").unwrap();
    let body = STANDARD.encode(enc.finish().unwrap());
    let raw = RawPayload::new(body, Protocol::Modern);
    assert_eq!(decode(&raw).unwrap_err().stage, DecodeStage::Parse);
  }

  #[test]
  fn multi_line_envelope_body_is_parsed_whole() {
    let pretty = serde_json::to_string_pretty(&json!({
      "platform": "python",
      "exception": {"values": [{"type": "KeyError", "value": "'sku'"}]}
    }))
    .unwrap();
    assert!(pretty.contains('\n'));
    let raw = RawPayload::new(encode(Protocol::Modern, pretty.as_bytes()).unwrap(), Protocol::Modern);
    let event = decode(&raw).unwrap();
    assert_eq!(event.message, "'sku'");
    assert_eq!(event.level, "KeyError");
    assert_eq!(event.platform, "python");
  }

  #[test]
  fn decoding_is_deterministic() {
    let raw = legacy(json!({
      "message": "boom",
      "sentry.interfaces.User": {"b": 1, "a": 2},
      "sentry.interfaces.Stacktrace": {"frames": [{"module": "m", "vars": {"z": 1, "y": [1, 2]}}]}
    }));
    assert_eq!(decode(&raw).unwrap(), decode(&raw).unwrap());
  }

  #[test]
  fn wrapped_base64_is_accepted() {
    let mut raw = legacy(json!({"message": "wrapped"}));
    raw.body.insert(4, b'\n');
    assert_eq!(decode(&raw).unwrap().message, "wrapped");
  }
}
