//! Stable fingerprint computation for grouping events into issues.
//!
//! Structural stack identity wins over message text: two messages raised from
//! the same source lines group together, the same message from different call
//! sites does not.

use crate::types::{Fingerprint, NormalizedEvent, Protocol, StackFrame};

/// Compute the grouping checksum for an event using its protocol's rule.
///
/// Legacy, first matching branch wins:
/// 1. frames present: frame content in call order, then the exception type
/// 2. exception present: type + value
/// 3. otherwise the message
///
/// Modern always hashes frame content + exception type of the first exception
/// entry, falling back to the message when the event carries no exception.
pub fn compute(event: &NormalizedEvent) -> Fingerprint {
  let mut hasher = blake3::Hasher::new();
  match event.protocol {
    Protocol::Legacy => legacy_content(&mut hasher, event),
    Protocol::Modern => modern_content(&mut hasher, event),
  }

  let hex = hasher.finalize().to_hex();
  // First 16 bytes (32 hex chars), the width of the checksum column.
  Fingerprint(hex[..32].to_string())
}

fn legacy_content(hasher: &mut blake3::Hasher, event: &NormalizedEvent) {
  if !event.stack_frames.is_empty() {
    stacktrace_content(hasher, &event.stack_frames);
    if let Some(exc) = &event.exception {
      hasher.update(exc.exception_type.as_bytes());
    }
    return;
  }

  if let Some(exc) = &event.exception {
    hasher.update(exc.exception_type.as_bytes());
    hasher.update(exc.value.as_bytes());
    return;
  }

  hasher.update(event.message.as_bytes());
}

fn modern_content(hasher: &mut blake3::Hasher, event: &NormalizedEvent) {
  match &event.exception {
    Some(exc) => {
      stacktrace_content(hasher, &event.stack_frames);
      hasher.update(exc.exception_type.as_bytes());
    }
    None => {
      hasher.update(event.message.as_bytes());
    }
  }
}

fn stacktrace_content(hasher: &mut blake3::Hasher, frames: &[StackFrame]) {
  for frame in frames {
    if !frame.module.is_empty() {
      hasher.update(frame.module.as_bytes());
    } else if !frame.filename.is_empty() && !is_url(&frame.filename) {
      hasher.update(frame.filename.as_bytes());
    }

    if !frame.context_line.is_empty() {
      hasher.update(frame.context_line.as_bytes());
    } else if !frame.function.is_empty() {
      hasher.update(frame.function.as_bytes());
    } else if frame.line_number > 0 {
      hasher.update(frame.line_number.to_string().as_bytes());
    }
  }
}

/// Served or bundled sources: their location changes per deploy.
fn is_url(filename: &str) -> bool {
  ["file:", "http:", "https:"]
    .iter()
    .any(|scheme| filename.starts_with(scheme))
}
