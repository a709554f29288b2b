//! Binary entrypoint: replay queue messages from stdin through the dispatcher.
//!
//! Each input line is a QueueMessage (`{"body": base64, "protocol": ..., "project_id": ...}`).
//! Each output line is either:
//! - an Outcome (payload recorded)
//! - an ErrorOutput (bad line or undecodable payload)
//!
//! The store comes from `DATABASE_URL` (default `sqlite://ingest.db`). A store
//! failure ends the replay with exit code 1. Logs go to stderr.

use std::io::{self, Write};
use std::process::ExitCode;

use ingest_engine::types::ErrorOutput;
use ingest_engine::{store, Config, Dispatcher, IngestError, QueueMessage, RawPayload};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn emit<T: serde::Serialize>(out: &mut impl Write, value: &T) {
  let _ = serde_json::to_writer(&mut *out, value);
  let _ = writeln!(out);
}

#[tokio::main]
async fn main() -> ExitCode {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(io::stderr)
    .init();

  let url = std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://ingest.db".to_string());
  let storage = match store::connect(&url, &Config::default()).await {
    Ok(s) => s,
    Err(e) => {
      error!(error = %e, "cannot open store");
      return ExitCode::FAILURE;
    }
  };
  let dispatcher = Dispatcher::new(storage.store);

  let stdout = io::stdout();
  let mut out = io::BufWriter::new(stdout.lock());
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  let mut replayed = 0u64;

  loop {
    let line = match lines.next_line().await {
      Ok(Some(l)) => l,
      Ok(None) => break,
      Err(e) => {
        error!(error = %e, "stdin read error");
        let _ = out.flush();
        return ExitCode::FAILURE;
      }
    };

    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }

    let message: QueueMessage = match serde_json::from_str(trimmed) {
      Ok(m) => m,
      Err(e) => {
        emit(&mut out, &ErrorOutput::new(format!("json parse: {e}")));
        continue;
      }
    };

    match dispatcher.process(&RawPayload::from(message)).await {
      Ok(outcome) => {
        replayed += 1;
        emit(&mut out, &outcome);
      }
      Err(IngestError::Decode(e)) => {
        emit(&mut out, &ErrorOutput::new(e.reason.clone()).with_stage(e.stage.as_str()));
      }
      Err(e @ IngestError::Store(_)) => {
        emit(&mut out, &ErrorOutput::new(e.to_string()));
        let _ = out.flush();
        error!(error = %e, "store failure, aborting replay");
        return ExitCode::FAILURE;
      }
    }
  }

  let _ = out.flush();
  info!(replayed, "replay finished");
  ExitCode::SUCCESS
}
