//! Command line / environment configuration.

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use ingest_engine::Config;

/// How this process participates in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
  /// HTTP intake, payloads processed inside the request.
  Serve,
  /// HTTP intake plus an in-process queue and worker.
  Buffered,
  /// HTTP intake that only enqueues into the database queue.
  Frontend,
  /// Database queue consumer, no HTTP listener.
  Worker,
}

#[derive(Debug, Parser)]
#[command(name = "intake-server", about = "Crash report intake and aggregation")]
pub struct Cli {
  #[arg(long, env = "MODE", value_enum, default_value_t = Mode::Serve)]
  pub mode: Mode,

  /// `sqlite://path`, `sqlite::memory:` or `postgres://...`.
  #[arg(long, env = "DATABASE_URL", default_value = "sqlite://ingest.db")]
  pub database_url: String,

  #[arg(long, env = "LISTEN", default_value = "127.0.0.1:2017")]
  pub listen: SocketAddr,

  /// Worker dequeue wait; bounds how long shutdown takes to be noticed.
  #[arg(long, env = "DEQUEUE_WAIT_MS", default_value_t = 1000)]
  pub dequeue_wait_ms: u64,
}

impl Cli {
  pub fn engine_config(&self) -> Config {
    Config {
      dequeue_wait: Duration::from_millis(self.dequeue_wait_ms),
      ..Config::default()
    }
  }
}
