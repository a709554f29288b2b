//! Binary entrypoint for the intake server.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use ingest_engine::{store, Dispatcher, LogNotifier, MemoryQueue, NotifierSet, Worker};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use intake_server::{router, AppState, Cli, Mode};

async fn serve(listen: SocketAddr, state: AppState, cancel: CancellationToken) -> std::io::Result<()> {
  let app = router(Arc::new(state));
  let listener = TcpListener::bind(listen).await?;
  info!(%listen, "intake listening");
  axum::serve(listener, app)
    .with_graceful_shutdown(cancel.cancelled_owned())
    .await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  let cli = Cli::parse();
  let config = cli.engine_config();
  let cancel = CancellationToken::new();

  let signal = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      info!("shutdown requested");
    }
    signal.cancel();
  });

  let storage = store::connect(&cli.database_url, &config).await?;
  let notifier = NotifierSet::new().with(Arc::new(LogNotifier));
  info!(mode = ?cli.mode, "starting");

  match cli.mode {
    Mode::Serve => {
      let state = AppState::direct(Dispatcher::new(storage.store), notifier);
      serve(cli.listen, state, cancel).await?;
    }
    Mode::Buffered => {
      let queue = Arc::new(MemoryQueue::new());
      let worker = Worker::new(
        Dispatcher::new(storage.store),
        queue.clone(),
        notifier,
        &config,
        cancel.clone(),
      );
      // A fatal worker error takes the listener down with it.
      let on_fatal = cancel.clone();
      let handle = tokio::spawn(async move {
        let result = worker.run().await;
        if result.is_err() {
          on_fatal.cancel();
        }
        result
      });

      serve(cli.listen, AppState::queued(queue.clone()), cancel.clone()).await?;
      cancel.cancel();
      let report = handle.await??;
      if !queue.is_empty() {
        warn!(pending = queue.len(), "exiting with unprocessed payloads");
      }
      info!(processed = report.processed, dropped = report.dropped, "worker finished");
    }
    Mode::Frontend => {
      serve(cli.listen, AppState::queued(storage.queue), cancel).await?;
    }
    Mode::Worker => {
      let worker = Worker::new(
        Dispatcher::new(storage.store),
        storage.queue,
        notifier,
        &config,
        cancel,
      );
      let report = worker.run().await?;
      info!(processed = report.processed, dropped = report.dropped, "worker finished");
    }
  }

  Ok(())
}
