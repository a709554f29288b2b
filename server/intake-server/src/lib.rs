//! Crash report intake server.
//!
//! Accepts store and envelope requests over HTTP and hands each payload to
//! the ingestion core, either directly or through a queue buffer.
//! Bind to 127.0.0.1 by default.

pub mod config;
pub mod error;
pub mod handlers;
pub mod router;
pub mod state;
pub mod types;

pub use config::{Cli, Mode};
pub use error::IntakeError;
pub use router::router;
pub use state::{AppState, Intake};
