//! # newsweave
//!
//! Pooled NNTP client with a segment download, reassembly and repair pipeline.
//!
//! A capped pool of connections serves many concurrent requests, ordered by
//! weight. Files are fetched and decoded segment by segment out of order but
//! always written in order. Missing segments switch the manifest into PAR2
//! repair, after which output resumes from the repaired copy. Progress is
//! reported on a broadcast [`Event`] channel.
//!
//! ## Quick Start
//!
//! ```no_run
//! use newsweave::{Client, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::for_host("news.example.com");
//!     config.server.port = 563;
//!     config.server.secure = true;
//!     config.server.username = Some("user".to_string());
//!     config.server.password = Some("pass".to_string());
//!     config.server.connections = 8;
//!
//!     let client = Client::new(config)?;
//!
//!     // Subscribe to events
//!     let mut events = client.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let manifest = client.open_manifest("https://indexer.example.com/get/show.nzb").await?;
//!     manifest.download("/data/downloads/show").await?;
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// One-shot deferred work with cancel, pause and resume
pub mod cancellable;
/// Top level client
pub mod client;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Manifest parsing, triage and repair orchestration
pub mod manifest;
/// Wire protocol: framing, responses and connection workers
pub mod nntp;
/// PAR2 repair collaborator
pub mod parity;
/// Segment fetch, decode and reassembly
pub mod pipeline;
/// Connection pool and request scheduler
pub mod pool;
/// Retry logic with exponential backoff
pub mod retry;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use cancellable::{CancellableTask, Execution, TaskSignal, TaskState};
pub use client::Client;
pub use config::{Config, RetryConfig, ServerConfig};
pub use error::{Error, Result};
pub use manifest::{FileBucket, Manifest};
pub use nntp::{ArticleId, GroupInfo, Response, Worker, WorkerState};
pub use parity::{CliRepairTool, NoOpRepairTool, RepairEvent, RepairTool};
pub use pipeline::{LogicalFile, RepairStatus, Segment, StreamOptions, StreamReport};
pub use pool::{Job, Pool, PoolOptions, PoolStats};
pub use types::{Event, FileKind, TaskAction};

/// Run until SIGINT/SIGTERM (Ctrl+C elsewhere), then close the client
///
/// ```no_run
/// use newsweave::{Client, Config, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = Client::new(Config::for_host("news.example.com"))?;
///     run_with_shutdown(client).await;
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(client: Client) {
    let signal = wait_for_signal().await;
    tracing::info!(signal, "Shutting down");
    client.close().await;
}

/// Name of the signal that ended the wait
#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration fails in some sandboxes; fall back to ctrl_c
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut term), Ok(mut int)) => tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = int.recv() => "SIGINT",
        },
        (term, int) => {
            if let Err(e) = term.as_ref().map(|_| ()).and(int.as_ref().map(|_| ())) {
                tracing::warn!(error = %e, "Signal registration failed, waiting for Ctrl+C");
            }
            wait_for_ctrl_c().await
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
    }
    "ctrl-c"
}
