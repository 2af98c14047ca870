//! Downstream result sink.
//!
//! The core emits exactly one message type outward: a poll result tagged
//! with the address and the original dispatch timestamp. Delivery is
//! best-effort: the core never awaits acknowledgement and a dropped result
//! is simply not retried until the next scheduled poll.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Capacity of the result channel.
pub const RESULT_CAPACITY: usize = 1024;

/// Separator between entries within one archive file.
const ENTRY_SEPARATOR: &[u8] = b"---\n";

/// The single outbound message of the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResult {
    /// Polled device address.
    pub ip: String,
    /// Dispatch timestamp of the originating request.
    pub timestamp: DateTime<Utc>,
    /// Structured metric result as produced by the probing program.
    pub metrics: Value,
}

/// Archive-directory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Directory receiving result archive files.
    pub directory: PathBuf,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./archive"),
        }
    }
}

/// File-buffering consumer of poll results.
///
/// Appends each result to `<directory>/<unix_ts>.txt` as a pretty JSON
/// document (`{"ip": ..., "result": ...}`), entries separated by `---`, so
/// results from one dispatch wave land in one file. Write failures are
/// logged and the result dropped.
#[derive(Debug, Clone)]
pub struct FileSink {
    directory: PathBuf,
}

impl FileSink {
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
        }
    }

    /// Consume results until the producer side closes.
    pub fn spawn(self, rx: mpsc::Receiver<PollResult>) -> JoinHandle<()> {
        tokio::spawn(self.run(rx))
    }

    async fn run(self, mut rx: mpsc::Receiver<PollResult>) {
        if let Err(e) = tokio::fs::create_dir_all(&self.directory).await {
            tracing::error!(directory = %self.directory.display(), error = %e,
                "Archive directory unavailable");
        }

        tracing::info!(directory = %self.directory.display(), "File sink started");

        while let Some(result) = rx.recv().await {
            if let Err(e) = self.append(&result).await {
                tracing::warn!(ip = %result.ip, error = %e, "Archive write failed, result dropped");
            }
        }

        tracing::info!("Result channel closed, file sink stopping");
    }

    async fn append(&self, result: &PollResult) -> Result<(), std::io::Error> {
        let path = self
            .directory
            .join(format!("{}.txt", result.timestamp.timestamp()));

        let entry = serde_json::to_string_pretty(&serde_json::json!({
            "ip": result.ip,
            "result": result.metrics,
        }))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        if file.metadata().await?.len() > 0 {
            file.write_all(ENTRY_SEPARATOR).await?;
        }
        file.write_all(entry.as_bytes()).await?;
        file.write_all(b"\n").await?;

        Ok(())
    }
}
