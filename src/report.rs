//! Persistence of run reports.
//!
//! A [`SyncResult`] is written as pretty JSON so that tooling can pick up the
//! outcome of the last run. Writes are atomic: a reader never sees a half
//! written report.
//!
//! # Example
//!
//! ```rust,no_run
//! use prod_sync::report::ReportWriter;
//!
//! # async fn example(result: prod_sync::SyncResult) -> prod_sync::Result<()> {
//! let writer = ReportWriter::new("last-sync.json");
//! writer.save(&result).await?;
//!
//! if let Some(previous) = writer.load().await? {
//!     println!("Last run finished with status {}", previous.status);
//! }
//! # Ok(())
//! # }
//! ```

use crate::{Error, Result, SyncResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

/// Reads and writes the report file.
pub struct ReportWriter {
    file_path: PathBuf,
}

impl ReportWriter {
    pub fn new(report_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: report_path.as_ref().to_path_buf(),
        }
    }

    /// Loads the previous report, or `None` when no report exists yet.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file exists but cannot be read or does not hold
    /// a valid report.
    pub async fn load(&self) -> Result<Option<SyncResult>> {
        if !self.file_path.exists() {
            debug!("No report file found at {:?}", self.file_path);
            return Ok(None);
        }

        let content = fs::read_to_string(&self.file_path).await.map_err(|e| {
            error!("Failed to read report file: {}", e);
            Error::Io(e)
        })?;

        match serde_json::from_str::<SyncResult>(&content) {
            Ok(report) => {
                info!(
                    "Loaded report: status={}, finished_at={}",
                    report.status, report.finished_at
                );
                Ok(Some(report))
            }
            Err(e) => {
                error!("Failed to parse report file: {}", e);
                Err(Error::Serialization(e))
            }
        }
    }

    /// Saves the report atomically.
    ///
    /// The JSON is written to a sibling temporary file, synced to disk and
    /// renamed over the final path.
    pub async fn save(&self, report: &SyncResult) -> Result<()> {
        debug!("Saving report to {:?}", self.file_path);

        let temp_path = self.file_path.with_extension("tmp");

        let json = serde_json::to_string_pretty(report)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.file_path).await?;

        info!(status = %report.status, path = ?self.file_path, "Report saved");
        Ok(())
    }

    pub async fn delete(&self) -> Result<()> {
        if self.file_path.exists() {
            fs::remove_file(&self.file_path).await?;
            info!("Deleted report file");
        }
        Ok(())
    }
}
