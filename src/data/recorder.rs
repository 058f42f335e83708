//! Session recorder enforcing the append-only rules on top of a [`TimeseriesWriter`].
//!
//! - the header is written exactly once, before any row
//! - `recording_elapsed_sec` is strictly increasing
//! - rows are flushed per [`FlushPolicy`]
//! - the completion footer is written exactly once

use crate::config::FlushPolicy;
use crate::data::record::{CompletionStatus, FrameRecord, SessionHeader};
use crate::data::storage::TimeseriesWriter;
use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Appends frame records for one session.
pub struct TimeseriesRecorder {
    writer: Box<dyn TimeseriesWriter>,
    path: PathBuf,
    flush_policy: FlushPolicy,
    header_written: bool,
    finalized: bool,
    rows_written: u64,
    rows_since_flush: usize,
    last_elapsed: Option<f64>,
}

impl std::fmt::Debug for TimeseriesRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeseriesRecorder")
            .field("path", &self.path)
            .field("flush_policy", &self.flush_policy)
            .field("rows_written", &self.rows_written)
            .field("finalized", &self.finalized)
            .finish()
    }
}

/// File name for a session: `<experiment>_<YYYYmmdd_HHMMSS>_<id8>.<ext>`.
pub fn session_file_name(header: &SessionHeader, extension: &str) -> String {
    let id = header.session_id.simple().to_string();
    format!(
        "{}_{}_{}.{}",
        sanitize(&header.config.experiment_name),
        timestamp_part(header.created_at),
        &id[..8],
        extension
    )
}

fn timestamp_part(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "session".to_string()
    } else {
        cleaned
    }
}

impl TimeseriesRecorder {
    /// Open `writer` at `path`.
    pub async fn create(
        mut writer: Box<dyn TimeseriesWriter>,
        path: &Path,
        flush_policy: FlushPolicy,
    ) -> AppResult<Self> {
        writer.open(path).await?;
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            flush_policy,
            header_written: false,
            finalized: false,
            rows_written: 0,
            rows_since_flush: 0,
            last_elapsed: None,
        })
    }

    /// Open a file named after the header inside `dir`, then write the header.
    pub async fn start(
        writer: Box<dyn TimeseriesWriter>,
        dir: &Path,
        header: &SessionHeader,
        flush_policy: FlushPolicy,
    ) -> AppResult<Self> {
        let path = dir.join(session_file_name(header, writer.extension()));
        let mut recorder = Self::create(writer, &path, flush_policy).await?;
        recorder.write_header(header).await?;
        Ok(recorder)
    }

    /// Write the session header.
    pub async fn write_header(&mut self, header: &SessionHeader) -> AppResult<()> {
        if self.header_written {
            return Err(DaqError::Storage(
                "session header is write-once".to_string(),
            ));
        }
        self.writer.write_header(header).await?;
        self.writer.flush().await?;
        self.header_written = true;
        info!(session_id = %header.session_id, path = %self.path.display(), "Session header written");
        Ok(())
    }

    /// Append one row.
    ///
    /// Rejects rows before the header, after finalize, and rows whose
    /// `recording_elapsed_sec` does not exceed the previous row's.
    pub async fn append(&mut self, record: &FrameRecord) -> AppResult<()> {
        if self.finalized {
            return Err(DaqError::Storage("session already finalized".to_string()));
        }
        if !self.header_written {
            return Err(DaqError::Storage(
                "row appended before session header".to_string(),
            ));
        }
        if let Some(last) = self.last_elapsed {
            if record.recording_elapsed_sec <= last {
                return Err(DaqError::Storage(format!(
                    "recording_elapsed_sec must increase: {} after {}",
                    record.recording_elapsed_sec, last
                )));
            }
        }

        self.writer.append(record).await?;
        self.rows_written += 1;
        self.rows_since_flush += 1;
        self.last_elapsed = Some(record.recording_elapsed_sec);

        let due = match self.flush_policy {
            FlushPolicy::EveryRow => true,
            FlushPolicy::Batched { rows } => self.rows_since_flush >= rows.max(1),
        };
        if due {
            self.flush().await?;
        }
        debug!(frame_index = record.frame_index, "Row appended");
        Ok(())
    }

    /// Push buffered rows to the file.
    pub async fn flush(&mut self) -> AppResult<()> {
        self.writer.flush().await?;
        self.rows_since_flush = 0;
        Ok(())
    }

    /// Flush and write the completion footer. A second call is an error.
    pub async fn finalize(&mut self, status: &CompletionStatus) -> AppResult<()> {
        if self.finalized {
            return Err(DaqError::Storage("session already finalized".to_string()));
        }
        self.finalized = true;
        self.writer.finalize(status).await?;
        info!(
            rows = self.rows_written,
            path = %self.path.display(),
            "Session finalized"
        );
        Ok(())
    }

    /// Rows written so far.
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Session file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the footer has been written.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}
