//! Time series storage writers.
//!
//! A session file is append-only: a write-once header, one row per frame, and a completion
//! footer added on finalize. Nothing written before the footer is ever rewritten, so a crash
//! leaves every flushed row readable.
//!
//! CSV layout:
//!
//! ```text
//! # {                          <- session header, pretty JSON, "# " prefixed
//! #   "format_version": 1,
//! #   ...
//! # }
//! timestamp,frame_index,...    <- column row
//! 2026-03-01T12:00:00.003Z,0,... <- one row per frame
//! # {                          <- completion footer, pretty JSON, "# " prefixed
//! #   "outcome": "completed",
//! #   ...
//! # }
//! ```

use crate::data::record::{CompletionStatus, FrameRecord, SessionHeader};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::path::Path;

/// Append-only backend for one session file.
#[async_trait]
pub trait TimeseriesWriter: Send {
    /// Create the session file. Parent directories are created as needed.
    async fn open(&mut self, path: &Path) -> AppResult<()>;

    /// Write the session header. Called exactly once, before any row.
    async fn write_header(&mut self, header: &SessionHeader) -> AppResult<()>;

    /// Append one row.
    async fn append(&mut self, record: &FrameRecord) -> AppResult<()>;

    /// Push buffered rows to the file.
    async fn flush(&mut self) -> AppResult<()>;

    /// Flush, write the completion footer and close.
    async fn finalize(&mut self, status: &CompletionStatus) -> AppResult<()>;

    /// File extension without the dot.
    fn extension(&self) -> &'static str;
}

/// A session read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSession {
    /// Session header
    pub header: SessionHeader,
    /// Rows in file order
    pub records: Vec<FrameRecord>,
    /// Completion footer, absent if the session never finalized
    pub completion: Option<CompletionStatus>,
}

#[cfg(feature = "storage_csv")]
pub use csv_backend::{read_session, CsvTimeseriesWriter};

#[cfg(feature = "storage_csv")]
mod csv_backend {
    use super::*;
    use crate::data::record::COLUMNS;
    use std::fs::{File, OpenOptions};
    use std::io::Write;
    use std::path::PathBuf;
    use tracing::{debug, info, warn};

    const COMMENT_PREFIX: &str = "# ";

    /// A writer for CSV session files.
    #[derive(Debug, Default)]
    pub struct CsvTimeseriesWriter {
        path: PathBuf,
        file: Option<File>,
        writer: Option<csv::Writer<File>>,
    }

    impl CsvTimeseriesWriter {
        /// Create an unopened writer.
        pub fn new() -> Self {
            Self::default()
        }

        fn writer(&mut self) -> AppResult<&mut csv::Writer<File>> {
            self.writer.as_mut().ok_or_else(|| {
                DaqError::Storage(format!(
                    "CSV session '{}' has no header yet",
                    self.path.display()
                ))
            })
        }
    }

    fn write_comment_block(file: &mut File, json: &str) -> AppResult<()> {
        for line in json.lines() {
            file.write_all(COMMENT_PREFIX.as_bytes())
                .and_then(|_| file.write_all(line.as_bytes()))
                .and_then(|_| file.write_all(b"\n"))
                .map_err(|e| DaqError::Storage(e.to_string()))?;
        }
        Ok(())
    }

    #[async_trait]
    impl TimeseriesWriter for CsvTimeseriesWriter {
        async fn open(&mut self, path: &Path) -> AppResult<()> {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| DaqError::Storage(e.to_string()))?;
                }
            }
            let file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .map_err(|e| {
                    DaqError::Storage(format!(
                        "Failed to create CSV file '{}': {}",
                        path.display(),
                        e
                    ))
                })?;
            self.path = path.to_path_buf();
            self.file = Some(file);
            info!("CSV writer opened '{}'", self.path.display());
            Ok(())
        }

        async fn write_header(&mut self, header: &SessionHeader) -> AppResult<()> {
            let mut file = self.file.take().ok_or_else(|| {
                DaqError::Storage("CSV header already written or file not open".to_string())
            })?;

            let json_string = serde_json::to_string_pretty(header)?;
            write_comment_block(&mut file, &json_string)?;

            let mut writer = csv::Writer::from_writer(file);
            writer.write_record(COLUMNS)?;
            writer
                .flush()
                .map_err(|e| DaqError::Storage(e.to_string()))?;

            self.writer = Some(writer);
            Ok(())
        }

        async fn append(&mut self, record: &FrameRecord) -> AppResult<()> {
            self.writer()?.write_record(record.to_fields())?;
            Ok(())
        }

        async fn flush(&mut self) -> AppResult<()> {
            self.writer()?
                .flush()
                .map_err(|e| DaqError::Storage(e.to_string()))
        }

        async fn finalize(&mut self, status: &CompletionStatus) -> AppResult<()> {
            let writer = self.writer.take().ok_or_else(|| {
                DaqError::Storage("CSV session already finalized".to_string())
            })?;
            let mut file = writer
                .into_inner()
                .map_err(|e| DaqError::Storage(e.to_string()))?;

            let json_string = serde_json::to_string_pretty(status)?;
            write_comment_block(&mut file, &json_string)?;
            file.sync_all()
                .map_err(|e| DaqError::Storage(e.to_string()))?;

            info!("CSV writer finalized '{}'", self.path.display());
            Ok(())
        }

        fn extension(&self) -> &'static str {
            "csv"
        }
    }

    /// Read a CSV session back.
    ///
    /// A trailing line without its newline (crash mid-write) is ignored, so every row
    /// written before it stays readable.
    pub fn read_session(path: &Path) -> AppResult<RecordedSession> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DaqError::Storage(format!("Failed to read '{}': {}", path.display(), e))
        })?;

        let mut lines: Vec<&str> = content.split('\n').collect();
        if let Some(last) = lines.pop() {
            if !last.is_empty() {
                warn!(bytes = last.len(), "Ignoring truncated final line");
            }
        }

        let header_len = lines
            .iter()
            .take_while(|line| line.starts_with('#'))
            .count();
        let header_json = strip_comments(&lines[..header_len]);
        let header: SessionHeader = serde_json::from_str(&header_json).map_err(|e| {
            DaqError::Storage(format!("Invalid session header in '{}': {}", path.display(), e))
        })?;

        let body = &lines[header_len..];
        let footer_start = body
            .iter()
            .position(|line| line.starts_with('#'))
            .unwrap_or(body.len());
        let (table, footer) = body.split_at(footer_start);

        let completion = if footer.is_empty() {
            None
        } else {
            let json = strip_comments(footer);
            match serde_json::from_str(&json) {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!(error = %e, "Ignoring unreadable completion footer");
                    None
                }
            }
        };

        let mut table_text = table.join("\n");
        table_text.push('\n');
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(table_text.as_bytes());

        let columns = reader.headers()?.clone();
        if columns.iter().ne(COLUMNS.iter().copied()) {
            return Err(DaqError::Storage(format!(
                "Unexpected columns in '{}'",
                path.display()
            )));
        }

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row?;
            records.push(FrameRecord::from_fields(row.iter())?);
        }

        debug!(rows = records.len(), "Read session '{}'", path.display());
        Ok(RecordedSession {
            header,
            records,
            completion,
        })
    }

    fn strip_comments(lines: &[&str]) -> String {
        lines
            .iter()
            .map(|line| {
                line.strip_prefix(COMMENT_PREFIX)
                    .or_else(|| line.strip_prefix('#'))
                    .unwrap_or(line)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::data::record::tests::{sample_config, sample_record};
        use crate::data::record::SessionOutcome;
        use chrono::Utc;

        async fn write_session(path: &Path, rows: u64, finalize: bool) -> SessionHeader {
            let header = SessionHeader::new(sample_config());
            let mut writer = CsvTimeseriesWriter::new();
            writer.open(path).await.unwrap();
            writer.write_header(&header).await.unwrap();
            for i in 0..rows {
                writer.append(&sample_record(i)).await.unwrap();
            }
            writer.flush().await.unwrap();
            if finalize {
                writer
                    .finalize(&CompletionStatus {
                        outcome: SessionOutcome::Completed,
                        frames_written: rows,
                        frames_dropped: 0,
                        phase_transitions: 0,
                        finished_at: Utc::now(),
                    })
                    .await
                    .unwrap();
            }
            header
        }

        #[tokio::test]
        async fn test_write_and_read_back() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("nested").join("session.csv");
            let header = write_session(&path, 3, true).await;

            let session = read_session(&path).unwrap();
            assert_eq!(session.header, header);
            assert_eq!(
                session.records,
                (0..3).map(sample_record).collect::<Vec<_>>()
            );
            let completion = session.completion.unwrap();
            assert_eq!(completion.outcome, SessionOutcome::Completed);
            assert_eq!(completion.frames_written, 3);
        }

        #[tokio::test]
        async fn test_truncated_row_is_ignored() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("crash.csv");
            write_session(&path, 2, false).await;

            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"2026-03-01T12:00:10.003Z,2,10.0").unwrap();

            let session = read_session(&path).unwrap();
            assert_eq!(session.records.len(), 2);
            assert!(session.completion.is_none());
        }

        #[tokio::test]
        async fn test_rows_before_header_rejected() {
            let dir = tempfile::tempdir().unwrap();
            let mut writer = CsvTimeseriesWriter::new();
            writer.open(&dir.path().join("s.csv")).await.unwrap();
            let err = writer.append(&sample_record(0)).await.unwrap_err();
            assert!(matches!(err, DaqError::Storage(_)));
        }

        #[tokio::test]
        async fn test_existing_file_not_overwritten() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("s.csv");
            std::fs::write(&path, "keep me").unwrap();
            let mut writer = CsvTimeseriesWriter::new();
            assert!(writer.open(&path).await.is_err());
            assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep me");
        }
    }
}
