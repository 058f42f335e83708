//! HDF5 session writer.
//!
//! Rows are buffered in memory and appended on every flush to one growable 1-D dataset
//! per numeric column under `timeseries/`:
//!
//! ```text
//! session.h5
//! ├── @session_header      (JSON, written once)
//! ├── @completion          (JSON, written on finalize)
//! └── timeseries/
//!     ├── timestamp_ns         [n]
//!     ├── frame_index          [n]
//!     ├── recording_elapsed_sec [n]
//!     └── ...
//! ```
//!
//! Every column has the same length after each flush. Rows already written are never
//! rewritten. Text columns are stored as codes (`led_type`: off 0, ir 1, white 2,
//! dual 3; `phase`: dark 0, light 1, continuous 2); missing environment values are NaN.

use crate::core::LedType;
use crate::data::record::{CompletionStatus, FrameRecord, SessionHeader};
use crate::data::storage::TimeseriesWriter;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use hdf5::types::VarLenUnicode;
use hdf5::{Extent, File, Group, H5Type};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

const COLUMN_CHUNK: usize = 1024;

fn storage_err(e: impl std::fmt::Display) -> DaqError {
    DaqError::Storage(e.to_string())
}

fn led_code(led: LedType) -> u8 {
    match led {
        LedType::Off => 0,
        LedType::Ir => 1,
        LedType::White => 2,
        LedType::Dual => 3,
    }
}

fn timestamp_ns(record: &FrameRecord) -> AppResult<i64> {
    record.timestamp.timestamp_nanos_opt().ok_or_else(|| {
        DaqError::Storage(format!(
            "frame {} timestamp {} is outside the nanosecond range",
            record.frame_index, record.timestamp
        ))
    })
}

/// Append `values` to the end of a resizable column, creating it on first use.
fn append_column<T: H5Type>(group: &Group, name: &str, values: &[T]) -> AppResult<()> {
    let dataset = match group.dataset(name) {
        Ok(dataset) => dataset,
        Err(_) => group
            .new_dataset::<T>()
            .shape(Extent::resizable(0))
            .chunk((COLUMN_CHUNK,))
            .create(name)
            .map_err(storage_err)?,
    };
    let old_size = dataset.size();
    let new_size = old_size + values.len();
    dataset.resize(new_size).map_err(storage_err)?;
    dataset
        .write_slice(values, old_size..new_size)
        .map_err(storage_err)
}

/// HDF5 writer for a single session file.
#[derive(Default)]
pub struct Hdf5TimeseriesWriter {
    path: PathBuf,
    file: Option<File>,
    header_written: bool,
    pending: Vec<FrameRecord>,
    rows_written: usize,
}

impl Hdf5TimeseriesWriter {
    /// Create an unopened writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows appended to the column datasets so far.
    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    fn file(&self) -> AppResult<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| DaqError::Storage("HDF5 session is not open".to_string()))
    }

    fn write_json_attr(&self, name: &str, json: &str) -> AppResult<()> {
        let value = VarLenUnicode::from_str(json).map_err(storage_err)?;
        self.file()?
            .new_attr::<VarLenUnicode>()
            .create(name)
            .and_then(|attr| attr.write_scalar(&value))
            .map_err(storage_err)
    }

    fn write_pending(&mut self) -> AppResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let file = self.file()?;
        let timeseries: Group = match file.group("timeseries") {
            Ok(group) => group,
            Err(_) => file.create_group("timeseries").map_err(storage_err)?,
        };

        let rows = &self.pending;
        let timestamps = rows.iter().map(timestamp_ns).collect::<AppResult<Vec<i64>>>()?;
        append_column(&timeseries, "timestamp_ns", &timestamps)?;

        macro_rules! column {
            ($name:literal, $ty:ty, $map:expr) => {{
                let values: Vec<$ty> = rows.iter().map($map).collect();
                append_column(&timeseries, $name, &values)?;
            }};
        }

        column!("frame_index", u64, |r| r.frame_index);
        column!("recording_elapsed_sec", f64, |r| r.recording_elapsed_sec);
        column!("actual_interval_sec", f64, |r| r.actual_interval_sec);
        column!("expected_interval_sec", f64, |r| r.expected_interval_sec);
        column!("temperature_celsius", f32, |r| r
            .temperature_celsius
            .unwrap_or(f32::NAN));
        column!("humidity_percent", f32, |r| r
            .humidity_percent
            .unwrap_or(f32::NAN));
        column!("led_type", u8, |r| led_code(r.led_type));
        column!("led_power", u8, |r| r.led_power);
        column!("ir_led_power", u8, |r| r.ir_led_power);
        column!("white_led_power", u8, |r| r.white_led_power);
        column!("phase", u8, |r| r.phase.code());
        column!("phase_transition", u8, |r| u8::from(r.phase_transition));
        column!("cycle_number", u32, |r| r.cycle_number);
        column!("frame_mean_intensity", f64, |r| r.frame_mean_intensity);
        column!("sync_success", u8, |r| u8::from(r.sync_success));
        column!("led_stabilization_ms", u32, |r| r.led_stabilization_ms);
        column!("exposure_ms", u32, |r| r.exposure_ms);
        column!("capture_duration_ms", f64, |r| r.capture_duration_ms);

        file.flush().map_err(storage_err)?;
        self.rows_written += rows.len();
        debug!(rows = rows.len(), total = self.rows_written, "HDF5 rows appended");
        self.pending.clear();
        Ok(())
    }
}

#[async_trait]
impl TimeseriesWriter for Hdf5TimeseriesWriter {
    async fn open(&mut self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(storage_err)?;
            }
        }
        if path.exists() {
            return Err(DaqError::Storage(format!(
                "HDF5 file '{}' already exists",
                path.display()
            )));
        }
        self.file = Some(File::create(path).map_err(storage_err)?);
        self.path = path.to_path_buf();
        info!("HDF5 writer opened '{}'", self.path.display());
        Ok(())
    }

    async fn write_header(&mut self, header: &SessionHeader) -> AppResult<()> {
        if self.header_written {
            return Err(DaqError::Storage(
                "HDF5 session header already written".to_string(),
            ));
        }
        let json = serde_json::to_string(header)?;
        self.write_json_attr("session_header", &json)?;
        self.header_written = true;
        Ok(())
    }

    async fn append(&mut self, record: &FrameRecord) -> AppResult<()> {
        if !self.header_written {
            return Err(DaqError::Storage(
                "HDF5 session has no header yet".to_string(),
            ));
        }
        timestamp_ns(record)?;
        self.pending.push(record.clone());
        Ok(())
    }

    async fn flush(&mut self) -> AppResult<()> {
        self.write_pending()
    }

    async fn finalize(&mut self, status: &CompletionStatus) -> AppResult<()> {
        self.write_pending()?;
        let json = serde_json::to_string(status)?;
        self.write_json_attr("completion", &json)?;
        if let Some(file) = self.file.take() {
            file.flush().map_err(storage_err)?;
        }
        info!("HDF5 writer finalized '{}'", self.path.display());
        Ok(())
    }

    fn extension(&self) -> &'static str {
        "h5"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::record::tests::{sample_config, sample_record};
    use crate::data::record::SessionOutcome;

    fn completion(frames_written: u64) -> CompletionStatus {
        CompletionStatus {
            outcome: SessionOutcome::Stopped,
            frames_written,
            frames_dropped: 0,
            phase_transitions: 0,
            finished_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_hdf5_flushes_extend_one_dataset_per_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.h5");

        let mut writer = Hdf5TimeseriesWriter::new();
        writer.open(&path).await.unwrap();
        writer
            .write_header(&SessionHeader::new(sample_config()))
            .await
            .unwrap();
        writer.append(&sample_record(0)).await.unwrap();
        writer.flush().await.unwrap();
        writer.append(&sample_record(1)).await.unwrap();
        writer.finalize(&completion(2)).await.unwrap();
        assert_eq!(writer.rows_written(), 2);

        let file = File::open(&path).unwrap();
        let timeseries = file.group("timeseries").unwrap();
        assert!(timeseries.groups().unwrap().is_empty());
        let columns = timeseries.datasets().unwrap();
        assert_eq!(columns.len(), 19);
        for dataset in &columns {
            assert_eq!(dataset.shape(), vec![2], "{}", dataset.name());
        }

        let frames: Vec<u64> = timeseries.dataset("frame_index").unwrap().read_raw().unwrap();
        assert_eq!(frames, [0, 1]);
        let humidity: Vec<f32> = timeseries
            .dataset("humidity_percent")
            .unwrap()
            .read_raw()
            .unwrap();
        assert_eq!(humidity[0], 55.0);
        assert!(humidity[1].is_nan());
        assert!(file.attr("completion").is_ok());
    }

    #[tokio::test]
    async fn test_hdf5_rejects_timestamp_outside_nanosecond_range() {
        use chrono::TimeZone;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.h5");

        let mut writer = Hdf5TimeseriesWriter::new();
        writer.open(&path).await.unwrap();
        writer
            .write_header(&SessionHeader::new(sample_config()))
            .await
            .unwrap();

        let mut record = sample_record(0);
        record.timestamp = chrono::Utc.with_ymd_and_hms(2300, 1, 1, 0, 0, 0).unwrap();
        let err = writer.append(&record).await.unwrap_err();
        assert!(matches!(err, DaqError::Storage(_)));

        writer.append(&sample_record(1)).await.unwrap();
        writer.finalize(&completion(1)).await.unwrap();
        assert_eq!(writer.rows_written(), 1);
    }
}
