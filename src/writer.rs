//! File writer: sealed bucket -> Parquet file, written atomically.
//!
//! A bucket is pivoted into a [`Frame`] (one row per capture instant, one
//! nullable column per sensor) and written to a hidden temp file next to the
//! final path, fsynced, then renamed into place. A reader of the output tree
//! therefore sees either no file or a complete one, never a partial write.
//!
//! If the final path already holds a file for the same bucket (a retry after a
//! timed-out flush, or a restart inside the same interval), the existing rows
//! are read back and merged so neither write loses data.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array, TimestampMillisecondArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::aggregator::Bucket;
use crate::router::DirectoryRouter;
use crate::sensor::SensorId;

const TIMESTAMP_COLUMN: &str = "timestamp";
const LATITUDE_COLUMN: &str = "latitude";
const LONGITUDE_COLUMN: &str = "longitude";
const TIMEZONE: &str = "UTC";
const TEMP_SUFFIX: &str = ".tmp";

/// Static station attributes written alongside every row.
#[derive(Debug, Clone, PartialEq)]
pub struct StationInfo {
    pub station_id: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl Default for StationInfo {
    fn default() -> Self {
        Self {
            station_id: "01".to_string(),
            latitude: None,
            longitude: None,
        }
    }
}

/// Errors that can occur while writing or reading output files.
#[derive(Debug)]
pub enum WriteError {
    /// Filesystem error (directory creation, temp file, rename)
    Io(io::Error),

    /// Parquet encoding or decoding failed
    Parquet(ParquetError),

    /// Arrow array or record batch construction failed
    Arrow(ArrowError),

    /// An existing file does not have the expected columns
    Schema(String),

    /// The flush did not complete within its deadline
    Timeout,

    /// The blocking flush task panicked or was cancelled
    Task(String),
}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteError::Io(e) => write!(f, "I/O error: {}", e),
            WriteError::Parquet(e) => write!(f, "Parquet error: {}", e),
            WriteError::Arrow(e) => write!(f, "Arrow error: {}", e),
            WriteError::Schema(e) => write!(f, "Unexpected file schema: {}", e),
            WriteError::Timeout => write!(f, "Flush timed out"),
            WriteError::Task(e) => write!(f, "Flush task failed: {}", e),
        }
    }
}

impl std::error::Error for WriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WriteError::Io(e) => Some(e),
            WriteError::Parquet(e) => Some(e),
            WriteError::Arrow(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WriteError {
    fn from(err: io::Error) -> Self {
        WriteError::Io(err)
    }
}

impl From<ParquetError> for WriteError {
    fn from(err: ParquetError) -> Self {
        WriteError::Parquet(err)
    }
}

impl From<ArrowError> for WriteError {
    fn from(err: ArrowError) -> Self {
        WriteError::Arrow(err)
    }
}

/// Result of a successful flush.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushOutcome {
    /// Final path of the written file
    pub path: PathBuf,

    /// Rows in the written file
    pub rows: usize,

    /// Rows carried over from a file already at `path`
    pub merged_rows: usize,

    /// Size of the written file in bytes
    pub bytes: u64,
}

/// Output file schema: timestamp, station coordinates, one column per sensor.
pub fn schema() -> SchemaRef {
    let mut fields = vec![
        Field::new(
            TIMESTAMP_COLUMN,
            DataType::Timestamp(TimeUnit::Millisecond, Some(TIMEZONE.into())),
            false,
        ),
        Field::new(LATITUDE_COLUMN, DataType::Float64, true),
        Field::new(LONGITUDE_COLUMN, DataType::Float64, true),
    ];
    fields.extend(
        SensorId::all()
            .iter()
            .map(|sensor| Field::new(sensor.column(), DataType::Float64, true)),
    );
    Arc::new(Schema::new(fields))
}

/// Columnar view of a bucket: rows keyed by capture time in milliseconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    rows: BTreeMap<i64, Vec<Option<f64>>>,
}

impl Frame {
    /// Pivot a bucket's readings into rows. Two readings of the same sensor at
    /// the same instant: the later one wins.
    pub fn from_bucket(bucket: &Bucket) -> Self {
        let mut frame = Frame::default();
        for reading in &bucket.readings {
            let row = frame.row_mut(reading.captured_at.timestamp_millis());
            row[reading.sensor.index()] = Some(reading.value);
        }
        frame
    }

    fn row_mut(&mut self, ts: i64) -> &mut Vec<Option<f64>> {
        self.rows
            .entry(ts)
            .or_insert_with(|| vec![None; SensorId::all().len()])
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Capture instants in row order.
    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.rows
            .keys()
            .filter_map(|ms| DateTime::<Utc>::from_timestamp_millis(*ms))
            .collect()
    }

    /// One sensor's column in row order.
    pub fn column(&self, sensor: SensorId) -> Vec<Option<f64>> {
        self.rows.values().map(|row| row[sensor.index()]).collect()
    }

    /// Number of non-null cells in one sensor's column.
    pub fn count(&self, sensor: SensorId) -> usize {
        self.rows
            .values()
            .filter(|row| row[sensor.index()].is_some())
            .count()
    }

    /// Fold rows of an older file into this frame. Cells this frame already
    /// has win; missing rows and null cells are filled from `existing`.
    /// Returns the number of rows that came only from `existing`.
    pub fn merge(&mut self, existing: Frame) -> usize {
        let mut carried = 0;
        for (ts, old_row) in existing.rows {
            match self.rows.get_mut(&ts) {
                Some(row) => {
                    for (cell, old) in row.iter_mut().zip(old_row) {
                        if cell.is_none() {
                            *cell = old;
                        }
                    }
                }
                None => {
                    self.rows.insert(ts, old_row);
                    carried += 1;
                }
            }
        }
        carried
    }

    /// Build the record batch written to disk.
    pub fn to_record_batch(&self, station: &StationInfo) -> Result<RecordBatch, WriteError> {
        let n = self.rows.len();
        let timestamps: Vec<i64> = self.rows.keys().copied().collect();

        let mut columns: Vec<ArrayRef> = Vec::with_capacity(3 + SensorId::all().len());
        columns.push(Arc::new(
            TimestampMillisecondArray::from(timestamps).with_timezone(TIMEZONE),
        ));
        columns.push(Arc::new(Float64Array::from(vec![station.latitude; n])));
        columns.push(Arc::new(Float64Array::from(vec![station.longitude; n])));
        for sensor in SensorId::all() {
            columns.push(Arc::new(Float64Array::from(self.column(*sensor))));
        }

        Ok(RecordBatch::try_new(schema(), columns)?)
    }

    /// Append the rows of a record batch read back from disk.
    fn extend_from_batch(&mut self, batch: &RecordBatch) -> Result<(), WriteError> {
        let batch_schema = batch.schema();
        let ts_index = batch_schema
            .index_of(TIMESTAMP_COLUMN)
            .map_err(|_| WriteError::Schema("missing timestamp column".to_string()))?;
        let timestamps = batch
            .column(ts_index)
            .as_any()
            .downcast_ref::<TimestampMillisecondArray>()
            .ok_or_else(|| {
                WriteError::Schema("timestamp column is not millisecond precision".to_string())
            })?;

        // Columns absent from an older file read as all-null.
        let mut sensor_columns: Vec<(usize, &Float64Array)> = Vec::new();
        for sensor in SensorId::all() {
            if let Ok(index) = batch_schema.index_of(sensor.column()) {
                let values = batch
                    .column(index)
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .ok_or_else(|| {
                        WriteError::Schema(format!("column {} is not float64", sensor))
                    })?;
                sensor_columns.push((sensor.index(), values));
            }
        }

        for row in 0..batch.num_rows() {
            if timestamps.is_null(row) {
                continue;
            }
            let cells = self.row_mut(timestamps.value(row));
            for (index, values) in &sensor_columns {
                if !values.is_null(row) {
                    cells[*index] = Some(values.value(row));
                }
            }
        }
        Ok(())
    }
}

/// Writes sealed buckets under the router's output root.
#[derive(Debug, Clone)]
pub struct FileWriter {
    router: DirectoryRouter,
    station: StationInfo,
}

impl FileWriter {
    pub fn new(router: DirectoryRouter, station: StationInfo) -> Self {
        Self { router, station }
    }

    pub fn router(&self) -> &DirectoryRouter {
        &self.router
    }

    pub fn station(&self) -> &StationInfo {
        &self.station
    }

    /// Serialize a bucket to its deterministic path.
    ///
    /// On success the path holds a complete file containing every row of the
    /// bucket (plus rows of any earlier file for the same bucket). On failure
    /// the path is left exactly as it was.
    pub fn flush(&self, bucket: &Bucket) -> Result<FlushOutcome, WriteError> {
        let path = self.router.path_for(bucket.start)?;

        let mut frame = Frame::from_bucket(bucket);
        let merged_rows = if path.exists() {
            let existing = read_frame(&path)?;
            let carried = frame.merge(existing);
            debug!(
                path = %path.display(),
                carried_rows = carried,
                "Merging with existing file for bucket"
            );
            carried
        } else {
            0
        };

        let batch = frame.to_record_batch(&self.station)?;
        let bytes = write_atomic(&path, &batch, self.writer_properties(bucket))?;

        Ok(FlushOutcome {
            path,
            rows: frame.len(),
            merged_rows,
            bytes,
        })
    }

    fn writer_properties(&self, bucket: &Bucket) -> WriterProperties {
        let metadata = vec![
            key_value("created_by", "station-collector"),
            key_value("station_id", &self.station.station_id),
            key_value("bucket_start", &bucket.start.to_rfc3339()),
            key_value("bucket_interval_secs", &bucket.interval.as_secs().to_string()),
        ];
        WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_key_value_metadata(Some(metadata))
            .build()
    }
}

fn key_value(key: &str, value: &str) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(value.to_string()),
    }
}

/// Read an output file back into a frame.
pub fn read_frame(path: &Path) -> Result<Frame, WriteError> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut frame = Frame::default();
    for batch in reader {
        frame.extend_from_batch(&batch?)?;
    }
    Ok(frame)
}

/// Hidden temp path in the same directory as `path`, so the final rename
/// never crosses a filesystem.
fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}{}", name, Uuid::new_v4().simple(), TEMP_SUFFIX))
}

/// Write `batch` to a temp file and rename it onto `path`. Returns the file size.
fn write_atomic(
    path: &Path,
    batch: &RecordBatch,
    props: WriterProperties,
) -> Result<u64, WriteError> {
    let tmp_path = temp_path_for(path);

    let result = write_file(&tmp_path, batch, props).and_then(|bytes| {
        fs::rename(&tmp_path, path)?;
        Ok(bytes)
    });

    match result {
        Ok(bytes) => {
            if let Some(parent) = path.parent() {
                // Persist the directory entry of the renamed file.
                if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
                    debug!(error = %e, dir = %parent.display(), "Directory sync failed");
                }
            }
            Ok(bytes)
        }
        Err(e) => {
            if let Err(remove_err) = fs::remove_file(&tmp_path) {
                if remove_err.kind() != io::ErrorKind::NotFound {
                    warn!(
                        error = %remove_err,
                        path = %tmp_path.display(),
                        "Failed to remove temp file after write error"
                    );
                }
            }
            Err(e)
        }
    }
}

fn write_file(
    tmp_path: &Path,
    batch: &RecordBatch,
    props: WriterProperties,
) -> Result<u64, WriteError> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(tmp_path)?;

    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    if batch.num_rows() > 0 {
        writer.write(batch)?;
    }
    writer.close()?;

    let file = File::open(tmp_path)?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

/// Remove temp files left behind by a process killed mid-flush.
///
/// Only hidden `*.tmp` files are touched; completed output files and
/// directories are never removed. Returns the number of files removed.
pub fn sweep_stale_temp_files(root: &Path) -> io::Result<usize> {
    if !root.is_dir() {
        return Ok(0);
    }

    let mut removed = 0;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
                continue;
            }

            let name = entry.file_name();
            let name = name.to_string_lossy();
            if file_type.is_file() && name.starts_with('.') && name.ends_with(TEMP_SUFFIX) {
                fs::remove_file(entry.path())?;
                warn!(
                    path = %entry.path().display(),
                    "Removed stale temp file from interrupted flush"
                );
                removed += 1;
            }
        }
    }
    Ok(removed)
}
