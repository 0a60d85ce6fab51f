//! Directory router: bucket start -> output file path.
//!
//! Paths use a hive-style layout so downstream query engines can prune by
//! station and date:
//!
//! ```text
//! <root>/station=01/year=2024/month=03/day=07/data_1000.parquet          (day)
//! <root>/station=01/year=2024/month=03/day=07/hour=10/data_1000.parquet  (hour)
//! ```
//!
//! Bucket starts are whole minutes and intervals divide a day, so the date
//! plus `HHMM` identifies a bucket uniquely.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

/// File extension of output files.
pub const OUTPUT_EXTENSION: &str = "parquet";

/// How output directories are partitioned below the station directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partitioning {
    Day,
    Hour,
}

impl Partitioning {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "day" | "daily" => Some(Partitioning::Day),
            "hour" | "hourly" => Some(Partitioning::Hour),
            _ => None,
        }
    }
}

impl std::fmt::Display for Partitioning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Partitioning::Day => write!(f, "day"),
            Partitioning::Hour => write!(f, "hour"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryRouter {
    root: PathBuf,
    station_id: String,
    partitioning: Partitioning,
}

impl DirectoryRouter {
    pub fn new(
        root: impl Into<PathBuf>,
        station_id: impl Into<String>,
        partitioning: Partitioning,
    ) -> Self {
        Self {
            root: root.into(),
            station_id: station_id.into(),
            partitioning,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    /// Path of the bucket's file relative to the output root. Pure.
    pub fn relative_path(&self, start: DateTime<Utc>) -> PathBuf {
        let mut path = PathBuf::from(format!("station={}", self.station_id));
        path.push(start.format("year=%Y").to_string());
        path.push(start.format("month=%m").to_string());
        path.push(start.format("day=%d").to_string());
        if self.partitioning == Partitioning::Hour {
            path.push(start.format("hour=%H").to_string());
        }
        path.push(format!("{}.{}", start.format("data_%H%M"), OUTPUT_EXTENSION));
        path
    }

    /// Full path of the bucket's file, creating missing parent directories.
    ///
    /// Directory creation is idempotent: an existing directory is success.
    pub fn path_for(&self, start: DateTime<Utc>) -> io::Result<PathBuf> {
        let path = self.root.join(self.relative_path(start));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(path)
    }
}
