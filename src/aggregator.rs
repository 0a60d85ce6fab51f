//! Aggregator module for accumulating readings into time-aligned buckets.
//!
//! The aggregator owns exactly one open [`Bucket`]. Readings are appended with
//! [`Aggregator::record`] until the collector detects a rollover and calls
//! [`Aggregator::seal`], which hands the finished bucket out and opens the next
//! one. Nothing here is shared; the collector owns the aggregator outright.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::sensor::{Reading, SensorFamily, SensorId};

/// Time-aligned accumulation window of readings destined for one output file.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    /// Aligned start of the interval (inclusive)
    pub start: DateTime<Utc>,

    /// Length of the interval
    pub interval: Duration,

    /// Readings in the order they were recorded
    pub readings: Vec<Reading>,

    /// Per-family read failures observed while this bucket was open
    pub failures: BTreeMap<String, u32>,

    /// Set once the bucket has been handed out for flushing
    pub sealed: bool,
}

impl Bucket {
    /// Create an empty, open bucket.
    pub fn new(start: DateTime<Utc>, interval: Duration) -> Self {
        Self {
            start,
            interval,
            readings: Vec::new(),
            failures: BTreeMap::new(),
            sealed: false,
        }
    }

    /// End of the interval (exclusive).
    pub fn end(&self) -> DateTime<Utc> {
        self.start + chrono::Duration::seconds(self.interval.as_secs() as i64)
    }

    /// Whether `t` falls inside `[start, end)`.
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Number of readings recorded for one sensor.
    pub fn count_for(&self, sensor: SensorId) -> usize {
        self.readings.iter().filter(|r| r.sensor == sensor).count()
    }

    /// Number of distinct capture instants, i.e. rows in the output file.
    pub fn sample_count(&self) -> usize {
        let mut instants: Vec<DateTime<Utc>> =
            self.readings.iter().map(|r| r.captured_at).collect();
        instants.sort_unstable();
        instants.dedup();
        instants.len()
    }
}

/// Errors that can occur while aggregating.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateError {
    /// The reading's capture time is outside the open bucket
    OutOfBucket {
        captured_at: DateTime<Utc>,
        bucket_start: DateTime<Utc>,
    },
}

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregateError::OutOfBucket {
                captured_at,
                bucket_start,
            } => write!(
                f,
                "Reading captured at {} does not belong to bucket starting {}",
                captured_at.to_rfc3339(),
                bucket_start.to_rfc3339()
            ),
        }
    }
}

impl std::error::Error for AggregateError {}

/// Statistics about aggregation across all buckets.
#[derive(Debug, Clone, Default)]
pub struct AggregatorStats {
    /// Total number of readings accepted
    pub readings_recorded: u64,

    /// Total number of readings rejected as out of bucket
    pub readings_rejected: u64,

    /// Total number of sensor family read failures
    pub sensor_failures: u64,

    /// Number of buckets sealed
    pub buckets_sealed: u64,
}

/// Owner of the open bucket.
pub struct Aggregator {
    bucket: Bucket,
    stats: AggregatorStats,
}

impl Aggregator {
    /// Open an empty bucket at `start`.
    pub fn new(start: DateTime<Utc>, interval: Duration) -> Self {
        Self {
            bucket: Bucket::new(start, interval),
            stats: AggregatorStats::default(),
        }
    }

    /// Append a reading to the open bucket.
    pub fn record(&mut self, reading: Reading) -> Result<(), AggregateError> {
        if !self.bucket.contains(reading.captured_at) {
            self.stats.readings_rejected += 1;
            return Err(AggregateError::OutOfBucket {
                captured_at: reading.captured_at,
                bucket_start: self.bucket.start,
            });
        }

        self.bucket.readings.push(reading);
        self.stats.readings_recorded += 1;
        Ok(())
    }

    /// Note that a sensor family produced nothing this tick.
    pub fn record_failure(&mut self, family: SensorFamily) {
        *self
            .bucket
            .failures
            .entry(family.name().to_string())
            .or_insert(0) += 1;
        self.stats.sensor_failures += 1;
    }

    /// Seal the open bucket and open an empty one at `next_start`.
    pub fn seal(&mut self, next_start: DateTime<Utc>) -> Bucket {
        let interval = self.bucket.interval;
        let mut sealed = std::mem::replace(&mut self.bucket, Bucket::new(next_start, interval));
        sealed.sealed = true;
        self.stats.buckets_sealed += 1;

        debug!(
            bucket_start = %sealed.start.to_rfc3339(),
            readings = sealed.len(),
            next_start = %next_start.to_rfc3339(),
            "Bucket sealed"
        );

        sealed
    }

    /// The open bucket.
    pub fn bucket(&self) -> &Bucket {
        &self.bucket
    }

    pub fn len(&self) -> usize {
        self.bucket.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bucket.is_empty()
    }

    pub fn stats(&self) -> &AggregatorStats {
        &self.stats
    }
}
