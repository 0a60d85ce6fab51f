//! Collection loop: ticks, samples, and flushes completed buckets.
//!
//! The collector is the single owner of the open bucket. On every tick it asks
//! the [`BucketClock`] whether the interval rolled over; if so it seals the
//! bucket and flushes it, then samples the sensors into the (new) open bucket.
//!
//! Flush failures are retried at the following rollovers with the same data.
//! After `max_flush_retries` retries the bucket is dropped and a [`LossRecord`]
//! is emitted, so data loss is always visible in the log. A run of
//! `fatal_flush_failures` consecutive failed attempts is treated as
//! unrecoverable and stops the loop, leaving the restart to the supervisor.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::aggregator::{Aggregator, Bucket};
use crate::clock::{BucketClock, Observation};
use crate::config::Config;
use crate::router::DirectoryRouter;
use crate::sampler::{Sampler, TemperatureCompensator};
use crate::sensor::SensorReader;
use crate::writer::{self, FileWriter, FlushOutcome, StationInfo, WriteError};

/// Most recent loss records kept in memory for inspection.
const MAX_RETAINED_LOSSES: usize = 100;

/// Lifecycle state of the collection loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectorState {
    /// No tick observed yet
    Idle,
    /// Reading sensors into the open bucket
    Sampling,
    /// Writing sealed buckets
    Flushing,
    /// Terminal: shutdown flush done
    Stopped,
}

/// Errors that stop the collection loop.
#[derive(Debug)]
pub enum CollectorError {
    /// Flushes keep failing; the process should be restarted
    Unrecoverable {
        consecutive_failures: u32,
        last_error: String,
    },
}

impl std::fmt::Display for CollectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectorError::Unrecoverable {
                consecutive_failures,
                last_error,
            } => write!(
                f,
                "Giving up after {} consecutive failed flushes. Last error: {}",
                consecutive_failures, last_error
            ),
        }
    }
}

impl std::error::Error for CollectorError {}

/// Record of a bucket that could not be written and was dropped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LossRecord {
    pub bucket_start: DateTime<Utc>,
    pub path: PathBuf,
    pub readings: usize,
    pub rows: usize,
    pub attempts: u32,
    pub last_error: String,
    pub dropped_at: DateTime<Utc>,
}

/// Statistics about collector operations.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectorStats {
    /// Ticks processed
    pub ticks: u64,

    /// Readings accepted into buckets
    pub readings_recorded: u64,

    /// Sensor family reads that failed
    pub sensor_failures: u64,

    /// Backward wall-clock jumps observed
    pub clock_anomalies: u64,

    /// Ticks not sampled because the open bucket had no capture instant left
    pub ticks_skipped: u64,

    /// Buckets written successfully
    pub buckets_flushed: u64,

    /// Failed flush attempts (including ones later retried successfully)
    pub flush_failures: u64,

    /// Buckets dropped after exhausting retries
    pub buckets_dropped: u64,

    /// Readings lost with dropped buckets
    pub readings_dropped: u64,
}

/// Settings of the loop itself, taken from [`Config`].
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub bucket_interval: Duration,
    pub tick_interval: Duration,
    pub max_flush_retries: u32,
    pub fatal_flush_failures: u32,
    pub write_timeout: Duration,
    pub loss_log: Option<PathBuf>,
}

impl From<&Config> for CollectorSettings {
    fn from(config: &Config) -> Self {
        Self {
            bucket_interval: config.bucket_interval,
            tick_interval: config.tick_interval,
            max_flush_retries: config.max_flush_retries,
            fatal_flush_failures: config.fatal_flush_failures,
            write_timeout: config.write_timeout,
            loss_log: config.loss_log.clone(),
        }
    }
}

/// A sealed bucket waiting to be written.
#[derive(Debug, Clone)]
struct PendingFlush {
    bucket: Arc<Bucket>,
    attempts: u32,
    last_error: String,
}

impl PendingFlush {
    fn new(bucket: Bucket) -> Self {
        Self {
            bucket: Arc::new(bucket),
            attempts: 0,
            last_error: String::new(),
        }
    }
}

/// Summary of the shutdown flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub flushed: usize,
    pub lost: usize,
}

pub struct Collector<R: SensorReader> {
    settings: CollectorSettings,
    clock: BucketClock,
    aggregator: Option<Aggregator>,
    sampler: Sampler<R>,
    writer: Arc<FileWriter>,
    pending: VecDeque<PendingFlush>,
    state: CollectorState,
    stats: CollectorStats,
    consecutive_failures: u32,
    losses: VecDeque<LossRecord>,
    last_captured: Option<DateTime<Utc>>,
}

impl<R: SensorReader> Collector<R> {
    /// Build a collector from configuration and a sensor reader.
    pub fn new(config: &Config, reader: Arc<R>) -> Self {
        let router = DirectoryRouter::new(
            config.output_root.clone(),
            config.station_id.clone(),
            config.partitioning,
        );
        let station = StationInfo {
            station_id: config.station_id.clone(),
            latitude: config.latitude,
            longitude: config.longitude,
        };

        let mut sampler = Sampler::new(reader, config.sensors.clone(), config.sensor_timeout);
        if config.temp_compensation {
            sampler = sampler.with_compensation(TemperatureCompensator::new(
                config.temp_compensation_factor,
                config.cpu_temp_path.clone(),
            ));
        }

        Self {
            settings: CollectorSettings::from(config),
            clock: BucketClock::new(config.bucket_interval),
            aggregator: None,
            sampler,
            writer: Arc::new(FileWriter::new(router, station)),
            pending: VecDeque::new(),
            state: CollectorState::Idle,
            stats: CollectorStats::default(),
            consecutive_failures: 0,
            losses: VecDeque::new(),
            last_captured: None,
        }
    }

    /// Remove temp files left by a previous process killed mid-flush.
    pub fn recover(&self) -> std::io::Result<usize> {
        let removed = writer::sweep_stale_temp_files(self.writer.router().root())?;
        if removed > 0 {
            info!(removed = removed, "Cleaned up interrupted flushes");
        }
        Ok(removed)
    }

    pub fn state(&self) -> CollectorState {
        self.state
    }

    /// The open bucket, once the first tick has happened.
    pub fn open_bucket(&self) -> Option<&Bucket> {
        self.aggregator.as_ref().map(Aggregator::bucket)
    }

    /// Number of sealed buckets waiting for a retry.
    pub fn pending_flushes(&self) -> usize {
        self.pending.len()
    }

    /// Buckets dropped so far (most recent last).
    pub fn losses(&self) -> impl Iterator<Item = &LossRecord> {
        self.losses.iter()
    }

    pub fn stats(&self) -> CollectorStats {
        let mut stats = self.stats.clone();
        if let Some(aggregator) = &self.aggregator {
            stats.readings_recorded = aggregator.stats().readings_recorded;
            stats.sensor_failures = aggregator.stats().sensor_failures;
        }
        stats
    }

    /// Process one tick at wall-clock time `now`.
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> Result<(), CollectorError> {
        self.stats.ticks += 1;

        let observation = self.clock.observe(now);
        match observation {
            Observation::First { start } => {
                info!(bucket_start = %start.to_rfc3339(), "Opened first bucket");
                self.aggregator = Some(Aggregator::new(start, self.settings.bucket_interval));
            }
            Observation::Same { .. } => {}
            Observation::Rollover { closed, opened } => {
                self.state = CollectorState::Flushing;
                let interval = self.settings.bucket_interval;
                let sealed = self
                    .aggregator
                    .get_or_insert_with(|| Aggregator::new(closed, interval))
                    .seal(opened);
                self.pending.push_back(PendingFlush::new(sealed));
                self.drain_pending().await?;
            }
            Observation::Regressed { start, observed } => {
                self.stats.clock_anomalies += 1;
                warn!(
                    open_bucket = %start.to_rfc3339(),
                    observed_bucket = %observed.to_rfc3339(),
                    now = %now.to_rfc3339(),
                    "Wall clock moved backward, keeping current bucket open"
                );
            }
        }

        let Some(captured_at) = self.capture_instant(now) else {
            self.stats.ticks_skipped += 1;
            warn!(
                now = %now.to_rfc3339(),
                last_captured = ?self.last_captured.map(|t| t.to_rfc3339()),
                "No capture instant left in open bucket, skipping tick"
            );
            return Ok(());
        };
        self.last_captured = Some(captured_at);

        self.state = CollectorState::Sampling;
        self.sample(captured_at).await;
        Ok(())
    }

    /// Capture time for a tick at `now`: whole seconds, inside the open
    /// bucket, and strictly after the previous capture so rows never collide.
    /// `None` when the bucket has no second left after the previous capture.
    fn capture_instant(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut captured_at = now.with_nanosecond(0).unwrap_or(now);
        let Some(bucket) = self.open_bucket() else {
            return Some(captured_at);
        };

        captured_at = captured_at.max(bucket.start);
        if let Some(last) = self.last_captured {
            if captured_at <= last {
                captured_at = last + chrono::Duration::seconds(1);
            }
        }
        (captured_at < bucket.end()).then_some(captured_at)
    }

    async fn sample(&mut self, captured_at: DateTime<Utc>) {
        let set = self.sampler.read_all(captured_at).await;

        let Some(aggregator) = self.aggregator.as_mut() else {
            return;
        };
        for reading in set.readings {
            if let Err(e) = aggregator.record(reading) {
                warn!(error = %e, sensor = %reading.sensor, "Reading rejected");
            }
        }
        for (family, e) in &set.failures {
            aggregator.record_failure(*family);
            warn!(
                sensor = %family,
                error = %e,
                captured_at = %captured_at.to_rfc3339(),
                "Sensor read failed, no value this tick"
            );
        }
    }

    /// Attempt every pending bucket once, oldest first.
    async fn drain_pending(&mut self) -> Result<(), CollectorError> {
        let mut retry = VecDeque::new();

        while let Some(mut job) = self.pending.pop_front() {
            job.attempts += 1;
            match self.write(Arc::clone(&job.bucket)).await {
                Ok(outcome) => self.on_flushed(&job, &outcome),
                Err(e) => {
                    self.on_flush_failed(&mut job, &e);
                    if job.attempts > self.settings.max_flush_retries {
                        self.record_loss(job);
                    } else {
                        warn!(
                            bucket_start = %job.bucket.start.to_rfc3339(),
                            error = %e,
                            attempt = job.attempts,
                            max_retries = self.settings.max_flush_retries,
                            "Flush failed, will retry at next bucket boundary"
                        );
                        retry.push_back(job);
                    }
                }
            }
        }
        self.pending = retry;

        if self.consecutive_failures >= self.settings.fatal_flush_failures {
            let last_error = self
                .pending
                .back()
                .map(|job| job.last_error.clone())
                .or_else(|| self.losses.back().map(|loss| loss.last_error.clone()))
                .unwrap_or_else(|| "Unknown error".to_string());
            error!(
                consecutive_failures = self.consecutive_failures,
                error = %last_error,
                "Flush failures are not recovering"
            );
            return Err(CollectorError::Unrecoverable {
                consecutive_failures: self.consecutive_failures,
                last_error,
            });
        }
        Ok(())
    }

    /// Run one flush on the blocking pool under the write deadline.
    async fn write(&self, bucket: Arc<Bucket>) -> Result<FlushOutcome, WriteError> {
        let writer = Arc::clone(&self.writer);
        let task = tokio::task::spawn_blocking(move || writer.flush(&bucket));

        match tokio::time::timeout(self.settings.write_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(WriteError::Task(e.to_string())),
            Err(_) => Err(WriteError::Timeout),
        }
    }

    fn on_flushed(&mut self, job: &PendingFlush, outcome: &FlushOutcome) {
        self.stats.buckets_flushed += 1;
        self.consecutive_failures = 0;
        info!(
            bucket_start = %job.bucket.start.to_rfc3339(),
            path = %outcome.path.display(),
            rows = outcome.rows,
            merged_rows = outcome.merged_rows,
            bytes = outcome.bytes,
            attempt = job.attempts,
            failures = ?job.bucket.failures,
            "Bucket flushed"
        );
    }

    fn on_flush_failed(&mut self, job: &mut PendingFlush, e: &WriteError) {
        self.stats.flush_failures += 1;
        self.consecutive_failures += 1;
        job.last_error = e.to_string();
    }

    fn record_loss(&mut self, job: PendingFlush) {
        let bucket = &job.bucket;
        let router = self.writer.router();
        let record = LossRecord {
            bucket_start: bucket.start,
            path: router.root().join(router.relative_path(bucket.start)),
            readings: bucket.len(),
            rows: bucket.sample_count(),
            attempts: job.attempts,
            last_error: job.last_error.clone(),
            dropped_at: Utc::now(),
        };

        self.stats.buckets_dropped += 1;
        self.stats.readings_dropped += record.readings as u64;

        let json = serde_json::to_string(&record).unwrap_or_else(|_| format!("{:?}", record));
        error!(
            bucket_start = %record.bucket_start.to_rfc3339(),
            readings = record.readings,
            attempts = record.attempts,
            error = %record.last_error,
            loss = %json,
            "Bucket dropped, data lost"
        );

        if let Some(path) = &self.settings.loss_log {
            let appended = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut file| writeln!(file, "{}", json));
            if let Err(e) = appended {
                error!(error = %e, path = %path.display(), "Failed to append loss record");
            }
        }

        if self.losses.len() >= MAX_RETAINED_LOSSES {
            self.losses.pop_front();
        }
        self.losses.push_back(record);
    }

    /// Flush whatever is buffered before the process exits.
    ///
    /// The open bucket (if it has readings) and every queued bucket get one
    /// more attempt; anything that still fails is recorded as lost.
    pub async fn shutdown_flush(&mut self) -> ShutdownReport {
        self.state = CollectorState::Flushing;

        if let Some(aggregator) = self.aggregator.as_mut() {
            if !aggregator.is_empty() {
                let next = aggregator.bucket().end();
                let sealed = aggregator.seal(next);
                info!(
                    bucket_start = %sealed.start.to_rfc3339(),
                    readings = sealed.len(),
                    "Flushing partial bucket on shutdown"
                );
                self.pending.push_back(PendingFlush::new(sealed));
            }
        }

        let mut report = ShutdownReport::default();
        while let Some(mut job) = self.pending.pop_front() {
            job.attempts += 1;
            match self.write(Arc::clone(&job.bucket)).await {
                Ok(outcome) => {
                    self.on_flushed(&job, &outcome);
                    report.flushed += 1;
                }
                Err(e) => {
                    self.on_flush_failed(&mut job, &e);
                    self.record_loss(job);
                    report.lost += 1;
                }
            }
        }

        self.state = CollectorState::Stopped;
        report
    }

    /// Run until `shutdown` fires or flushing becomes unrecoverable.
    ///
    /// Either way the shutdown flush runs before returning.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), CollectorError> {
        let mut ticker = interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            tick_interval_ms = self.settings.tick_interval.as_millis() as u64,
            bucket_interval_secs = self.settings.bucket_interval.as_secs(),
            output_root = %self.writer.router().root().display(),
            "Collection loop started"
        );

        let outcome = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick_at(Utc::now()).await {
                        break Err(e);
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Shutdown signal observed by collection loop");
                    break Ok(());
                }
            }
        };

        let report = self.shutdown_flush().await;
        let stats = self.stats();
        info!(
            flushed = report.flushed,
            lost = report.lost,
            ticks = stats.ticks,
            readings = stats.readings_recorded,
            buckets_flushed = stats.buckets_flushed,
            buckets_dropped = stats.buckets_dropped,
            sensor_failures = stats.sensor_failures,
            "Collection loop stopped"
        );

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::{
        EnvironmentSample, GasSample, LightSample, ParticulateSample, SensorError, SensorFamily,
        SensorId,
    };
    use crate::writer::read_frame;
    use chrono::TimeZone;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    #[derive(Default)]
    struct FixtureSensors {
        gas_times_out: bool,
        /// Gas reads block until this is set
        gas_release: Option<Arc<AtomicBool>>,
    }

    impl SensorReader for FixtureSensors {
        fn read_environment(&self) -> Result<EnvironmentSample, SensorError> {
            Ok(EnvironmentSample {
                temperature: 21.5,
                pressure: 1013.0,
                humidity: 40.0,
            })
        }

        fn read_gas(&self) -> Result<GasSample, SensorError> {
            if let Some(release) = &self.gas_release {
                while !release.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
            if self.gas_times_out {
                return Err(SensorError::Timeout);
            }
            Ok(GasSample {
                oxidised: 10.0,
                reducing: 250.0,
                nh3: 90.0,
            })
        }

        fn read_light(&self) -> Result<LightSample, SensorError> {
            Ok(LightSample {
                lux: 120.0,
                proximity: 0.0,
            })
        }

        fn read_particulates(&self) -> Result<ParticulateSample, SensorError> {
            Err(SensorError::Unavailable)
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 7, h, m, s).unwrap()
    }

    fn test_config(root: &Path) -> Config {
        Config {
            output_root: root.to_path_buf(),
            sensors: vec![SensorFamily::Environment, SensorFamily::Gas],
            temp_compensation: false,
            sensor_timeout: Duration::from_millis(200),
            write_timeout: Duration::from_secs(5),
            ..Config::default()
        }
    }

    fn collector(config: &Config, sensors: FixtureSensors) -> Collector<FixtureSensors> {
        Collector::new(config, Arc::new(sensors))
    }

    fn output_file(root: &Path, h: u32, m: u32) -> PathBuf {
        root.join(format!(
            "station=01/year=2024/month=03/day=07/data_{:02}{:02}.parquet",
            h, m
        ))
    }

    #[tokio::test]
    async fn test_rollover_flushes_bucket() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let mut collector = collector(&config, FixtureSensors::default());
        assert_eq!(collector.state(), CollectorState::Idle);

        collector.tick_at(at(10, 0, 5)).await.unwrap();
        collector.tick_at(at(10, 0, 45)).await.unwrap();
        assert_eq!(collector.state(), CollectorState::Sampling);
        assert!(!output_file(dir.path(), 10, 0).exists());

        collector.tick_at(at(10, 1, 0)).await.unwrap();
        let frame = read_frame(&output_file(dir.path(), 10, 0)).unwrap();
        assert_eq!(frame.timestamps(), vec![at(10, 0, 5), at(10, 0, 45)]);
        assert_eq!(frame.count(SensorId::Temperature), 2);
        assert_eq!(frame.count(SensorId::Nh3), 2);

        // The tick at the boundary belongs to the next bucket.
        let open = collector.open_bucket().unwrap();
        assert_eq!(open.start, at(10, 1, 0));
        assert_eq!(open.sample_count(), 1);
        assert_eq!(collector.stats().buckets_flushed, 1);
    }

    #[tokio::test]
    async fn test_n_rollovers_produce_n_files() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let mut collector = collector(&config, FixtureSensors::default());

        let mut t = at(10, 0, 0);
        while t < at(10, 5, 0) {
            collector.tick_at(t).await.unwrap();
            t += chrono::Duration::seconds(10);
        }
        collector.tick_at(at(10, 5, 0)).await.unwrap();

        assert_eq!(collector.stats().buckets_flushed, 5);
        for minute in 0..5 {
            let frame = read_frame(&output_file(dir.path(), 10, minute)).unwrap();
            assert_eq!(frame.len(), 6);
            for ts in frame.timestamps() {
                assert!(ts >= at(10, minute, 0) && ts < at(10, minute + 1, 0));
            }
        }
        assert!(!output_file(dir.path(), 10, 5).exists());
    }

    #[tokio::test]
    async fn test_gas_timeout_every_tick_still_flushes() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let mut collector = collector(&config, FixtureSensors { gas_times_out: true, ..FixtureSensors::default() });

        collector.tick_at(at(10, 0, 0)).await.unwrap();
        collector.tick_at(at(10, 0, 30)).await.unwrap();
        collector.tick_at(at(10, 1, 0)).await.unwrap();

        let frame = read_frame(&output_file(dir.path(), 10, 0)).unwrap();
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.count(SensorId::Humidity), 2);
        assert_eq!(frame.column(SensorId::Oxidised), vec![None, None]);

        // One failure per failed tick.
        assert_eq!(collector.stats().sensor_failures, 3);
    }

    #[tokio::test]
    async fn test_clock_regression_keeps_readings_in_open_bucket() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let mut collector = collector(&config, FixtureSensors::default());

        collector.tick_at(at(10, 0, 50)).await.unwrap();
        collector.tick_at(at(10, 1, 5)).await.unwrap();
        collector.tick_at(at(10, 0, 58)).await.unwrap();
        assert_eq!(collector.stats().clock_anomalies, 1);

        let open = collector.open_bucket().unwrap();
        assert_eq!(open.start, at(10, 1, 0));
        assert!(open.readings.iter().all(|r| open.contains(r.captured_at)));

        // The closed bucket was written once and not reopened.
        collector.tick_at(at(10, 2, 0)).await.unwrap();
        assert_eq!(collector.stats().buckets_flushed, 2);
        assert_eq!(read_frame(&output_file(dir.path(), 10, 0)).unwrap().len(), 1);
        assert_eq!(read_frame(&output_file(dir.path(), 10, 1)).unwrap().len(), 2);
    }

    #[test]
    fn test_hung_sensor_does_not_starve_flushes() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .max_blocking_threads(4)
            .enable_all()
            .build()
            .unwrap();
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let release = Arc::new(AtomicBool::new(false));
        let mut collector = collector(
            &config,
            FixtureSensors {
                gas_release: Some(Arc::clone(&release)),
                ..FixtureSensors::default()
            },
        );

        runtime.block_on(async {
            for second in 0..8 {
                collector.tick_at(at(10, 0, second)).await.unwrap();
            }
            collector.tick_at(at(10, 1, 0)).await.unwrap();
        });
        release.store(true, Ordering::SeqCst);

        let stats = collector.stats();
        assert_eq!(stats.buckets_flushed, 1);
        assert_eq!(stats.flush_failures, 0);
        assert_eq!(stats.sensor_failures, 9);
        assert_eq!(collector.pending_flushes(), 0);

        let frame = read_frame(&output_file(dir.path(), 10, 0)).unwrap();
        assert_eq!(frame.len(), 8);
        assert_eq!(frame.count(SensorId::Humidity), 8);
        assert_eq!(frame.count(SensorId::Oxidised), 0);
    }

    #[tokio::test]
    async fn test_backward_jump_keeps_every_tick_as_a_row() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let mut collector = collector(&config, FixtureSensors::default());

        collector.tick_at(at(10, 1, 5)).await.unwrap();
        for second in 25..35 {
            collector.tick_at(at(10, 0, second)).await.unwrap();
        }
        // Clock caught up again, onto an instant already used.
        collector.tick_at(at(10, 1, 10)).await.unwrap();
        collector.tick_at(at(10, 2, 0)).await.unwrap();

        assert_eq!(collector.stats().clock_anomalies, 10);
        let frame = read_frame(&output_file(dir.path(), 10, 1)).unwrap();
        assert_eq!(frame.len(), 12);
        assert_eq!(frame.count(SensorId::Temperature), 12);

        let timestamps = frame.timestamps();
        assert_eq!(timestamps[0], at(10, 1, 5));
        assert_eq!(timestamps[11], at(10, 1, 16));
        assert!(timestamps.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn test_tick_skipped_when_open_bucket_is_full() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let mut collector = collector(&config, FixtureSensors::default());

        collector.tick_at(at(10, 1, 59)).await.unwrap();
        collector.tick_at(at(10, 1, 30)).await.unwrap();

        let stats = collector.stats();
        assert_eq!(stats.ticks, 2);
        assert_eq!(stats.ticks_skipped, 1);
        assert_eq!(collector.open_bucket().unwrap().sample_count(), 1);
    }

    #[tokio::test]
    async fn test_flush_over_deadline_is_retried() {
        let dir = tempdir().unwrap();
        let config = Config {
            write_timeout: Duration::ZERO,
            ..test_config(dir.path())
        };
        let mut collector = collector(&config, FixtureSensors::default());

        collector.tick_at(at(10, 0, 10)).await.unwrap();
        collector.tick_at(at(10, 1, 0)).await.unwrap();
        assert_eq!(collector.pending_flushes(), 1);
        assert_eq!(collector.stats().flush_failures, 1);
        assert_eq!(collector.stats().buckets_flushed, 0);
        assert_eq!(collector.pending[0].last_error, WriteError::Timeout.to_string());

        // The abandoned write may still land; the retry merges with it.
        tokio::time::sleep(Duration::from_millis(200)).await;
        collector.settings.write_timeout = Duration::from_secs(5);
        collector.tick_at(at(10, 2, 0)).await.unwrap();

        assert_eq!(collector.pending_flushes(), 0);
        assert_eq!(collector.stats().buckets_flushed, 2);
        let path = output_file(dir.path(), 10, 0);
        let frame = read_frame(&path).unwrap();
        assert_eq!(frame.timestamps(), vec![at(10, 0, 10)]);
        assert_eq!(frame.count(SensorId::Nh3), 1);

        let names: Vec<String> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|name| !name.ends_with(".tmp")));
        assert_eq!(names.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_flush_is_retried_with_same_data() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("out");
        std::fs::write(&root, b"blocker").unwrap();
        let config = test_config(&root);
        let mut collector = collector(&config, FixtureSensors::default());

        collector.tick_at(at(10, 0, 10)).await.unwrap();
        collector.tick_at(at(10, 1, 10)).await.unwrap();
        assert_eq!(collector.pending_flushes(), 1);
        assert_eq!(collector.stats().flush_failures, 1);

        // Disk comes back; the queued bucket is written at the next boundary.
        std::fs::remove_file(&root).unwrap();
        collector.tick_at(at(10, 2, 0)).await.unwrap();

        assert_eq!(collector.pending_flushes(), 0);
        assert_eq!(collector.stats().buckets_flushed, 2);
        let frame = read_frame(&output_file(&root, 10, 0)).unwrap();
        assert_eq!(frame.timestamps(), vec![at(10, 0, 10)]);
        assert!(output_file(&root, 10, 1).exists());
    }

    #[tokio::test]
    async fn test_bucket_dropped_after_retries_with_loss_record() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("out");
        std::fs::write(&root, b"blocker").unwrap();
        let loss_log = dir.path().join("losses.jsonl");
        let config = Config {
            max_flush_retries: 1,
            loss_log: Some(loss_log.clone()),
            ..test_config(&root)
        };
        let mut collector = collector(&config, FixtureSensors::default());

        collector.tick_at(at(10, 0, 10)).await.unwrap();
        collector.tick_at(at(10, 1, 0)).await.unwrap();
        collector.tick_at(at(10, 2, 0)).await.unwrap();

        let losses: Vec<&LossRecord> = collector.losses().collect();
        assert_eq!(losses.len(), 1);
        assert_eq!(losses[0].bucket_start, at(10, 0, 0));
        assert_eq!(losses[0].attempts, 2);
        assert_eq!(losses[0].readings, 7);
        assert_eq!(collector.stats().buckets_dropped, 1);

        let logged = std::fs::read_to_string(&loss_log).unwrap();
        assert_eq!(logged.lines().count(), 1);
        let record: serde_json::Value = serde_json::from_str(logged.trim()).unwrap();
        assert_eq!(record["attempts"], 2);
        assert_eq!(record["readings"], 7);
    }

    #[tokio::test]
    async fn test_repeated_failures_are_unrecoverable() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("out");
        std::fs::write(&root, b"blocker").unwrap();
        let config = Config {
            fatal_flush_failures: 2,
            ..test_config(&root)
        };
        let mut collector = collector(&config, FixtureSensors::default());

        collector.tick_at(at(10, 0, 10)).await.unwrap();
        collector.tick_at(at(10, 1, 0)).await.unwrap();
        let result = collector.tick_at(at(10, 2, 0)).await;

        assert!(matches!(
            result,
            Err(CollectorError::Unrecoverable {
                consecutive_failures: 3,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_partial_bucket() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let mut collector = collector(&config, FixtureSensors::default());

        collector.tick_at(at(10, 0, 5)).await.unwrap();
        collector.tick_at(at(10, 0, 20)).await.unwrap();

        let report = collector.shutdown_flush().await;
        assert_eq!(report, ShutdownReport { flushed: 1, lost: 0 });
        assert_eq!(collector.state(), CollectorState::Stopped);
        assert_eq!(read_frame(&output_file(dir.path(), 10, 0)).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_restart_in_same_bucket_merges() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());

        let mut first = collector(&config, FixtureSensors::default());
        first.tick_at(at(10, 0, 5)).await.unwrap();
        first.shutdown_flush().await;

        let mut second = collector(&config, FixtureSensors::default());
        second.tick_at(at(10, 0, 40)).await.unwrap();
        second.tick_at(at(10, 1, 0)).await.unwrap();

        let frame = read_frame(&output_file(dir.path(), 10, 0)).unwrap();
        assert_eq!(frame.timestamps(), vec![at(10, 0, 5), at(10, 0, 40)]);
    }

    #[tokio::test]
    async fn test_shutdown_with_nothing_buffered() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let mut collector = collector(&config, FixtureSensors::default());

        let report = collector.shutdown_flush().await;
        assert_eq!(report, ShutdownReport::default());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_signal() {
        let dir = tempdir().unwrap();
        let config = Config {
            tick_interval: Duration::from_millis(10),
            ..test_config(dir.path())
        };
        let mut collector = collector(&config, FixtureSensors::default());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let result = collector.run(rx).await;
            (result, collector)
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let (result, collector) = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop should stop promptly")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(collector.state(), CollectorState::Stopped);
        assert!(collector.stats().ticks > 0);
        assert!(collector.stats().buckets_flushed >= 1);
    }

    #[test]
    fn test_collector_error_display() {
        let err = CollectorError::Unrecoverable {
            consecutive_failures: 4,
            last_error: "No space left on device".to_string(),
        };
        let message = format!("{}", err);
        assert!(message.contains("4"));
        assert!(message.contains("No space left"));
    }
}
