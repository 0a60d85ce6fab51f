//! Station Collector - sensor sampling service for a weather station
//!
//! This service samples the station's sensors on a fixed tick, groups readings
//! into wall-clock buckets, and writes each completed bucket to a Parquet file
//! under a Hive-style directory tree.
//!
//! ## Features
//!
//! - Concurrent sensor reads with per-family timeouts
//! - Atomic file writes (readers never see a partial file)
//! - Flush retries at the next bucket boundary, with loss records
//! - Final flush on SIGINT/SIGTERM
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `STATION_COLLECTOR_OUTPUT_ROOT`: Output directory (default: output)
//! - `STATION_COLLECTOR_STATION_ID`: Station identifier (default: 01)
//! - `STATION_COLLECTOR_PARTITIONING`: `day` or `hour` (default: day)
//! - `STATION_COLLECTOR_BUCKET_INTERVAL_SECS`: Bucket length (default: 60)
//! - `STATION_COLLECTOR_TICK_INTERVAL_SECS`: Sampling period (default: 1)
//! - `STATION_COLLECTOR_MAX_FLUSH_RETRIES`: Retries before a bucket is dropped (default: 3)
//! - `STATION_COLLECTOR_FATAL_FLUSH_FAILURES`: Consecutive failures before exiting (default: 10)
//! - `STATION_COLLECTOR_SENSORS`: Comma-separated sensor families (default: all)
//! - `STATION_COLLECTOR_LOSS_LOG`: JSON-lines file for loss records (default: none)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use station_collector::collector::{Collector, CollectorError};
use station_collector::config::Config;
use station_collector::sensor::{SimulatedSensors, SimulationConfig};

/// Exit code after a clean stop
const EXIT_OK: i32 = 0;

/// Exit code when flushing became unrecoverable or buffered data may be lost
const EXIT_UNRECOVERABLE: i32 = 1;

/// Upper bound on the final flush after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting Station Collector service...");

    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                output_root = %config.output_root.display(),
                station_id = %config.station_id,
                partitioning = %config.partitioning,
                bucket_interval_secs = config.bucket_interval.as_secs(),
                tick_interval_secs = config.tick_interval.as_secs(),
                max_flush_retries = config.max_flush_retries,
                sensors = ?config.sensors,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let sensors = Arc::new(SimulatedSensors::new(SimulationConfig {
        particulate_failure_rate: config.simulated_failure_rate,
    }));
    info!("Sensors initialized");

    let mut collector = Collector::new(&config, sensors);
    if let Err(e) = collector.recover() {
        warn!(error = %e, "Could not clean up interrupted flushes");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut collector_handle = tokio::spawn(async move { collector.run(shutdown_rx).await });

    info!("Station Collector running. Press Ctrl+C to stop.");
    let code = tokio::select! {
        joined = &mut collector_handle => exit_code(joined),
        _ = wait_for_signal() => {
            info!("Shutdown signal received, flushing buffered readings...");
            let _ = shutdown_tx.send(true);
            finish_shutdown(&mut collector_handle, SHUTDOWN_GRACE).await
        }
    };

    if code != EXIT_OK {
        std::process::exit(code);
    }
}

/// Map the collector task's outcome to the process exit code.
fn exit_code(joined: Result<Result<(), CollectorError>, JoinError>) -> i32 {
    match joined {
        Ok(Ok(())) => {
            info!("Station Collector stopped");
            EXIT_OK
        }
        Ok(Err(e)) => {
            error!(error = %e, "Collector stopped, exiting for restart");
            EXIT_UNRECOVERABLE
        }
        Err(e) => {
            error!(error = %e, "Collector task panicked");
            EXIT_UNRECOVERABLE
        }
    }
}

/// Wait up to `grace` for the final flush after the shutdown signal.
async fn finish_shutdown(
    handle: &mut JoinHandle<Result<(), CollectorError>>,
    grace: Duration,
) -> i32 {
    match tokio::time::timeout(grace, &mut *handle).await {
        Ok(joined) => exit_code(joined),
        Err(_) => {
            error!(
                grace_secs = grace.as_secs(),
                "Final flush did not finish in time, buffered readings may be lost"
            );
            handle.abort();
            EXIT_UNRECOVERABLE
        }
    }
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Resolve on SIGINT, or SIGTERM on unix.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
