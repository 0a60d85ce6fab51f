//! Station Collector Library
//!
//! This library provides the components of a weather-station sampling
//! pipeline that writes fixed-interval buckets of readings to Parquet:
//!
//! - **sensor**: Sensor identifiers, the driver trait, and simulated sensors
//! - **sampler**: Concurrent per-tick sensor reads with timeouts
//! - **clock**: Epoch-aligned bucket boundaries and rollover detection
//! - **aggregator**: The open bucket of readings
//! - **router**: Hive-style output paths per bucket
//! - **writer**: Atomic Parquet flushes
//! - **collector**: The tick loop with retries, loss records, and shutdown flush
//! - **config**: Environment-based configuration
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use station_collector::collector::Collector;
//! use station_collector::config::Config;
//! use station_collector::sensor::SimulatedSensors;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Load configuration from environment
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     // Sensors and collector
//!     let sensors = Arc::new(SimulatedSensors::with_defaults());
//!     let mut collector = Collector::new(&config, sensors);
//!     collector.recover().ok();
//!
//!     // Run until the sender fires
//!     let (_tx, rx) = tokio::sync::watch::channel(false);
//!     collector.run(rx).await.ok();
//! }
//! ```

// Module declarations
pub mod aggregator;
pub mod clock;
pub mod collector;
pub mod config;
pub mod router;
pub mod sampler;
pub mod sensor;
pub mod writer;

// Re-export commonly used types at crate root for convenience
pub use aggregator::{AggregateError, Aggregator, AggregatorStats, Bucket};
pub use clock::{BucketClock, Observation};
pub use collector::{
    Collector, CollectorError, CollectorState, CollectorStats, LossRecord, ShutdownReport,
};
pub use config::{Config, ConfigError};
pub use router::{DirectoryRouter, Partitioning};
pub use sampler::{SampleSet, Sampler, TemperatureCompensator};
pub use sensor::{
    Reading, SensorError, SensorFamily, SensorId, SensorReader, SimulatedSensors,
    SimulationConfig,
};
pub use writer::{FileWriter, FlushOutcome, Frame, StationInfo, WriteError};
