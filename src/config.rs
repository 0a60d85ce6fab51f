//! Configuration module for the station collector.
//!
//! This module provides environment-based configuration: where output files go,
//! how they are partitioned, bucket and tick timing, flush retry limits, and
//! which sensors are polled.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::router::Partitioning;
use crate::sensor::SensorFamily;

/// Prefix shared by every configuration variable
const ENV_PREFIX: &str = "STATION_COLLECTOR_";

/// Default output root (relative to the working directory)
const DEFAULT_OUTPUT_ROOT: &str = "output";

/// Default station identifier used for partitioning
const DEFAULT_STATION_ID: &str = "01";

/// Default bucket interval in seconds (one file per minute)
const DEFAULT_BUCKET_INTERVAL_SECS: u64 = 60;

/// Default seconds between sensor reads
const DEFAULT_TICK_INTERVAL_SECS: u64 = 1;

/// Default number of retries for a failed flush before the bucket is dropped
const DEFAULT_MAX_FLUSH_RETRIES: u32 = 3;

/// Default number of consecutive failed flushes treated as unrecoverable
const DEFAULT_FATAL_FLUSH_FAILURES: u32 = 10;

/// Default per-family sensor read deadline in milliseconds
const DEFAULT_SENSOR_TIMEOUT_MS: u64 = 2_000;

/// Default flush deadline in seconds
const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 20;

/// Default BME280 self-heating compensation factor
const DEFAULT_TEMP_COMPENSATION_FACTOR: f64 = 2.25;

/// Default CPU thermal zone used for temperature compensation
const DEFAULT_CPU_TEMP_PATH: &str = "/sys/class/thermal/thermal_zone0/temp";

/// Seconds in a day; bucket intervals must divide it evenly
const SECONDS_PER_DAY: u64 = 86_400;

/// Configuration for the station collector.
///
/// All settings can be configured via `STATION_COLLECTOR_*` environment
/// variables, e.g. `STATION_COLLECTOR_OUTPUT_ROOT=/data/parquet`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the output tree synced to remote storage
    pub output_root: PathBuf,

    /// Station identifier, first partition level
    pub station_id: String,

    /// Directory partitioning below the station
    pub partitioning: Partitioning,

    /// Length of one bucket (one output file)
    pub bucket_interval: Duration,

    /// Time between sensor reads
    pub tick_interval: Duration,

    /// Retries of a failed flush before the bucket is dropped
    pub max_flush_retries: u32,

    /// Consecutive failed flush attempts after which the collector gives up
    pub fatal_flush_failures: u32,

    /// Deadline for one sensor family read
    pub sensor_timeout: Duration,

    /// Deadline for one bucket flush
    pub write_timeout: Duration,

    /// Sensor families to poll
    pub sensors: Vec<SensorFamily>,

    /// Station latitude written into every row
    pub latitude: Option<f64>,

    /// Station longitude written into every row
    pub longitude: Option<f64>,

    /// Whether to correct BME280 temperature for CPU heat
    pub temp_compensation: bool,

    /// Compensation tuning factor
    pub temp_compensation_factor: f64,

    /// Sysfs file holding the CPU temperature in millidegrees
    pub cpu_temp_path: PathBuf,

    /// JSON-lines file receiving a record for every dropped bucket
    pub loss_log: Option<PathBuf>,

    /// Failure probability of the simulated particulate sensor
    pub simulated_failure_rate: f64,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    fn new(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

fn var_name(key: &str) -> String {
    format!("{}{}", ENV_PREFIX, key)
}

/// Raw value of a configuration variable, if set and non-empty.
fn lookup(key: &str) -> Option<String> {
    env::var(var_name(key))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a configuration variable, falling back to `default` when unset.
fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(value) => value.parse().map_err(|_| {
            ConfigError::new(&var_name(key), format!("'{}' is not a valid value", value))
        }),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Returns a new `Config` with values from the environment, falling back
    /// to defaults where a variable is unset.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or is out of range,
    /// in particular if the bucket interval is not a whole number of minutes
    /// dividing a day, or the tick interval is not shorter than the bucket.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use station_collector::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Output root: {}", config.output_root.display());
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let output_root = lookup("OUTPUT_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.output_root);

        let station_id = Self::parse_station_id()?;

        let partitioning = match lookup("PARTITIONING") {
            Some(value) => Partitioning::parse(&value).ok_or_else(|| {
                ConfigError::new(
                    &var_name("PARTITIONING"),
                    format!("'{}' is not one of: day, hour", value),
                )
            })?,
            None => defaults.partitioning,
        };

        let bucket_interval_secs = Self::parse_bucket_interval()?;
        let tick_interval_secs = Self::parse_tick_interval(bucket_interval_secs)?;

        let max_flush_retries = parse_or("MAX_FLUSH_RETRIES", DEFAULT_MAX_FLUSH_RETRIES)?;

        let fatal_flush_failures =
            parse_or("FATAL_FLUSH_FAILURES", DEFAULT_FATAL_FLUSH_FAILURES)?;
        if fatal_flush_failures == 0 {
            return Err(ConfigError::new(
                &var_name("FATAL_FLUSH_FAILURES"),
                "must be greater than 0",
            ));
        }

        let sensor_timeout_ms: u64 = parse_or("SENSOR_TIMEOUT_MS", DEFAULT_SENSOR_TIMEOUT_MS)?;
        if sensor_timeout_ms == 0 || sensor_timeout_ms >= bucket_interval_secs * 1000 {
            return Err(ConfigError::new(
                &var_name("SENSOR_TIMEOUT_MS"),
                format!(
                    "sensor timeout {}ms must be positive and shorter than the bucket interval",
                    sensor_timeout_ms
                ),
            ));
        }

        let write_timeout_secs: u64 = parse_or("WRITE_TIMEOUT_SECS", DEFAULT_WRITE_TIMEOUT_SECS)?;
        if write_timeout_secs == 0 || write_timeout_secs >= bucket_interval_secs {
            return Err(ConfigError::new(
                &var_name("WRITE_TIMEOUT_SECS"),
                format!(
                    "write timeout {}s must be positive and shorter than the bucket interval ({}s)",
                    write_timeout_secs, bucket_interval_secs
                ),
            ));
        }

        let sensors = Self::parse_sensors()?;

        let latitude = Self::parse_coordinate("LATITUDE", 90.0)?;
        let longitude = Self::parse_coordinate("LONGITUDE", 180.0)?;

        let temp_compensation =
            Self::parse_bool("TEMP_COMPENSATION", defaults.temp_compensation)?;
        let temp_compensation_factor =
            parse_or("TEMP_COMPENSATION_FACTOR", DEFAULT_TEMP_COMPENSATION_FACTOR)?;
        if !(temp_compensation_factor > 0.0) || !temp_compensation_factor.is_finite() {
            return Err(ConfigError::new(
                &var_name("TEMP_COMPENSATION_FACTOR"),
                "must be a finite number greater than 0",
            ));
        }

        let cpu_temp_path = lookup("CPU_TEMP_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.cpu_temp_path);

        let loss_log = lookup("LOSS_LOG").map(PathBuf::from);

        let simulated_failure_rate: f64 = parse_or("SIMULATED_FAILURE_RATE", 0.0)?;
        if !(0.0..=1.0).contains(&simulated_failure_rate) {
            return Err(ConfigError::new(
                &var_name("SIMULATED_FAILURE_RATE"),
                "must be between 0.0 and 1.0",
            ));
        }

        Ok(Self {
            output_root,
            station_id,
            partitioning,
            bucket_interval: Duration::from_secs(bucket_interval_secs),
            tick_interval: Duration::from_secs(tick_interval_secs),
            max_flush_retries,
            fatal_flush_failures,
            sensor_timeout: Duration::from_millis(sensor_timeout_ms),
            write_timeout: Duration::from_secs(write_timeout_secs),
            sensors,
            latitude,
            longitude,
            temp_compensation,
            temp_compensation_factor,
            cpu_temp_path,
            loss_log,
            simulated_failure_rate,
        })
    }

    /// Station ids become a path component, so only a safe character set is allowed.
    fn parse_station_id() -> Result<String, ConfigError> {
        let env_var = var_name("STATION_ID");
        let station_id = lookup("STATION_ID").unwrap_or_else(|| DEFAULT_STATION_ID.to_string());

        let valid = station_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ConfigError::new(
                &env_var,
                format!("'{}' may only contain letters, digits, '-' and '_'", station_id),
            ));
        }
        Ok(station_id)
    }

    /// Parse the bucket interval. It must be whole minutes and divide a day so
    /// that `HHMM` names every bucket uniquely and boundaries never drift.
    fn parse_bucket_interval() -> Result<u64, ConfigError> {
        let env_var = var_name("BUCKET_INTERVAL_SECS");
        let interval: u64 = parse_or("BUCKET_INTERVAL_SECS", DEFAULT_BUCKET_INTERVAL_SECS)?;

        if interval == 0 || interval % 60 != 0 {
            return Err(ConfigError::new(
                &env_var,
                format!("bucket interval {} must be a positive multiple of 60", interval),
            ));
        }

        if SECONDS_PER_DAY % interval != 0 {
            return Err(ConfigError::new(
                &env_var,
                format!("bucket interval {} must divide a day evenly", interval),
            ));
        }

        Ok(interval)
    }

    fn parse_tick_interval(bucket_interval_secs: u64) -> Result<u64, ConfigError> {
        let env_var = var_name("TICK_INTERVAL_SECS");
        let interval: u64 = parse_or("TICK_INTERVAL_SECS", DEFAULT_TICK_INTERVAL_SECS)?;

        if interval == 0 {
            return Err(ConfigError::new(&env_var, "tick interval must be greater than 0"));
        }

        if interval >= bucket_interval_secs {
            return Err(ConfigError::new(
                &env_var,
                format!(
                    "tick interval {} must be shorter than the bucket interval ({})",
                    interval, bucket_interval_secs
                ),
            ));
        }

        Ok(interval)
    }

    fn parse_sensors() -> Result<Vec<SensorFamily>, ConfigError> {
        let Some(value) = lookup("SENSORS") else {
            return Ok(SensorFamily::all().to_vec());
        };

        let mut sensors = Vec::new();
        for name in value.split(',').filter(|n| !n.trim().is_empty()) {
            let family = SensorFamily::parse(name).ok_or_else(|| {
                ConfigError::new(&var_name("SENSORS"), format!("unknown sensor '{}'", name.trim()))
            })?;
            if !sensors.contains(&family) {
                sensors.push(family);
            }
        }

        if sensors.is_empty() {
            return Err(ConfigError::new(
                &var_name("SENSORS"),
                "at least one sensor must be enabled",
            ));
        }
        Ok(sensors)
    }

    fn parse_coordinate(key: &str, limit: f64) -> Result<Option<f64>, ConfigError> {
        match lookup(key) {
            Some(_) => {
                let value: f64 = parse_or(key, 0.0)?;
                if !(-limit..=limit).contains(&value) {
                    return Err(ConfigError::new(
                        &var_name(key),
                        format!("{} is outside [-{}, {}]", value, limit, limit),
                    ));
                }
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn parse_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
        match lookup(key) {
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::new(
                    &var_name(key),
                    format!("'{}' is not a valid boolean", value),
                )),
            },
            None => Ok(default),
        }
    }
}

impl Default for Config {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            output_root: PathBuf::from(DEFAULT_OUTPUT_ROOT),
            station_id: DEFAULT_STATION_ID.to_string(),
            partitioning: Partitioning::Day,
            bucket_interval: Duration::from_secs(DEFAULT_BUCKET_INTERVAL_SECS),
            tick_interval: Duration::from_secs(DEFAULT_TICK_INTERVAL_SECS),
            max_flush_retries: DEFAULT_MAX_FLUSH_RETRIES,
            fatal_flush_failures: DEFAULT_FATAL_FLUSH_FAILURES,
            sensor_timeout: Duration::from_millis(DEFAULT_SENSOR_TIMEOUT_MS),
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
            sensors: SensorFamily::all().to_vec(),
            latitude: None,
            longitude: None,
            temp_compensation: true,
            temp_compensation_factor: DEFAULT_TEMP_COMPENSATION_FACTOR,
            cpu_temp_path: PathBuf::from(DEFAULT_CPU_TEMP_PATH),
            loss_log: None,
            simulated_failure_rate: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize the tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // Helper to temporarily set environment variables for testing
    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let key = var_name(key);
            let original = env::var(&key).ok();
            env::set_var(&key, value);
            Self { key, original }
        }

        fn remove(key: &str) -> Self {
            let key = var_name(key);
            let original = env::var(&key).ok();
            env::remove_var(&key);
            Self { key, original }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(val) => env::set_var(&self.key, val),
                None => env::remove_var(&self.key),
            }
        }
    }

    fn clear_all() -> Vec<EnvGuard> {
        [
            "OUTPUT_ROOT",
            "STATION_ID",
            "PARTITIONING",
            "BUCKET_INTERVAL_SECS",
            "TICK_INTERVAL_SECS",
            "MAX_FLUSH_RETRIES",
            "FATAL_FLUSH_FAILURES",
            "SENSOR_TIMEOUT_MS",
            "WRITE_TIMEOUT_SECS",
            "SENSORS",
            "LATITUDE",
            "LONGITUDE",
            "TEMP_COMPENSATION",
            "TEMP_COMPENSATION_FACTOR",
            "CPU_TEMP_PATH",
            "LOSS_LOG",
            "SIMULATED_FAILURE_RATE",
        ]
        .iter()
        .map(|key| EnvGuard::remove(key))
        .collect()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.output_root, PathBuf::from("output"));
        assert_eq!(config.station_id, "01");
        assert_eq!(config.bucket_interval, Duration::from_secs(60));
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.max_flush_retries, 3);
        assert_eq!(config.sensors.len(), 4);
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guards = clear_all();

        let config = Config::from_env().expect("Should load with defaults");
        assert_eq!(config.output_root, PathBuf::from("output"));
        assert_eq!(config.partitioning, Partitioning::Day);
        assert_eq!(config.bucket_interval, Duration::from_secs(60));
        assert_eq!(config.write_timeout, Duration::from_secs(20));
        assert!(config.temp_compensation);
        assert!(config.latitude.is_none());
        assert!(config.loss_log.is_none());
    }

    #[test]
    fn test_config_from_env_custom_values() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guards = clear_all();
        let _g1 = EnvGuard::set("OUTPUT_ROOT", "/data/parquet");
        let _g2 = EnvGuard::set("STATION_ID", "cairo-02");
        let _g3 = EnvGuard::set("PARTITIONING", "hour");
        let _g4 = EnvGuard::set("BUCKET_INTERVAL_SECS", "300");
        let _g5 = EnvGuard::set("TICK_INTERVAL_SECS", "5");
        let _g6 = EnvGuard::set("SENSORS", "bme280, gas");
        let _g7 = EnvGuard::set("LATITUDE", "30.0626");
        let _g8 = EnvGuard::set("LONGITUDE", "31.4916");
        let _g9 = EnvGuard::set("TEMP_COMPENSATION", "off");
        let _g10 = EnvGuard::set("LOSS_LOG", "/var/lib/station/losses.jsonl");

        let config = Config::from_env().expect("Should load custom values");
        assert_eq!(config.output_root, PathBuf::from("/data/parquet"));
        assert_eq!(config.station_id, "cairo-02");
        assert_eq!(config.partitioning, Partitioning::Hour);
        assert_eq!(config.bucket_interval, Duration::from_secs(300));
        assert_eq!(config.tick_interval, Duration::from_secs(5));
        assert_eq!(
            config.sensors,
            vec![SensorFamily::Environment, SensorFamily::Gas]
        );
        assert_eq!(config.latitude, Some(30.0626));
        assert_eq!(config.longitude, Some(31.4916));
        assert!(!config.temp_compensation);
        assert_eq!(
            config.loss_log,
            Some(PathBuf::from("/var/lib/station/losses.jsonl"))
        );
    }

    #[test]
    fn test_bucket_interval_not_whole_minutes() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guards = clear_all();
        let _guard = EnvGuard::set("BUCKET_INTERVAL_SECS", "90");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("multiple of 60"));
    }

    #[test]
    fn test_bucket_interval_must_divide_day() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guards = clear_all();
        let _guard = EnvGuard::set("BUCKET_INTERVAL_SECS", "420");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("divide a day"));
    }

    #[test]
    fn test_tick_interval_must_be_shorter_than_bucket() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guards = clear_all();
        let _guard = EnvGuard::set("TICK_INTERVAL_SECS", "60");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("shorter than the bucket"));
        assert_eq!(
            err.env_var.as_deref(),
            Some("STATION_COLLECTOR_TICK_INTERVAL_SECS")
        );
    }

    #[test]
    fn test_invalid_number() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guards = clear_all();
        let _guard = EnvGuard::set("MAX_FLUSH_RETRIES", "many");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("not a valid value"));
    }

    #[test]
    fn test_unknown_sensor() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guards = clear_all();
        let _guard = EnvGuard::set("SENSORS", "gas,sonar");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("sonar"));
    }

    #[test]
    fn test_station_id_must_be_path_safe() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guards = clear_all();
        let _guard = EnvGuard::set("STATION_ID", "../etc");

        assert!(Config::from_env().is_err());
    }

    #[test]
    fn test_latitude_out_of_range() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guards = clear_all();
        let _guard = EnvGuard::set("LATITUDE", "91");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("outside"));
    }

    #[test]
    fn test_compensation_factor_must_be_finite() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guards = clear_all();

        for value in ["NaN", "inf", "0", "-1.5"] {
            let _guard = EnvGuard::set("TEMP_COMPENSATION_FACTOR", value);
            let err = Config::from_env().unwrap_err();
            assert_eq!(
                err.env_var.as_deref(),
                Some("STATION_COLLECTOR_TEMP_COMPENSATION_FACTOR"),
                "accepted {}",
                value
            );
        }
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError {
            message: "test error".to_string(),
            env_var: Some("TEST_VAR".to_string()),
        };
        assert_eq!(
            format!("{}", error),
            "Configuration error for TEST_VAR: test error"
        );

        let error_no_var = ConfigError {
            message: "general error".to_string(),
            env_var: None,
        };
        assert_eq!(
            format!("{}", error_no_var),
            "Configuration error: general error"
        );
    }
}
