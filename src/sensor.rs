//! Sensor module: reading types and the sensor capability interface.
//!
//! The physical drivers (BME280, MICS6814 gas ADC, LTR559, PMS5003) live
//! outside this crate. The collector only talks to them through
//! [`SensorReader`], one method per sensor family, so tests and hosts without
//! the hardware can substitute [`SimulatedSensors`] or a fixture.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Every scalar the station records, in output column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorId {
    Temperature,
    RawTemperature,
    Pressure,
    Humidity,
    Oxidised,
    Reducing,
    Nh3,
    Lux,
    Proximity,
    Pm1,
    Pm2_5,
    Pm10,
    Particles03um,
    Particles05um,
    Particles10um,
    Particles25um,
    Particles50um,
    Particles100um,
}

impl SensorId {
    /// Get all sensor ids, in column order.
    pub fn all() -> &'static [SensorId] {
        &[
            SensorId::Temperature,
            SensorId::RawTemperature,
            SensorId::Pressure,
            SensorId::Humidity,
            SensorId::Oxidised,
            SensorId::Reducing,
            SensorId::Nh3,
            SensorId::Lux,
            SensorId::Proximity,
            SensorId::Pm1,
            SensorId::Pm2_5,
            SensorId::Pm10,
            SensorId::Particles03um,
            SensorId::Particles05um,
            SensorId::Particles10um,
            SensorId::Particles25um,
            SensorId::Particles50um,
            SensorId::Particles100um,
        ]
    }

    /// Position in [`SensorId::all`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Column name used in output files.
    pub fn column(&self) -> &'static str {
        match self {
            SensorId::Temperature => "temperature",
            SensorId::RawTemperature => "raw_temperature",
            SensorId::Pressure => "pressure",
            SensorId::Humidity => "humidity",
            SensorId::Oxidised => "oxidised",
            SensorId::Reducing => "reducing",
            SensorId::Nh3 => "nh3",
            SensorId::Lux => "lux",
            SensorId::Proximity => "proximity",
            SensorId::Pm1 => "pm1",
            SensorId::Pm2_5 => "pm2_5",
            SensorId::Pm10 => "pm10",
            SensorId::Particles03um => "particles_03um",
            SensorId::Particles05um => "particles_05um",
            SensorId::Particles10um => "particles_10um",
            SensorId::Particles25um => "particles_25um",
            SensorId::Particles50um => "particles_50um",
            SensorId::Particles100um => "particles_100um",
        }
    }

    /// The physical sensor that produces this value.
    pub fn family(&self) -> SensorFamily {
        match self {
            SensorId::Temperature
            | SensorId::RawTemperature
            | SensorId::Pressure
            | SensorId::Humidity => SensorFamily::Environment,
            SensorId::Oxidised | SensorId::Reducing | SensorId::Nh3 => SensorFamily::Gas,
            SensorId::Lux | SensorId::Proximity => SensorFamily::Light,
            _ => SensorFamily::Particulate,
        }
    }
}

impl std::fmt::Display for SensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.column())
    }
}

/// A physical sensor, read as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorFamily {
    /// BME280: temperature, pressure, humidity
    Environment,
    /// Analog gas sensor: oxidising, reducing, NH3 resistances
    Gas,
    /// LTR559: lux, proximity
    Light,
    /// PMS5003: mass concentrations and particle counts
    Particulate,
}

impl SensorFamily {
    pub fn all() -> &'static [SensorFamily] {
        &[
            SensorFamily::Environment,
            SensorFamily::Gas,
            SensorFamily::Light,
            SensorFamily::Particulate,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            SensorFamily::Environment => "environment",
            SensorFamily::Gas => "gas",
            SensorFamily::Light => "light",
            SensorFamily::Particulate => "particulate",
        }
    }

    /// Parse a family name as used in configuration.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "environment" | "bme280" => Some(SensorFamily::Environment),
            "gas" => Some(SensorFamily::Gas),
            "light" | "ltr559" => Some(SensorFamily::Light),
            "particulate" | "pms5003" => Some(SensorFamily::Particulate),
            _ => None,
        }
    }
}

impl std::fmt::Display for SensorFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One sensor's scalar value at a capture instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub sensor: SensorId,
    pub value: f64,
    pub captured_at: DateTime<Utc>,
}

impl Reading {
    pub fn new(sensor: SensorId, value: f64, captured_at: DateTime<Utc>) -> Self {
        Self {
            sensor,
            value,
            captured_at,
        }
    }
}

/// BME280 sample. Temperature is the raw, uncompensated value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvironmentSample {
    pub temperature: f64,
    pub pressure: f64,
    pub humidity: f64,
}

/// Gas sensor resistances in kilo-ohms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GasSample {
    pub oxidised: f64,
    pub reducing: f64,
    pub nh3: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightSample {
    pub lux: f64,
    pub proximity: f64,
}

/// PMS5003 frame: ug/m3 concentrations and particles per litre of air.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticulateSample {
    pub pm1: f64,
    pub pm2_5: f64,
    pub pm10: f64,
    pub particles_03um: f64,
    pub particles_05um: f64,
    pub particles_10um: f64,
    pub particles_25um: f64,
    pub particles_50um: f64,
    pub particles_100um: f64,
}

impl ParticulateSample {
    pub fn values(&self) -> [(SensorId, f64); 9] {
        [
            (SensorId::Pm1, self.pm1),
            (SensorId::Pm2_5, self.pm2_5),
            (SensorId::Pm10, self.pm10),
            (SensorId::Particles03um, self.particles_03um),
            (SensorId::Particles05um, self.particles_05um),
            (SensorId::Particles10um, self.particles_10um),
            (SensorId::Particles25um, self.particles_25um),
            (SensorId::Particles50um, self.particles_50um),
            (SensorId::Particles100um, self.particles_100um),
        ]
    }
}

/// Errors a sensor read can produce. All of them are non-fatal to the collector.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorError {
    /// The read did not complete within its deadline
    Timeout,

    /// Bus or protocol error reported by the driver
    Bus(String),

    /// The sensor is not present or failed to initialize
    Unavailable,
}

impl std::fmt::Display for SensorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorError::Timeout => write!(f, "Sensor read timed out"),
            SensorError::Bus(e) => write!(f, "Sensor bus error: {}", e),
            SensorError::Unavailable => write!(f, "Sensor unavailable"),
        }
    }
}

impl std::error::Error for SensorError {}

/// Capability interface over the station hardware.
///
/// Methods are blocking, as the underlying drivers are; the sampler runs them
/// on the blocking pool and enforces the deadline.
pub trait SensorReader: Send + Sync + 'static {
    fn read_environment(&self) -> Result<EnvironmentSample, SensorError>;
    fn read_gas(&self) -> Result<GasSample, SensorError>;
    fn read_light(&self) -> Result<LightSample, SensorError>;
    fn read_particulates(&self) -> Result<ParticulateSample, SensorError>;
}

/// Configuration for the simulated sensors.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Probability (0.0 - 1.0) that a particulate read times out
    pub particulate_failure_rate: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            particulate_failure_rate: 0.0,
        }
    }
}

/// Random-walk sensor simulator for hosts without the station hardware.
///
/// Values drift slowly around plausible outdoor readings so consecutive
/// samples look like a real time series.
pub struct SimulatedSensors {
    config: SimulationConfig,
    state: Mutex<SimulatedState>,
}

#[derive(Debug, Clone, Copy)]
struct SimulatedState {
    temperature: f64,
    pressure: f64,
    humidity: f64,
    lux: f64,
    pm2_5: f64,
}

impl SimulatedSensors {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SimulatedState {
                temperature: 24.0,
                pressure: 1012.0,
                humidity: 45.0,
                lux: 300.0,
                pm2_5: 12.0,
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SimulationConfig::default())
    }

    /// Advance one field of the random walk and return its new value.
    fn step(
        &self,
        field: impl FnOnce(&mut SimulatedState, &mut rand::rngs::ThreadRng) -> f64,
    ) -> Result<f64, SensorError> {
        let mut rng = rand::thread_rng();
        let mut state = self
            .state
            .lock()
            .map_err(|_| SensorError::Bus("simulator state poisoned".to_string()))?;
        Ok(field(&mut state, &mut rng))
    }
}

fn drift(value: &mut f64, rng: &mut impl Rng, step: f64, min: f64, max: f64) -> f64 {
    *value = (*value + rng.gen_range(-step..=step)).clamp(min, max);
    *value
}

impl SensorReader for SimulatedSensors {
    fn read_environment(&self) -> Result<EnvironmentSample, SensorError> {
        let (temperature, pressure, humidity) = {
            let mut rng = rand::thread_rng();
            let mut state = self
                .state
                .lock()
                .map_err(|_| SensorError::Bus("simulator state poisoned".to_string()))?;
            (
                drift(&mut state.temperature, &mut rng, 0.1, -10.0, 50.0),
                drift(&mut state.pressure, &mut rng, 0.2, 950.0, 1050.0),
                drift(&mut state.humidity, &mut rng, 0.3, 5.0, 100.0),
            )
        };
        Ok(EnvironmentSample {
            temperature,
            pressure,
            humidity,
        })
    }

    fn read_gas(&self) -> Result<GasSample, SensorError> {
        let mut rng = rand::thread_rng();
        Ok(GasSample {
            oxidised: rng.gen_range(5.0..40.0),
            reducing: rng.gen_range(200.0..800.0),
            nh3: rng.gen_range(50.0..300.0),
        })
    }

    fn read_light(&self) -> Result<LightSample, SensorError> {
        let lux = self.step(|state, rng| drift(&mut state.lux, rng, 5.0, 0.0, 60_000.0))?;
        let proximity = rand::thread_rng().gen_range(0.0..10.0_f64).floor();
        Ok(LightSample { lux, proximity })
    }

    fn read_particulates(&self) -> Result<ParticulateSample, SensorError> {
        let mut rng = rand::thread_rng();
        if rng.gen_bool(self.config.particulate_failure_rate.clamp(0.0, 1.0)) {
            return Err(SensorError::Timeout);
        }

        let pm2_5 = self.step(|state, rng| drift(&mut state.pm2_5, rng, 0.5, 0.0, 500.0))?;
        let pm1 = (pm2_5 * 0.7).round();
        let pm10 = (pm2_5 * 1.4).round();
        Ok(ParticulateSample {
            pm1,
            pm2_5: pm2_5.round(),
            pm10,
            particles_03um: (pm2_5 * 150.0).round(),
            particles_05um: (pm2_5 * 45.0).round(),
            particles_10um: (pm2_5 * 8.0).round(),
            particles_25um: (pm2_5 * 1.2).round(),
            particles_50um: (pm2_5 * 0.3).round(),
            particles_100um: (pm2_5 * 0.1).round(),
        })
    }
}
