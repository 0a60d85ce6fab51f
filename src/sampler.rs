//! Sampler module: one tick's worth of sensor reads.
//!
//! Each enabled sensor family is read on the blocking pool, all families
//! concurrently, and each read is bounded by a deadline. A family that times
//! out, errors or panics yields a failure for that family only; the others
//! still produce readings. All readings of a tick carry the tick's capture
//! time, never the time the read happened to complete.
//!
//! A driver call cannot be cancelled once it is on the blocking pool. While an
//! earlier read of a family is still running, that family reports a timeout
//! without starting another read, so a hung bus holds at most one thread.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::sensor::{
    EnvironmentSample, GasSample, LightSample, ParticulateSample, Reading, SensorError,
    SensorFamily, SensorId, SensorReader,
};

/// CPU temperature assumed when the thermal zone cannot be read.
const DEFAULT_CPU_TEMPERATURE: f64 = 40.0;

/// Number of CPU temperature samples averaged for compensation.
const CPU_HISTORY_LEN: usize = 5;

/// Result of reading every enabled sensor once.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleSet {
    pub captured_at: DateTime<Utc>,
    pub readings: Vec<Reading>,
    pub failures: Vec<(SensorFamily, SensorError)>,
}

impl SampleSet {
    fn new(captured_at: DateTime<Utc>) -> Self {
        Self {
            captured_at,
            readings: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn push(&mut self, sensor: SensorId, value: f64) {
        self.readings.push(Reading::new(sensor, value, self.captured_at));
    }

    /// Value read for a sensor this tick, if any.
    pub fn value(&self, sensor: SensorId) -> Option<f64> {
        self.readings
            .iter()
            .find(|r| r.sensor == sensor)
            .map(|r| r.value)
    }

    /// Per-sensor outcome for every sensor of the families that were polled.
    pub fn outcomes(&self) -> BTreeMap<SensorId, Result<f64, SensorError>> {
        let mut outcomes = BTreeMap::new();
        for reading in &self.readings {
            outcomes.insert(reading.sensor, Ok(reading.value));
        }
        for (family, error) in &self.failures {
            for sensor in SensorId::all().iter().filter(|s| s.family() == *family) {
                outcomes.insert(*sensor, Err(error.clone()));
            }
        }
        outcomes
    }
}

/// BME280 self-heating correction using the board's CPU temperature.
///
/// `compensated = raw - (avg_cpu - raw) / factor`, where `avg_cpu` is the mean
/// of the last few CPU readings to smooth out jitter.
#[derive(Debug, Clone)]
pub struct TemperatureCompensator {
    factor: f64,
    cpu_temp_path: PathBuf,
    history: VecDeque<f64>,
}

impl TemperatureCompensator {
    pub fn new(factor: f64, cpu_temp_path: impl Into<PathBuf>) -> Self {
        Self {
            factor,
            cpu_temp_path: cpu_temp_path.into(),
            history: VecDeque::with_capacity(CPU_HISTORY_LEN),
        }
    }

    pub fn cpu_temp_path(&self) -> &Path {
        &self.cpu_temp_path
    }

    pub fn compensate(&mut self, raw: f64, cpu: f64) -> f64 {
        if self.history.is_empty() {
            self.history.extend(std::iter::repeat(cpu).take(CPU_HISTORY_LEN));
        } else {
            if self.history.len() >= CPU_HISTORY_LEN {
                self.history.pop_front();
            }
            self.history.push_back(cpu);
        }

        let avg_cpu = self.history.iter().sum::<f64>() / self.history.len() as f64;
        raw - (avg_cpu - raw) / self.factor
    }
}

/// Read the CPU temperature in degrees Celsius from a sysfs thermal zone
/// (millidegrees), falling back to a fixed value when unreadable.
pub fn read_cpu_temperature(path: &Path) -> f64 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .map(|millidegrees| millidegrees / 1000.0)
        .unwrap_or(DEFAULT_CPU_TEMPERATURE)
}

pub struct Sampler<R: SensorReader> {
    reader: Arc<R>,
    families: Vec<SensorFamily>,
    timeout: Duration,
    compensator: Option<TemperatureCompensator>,
    in_flight: [Arc<AtomicBool>; 4],
}

impl<R: SensorReader> Sampler<R> {
    pub fn new(reader: Arc<R>, families: Vec<SensorFamily>, timeout: Duration) -> Self {
        Self {
            reader,
            families,
            timeout,
            compensator: None,
            in_flight: Default::default(),
        }
    }

    /// Enable temperature compensation.
    pub fn with_compensation(mut self, compensator: TemperatureCompensator) -> Self {
        self.compensator = Some(compensator);
        self
    }

    pub fn families(&self) -> &[SensorFamily] {
        &self.families
    }

    fn enabled(&self, family: SensorFamily) -> bool {
        self.families.contains(&family)
    }

    /// Whether a read of `family` from an earlier tick is still running.
    pub fn is_in_flight(&self, family: SensorFamily) -> bool {
        self.in_flight[family as usize].load(Ordering::Acquire)
    }

    fn slot(&self, family: SensorFamily) -> FamilySlot<'_, R> {
        FamilySlot {
            family,
            reader: &self.reader,
            timeout: self.timeout,
            busy: &self.in_flight[family as usize],
        }
    }

    /// Read every enabled family once, stamping readings with `captured_at`.
    pub async fn read_all(&mut self, captured_at: DateTime<Utc>) -> SampleSet {
        let cpu_path = self
            .compensator
            .as_ref()
            .map(|c| c.cpu_temp_path().to_path_buf());

        let environment = async {
            if !self.enabled(SensorFamily::Environment) {
                return None;
            }
            let cpu_path = cpu_path.clone();
            Some(
                read_family(self.slot(SensorFamily::Environment), move |reader| {
                    let sample = reader.read_environment()?;
                    let cpu = cpu_path.as_deref().map(read_cpu_temperature);
                    Ok((sample, cpu))
                })
                .await,
            )
        };
        let gas = async {
            if !self.enabled(SensorFamily::Gas) {
                return None;
            }
            Some(read_family(self.slot(SensorFamily::Gas), |reader| reader.read_gas()).await)
        };
        let light = async {
            if !self.enabled(SensorFamily::Light) {
                return None;
            }
            Some(read_family(self.slot(SensorFamily::Light), |reader| reader.read_light()).await)
        };
        let particulate = async {
            if !self.enabled(SensorFamily::Particulate) {
                return None;
            }
            Some(
                read_family(self.slot(SensorFamily::Particulate), |reader| {
                    reader.read_particulates()
                })
                .await,
            )
        };

        let (environment, gas, light, particulate) =
            tokio::join!(environment, gas, light, particulate);

        let mut set = SampleSet::new(captured_at);
        match environment {
            Some(Ok((sample, cpu))) => self.push_environment(&mut set, sample, cpu),
            Some(Err(e)) => set.failures.push((SensorFamily::Environment, e)),
            None => {}
        }
        match gas {
            Some(Ok(sample)) => push_gas(&mut set, sample),
            Some(Err(e)) => set.failures.push((SensorFamily::Gas, e)),
            None => {}
        }
        match light {
            Some(Ok(sample)) => push_light(&mut set, sample),
            Some(Err(e)) => set.failures.push((SensorFamily::Light, e)),
            None => {}
        }
        match particulate {
            Some(Ok(sample)) => push_particulate(&mut set, sample),
            Some(Err(e)) => set.failures.push((SensorFamily::Particulate, e)),
            None => {}
        }

        debug!(
            captured_at = %captured_at.to_rfc3339(),
            readings = set.readings.len(),
            failures = set.failures.len(),
            "Sensors sampled"
        );
        set
    }

    fn push_environment(
        &mut self,
        set: &mut SampleSet,
        sample: EnvironmentSample,
        cpu: Option<f64>,
    ) {
        let temperature = match (self.compensator.as_mut(), cpu) {
            (Some(compensator), Some(cpu)) => compensator.compensate(sample.temperature, cpu),
            _ => sample.temperature,
        };
        set.push(SensorId::Temperature, temperature);
        set.push(SensorId::RawTemperature, sample.temperature);
        set.push(SensorId::Pressure, sample.pressure);
        set.push(SensorId::Humidity, sample.humidity);
    }
}

fn push_gas(set: &mut SampleSet, sample: GasSample) {
    set.push(SensorId::Oxidised, sample.oxidised);
    set.push(SensorId::Reducing, sample.reducing);
    set.push(SensorId::Nh3, sample.nh3);
}

fn push_light(set: &mut SampleSet, sample: LightSample) {
    set.push(SensorId::Lux, sample.lux);
    set.push(SensorId::Proximity, sample.proximity);
}

fn push_particulate(set: &mut SampleSet, sample: ParticulateSample) {
    for (sensor, value) in sample.values() {
        set.push(sensor, value);
    }
}

/// What one family's read needs from the sampler.
struct FamilySlot<'a, R> {
    family: SensorFamily,
    reader: &'a Arc<R>,
    timeout: Duration,
    busy: &'a Arc<AtomicBool>,
}

/// Clears a family's in-flight flag when its driver call returns or unwinds.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Run one blocking driver call on the blocking pool under a deadline.
async fn read_family<R, T, F>(slot: FamilySlot<'_, R>, read: F) -> Result<T, SensorError>
where
    R: SensorReader,
    T: Send + 'static,
    F: FnOnce(&R) -> Result<T, SensorError> + Send + 'static,
{
    if slot.busy.swap(true, Ordering::AcqRel) {
        debug!(sensor = %slot.family, "Previous read still running, skipping");
        return Err(SensorError::Timeout);
    }

    let reader = Arc::clone(slot.reader);
    let guard = BusyGuard(Arc::clone(slot.busy));
    let task = tokio::task::spawn_blocking(move || {
        let _guard = guard;
        read(&reader)
    });

    match tokio::time::timeout(slot.timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(SensorError::Bus(format!("driver task failed: {}", e))),
        Err(_) => Err(SensorError::Timeout),
    }
}
