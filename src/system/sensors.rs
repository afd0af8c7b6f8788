use crate::{
    config::OperationalMode,
    error::{PanelError, Result},
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::error;

pub const SOC_SENSOR: &str = "/sys/class/thermal/thermal_zone0/temp";
pub const GPU_SENSOR: &str = "/sys/class/thermal/thermal_zone1/temp";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemperatureReading {
    pub soc_temperature: String,
    pub soc_temperature_f: String,
    pub gpu_temperature: String,
    pub gpu_temperature_f: String,
}

impl TemperatureReading {
    fn from_celsius(soc: f64, gpu: f64) -> Self {
        Self {
            soc_temperature: format!("{:.1}", soc),
            soc_temperature_f: format!("{:.1}", to_fahrenheit(soc)),
            gpu_temperature: format!("{:.1}", gpu),
            gpu_temperature_f: format!("{:.1}", to_fahrenheit(gpu)),
        }
    }

    fn zero() -> Self {
        let zero = "0.0".to_string();
        Self {
            soc_temperature: zero.clone(),
            soc_temperature_f: zero.clone(),
            gpu_temperature: zero.clone(),
            gpu_temperature_f: zero,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThermalSensors {
    mode: OperationalMode,
    soc: PathBuf,
    gpu: PathBuf,
}

impl ThermalSensors {
    pub fn new(mode: OperationalMode, soc: PathBuf, gpu: PathBuf) -> Self {
        Self { mode, soc, gpu }
    }

    pub async fn read(&self) -> Result<TemperatureReading> {
        if !self.mode.is_live() {
            return Ok(TemperatureReading::zero());
        }

        let soc = read_celsius(&self.soc).await?;
        let gpu = read_celsius(&self.gpu).await?;
        Ok(TemperatureReading::from_celsius(soc, gpu))
    }
}

fn to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

/// Sensor files hold an integer in millidegrees Celsius.
async fn read_celsius(path: &Path) -> Result<f64> {
    let raw = fs::read_to_string(path).await.map_err(|e| {
        error!("Error reading temperature sensor {}: {}", path.display(), e);
        PanelError::Sensor(format!("{}: {}", path.display(), e))
    })?;
    let millis: i64 = raw.trim().parse().map_err(|e| {
        error!("Error parsing temperature sensor {}: {:?} ({})", path.display(), raw.trim(), e);
        PanelError::Sensor(format!("{}: invalid reading {:?}", path.display(), raw.trim()))
    })?;
    Ok(millis as f64 / 1000.0)
}
