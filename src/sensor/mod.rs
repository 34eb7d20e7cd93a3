pub mod bme280;
pub mod mhz19;
pub mod synthetic;

use serde::Serialize;
use std::future::Future;
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// What a source yields for one tick, before it is labelled with a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    pub co2: f32,
    pub temperature: f32,
    pub humidity: f32,
    pub pressure: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvReading {
    pub temperature: f32,
    pub humidity: f32,
    pub pressure: f32,
}

#[derive(Error, Debug)]
pub enum SensorError {
    #[error("serial port: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("MH-Z19B bad checksum: expected {expected:#04x}, got {got:#04x}")]
    Checksum { expected: u8, got: u8 },

    #[error("MH-Z19B port closed")]
    Closed,

    #[error("I2C: {0}")]
    I2c(String),

    #[error("device at the BME280 address reports chip id {0:#04x}")]
    ChipId(u8),

    #[error("BME280 has no measurement yet")]
    NotReady,

    #[error("sensor task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Anything the sampler can ask for one reading per tick.
pub trait ReadingSource {
    fn reading(&mut self) -> impl Future<Output = Result<Reading, SensorError>> + Send;
    fn name(&self) -> &'static str;
}

/// Waits for both sensors before looking at either outcome, so a failure on
/// one side never leaves an MH-Z19B answer unread for the next tick.
pub async fn read_both<C, E>(co2: C, env: E) -> Result<Reading, SensorError>
where
    C: Future<Output = Result<u16, SensorError>>,
    E: Future<Output = Result<EnvReading, SensorError>>,
{
    let (co2, env) = tokio::join!(co2, env);
    let (co2, env) = (co2?, env?);
    Ok(Reading {
        co2: co2 as f32,
        temperature: env.temperature,
        humidity: env.humidity,
        pressure: env.pressure,
    })
}

/// Real sensors: MH-Z19B on a serial line, BME280 on I2C.
pub struct Hardware {
    co2: mhz19::Mhz19,
    env: bme280::Bme280Sensor,
}

impl Hardware {
    pub async fn open(tty: &str, i2c_bus: &Path, address: u8) -> Result<Self, SensorError> {
        let co2 = mhz19::Mhz19::open(tty).await?;
        let env = bme280::Bme280Sensor::open(i2c_bus, address).await?;
        info!(
            "Opened MH-Z19B on {tty} and BME280 at {address:#04x} on {}",
            i2c_bus.display()
        );
        Ok(Self { co2, env })
    }

    pub async fn reading(&mut self) -> Result<Reading, SensorError> {
        read_both(self.co2.read_co2(), self.env.read()).await
    }
}

/// Where samples come from, chosen once at startup.
pub enum Source {
    Hardware(Hardware),
    Synthetic(synthetic::Synthetic),
}

impl ReadingSource for Source {
    fn reading(&mut self) -> impl Future<Output = Result<Reading, SensorError>> + Send {
        async move {
            match self {
                Source::Hardware(s) => s.reading().await,
                Source::Synthetic(s) => s.reading().await,
            }
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Source::Hardware(_) => "hardware",
            Source::Synthetic(_) => "synthetic",
        }
    }
}
