pub mod sampling;
pub mod sensor;
pub mod storage;

use chrono::prelude::*;
use dotenvy::dotenv;
use serde::Serialize;

pub type Timestamp = DateTime<Utc>;

// One reading labelled with the second it belongs to.
// Every field is always populated: a tick that fails any source is never stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub co2: f32,
    pub temperature: f32,
    pub humidity: f32,
    pub pressure: f32,
}

impl Sample {
    pub fn new(timestamp: Timestamp, reading: sensor::Reading) -> Self {
        Self {
            timestamp,
            co2: reading.co2,
            temperature: reading.temperature,
            humidity: reading.humidity,
            pressure: reading.pressure,
        }
    }

    /// Sample falls exactly on a minute boundary (seconds component zero).
    pub fn on_the_minute(&self) -> bool {
        self.timestamp.second() == 0
    }
}

/// Source of "now" for everything that filters by age.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

// A missing .env file is fine, the process environment still applies
pub fn load_env() {
    dotenv().ok();
}
