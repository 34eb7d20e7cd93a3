// Bounded inertial random walks standing in for the real sensors.
// Used to fill a fresh store with history and as the source in emulated mode.

use super::{Reading, SensorError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

// Real sensors need about this long per read
const LATENCY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq)]
pub struct Walk {
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub drift: f64,
}

impl Walk {
    pub fn new(value: f64, min: f64, max: f64) -> Self {
        Self {
            value,
            min,
            max,
            drift: 0.0,
        }
    }

    /// One step. The drift is nudged by a random amount biased back toward
    /// the midpoint; its speed toward the midpoint is capped at a thousandth
    /// of the range. The value itself never leaves `[min, max]`.
    pub fn advance<R: Rng + ?Sized>(&mut self, rng: &mut R) -> f64 {
        let range = self.max - self.min;
        let mid = (self.max + self.min) / 2.0;
        let step = range / 2000.0;
        let max_drift = range / 1000.0;
        let bias = 0.5 - 0.25 * (self.value - mid).abs() / range;
        let u: f64 = rng.gen();
        if self.value > mid {
            self.drift = (self.drift - step * (u - bias)).max(-max_drift);
        } else {
            self.drift = (self.drift + step * (u - bias)).min(max_drift);
        }
        self.value = (self.value + self.drift).clamp(self.min, self.max);
        self.value
    }
}

pub struct Synthetic {
    co2: Walk,
    temperature: Walk,
    humidity: Walk,
    pressure: Walk,
    rng: StdRng,
    latency: Duration,
}

impl Default for Synthetic {
    fn default() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }
}

impl Synthetic {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic generator, for tests.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            co2: Walk::new(600.0, 450.0, 4000.0),
            temperature: Walk::new(21.0, 19.0, 29.0),
            humidity: Walk::new(50.0, 30.0, 70.0),
            pressure: Walk::new(1000.0, 980.0, 1020.0),
            rng,
            latency: LATENCY,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn step(&mut self) -> Reading {
        Reading {
            co2: self.co2.advance(&mut self.rng) as f32,
            temperature: self.temperature.advance(&mut self.rng) as f32,
            humidity: self.humidity.advance(&mut self.rng) as f32,
            pressure: self.pressure.advance(&mut self.rng) as f32,
        }
    }

    pub async fn reading(&mut self) -> Result<Reading, SensorError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(self.step())
    }
}
