// Second-aligned sampling loop.
//
// Each tick is scheduled from a fresh "now", never by chaining fixed intervals,
// so read time and timer slack cannot accumulate. The read starts OFFSET before
// the boundary and the result is labelled with the boundary itself.

use crate::sensor::{ReadingSource, Source};
use crate::storage::SensorStore;
use crate::{Sample, Timestamp};
use chrono::Duration;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const OFFSET_MS: i64 = 200;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub target: Timestamp,          // the second the reading will be labelled with
    pub delay: std::time::Duration, // how long to sleep before reading
}

pub fn next_tick(now: Timestamp, offset: Duration) -> Tick {
    let now_ms = now.timestamp_millis();
    let mut target_ms = now_ms.div_euclid(1000) * 1000 + 1000;
    let mut delay_ms = target_ms - offset.num_milliseconds() - now_ms;
    if delay_ms <= 0 {
        // already at or past the read point, aim for the following second
        delay_ms += 1000;
        target_ms += 1000;
    }
    Tick {
        target: now + Duration::milliseconds(target_ms - now_ms),
        delay: std::time::Duration::from_millis(delay_ms as u64),
    }
}

pub struct Sampler<S = Source> {
    source: S,
    store: Arc<SensorStore>,
    offset: Duration,
}

impl<S: ReadingSource> Sampler<S> {
    pub fn new(source: S, store: Arc<SensorStore>) -> Self {
        Self {
            source,
            store,
            offset: Duration::milliseconds(OFFSET_MS),
        }
    }

    /// Samples until cancelled. Cancellation only interrupts the sleep;
    /// a tick that already started finishes its read and append.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Sampling from the {} source", self.source.name());
        loop {
            let tick = next_tick(self.store.now(), self.offset);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(tick.delay) => (),
            }
            self.tick(tick.target).await;
        }
        info!("Sampling task finished");
    }

    /// Reads the source once and stores the result under `target`.
    /// A failed read skips the tick.
    pub async fn tick(&mut self, target: Timestamp) -> bool {
        match self.source.reading().await {
            Ok(reading) => {
                let sample = Sample::new(target, reading);
                debug!("{sample:?}");
                self.store.record(sample).await;
                true
            }
            Err(e) => {
                warn!("Skipping tick {target}: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::synthetic::Synthetic;
    use crate::sensor::{Reading, SensorError};
    use crate::storage::StoreConfig;
    use crate::testing::{at, FixedClock};
    use anyhow::Result;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    fn offset() -> Duration {
        Duration::milliseconds(OFFSET_MS)
    }

    #[test]
    fn test_tick_lands_before_next_second() {
        let tick = next_tick(at("2024-01-01T00:00:00.300Z"), offset());
        assert_eq!(tick.target, at("2024-01-01T00:00:01Z"));
        assert_eq!(tick.delay, std::time::Duration::from_millis(500));

        let tick = next_tick(at("2024-01-01T00:00:00.799Z"), offset());
        assert_eq!(tick.target, at("2024-01-01T00:00:01Z"));
        assert_eq!(tick.delay, std::time::Duration::from_millis(1));

        let tick = next_tick(at("2024-01-01T00:00:00Z"), offset());
        assert_eq!(tick.target, at("2024-01-01T00:00:01Z"));
        assert_eq!(tick.delay, std::time::Duration::from_millis(800));
    }

    #[test]
    fn test_late_tick_moves_to_following_second() {
        let tick = next_tick(at("2024-01-01T00:00:00.950Z"), offset());
        assert_eq!(tick.target, at("2024-01-01T00:00:02Z"));
        assert_eq!(tick.delay, std::time::Duration::from_millis(850));

        // a read that returns instantly must not label the same second twice
        let tick = next_tick(at("2024-01-01T00:00:00.800Z"), offset());
        assert_eq!(tick.target, at("2024-01-01T00:00:02Z"));
        assert_eq!(tick.delay, std::time::Duration::from_millis(1000));
    }

    #[test]
    fn test_no_cumulative_drift() {
        let mut rng = StdRng::seed_from_u64(17);
        let mut now = at("2024-01-01T00:00:00.437Z");
        let mut previous: Option<Timestamp> = None;
        for _ in 0..10_000 {
            let tick = next_tick(now, offset());
            let fired = now + Duration::from_std(tick.delay).unwrap();
            // every fire time is exactly OFFSET before a whole second
            assert_eq!(tick.target - fired, offset());
            assert_eq!(tick.target.timestamp_subsec_millis(), 0);
            if let Some(previous) = previous {
                assert_eq!(tick.target - previous, Duration::seconds(1));
            }
            previous = Some(tick.target);
            // the read takes anywhere up to just under a second
            now = fired + Duration::milliseconds(rng.gen_range(0..1000));
        }
    }

    #[tokio::test]
    async fn test_tick_records_under_target() -> Result<()> {
        let tmp = TempDir::new()?;
        let clock = Arc::new(FixedClock::new(at("2024-01-01T00:00:00.800Z")));
        let store = Arc::new(SensorStore::open(StoreConfig::new(tmp.path()), clock)?);
        let source = Source::Synthetic(Synthetic::seeded(1).with_latency(std::time::Duration::ZERO));
        let mut sampler = Sampler::new(source, store.clone());
        assert!(sampler.tick(at("2024-01-01T00:00:01Z")).await);
        let latest = store.latest().await.unwrap();
        assert_eq!(latest.timestamp, at("2024-01-01T00:00:01Z"));
        assert_eq!(store.files().load_all()?, vec![latest]);
        Ok(())
    }

    /// Fails the ticks whose index is listed, succeeds otherwise.
    struct Flaky {
        failing: Vec<usize>,
        calls: usize,
    }

    impl ReadingSource for Flaky {
        fn reading(&mut self) -> impl std::future::Future<Output = Result<Reading, SensorError>> + Send {
            let call = self.calls;
            self.calls += 1;
            let fail = self.failing.contains(&call);
            async move {
                if fail {
                    return Err(SensorError::NotReady);
                }
                Ok(Reading {
                    co2: 600.0 + call as f32,
                    temperature: 21.0,
                    humidity: 50.0,
                    pressure: 1000.0,
                })
            }
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_failed_read_skips_only_that_tick() -> Result<()> {
        let tmp = TempDir::new()?;
        let clock = Arc::new(FixedClock::new(at("2024-01-01T00:00:00.800Z")));
        let store = Arc::new(SensorStore::open(StoreConfig::new(tmp.path()), clock)?);
        let source = Flaky {
            failing: vec![0],
            calls: 0,
        };
        let mut sampler = Sampler::new(source, store.clone());

        assert!(!sampler.tick(at("2024-01-01T00:00:01Z")).await);
        assert_eq!(store.len().await, 0);
        assert!(store.files().load_all()?.is_empty());

        assert!(sampler.tick(at("2024-01-01T00:00:02Z")).await);
        let stored = store.files().load_all()?;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].timestamp, at("2024-01-01T00:00:02Z"));
        assert_eq!(stored[0].co2, 601.0);
        assert!(!store.is_degraded());
        Ok(())
    }

    #[tokio::test]
    async fn test_run_stops_when_cancelled() -> Result<()> {
        let tmp = TempDir::new()?;
        let clock = Arc::new(FixedClock::new(at("2024-01-01T00:00:00.100Z")));
        let store = Arc::new(SensorStore::open(StoreConfig::new(tmp.path()), clock)?);
        let source = Source::Synthetic(Synthetic::seeded(1));
        let cancel = CancellationToken::new();
        cancel.cancel();
        Sampler::new(source, store.clone()).run(cancel).await;
        assert_eq!(store.len().await, 0);
        Ok(())
    }
}
