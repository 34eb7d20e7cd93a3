use super::window::Retention;
use crate::sensor::synthetic::Synthetic;
use crate::{Sample, Timestamp};
use chrono::{Duration, DurationRound};

/// Generates one synthetic sample per second over `span` ending at `now`
/// (truncated to the second), keeping only what the retention policy would
/// keep at `now`. Output is chronological.
pub fn synthetic_history(
    generator: &mut Synthetic,
    now: Timestamp,
    span: Duration,
    retention: &Retention,
) -> Vec<Sample> {
    let end = now.duration_trunc(Duration::seconds(1)).unwrap_or(now);
    let seconds = span.num_seconds();
    let mut history = Vec::new();
    for i in (0..seconds).rev() {
        let timestamp = end - Duration::seconds(i);
        // step for every second so the walk has the same texture as live data
        let reading = generator.step();
        if retention.keeps(timestamp, end) {
            history.push(Sample::new(timestamp, reading));
        }
    }
    history
}
