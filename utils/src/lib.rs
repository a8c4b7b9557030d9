use std::time::{Duration, SystemTime};

use rand::Rng;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Adds a uniformly random number of whole seconds in `0..=jitter` to `base`.
///
/// Hosts that share one store pick their jitter independently so their
/// periodic passes drift apart instead of landing on the store together.
pub fn with_jitter(base: Duration, jitter: Duration) -> Duration {
    let jitter_secs = jitter.as_secs();
    if jitter_secs == 0 {
        return base;
    }
    base + Duration::from_secs(rand::rng().random_range(0..=jitter_secs))
}

/// A ticker that fires immediately and then every `period`.
///
/// Missed ticks are delayed rather than bursted; callers spawn each run so a
/// slow run never holds back the next tick.
pub fn periodic(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now(), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
