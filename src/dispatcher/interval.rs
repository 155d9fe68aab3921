//! Conversion of the configured dispatch interval into a timer.

use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Shortest period the timer is armed with
const MIN_PERIOD: Duration = Duration::from_micros(1);

/// Longest period the timer is armed with (one year)
const MAX_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Split fractional seconds into whole seconds plus microseconds.
///
/// Returns `None` for zero, negative or non-finite values, which disable
/// periodic dispatch.
pub fn interval_period(seconds: f64) -> Option<Duration> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return None;
    }

    let max_seconds = MAX_PERIOD.as_secs_f64();
    if seconds >= max_seconds {
        return Some(MAX_PERIOD);
    }

    let whole = seconds.floor();
    let micros = ((seconds - whole) * 1_000_000.0).round() as u64;
    let period = Duration::from_secs(whole as u64) + Duration::from_micros(micros);
    Some(period.max(MIN_PERIOD))
}

/// Timer whose first tick lands one full period after arming
pub(crate) fn arm_timer(period: Option<Duration>) -> Option<Interval> {
    period.map(|period| {
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer
    })
}

/// Wait for the next tick, or forever when periodic dispatch is off
pub(crate) async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
