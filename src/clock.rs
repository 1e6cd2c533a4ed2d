use std::time::{SystemTime, UNIX_EPOCH};

use crate::model::Day;

/// Injectable date source. Validation and the "active" predicate depend on
/// the current day, so it is passed in at construction instead of read from
/// ambient wall-clock time inside the logic.
pub trait Clock: Send + Sync {
    fn today(&self) -> Day;
}

/// Wall-clock implementation (UTC day).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> Day {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        (secs / 86_400) as Day
    }
}

/// Pinned clock for tests and deterministic replays.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub Day);

impl Clock for FixedClock {
    fn today(&self) -> Day {
        self.0
    }
}

/// Convert a proleptic-Gregorian civil date to a [`Day`].
/// Days-from-civil algorithm; exact for the full i64 day range we accept.
pub fn day_from_ymd(year: i64, month: u32, day: u32) -> Day {
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = i64::from(if month > 2 { month - 3 } else { month + 9 });
    let doy = (153 * mp + 2) / 5 + day as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}
