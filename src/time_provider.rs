use chrono::{DateTime, Local, TimeZone, Utc};

/// Wall-clock source for every anchor and mutation stamp, in unix milliseconds.
pub trait TimeProvider: Send + Sync {
    fn now_ms(&self) -> i64;
    fn label(&self) -> &'static str;
}

pub struct SystemClock;

impl TimeProvider for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn label(&self) -> &'static str {
        "SYSTEM_WALL_CLOCK"
    }
}

pub fn to_local_datetime(unix_ms: i64) -> Option<DateTime<Local>> {
    Local.timestamp_millis_opt(unix_ms).single()
}

#[cfg(test)]
pub use manual::ManualClock;
