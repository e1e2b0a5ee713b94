use chrono::{DateTime, Duration, Utc};

pub type Timestamp = DateTime<Utc>;

/// Time source for lease arithmetic. Everything that reasons about expiry
/// reads the clock through this trait so tests can pin time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// Shortest lease a caller can hold.
pub fn min_lock_duration() -> Duration {
    Duration::seconds(1)
}

/// Lease granted when the caller does not ask for a specific duration.
pub fn default_lock_duration() -> Duration {
    Duration::minutes(5)
}

/// Longest lease a single grant or extension can reach from "now".
pub fn max_lock_duration() -> Duration {
    Duration::minutes(30)
}
