use std::time::{SystemTime, UNIX_EPOCH};

use crate::SourceError;

/// A raw counter value, stamped with the time at which it was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterReading {
    pub value: u64,
    pub timestamp_ns: i64,
}

/// Reads monotonically increasing counters, identified by name.
///
/// Implementations only read, they keep no history.
pub trait CounterSource: Send {
    fn read_counter(&mut self, stream: &str) -> Result<CounterReading, SourceError>;
}

/// Current wall-clock time, in nanoseconds since the Unix epoch.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
