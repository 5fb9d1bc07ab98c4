//! Wall-clock timestamps for wire messages.
//!
//! Message timestamps are informational (Unix milliseconds). Elapsed-time
//! decisions such as movement validation use monotonic `Instant`s instead.

use chrono::Utc;

/// Current Unix time in milliseconds.
pub fn unix_millis() -> i64 {
    Utc::now().timestamp_millis()
}
