use chrono::{DateTime, Utc};

/// Single place producing the timestamps stamped onto persisted records and
/// timeline events.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}
