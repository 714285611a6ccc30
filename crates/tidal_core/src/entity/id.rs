//! Client-side identifiers and clocks.

use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Prefix of client temp ids awaiting a server-confirmed id.
pub const TEMP_ID_PREFIX: &str = "tmp_";

/// Generates a client temp id.
pub fn temp_id() -> String {
    format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4().simple())
}

/// Generates an idempotency key for a write.
pub fn idempotency_key() -> String {
    Uuid::new_v4().to_string()
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_ids_are_unique_and_prefixed() {
        let a = temp_id();
        let b = temp_id();
        assert!(a.starts_with(TEMP_ID_PREFIX));
        assert_ne!(a, b);
    }

    #[test]
    fn clock_is_after_2020() {
        assert!(now_ms() > 1_577_836_800_000);
    }
}
