//! Identifier generation for string-keyed records.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Returns `{prefix}-{unix micros}-{sequence}`, unique within the process.
pub fn new_id(prefix: &str) -> String {
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}", prefix, Utc::now().timestamp_micros(), seq)
}

/// Identifier for a schema version of the given domain.
pub fn schema_id(domain_id: i64) -> String {
    new_id(&domain_id.to_string())
}
