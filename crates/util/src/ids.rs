//! Process-local id generation.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A process-unique id attached to every external action request so late
/// responses can be correlated with (or discarded by) their originating call.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// A fresh document id with a readable prefix, e.g. `var-1724400000000-3`.
///
/// Uniqueness holds within a process and is good enough for a single-session
/// store; ids are never interpreted beyond equality.
pub fn fresh_id(prefix: &str) -> String {
    let sequence = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{sequence}", Utc::now().timestamp_millis())
}
