//! Wall-clock milliseconds and identifier minting.
//!
//! `now_ms` is monotonic within a process: if the OS clock steps backward,
//! the previous high-water mark is returned instead of a smaller value.
//! Timestamps feed segment ordering, so a regression would violate the
//! non-decreasing invariant on persisted transcripts.

use std::sync::atomic::{AtomicI64, Ordering};

static WATERMARK: AtomicI64 = AtomicI64::new(0);

/// Current wall-clock time in milliseconds since the Unix epoch, clamped to
/// never run backward within this process.
pub fn now_ms() -> i64 {
    let wall = chrono::Utc::now().timestamp_millis();
    let prev = WATERMARK.fetch_max(wall, Ordering::AcqRel);
    prev.max(wall)
}

/// Mint a fresh 128-bit identifier in textual form. Collision-resistant
/// across replicas without coordination.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
