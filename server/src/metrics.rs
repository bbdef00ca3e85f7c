//! Process-wide counters and gauges.
//!
//! Kept as plain atomics so hot paths never contend on a lock; a snapshot is
//! emitted through the log facade on demand.

use std::sync::atomic::{AtomicU64, Ordering};

pub static SESSIONS_OPEN: AtomicU64 = AtomicU64::new(0);
pub static SESSIONS_CREATED: AtomicU64 = AtomicU64::new(0);
pub static CONNECTIONS_OPEN: AtomicU64 = AtomicU64::new(0);
pub static MESSAGES_RECEIVED: AtomicU64 = AtomicU64::new(0);
pub static MESSAGES_SENT: AtomicU64 = AtomicU64::new(0);
pub static BROADCAST_DROPPED: AtomicU64 = AtomicU64::new(0);
pub static RECEIPTS_FORWARDED: AtomicU64 = AtomicU64::new(0);
pub static RECEIPT_VERIFY_ERRORS: AtomicU64 = AtomicU64::new(0);
pub static RECEIPT_FORWARD_ERRORS: AtomicU64 = AtomicU64::new(0);

pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn dec(counter: &AtomicU64) {
    counter.fetch_sub(1, Ordering::Relaxed);
}

pub fn get(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Logs one line with the current counter values.
pub fn log_snapshot() {
    log::info!(
        "metrics sessions_open={} sessions_created={} connections_open={} \
         messages_received={} messages_sent={} broadcast_dropped={}",
        get(&SESSIONS_OPEN),
        get(&SESSIONS_CREATED),
        get(&CONNECTIONS_OPEN),
        get(&MESSAGES_RECEIVED),
        get(&MESSAGES_SENT),
        get(&BROADCAST_DROPPED),
    );
}
