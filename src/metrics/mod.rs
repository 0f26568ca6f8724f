use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

// Global counters (low overhead). These are coarse-grained and process-wide.
static ENQUEUED: AtomicU64 = AtomicU64::new(0);
static SQUASHED: AtomicU64 = AtomicU64::new(0);
static DELIVERED: AtomicU64 = AtomicU64::new(0);
static ACKED: AtomicU64 = AtomicU64::new(0);
static RETRIED: AtomicU64 = AtomicU64::new(0);
static TIMED_OUT: AtomicU64 = AtomicU64::new(0);
static DROPPED_EXHAUSTED: AtomicU64 = AtomicU64::new(0);
static ADMISSION_BLOCKED: AtomicU64 = AtomicU64::new(0);

// Engine readiness state
static READY: AtomicBool = AtomicBool::new(false);

#[inline]
pub fn set_ready(v: bool) {
    READY.store(v, Ordering::Relaxed);
}

#[inline]
pub fn is_ready() -> bool {
    READY.load(Ordering::Relaxed)
}

#[inline]
pub fn inc_enqueued(n: u64) {
    ENQUEUED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_squashed(n: u64) {
    SQUASHED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_delivered(n: u64) {
    DELIVERED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_acked(n: u64) {
    ACKED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_retried(n: u64) {
    RETRIED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_timed_out(n: u64) {
    TIMED_OUT.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_dropped_exhausted(n: u64) {
    DROPPED_EXHAUSTED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_admission_blocked(n: u64) {
    ADMISSION_BLOCKED.fetch_add(n, Ordering::Relaxed);
}

pub fn snapshot() -> String {
    // Prometheus text format without HELP/TYPE lines.
    format!(
        "tagmq_enqueued {}\ntagmq_squashed {}\ntagmq_delivered {}\ntagmq_acked {}\ntagmq_retried {}\ntagmq_timed_out {}\ntagmq_dropped_exhausted {}\ntagmq_admission_blocked {}\ntagmq_ready {}\n",
        ENQUEUED.load(Ordering::Relaxed),
        SQUASHED.load(Ordering::Relaxed),
        DELIVERED.load(Ordering::Relaxed),
        ACKED.load(Ordering::Relaxed),
        RETRIED.load(Ordering::Relaxed),
        TIMED_OUT.load(Ordering::Relaxed),
        DROPPED_EXHAUSTED.load(Ordering::Relaxed),
        ADMISSION_BLOCKED.load(Ordering::Relaxed),
        u8::from(is_ready()),
    )
}
