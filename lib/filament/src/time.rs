use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant, SystemTime};

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Convert a centisecond count to a duration.
#[inline]
pub fn centis(count: u32) -> Duration {
    Duration::from_millis(u64::from(count) * 10)
}

/// Centiseconds elapsed between two instants, rounded down.
#[inline]
pub fn centis_between(earlier: Instant, later: Instant) -> u32 {
    let elapsed = later.saturating_duration_since(earlier);
    (elapsed.as_millis() / 10) as u32
}

static NONCE_SALT: AtomicU32 = AtomicU32::new(0x9E37_79B9);

/// Produce a session nonce. Nonces drawn in the same process are distinct
/// even within a single clock tick, so two in-process peers never present
/// the same connection magic to each other.
#[inline]
pub fn nonce() -> u32 {
    let salt = NONCE_SALT.fetch_add(0x6D2B_79F5, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    nanos ^ salt
}
