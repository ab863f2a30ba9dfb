use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Snapshot of the escape configuration, captured before a blocking wait
/// and restored afterwards.
#[derive(Debug, Copy, Clone)]
pub struct EscapeConfig {
    enabled: bool,
}

/// Cooperative cancellation flag for blocking waits.
///
/// The host arms the handle (typically from a signal or key handler) with
/// `trigger`; blocking waits enable checking for the duration of the wait
/// and poll `check` between ticks. Non-blocking paths never look at it.
#[derive(Clone)]
pub struct Escape {
    inner: Arc<EscapeInner>,
}

struct EscapeInner {
    enabled: AtomicBool,
    pending: AtomicBool,
}

impl Escape {
    pub fn new() -> Escape {
        Escape {
            inner: Arc::new(EscapeInner {
                enabled: AtomicBool::new(false),
                pending: AtomicBool::new(false),
            }),
        }
    }

    /// Raise the escape condition. Takes effect at the next `check` inside
    /// an enabled scope.
    #[inline]
    pub fn trigger(&self) {
        self.inner.pending.store(true, Ordering::SeqCst);
    }

    /// Capture the current configuration.
    #[inline]
    pub fn store(&self) -> EscapeConfig {
        EscapeConfig {
            enabled: self.inner.enabled.load(Ordering::SeqCst),
        }
    }

    /// Restore a previously captured configuration.
    #[inline]
    pub fn restore(&self, config: EscapeConfig) {
        self.inner.enabled.store(config.enabled, Ordering::SeqCst);
    }

    /// Enable escape checking.
    #[inline]
    pub fn enable(&self) {
        self.inner.enabled.store(true, Ordering::SeqCst);
    }

    /// Check for an active escape condition, clearing it if consumed.
    /// Returns true only when checking is enabled and the condition was
    /// pending.
    #[inline]
    pub fn check(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst) && self.inner.pending.swap(false, Ordering::SeqCst)
    }
}
