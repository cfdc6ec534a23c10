use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::sync::Notify;

/// Coalescing "recompute the topology" signal.
///
/// Any number of triggers between two [`RecalcSignal::take_pending`] calls
/// collapse into a single pending recompute. The flag is set before waking
/// the listener so the final trigger is never lost.
#[derive(Debug, Default)]
pub struct RecalcSignal {
    pending: AtomicBool,
    notify: Notify,
}

impl RecalcSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.pending.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Clears the pending flag, returning whether a recompute was requested.
    pub fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Waits until [`RecalcSignal::trigger`] is called.
    ///
    /// A trigger that happened while nobody was waiting is remembered as a
    /// permit, so a listener never sleeps through a request.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn repeated_triggers_collapse_into_one_pending_recompute() {
        let signal = RecalcSignal::new();

        signal.trigger();
        signal.trigger();
        signal.trigger();

        assert!(signal.take_pending(), "a recompute should be pending");
        assert!(!signal.take_pending(), "triggers must coalesce into one");
    }

    #[tokio::test]
    async fn trigger_before_wait_is_not_lost() {
        let signal = Arc::new(RecalcSignal::new());
        signal.trigger();

        let waited = tokio::time::timeout(Duration::from_secs(1), signal.notified()).await;

        assert!(waited.is_ok(), "stored permit should wake the listener");
        assert!(signal.is_pending());
    }
}
