// One-shot wake-up scheduling for proactive token renewal

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

/// Holds at most one pending wake-up
///
/// Scheduling always cancels the previous wake first, so repeated logins or
/// refreshes never leave orphaned timers behind. Must be used from within a
/// Tokio runtime.
#[derive(Default)]
pub struct SessionClock {
    slot: Arc<Mutex<WakeSlot>>,
}

#[derive(Default)]
struct WakeSlot {
    /// Bumped on every schedule/cancel; a woken timer whose generation is
    /// stale does nothing
    generation: u64,
    pending: Option<PendingWake>,
}

struct PendingWake {
    deadline: DateTime<Utc>,
    handle: JoinHandle<()>,
}

impl SessionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a wake at `at`, replacing any pending one
    ///
    /// Instants in the past fire on the next scheduler tick.
    pub fn schedule_at<F, Fut>(&self, at: DateTime<Utc>, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        let mut slot = self.lock();
        if let Some(previous) = slot.pending.take() {
            previous.handle.abort();
        }
        slot.generation += 1;
        let generation = slot.generation;

        let shared = Arc::clone(&self.slot);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slot = shared.lock().unwrap_or_else(PoisonError::into_inner);
                if slot.generation != generation {
                    return;
                }
                // Disarm before running so a callback that reschedules does not abort itself
                slot.pending = None;
            }
            callback().await;
        });

        tracing::debug!(
            deadline = %at.to_rfc3339(),
            delay_ms = delay.as_millis() as u64,
            "Session wake scheduled"
        );
        slot.pending = Some(PendingWake {
            deadline: at,
            handle,
        });
    }

    /// Cancel the pending wake, if any
    pub fn cancel(&self) {
        let mut slot = self.lock();
        slot.generation += 1;
        if let Some(previous) = slot.pending.take() {
            previous.handle.abort();
            tracing::debug!("Session wake cancelled");
        }
    }

    /// Whether a wake is pending
    pub fn is_armed(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Instant the pending wake fires at
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.lock().pending.as_ref().map(|p| p.deadline)
    }

    fn lock(&self) -> MutexGuard<'_, WakeSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SessionClock {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn bump(count: &Arc<AtomicUsize>) -> impl FnOnce() -> std::future::Ready<()> + Send + 'static {
        let count = Arc::clone(count);
        move || {
            count.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_at_deadline() {
        let clock = SessionClock::new();
        let fired = counter();

        clock.schedule_at(Utc::now() + chrono::Duration::seconds(30), bump(&fired));
        assert!(clock.is_armed());

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!clock.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_pending_wake() {
        let clock = SessionClock::new();
        let first = counter();
        let second = counter();
        let third = counter();

        clock.schedule_at(Utc::now() + chrono::Duration::seconds(10), bump(&first));
        clock.schedule_at(Utc::now() + chrono::Duration::seconds(20), bump(&second));
        let last = Utc::now() + chrono::Duration::seconds(5);
        clock.schedule_at(last, bump(&third));
        assert_eq!(clock.deadline(), Some(last));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert_eq!(third.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_then_schedule_arms_exactly_one() {
        let clock = SessionClock::new();
        let cancelled = counter();
        let armed = counter();

        // Nothing scheduled yet
        clock.cancel();

        clock.schedule_at(Utc::now() + chrono::Duration::seconds(10), bump(&cancelled));
        clock.cancel();
        assert!(!clock.is_armed());

        clock.schedule_at(Utc::now() + chrono::Duration::seconds(10), bump(&armed));
        assert!(clock.is_armed());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
        assert_eq!(armed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_instant_fires_next_tick() {
        let clock = SessionClock::new();
        let fired = counter();

        clock.schedule_at(Utc::now() - chrono::Duration::seconds(10), bump(&fired));
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_may_reschedule_itself() {
        let clock = Arc::new(SessionClock::new());
        let finished = counter();
        let rearmed = counter();

        let inner_clock = Arc::clone(&clock);
        let inner_finished = Arc::clone(&finished);
        let inner_rearmed = Arc::clone(&rearmed);
        clock.schedule_at(Utc::now() + chrono::Duration::seconds(1), move || async move {
            inner_clock.schedule_at(
                Utc::now() + chrono::Duration::seconds(100),
                bump(&inner_rearmed),
            );
            tokio::time::sleep(Duration::from_secs(1)).await;
            inner_finished.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(clock.is_armed());
        assert_eq!(rearmed.load(Ordering::SeqCst), 0);
    }
}
