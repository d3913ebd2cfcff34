// Single-flight re-authentication
//
// Concurrent callers that discover an expired session at the same time share
// one exchange and all observe its outcome.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;

use crate::error::AuthError;

type Outcome<T> = Result<T, AuthError>;

struct InFlight<T> {
    id: u64,
    scope: u64,
    outcome: Shared<BoxFuture<'static, Outcome<T>>>,
}

/// Coalesces re-authentication attempts
///
/// Only the attempt is coalesced; retries are the caller's decision. The
/// in-flight marker is cleared as soon as the exchange resolves, on failure
/// too, so a later call starts a fresh attempt instead of replaying a stale
/// result. Callers only join an exchange started under the same scope.
pub struct ReauthCoordinator<T> {
    in_flight: Arc<Mutex<Option<InFlight<T>>>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl<T> ReauthCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a coordinator whose exchanges are bounded by `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
            timeout,
        }
    }

    /// Run `exchange`, or join the one already in flight
    pub async fn reauthenticate<F, Fut>(&self, exchange: F) -> Outcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        self.reauthenticate_scoped(0, exchange, |timeout: Duration| async move {
            Err::<T, _>(AuthError::TimedOut(timeout))
        })
        .await
    }

    /// Run `exchange` under `scope`, or join the one in flight for that scope
    ///
    /// An exchange from another scope is never joined; the new one takes over
    /// the slot. When the deadline passes the exchange is dropped and
    /// `on_timeout` produces the outcome every waiter sees, so it is the place
    /// to undo whatever the dropped exchange left half done.
    pub async fn reauthenticate_scoped<F, Fut, E, EFut>(
        &self,
        scope: u64,
        exchange: F,
        on_timeout: E,
    ) -> Outcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
        E: FnOnce(Duration) -> EFut + Send + 'static,
        EFut: Future<Output = Outcome<T>> + Send + 'static,
    {
        let outcome = {
            let mut slot = self.in_flight.lock().await;
            let joinable = match slot.as_ref() {
                Some(current) if current.scope == scope => {
                    tracing::debug!(exchange_id = current.id, "Joining in-flight re-authentication");
                    Some(current.outcome.clone())
                }
                Some(previous) => {
                    tracing::debug!(
                        exchange_id = previous.id,
                        "In-flight re-authentication belongs to an older scope, not joining"
                    );
                    None
                }
                None => None,
            };

            match joinable {
                Some(outcome) => outcome,
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                    tracing::debug!(exchange_id = id, "Starting re-authentication exchange");

                    let outcome = self.bounded(id, exchange(), on_timeout).boxed().shared();
                    *slot = Some(InFlight {
                        id,
                        scope,
                        outcome: outcome.clone(),
                    });
                    outcome
                }
            }
        };

        outcome.await
    }

    /// Number of exchanges started so far
    pub fn exchanges_started(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Whether an exchange is currently outstanding
    pub async fn is_in_flight(&self) -> bool {
        self.in_flight.lock().await.is_some()
    }

    /// Wrap the exchange with its deadline and the marker release
    fn bounded<Fut, E, EFut>(
        &self,
        id: u64,
        exchange: Fut,
        on_timeout: E,
    ) -> impl Future<Output = Outcome<T>> + Send + 'static
    where
        Fut: Future<Output = Outcome<T>> + Send + 'static,
        E: FnOnce(Duration) -> EFut + Send + 'static,
        EFut: Future<Output = Outcome<T>> + Send + 'static,
    {
        let in_flight = Arc::clone(&self.in_flight);
        let timeout = self.timeout;

        async move {
            let outcome = match tokio::time::timeout(timeout, exchange).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(
                        exchange_id = id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Re-authentication exchange timed out"
                    );
                    on_timeout(timeout).await
                }
            };

            let mut slot = in_flight.lock().await;
            if slot.as_ref().map(|current| current.id) == Some(id) {
                *slot = None;
            }

            outcome
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_concurrent_callers_share_one_exchange() {
        let coordinator = Arc::new(ReauthCoordinator::<String>::new(Duration::from_secs(30)));
        let calls = Arc::new(AtomicUsize::new(0));
        let (release, gate) = oneshot::channel::<()>();
        let gate = gate.shared();

        let mut waiters = Vec::new();
        for _ in 0..8 {
            let coordinator = Arc::clone(&coordinator);
            let calls = Arc::clone(&calls);
            let gate = gate.clone();
            waiters.push(tokio::spawn(async move {
                coordinator
                    .reauthenticate(move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let _ = gate.await;
                        Ok("fresh-token".to_string())
                    })
                    .await
            }));
        }

        // Let every waiter reach the coordinator before the exchange resolves
        while !coordinator.is_in_flight().await {
            tokio::task::yield_now().await;
        }
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        release.send(()).unwrap();

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Ok("fresh-token".to_string()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.exchanges_started(), 1);
        assert!(!coordinator.is_in_flight().await);
    }

    #[tokio::test]
    async fn test_joiner_observes_leader_outcome() {
        let coordinator = ReauthCoordinator::<u32>::new(Duration::from_secs(30));
        let (release, gate) = oneshot::channel::<()>();

        let mut leader = task::spawn(coordinator.reauthenticate(|| async move {
            let _ = gate.await;
            Ok(1)
        }));
        assert_pending!(leader.poll());

        let mut joiner = task::spawn(coordinator.reauthenticate(|| async { Ok(2) }));
        assert_pending!(joiner.poll());

        release.send(()).unwrap();
        assert_eq!(assert_ready!(leader.poll()), Ok(1));
        assert_eq!(assert_ready!(joiner.poll()), Ok(1));
        assert_eq!(coordinator.exchanges_started(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_shared_then_cleared() {
        let coordinator = ReauthCoordinator::<u32>::new(Duration::from_secs(30));
        let (release, gate) = oneshot::channel::<()>();

        let mut leader = task::spawn(coordinator.reauthenticate(|| async move {
            let _ = gate.await;
            Err(AuthError::RefreshRejected("revoked".to_string()))
        }));
        assert_pending!(leader.poll());
        let mut joiner = task::spawn(coordinator.reauthenticate(|| async { Ok(2) }));
        assert_pending!(joiner.poll());

        release.send(()).unwrap();
        let expected = Err(AuthError::RefreshRejected("revoked".to_string()));
        assert_eq!(assert_ready!(leader.poll()), expected);
        assert_eq!(assert_ready!(joiner.poll()), expected);

        // Marker cleared: the next call runs a new exchange
        let retry = coordinator.reauthenticate(|| async { Ok(3) }).await;
        assert_eq!(retry, Ok(3));
        assert_eq!(coordinator.exchanges_started(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_exchange_times_out() {
        let coordinator = ReauthCoordinator::<u32>::new(Duration::from_secs(5));

        let outcome = coordinator
            .reauthenticate(|| std::future::pending::<Outcome<u32>>())
            .await;
        assert_eq!(outcome, Err(AuthError::TimedOut(Duration::from_secs(5))));
        assert!(!coordinator.is_in_flight().await);

        let outcome = coordinator.reauthenticate(|| async { Ok(7) }).await;
        assert_eq!(outcome, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_runs_cleanup_before_waiters_resume() {
        let coordinator = ReauthCoordinator::<u32>::new(Duration::from_secs(5));
        let cleaned = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&cleaned);
        let outcome = coordinator
            .reauthenticate_scoped(
                1,
                || std::future::pending::<Outcome<u32>>(),
                move |timeout| async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Err(AuthError::TimedOut(timeout))
                },
            )
            .await;

        assert_eq!(outcome, Err(AuthError::TimedOut(Duration::from_secs(5))));
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_in_flight().await);
    }

    #[tokio::test]
    async fn test_other_scope_is_not_joined() {
        let coordinator = ReauthCoordinator::<u32>::new(Duration::from_secs(30));
        let (release, gate) = oneshot::channel::<()>();
        let timed_out = |timeout: Duration| async move { Err::<u32, _>(AuthError::TimedOut(timeout)) };

        let mut stale = task::spawn(coordinator.reauthenticate_scoped(
            1,
            || async move {
                let _ = gate.await;
                Err(AuthError::NotSignedIn)
            },
            timed_out,
        ));
        assert_pending!(stale.poll());

        // A newer scope starts its own exchange instead of inheriting the old outcome
        let fresh = coordinator
            .reauthenticate_scoped(2, || async { Ok(2) }, timed_out)
            .await;
        assert_eq!(fresh, Ok(2));
        assert_eq!(coordinator.exchanges_started(), 2);

        release.send(()).unwrap();
        assert_eq!(assert_ready!(stale.poll()), Err(AuthError::NotSignedIn));
        assert!(!coordinator.is_in_flight().await);
    }
}
