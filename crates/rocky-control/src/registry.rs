//! Registry of tunnel connections waiting to be claimed
//!
//! Tunnel connections arrive on their own port and are parked here under the
//! session id they announced. A handshake coordinator later claims the entry
//! for its session. Arrival and claim may happen in either order.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rocky_proto::SessionId;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct PendingTunnel<T> {
    stream: T,
    registered_at: Instant,
}

/// Concurrent map of session id to unclaimed tunnel connection
///
/// Every entry is handed out at most once: [`SessionRegistry::try_take`] and
/// [`SessionRegistry::claim`] remove atomically.
pub struct SessionRegistry<T> {
    entries: DashMap<SessionId, PendingTunnel<T>>,
    arrivals: Notify,
}

impl<T> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            arrivals: Notify::new(),
        }
    }
}

impl<T> std::fmt::Debug for SessionRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("pending", &self.entries.len())
            .finish()
    }
}

impl<T> SessionRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a tunnel connection under `id`
    ///
    /// A second connection for the same id replaces the first, which is
    /// dropped (and thereby closed). Returns true when an entry was replaced.
    pub fn put(&self, id: SessionId, stream: T) -> bool {
        let replaced = self
            .entries
            .insert(
                id,
                PendingTunnel {
                    stream,
                    registered_at: Instant::now(),
                },
            )
            .is_some();

        if replaced {
            warn!(session_id = %id, "Replaced pending tunnel connection with a newer one");
        } else {
            debug!(session_id = %id, "Tunnel connection parked");
        }

        self.arrivals.notify_waiters();
        replaced
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.entries.contains_key(id)
    }

    /// Atomically remove and return the entry for `id`
    pub fn try_take(&self, id: &SessionId) -> Option<T> {
        self.entries.remove(id).map(|(_, pending)| pending.stream)
    }

    /// Drop the entry for `id`, closing its connection
    pub fn remove(&self, id: &SessionId) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wait up to `wait` for the tunnel connection of `id` and take it
    ///
    /// Returns `None` if nothing arrived in time.
    pub async fn claim(&self, id: &SessionId, wait: Duration) -> Option<T> {
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before checking so an arrival in between is not missed
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(stream) = self.try_take(id) {
                return Some(stream);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_take(id);
            }
        }
    }

    /// Drop entries parked for at least `ttl`; returns how many were evicted
    pub fn evict_older_than(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<SessionId> = self
            .entries
            .iter()
            .filter(|entry| now.duration_since(entry.registered_at) >= ttl)
            .map(|entry| *entry.key())
            .collect();

        let mut evicted = 0;
        for id in expired {
            // Re-check under the shard lock; the entry may have been replaced meanwhile
            if self
                .entries
                .remove_if(&id, |_, pending| now.duration_since(pending.registered_at) >= ttl)
                .is_some()
            {
                warn!(session_id = %id, "Evicted unclaimed tunnel connection");
                evicted += 1;
            }
        }
        evicted
    }
}

/// Periodically evict unclaimed tunnel connections until `shutdown` fires
pub fn spawn_reaper<T>(
    registry: Arc<SessionRegistry<T>>,
    ttl: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
{
    tokio::spawn(async move {
        info!(ttl_secs = ttl.as_secs(), "Unclaimed tunnel reaper started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = registry.evict_older_than(ttl);
                    if evicted > 0 {
                        info!(evicted, pending = registry.len(), "Reaped unclaimed tunnel connections");
                    }
                }
            }
        }
        debug!("Unclaimed tunnel reaper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<SessionRegistry<&'static str>> {
        Arc::new(SessionRegistry::new())
    }

    #[test]
    fn test_put_take() {
        let registry = registry();
        let id = SessionId::new();

        assert!(!registry.put(id, "tunnel"));
        assert!(registry.contains(&id));
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.try_take(&id), Some("tunnel"));
        assert_eq!(registry.try_take(&id), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_put_replaces_existing_entry() {
        let registry = registry();
        let id = SessionId::new();

        registry.put(id, "first");
        assert!(registry.put(id, "second"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.try_take(&id), Some("second"));
    }

    #[test]
    fn test_remove() {
        let registry = registry();
        let id = SessionId::new();

        assert!(!registry.remove(&id));
        registry.put(id, "tunnel");
        assert!(registry.remove(&id));
        assert!(!registry.contains(&id));
    }

    #[tokio::test]
    async fn test_claim_after_arrival() {
        let registry = registry();
        let id = SessionId::new();
        registry.put(id, "early");

        let claimed = registry.claim(&id, Duration::from_millis(10)).await;
        assert_eq!(claimed, Some("early"));
    }

    #[tokio::test]
    async fn test_claim_before_arrival() {
        let registry = registry();
        let id = SessionId::new();

        let arriving = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            arriving.put(SessionId::new(), "unrelated");
            tokio::time::sleep(Duration::from_millis(50)).await;
            arriving.put(id, "late");
        });

        let claimed = registry.claim(&id, Duration::from_secs(1)).await;
        assert_eq!(claimed, Some("late"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_times_out() {
        let registry = registry();
        let id = SessionId::new();

        let started = Instant::now();
        assert_eq!(registry.claim(&id, Duration::from_secs(1)).await, None);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_millis(1500));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exactly_one_claimant_wins() {
        for _ in 0..50 {
            let registry = registry();
            let id = SessionId::new();

            let claimants: Vec<_> = (0..8)
                .map(|_| {
                    let registry = registry.clone();
                    tokio::spawn(async move { registry.claim(&id, Duration::from_millis(200)).await })
                })
                .collect();

            registry.put(id, "tunnel");

            let mut winners = 0;
            for claimant in claimants {
                if claimant.await.unwrap().is_some() {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1);
        }
    }

    #[tokio::test]
    async fn test_distinct_ids_do_not_interfere() {
        let registry = registry();
        let ids: Vec<_> = (0..100).map(|_| SessionId::new()).collect();

        for id in &ids {
            registry.put(*id, "tunnel");
        }
        for id in ids.iter().rev() {
            assert!(registry.claim(id, Duration::from_millis(10)).await.is_some());
        }
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_older_than() {
        let registry = registry();
        let old = SessionId::new();
        let fresh = SessionId::new();

        registry.put(old, "old");
        tokio::time::advance(Duration::from_secs(20)).await;
        registry.put(fresh, "fresh");
        tokio::time::advance(Duration::from_secs(15)).await;

        assert_eq!(registry.evict_older_than(Duration::from_secs(30)), 1);
        assert!(!registry.contains(&old));
        assert!(registry.contains(&fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_evicts_and_stops() {
        let registry = registry();
        let shutdown = CancellationToken::new();
        let reaper = spawn_reaper(
            registry.clone(),
            Duration::from_secs(30),
            Duration::from_secs(5),
            shutdown.clone(),
        );

        registry.put(SessionId::new(), "stale");
        tokio::time::sleep(Duration::from_secs(36)).await;
        assert!(registry.is_empty());

        shutdown.cancel();
        reaper.await.unwrap();
    }
}
