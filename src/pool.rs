//! Generic per-id exclusive connection pool
//!
//! C3 (IMAP) and C4 (SMTP) share the same contract shape (spec §4.4: "same
//! contract shape as C3"), so the per-id exclusivity, health-probe-before-use,
//! and LRU-eviction mechanics live here once; `imap_pool.rs` and `smtp_pool.rs`
//! each supply a [`ProtocolOps`] impl for their handle type.
//!
//! State machine per handle, as specified: `Building -> Idle <-> InUse ->
//! Closing -> Gone`, with no transition back out of `Closing`. A handle is
//! represented here simply as present (Idle/InUse, collapsed since the
//! per-id mutex already serializes InUse) or absent (Gone); `Closing` is the
//! brief window inside `checkout`/the eviction sweep where a bad handle is
//! dropped before a replacement is built.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use crate::errors::{AppError, AppResult};

/// Liveness + lifecycle operations a protocol pool must supply.
///
/// `H` is the live handle type (an authenticated `async-imap` session or
/// `lettre` transport). All network I/O happens inside these calls;
/// [`IdKeyedPool`] itself never touches the network.
#[async_trait]
pub trait ProtocolOps: Send + Sync {
    type Handle: Send;

    /// Build a brand new authenticated handle for `inbox_id`.
    async fn build(&self, inbox_id: &str) -> AppResult<Self::Handle>;

    /// Liveness probe (IMAP `NOOP`, SMTP `NOOP`/`RSET`). Failure means the
    /// handle must be rebuilt.
    async fn probe(&self, handle: &mut Self::Handle) -> AppResult<()>;

    /// Best-effort graceful close; errors are swallowed (handle is being
    /// discarded either way).
    async fn close(&self, handle: Self::Handle);
}

struct Entry<H> {
    handle: H,
    last_used_at: Instant,
}

/// One inbox id's exclusive slot: an optional live handle behind its own
/// mutex, so `checkout(id)` for two different ids never blocks on each
/// other, while two `checkout` calls for the *same* id serialize on this
/// mutex's own FIFO-ish wait queue (spec §4.3's no-starvation requirement).
struct Slot<H> {
    entry: Arc<Mutex<Option<Entry<H>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Per-id statistics, surfaced by the `pool_stats` operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub live: bool,
}

/// Outcome reported at `checkin`: whether the handle is still good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckinOutcome {
    Ok,
    Failed,
}

/// A checked-out handle, borrowed exclusively for the duration of the
/// request. Must be returned via [`IdKeyedPool::checkin`].
pub struct Checkout<H> {
    guard: OwnedMutexGuard<Option<Entry<H>>>,
    pub was_hit: bool,
}

impl<H> Checkout<H> {
    pub fn handle_mut(&mut self) -> &mut H {
        &mut self.guard.as_mut().expect("checkout always holds a handle").handle
    }
}

/// Generic per-id exclusive pool shared by C3 and C4.
pub struct IdKeyedPool<P: ProtocolOps> {
    ops: P,
    slots: Mutex<HashMap<String, Arc<Slot<P::Handle>>>>,
    lru: Mutex<Vec<String>>,
    max_live: usize,
    idle_probe_threshold: Duration,
}

impl<P: ProtocolOps> IdKeyedPool<P> {
    pub fn new(ops: P, max_live: usize, idle_probe_threshold: Duration) -> Self {
        Self {
            ops,
            slots: Mutex::new(HashMap::new()),
            lru: Mutex::new(Vec::new()),
            max_live,
            idle_probe_threshold,
        }
    }

    async fn slot_for(&self, inbox_id: &str) -> Arc<Slot<P::Handle>> {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get(inbox_id) {
            return Arc::clone(slot);
        }
        let slot = Arc::new(Slot {
            entry: Arc::new(Mutex::new(None)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        });
        slots.insert(inbox_id.to_owned(), Arc::clone(&slot));
        slot
    }

    async fn touch_lru(&self, inbox_id: &str) {
        let mut lru = self.lru.lock().await;
        lru.retain(|id| id != inbox_id);
        lru.push(inbox_id.to_owned());
    }

    /// Evict least-recently-used ids' live handles (not their slots) down to
    /// `max_live`. Mirrors `CursorStore::evict_if_needed`'s shape: pick
    /// oldest, remove, close gracefully.
    async fn evict_if_needed(&self) {
        let over = {
            let lru = self.lru.lock().await;
            lru.len().saturating_sub(self.max_live)
        };
        if over == 0 {
            return;
        }
        let victims: Vec<String> = {
            let mut lru = self.lru.lock().await;
            lru.drain(0..over).collect()
        };
        for id in victims {
            let slot = self.slot_for(&id).await;
            let mut entry_guard = slot.entry.lock().await;
            if let Some(entry) = entry_guard.take() {
                self.ops.close(entry.handle).await;
            }
        }
    }

    /// `checkout(inbox_id) -> Handle | Error`
    ///
    /// Acquires the id's exclusive slot, reusing a healthy idle handle when
    /// possible (a *hit*), rebuilding otherwise (a *miss*). Two consecutive
    /// rebuild failures surface as `UpstreamUnavailable`.
    pub async fn checkout(&self, inbox_id: &str) -> AppResult<Checkout<P::Handle>> {
        let slot = self.slot_for(inbox_id).await;
        self.touch_lru(inbox_id).await;
        self.evict_if_needed().await;

        let mut guard = Arc::clone(&slot.entry).lock_owned().await;

        if let Some(entry) = guard.as_mut() {
            let idle_for = entry.last_used_at.elapsed();
            let needs_probe = idle_for >= self.idle_probe_threshold;
            let healthy = if needs_probe {
                self.ops.probe(&mut entry.handle).await.is_ok()
            } else {
                true
            };
            if healthy {
                entry.last_used_at = Instant::now();
                slot.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Checkout { guard, was_hit: true });
            }
            let stale = guard.take().expect("checked Some above");
            self.ops.close(stale.handle).await;
        }

        let mut last_err = None;
        for attempt in 0..2 {
            match self.ops.build(inbox_id).await {
                Ok(handle) => {
                    *guard = Some(Entry {
                        handle,
                        last_used_at: Instant::now(),
                    });
                    slot.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(Checkout { guard, was_hit: false });
                }
                Err(e) => {
                    warn!(attempt, error = %e, "rebuild attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(AppError::UpstreamUnavailable(format!(
            "two rebuild attempts failed: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// `checkin(handle, outcome)` — if `outcome = Failed`, the handle is
    /// closed and dropped so the next checkout reconnects.
    pub async fn checkin(&self, mut checkout: Checkout<P::Handle>, outcome: CheckinOutcome) {
        if outcome == CheckinOutcome::Failed
            && let Some(entry) = checkout.guard.take()
        {
            self.ops.close(entry.handle).await;
        }
    }

    /// `stats(inbox_id) -> {hits, misses, live}` (in-memory view; the
    /// authoritative counters live in C2 via `incr_stat`, per spec §4.3).
    pub async fn local_stats(&self, inbox_id: &str) -> PoolStats {
        let slots = self.slots.lock().await;
        let Some(slot) = slots.get(inbox_id) else {
            return PoolStats::default();
        };
        let live = slot.entry.lock().await.is_some();
        PoolStats {
            hits: slot.hits.load(Ordering::Relaxed),
            misses: slot.misses.load(Ordering::Relaxed),
            live,
        }
    }

    /// Whether a live handle is currently held for `inbox_id`, without
    /// taking it out of the pool. Used by the keep-alive worker to decide
    /// whether it can NOOP directly or must defer (spec §4.5 step 2).
    pub async fn has_live_handle(&self, inbox_id: &str) -> bool {
        let slots = self.slots.lock().await;
        let Some(slot) = slots.get(inbox_id) else {
            return false;
        };
        slot.entry.lock().await.is_some()
    }

    /// Issue a protocol NOOP against the live handle for `inbox_id`, if one
    /// is held. Returns `Ok(false)` if no live handle exists (caller should
    /// still refresh the store TTL).
    pub async fn noop_if_live(&self, inbox_id: &str) -> AppResult<bool> {
        let slots = self.slots.lock().await;
        let Some(slot) = slots.get(inbox_id).cloned() else {
            return Ok(false);
        };
        drop(slots);
        let mut guard = slot.entry.lock().await;
        let Some(entry) = guard.as_mut() else {
            return Ok(false);
        };
        self.ops.probe(&mut entry.handle).await?;
        entry.last_used_at = Instant::now();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    /// A fake [`ProtocolOps`] whose handle is just an id tag; `build` counts
    /// calls and `probe` can be told to fail once via `fail_next_probe`, so
    /// tests can drive the checkout/probe/rebuild state machine directly
    /// without a real IMAP/SMTP connection.
    struct FakeOps {
        builds: AtomicU64,
        fail_next_probe: AtomicBool,
        fail_builds: AtomicU64,
    }

    impl FakeOps {
        fn new() -> Self {
            Self {
                builds: AtomicU64::new(0),
                fail_next_probe: AtomicBool::new(false),
                fail_builds: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl ProtocolOps for FakeOps {
        type Handle = u64;

        async fn build(&self, _inbox_id: &str) -> AppResult<Self::Handle> {
            if self.fail_builds.load(Ordering::SeqCst) > 0 {
                self.fail_builds.fetch_sub(1, Ordering::SeqCst);
                return Err(AppError::UpstreamAuthFailed("fake build failure".to_owned()));
            }
            Ok(self.builds.fetch_add(1, Ordering::SeqCst))
        }

        async fn probe(&self, _handle: &mut Self::Handle) -> AppResult<()> {
            if self.fail_next_probe.swap(false, Ordering::SeqCst) {
                return Err(AppError::UpstreamProtocolError("fake probe failure".to_owned()));
            }
            Ok(())
        }

        async fn close(&self, _handle: Self::Handle) {}
    }

    fn pool_with(ops: FakeOps) -> IdKeyedPool<FakeOps> {
        IdKeyedPool::new(ops, 512, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn cold_then_warm_reports_one_miss_then_hits() {
        let pool = pool_with(FakeOps::new());

        let first = pool.checkout("a@x.com").await.expect("checkout ok");
        assert!(!first.was_hit);
        pool.checkin(first, CheckinOutcome::Ok).await;

        for _ in 0..5 {
            let checkout = pool.checkout("a@x.com").await.expect("checkout ok");
            assert!(checkout.was_hit);
            pool.checkin(checkout, CheckinOutcome::Ok).await;
        }

        let stats = pool.local_stats("a@x.com").await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 5);
    }

    #[tokio::test]
    async fn different_ids_get_independent_handles() {
        let pool = pool_with(FakeOps::new());

        let a = pool.checkout("a@x.com").await.expect("checkout ok");
        let b = pool.checkout("b@x.com").await.expect("checkout ok");
        assert!(!a.was_hit);
        assert!(!b.was_hit);
        pool.checkin(a, CheckinOutcome::Ok).await;
        pool.checkin(b, CheckinOutcome::Ok).await;

        let stats_a = pool.local_stats("a@x.com").await;
        let stats_b = pool.local_stats("b@x.com").await;
        assert_eq!(stats_a.misses, 1);
        assert_eq!(stats_b.misses, 1);
    }

    #[tokio::test]
    async fn failed_checkin_forces_next_checkout_to_rebuild() {
        let pool = pool_with(FakeOps::new());

        let first = pool.checkout("a@x.com").await.expect("checkout ok");
        pool.checkin(first, CheckinOutcome::Failed).await;

        let second = pool.checkout("a@x.com").await.expect("checkout ok");
        assert!(!second.was_hit, "handle was dropped on failed checkin, so this must be a miss");
        pool.checkin(second, CheckinOutcome::Ok).await;

        let stats = pool.local_stats("a@x.com").await;
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hits, 0);
    }

    #[tokio::test]
    async fn failed_probe_rebuilds_once_and_reports_a_miss() {
        // idle_probe_threshold is 0 so every checkout re-probes.
        let ops = FakeOps::new();
        let pool = IdKeyedPool::new(ops, 512, Duration::from_secs(0));

        let first = pool.checkout("a@x.com").await.expect("checkout ok");
        pool.checkin(first, CheckinOutcome::Ok).await;

        // Force the next probe (on the idle handle above) to fail, so
        // checkout must close it and build a fresh one.
        pool.ops.fail_next_probe.store(true, Ordering::SeqCst);
        let second = pool.checkout("a@x.com").await.expect("checkout rebuilds transparently");
        assert!(!second.was_hit);
        pool.checkin(second, CheckinOutcome::Ok).await;

        let stats = pool.local_stats("a@x.com").await;
        assert_eq!(stats.misses, 2);
    }

    #[tokio::test]
    async fn two_failed_rebuild_attempts_surface_as_upstream_unavailable() {
        let mut ops = FakeOps::new();
        *ops.fail_builds.get_mut() = 2;
        let pool = pool_with(ops);

        let err = pool.checkout("a@x.com").await.expect_err("both rebuild attempts fail");
        assert_eq!(err.kind(), "upstream_unavailable");
    }

    #[tokio::test]
    async fn concurrent_checkouts_for_same_id_are_serialized() {
        use std::sync::atomic::AtomicUsize;

        let pool = Arc::new(pool_with(FakeOps::new()));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = Arc::clone(&pool);
            let concurrent = Arc::clone(&concurrent);
            let max_concurrent = Arc::clone(&max_concurrent);
            handles.push(tokio::spawn(async move {
                let checkout = pool.checkout("shared@x.com").await.expect("checkout ok");
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
                pool.checkin(checkout, CheckinOutcome::Ok).await;
            }));
        }
        for handle in handles {
            handle.await.expect("task panicked");
        }

        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1, "no two checkouts for the same id overlapped");
        let stats = pool.local_stats("shared@x.com").await;
        assert_eq!(stats.hits + stats.misses, 16);
    }

    #[tokio::test]
    async fn eviction_closes_least_recently_used_handle_past_capacity() {
        let pool = IdKeyedPool::new(FakeOps::new(), 1, Duration::from_secs(3600));

        let a = pool.checkout("a@x.com").await.expect("checkout ok");
        pool.checkin(a, CheckinOutcome::Ok).await;
        assert!(pool.local_stats("a@x.com").await.live);

        // Checking out a second id over capacity 1 evicts "a"'s live handle.
        let b = pool.checkout("b@x.com").await.expect("checkout ok");
        pool.checkin(b, CheckinOutcome::Ok).await;

        assert!(!pool.local_stats("a@x.com").await.live, "least-recently-used handle should be evicted");
        assert!(pool.local_stats("b@x.com").await.live);
    }
}
