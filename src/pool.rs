//! Circuit pool
//!
//! Keeps warm, prebuilt circuits keyed by isolation key. The pool for the
//! shared (`None`) key always exists; other keys spawn subpools lazily and
//! are garbage-collected after an idle timeout.
//!
//! Concurrency: the pool map is a plain mutex held only for structural
//! edits; builds happen outside it, at most one in flight per subpool.
//! `acquire` blocks when a subpool is at `MaxCircuits` until a circuit is
//! released or closed.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::config::TorConfig;
use crate::error::{Result, TorError};
use crate::events::{Event, EventSink, SharedEventSink};
use crate::isolation::IsolationKey;
use crate::path::LastHop;
use crate::protocol::{CircuitHandle, CircuitPurpose};

/// Builds circuits on behalf of the pool and the onion-service client. The
/// orchestrator supplies the real implementation (path selection + link +
/// circuit engine); tests supply mocks.
pub trait CircuitFactory: Send + Sync {
    fn build(
        &self,
        isolation: IsolationKey,
        last_hop: LastHop,
        purpose: CircuitPurpose,
    ) -> BoxFuture<'_, Result<CircuitHandle>>;
}

/// Pool statistics for the observability layer.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub built: AtomicU64,
    pub evicted: AtomicU64,
}

/// Point-in-time snapshot of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub built: u64,
    pub evicted: u64,
}

struct PoolEntry {
    warm: Vec<CircuitHandle>,
    /// Circuits alive for this key: warm plus checked out
    total: usize,
    last_acquire: Instant,
    /// Serializes builds: one in flight per subpool
    build_lock: Arc<tokio::sync::Mutex<()>>,
    /// Woken on release/eviction so capped acquirers can retry
    released: Arc<Notify>,
}

impl PoolEntry {
    fn new() -> Self {
        Self {
            warm: Vec::new(),
            total: 0,
            last_acquire: Instant::now(),
            build_lock: Arc::new(tokio::sync::Mutex::new(())),
            released: Arc::new(Notify::new()),
        }
    }
}

/// The circuit pool.
pub struct CircuitPool {
    entries: Mutex<HashMap<IsolationKey, PoolEntry>>,
    factory: Arc<dyn CircuitFactory>,
    min_circuits: usize,
    max_circuits: usize,
    max_dirtiness: Duration,
    idle_timeout: Duration,
    events: SharedEventSink,
    pub stats: PoolStats,
}

impl CircuitPool {
    pub fn new(
        factory: Arc<dyn CircuitFactory>,
        config: &TorConfig,
        events: SharedEventSink,
    ) -> Arc<Self> {
        let mut entries = HashMap::new();
        entries.insert(IsolationKey::none(), PoolEntry::new());
        Arc::new(Self {
            entries: Mutex::new(entries),
            factory,
            min_circuits: config.min_circuits,
            max_circuits: config.max_circuits,
            max_dirtiness: config.max_circuit_dirtiness,
            idle_timeout: config.pool_idle_timeout,
            events,
            stats: PoolStats::default(),
        })
    }

    async fn close_evicted(&self, circuit: CircuitHandle, reason: &str) {
        self.events.publish(Event::CircuitClosed {
            circ_id: circuit.circ_id,
            reason: reason.into(),
        });
        circuit.close().await;
    }

    fn circuit_usable(&self, circuit: &CircuitHandle) -> bool {
        circuit.is_open()
            && circuit
                .dirty_age()
                .map(|age| age < self.max_dirtiness)
                .unwrap_or(true)
    }

    /// Get an open, non-dirty circuit for this isolation key, building one
    /// if needed. Blocks at `MaxCircuits` until a release or closure.
    pub async fn acquire(&self, key: &IsolationKey, last_hop: LastHop) -> Result<CircuitHandle> {
        loop {
            let (build_lock, released) = {
                let mut entries = self.entries.lock().expect("lock poisoned");
                let entry = entries
                    .entry(key.clone())
                    .or_insert_with(PoolEntry::new);
                entry.last_acquire = Instant::now();

                while let Some(circuit) = entry.warm.pop() {
                    if self.circuit_usable(&circuit) {
                        self.stats.hits.fetch_add(1, Ordering::Relaxed);
                        log::debug!(
                            "pool hit for key {} (circ {})",
                            key.tag(),
                            circuit.circ_id
                        );
                        return Ok(circuit);
                    }
                    entry.total -= 1;
                    self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                }

                if entry.total >= self.max_circuits {
                    // At capacity with nothing warm: wait for a release.
                    (None, entry.released.clone())
                } else {
                    entry.total += 1; // reserve a build slot
                    (Some(entry.build_lock.clone()), entry.released.clone())
                }
            };

            let Some(build_lock) = build_lock else {
                // notify_waiters does not store permits, so a release that
                // lands between dropping the map lock and parking here
                // would otherwise be missed; the timeout bounds that race.
                log::debug!("pool for key {} at capacity; waiting", key.tag());
                let _ = tokio::time::timeout(Duration::from_millis(500), released.notified()).await;
                continue;
            };

            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            let _build_guard = build_lock.lock().await;

            // A release may have landed while we waited on the build lock.
            {
                let mut entries = self.entries.lock().expect("lock poisoned");
                if let Some(entry) = entries.get_mut(key) {
                    while let Some(circuit) = entry.warm.pop() {
                        if self.circuit_usable(&circuit) {
                            entry.total -= 1; // give back the reserved slot
                            self.stats.hits.fetch_add(1, Ordering::Relaxed);
                            return Ok(circuit);
                        }
                        entry.total -= 1;
                        self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            match self
                .factory
                .build(key.clone(), last_hop.clone(), CircuitPurpose::General)
                .await
            {
                Ok(circuit) => {
                    self.stats.built.fetch_add(1, Ordering::Relaxed);
                    return Ok(circuit);
                }
                Err(e) => {
                    let mut entries = self.entries.lock().expect("lock poisoned");
                    if let Some(entry) = entries.get_mut(key) {
                        entry.total = entry.total.saturating_sub(1);
                        entry.released.notify_waiters();
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Return a circuit to the pool. Kept only while open and under the
    /// dirtiness limit; otherwise it is closed and evicted.
    pub async fn release(&self, circuit: CircuitHandle) {
        let keep = self.circuit_usable(&circuit);
        let key = circuit.isolation.clone();

        if keep {
            let mut entries = self.entries.lock().expect("lock poisoned");
            if let Some(entry) = entries.get_mut(&key) {
                entry.warm.push(circuit);
                entry.released.notify_waiters();
                return;
            }
        }

        // Pool gone or circuit unusable: evict.
        self.stats.evicted.fetch_add(1, Ordering::Relaxed);
        {
            let mut entries = self.entries.lock().expect("lock poisoned");
            if let Some(entry) = entries.get_mut(&key) {
                entry.total = entry.total.saturating_sub(1);
                entry.released.notify_waiters();
            }
        }
        self.close_evicted(circuit, "unusable on release").await;
    }

    /// One maintenance pass: evict dead/dirty warm circuits, GC idle
    /// subpools, and top up pools below the minimum. Returns the circuits
    /// closed so the caller can await their teardown.
    pub async fn maintain(&self) {
        let mut to_close: Vec<CircuitHandle> = Vec::new();
        let mut to_build: Vec<IsolationKey> = Vec::new();

        {
            let mut entries = self.entries.lock().expect("lock poisoned");
            let idle_timeout = self.idle_timeout;

            entries.retain(|key, entry| {
                // Evict closed or dirty warm circuits.
                let mut kept = Vec::with_capacity(entry.warm.len());
                for circuit in entry.warm.drain(..) {
                    if self.circuit_usable(&circuit) {
                        kept.push(circuit);
                    } else {
                        entry.total = entry.total.saturating_sub(1);
                        self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                        to_close.push(circuit);
                    }
                }
                entry.warm = kept;
                entry.released.notify_waiters();

                // GC idle non-default subpools with nothing outstanding.
                let keep_pool = key.is_none()
                    || entry.total > 0
                    || entry.last_acquire.elapsed() < idle_timeout;
                if !keep_pool {
                    log::debug!("garbage-collecting idle pool {}", key.tag());
                }
                keep_pool
            });

            for (key, entry) in entries.iter_mut() {
                if entry.warm.len() < self.min_circuits
                    && entry.total < self.max_circuits
                    && entry.build_lock.try_lock().is_ok()
                {
                    entry.total += 1;
                    to_build.push(key.clone());
                }
            }
        }

        for circuit in to_close {
            self.close_evicted(circuit, "expired or closed").await;
        }

        for key in to_build {
            match self
                .factory
                .build(key.clone(), LastHop::Exit { port: 443 }, CircuitPurpose::General)
                .await
            {
                Ok(circuit) => {
                    self.stats.built.fetch_add(1, Ordering::Relaxed);
                    let mut entries = self.entries.lock().expect("lock poisoned");
                    if let Some(entry) = entries.get_mut(&key) {
                        entry.warm.push(circuit);
                        entry.released.notify_waiters();
                    }
                }
                Err(e) => {
                    log::warn!("prebuild for pool {} failed: {}", key.tag(), e);
                    let mut entries = self.entries.lock().expect("lock poisoned");
                    if let Some(entry) = entries.get_mut(&key) {
                        entry.total = entry.total.saturating_sub(1);
                    }
                }
            }
        }
    }

    /// Background prebuilding loop; runs until `shutdown` flips.
    pub async fn run_maintenance(
        self: Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = tick.tick() => self.maintain().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Close every pooled circuit (shutdown path).
    pub async fn close_all(&self) {
        let circuits: Vec<CircuitHandle> = {
            let mut entries = self.entries.lock().expect("lock poisoned");
            entries
                .values_mut()
                .flat_map(|entry| {
                    entry.total = 0;
                    entry.warm.drain(..)
                })
                .collect()
        };
        for circuit in circuits {
            self.close_evicted(circuit, "shutdown").await;
        }
    }

    pub fn stats_snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            built: self.stats.built.load(Ordering::Relaxed),
            evicted: self.stats.evicted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    /// Factory producing detached handles with unique CircIDs and paths.
    struct MockFactory {
        next_id: AtomicU32,
        delay: Duration,
    }

    impl MockFactory {
        fn new() -> Self {
            Self {
                next_id: AtomicU32::new(0x8000_0001),
                delay: Duration::from_millis(0),
            }
        }
    }

    impl CircuitFactory for MockFactory {
        fn build(
            &self,
            isolation: IsolationKey,
            _last_hop: LastHop,
            _purpose: CircuitPurpose,
        ) -> BoxFuture<'_, Result<CircuitHandle>> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay;
            Box::pin(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let path = vec![
                    format!("G{:08x}", id),
                    format!("M{:08x}", id),
                    format!("E{:08x}", id),
                ];
                Ok(CircuitHandle::detached(id, isolation, path))
            })
        }
    }

    fn config() -> TorConfig {
        TorConfig {
            min_circuits: 1,
            max_circuits: 3,
            max_circuit_dirtiness: Duration::from_secs(600),
            pool_idle_timeout: Duration::from_millis(50),
            ..TorConfig::default()
        }
    }

    fn pool() -> Arc<CircuitPool> {
        CircuitPool::new(
            Arc::new(MockFactory::new()),
            &config(),
            Arc::new(crate::events::LogEventSink),
        )
    }

    #[tokio::test]
    async fn test_acquire_builds_then_reuses() {
        let pool = pool();
        let key = IsolationKey::none();

        let c1 = pool.acquire(&key, LastHop::Exit { port: 443 }).await.unwrap();
        let id = c1.circ_id;
        pool.release(c1).await;

        let c2 = pool.acquire(&key, LastHop::Exit { port: 443 }).await.unwrap();
        assert_eq!(c2.circ_id, id, "released circuit should be reused");

        let snapshot = pool.stats_snapshot();
        assert_eq!(snapshot.hits, 1);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.built, 1);
    }

    #[tokio::test]
    async fn test_distinct_isolation_keys_never_share() {
        let pool = pool();
        let alice = test_key("alice");
        let bob = test_key("bob");

        let c_alice = pool.acquire(&alice, LastHop::Exit { port: 443 }).await.unwrap();
        pool.release(c_alice.clone()).await;

        // A different key must never see alice's circuit, warm or not.
        let c_bob = pool.acquire(&bob, LastHop::Exit { port: 443 }).await.unwrap();
        assert_ne!(c_alice.circ_id, c_bob.circ_id);
        assert_ne!(c_alice.path, c_bob.path);
    }

    #[tokio::test]
    async fn test_closed_circuit_not_reused() {
        let pool = pool();
        let key = IsolationKey::none();

        let c1 = pool.acquire(&key, LastHop::Exit { port: 443 }).await.unwrap();
        let id = c1.circ_id;
        c1.test_force_close();
        pool.release(c1).await;

        let c2 = pool.acquire(&key, LastHop::Exit { port: 443 }).await.unwrap();
        assert_ne!(c2.circ_id, id);
    }

    #[tokio::test]
    async fn test_dirty_circuit_evicted() {
        let factory = Arc::new(MockFactory::new());
        let mut cfg = config();
        cfg.max_circuit_dirtiness = Duration::from_millis(10);
        let pool = CircuitPool::new(factory, &cfg, Arc::new(crate::events::LogEventSink));
        let key = IsolationKey::none();

        let c1 = pool.acquire(&key, LastHop::Exit { port: 443 }).await.unwrap();
        let id = c1.circ_id;
        c1.test_mark_dirty();
        pool.release(c1).await;

        tokio::time::sleep(Duration::from_millis(15)).await;

        let c2 = pool.acquire(&key, LastHop::Exit { port: 443 }).await.unwrap();
        assert_ne!(c2.circ_id, id, "dirty-expired circuit must not be reused");
    }

    #[tokio::test]
    async fn test_max_circuits_blocks_until_release() {
        let pool = pool(); // max 3
        let key = IsolationKey::none();

        let held: Vec<CircuitHandle> = {
            let mut v = Vec::new();
            for _ in 0..3 {
                v.push(pool.acquire(&key, LastHop::Exit { port: 443 }).await.unwrap());
            }
            v
        };

        let pool2 = pool.clone();
        let key2 = key.clone();
        let waiter = tokio::spawn(async move {
            pool2.acquire(&key2, LastHop::Exit { port: 443 }).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "acquire should block at capacity");

        pool.release(held[0].clone()).await;
        let acquired = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap()
            .unwrap();
        assert_eq!(acquired.circ_id, held[0].circ_id);
    }

    #[tokio::test]
    async fn test_maintain_prebuilds_and_gcs() {
        let pool = pool();
        let session = test_key("session-x");

        // Touch a keyed pool, then let it go idle.
        let c = pool.acquire(&session, LastHop::Exit { port: 443 }).await.unwrap();
        pool.release(c).await;

        pool.maintain().await;
        {
            let entries = pool.entries.lock().unwrap();
            // Default pool topped up to min_circuits
            assert!(entries.get(&IsolationKey::none()).unwrap().warm.len() >= 1);
        }

        tokio::time::sleep(Duration::from_millis(60)).await;
        // Mark the keyed pool's circuits evictable by closing them
        {
            let mut entries = pool.entries.lock().unwrap();
            if let Some(entry) = entries.get_mut(&session) {
                for c in &entry.warm {
                    c.test_force_close();
                }
            }
        }
        pool.maintain().await;
        {
            let entries = pool.entries.lock().unwrap();
            assert!(
                !entries.contains_key(&session),
                "idle keyed pool should be garbage-collected"
            );
            assert!(entries.contains_key(&IsolationKey::none()));
        }
    }

    fn test_key(user: &str) -> IsolationKey {
        use crate::isolation::{IsolationLevel, RequestAttributes};
        IsolationKey::compute(
            IsolationLevel::Credential,
            false,
            false,
            false,
            &RequestAttributes {
                username: Some(user.into()),
                source_port: 0,
                dest_host: "example.com".into(),
                dest_port: 443,
            },
        )
    }
}
