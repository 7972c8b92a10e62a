//! Isolates and the isolate pool.
//!
//! An [`Isolate`] is one strongly isolated script environment: a Rhai engine
//! created with hard data-size and recursion limits derived from a fixed
//! memory ceiling. Scripts get a fresh scope per execution, so no user
//! state survives from one run to the next even when the engine is reused.
//!
//! The [`IsolatePool`] keeps a small number of previously-healthy isolates
//! warm for reuse (creating an engine is not free), guarded by a mutex
//! because many executions acquire and release concurrently. An isolate
//! that errored, timed out, or hit its memory ceiling is *poisoned* and is
//! destroyed instead of pooled — a poisoned isolate must never serve a
//! second execution.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::debug;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Isolate
// ---------------------------------------------------------------------------

/// One sandboxed execution environment with a fixed memory ceiling.
pub struct Isolate {
    id: Uuid,
    engine: rhai::Engine,
    memory_limit_mb: u32,
    poisoned: bool,
}

impl Isolate {
    /// Create an isolate whose engine limits are sized to `memory_limit_mb`.
    ///
    /// The ceiling is enforced at creation time: Rhai has no queryable heap
    /// cap, so the megabyte budget maps onto proportional data-size limits.
    /// A breach surfaces as a data-too-large evaluation error.
    pub(crate) fn new(memory_limit_mb: u32) -> Self {
        let mut engine = rhai::Engine::new();

        // The language's own eval is as dangerous as the JS one.
        engine.disable_symbol("eval");

        let mb = memory_limit_mb as usize;
        engine.set_max_string_size(mb * 1024 * 1024);
        engine.set_max_array_size(mb * 16_384);
        engine.set_max_map_size(mb * 4_096);
        engine.set_max_call_levels(64);
        engine.set_max_expr_depths(64, 64);

        Self {
            id: Uuid::new_v4(),
            engine,
            memory_limit_mb,
            poisoned: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn memory_limit_mb(&self) -> u32 {
        self.memory_limit_mb
    }

    /// Mark this isolate as unfit for reuse. Irreversible.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Mutable access to the engine for host-API wiring and evaluation.
    /// Only the one in-flight execution holds the isolate, so exclusive
    /// access is guaranteed by ownership.
    pub(crate) fn engine_mut(&mut self) -> &mut rhai::Engine {
        &mut self.engine
    }

    pub(crate) fn engine(&self) -> &rhai::Engine {
        &self.engine
    }
}

impl std::fmt::Debug for Isolate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Isolate")
            .field("id", &self.id)
            .field("memory_limit_mb", &self.memory_limit_mb)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Tuning knobs for the isolate pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of idle isolates kept warm for reuse.
    pub max_idle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_idle: 3 }
    }
}

/// Bounded free-list of healthy, idle isolates.
pub struct IsolatePool {
    config: PoolConfig,
    idle: Mutex<VecDeque<Isolate>>,
    created: AtomicU64,
    reused: AtomicU64,
}

impl IsolatePool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            idle: Mutex::new(VecDeque::new()),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// Pop a compatible idle isolate, or create a fresh one.
    ///
    /// A pooled isolate is compatible only when its own ceiling is no
    /// larger than the request's — its creation-time limits are then at
    /// least as strict as the request demands.
    pub fn acquire(&self, memory_limit_mb: u32) -> Isolate {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pos) = idle
            .iter()
            .position(|iso| iso.memory_limit_mb() <= memory_limit_mb)
        {
            if let Some(isolate) = idle.remove(pos) {
                self.reused.fetch_add(1, Ordering::Relaxed);
                debug!(isolate_id = %isolate.id(), "reusing pooled isolate");
                return isolate;
            }
        }
        drop(idle);

        self.created.fetch_add(1, Ordering::Relaxed);
        let isolate = Isolate::new(memory_limit_mb);
        debug!(isolate_id = %isolate.id(), memory_limit_mb, "created fresh isolate");
        isolate
    }

    /// Return an isolate after a clean execution. Poisoned isolates and
    /// pool overflow are disposed instead.
    pub fn release(&self, isolate: Isolate) {
        if isolate.is_poisoned() {
            self.dispose(isolate);
            return;
        }

        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < self.config.max_idle {
            debug!(isolate_id = %isolate.id(), "isolate returned to pool");
            idle.push_back(isolate);
        } else {
            drop(idle);
            self.dispose(isolate);
        }
    }

    /// Destroy an isolate irreversibly.
    pub fn dispose(&self, isolate: Isolate) {
        debug!(
            isolate_id = %isolate.id(),
            poisoned = isolate.is_poisoned(),
            "disposing isolate"
        );
        drop(isolate);
    }

    /// Number of isolates created so far (fresh, not reused).
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Number of acquisitions served from the warm pool.
    pub fn reused_count(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }

    /// Current number of idle isolates.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for IsolatePool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_isolate_is_reused() {
        let pool = IsolatePool::default();
        let first = pool.acquire(16);
        let first_id = first.id();
        pool.release(first);

        let second = pool.acquire(16);
        assert_eq!(second.id(), first_id);
        assert_eq!(pool.reused_count(), 1);
    }

    #[test]
    fn poisoned_isolate_never_reenters_the_pool() {
        let pool = IsolatePool::default();
        let mut isolate = pool.acquire(16);
        let poisoned_id = isolate.id();
        isolate.poison();
        pool.release(isolate);

        assert_eq!(pool.idle_count(), 0);
        let next = pool.acquire(16);
        assert_ne!(next.id(), poisoned_id);
    }

    #[test]
    fn larger_ceiling_isolate_is_not_reused_for_stricter_request() {
        let pool = IsolatePool::default();
        let big = pool.acquire(64);
        let big_id = big.id();
        pool.release(big);

        // A 1 MB request must not inherit 64 MB limits.
        let strict = pool.acquire(1);
        assert_ne!(strict.id(), big_id);
        assert_eq!(strict.memory_limit_mb(), 1);

        // An equal-or-looser request may reuse it.
        let loose = pool.acquire(64);
        assert_eq!(loose.id(), big_id);
    }

    #[test]
    fn pool_is_bounded() {
        let pool = IsolatePool::new(PoolConfig { max_idle: 2 });
        let isolates: Vec<_> = (0..4).map(|_| pool.acquire(8)).collect();
        for isolate in isolates {
            pool.release(isolate);
        }
        assert_eq!(pool.idle_count(), 2);
    }
}
