use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nodepass_shared::FlowId;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::debug;

pub type DialFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

/// `poolMin`/`poolMax`/`poolIntervalMin`/`poolIntervalMax` (§3).
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub min: usize,
    pub max: usize,
    pub interval_min: Duration,
    pub interval_max: Duration,
}

struct Ledger {
    idle: HashMap<FlowId, TcpStream>,
    order: VecDeque<FlowId>,
}

/// Shared state and adaptive-capacity manager used by both [`crate::ClientPool`]
/// and [`crate::ServerPool`] (§4.2).
pub struct PoolCore {
    ledger: Mutex<Ledger>,
    capacity: AtomicUsize,
    min: usize,
    max: usize,
    interval_min: Duration,
    interval_max: Duration,
    attempts: AtomicUsize,
    successes: AtomicUsize,
    consecutive_failures: AtomicUsize,
    closed: AtomicBool,
    notify: Notify,
}

impl PoolCore {
    pub fn new(cfg: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            ledger: Mutex::new(Ledger {
                idle: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: AtomicUsize::new(cfg.min),
            min: cfg.min,
            max: cfg.max,
            interval_min: cfg.interval_min,
            interval_max: cfg.interval_max,
            attempts: AtomicUsize::new(0),
            successes: AtomicUsize::new(0),
            consecutive_failures: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn ready(&self) -> bool {
        !self.ledger.lock().expect("lock poisoned").idle.is_empty()
    }

    pub fn active(&self) -> usize {
        self.ledger.lock().expect("lock poisoned").idle.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Inserts a freshly produced idle entry, unless the pool is at or over
    /// capacity or closed.
    pub fn try_insert(&self, id: FlowId, conn: TcpStream) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut ledger = self.ledger.lock().expect("lock poisoned");
        if ledger.idle.len() >= self.capacity() {
            return false;
        }
        ledger.order.push_back(id.clone());
        ledger.idle.insert(id, conn);
        self.notify.notify_waiters();
        true
    }

    /// `ClientGet(id)` (§4.2): removes and returns the matching entry exactly
    /// once; absent ids increment the error counter (§7 PoolDepletion).
    pub fn get_by_id(&self, id: &FlowId) -> Option<TcpStream> {
        let mut ledger = self.ledger.lock().expect("lock poisoned");
        let conn = ledger.idle.remove(id);
        if conn.is_some() {
            ledger.order.retain(|x| x != id);
        }
        conn
    }

    /// `ServerGet()` (§4.2): pops the next available `(id, conn)`.
    pub fn pop_next(&self) -> Option<(FlowId, TcpStream)> {
        let mut ledger = self.ledger.lock().expect("lock poisoned");
        let id = ledger.order.pop_front()?;
        let conn = ledger.idle.remove(&id)?;
        Some((id, conn))
    }

    pub fn peek_any_id(&self) -> Option<FlowId> {
        self.ledger.lock().expect("lock poisoned").order.front().cloned()
    }

    /// `Flush()`: close and discard all idle entries.
    pub fn flush(&self) {
        let mut ledger = self.ledger.lock().expect("lock poisoned");
        debug!(dropped = ledger.idle.len(), "flushing idle pool entries");
        ledger.idle.clear();
        ledger.order.clear();
    }

    /// `Close()`: `Flush` plus stop producers.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.flush();
        self.notify.notify_waiters();
    }

    pub fn record_attempt(&self, success: bool) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
            self.consecutive_failures.store(0, Ordering::Relaxed);
        } else {
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Persistent failure shrinks capacity and triggers a flush (§4.2
    /// "Failures").
    pub fn consecutive_failures_exceed_third(&self) -> bool {
        self.consecutive_failures.load(Ordering::Relaxed) * 3 > self.capacity().max(1)
    }

    /// Adaptive interval for the producer loop: long sleep when idle is near
    /// full, short sleep when depleted, clamped to `[interval_min,
    /// interval_max]` (§4.2).
    pub fn next_production_interval(&self) -> Duration {
        let cap = self.capacity().max(1);
        let idle = self.active();
        let fullness = idle as f64 / cap as f64;
        let span = self.interval_max.saturating_sub(self.interval_min);
        let scaled = span.mul_f64(fullness.clamp(0.0, 1.0));
        (self.interval_min + scaled).clamp(self.interval_min, self.interval_max)
    }

    /// One manager tick: measure the success/use ratio over the window
    /// accumulated since the last tick, nudge capacity by at most one step
    /// towards `poolMin`/`poolMax`, then reset the window.
    fn manager_tick(&self) {
        let attempts = self.attempts.swap(0, Ordering::Relaxed);
        let successes = self.successes.swap(0, Ordering::Relaxed);

        if attempts == 0 {
            return;
        }

        let ratio = successes as f64 / attempts as f64;
        let current = self.capacity();
        let next = if ratio < 0.20 {
            current.saturating_sub(1).max(self.min)
        } else if ratio > 0.80 {
            (current + 1).min(self.max)
        } else {
            current
        };

        if next != current {
            self.capacity.store(next, Ordering::Relaxed);
            debug!(ratio, previous = current, capacity = next, "pool capacity adjusted");
        }
    }

    pub fn spawn_manager(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let core = self.clone();
        tokio::spawn(async move {
            loop {
                if core.is_closed() {
                    return;
                }
                tokio::time::sleep(core.interval_max).await;
                if core.is_closed() {
                    return;
                }
                core.manager_tick();
            }
        })
    }
}

/// The operations common to [`crate::ClientPool`] and [`crate::ServerPool`]
/// (§4.2 "Common operations").
pub trait PoolHandle {
    fn core(&self) -> &Arc<PoolCore>;

    fn ready(&self) -> bool {
        self.core().ready()
    }

    fn active(&self) -> usize {
        self.core().active()
    }

    fn capacity(&self) -> usize {
        self.core().capacity()
    }

    fn flush_sync(&self) {
        self.core().flush();
    }
}
