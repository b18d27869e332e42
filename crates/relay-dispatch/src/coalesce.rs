//! Single-flight request coalescing
//!
//! Concurrent callers with the same key share one execution. The entry is
//! removed as soon as the shared run completes, success or failure, or
//! when every caller waiting on it has been cancelled.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;

/// Map of in-flight runs keyed by request identity
#[derive(Debug)]
pub struct Coalescer<K, V> {
    inflight: Mutex<HashMap<K, Slot<V>>>,
}

#[derive(Debug)]
struct Slot<V> {
    cell: Arc<OnceCell<V>>,
    /// Callers currently attached to `cell`
    waiters: usize,
}

impl<K, V> Coalescer<K, V> {
    fn lock(&self) -> MutexGuard<'_, HashMap<K, Slot<V>>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, V> Coalescer<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` unless an identical run is in flight, then share its value
    ///
    /// Returns the value and whether it came from another caller's run. If
    /// the running caller is cancelled, one of the waiters takes over. The
    /// entry is dropped once the run completes or every caller is gone.
    pub async fn run<F, Fut>(&self, key: K, f: F) -> (V, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let cell = {
            let mut inflight = self.lock();
            let slot = inflight.entry(key.clone()).or_insert_with(|| Slot {
                cell: Arc::new(OnceCell::new()),
                waiters: 0,
            });
            slot.waiters += 1;
            Arc::clone(&slot.cell)
        };
        let _guard = SlotGuard {
            coalescer: self,
            key,
            cell: Arc::clone(&cell),
        };

        let mut ran = false;
        let value = cell
            .get_or_init(|| {
                ran = true;
                f()
            })
            .await
            .clone();

        (value, !ran)
    }

    /// Keys with a run in flight
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Detaches one caller from its slot, on completion or cancellation
///
/// The slot goes once its cell holds a value or its last caller leaves. A
/// replacement slot under the same key is never touched.
struct SlotGuard<'a, K: Eq + Hash, V> {
    coalescer: &'a Coalescer<K, V>,
    key: K,
    cell: Arc<OnceCell<V>>,
}

impl<K: Eq + Hash, V> Drop for SlotGuard<'_, K, V> {
    fn drop(&mut self) {
        let mut inflight = self.coalescer.lock();
        let Some(slot) = inflight.get_mut(&self.key) else {
            return;
        };
        if !Arc::ptr_eq(&slot.cell, &self.cell) {
            return;
        }
        slot.waiters = slot.waiters.saturating_sub(1);
        if slot.waiters == 0 || slot.cell.initialized() {
            inflight.remove(&self.key);
        }
    }
}

impl<K, V> Default for Coalescer<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
