//! Single-writer / multi-reader snapshot publication
//!
//! Committed catalogs form a queue of `Arc` snapshots. Three wrap-around
//! counters govern reclamation; for any reader the following must hold
//! (mod 2^32):
//!
//! ```text
//! delete != read + 1      (Inv1)
//! read   != write + 1     (Inv2)
//! write + 1 != delete     (Inv3)
//! ```
//!
//! The write counter advances when the writer pushes a snapshot, each
//! reader advances its own read counter on refresh, and the delete counter
//! advances when the writer pops an unused snapshot off the front. The
//! short mutex only protects reader-set membership and the atomicity of
//! {counter increment, queue push}; in steady state it is uncontended.
//!
//! A stuck reader blocks reclamation and grows the queue; that is a
//! monitoring concern, not a runtime error.

use crate::catalog::AssetCatalog;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

struct ReaderSlot {
    read_counter: AtomicU32,
}

struct Inner {
    states: VecDeque<Arc<AssetCatalog>>,
    readers: Vec<Arc<ReaderSlot>>,
}

struct Shared {
    inner: Mutex<Inner>,
    write_counter: AtomicU32,
    delete_counter: AtomicU32,
    writer_taken: AtomicBool,
}

/// Handle to the snapshot queue. Clone freely; spawn readers from any
/// clone.
#[derive(Clone)]
pub struct StateManager {
    shared: Arc<Shared>,
}

impl StateManager {
    pub fn new() -> Self {
        let mut states = VecDeque::new();
        states.push_back(Arc::new(AssetCatalog::new()));
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    states,
                    readers: Vec::new(),
                }),
                write_counter: AtomicU32::new(0),
                delete_counter: AtomicU32::new(0),
                writer_taken: AtomicBool::new(false),
            }),
        }
    }

    /// Take the single writer.
    ///
    /// # Panics
    /// Panics if a writer was already taken; there is exactly one writer
    /// per queue.
    pub fn writer(&self) -> Writer {
        if self.shared.writer_taken.swap(true, Ordering::SeqCst) {
            panic!("state manager writer already taken");
        }
        Writer {
            shared: self.shared.clone(),
            uncommitted: AssetCatalog::new(),
        }
    }

    /// Register a new reader positioned at the current tail.
    pub fn reader(&self) -> Reader {
        let mut inner = self.shared.inner.lock();
        let slot = Arc::new(ReaderSlot {
            read_counter: AtomicU32::new(self.shared.write_counter.load(Ordering::Acquire)),
        });
        inner.readers.push(slot.clone());
        let current = inner
            .states
            .back()
            .expect("snapshot queue is never empty")
            .clone();
        Reader {
            shared: self.shared.clone(),
            slot,
            current,
            first_refresh: true,
        }
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

/// The single mutating handle.
pub struct Writer {
    shared: Arc<Shared>,
    uncommitted: AssetCatalog,
}

impl Writer {
    /// The uncommitted catalog. No reader can observe it until
    /// [`Writer::commit`].
    pub fn state(&mut self) -> &mut AssetCatalog {
        &mut self.uncommitted
    }

    /// Publish the uncommitted catalog as the new queue tail, reclaiming
    /// unused snapshots from the front first.
    pub fn commit(&mut self) {
        loop {
            self.cleanup();
            // Inv3: a stuck reader may let the write counter wrap all the
            // way around to the delete counter. Yield instead of
            // overwriting state.
            let write = self.shared.write_counter.load(Ordering::Acquire);
            let delete = self.shared.delete_counter.load(Ordering::Acquire);
            if write.wrapping_add(1) == delete {
                std::thread::yield_now();
            } else {
                break;
            }
        }

        self.uncommitted.recompute();
        let snapshot = Arc::new(self.uncommitted.clone());

        // The counter increment and the queue push must be atomic with
        // respect to Reader registration.
        let mut inner = self.shared.inner.lock();
        inner.states.push_back(snapshot);
        self.shared.write_counter.fetch_add(1, Ordering::AcqRel);
    }

    /// Pop unused snapshots off the front of the queue. Runs on the
    /// writer so all queue mutation stays on one thread.
    fn cleanup(&self) {
        let mut dc = self.shared.delete_counter.load(Ordering::Acquire);
        loop {
            {
                let inner = self.shared.inner.lock();
                // Inv1
                for reader in &inner.readers {
                    if dc == reader.read_counter.load(Ordering::Acquire) {
                        return;
                    }
                }
                // Inv3: nothing left to reclaim when no readers exist
                if dc == self.shared.write_counter.load(Ordering::Acquire) {
                    return;
                }
            }
            let mut inner = self.shared.inner.lock();
            inner.states.pop_front();
            drop(inner);
            dc = self.shared.delete_counter.fetch_add(1, Ordering::AcqRel) + 1;
        }
    }

    #[cfg(test)]
    pub(crate) fn queue_len(&self) -> usize {
        self.shared.inner.lock().states.len()
    }
}

/// One reading handle. `state()` is stable between two `refresh()` calls.
pub struct Reader {
    shared: Arc<Shared>,
    slot: Arc<ReaderSlot>,
    current: Arc<AssetCatalog>,
    first_refresh: bool,
}

impl Reader {
    /// Advance to the most recent committed snapshot. Returns true iff the
    /// view moved; the first call always returns true.
    pub fn refresh(&mut self) -> bool {
        let mut moved = self.first_refresh;
        self.first_refresh = false;

        // Inv2: only this reader advances its own counter.
        if self.slot.read_counter.load(Ordering::Acquire)
            != self.shared.write_counter.load(Ordering::Acquire)
        {
            let inner = self.shared.inner.lock();
            self.current = inner
                .states
                .back()
                .expect("snapshot queue is never empty")
                .clone();
            self.slot.read_counter.store(
                self.shared.write_counter.load(Ordering::Acquire),
                Ordering::Release,
            );
            moved = true;
        }
        moved
    }

    /// The snapshot observed at the last refresh.
    pub fn state(&self) -> &AssetCatalog {
        &self.current
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        inner
            .readers
            .retain(|slot| !Arc::ptr_eq(slot, &self.slot));
    }
}
