//! Worker registry and epoch protocol.
//!
//! Each registered worker owns a cache-line sized slot holding the global
//! epoch it observed when it entered its outermost critical section, or
//! `EPOCH_INACTIVE` while outside. Retiring a node stamps it with the epoch
//! in force when it was unlinked; the node may be freed once every active
//! slot is newer than that stamp.
//!
//! Runtime state is volatile: it is rebuilt by `runtime_initialize` after
//! every reopen and carries the persistent generation it was created in.

use crate::constants::{EPOCH_FIRST, EPOCH_INACTIVE, SPIN_BEFORE_YIELD};
use dashmap::DashMap;
use log::{debug, trace};
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

/// Worker ID type
pub type WorkerId = u64;

#[repr(C, align(64))]
pub(crate) struct WorkerSlot {
    epoch: AtomicU64,
}

impl WorkerSlot {
    fn new() -> Self {
        Self {
            epoch: AtomicU64::new(EPOCH_INACTIVE),
        }
    }
}

struct WorkerRegistry {
    slots: DashMap<WorkerId, Arc<WorkerSlot>>,
    next_id: AtomicU64,
}

impl WorkerRegistry {
    fn new() -> Self {
        Self {
            slots: DashMap::new(),
            next_id: AtomicU64::new(1), // 0 is never handed out
        }
    }

    fn register(&self) -> (WorkerId, Arc<WorkerSlot>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(WorkerSlot::new());
        self.slots.insert(id, Arc::clone(&slot));
        (id, slot)
    }

    fn unregister(&self, id: WorkerId) -> bool {
        self.slots.remove(&id).is_some()
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    /// Oldest epoch held by an active worker, `u64::MAX` if none is active.
    fn horizon(&self) -> u64 {
        self.slots
            .iter()
            .map(|entry| entry.value().epoch.load(Ordering::SeqCst))
            .filter(|&epoch| epoch != EPOCH_INACTIVE)
            .min()
            .unwrap_or(u64::MAX)
    }
}

/// Volatile per-tree runtime: the global epoch and the worker registry.
pub struct Runtime {
    tree_id: u64,
    generation: u64,
    global_epoch: AtomicU64,
    workers: WorkerRegistry,
}

impl Runtime {
    pub(crate) fn new(tree_id: u64, generation: u64) -> Self {
        Self {
            tree_id,
            generation,
            global_epoch: AtomicU64::new(EPOCH_FIRST),
            workers: WorkerRegistry::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn global_epoch(&self) -> u64 {
        self.global_epoch.load(Ordering::SeqCst)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Bump the global epoch and return the one the caller's unlink
    /// happened in. Must follow the unlinking store.
    pub(crate) fn advance_epoch(&self) -> u64 {
        self.global_epoch.fetch_add(1, Ordering::SeqCst)
    }

    /// Entries stamped below this value are unobservable. Never exceeds
    /// the global epoch read here, so anything retired after the call stays.
    pub(crate) fn horizon(&self) -> u64 {
        let current = self.global_epoch.load(Ordering::SeqCst);
        // pairs with the fence in `WorkerHandle::critical`
        fence(Ordering::SeqCst);
        self.workers.horizon().min(current)
    }

    /// Entries from an earlier generation outlived every reader of theirs.
    pub(crate) fn reclaimable(&self, generation: u64, epoch: u64, horizon: u64) -> bool {
        generation < self.generation || epoch < horizon
    }

    /// Block until no active worker holds an epoch at or below `target`.
    pub(crate) fn wait_for_horizon(&self, target: u64) {
        let mut spins = 0u32;
        loop {
            let horizon = self.horizon();
            if horizon > target {
                return;
            }
            if spins < SPIN_BEFORE_YIELD {
                spins += 1;
                std::hint::spin_loop();
            } else {
                if spins == SPIN_BEFORE_YIELD {
                    spins += 1;
                    debug!(
                        "[GC] waiting for readers: horizon={} target={}",
                        horizon, target
                    );
                }
                std::thread::yield_now();
            }
        }
    }

    pub(crate) fn register(self: &Arc<Self>) -> WorkerHandle {
        let (id, slot) = self.workers.register();
        debug!("[RUNTIME] worker {} registered (gen={})", id, self.generation);
        WorkerHandle {
            runtime: Arc::clone(self),
            id,
            slot,
            depth: Cell::new(0),
        }
    }
}

/// A registered reader. Not `Sync`: one thread drives a handle at a time.
pub struct WorkerHandle {
    runtime: Arc<Runtime>,
    id: WorkerId,
    slot: Arc<WorkerSlot>,
    depth: Cell<u32>,
}

/// Proof of an open critical section on a particular tree.
pub struct Critical<'w> {
    pub(crate) tree_id: u64,
    _worker: PhantomData<&'w WorkerHandle>,
}

struct ExitGuard<'a> {
    handle: &'a WorkerHandle,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        let depth = self.handle.depth.get() - 1;
        self.handle.depth.set(depth);
        if depth == 0 {
            self.handle.slot.epoch.store(EPOCH_INACTIVE, Ordering::Release);
        }
    }
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Run `f` inside a critical section. Anything reachable from the tree
    /// when the section opened stays allocated until it closes, even if it
    /// is erased meanwhile. Sections nest; only the outermost one publishes.
    pub fn critical<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Critical<'_>) -> R,
    {
        let depth = self.depth.get();
        if depth == 0 {
            let epoch = self.runtime.global_epoch.load(Ordering::SeqCst);
            self.slot.epoch.store(epoch, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            #[cfg(feature = "trace")]
            trace!("[CRITICAL] worker {} enter epoch={}", self.id, epoch);
        }
        self.depth.set(depth + 1);
        let _exit = ExitGuard { handle: self };
        let cs = Critical {
            tree_id: self.runtime.tree_id,
            _worker: PhantomData,
        };
        f(&cs)
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.slot.epoch.store(EPOCH_INACTIVE, Ordering::Release);
        if self.runtime.workers.unregister(self.id) {
            trace!("[RUNTIME] worker {} unregistered", self.id);
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("generation", &self.runtime.generation)
            .field("epoch", &self.slot.epoch.load(Ordering::Relaxed))
            .finish()
    }
}
