//! Scoped commit-or-rollback capability handed out by [`Pool::transaction`].
//!
//! Writes to persistent cells are applied in place and recorded in an undo
//! log; allocations are tracked so an abort can free them; releases are
//! deferred until commit. Dropping an uncommitted transaction rolls it back.
//!
//! Readers may observe in-place writes before commit, so callers that share
//! cells with readers must finish every allocation and every fallible check
//! before the first reader-visible store.
//!
//! [`Pool::transaction`]: crate::pool::Pool::transaction

use crate::errors::Error;
use crate::pool::{PAtomic, PPtr, PoolInner};
use log::{trace, warn};
use metrics::counter;
use parking_lot::MutexGuard;
use std::cell::Cell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, Ordering};

thread_local! {
    static IN_TRANSACTION: Cell<bool> = const { Cell::new(false) };
}

enum Undo {
    Ptr { cell: *const AtomicPtr<()>, old: *mut () },
    Word { cell: *const AtomicU64, old: u64 },
    Byte { cell: *const AtomicU8, old: u8 },
}

pub struct Transaction<'p> {
    pool: &'p PoolInner,
    _guard: MutexGuard<'p, ()>,
    seq: u64,
    undo: Vec<Undo>,
    allocated: Vec<usize>,
    released: HashSet<usize>,
    committed: bool,
}

impl<'p> Transaction<'p> {
    pub(crate) fn begin(pool: &'p PoolInner) -> Result<Self, Error> {
        if IN_TRANSACTION.with(|flag| flag.get()) {
            return Err(Error::NestedTransaction);
        }
        let guard = pool.tx_lock.lock();
        IN_TRANSACTION.with(|flag| flag.set(true));
        let seq = pool.hdr.tx_seq.fetch_add(1, Ordering::Relaxed) + 1;
        trace!("[TX] begin seq={}", seq);
        Ok(Self {
            pool,
            _guard: guard,
            seq,
            undo: Vec::new(),
            allocated: Vec::new(),
            released: HashSet::new(),
            committed: false,
        })
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Allocate `value` in the pool. Freed again if the transaction aborts.
    pub fn allocate<T: Send + Sync + 'static>(&mut self, value: T) -> Result<PPtr<T>, Error> {
        let capacity = self.pool.hdr.capacity;
        if self.pool.objects.len() >= capacity {
            warn!("[TX] seq={} allocation refused: pool full ({})", self.seq, capacity);
            return Err(Error::OutOfSpace { capacity });
        }
        let ptr = self.pool.insert(value);
        self.allocated.push(ptr.addr());
        Ok(ptr)
    }

    /// Schedule `ptr` to be freed when the transaction commits.
    pub fn release<T>(&mut self, ptr: PPtr<T>) -> Result<(), Error> {
        let addr = ptr.addr();
        if !self.pool.objects.contains_key(&addr) || !self.released.insert(addr) {
            return Err(Error::UnknownObject);
        }
        Ok(())
    }

    /// Logged pointer write.
    pub fn store<T>(&mut self, cell: &'p PAtomic<T>, value: Option<PPtr<T>>) {
        let old = cell.swap(value, Ordering::SeqCst);
        self.undo.push(Undo::Ptr {
            cell: cell.as_erased(),
            old: old as *mut (),
        });
    }

    /// Logged word write.
    pub fn set_u64(&mut self, cell: &'p AtomicU64, value: u64) {
        let old = cell.swap(value, Ordering::SeqCst);
        self.undo.push(Undo::Word { cell, old });
    }

    /// Logged byte write.
    pub fn set_u8(&mut self, cell: &'p AtomicU8, value: u8) {
        let old = cell.swap(value, Ordering::SeqCst);
        self.undo.push(Undo::Byte { cell, old });
    }

    pub(crate) fn commit(mut self) {
        let freed = self.released.len();
        for addr in self.released.drain() {
            self.pool.free(addr);
        }
        self.undo.clear();
        self.allocated.clear();
        self.committed = true;
        counter!("radixpool_tx_commits_total").increment(1);
        trace!("[TX] commit seq={} freed={}", self.seq, freed);
    }

    fn rollback(&mut self) {
        let writes = self.undo.len();
        for entry in self.undo.drain(..).rev() {
            // SAFETY: every logged cell outlives 'p, and cells inside objects
            // allocated by this transaction are restored before those objects
            // are freed below.
            unsafe {
                match entry {
                    Undo::Ptr { cell, old } => (*cell).store(old, Ordering::SeqCst),
                    Undo::Word { cell, old } => (*cell).store(old, Ordering::SeqCst),
                    Undo::Byte { cell, old } => (*cell).store(old, Ordering::SeqCst),
                }
            }
        }
        let allocations = self.allocated.len();
        for addr in self.allocated.drain(..) {
            self.pool.free(addr);
        }
        self.released.clear();
        trace!(
            "[TX] rollback seq={} writes={} allocations={}",
            self.seq,
            writes,
            allocations
        );
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.rollback();
        }
        IN_TRANSACTION.with(|flag| flag.set(false));
    }
}
