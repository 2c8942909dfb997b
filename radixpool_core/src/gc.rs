//! Deferred reclamation of detached nodes.
//!
//! Mutations never free a node they unlink. The node moves to `Detached`
//! and is pushed on the tree's persistent pending list together with the
//! runtime generation and the epoch it was unlinked in. A collection pass
//! frees the entries no active critical section can still observe, one
//! small transaction per entry.

use crate::errors::Error;
use crate::pool::{PAtomic, PPtr};
use crate::registry::Runtime;
use crate::transaction::Transaction;
use crate::types::{Node, NodeState, PendingFree, RadixTree, TreeRoot};
use log::debug;
use metrics::{counter, gauge};
use std::sync::atomic::Ordering;

/// `Unallocated -> Linked`, for a fresh node about to be published.
pub(crate) fn attach<'p>(tx: &mut Transaction<'p>, node: &'p Node) -> Result<(), Error> {
    node.transition(tx, NodeState::Unallocated, NodeState::Linked)
}

/// `Linked -> Detached`.
pub(crate) fn detach<'p>(tx: &mut Transaction<'p>, node: &'p Node) -> Result<(), Error> {
    node.transition(tx, NodeState::Linked, NodeState::Detached)
}

/// Push a pre-allocated entry on the pending list. Call after the store
/// that unlinked its node.
pub(crate) fn enqueue<'p>(
    tx: &mut Transaction<'p>,
    root: &'p TreeRoot,
    rt: &Runtime,
    entry: PPtr<PendingFree>,
) {
    // SAFETY: allocated by this transaction and not yet reachable.
    let pending = unsafe { entry.as_ref() };
    pending.generation.store(rt.generation(), Ordering::Relaxed);
    pending.epoch.store(rt.advance_epoch(), Ordering::Relaxed);
    pending.next.init(root.pending.load(Ordering::Acquire));
    tx.store(&root.pending, Some(entry));
    tx.set_u64(&root.pending_len, root.pending_len.load(Ordering::Relaxed) + 1);
}

/// Unlink the entry held by `link` and free it with its node. Returns
/// false, changing nothing, if a mutation pushed a new head onto `link`.
fn reclaim<'p>(
    tx: &mut Transaction<'p>,
    root: &'p TreeRoot,
    link: &'p PAtomic<PendingFree>,
    entry: PPtr<PendingFree>,
) -> Result<bool, Error> {
    if link.load(Ordering::Acquire) != Some(entry) {
        return Ok(false);
    }
    // SAFETY: pending entries are only freed under the gc lock we hold.
    let pending: &'p PendingFree = unsafe { entry.as_ref() };
    let node: &'p Node = unsafe { pending.node.as_ref() };
    node.transition(tx, NodeState::Detached, NodeState::Freed)?;
    tx.store(link, pending.next.load(Ordering::Acquire));
    tx.release(pending.node)?;
    tx.release(entry)?;
    tx.set_u64(&root.pending_len, root.pending_len.load(Ordering::Relaxed) - 1);
    Ok(true)
}

impl RadixTree {
    /// Best-effort pass: free every pending node older than the current
    /// safety horizon. Freeing nothing is a normal outcome.
    pub fn garbage_collect(&self) -> Result<usize, Error> {
        let rt = self.runtime()?;
        let _gc = self.gc_lock.lock();
        let root = self.tree_root();
        let horizon = rt.horizon();

        let mut freed = 0usize;
        let mut link: &PAtomic<PendingFree> = &root.pending;
        while let Some(entry) = link.load(Ordering::Acquire) {
            // SAFETY: as in `reclaim`.
            let pending: &PendingFree = unsafe { entry.as_ref() };
            let generation = pending.generation.load(Ordering::Relaxed);
            let epoch = pending.epoch.load(Ordering::Relaxed);
            if !rt.reclaimable(generation, epoch, horizon) {
                link = &pending.next;
                continue;
            }
            // on success `link` holds the successor, so it is examined next
            if self.pool.transaction(|tx| reclaim(tx, root, link, entry))? {
                freed += 1;
            }
        }

        if freed > 0 {
            counter!("radixpool_gc_freed_total").increment(freed as u64);
            debug!(
                "[GC] freed {} nodes, {} pending (horizon={})",
                freed,
                self.pending_count(),
                horizon
            );
        }
        gauge!("radixpool_pending_free").set(self.pending_count() as f64);
        Ok(freed)
    }

    /// Exhaustive pass: wait for every reader that could observe a pending
    /// node to leave its critical section, then free it, until the pending
    /// list is empty.
    ///
    /// Blocks for as long as any worker stays inside a critical section
    /// that predates a pending node, and never returns if called from
    /// inside a critical section of this tree. Concurrent mutations keep
    /// refilling the list, so it only finishes once they stop.
    pub fn garbage_collect_force(&self) -> Result<usize, Error> {
        let rt = self.runtime()?;
        let mut freed = 0usize;
        loop {
            freed += self.garbage_collect()?;
            let newest = {
                let _gc = self.gc_lock.lock();
                self.tree_root()
                    .pending
                    .load(Ordering::Acquire)
                    // SAFETY: entry stays alive while we hold the gc lock.
                    .map(|entry| unsafe { entry.as_ref() }.epoch.load(Ordering::Relaxed))
            };
            match newest {
                None => break,
                Some(target) => rt.wait_for_horizon(target),
            }
        }
        debug!("[GC] forced collection freed {} nodes", freed);
        Ok(freed)
    }
}
