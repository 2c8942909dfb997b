pub mod constants;
pub mod errors;
pub mod gc;
pub mod helpers;
pub mod pool;
pub mod registry;
pub mod telemetry;
pub mod transaction;
pub mod types;

pub use errors::{Error, ErrorCode};
pub use helpers::key_from_u64;
pub use pool::{PAtomic, PPtr, Pool};
pub use registry::{Critical, Runtime, WorkerHandle, WorkerId};
pub use telemetry::{register_stats_callback, StatsCallback};
pub use transaction::Transaction;
pub use types::{Emplaced, Iter, LeafRef, NodeCounts, NodeState, RadixTree};

use constants::*;
use gc::{attach, detach, enqueue};
use helpers::common_prefix_len;
use log::{debug, info, trace, warn};
use metrics::counter;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering as Cmp;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use types::{Branch, Node, NodeKind, PendingFree, TreeRoot};

// ===== Compile-time assertions for alignment =====
const _: () = assert!(std::mem::align_of::<registry::WorkerSlot>() == CACHE_LINE);
const _: () = assert!(std::mem::size_of::<registry::WorkerSlot>() == CACHE_LINE);

// ---- logging bootstraper -------------------------------------------------
pub(crate) fn ensure_logging() {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_init(|| {
        let _ = env_logger::builder()
            .format_timestamp(None)
            .is_test(std::env::var("RUST_TEST_THREADS").is_ok())
            .try_init();
    });
}

static NEXT_TREE_ID: AtomicU64 = AtomicU64::new(1);

impl RadixTree {
    /// Attach to the tree rooted in `pool`, creating an empty one if the
    /// pool has none yet. One handle per pool at a time.
    pub fn open(pool: &Pool) -> Result<Self, Error> {
        if pool.inner.attached.swap(true, Ordering::AcqRel) {
            warn!("[OPEN] pool {} already has a tree handle", pool.name());
            return Err(Error::AlreadyAttached);
        }
        let hdr = pool.header();
        let root = match hdr.root.load(Ordering::Acquire) {
            Some(root) => root,
            None => {
                let created = pool.transaction(|tx| {
                    let root = tx.allocate(TreeRoot::new())?;
                    tx.store(&hdr.root, Some(root));
                    Ok(root)
                });
                match created {
                    Ok(root) => root,
                    Err(e) => {
                        pool.inner.attached.store(false, Ordering::Release);
                        return Err(e);
                    }
                }
            }
        };

        let tree = Self {
            pool: pool.clone(),
            root,
            id: NEXT_TREE_ID.fetch_add(1, Ordering::Relaxed),
            runtime: RwLock::new(None),
            gc_lock: Mutex::new(()),
        };
        info!(
            "[OPEN] tree in pool {}: {} entries, {} pending",
            pool.name(),
            tree.len(),
            tree.pending_count()
        );
        Ok(tree)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    #[inline(always)]
    pub(crate) fn tree_root(&self) -> &TreeRoot {
        // SAFETY: the root object is only released by `destroy`, which
        // consumes the handle.
        unsafe { self.root.as_ref() }
    }

    // ---- runtime ------------------------------------------------------------

    /// Build the volatile worker registry. Call once after every open,
    /// before registering workers.
    pub fn runtime_initialize(&self) -> Result<(), Error> {
        let mut slot = self.runtime.write();
        if slot.is_some() {
            return Err(Error::RuntimeAlreadyInitialized);
        }
        let hdr = self.pool.header();
        let generation = self.pool.transaction(|tx| {
            let next = hdr.runtime_generation.load(Ordering::Acquire) + 1;
            tx.set_u64(&hdr.runtime_generation, next);
            Ok(next)
        })?;
        *slot = Some(Arc::new(Runtime::new(self.id, generation)));
        info!("[RUNTIME] initialized generation {}", generation);
        Ok(())
    }

    /// Tear the runtime down. Every worker must have been dropped.
    pub fn runtime_finalize(&self) -> Result<(), Error> {
        let mut slot = self.runtime.write();
        let Some(rt) = slot.as_ref() else {
            return Err(Error::RuntimeNotInitialized);
        };
        let workers = rt.worker_count();
        if workers > 0 {
            warn!("[RUNTIME] finalize refused: {} worker(s) registered", workers);
            return Err(Error::WorkersStillRegistered(workers));
        }
        info!("[RUNTIME] finalized generation {}", rt.generation());
        *slot = None;
        Ok(())
    }

    pub fn register_worker(&self) -> Result<WorkerHandle, Error> {
        let slot = self.runtime.read();
        // registering under the read lock keeps finalize from racing us
        slot.as_ref()
            .map(Runtime::register)
            .ok_or(Error::RuntimeNotInitialized)
    }

    pub(crate) fn runtime(&self) -> Result<Arc<Runtime>, Error> {
        self.runtime
            .read()
            .clone()
            .ok_or(Error::RuntimeNotInitialized)
    }

    #[inline(always)]
    fn check_token(&self, cs: &Critical<'_>) {
        assert_eq!(
            cs.tree_id, self.id,
            "critical section was opened on a different tree"
        );
    }

    // ---- readers ------------------------------------------------------------

    /// Look `key` up. The returned view lives as long as the critical section.
    pub fn find<'a>(&'a self, cs: &'a Critical<'_>, key: &[u8]) -> Option<LeafRef<'a>> {
        self.check_token(cs);
        let mut link = &self.tree_root().root;
        loop {
            // SAFETY: everything reachable when `cs` opened stays allocated
            // until it closes.
            let node: &'a Node = unsafe { link.load(Ordering::Acquire)?.as_ref() };
            match &node.kind {
                NodeKind::Leaf(leaf) => {
                    return (*leaf.key == *key).then_some(LeafRef { leaf });
                }
                NodeKind::Branch(branch) => {
                    #[cfg(feature = "trace")]
                    trace!("[FIND] branch depth={}", branch.depth());
                    if key.len() < branch.depth() {
                        return None;
                    }
                    link = branch.slot_for(key);
                }
            }
        }
    }

    pub fn contains(&self, cs: &Critical<'_>, key: &[u8]) -> bool {
        self.find(cs, key).is_some()
    }

    /// Entries in ascending key order.
    pub fn iter<'a>(&'a self, cs: &'a Critical<'_>) -> Iter<'a> {
        self.check_token(cs);
        Iter {
            stack: self.tree_root().root.load(Ordering::Acquire).into_iter().collect(),
            _cs: PhantomData,
        }
    }

    /// First entry with a key `>= key`.
    pub fn lower_bound<'a>(&'a self, cs: &'a Critical<'_>, key: &[u8]) -> Option<LeafRef<'a>> {
        self.check_token(cs);
        // SAFETY: protected by `cs`.
        let node: &'a Node = unsafe { self.tree_root().root.load(Ordering::Acquire)?.as_ref() };
        seek(node, key, true)
    }

    /// First entry with a key `> key`.
    pub fn upper_bound<'a>(&'a self, cs: &'a Critical<'_>, key: &[u8]) -> Option<LeafRef<'a>> {
        self.check_token(cs);
        // SAFETY: protected by `cs`.
        let node: &'a Node = unsafe { self.tree_root().root.load(Ordering::Acquire)?.as_ref() };
        seek(node, key, false)
    }

    pub fn len(&self) -> usize {
        self.tree_root().len.load(Ordering::Acquire) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Detached nodes not yet reclaimed.
    pub fn pending_count(&self) -> usize {
        self.tree_root().pending_len.load(Ordering::Acquire) as usize
    }

    /// Leaves and branches currently reachable from the root, plus the
    /// smallest branch fanout. A compact tree never has a branch below 2.
    pub fn node_counts(&self, cs: &Critical<'_>) -> NodeCounts {
        self.check_token(cs);
        let mut counts = NodeCounts::default();
        let mut stack: Vec<PPtr<Node>> =
            self.tree_root().root.load(Ordering::Acquire).into_iter().collect();
        while let Some(ptr) = stack.pop() {
            // SAFETY: protected by `cs`.
            match &unsafe { ptr.as_ref() }.kind {
                NodeKind::Leaf(_) => counts.leaves += 1,
                NodeKind::Branch(branch) => {
                    counts.branches += 1;
                    let before = stack.len();
                    stack.extend(branch.live_children().map(|(_, child)| child));
                    let fanout = stack.len() - before;
                    counts.min_branch_fanout =
                        Some(counts.min_branch_fanout.map_or(fanout, |min| min.min(fanout)));
                }
            }
        }
        counts
    }

    // ---- mutators -----------------------------------------------------------

    /// Insert `key` or replace its value, in one transaction.
    pub fn emplace(&self, key: &[u8], value: &[u8]) -> Result<Emplaced, Error> {
        let rt = self.runtime()?;
        let root = self.tree_root();
        let outcome = self.pool.transaction(|tx| {
            let mut link: &PAtomic<Node> = &root.root;
            loop {
                let Some(ptr) = link.load(Ordering::Acquire) else {
                    debug!("[EMPLACE] empty slot, linking new leaf");
                    let leaf = tx.allocate(Node::leaf(key, value))?;
                    // SAFETY: allocated by this transaction.
                    attach(tx, unsafe { leaf.as_ref() })?;
                    tx.store(link, Some(leaf));
                    break;
                };
                // SAFETY: only transactions unlink nodes and we hold the
                // transaction lock.
                let node: &Node = unsafe { ptr.as_ref() };
                match &node.kind {
                    NodeKind::Leaf(old) if *old.key == *key => {
                        debug!("[EMPLACE] key present, replacing leaf");
                        let leaf = tx.allocate(Node::leaf(key, value))?;
                        let entry = tx.allocate(PendingFree::new(ptr))?;
                        // SAFETY: allocated by this transaction.
                        attach(tx, unsafe { leaf.as_ref() })?;
                        detach(tx, node)?;
                        tx.store(link, Some(leaf));
                        enqueue(tx, root, &rt, entry);
                        return Ok(Emplaced::Updated);
                    }
                    NodeKind::Leaf(old) => {
                        let cpl = common_prefix_len(&old.key, key);
                        debug!("[EMPLACE] splitting leaf at byte {}", cpl);
                        split(tx, link, ptr, &old.key, cpl, key, value)?;
                        break;
                    }
                    NodeKind::Branch(branch) => {
                        let cpl = common_prefix_len(&branch.prefix, key);
                        if cpl < branch.depth() {
                            debug!(
                                "[EMPLACE] inserting above branch depth={} at byte {}",
                                branch.depth(),
                                cpl
                            );
                            split(tx, link, ptr, &branch.prefix, cpl, key, value)?;
                            break;
                        }
                        #[cfg(feature = "trace")]
                        trace!("[EMPLACE] descend depth={}", branch.depth());
                        link = branch.slot_for(key);
                    }
                }
            }
            tx.set_u64(&root.len, root.len.load(Ordering::Relaxed) + 1);
            Ok(Emplaced::Inserted)
        })?;
        counter!("radixpool_emplace_total").increment(1);
        trace!("[EMPLACE] key_len={} -> {:?}", key.len(), outcome);
        Ok(outcome)
    }

    /// Remove `key`. The leaf, and a branch left with a single child, are
    /// handed to the collector rather than freed.
    pub fn erase(&self, key: &[u8]) -> Result<bool, Error> {
        let rt = self.runtime()?;
        let root = self.tree_root();
        let removed = self.pool.transaction(|tx| {
            let mut parent: Option<(&PAtomic<Node>, PPtr<Node>, &Branch)> = None;
            let mut link: &PAtomic<Node> = &root.root;
            let leaf_ptr = loop {
                let Some(ptr) = link.load(Ordering::Acquire) else {
                    return Ok(false);
                };
                // SAFETY: as in `emplace`.
                let node: &Node = unsafe { ptr.as_ref() };
                match &node.kind {
                    NodeKind::Leaf(leaf) if *leaf.key == *key => break ptr,
                    NodeKind::Leaf(_) => return Ok(false),
                    NodeKind::Branch(branch) => {
                        if key.len() < branch.depth() {
                            return Ok(false);
                        }
                        parent = Some((link, ptr, branch));
                        link = branch.slot_for(key);
                    }
                }
            };
            // SAFETY: as in `emplace`.
            let leaf_node: &Node = unsafe { leaf_ptr.as_ref() };

            match parent {
                Some((parent_link, branch_ptr, branch)) if branch.live_children().count() == 2 => {
                    // collapse: the sibling takes the branch's place
                    let sibling = branch
                        .live_children()
                        .find(|(slot, _)| !std::ptr::eq(*slot, link))
                        .map(|(_, child)| child);
                    let leaf_entry = tx.allocate(PendingFree::new(leaf_ptr))?;
                    let branch_entry = tx.allocate(PendingFree::new(branch_ptr))?;
                    // SAFETY: as in `emplace`.
                    detach(tx, leaf_node)?;
                    detach(tx, unsafe { branch_ptr.as_ref() })?;
                    tx.store(parent_link, sibling);
                    enqueue(tx, root, &rt, leaf_entry);
                    enqueue(tx, root, &rt, branch_entry);
                    debug!("[ERASE] leaf removed, branch depth={} merged", branch.depth());
                }
                _ => {
                    let entry = tx.allocate(PendingFree::new(leaf_ptr))?;
                    detach(tx, leaf_node)?;
                    tx.store(link, None);
                    enqueue(tx, root, &rt, entry);
                    debug!("[ERASE] leaf removed");
                }
            }
            tx.set_u64(&root.len, root.len.load(Ordering::Relaxed) - 1);
            Ok(true)
        })?;
        if removed {
            counter!("radixpool_erase_total").increment(1);
        }
        trace!("[ERASE] key_len={} removed={}", key.len(), removed);
        Ok(removed)
    }

    /// Detach every node in one transaction. Returns the number of entries
    /// removed; memory comes back through the collector.
    pub fn clear(&self) -> Result<usize, Error> {
        let rt = self.runtime()?;
        let root = self.tree_root();
        let cleared = self.pool.transaction(|tx| {
            let nodes = collect_nodes(root);
            let mut entries = Vec::with_capacity(nodes.len());
            for &ptr in &nodes {
                entries.push(tx.allocate(PendingFree::new(ptr))?);
            }
            for &ptr in &nodes {
                // SAFETY: as in `emplace`.
                detach(tx, unsafe { ptr.as_ref() })?;
            }
            let len = root.len.load(Ordering::Relaxed);
            tx.store(&root.root, None);
            tx.set_u64(&root.len, 0);
            for entry in entries {
                enqueue(tx, root, &rt, entry);
            }
            Ok(len as usize)
        })?;
        info!("[CLEAR] tree cleared, {} entries detached", cleared);
        Ok(cleared)
    }

    /// Free the whole structure: live nodes, pending entries and the root
    /// object, and clear the pool's root reference. The runtime must be
    /// finalized first.
    pub fn destroy(self) -> Result<(), Error> {
        if self.runtime.read().is_some() {
            return Err(Error::RuntimeStillActive);
        }
        let root = self.tree_root();
        let hdr = self.pool.header();
        let freed = self.pool.transaction(|tx| {
            let live = collect_nodes(root);
            for &ptr in &live {
                // SAFETY: no runtime means no readers, and we hold the
                // transaction lock.
                let node = unsafe { ptr.as_ref() };
                detach(tx, node)?;
                node.transition(tx, NodeState::Detached, NodeState::Freed)?;
                tx.release(ptr)?;
            }
            let mut pending = root.pending.load(Ordering::Acquire);
            let mut entries = 0usize;
            while let Some(entry) = pending {
                // SAFETY: as above.
                let record = unsafe { entry.as_ref() };
                let node = unsafe { record.node.as_ref() };
                node.transition(tx, NodeState::Detached, NodeState::Freed)?;
                tx.release(record.node)?;
                tx.release(entry)?;
                entries += 1;
                pending = record.next.load(Ordering::Acquire);
            }
            tx.store(&hdr.root, None);
            tx.release(self.root)?;
            Ok(live.len() + entries)
        })?;
        info!(
            "[DESTROY] tree in pool {} destroyed, {} nodes freed",
            self.pool.name(),
            freed
        );
        Ok(())
    }
}

/// Replace the node at `link` by a branch over `key[..cpl]` holding both the
/// old node (whose key or prefix is `existing`) and a new leaf for `key`.
fn split<'p>(
    tx: &mut Transaction<'p>,
    link: &'p PAtomic<Node>,
    existing: PPtr<Node>,
    existing_key: &[u8],
    cpl: usize,
    key: &[u8],
    value: &[u8],
) -> Result<(), Error> {
    let leaf = tx.allocate(Node::leaf(key, value))?;
    let branch = Branch::new(&key[..cpl]);
    branch.slot_for(existing_key).init(Some(existing));
    branch.slot_for(key).init(Some(leaf));
    let node = tx.allocate(Node::branch(branch))?;
    // SAFETY: both allocated by this transaction.
    attach(tx, unsafe { leaf.as_ref() })?;
    attach(tx, unsafe { node.as_ref() })?;
    tx.store(link, Some(node));
    Ok(())
}

/// Smallest entry under `node`. Callers hold a critical section for 'a.
fn leftmost<'a>(node: &'a Node) -> Option<LeafRef<'a>> {
    match &node.kind {
        NodeKind::Leaf(leaf) => Some(LeafRef { leaf }),
        NodeKind::Branch(branch) => first_in(branch.slots()),
    }
}

fn first_in<'a>(mut slots: impl Iterator<Item = &'a PAtomic<Node>>) -> Option<LeafRef<'a>> {
    slots.find_map(|slot| {
        // SAFETY: as in `leftmost`.
        let child: &'a Node = unsafe { slot.load(Ordering::Acquire)?.as_ref() };
        leftmost(child)
    })
}

/// Smallest entry under `node` with a key `>= key` (`> key` unless
/// `inclusive`). Whole subtrees are skipped by comparing branch prefixes.
fn seek<'a>(node: &'a Node, key: &[u8], inclusive: bool) -> Option<LeafRef<'a>> {
    let branch = match &node.kind {
        NodeKind::Leaf(leaf) => {
            let found = if inclusive { *leaf.key >= *key } else { *leaf.key > *key };
            return found.then_some(LeafRef { leaf });
        }
        NodeKind::Branch(branch) => branch,
    };
    let depth = branch.depth();
    let shared = depth.min(key.len());
    match branch.prefix[..shared].cmp(&key[..shared]) {
        Cmp::Less => None,
        Cmp::Greater => leftmost(node),
        Cmp::Equal if key.len() < depth => leftmost(node),
        // the terminal leaf holds `key` itself
        Cmp::Equal if key.len() == depth && inclusive => leftmost(node),
        Cmp::Equal if key.len() == depth => first_in(branch.children.iter()),
        Cmp::Equal => {
            let byte = key[depth] as usize;
            let below = branch.children[byte].load(Ordering::Acquire).and_then(|child| {
                // SAFETY: as in `leftmost`.
                seek(unsafe { child.as_ref() }, key, inclusive)
            });
            below.or_else(|| first_in(branch.children[byte + 1..].iter()))
        }
    }
}

/// Every node reachable from the root. Caller must exclude mutators.
fn collect_nodes(root: &TreeRoot) -> Vec<PPtr<Node>> {
    let mut out = Vec::new();
    let mut stack: Vec<PPtr<Node>> = root.root.load(Ordering::Acquire).into_iter().collect();
    while let Some(ptr) = stack.pop() {
        out.push(ptr);
        // SAFETY: see caller.
        if let NodeKind::Branch(branch) = &unsafe { ptr.as_ref() }.kind {
            stack.extend(branch.live_children().map(|(_, child)| child));
        }
    }
    out
}

impl Drop for RadixTree {
    fn drop(&mut self) {
        if let Some(rt) = self.runtime.get_mut().take() {
            if rt.worker_count() > 0 {
                warn!(
                    "[CLOSE] tree dropped with {} worker(s) still registered",
                    rt.worker_count()
                );
            }
        }
        self.pool.inner.attached.store(false, Ordering::Release);
        debug!("[CLOSE] tree handle {} detached", self.id);
    }
}
