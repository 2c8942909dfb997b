//! Data structures for the radix tree

use crate::constants::FANOUT;
use crate::errors::Error;
use crate::pool::{PAtomic, PPtr, Pool};
use crate::registry::Runtime;
use crate::transaction::Transaction;
use parking_lot::{Mutex, RwLock};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Pool header
pub struct Header {
    pub magic: u64,                     // identifies a valid radixpool header
    pub version: u16,                   // layout version
    pub capacity: usize,                // max live objects
    pub root: PAtomic<TreeRoot>,        // durable root reference
    pub runtime_generation: AtomicU64,  // bumped by every runtime_initialize
    pub tx_seq: AtomicU64,              // last transaction sequence number
}

/// Persistent part of a tree, allocated in the pool.
pub struct TreeRoot {
    pub root: PAtomic<Node>,
    /// Detached nodes awaiting reclamation, newest first.
    pub pending: PAtomic<PendingFree>,
    pub len: AtomicU64,
    pub pending_len: AtomicU64,
}

impl TreeRoot {
    pub fn new() -> Self {
        Self {
            root: PAtomic::null(),
            pending: PAtomic::null(),
            len: AtomicU64::new(0),
            pending_len: AtomicU64::new(0),
        }
    }
}

impl Default for TreeRoot {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle of a node: `Unallocated -> Linked -> Detached -> Freed`.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NodeState {
    Unallocated = 0,
    Linked = 1,
    Detached = 2,
    Freed = 3,
}

impl NodeState {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => NodeState::Linked,
            2 => NodeState::Detached,
            3 => NodeState::Freed,
            _ => NodeState::Unallocated,
        }
    }

    pub fn can_become(self, next: NodeState) -> bool {
        matches!(
            (self, next),
            (NodeState::Unallocated, NodeState::Linked)
                | (NodeState::Linked, NodeState::Detached)
                | (NodeState::Detached, NodeState::Freed)
        )
    }
}

pub struct Node {
    state: AtomicU8,
    pub kind: NodeKind,
}

pub enum NodeKind {
    Leaf(Leaf),
    Branch(Branch),
}

/// Terminal key/value entry. Never mutated after it is linked; an update
/// links a fresh leaf instead.
pub struct Leaf {
    pub key: Box<[u8]>,
    pub value: Box<[u8]>,
}

/// Routing node. `prefix` is the full key prefix shared by everything below,
/// so its length is the index of the byte that selects a child.
pub struct Branch {
    pub prefix: Box<[u8]>,
    /// Leaf whose key is exactly `prefix`.
    pub terminal: PAtomic<Node>,
    pub children: Box<[PAtomic<Node>; FANOUT]>,
}

impl Node {
    pub fn leaf(key: &[u8], value: &[u8]) -> Self {
        Self {
            state: AtomicU8::new(NodeState::Unallocated as u8),
            kind: NodeKind::Leaf(Leaf {
                key: key.into(),
                value: value.into(),
            }),
        }
    }

    pub fn branch(branch: Branch) -> Self {
        Self {
            state: AtomicU8::new(NodeState::Unallocated as u8),
            kind: NodeKind::Branch(branch),
        }
    }

    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Logged lifecycle step; anything but the next legal state is rejected.
    pub(crate) fn transition<'p>(
        &'p self,
        tx: &mut Transaction<'p>,
        from: NodeState,
        to: NodeState,
    ) -> Result<(), Error> {
        let current = self.state();
        if current != from || !current.can_become(to) {
            return Err(Error::IllegalTransition { from: current, to });
        }
        tx.set_u8(&self.state, to as u8);
        Ok(())
    }
}

impl Branch {
    pub fn new(prefix: &[u8]) -> Self {
        Self {
            prefix: prefix.into(),
            terminal: PAtomic::null(),
            children: Box::new(std::array::from_fn(|_| PAtomic::null())),
        }
    }

    #[inline(always)]
    pub fn depth(&self) -> usize {
        self.prefix.len()
    }

    /// Slot a key routes to. `key` must be at least `depth()` bytes long.
    #[inline]
    pub fn slot_for(&self, key: &[u8]) -> &PAtomic<Node> {
        debug_assert!(key.len() >= self.depth());
        match key.get(self.depth()) {
            None => &self.terminal,
            Some(&byte) => &self.children[byte as usize],
        }
    }

    /// Terminal slot first, then children in byte order.
    pub fn slots(&self) -> impl DoubleEndedIterator<Item = &PAtomic<Node>> {
        std::iter::once(&self.terminal).chain(self.children.iter())
    }

    pub fn live_children(&self) -> impl Iterator<Item = (&PAtomic<Node>, PPtr<Node>)> {
        self.slots()
            .filter_map(|slot| slot.load(Ordering::Acquire).map(|node| (slot, node)))
    }
}

/// A detached node waiting for every reader that could see it to leave.
pub struct PendingFree {
    pub node: PPtr<Node>,
    pub generation: AtomicU64,
    pub epoch: AtomicU64,
    pub next: PAtomic<PendingFree>,
}

impl PendingFree {
    pub fn new(node: PPtr<Node>) -> Self {
        Self {
            node,
            generation: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            next: PAtomic::null(),
        }
    }
}

/// Read-only view of an entry, valid for the enclosing critical section.
#[derive(Clone, Copy)]
pub struct LeafRef<'a> {
    pub(crate) leaf: &'a Leaf,
}

impl<'a> LeafRef<'a> {
    pub fn key(&self) -> &'a [u8] {
        &self.leaf.key
    }

    pub fn value(&self) -> &'a [u8] {
        &self.leaf.value
    }
}

impl std::fmt::Debug for LeafRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafRef")
            .field("key", &self.key())
            .field("value_len", &self.value().len())
            .finish()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Emplaced {
    Inserted,
    Updated,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct NodeCounts {
    pub leaves: usize,
    pub branches: usize,
    /// Fewest live slots on any reachable branch, `None` without branches.
    pub min_branch_fanout: Option<usize>,
}

/// In-order leaf traversal.
pub struct Iter<'a> {
    pub(crate) stack: Vec<PPtr<Node>>,
    pub(crate) _cs: PhantomData<&'a ()>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = LeafRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(ptr) = self.stack.pop() {
            // SAFETY: the iterator borrows a critical section for 'a.
            let node: &'a Node = unsafe { ptr.as_ref() };
            match &node.kind {
                NodeKind::Leaf(leaf) => return Some(LeafRef { leaf }),
                NodeKind::Branch(branch) => {
                    // reversed so the terminal and low bytes pop first
                    self.stack.extend(
                        branch
                            .slots()
                            .rev()
                            .filter_map(|slot| slot.load(Ordering::Acquire)),
                    );
                }
            }
        }
        None
    }
}

/// Handle to the radix tree stored in a pool
pub struct RadixTree {
    pub(crate) pool: Pool,
    pub(crate) root: PPtr<TreeRoot>,
    pub(crate) id: u64,
    pub(crate) runtime: RwLock<Option<Arc<Runtime>>>,
    pub(crate) gc_lock: Mutex<()>,
}
