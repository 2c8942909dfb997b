//! Object pool that backs the tree: a named, capacity-bounded store of
//! heap objects with a header holding the durable root reference.
//!
//! Every object lives in the pool's allocation table until a committed
//! transaction releases it, so `allocation_count` is an exact live count.
//! Closing the last handle to a pool frees whatever is still allocated.

use crate::constants::{DEFAULT_CAPACITY, HEADER_MAGIC, HEADER_VERSION};
use crate::errors::Error;
use crate::transaction::Transaction;
use crate::types::Header;
use dashmap::DashMap;
use log::{debug, info, warn};
use metrics::{counter, gauge};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Pointer to an object owned by a [`Pool`].
pub struct PPtr<T> {
    raw: NonNull<T>,
}

impl<T> Clone for PPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PPtr<T> {}

impl<T> PartialEq for PPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for PPtr<T> {}

impl<T> fmt::Debug for PPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PPtr({:p})", self.raw)
    }
}

// SAFETY: a PPtr is an address into the pool's table; the pointee is
// Send + Sync and its lifetime is governed by transactions, not by the handle.
unsafe impl<T: Send + Sync> Send for PPtr<T> {}
unsafe impl<T: Send + Sync> Sync for PPtr<T> {}

impl<T> PPtr<T> {
    fn from_box(value: Box<T>) -> Self {
        Self {
            raw: NonNull::from(Box::leak(value)),
        }
    }

    fn from_raw(raw: *mut T) -> Option<Self> {
        NonNull::new(raw).map(|raw| Self { raw })
    }

    /// Borrow the pointee.
    ///
    /// # Safety
    /// The object must stay allocated for all of `'a`: either the caller is
    /// the single mutator (nothing else frees), or it holds a critical section
    /// that was opened while the object was reachable.
    pub unsafe fn as_ref<'a>(self) -> &'a T {
        &*self.raw.as_ptr()
    }

    pub fn as_ptr(self) -> *mut T {
        self.raw.as_ptr()
    }

    pub(crate) fn addr(self) -> usize {
        self.raw.as_ptr() as usize
    }
}

/// Persistent link cell: an atomically updated, optional [`PPtr`].
pub struct PAtomic<T> {
    inner: AtomicPtr<T>,
}

impl<T> PAtomic<T> {
    pub const fn null() -> Self {
        Self {
            inner: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    #[inline(always)]
    pub fn load(&self, order: Ordering) -> Option<PPtr<T>> {
        PPtr::from_raw(self.inner.load(order))
    }

    /// Plain store, only for cells of objects no reader can reach yet.
    /// Reachable cells go through [`Transaction::store`].
    pub fn init(&self, value: Option<PPtr<T>>) {
        self.inner.store(raw_of(value), Ordering::Relaxed);
    }

    pub(crate) fn swap(&self, value: Option<PPtr<T>>, order: Ordering) -> *mut T {
        self.inner.swap(raw_of(value), order)
    }

    pub(crate) fn as_erased(&self) -> *const AtomicPtr<()> {
        &self.inner as *const AtomicPtr<T> as *const AtomicPtr<()>
    }
}

impl<T> Default for PAtomic<T> {
    fn default() -> Self {
        Self::null()
    }
}

#[inline(always)]
fn raw_of<T>(value: Option<PPtr<T>>) -> *mut T {
    value.map_or(std::ptr::null_mut(), PPtr::as_ptr)
}

/// Type-erased owning entry of the allocation table.
pub(crate) struct Erased {
    ptr: *mut (),
    drop_fn: unsafe fn(*mut ()),
}

unsafe fn drop_boxed<T>(ptr: *mut ()) {
    drop(Box::from_raw(ptr as *mut T));
}

impl Erased {
    fn new<T: Send + Sync + 'static>(ptr: PPtr<T>) -> Self {
        Self {
            ptr: ptr.as_ptr() as *mut (),
            drop_fn: drop_boxed::<T>,
        }
    }
}

impl Drop for Erased {
    fn drop(&mut self) {
        // SAFETY: ptr came from Box<T>::leak with the matching drop_fn and the
        // table entry is the only owner.
        unsafe { (self.drop_fn)(self.ptr) }
    }
}

// SAFETY: only constructed for T: Send + Sync.
unsafe impl Send for Erased {}
unsafe impl Sync for Erased {}

pub(crate) struct PoolInner {
    pub(crate) name: String,
    pub(crate) hdr: Header,
    pub(crate) objects: DashMap<usize, Erased>,
    pub(crate) tx_lock: Mutex<()>,
    /// Set while a tree handle is attached (volatile).
    pub(crate) attached: AtomicBool,
}

impl PoolInner {
    /// Box `value` into the table. Capacity is checked by the caller.
    pub(crate) fn insert<T: Send + Sync + 'static>(&self, value: T) -> PPtr<T> {
        let ptr = PPtr::from_box(Box::new(value));
        self.objects.insert(ptr.addr(), Erased::new(ptr));
        ptr
    }

    pub(crate) fn free(&self, addr: usize) -> bool {
        self.objects.remove(&addr).is_some()
    }
}

static POOLS: Lazy<Mutex<HashMap<String, Weak<PoolInner>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Handle to a named pool. Cloning shares the same store.
#[derive(Clone)]
pub struct Pool {
    pub(crate) inner: Arc<PoolInner>,
}

impl Pool {
    /// Create or attach to the pool called `name`.
    pub fn open(name: &str, capacity: usize) -> Result<Self, Error> {
        crate::ensure_logging();
        crate::telemetry::init();
        if capacity == 0 {
            return Err(Error::ZeroCapacity);
        }

        let mut pools = POOLS.lock();
        if let Some(inner) = pools.get(name).and_then(Weak::upgrade) {
            // never drop a pool while holding the name table
            drop(pools);
            let hdr = &inner.hdr;
            if hdr.magic != HEADER_MAGIC
                || hdr.version != HEADER_VERSION
                || hdr.capacity != capacity
            {
                warn!(
                    "[OPEN] pool {} exists with capacity={}, requested {}",
                    name, hdr.capacity, capacity
                );
                return Err(Error::HeaderMismatch);
            }
            info!("[OPEN] attached to pool {}", name);
            return Ok(Self { inner });
        }

        let inner = Arc::new(PoolInner {
            name: name.to_owned(),
            hdr: Header {
                magic: HEADER_MAGIC,
                version: HEADER_VERSION,
                capacity,
                root: Default::default(),
                runtime_generation: AtomicU64::new(0),
                tx_seq: AtomicU64::new(0),
            },
            objects: DashMap::new(),
            tx_lock: Mutex::new(()),
            attached: AtomicBool::new(false),
        });
        pools.insert(name.to_owned(), Arc::downgrade(&inner));
        info!("[OPEN] created pool {} capacity={}", name, capacity);
        Ok(Self { inner })
    }

    pub fn open_default(name: &str) -> Result<Self, Error> {
        Self::open(name, DEFAULT_CAPACITY)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.hdr.capacity
    }

    /// Number of objects currently allocated in the pool.
    pub fn allocation_count(&self) -> usize {
        self.inner.objects.len()
    }

    pub(crate) fn header(&self) -> &Header {
        &self.inner.hdr
    }

    /// Run `body` atomically. `Ok` commits; `Err` or a panic restores every
    /// logged write and frees every allocation made by `body`.
    pub fn transaction<'p, F, R>(&'p self, body: F) -> Result<R, Error>
    where
        F: FnOnce(&mut Transaction<'p>) -> Result<R, Error>,
    {
        let mut tx = Transaction::begin(&self.inner)?;
        match body(&mut tx) {
            Ok(value) => {
                tx.commit();
                Ok(value)
            }
            Err(e) => {
                warn!("[TX] seq={} aborted: {}", tx.seq(), e);
                counter!("radixpool_tx_aborts_total", "reason" => e.code().as_str()).increment(1);
                drop(tx);
                Err(e)
            }
        }
    }

    /// Emit gauges (caller decides cadence).
    pub fn report_metrics(&self) {
        gauge!("radixpool_live_allocations").set(self.allocation_count() as f64);
    }

    /// Drop this handle. The store goes away with the last handle.
    pub fn close(self) {}
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.hdr.capacity)
            .field("allocations", &self.allocation_count())
            .finish()
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let mut pools = POOLS.lock();
        if pools
            .get(&self.name)
            .is_some_and(|weak| weak.strong_count() == 0)
        {
            pools.remove(&self.name);
        }
        drop(pools);
        debug!(
            "[CLOSE] pool {} closed with {} live objects",
            self.name,
            self.objects.len()
        );
        // remaining objects are freed with the table
    }
}
