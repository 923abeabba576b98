//! Slab heap: small allocations served from per-class slabs
//!
//! A slab heap keeps each slab it owns on exactly one list: a
//! `(size class, fullness)` bucket or the empty list. Allocation takes the
//! fullest non-full slab of the requested class and falls back, in order, to
//! an empty slab of any class, a slab borrowed from the parent heap, and a
//! fresh slab carved out of the extent heap.
//!
//! # Ownership
//!
//! Heaps of one family (a root and the children built with
//! [`SlabHeap::with_parent`]) share a [`SlabArena`] holding every slab
//! descriptor and a directory of live heaps. A slab moves between heaps of
//! the family, so its owner is an atomic heap id. Freeing a block reads the
//! owner, locks the owner's lists, and retries if the slab changed hands in
//! between. Locks are always taken child before parent and lists before
//! slab.

use super::list::SlabLists;
use super::size_class::{self, NUM_SIZE_CLASSES, SIZE_CLASSES};
use super::slab::{max_nblocks, Slab, SLAB_FULLNESS_BINS};
use crate::error::{Error, ErrorCode, Result};
use crate::extent::{ExtentHeap, ExtentKind};
use crate::heap::Heap;
use crate::region::{RPtr, Region};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

/// Identity of a slab heap within its process
pub type HeapId = u64;

const NO_OWNER: HeapId = 0;

static NEXT_HEAP_ID: AtomicU64 = AtomicU64::new(1);

/// Retries a free makes while the slab's owner stays unusable
const MAX_STALLED_RETRIES: u32 = 10_000;

const EMPTY_LIST: usize = NUM_SIZE_CLASSES * SLAB_FULLNESS_BINS;
const NUM_LISTS: usize = EMPTY_LIST + 1;

fn bucket(size_class: usize, fullness: usize) -> usize {
    size_class * SLAB_FULLNESS_BINS + fullness
}

fn list_for(slab: &Slab) -> usize {
    if slab.empty() {
        EMPTY_LIST
    } else {
        bucket(slab.size_class(), slab.fullness())
    }
}

/// List a slab sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bucket {
    Class { size_class: usize, fullness: usize },
    Empty,
}

impl Bucket {
    fn from_list(list: usize) -> Self {
        if list == EMPTY_LIST {
            Bucket::Empty
        } else {
            Bucket::Class {
                size_class: list / SLAB_FULLNESS_BINS,
                fullness: list % SLAB_FULLNESS_BINS,
            }
        }
    }
}

/// Slab descriptor shared by every heap of a family
pub struct SharedSlab {
    base: RPtr,
    owner: AtomicU64,
    slab: Mutex<Slab>,
}

impl SharedSlab {
    fn new(slab: Slab) -> Self {
        Self {
            base: slab.base(),
            owner: AtomicU64::new(NO_OWNER),
            slab: Mutex::new(slab),
        }
    }

    pub fn base(&self) -> RPtr {
        self.base
    }

    /// Heap currently holding the slab on one of its lists
    pub fn owner(&self) -> Option<HeapId> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            id => Some(id),
        }
    }

    fn set_owner(&self, owner: Option<HeapId>) {
        self.owner.store(owner.unwrap_or(NO_OWNER), Ordering::Release);
    }

    pub fn lock(&self) -> MutexGuard<'_, Slab> {
        self.slab.lock()
    }
}

/// Slab descriptors and live heaps of one heap family
#[derive(Default)]
pub struct SlabArena {
    slabs: RwLock<BTreeMap<RPtr, Arc<SharedSlab>>>,
    heaps: RwLock<HashMap<HeapId, Weak<SlabHeap>>>,
}

impl SlabArena {
    fn register_slab(&self, slab: Slab) -> Result<Arc<SharedSlab>> {
        let base = slab.base();
        let mut slabs = self.slabs.write();
        if slabs.contains_key(&base) {
            return Err(Error::InvalidParameter(format!(
                "slab {} is already registered",
                base
            )));
        }
        let shared = Arc::new(SharedSlab::new(slab));
        slabs.insert(base, Arc::clone(&shared));
        Ok(shared)
    }

    /// Slab whose base is `base`
    pub fn slab(&self, base: RPtr) -> Option<Arc<SharedSlab>> {
        self.slabs.read().get(&base).cloned()
    }

    /// Slab with the highest base at or below `ptr`
    pub fn slab_containing(&self, ptr: RPtr) -> Option<Arc<SharedSlab>> {
        self.slabs
            .read()
            .range(..=ptr)
            .next_back()
            .map(|(_, shared)| Arc::clone(shared))
    }

    /// Number of registered slabs
    pub fn len(&self) -> usize {
        self.slabs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slabs.read().is_empty()
    }

    fn heap(&self, id: HeapId) -> Option<Arc<SlabHeap>> {
        self.heaps.read().get(&id).and_then(Weak::upgrade)
    }
}

/// Per size class counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeClassStats {
    pub index: usize,
    pub block_size: usize,
    pub slabs: usize,
    pub total_blocks: usize,
    pub free_blocks: usize,
    pub allocated_blocks: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlabHeapStats {
    pub slabs: usize,
    pub empty_slabs: usize,
    pub size_classes: Vec<SizeClassStats>,
    pub total_allocated: usize,
}

pub struct SlabHeap {
    id: HeapId,
    slabsize: usize,
    region: Arc<Region>,
    extent_heap: Option<Arc<ExtentHeap>>,
    parent: Option<Arc<SlabHeap>>,
    arena: Arc<SlabArena>,
    lists: Mutex<SlabLists>,
}

impl SlabHeap {
    /// Root heap growing slabs of `slabsize` bytes out of `extent_heap`
    pub fn new(slabsize: usize, extent_heap: Arc<ExtentHeap>) -> Result<Arc<Self>> {
        if slabsize == 0 || slabsize % extent_heap.blocksize() != 0 {
            return Err(Error::InvalidParameter(format!(
                "slab size {} is not a multiple of the {}-byte extent block",
                slabsize,
                extent_heap.blocksize()
            )));
        }
        let region = Arc::clone(extent_heap.region());
        Ok(Self::build(
            slabsize,
            region,
            Some(extent_heap),
            None,
            Arc::new(SlabArena::default()),
        ))
    }

    /// Root heap with no extent heap behind it
    ///
    /// Slabs are placed by the caller with [`SlabHeap::make_slab`] or
    /// [`SlabHeap::insert_slab`].
    pub fn standalone(slabsize: usize, region: Arc<Region>) -> Arc<Self> {
        Self::build(slabsize, region, None, None, Arc::new(SlabArena::default()))
    }

    /// Child heap that borrows slabs from `parent` before growing
    pub fn with_parent(parent: &Arc<SlabHeap>) -> Arc<Self> {
        Self::build(
            parent.slabsize,
            Arc::clone(&parent.region),
            parent.extent_heap.clone(),
            Some(Arc::clone(parent)),
            Arc::clone(&parent.arena),
        )
    }

    fn build(
        slabsize: usize,
        region: Arc<Region>,
        extent_heap: Option<Arc<ExtentHeap>>,
        parent: Option<Arc<SlabHeap>>,
        arena: Arc<SlabArena>,
    ) -> Arc<Self> {
        let id = NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed);
        Arc::new_cyclic(|weak| {
            arena.heaps.write().insert(id, weak.clone());
            Self {
                id,
                slabsize,
                region,
                extent_heap,
                parent,
                arena,
                lists: Mutex::new(SlabLists::new(NUM_LISTS)),
            }
        })
    }

    pub fn id(&self) -> HeapId {
        self.id
    }

    pub fn slabsize(&self) -> usize {
        self.slabsize
    }

    pub fn parent(&self) -> Option<&Arc<SlabHeap>> {
        self.parent.as_ref()
    }

    pub fn extent_heap(&self) -> Option<&Arc<ExtentHeap>> {
        self.extent_heap.as_ref()
    }

    pub fn arena(&self) -> &Arc<SlabArena> {
        &self.arena
    }

    /// Re-register every slab the extent heap holds
    ///
    /// Run once on a root heap after its extent heap is loaded. Returns the
    /// number of slabs recovered.
    pub fn init(&self) -> Result<usize> {
        let extent_heap = self.extent_heap.as_ref().ok_or_else(|| {
            Error::InvalidParameter("slab recovery needs an extent heap".to_string())
        })?;

        let candidates: Vec<_> = extent_heap
            .iter()
            .filter(|extent| !extent.is_free() && extent.kind() == ExtentKind::Slab)
            .collect();

        let mut recovered = 0;
        for extent in candidates {
            if extent.len() * extent_heap.blocksize() != self.slabsize {
                warn!(
                    extent = %extent.interval(),
                    slabsize = self.slabsize,
                    "Skipping slab extent of unexpected size"
                );
                continue;
            }
            match self.insert_slab(extent.payload()) {
                Ok(_) => recovered += 1,
                Err(e) => warn!(slab = %extent.payload(), error = %e, "Skipping unreadable slab"),
            }
        }

        info!(recovered, slabsize = self.slabsize, "Recovered slab heap");
        Ok(recovered)
    }

    /// Allocate a block of the smallest class holding `size` bytes
    pub fn malloc(&self, size: usize) -> Result<RPtr> {
        let class = self.class_for(size)?;
        let mut lists = self.lists.lock();

        let shared = match self.find_slab(&lists, class) {
            Some(shared) => shared,
            None => self.refill(&mut lists, class)?,
        };
        let ptr = self.alloc_block(&mut lists, &shared).ok_or_else(|| {
            Error::OutOfMemory(format!("slab {} has no free block", shared.base()))
        })?;

        debug!("Allocated {} bytes at {}", size, ptr);
        Ok(ptr)
    }

    /// Free a block, whichever heap of the family owns its slab now
    ///
    /// A slab that stays without a live owner (taken off every list, or left
    /// behind by a dropped root) cannot be freed into: `InvalidAddress`.
    pub fn free(&self, ptr: RPtr) -> Result<()> {
        let shared = self.locate(ptr)?;

        let mut retries: u64 = 0;
        let mut stalled = 0;
        loop {
            let observed = shared.owner();
            if let Some(owner) = observed.and_then(|id| self.arena.heap(id)) {
                let mut lists = owner.lists.lock();
                if shared.owner() == Some(owner.id) {
                    owner.free_block(&mut lists, &shared, ptr)?;
                    debug!("Freed {} (owner {}, {} retries)", ptr, owner.id, retries);
                    return Ok(());
                }
            }

            retries += 1;
            if shared.owner() == observed {
                stalled += 1;
                if stalled >= MAX_STALLED_RETRIES {
                    warn!(owner = ?observed, "Slab {} has no live owner; cannot free {}", shared.base(), ptr);
                    return Err(Error::InvalidAddress(ptr));
                }
            } else {
                stalled = 0;
            }
            trace!(retries, "Slab {} changed owner while freeing {}", shared.base(), ptr);
            std::thread::yield_now();
        }
    }

    /// Block size of the slab block holding `ptr`, or 0
    pub fn getsize(&self, ptr: RPtr) -> usize {
        match self.locate(ptr) {
            Ok(shared) => {
                let slab = shared.lock();
                if slab.contains(ptr) {
                    slab.block_size()
                } else {
                    0
                }
            }
            Err(_) => 0,
        }
    }

    /// Hand a slab of `class` to a child heap
    ///
    /// The slab leaves this heap's lists unowned; the caller links it.
    /// Returns `None` when this heap has nothing to give and cannot grow.
    pub fn acquire_slab(&self, class: usize) -> Result<Option<Arc<SharedSlab>>> {
        self.hand_out_slab(class, None)
    }

    /// Give a slab of `class` to `recipient`, which must hold its own list
    /// lock until it links the slab
    fn hand_out_slab(&self, class: usize, recipient: Option<HeapId>) -> Result<Option<Arc<SharedSlab>>> {
        let mut lists = self.lists.lock();

        let found = match self.find_slab(&lists, class) {
            Some(shared) => Some(shared),
            None => self.reuse_empty_slab(&mut lists, class)?,
        };
        if let Some(shared) = found {
            lists.remove(shared.base());
            shared.set_owner(recipient);
            debug!("Heap {} handed out slab {}", self.id, shared.base());
            return Ok(Some(shared));
        }

        match self.fresh_slab(class) {
            Ok(shared) => {
                shared.set_owner(recipient);
                Ok(Some(shared))
            }
            Err(e) if e.code() == ErrorCode::OutOfMemory => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Register and list the slab already formatted at `base`
    pub fn insert_slab(&self, base: RPtr) -> Result<Arc<SharedSlab>> {
        let slab = Slab::load(Arc::clone(&self.region), base)?;
        let shared = self.arena.register_slab(slab)?;
        let mut lists = self.lists.lock();
        self.link_slab(&mut lists, &shared);
        Ok(shared)
    }

    /// Take the slab at `base` off this heap's lists, leaving it unowned
    ///
    /// Returns `None` when this heap does not hold the slab.
    pub fn remove_slab(&self, base: RPtr) -> Option<Arc<SharedSlab>> {
        let mut lists = self.lists.lock();
        lists.list_of(base)?;
        let shared = self.shared(base);
        self.unlink_slab(&mut lists, &shared);
        Some(shared)
    }

    /// Format a slab of `class` at `base` and list it
    pub fn make_slab(&self, base: RPtr, class: usize) -> Result<Arc<SharedSlab>> {
        Slab::make(Arc::clone(&self.region), base, self.slabsize, class)?;
        self.insert_slab(base)
    }

    /// Owner of the slab at `base`
    pub fn owner_of(&self, base: RPtr) -> Option<HeapId> {
        self.arena.slab(base).and_then(|shared| shared.owner())
    }

    /// List of this heap holding the slab at `base`
    pub fn bucket_of(&self, base: RPtr) -> Option<Bucket> {
        self.lists.lock().list_of(base).map(Bucket::from_list)
    }

    pub fn stats(&self) -> SlabHeapStats {
        let lists = self.lists.lock();
        let mut stats = SlabHeapStats {
            slabs: lists.total(),
            empty_slabs: lists.len(EMPTY_LIST),
            ..Default::default()
        };

        for (class, &block_size) in SIZE_CLASSES.iter().enumerate() {
            let mut class_stats = SizeClassStats {
                index: class,
                block_size,
                ..Default::default()
            };
            for bin in 0..SLAB_FULLNESS_BINS {
                for base in lists.iter(bucket(class, bin)) {
                    let shared = self.shared(base);
                    let slab = shared.lock();
                    class_stats.slabs += 1;
                    class_stats.total_blocks += slab.nblocks();
                    class_stats.free_blocks += slab.nblocks_free();
                }
            }
            if class_stats.slabs == 0 {
                continue;
            }
            class_stats.allocated_blocks = class_stats.total_blocks - class_stats.free_blocks;
            stats.total_allocated += class_stats.allocated_blocks * block_size;
            stats.size_classes.push(class_stats);
        }
        stats
    }

    fn class_for(&self, size: usize) -> Result<usize> {
        if size == 0 {
            return Err(Error::InvalidParameter("cannot allocate 0 bytes".to_string()));
        }
        let class = size_class::size_class(size).ok_or_else(|| {
            Error::InvalidParameter(format!("{} bytes exceeds the largest size class", size))
        })?;
        if max_nblocks(self.slabsize, SIZE_CLASSES[class]) == 0 {
            return Err(Error::InvalidParameter(format!(
                "a {}-byte block does not fit in a {}-byte slab",
                SIZE_CLASSES[class], self.slabsize
            )));
        }
        Ok(class)
    }

    /// Fullest listed slab of `class` that still has a free block
    fn find_slab(&self, lists: &SlabLists, class: usize) -> Option<Arc<SharedSlab>> {
        (0..SLAB_FULLNESS_BINS - 1)
            .rev()
            .find_map(|bin| lists.front(bucket(class, bin)))
            .map(|base| self.shared(base))
    }

    fn refill(&self, lists: &mut SlabLists, class: usize) -> Result<Arc<SharedSlab>> {
        if let Some(shared) = self.reuse_empty_slab(lists, class)? {
            return Ok(shared);
        }
        if let Some(parent) = &self.parent {
            if let Some(shared) = parent.hand_out_slab(class, Some(self.id))? {
                debug!("Heap {} borrowed slab {} from heap {}", self.id, shared.base(), parent.id);
                self.link_slab(lists, &shared);
                return Ok(shared);
            }
        }
        let shared = self.fresh_slab(class)?;
        self.link_slab(lists, &shared);
        Ok(shared)
    }

    /// Move the first empty slab to `class`, reformatting it if needed
    fn reuse_empty_slab(&self, lists: &mut SlabLists, class: usize) -> Result<Option<Arc<SharedSlab>>> {
        let Some(base) = lists.front(EMPTY_LIST) else {
            return Ok(None);
        };
        let shared = self.shared(base);
        {
            let mut slab = shared.lock();
            if slab.size_class() != class {
                slab.reset(self.slabsize, class)?;
            }
            lists.remove(base);
            lists.push_front(bucket(class, slab.fullness()), base);
        }
        debug!("Reused empty slab {} for size class {}", base, class);
        Ok(Some(shared))
    }

    fn fresh_slab(&self, class: usize) -> Result<Arc<SharedSlab>> {
        let extent_heap = self.extent_heap.as_ref().ok_or_else(|| {
            Error::OutOfMemory("slab heap has no extent heap to grow from".to_string())
        })?;
        let extent = extent_heap.alloc_extent(extent_heap.blocks_for(self.slabsize))?;
        let slab = match Slab::make(Arc::clone(&self.region), extent.payload(), self.slabsize, class) {
            Ok(slab) => slab,
            Err(e) => {
                extent_heap.free_extent(&extent);
                return Err(e);
            }
        };
        extent_heap.set_kind(&extent, ExtentKind::Slab);
        debug!(
            "Carved slab {} for size class {} ({} blocks)",
            extent.payload(),
            class,
            slab.nblocks()
        );
        self.arena.register_slab(slab)
    }

    fn link_slab(&self, lists: &mut SlabLists, shared: &SharedSlab) {
        let list = list_for(&shared.lock());
        lists.push_front(list, shared.base());
        shared.set_owner(Some(self.id));
    }

    fn unlink_slab(&self, lists: &mut SlabLists, shared: &SharedSlab) {
        lists.remove(shared.base());
        shared.set_owner(None);
    }

    /// Relink a slab whose occupancy changed, if it now belongs elsewhere
    fn move_slab(&self, lists: &mut SlabLists, base: RPtr, slab: &Slab) {
        let list = list_for(slab);
        if lists.list_of(base) != Some(list) {
            lists.remove(base);
            lists.push_front(list, base);
            trace!("Moved slab {} to list {}", base, list);
        }
    }

    fn alloc_block(&self, lists: &mut SlabLists, shared: &SharedSlab) -> Option<RPtr> {
        let mut slab = shared.lock();
        let ptr = slab.alloc_block()?;
        self.move_slab(lists, shared.base(), &slab);
        Some(ptr)
    }

    fn free_block(&self, lists: &mut SlabLists, shared: &SharedSlab, ptr: RPtr) -> Result<()> {
        let mut slab = shared.lock();
        if !slab.owns_block(ptr) {
            return Err(Error::InvalidAddress(ptr));
        }
        slab.free_block(ptr);
        self.move_slab(lists, shared.base(), &slab);
        Ok(())
    }

    fn locate(&self, ptr: RPtr) -> Result<Arc<SharedSlab>> {
        let found = match &self.extent_heap {
            Some(extent_heap) => {
                let extent = extent_heap.extent(ptr)?;
                if extent.is_free() || extent.kind() != ExtentKind::Slab {
                    None
                } else {
                    self.arena.slab(extent.payload())
                }
            }
            None => self.arena.slab_containing(ptr),
        };
        found.ok_or(Error::InvalidAddress(ptr))
    }

    fn shared(&self, base: RPtr) -> Arc<SharedSlab> {
        self.arena
            .slab(base)
            .unwrap_or_else(|| panic!("slab {} is listed but not registered", base))
    }
}

impl Drop for SlabHeap {
    fn drop(&mut self) {
        self.arena.heaps.write().remove(&self.id);
        let owned: Vec<RPtr> = self.lists.get_mut().slabs().collect();
        if owned.is_empty() {
            return;
        }

        match &self.parent {
            Some(parent) => {
                let mut parent_lists = parent.lists.lock();
                for base in &owned {
                    parent.link_slab(&mut parent_lists, &self.shared(*base));
                }
                debug!("Heap {} returned {} slabs to heap {}", self.id, owned.len(), parent.id);
            }
            None => {
                for base in &owned {
                    self.shared(*base).set_owner(None);
                }
            }
        }
    }
}

impl Heap for SlabHeap {
    fn malloc(&self, size: usize) -> Result<RPtr> {
        SlabHeap::malloc(self, size)
    }

    fn free(&self, ptr: RPtr) -> Result<()> {
        SlabHeap::free(self, ptr)
    }

    fn getsize(&self, ptr: RPtr) -> usize {
        SlabHeap::getsize(self, ptr)
    }
}

impl fmt::Debug for SlabHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabHeap")
            .field("id", &self.id)
            .field("slabsize", &self.slabsize)
            .field("parent", &self.parent.as_ref().map(|parent| parent.id))
            .finish_non_exhaustive()
    }
}

/// One line per populated size class, `(block_size, nblocks, nblocks_free)`
/// per slab and bin, followed by the empty list
impl fmt::Display for SlabHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lists = self.lists.lock();
        for class in 0..NUM_SIZE_CLASSES {
            if (0..SLAB_FULLNESS_BINS).all(|bin| lists.len(bucket(class, bin)) == 0) {
                continue;
            }
            write!(f, "{}:", SIZE_CLASSES[class])?;
            for bin in 0..SLAB_FULLNESS_BINS {
                write!(f, " [{}]", bin)?;
                for base in lists.iter(bucket(class, bin)) {
                    write!(f, " {}", *self.shared(base).lock())?;
                }
            }
            writeln!(f)?;
        }
        write!(f, "[R]")?;
        for base in lists.iter(EMPTY_LIST) {
            write!(f, " {}", *self.shared(base).lock())?;
        }
        writeln!(f)
    }
}
