//! Cross-thread heap statistics registry
//!
//! A Bowl heap is thread-local (one VM per thread), but hosts want to watch
//! all of them from a diagnostics thread. Each VM claims a slot once and
//! updates it with plain atomic stores; readers only iterate during
//! diagnostics.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                HeapStatsRegistry (global)               │
//! ├─────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐  ┌──────────────────┐             │
//! │  │ Slot 0 (VM A)    │  │ Slot 1 (VM B)    │  ...        │
//! │  │ thread_id        │  │ thread_id        │             │
//! │  │ heap_bytes       │  │ heap_bytes       │             │
//! │  │ live_bytes       │  │ live_bytes       │             │
//! │  │ collections      │  │ collections      │             │
//! │  └──────────────────┘  └──────────────────┘             │
//! └─────────────────────────────────────────────────────────┘
//! ```

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of VM threads we can track.
const MAX_THREADS: usize = 64;

/// Statistics for a single VM's heap.
#[derive(Debug)]
pub struct HeapSlot {
    /// Thread ID (0 = slot is free)
    pub thread_id: AtomicU64,
    /// Bytes currently allocated in from-space
    pub heap_bytes: AtomicU64,
    /// Bytes that survived the most recent collection
    pub live_bytes: AtomicU64,
    /// Peak surviving bytes (high-water mark)
    pub peak_live_bytes: AtomicU64,
    /// Number of completed collections
    pub collections: AtomicU64,
}

impl HeapSlot {
    const fn new() -> Self {
        Self {
            thread_id: AtomicU64::new(0),
            heap_bytes: AtomicU64::new(0),
            live_bytes: AtomicU64::new(0),
            peak_live_bytes: AtomicU64::new(0),
            collections: AtomicU64::new(0),
        }
    }
}

/// Global registry of per-VM heap statistics.
pub struct HeapStatsRegistry {
    slots: Box<[HeapSlot]>,
    /// Count of VMs that couldn't get a slot
    pub overflow_count: AtomicU64,
}

impl HeapStatsRegistry {
    fn new(capacity: usize) -> Self {
        let slots: Vec<HeapSlot> = (0..capacity).map(|_| HeapSlot::new()).collect();
        Self {
            slots: slots.into_boxed_slice(),
            overflow_count: AtomicU64::new(0),
        }
    }

    /// Register the current thread's VM and get its slot index.
    ///
    /// Returns Some(index) if a slot was claimed, None if the registry is
    /// full.
    pub fn register(&self) -> Option<usize> {
        let thread_id = current_thread_id();

        for (idx, slot) in self.slots.iter().enumerate() {
            if slot
                .thread_id
                .compare_exchange(0, thread_id, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(idx);
            }
        }

        self.overflow_count.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Record the current from-space occupancy for a slot.
    #[inline]
    pub fn update_heap(&self, slot_idx: usize, heap_bytes: usize) {
        if let Some(slot) = self.slots.get(slot_idx) {
            slot.heap_bytes.store(heap_bytes as u64, Ordering::Relaxed);
        }
    }

    /// Record the outcome of a completed collection for a slot.
    #[inline]
    pub fn update_collection(&self, slot_idx: usize, live_bytes: usize) {
        if let Some(slot) = self.slots.get(slot_idx) {
            let live = live_bytes as u64;
            slot.live_bytes.store(live, Ordering::Relaxed);
            slot.collections.fetch_add(1, Ordering::Relaxed);

            // Update peak via CAS loop
            let mut peak = slot.peak_live_bytes.load(Ordering::Relaxed);
            while live > peak {
                match slot.peak_live_bytes.compare_exchange_weak(
                    peak,
                    live,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(current) => peak = current,
                }
            }
        }
    }

    /// Aggregate statistics across all registered VMs.
    pub fn aggregate_stats(&self) -> AggregateHeapStats {
        let mut total_heap_bytes: u64 = 0;
        let mut total_live_bytes: u64 = 0;
        let mut total_collections: u64 = 0;
        let mut active_vms: usize = 0;

        for slot in self.slots.iter() {
            let thread_id = slot.thread_id.load(Ordering::Acquire);
            if thread_id > 0 {
                active_vms += 1;
                total_heap_bytes += slot.heap_bytes.load(Ordering::Relaxed);
                total_live_bytes += slot.live_bytes.load(Ordering::Relaxed);
                total_collections += slot.collections.load(Ordering::Relaxed);
            }
        }

        AggregateHeapStats {
            active_vms,
            total_heap_bytes,
            total_live_bytes,
            total_collections,
            overflow_count: self.overflow_count.load(Ordering::Relaxed),
        }
    }

    /// Registry capacity.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Aggregated heap statistics across all VM threads.
#[derive(Debug, Clone, Copy)]
pub struct AggregateHeapStats {
    pub active_vms: usize,
    pub total_heap_bytes: u64,
    pub total_live_bytes: u64,
    pub total_collections: u64,
    pub overflow_count: u64,
}

/// Global counter for generating unique thread IDs.
/// Starts at 1 because 0 means "empty slot".
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THIS_THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

fn current_thread_id() -> u64 {
    THIS_THREAD_ID.with(|&id| id)
}

static HEAP_REGISTRY: OnceLock<HeapStatsRegistry> = OnceLock::new();

/// Get the global heap stats registry.
pub fn heap_registry() -> &'static HeapStatsRegistry {
    HEAP_REGISTRY.get_or_init(|| HeapStatsRegistry::new(MAX_THREADS))
}

thread_local! {
    static SLOT_INDEX: std::cell::Cell<Option<usize>> = const { std::cell::Cell::new(None) };
}

/// Get or register the current thread's slot index.
pub fn get_or_register_slot() -> Option<usize> {
    SLOT_INDEX.with(|cell| {
        if let Some(idx) = cell.get() {
            Some(idx)
        } else {
            let idx = heap_registry().register();
            cell.set(idx);
            idx
        }
    })
}

/// Record the current heap occupancy for this thread's VM.
#[inline]
pub fn update_heap_stats(heap_bytes: usize) {
    if let Some(idx) = SLOT_INDEX.with(|cell| cell.get()) {
        heap_registry().update_heap(idx, heap_bytes);
    }
}

/// Record a completed collection for this thread's VM.
#[inline]
pub fn update_collection_stats(live_bytes: usize) {
    if let Some(idx) = SLOT_INDEX.with(|cell| cell.get()) {
        heap_registry().update_collection(idx, live_bytes);
    }
}
