//! Allocator and Relocating Collector
//!
//! A classic Cheney two-space copying collector over the `bowl-core` arena.
//! Allocation bumps a pointer in from-space; on overflow the collector
//! copies every cell reachable from the frame chain into to-space, rewrites
//! the references it followed, finalizes native libraries that did not
//! survive, and the spaces flip. The allocation is then retried exactly
//! once; a second failure yields the preallocated out-of-heap exception
//! without allocating.
//!
//! ```text
//!   forward(root):                       scan loop:
//!   ┌───────────┐   copy    ┌─────────┐
//!   │from-space │ ────────► │to-space │   scan ──►──┐
//!   │  cell     │           │  cell   │             │ forward every ref
//!   │ location ─┼─────────► │         │   free ──►──┘ field, bump free
//!   └───────────┘           └─────────┘
//! ```
//!
//! Every allocator entry point is a GC safepoint: between two allocator
//! calls raw references are stable, during one they are not. The register
//! discipline in [`crate::frame`] is what keeps intermediates alive.
//!
//! Cells outside both spaces — the permanent singletons and static cells in
//! module data sections — are never moved, scanned, or reclaimed.

use crate::exception;
use crate::frame::{self, Frame};
use crate::loader;
use bowl_core::cell::{
    self, CELL_ALIGN, ExceptionCell, FunctionCell, KIND_EXCEPTION, KIND_FUNCTION, KIND_LIST,
    KIND_MAP, KIND_VECTOR, ListCell, Ref, align_size, byte_size, fixed_size,
};
use bowl_core::heap::Heap;
use bowl_core::stats;
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::{Cell, RefCell};
use std::ptr;

thread_local! {
    // The VM heap for this thread. None outside setup/teardown.
    static HEAP: RefCell<Option<Heap>> = const { RefCell::new(None) };

    // Cells allocated outside the spaces, freed at teardown.
    static PERMANENT: RefCell<Vec<(Ref, usize)>> = const { RefCell::new(Vec::new()) };

    static COLLECTIONS: Cell<u64> = const { Cell::new(0) };
}

fn with_heap<T>(body: impl FnOnce(&mut Heap) -> T) -> T {
    HEAP.with(|slot| {
        let mut borrow = slot.borrow_mut();
        let heap = borrow.as_mut().expect("heap access before setup");
        body(heap)
    })
}

pub(crate) fn install_heap(capacity: usize) {
    HEAP.with(|slot| {
        let mut borrow = slot.borrow_mut();
        assert!(borrow.is_none(), "heap already installed on this thread");
        *borrow = Some(Heap::new(capacity));
    });
    stats::get_or_register_slot();
    COLLECTIONS.with(|count| count.set(0));
}

pub(crate) fn uninstall_heap() {
    HEAP.with(|slot| {
        *slot.borrow_mut() = None;
    });
    free_permanent_cells();
}

// =============================================================================
// Allocation
// =============================================================================

/// Allocate a cell of `kind` with `additional` trailing payload bytes.
///
/// The returned cell has its header initialized (`location` null, `hash`
/// zero meaning uncomputed); the variant fields are the caller's to fill
/// **before the next allocation**, because any allocation may move the cell
/// and visit its fields.
///
/// On overflow the collector runs and the request is retried once; a second
/// failure returns the out-of-heap singleton as the exception.
///
/// # Safety
/// The runtime must be set up on this thread and a frame must be linked so
/// the collector can find its roots.
pub unsafe fn allocate(kind: u64, additional: usize) -> Result<Ref, Ref> {
    let size = fixed_size(kind) + additional;
    if !with_heap(|heap| heap.fits(size)) {
        unsafe { collect()? };
        if !with_heap(|heap| heap.fits(size)) {
            return Err(exception::out_of_heap());
        }
    }
    let value = with_heap(|heap| unsafe { heap.bump(size) }) as Ref;
    unsafe {
        (*value).kind = kind;
        (*value).location = ptr::null_mut();
        (*value).hash = 0;
    }
    stats::update_heap_stats(with_heap(|heap| heap.used()));
    Ok(value)
}

/// Allocate a cell outside the collected spaces. Used for the singletons;
/// such cells are never moved or reclaimed and are freed only at teardown.
pub(crate) fn allocate_permanent(kind: u64, additional: usize) -> Ref {
    let size = fixed_size(kind) + additional;
    let layout = Layout::from_size_align(size, CELL_ALIGN).expect("cell layout overflow");
    let value = unsafe { alloc_zeroed(layout) } as Ref;
    if value.is_null() {
        panic!("failed to allocate permanent cell of {} bytes", size);
    }
    unsafe {
        (*value).kind = kind;
    }
    PERMANENT.with(|cells| cells.borrow_mut().push((value, size)));
    value
}

fn free_permanent_cells() {
    PERMANENT.with(|cells| {
        for (value, size) in cells.borrow_mut().drain(..) {
            let layout = Layout::from_size_align(size, CELL_ALIGN).expect("cell layout overflow");
            unsafe { dealloc(value as *mut u8, layout) };
        }
    });
}

// =============================================================================
// Collection
// =============================================================================

/// Run a full collection: copy the live cells into to-space, finalize
/// libraries that became unreachable, flip the spaces, and double them if
/// occupancy stayed above the high-water mark (3/4).
///
/// Returns the finalization-failure singleton if a library's
/// `bowl_module_finalize` reported an exception or its handle could not be
/// closed; the heap itself is consistent either way.
///
/// # Safety
/// The runtime must be set up on this thread; every live reference must be
/// reachable from the linked frame chain. Finalizers run inside the
/// collector and must not allocate.
pub unsafe fn collect() -> Result<(), Ref> {
    HEAP.with(|slot| {
        let mut borrow = slot.borrow_mut();
        let heap = borrow.as_mut().expect("collect: runtime not initialized");
        let before = heap.used();

        let mut survivors = unsafe { copy_cycle(heap) };
        let mut finalization = unsafe { loader::sweep_libraries(heap) };
        heap.flip(survivors);

        // Growth policy: occupancy above 3/4 after a collection doubles
        // both spaces before the next allocation. The live set was just
        // compacted, so the extra copy cycles are cheap.
        while survivors * 4 > heap.capacity() * 3 {
            heap.replace_to(heap.capacity() * 2);
            survivors = unsafe { copy_cycle(heap) };
            let sweep = unsafe { loader::sweep_libraries(heap) };
            if finalization.is_ok() {
                finalization = sweep;
            }
            heap.flip(survivors);
        }
        if heap.to.capacity != heap.capacity() {
            heap.replace_to(heap.capacity());
        }

        COLLECTIONS.with(|count| count.set(count.get() + 1));
        stats::update_collection_stats(survivors);
        stats::update_heap_stats(survivors);
        tracing::debug!(
            before,
            after = survivors,
            capacity = heap.capacity(),
            "collection finished"
        );
        finalization
    })
}

/// Copy every cell reachable from the frame chain into to-space. Returns
/// the number of bytes the survivors occupy.
unsafe fn copy_cycle(heap: &Heap) -> usize {
    let mut free = 0usize;

    unsafe {
        // Roots: the chain of frames, each contributing its registers and
        // the three aliased slots. Aliased slots are shared between frames;
        // forwarding is idempotent so visiting one twice is harmless.
        let mut current = frame::current_frame();
        while !current.is_null() {
            for index in 0..3 {
                forward(heap, &mut (*current).registers[index], &mut free);
            }
            for slot in [
                (*current).dictionary,
                (*current).callstack,
                (*current).datastack,
            ] {
                if !slot.is_null() {
                    forward(heap, slot, &mut free);
                }
            }
            current = (*current).previous;
        }

        // Scan: forward the reference fields of every copied cell until the
        // scan pointer catches up with the allocation pointer.
        let mut scan = 0usize;
        while scan < free {
            let value = heap.to.base.add(scan) as Ref;
            match (*value).kind {
                KIND_LIST => {
                    let list = value as *mut ListCell;
                    forward(heap, &mut (*list).head, &mut free);
                    forward(heap, &mut (*list).tail, &mut free);
                }
                KIND_MAP => {
                    for bucket in cell::map_buckets_mut(value) {
                        forward(heap, bucket, &mut free);
                    }
                }
                KIND_VECTOR => {
                    for element in cell::vector_elements_mut(value) {
                        forward(heap, element, &mut free);
                    }
                }
                KIND_FUNCTION => {
                    forward(heap, &mut (*(value as *mut FunctionCell)).library, &mut free);
                }
                KIND_EXCEPTION => {
                    let exception = value as *mut ExceptionCell;
                    forward(heap, &mut (*exception).cause, &mut free);
                    forward(heap, &mut (*exception).message, &mut free);
                }
                // Symbols, strings, numbers, booleans, and libraries carry
                // no references.
                _ => {}
            }
            scan += align_size(byte_size(value));
        }
    }

    free
}

/// Forward one root or field slot. Copies the referenced cell on first
/// visit, records the new address in the old cell's `location`, and
/// rewrites the slot. Null slots and cells outside from-space (already
/// copied, permanent, or static) are left alone.
unsafe fn forward(heap: &Heap, slot: *mut Ref, free: &mut usize) {
    unsafe {
        let value = *slot;
        if value.is_null() || !heap.from_contains(value) {
            return;
        }

        let location = (*value).location;
        if !location.is_null() && heap.to_contains(location) {
            *slot = location;
            return;
        }

        let size = byte_size(value);
        let target = heap.to.base.add(*free);
        ptr::copy_nonoverlapping(value as *const u8, target, size);
        *free += align_size(size);

        let moved = target as Ref;
        (*moved).location = moved;
        (*value).location = moved;
        *slot = moved;
    }
}

// =============================================================================
// Introspection
// =============================================================================

/// Bytes currently allocated in from-space.
pub fn heap_used() -> usize {
    with_heap(|heap| heap.used())
}

/// Capacity of each space in bytes.
pub fn heap_capacity() -> usize {
    with_heap(|heap| heap.capacity())
}

/// Number of collections completed since setup.
pub fn collection_count() -> u64 {
    COLLECTIONS.with(|count| count.get())
}

// =============================================================================
// FFI
// =============================================================================

/// Allocate a cell of `kind` with `additional` trailing bytes.
///
/// # Safety
/// See [`allocate`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_allocate(
    _frame: *mut Frame,
    kind: u64,
    additional: usize,
) -> exception::BowlResult {
    unsafe { allocate(kind, additional).into() }
}

/// Force a collection. Returns null on success or the finalization-failure
/// exception.
///
/// # Safety
/// See [`collect`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_collect_garbage(_frame: *mut Frame) -> Ref {
    match unsafe { collect() } {
        Ok(()) => ptr::null_mut(),
        Err(exception) => exception,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::with_vm;
    use crate::{list_ops, value};
    use bowl_core::cell::KIND_NUMBER;
    use bowl_core::heap::MIN_HEAP_CAPACITY;

    #[test]
    fn test_allocate_zero_fills_header() {
        with_vm(MIN_HEAP_CAPACITY, |_frame| unsafe {
            let value = allocate(KIND_NUMBER, 0).unwrap();
            assert_eq!((*value).kind, KIND_NUMBER);
            assert!((*value).location.is_null());
            assert_eq!((*value).hash, 0);
        });
    }

    #[test]
    fn test_collect_preserves_rooted_list() {
        with_vm(MIN_HEAP_CAPACITY, |frame| unsafe {
            let element = value::number(1.0).unwrap();
            let rooted = value::list(frame, element, ptr::null_mut()).unwrap();
            (*frame).registers[0] = rooted;

            let used_before = heap_used();
            collect().unwrap();
            let survivor = (*frame).registers[0];

            assert_eq!((*survivor).kind, KIND_LIST);
            let head = (*(survivor as *mut ListCell)).head;
            assert_eq!(value::number_value(head), 1.0);
            assert_eq!(heap_used(), used_before);
        });
    }

    #[test]
    fn test_collect_reclaims_garbage() {
        with_vm(MIN_HEAP_CAPACITY, |_frame| unsafe {
            for _ in 0..16 {
                let _ = value::number(3.5).unwrap();
            }
            assert!(heap_used() > 0);
            collect().unwrap();
            assert_eq!(heap_used(), 0);
        });
    }

    #[test]
    fn test_overflow_triggers_collection_and_retry() {
        with_vm(MIN_HEAP_CAPACITY, |_frame| unsafe {
            // Fill the heap with garbage; the allocator must collect and
            // succeed rather than fail on first overflow.
            let mut allocated = 0usize;
            while allocated < MIN_HEAP_CAPACITY * 3 {
                let value = value::number(allocated as f64).unwrap();
                allocated += bowl_core::cell::align_size(byte_size(value));
            }
            assert!(collection_count() >= 1);
        });
    }

    #[test]
    fn test_out_of_heap_when_live_set_fills_heap() {
        with_vm(MIN_HEAP_CAPACITY, |_frame| unsafe {
            // A single allocation larger than the space cannot succeed no
            // matter how often we collect. Growth only doubles when the
            // *live* set crosses the high-water mark, so an empty heap
            // rejects it with the out-of-heap singleton.
            let result = allocate(bowl_core::cell::KIND_STRING, MIN_HEAP_CAPACITY * 2);
            let exception = result.unwrap_err();
            assert_eq!(exception, exception::out_of_heap());
        });
    }

    #[test]
    fn test_heap_grows_when_occupancy_stays_high() {
        with_vm(MIN_HEAP_CAPACITY, |frame| unsafe {
            let initial = heap_capacity();
            // Keep everything reachable through the datastack while
            // allocating past the high-water mark.
            let mut pushed = 0usize;
            while pushed < MIN_HEAP_CAPACITY {
                let value = value::number(pushed as f64).unwrap();
                crate::stack_ops::push(frame, value).unwrap();
                pushed += 64;
            }
            assert!(heap_capacity() > initial);
            // Everything is still there, in order.
            let depth = list_ops::length(*(*frame).datastack);
            assert_eq!(depth, pushed / 64);
        });
    }

    #[test]
    fn test_permanent_cells_survive_collection_unmoved() {
        with_vm(MIN_HEAP_CAPACITY, |frame| unsafe {
            let sentinel = exception::sentinel_value();
            (*frame).registers[0] = sentinel;
            collect().unwrap();
            assert_eq!((*frame).registers[0], sentinel);
        });
    }

    #[test]
    fn test_second_collection_moves_nothing() {
        with_vm(MIN_HEAP_CAPACITY, |frame| unsafe {
            let one = value::number(1.0).unwrap();
            crate::stack_ops::push(frame, one).unwrap();
            collect().unwrap();

            let first = *(*frame).datastack;
            let first_offset = first as usize - with_heap(|heap| heap.from.base as usize);
            collect().unwrap();
            let second = *(*frame).datastack;
            let second_offset = second as usize - with_heap(|heap| heap.from.base as usize);
            assert_eq!(first_offset, second_offset);
        });
    }
}
