//! Persistent List Operations
//!
//! Lists are immutable singly linked cells; the empty list is the null
//! reference and no zero-length cell ever exists, so `reverse(null)` and
//! `clone(null)` are null without allocating. Structural sharing is the
//! point: consing onto a list shares the whole tail.

use crate::exception::BowlResult;
use crate::frame::{Frame, with_roots};
use crate::value;
use bowl_core::cell::{KIND_LIST, ListCell, Ref};
use std::ptr;

/// Number of elements in `list` (null is the empty list).
///
/// # Safety
/// `list` must be an initialized list cell or null.
pub unsafe fn length(list: Ref) -> usize {
    if list.is_null() {
        0
    } else {
        unsafe {
            debug_assert!((*list).kind == KIND_LIST);
            (*(list as *mut ListCell)).length as usize
        }
    }
}

/// The first element of a non-empty list.
///
/// # Safety
/// `list` must be an initialized, non-null list cell.
pub unsafe fn head(list: Ref) -> Ref {
    unsafe {
        debug_assert!((*list).kind == KIND_LIST);
        (*(list as *mut ListCell)).head
    }
}

/// Everything after the first element; null once the list is exhausted.
///
/// # Safety
/// `list` must be an initialized, non-null list cell.
pub unsafe fn tail(list: Ref) -> Ref {
    unsafe {
        debug_assert!((*list).kind == KIND_LIST);
        (*(list as *mut ListCell)).tail
    }
}

/// Reverse a list, allocating one fresh cell per element. Elements are
/// shared, the spine is new.
///
/// # Safety
/// `frame` must be a valid linked frame; `list` an initialized list cell
/// or null.
pub unsafe fn reverse(frame: *mut Frame, list: Ref) -> Result<Ref, Ref> {
    unsafe {
        with_roots(frame, [list, ptr::null_mut(), ptr::null_mut()], |child| {
            // registers: 0 = cursor into the original, 1 = reversed result
            loop {
                let cursor = (*child).registers[0];
                if cursor.is_null() {
                    break;
                }
                let element = (*(cursor as *mut ListCell)).head;
                let reversed = value::list(child, element, (*child).registers[1])?;
                (*child).registers[1] = reversed;
                let cursor = (*child).registers[0];
                (*child).registers[0] = (*(cursor as *mut ListCell)).tail;
            }
            Ok((*child).registers[1])
        })
    }
}

// =============================================================================
// FFI
// =============================================================================

/// Reverse a list.
///
/// # Safety
/// See [`reverse`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_list_reverse(frame: *mut Frame, list: Ref) -> BowlResult {
    unsafe { reverse(frame, list).into() }
}

// =============================================================================
// Tests
// =============================================================================
