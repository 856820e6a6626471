//! Frame Protocol
//!
//! A frame is a cooperatively maintained activation record: it is the only
//! way a native primitive tells the collector what it is holding. Each frame
//! carries three general-purpose registers (scratch roots for pinning
//! intermediates between allocations) and three pointers to `Ref` slots —
//! `dictionary`, `callstack`, `datastack` — whose storage outlives the frame
//! (usually locals of the host or slots shared down the chain).
//!
//! The frame layout is part of the C ABI: native modules build frames with a
//! designated initializer and link them before allocating.
//!
//! ```text
//! current top ──► ┌────────────┐      ┌────────────┐
//!                 │ previous ──┼────► │ previous ──┼──► null
//!                 │ registers  │      │ registers  │
//!                 │ dictionary─┼──┐   │ dictionary─┼──┐
//!                 │ callstack  │  │   │ callstack  │  │
//!                 │ datastack  │  │   │ datastack  │  │
//!                 └────────────┘  └──►└── *Ref ◄───┼──┘   (aliased slots)
//!                                      └────────────┘
//! ```
//!
//! Discipline:
//! - link before any allocation that could strand a fresh cell
//! - unlink on every return path, exceptions included
//! - after any allocating call, re-read pinned values from the registers;
//!   the collector rewrites them in place

use bowl_core::cell::Ref;
use std::cell::Cell;
use std::ptr;

/// The signature of a native primitive: receives the current frame, pops
/// its arguments from the datastack, pushes results back, and returns an
/// exception reference or null for success.
pub type NativeFn = unsafe extern "C" fn(*mut Frame) -> Ref;

/// A stack-allocated activation record providing GC roots.
///
/// The memory layout is ABI: `{previous, registers[3], dictionary,
/// callstack, datastack}`.
#[repr(C)]
pub struct Frame {
    /// The frame below this one, or null at the bottom of the chain.
    /// Maintained by [`link`]; do not write it yourself.
    pub previous: *mut Frame,
    /// Scratch roots. The collector walks and rewrites all three.
    pub registers: [Ref; 3],
    /// Slot holding the dictionary map, or null in an empty frame.
    pub dictionary: *mut Ref,
    /// Slot holding the callstack value, or null. Opaque to the core.
    pub callstack: *mut Ref,
    /// Slot holding the datastack list, or null.
    pub datastack: *mut Ref,
}

impl Frame {
    /// A frame with all slots and registers null: the bottom of a new
    /// scope. The host points the slot fields at its own storage before
    /// using the stack or dictionary.
    pub fn empty() -> Frame {
        Frame {
            previous: ptr::null_mut(),
            registers: [ptr::null_mut(); 3],
            dictionary: ptr::null_mut(),
            callstack: ptr::null_mut(),
            datastack: ptr::null_mut(),
        }
    }

    /// A frame inheriting the three slot pointers of `predecessor`, with
    /// null registers. This is the shape primitives use to add roots
    /// within the scope they were called in.
    ///
    /// # Safety
    /// `predecessor` must point to a valid frame.
    pub unsafe fn inheriting(predecessor: *mut Frame) -> Frame {
        unsafe {
            Frame {
                previous: ptr::null_mut(),
                registers: [ptr::null_mut(); 3],
                dictionary: (*predecessor).dictionary,
                callstack: (*predecessor).callstack,
                datastack: (*predecessor).datastack,
            }
        }
    }
}

// The collector finds the root set through this register, so primitives do
// not pass frames into the allocator explicitly.
thread_local! {
    static CURRENT_FRAME: Cell<*mut Frame> = const { Cell::new(ptr::null_mut()) };
}

/// The top of the frame chain for this VM thread, or null outside any
/// linked frame.
#[inline]
pub fn current_frame() -> *mut Frame {
    CURRENT_FRAME.with(|cell| cell.get())
}

/// Link `frame` as the new top of the chain. Overwrites `frame.previous`
/// with the old top so the chain the collector walks is always complete.
///
/// # Safety
/// `frame` must point to a frame that stays valid (and unmoved) until its
/// matching [`unlink`].
pub unsafe fn link(frame: *mut Frame) {
    CURRENT_FRAME.with(|cell| {
        unsafe {
            (*frame).previous = cell.get();
        }
        cell.set(frame);
    });
}

/// Unlink `frame`, restoring its predecessor as the top.
///
/// # Safety
/// `frame` must be the currently linked top.
pub unsafe fn unlink(frame: *mut Frame) {
    CURRENT_FRAME.with(|cell| {
        debug_assert!(cell.get() == frame, "unlink: frame is not the current top");
        cell.set(unsafe { (*frame).previous });
    });
}

/// Clear the chain entirely. Used by teardown.
pub(crate) fn reset_chain() {
    CURRENT_FRAME.with(|cell| cell.set(ptr::null_mut()));
}

/// Run `body` inside a linked inheriting frame whose registers start as
/// `roots`. This is the internal backbone of the register discipline: every
/// constructor pins its reference arguments through here, and `body`
/// re-reads them from the registers after each allocating call.
///
/// The frame is unlinked on both the success and the exception path.
///
/// # Safety
/// `frame` must point to a valid frame.
pub(crate) unsafe fn with_roots<T>(
    frame: *mut Frame,
    roots: [Ref; 3],
    body: impl FnOnce(*mut Frame) -> Result<T, Ref>,
) -> Result<T, Ref> {
    let mut child = unsafe { Frame::inheriting(frame) };
    child.registers = roots;
    let child = &mut child as *mut Frame;
    unsafe {
        link(child);
        let result = body(child);
        unlink(child);
        result
    }
}

// =============================================================================
// FFI
// =============================================================================

/// Link a module-constructed frame as the new top of the chain.
///
/// # Safety
/// See [`link`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_frame_link(frame: *mut Frame) {
    unsafe { link(frame) }
}

/// Unlink the current top frame.
///
/// # Safety
/// See [`unlink`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_frame_unlink(frame: *mut Frame) {
    unsafe { unlink(frame) }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_unlink_chain() {
        let mut bottom = Frame::empty();
        unsafe {
            link(&mut bottom);
            assert_eq!(current_frame(), &mut bottom as *mut Frame);

            let mut upper = Frame::inheriting(&mut bottom);
            link(&mut upper);
            assert_eq!(current_frame(), &mut upper as *mut Frame);
            assert_eq!(upper.previous, &mut bottom as *mut Frame);

            unlink(&mut upper);
            assert_eq!(current_frame(), &mut bottom as *mut Frame);
            unlink(&mut bottom);
            assert!(current_frame().is_null());
        }
    }

    #[test]
    fn test_inheriting_copies_slots() {
        let mut dictionary: Ref = ptr::null_mut();
        let mut datastack: Ref = ptr::null_mut();

        let mut bottom = Frame::empty();
        bottom.dictionary = &mut dictionary;
        bottom.datastack = &mut datastack;

        unsafe {
            let child = Frame::inheriting(&mut bottom);
            assert_eq!(child.dictionary, &mut dictionary as *mut Ref);
            assert_eq!(child.datastack, &mut datastack as *mut Ref);
            assert!(child.callstack.is_null());
            assert!(child.registers.iter().all(|register| register.is_null()));
        }
    }

    #[test]
    fn test_with_roots_unlinks_on_error() {
        let mut bottom = Frame::empty();
        unsafe {
            link(&mut bottom);
            let failure: Result<(), Ref> = with_roots(&mut bottom, [ptr::null_mut(); 3], |_| {
                Err(ptr::null_mut())
            });
            assert!(failure.is_err());
            assert_eq!(current_frame(), &mut bottom as *mut Frame);
            unlink(&mut bottom);
        }
    }

    #[test]
    fn test_empty_frame_layout() {
        // The frame layout is ABI: previous at 0, registers at 8..32,
        // then the three slot pointers.
        use std::mem::{offset_of, size_of};
        assert_eq!(offset_of!(Frame, previous), 0);
        assert_eq!(offset_of!(Frame, registers), 8);
        assert_eq!(offset_of!(Frame, dictionary), 32);
        assert_eq!(offset_of!(Frame, callstack), 40);
        assert_eq!(offset_of!(Frame, datastack), 48);
        assert_eq!(size_of::<Frame>(), 56);
    }
}
