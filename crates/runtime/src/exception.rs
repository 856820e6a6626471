//! Exception Path
//!
//! Bowl does not unwind: every fallible operation returns a tagged result,
//! and primitives propagate exceptions by returning the exception reference
//! after unlinking their frame. Inside the runtime that discipline is the
//! plain `Result<Ref, Ref>` so `?` does the propagation; at the C ABI it is
//! the `#[repr(C)]` [`BowlResult`].
//!
//! Three cells are preallocated outside the heap at setup and never
//! collected:
//!
//! - `sentinel_value` — the unique "absent" marker `map_get_or_else`
//!   callers compare by pointer identity
//! - `exception_out_of_heap` — returned when the allocator failed even
//!   after a collection; building a fresh exception would itself allocate
//! - `exception_finalization_failure` — returned when a library's
//!   finalizer failed or its handle could not be closed

use crate::frame::{Frame, with_roots};
use crate::gc;
use crate::value;
use bowl_core::cell::{self, KIND_EXCEPTION, KIND_STRING, KIND_SYMBOL, Ref, kind_name};
use std::cell::Cell;
use std::fmt;
use std::ptr;

// =============================================================================
// Tagged result
// =============================================================================

/// The ABI form of a fallible operation: `failure` selects whether `value`
/// is the result or the exception.
#[repr(C)]
pub struct BowlResult {
    pub failure: bool,
    pub value: Ref,
}

impl BowlResult {
    pub fn ok(value: Ref) -> BowlResult {
        BowlResult {
            failure: false,
            value,
        }
    }

    pub fn throw(exception: Ref) -> BowlResult {
        BowlResult {
            failure: true,
            value: exception,
        }
    }
}

impl From<Result<Ref, Ref>> for BowlResult {
    fn from(result: Result<Ref, Ref>) -> BowlResult {
        match result {
            Ok(value) => BowlResult::ok(value),
            Err(exception) => BowlResult::throw(exception),
        }
    }
}

// =============================================================================
// Singletons
// =============================================================================

#[derive(Clone, Copy)]
struct Singletons {
    sentinel: Ref,
    out_of_heap: Ref,
    finalization_failure: Ref,
}

thread_local! {
    static SINGLETONS: Cell<Option<Singletons>> = const { Cell::new(None) };
}

/// Build the permanent cells. Called once from setup, before any heap
/// allocation can fail.
pub(crate) fn install_singletons() {
    let sentinel = permanent_text(KIND_SYMBOL, "sentinel");
    let out_of_heap = permanent_exception("out of heap");
    let finalization_failure = permanent_exception("finalization failure");
    SINGLETONS.with(|cell| {
        assert!(cell.get().is_none(), "singletons already installed");
        cell.set(Some(Singletons {
            sentinel,
            out_of_heap,
            finalization_failure,
        }));
    });
}

pub(crate) fn uninstall_singletons() {
    SINGLETONS.with(|cell| cell.set(None));
}

fn permanent_text(kind: u64, text: &str) -> Ref {
    let value = gc::allocate_permanent(kind, text.len());
    unsafe { cell::text_init(value, text.as_bytes()) };
    value
}

fn permanent_exception(message: &str) -> Ref {
    let text = permanent_text(KIND_STRING, message);
    let exception = gc::allocate_permanent(KIND_EXCEPTION, 0);
    unsafe {
        let cell = exception as *mut cell::ExceptionCell;
        (*cell).cause = ptr::null_mut();
        (*cell).message = text;
    }
    exception
}

fn singletons() -> Singletons {
    SINGLETONS.with(|cell| cell.get().expect("runtime not initialized on this thread"))
}

/// The unique "absent" marker. Compare by pointer, never by `equals`.
pub fn sentinel_value() -> Ref {
    singletons().sentinel
}

/// The preallocated out-of-heap exception.
pub fn out_of_heap() -> Ref {
    singletons().out_of_heap
}

/// The preallocated finalization-failure exception.
pub fn finalization_failure() -> Ref {
    singletons().finalization_failure
}

// =============================================================================
// Constructors
// =============================================================================

/// Build an exception with a formatted string message and no cause.
///
/// If the heap cannot even hold the message, the out-of-heap singleton is
/// returned instead — the caller always gets something throwable.
///
/// # Safety
/// `frame` must point to a valid linked frame.
pub unsafe fn format_exception(frame: *mut Frame, message: fmt::Arguments<'_>) -> Ref {
    let text = fmt::format(message);
    unsafe {
        match value::string(&text) {
            Ok(text) => match value::exception(frame, ptr::null_mut(), text) {
                Ok(exception) => exception,
                Err(exception) => exception,
            },
            Err(exception) => exception,
        }
    }
}

/// Re-raise `cause` under a new formatted message; the fresh exception's
/// `cause` points at the prior one, forming the chain the host prints.
///
/// # Safety
/// `frame` must point to a valid linked frame; `cause` must be an
/// exception cell.
pub unsafe fn rethrow(frame: *mut Frame, cause: Ref, message: fmt::Arguments<'_>) -> Ref {
    let text = fmt::format(message);
    unsafe {
        let chained = with_roots(frame, [cause, ptr::null_mut(), ptr::null_mut()], |child| {
            let text = value::string(&text)?;
            value::exception(child, (*child).registers[0], text)
        });
        match chained {
            Ok(exception) => exception,
            Err(exception) => exception,
        }
    }
}

/// A type-mismatch exception naming the operation, the expected kind,
/// and the kind actually found.
///
/// # Safety
/// `frame` must point to a valid linked frame.
pub unsafe fn type_mismatch(frame: *mut Frame, operation: &str, expected: u64, found: Ref) -> Ref {
    // Read the kind before formatting; building the message may move the
    // value. A null reference is the empty list.
    let found = if found.is_null() {
        "list"
    } else {
        kind_name(unsafe { (*found).kind })
    };
    unsafe {
        format_exception(
            frame,
            format_args!(
                "{}: expected a {}, found a {}",
                operation,
                kind_name(expected),
                found
            ),
        )
    }
}

/// A stack-underflow exception naming the operation that popped.
///
/// # Safety
/// `frame` must point to a valid linked frame.
pub unsafe fn underflow(frame: *mut Frame, operation: &str) -> Ref {
    unsafe { format_exception(frame, format_args!("{}: the datastack is empty", operation)) }
}

// =============================================================================
// FFI
// =============================================================================

/// The unique "absent" marker cell.
#[unsafe(no_mangle)]
pub extern "C" fn bowl_sentinel_value() -> Ref {
    sentinel_value()
}

/// The preallocated out-of-heap exception.
#[unsafe(no_mangle)]
pub extern "C" fn bowl_exception_out_of_heap() -> Ref {
    out_of_heap()
}

/// The preallocated finalization-failure exception.
#[unsafe(no_mangle)]
pub extern "C" fn bowl_exception_finalization_failure() -> Ref {
    finalization_failure()
}

// =============================================================================
// Tests
// =============================================================================
