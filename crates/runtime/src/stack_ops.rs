//! Datastack Operations
//!
//! The datastack is a persistent list hanging off the frame's `datastack`
//! slot. Primitives pop their arguments, push their results, and the slot
//! itself is a GC root, so a push is one list cell and a pop is two field
//! reads.
//!
//! The typed pops carry the calling operation's name: a pop from an empty
//! stack or of the wrong kind raises an exception naming the
//! operation, the expected kind, and the kind found.

use crate::exception::{self, BowlResult};
use crate::frame::Frame;
use crate::value;
use bowl_core::cell::{
    KIND_BOOLEAN, KIND_FUNCTION, KIND_LIST, KIND_MAP, KIND_NUMBER, KIND_STRING, KIND_SYMBOL,
    ListCell, Ref,
};

/// Push `value` onto the frame's datastack.
///
/// # Safety
/// `frame` must be a valid linked frame with a non-null datastack slot.
pub unsafe fn push(frame: *mut Frame, value: Ref) -> Result<(), Ref> {
    unsafe {
        let slot = (*frame).datastack;
        debug_assert!(!slot.is_null(), "push: frame has no datastack slot");
        // The slot is a root: if the constructor collects, both *slot and
        // the fresh cell's tail are rewritten to the same survivor.
        let cell = value::list(frame, value, *slot)?;
        *slot = cell;
        Ok(())
    }
}

/// Pop the top of the datastack, raising a stack-underflow exception
/// naming `operation` when it is empty.
///
/// # Safety
/// `frame` must be a valid linked frame with a non-null datastack slot.
pub unsafe fn pop(frame: *mut Frame, operation: &str) -> Result<Ref, Ref> {
    unsafe {
        let slot = (*frame).datastack;
        debug_assert!(!slot.is_null(), "pop: frame has no datastack slot");
        let top = *slot;
        if top.is_null() {
            return Err(exception::underflow(frame, operation));
        }
        let cell = top as *mut ListCell;
        let value = (*cell).head;
        *slot = (*cell).tail;
        Ok(value)
    }
}

/// The top of the datastack without removing it.
///
/// # Safety
/// `frame` must be a valid linked frame with a non-null datastack slot.
pub unsafe fn peek(frame: *mut Frame, operation: &str) -> Result<Ref, Ref> {
    unsafe {
        let slot = (*frame).datastack;
        debug_assert!(!slot.is_null(), "peek: frame has no datastack slot");
        let top = *slot;
        if top.is_null() {
            return Err(exception::underflow(frame, operation));
        }
        Ok((*(top as *mut ListCell)).head)
    }
}

/// Number of values on the datastack.
///
/// # Safety
/// `frame` must be a valid frame with a non-null datastack slot.
pub unsafe fn depth(frame: *mut Frame) -> usize {
    unsafe { crate::list_ops::length(*(*frame).datastack) }
}

// Pop and type-check in one step. The kind is read before the exception is
// built: formatting allocates and may move the value.
unsafe fn pop_kind(frame: *mut Frame, operation: &str, expected: u64) -> Result<Ref, Ref> {
    unsafe {
        let value = pop(frame, operation)?;
        let matches = if value.is_null() {
            // Only the empty list is null.
            expected == KIND_LIST
        } else {
            (*value).kind == expected
        };
        if !matches {
            return Err(exception::type_mismatch(frame, operation, expected, value));
        }
        Ok(value)
    }
}

/// Pop a number, unwrapped to `f64`.
///
/// # Safety
/// `frame` must be a valid linked frame with a non-null datastack slot.
pub unsafe fn pop_number(frame: *mut Frame, operation: &str) -> Result<f64, Ref> {
    unsafe { Ok(value::number_value(pop_kind(frame, operation, KIND_NUMBER)?)) }
}

/// Pop a boolean, unwrapped to `bool`.
///
/// # Safety
/// `frame` must be a valid linked frame with a non-null datastack slot.
pub unsafe fn pop_boolean(frame: *mut Frame, operation: &str) -> Result<bool, Ref> {
    unsafe { Ok(value::boolean_value(pop_kind(frame, operation, KIND_BOOLEAN)?)) }
}

/// Pop a string cell.
///
/// # Safety
/// `frame` must be a valid linked frame with a non-null datastack slot.
pub unsafe fn pop_string(frame: *mut Frame, operation: &str) -> Result<Ref, Ref> {
    unsafe { pop_kind(frame, operation, KIND_STRING) }
}

/// Pop a symbol cell.
///
/// # Safety
/// `frame` must be a valid linked frame with a non-null datastack slot.
pub unsafe fn pop_symbol(frame: *mut Frame, operation: &str) -> Result<Ref, Ref> {
    unsafe { pop_kind(frame, operation, KIND_SYMBOL) }
}

/// Pop a list (possibly the empty list, i.e. null).
///
/// # Safety
/// `frame` must be a valid linked frame with a non-null datastack slot.
pub unsafe fn pop_list(frame: *mut Frame, operation: &str) -> Result<Ref, Ref> {
    unsafe { pop_kind(frame, operation, KIND_LIST) }
}

/// Pop a map cell.
///
/// # Safety
/// `frame` must be a valid linked frame with a non-null datastack slot.
pub unsafe fn pop_map(frame: *mut Frame, operation: &str) -> Result<Ref, Ref> {
    unsafe { pop_kind(frame, operation, KIND_MAP) }
}

/// Pop a function cell.
///
/// # Safety
/// `frame` must be a valid linked frame with a non-null datastack slot.
pub unsafe fn pop_function(frame: *mut Frame, operation: &str) -> Result<Ref, Ref> {
    unsafe { pop_kind(frame, operation, KIND_FUNCTION) }
}

// =============================================================================
// FFI
// =============================================================================

/// Push a value onto the datastack. Returns null or an exception.
///
/// # Safety
/// See [`push`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_stack_push(frame: *mut Frame, value: Ref) -> Ref {
    match unsafe { push(frame, value) } {
        Ok(()) => std::ptr::null_mut(),
        Err(exception) => exception,
    }
}

/// Pop the top of the datastack.
///
/// # Safety
/// See [`pop`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_stack_pop(frame: *mut Frame) -> BowlResult {
    unsafe { pop(frame, "pop").into() }
}

/// Peek at the top of the datastack.
///
/// # Safety
/// See [`peek`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_stack_peek(frame: *mut Frame) -> BowlResult {
    unsafe { peek(frame, "peek").into() }
}

/// Number of values on the datastack.
///
/// # Safety
/// See [`depth`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_stack_depth(frame: *mut Frame) -> usize {
    unsafe { depth(frame) }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::printer::show;
    use crate::test_support::with_vm;
    use bowl_core::heap::MIN_HEAP_CAPACITY;

    #[test]
    fn test_push_pop_roundtrip() {
        with_vm(MIN_HEAP_CAPACITY, |frame| unsafe {
            push(frame, value::number(1.0).unwrap()).unwrap();
            push(frame, value::number(2.0).unwrap()).unwrap();
            assert_eq!(depth(frame), 2);

            assert_eq!(value::number_value(pop(frame, "test").unwrap()), 2.0);
            assert_eq!(value::number_value(pop(frame, "test").unwrap()), 1.0);
            assert_eq!(depth(frame), 0);
        });
    }

    #[test]
    fn test_pop_empty_names_operation() {
        with_vm(MIN_HEAP_CAPACITY, |frame| unsafe {
            let exception = pop(frame, "my-primitive").unwrap_err();
            assert!(show(exception).contains("my-primitive"));
        });
    }

    #[test]
    fn test_typed_pop_mismatch() {
        with_vm(MIN_HEAP_CAPACITY, |frame| unsafe {
            push(frame, value::boolean(true).unwrap()).unwrap();
            let exception = pop_number(frame, "add").unwrap_err();
            let rendered = show(exception);
            assert!(rendered.contains("add"));
            assert!(rendered.contains("number"));
            assert!(rendered.contains("boolean"));
        });
    }

    #[test]
    fn test_pop_list_accepts_empty_list() {
        with_vm(MIN_HEAP_CAPACITY, |frame| unsafe {
            push(frame, std::ptr::null_mut()).unwrap();
            let empty = pop_list(frame, "reverse").unwrap();
            assert!(empty.is_null());
        });
    }

    #[test]
    fn test_peek_does_not_remove() {
        with_vm(MIN_HEAP_CAPACITY, |frame| unsafe {
            push(frame, value::number(7.0).unwrap()).unwrap();
            assert_eq!(value::number_value(peek(frame, "dup").unwrap()), 7.0);
            assert_eq!(depth(frame), 1);
        });
    }
}
