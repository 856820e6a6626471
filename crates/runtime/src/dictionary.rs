//! Primitive Registry and Dispatch
//!
//! The dictionary is an ordinary map value hanging off the frame's
//! `dictionary` slot, keyed by symbols and holding function cells.
//! Registration is a functional map update: the slot is repointed at a new
//! dictionary, re-registration simply replaces the binding. Dispatch is a
//! single map lookup followed by an indirect call through the stored code
//! pointer.
//!
//! Names are case-sensitive and compared by bytes — there is no interning
//! table; symbol equality is byte equality with a cached hash.

use crate::exception;
use crate::frame::{Frame, NativeFn, with_roots};
use crate::{map_ops, value};
use bowl_core::cell::{FunctionCell, KIND_FUNCTION, Ref};
use std::ptr;

/// One entry of a module's primitive table, for [`register_all`].
pub struct RegistryEntry {
    pub name: &'static str,
    pub code: NativeFn,
}

/// Bind `name` to `code` in the dictionary, attributed to `library` (null
/// for host primitives). Creates the dictionary map on first use.
///
/// # Safety
/// `frame` must be a valid linked frame with a non-null dictionary slot;
/// `library` must be a library cell or null.
pub unsafe fn register_function(
    frame: *mut Frame,
    name: &str,
    library: Ref,
    code: NativeFn,
) -> Result<(), Ref> {
    unsafe {
        with_roots(frame, [library, ptr::null_mut(), ptr::null_mut()], |child| {
            let symbol = value::symbol(name)?;
            (*child).registers[1] = symbol;
            let function = value::function(child, (*child).registers[0], code)?;
            (*child).registers[2] = function;

            let slot = (*child).dictionary;
            debug_assert!(!slot.is_null(), "register_function: frame has no dictionary slot");
            let dictionary = if (*slot).is_null() {
                value::map(8)?
            } else {
                *slot
            };
            let updated =
                map_ops::put(child, dictionary, (*child).registers[1], (*child).registers[2])?;
            *(*child).dictionary = updated;
            Ok(())
        })
    }
}

/// Register a module's whole primitive table against `library`.
///
/// # Safety
/// See [`register_function`].
pub unsafe fn register_all(
    frame: *mut Frame,
    library: Ref,
    entries: &[RegistryEntry],
) -> Result<(), Ref> {
    unsafe {
        with_roots(frame, [library, ptr::null_mut(), ptr::null_mut()], |child| {
            for entry in entries {
                register_function(child, entry.name, (*child).registers[0], entry.code)?;
            }
            Ok(())
        })
    }
}

/// Look `name` up in the dictionary; an absent binding raises the
/// undefined-name exception.
///
/// # Safety
/// `frame` must be a valid linked frame with a non-null dictionary slot.
pub unsafe fn lookup(frame: *mut Frame, name: &str) -> Result<Ref, Ref> {
    unsafe {
        let slot = (*frame).dictionary;
        debug_assert!(!slot.is_null(), "lookup: frame has no dictionary slot");

        let symbol = value::symbol(name)?;
        // Read the dictionary after the allocation above; the slot is a
        // root, the local would be stale.
        let dictionary = *slot;
        if dictionary.is_null() {
            return Err(exception::format_exception(
                frame,
                format_args!("undefined name: {}", name),
            ));
        }
        match map_ops::get(dictionary, symbol) {
            Some(binding) => Ok(binding),
            None => Err(exception::format_exception(
                frame,
                format_args!("undefined name: {}", name),
            )),
        }
    }
}

/// Look `name` up and invoke the bound primitive on `frame`.
///
/// # Safety
/// See [`lookup`]; the binding's code pointer must be a live primitive.
pub unsafe fn dispatch(frame: *mut Frame, name: &str) -> Result<(), Ref> {
    unsafe {
        let binding = lookup(frame, name)?;
        if binding.is_null() || (*binding).kind != KIND_FUNCTION {
            return Err(exception::type_mismatch(frame, name, KIND_FUNCTION, binding));
        }
        let code = (*(binding as *mut FunctionCell)).code;
        let primitive: NativeFn = std::mem::transmute(code);
        let exception = primitive(frame);
        if exception.is_null() {
            Ok(())
        } else {
            Err(exception)
        }
    }
}

// =============================================================================
// FFI
// =============================================================================

/// One entry of a module's primitive table at the ABI.
#[repr(C)]
pub struct BowlRegistryEntry {
    pub name: *const libc::c_char,
    pub code: NativeFn,
}

/// Bind the NUL-terminated `name` to `code`, attributed to `library`.
/// Returns null or an exception.
///
/// # Safety
/// See [`register_function`]; `name` must be valid NUL-terminated UTF-8.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_register_function(
    frame: *mut Frame,
    name: *const libc::c_char,
    library: Ref,
    code: NativeFn,
) -> Ref {
    unsafe {
        let name = std::ffi::CStr::from_ptr(name);
        let name = match name.to_str() {
            Ok(name) => name,
            Err(_) => {
                return exception::format_exception(
                    frame,
                    format_args!("register_function: name is not valid UTF-8"),
                );
            }
        };
        match register_function(frame, name, library, code) {
            Ok(()) => ptr::null_mut(),
            Err(exception) => exception,
        }
    }
}

/// Register `count` entries against `library`. Returns null or the first
/// exception.
///
/// # Safety
/// `entries` must point to `count` valid entries; see
/// [`bowl_register_function`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_register_all(
    frame: *mut Frame,
    library: Ref,
    entries: *const BowlRegistryEntry,
    count: usize,
) -> Ref {
    unsafe {
        for index in 0..count {
            let entry = &*entries.add(index);
            let exception = bowl_register_function(frame, entry.name, library, entry.code);
            if !exception.is_null() {
                return exception;
            }
        }
        ptr::null_mut()
    }
}

// =============================================================================
// Tests
// =============================================================================
