//! Native Module Loader
//!
//! A native module is a shared object exporting two C symbols:
//!
//! - `bowl_module_initialize(frame, library)` — called once after load;
//!   registers the module's primitives against the library cell
//! - `bowl_module_finalize(frame, library)` — called when the library cell
//!   becomes unreachable, or at teardown
//!
//! Loading is deduplicated through a registry keyed by the normalized
//! path: asking for the same library twice returns the same cell. The
//! native handle is owned by the cell and never exposed; both entry points
//! are resolved eagerly at load time so finalization never has to dlsym a
//! dying module.
//!
//! Lifetime is collector-driven: after every copy cycle the registry is
//! swept, surviving entries are repointed at the forwarded cells, and dead
//! entries are finalized and their handles closed. A finalizer runs inside
//! the collector and must not allocate.

use crate::exception::{self, BowlResult};
use crate::frame::{self, Frame, with_roots};
use crate::value;
use bowl_core::cell::{LibraryCell, Ref};
use bowl_core::heap::Heap;
use libloading::Library;
use std::cell::RefCell;
use std::ffi::c_void;
use std::path::PathBuf;
use std::ptr;

/// The signature of both module entry points: the current frame and the
/// library cell; null for success, an exception otherwise.
pub type ModuleEntry = unsafe extern "C" fn(*mut Frame, Ref) -> Ref;

thread_local! {
    // Normalized path → library cell, in load order. The collector sweeps
    // this after every copy cycle; teardown drains it in reverse.
    static LIBRARIES: RefCell<Vec<(PathBuf, Ref)>> = const { RefCell::new(Vec::new()) };
}

/// Load the native module at `path`, or return the existing cell if a
/// library with the same normalized path is already loaded.
///
/// On a fresh load: open the shared object, resolve both entry points,
/// allocate the library cell, and invoke `bowl_module_initialize` with the
/// cell. If initialization reports an exception the handle is closed, the
/// cell neutralized, and the exception propagated.
///
/// # Safety
/// `frame` must be a valid linked frame. Loading runs arbitrary native
/// code; the module must follow the frame protocol before allocating.
pub unsafe fn library(frame: *mut Frame, path: &str) -> Result<Ref, Ref> {
    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| PathBuf::from(path));

    let existing = LIBRARIES.with(|libraries| {
        libraries
            .borrow()
            .iter()
            .find(|(loaded, _)| *loaded == canonical)
            .map(|(_, cell)| *cell)
    });
    if let Some(cell) = existing {
        return Ok(cell);
    }

    let handle = match unsafe { Library::new(path) } {
        Ok(handle) => handle,
        Err(error) => {
            return Err(unsafe {
                exception::format_exception(
                    frame,
                    format_args!("library: cannot open {}: {}", path, error),
                )
            });
        }
    };
    // Symbols borrow the handle; resolve both before the handle moves into
    // the cell. A module missing either export is a load failure.
    let initialize = match unsafe { handle.get::<ModuleEntry>(b"bowl_module_initialize") } {
        Ok(symbol) => *symbol as usize,
        Err(error) => {
            return Err(unsafe {
                exception::format_exception(
                    frame,
                    format_args!(
                        "library: {} does not export bowl_module_initialize: {}",
                        path, error
                    ),
                )
            });
        }
    };
    let finalize = match unsafe { handle.get::<ModuleEntry>(b"bowl_module_finalize") } {
        Ok(symbol) => *symbol as usize,
        Err(error) => {
            return Err(unsafe {
                exception::format_exception(
                    frame,
                    format_args!(
                        "library: {} does not export bowl_module_finalize: {}",
                        path, error
                    ),
                )
            });
        }
    };

    let name = canonical.display().to_string();
    let handle = Box::into_raw(Box::new(handle)) as *mut c_void;
    let cell = match unsafe { value::library_cell(&name, handle, initialize, finalize) } {
        Ok(cell) => cell,
        Err(exception) => {
            let native = unsafe { *Box::from_raw(handle as *mut Library) };
            let _ = native.close();
            return Err(exception);
        }
    };

    unsafe {
        with_roots(frame, [cell, ptr::null_mut(), ptr::null_mut()], |child| {
            let entry: ModuleEntry = std::mem::transmute(initialize);
            let exception = entry(child, (*child).registers[0]);
            if !exception.is_null() {
                // Initialization failed: close the handle now and leave a
                // neutralized cell behind for the collector to reclaim.
                let cell = (*child).registers[0] as *mut LibraryCell;
                let handle = (*cell).handle;
                (*cell).handle = ptr::null_mut();
                (*cell).initialize = 0;
                (*cell).finalize = 0;
                let native = *Box::from_raw(handle as *mut Library);
                let _ = native.close();
                return Err(exception);
            }

            let cell = (*child).registers[0];
            LIBRARIES.with(|libraries| libraries.borrow_mut().push((canonical, cell)));
            tracing::debug!(path, "library loaded");
            Ok(cell)
        })
    }
}

// Invoke the module's finalizer and close the native handle. Both failure
// modes — the finalizer reporting an exception and the handle refusing to
// close — count as finalization failure.
unsafe fn finalize_library(frame: *mut Frame, library: Ref) -> Result<(), ()> {
    unsafe {
        let cell = library as *mut LibraryCell;
        let mut outcome = Ok(());

        if (*cell).finalize != 0 {
            let entry: ModuleEntry = std::mem::transmute((*cell).finalize);
            let exception = entry(frame, library);
            if !exception.is_null() {
                outcome = Err(());
            }
        }

        let handle = (*cell).handle;
        if !handle.is_null() {
            (*cell).handle = ptr::null_mut();
            let native = *Box::from_raw(handle as *mut Library);
            if native.close().is_err() {
                outcome = Err(());
            }
        }
        outcome
    }
}

/// Collector hook: repoint registry entries whose cells were forwarded,
/// finalize the rest. Runs between the copy cycle and the flip, so a dead
/// cell is still readable in from-space while its finalizer runs.
pub(crate) unsafe fn sweep_libraries(heap: &Heap) -> Result<(), Ref> {
    let mut failed = false;
    LIBRARIES.with(|libraries| {
        libraries.borrow_mut().retain_mut(|(path, cell)| {
            let location = unsafe { (**cell).location };
            if !location.is_null() && heap.to_contains(location) {
                *cell = location;
                true
            } else {
                tracing::debug!(path = %path.display(), "finalizing unreachable library");
                if unsafe { finalize_library(frame::current_frame(), *cell) }.is_err() {
                    failed = true;
                }
                false
            }
        });
    });
    if failed {
        Err(exception::finalization_failure())
    } else {
        Ok(())
    }
}

/// Teardown hook: finalize every still-loaded library in reverse load
/// order.
pub(crate) unsafe fn teardown_libraries(frame: *mut Frame) {
    LIBRARIES.with(|libraries| {
        let mut libraries = libraries.borrow_mut();
        while let Some((path, cell)) = libraries.pop() {
            if unsafe { finalize_library(frame, cell) }.is_err() {
                tracing::warn!(path = %path.display(), "library finalization failed during teardown");
            }
        }
    });
}

// Build an in-heap library cell with no native handle and a caller-chosen
// finalizer, registered like a loaded module. This is how the collector's
// lifetime coupling is exercised without compiling a shared object.
#[cfg(test)]
pub(crate) unsafe fn fabricate_library(name: &str, finalize: ModuleEntry) -> Result<Ref, Ref> {
    unsafe {
        let cell = value::library_cell(name, ptr::null_mut(), 0, finalize as usize)?;
        LIBRARIES.with(|libraries| {
            libraries
                .borrow_mut()
                .push((PathBuf::from(name), cell))
        });
        Ok(cell)
    }
}

// =============================================================================
// FFI
// =============================================================================

/// Load the native module at the NUL-terminated `path`.
///
/// # Safety
/// See [`library`]; `path` must be a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_library(frame: *mut Frame, path: *const libc::c_char) -> BowlResult {
    unsafe {
        let path = std::ffi::CStr::from_ptr(path);
        match path.to_str() {
            Ok(path) => library(frame, path).into(),
            Err(_) => BowlResult::throw(exception::format_exception(
                frame,
                format_args!("library: path is not valid UTF-8"),
            )),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::with_vm;
    use crate::{dictionary, gc, printer, stack_ops};
    use bowl_core::heap::MIN_HEAP_CAPACITY;
    use std::cell::Cell;
    use std::io::Write as _;

    #[test]
    fn test_missing_library_raises() {
        with_vm(MIN_HEAP_CAPACITY, |frame| unsafe {
            let exception = library(frame, "/nonexistent/bowl-module.so").unwrap_err();
            let rendered = printer::show(exception);
            assert!(rendered.contains("cannot open"));
            assert!(rendered.contains("bowl-module.so"));
        });
    }

    #[test]
    fn test_garbage_file_is_not_a_library() {
        with_vm(MIN_HEAP_CAPACITY, |frame| unsafe {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.write_all(b"not a shared object").unwrap();
            let path = file.path().to_string_lossy().into_owned();

            let exception = library(frame, &path).unwrap_err();
            assert!(printer::show(exception).contains("cannot open"));
        });
    }

    thread_local! {
        static FINALIZED: Cell<usize> = const { Cell::new(0) };
    }

    unsafe extern "C" fn counting_finalize(_frame: *mut Frame, _library: Ref) -> Ref {
        FINALIZED.with(|count| count.set(count.get() + 1));
        ptr::null_mut()
    }

    unsafe extern "C" fn failing_finalize(_frame: *mut Frame, library: Ref) -> Ref {
        // Anything non-null reports failure; the dead cell itself is still
        // readable here.
        library
    }

    // The module primitive for the end-to-end scenario: pops a number,
    // pushes its double.
    unsafe extern "C" fn double_primitive(frame: *mut Frame) -> Ref {
        unsafe {
            let popped = match stack_ops::pop_number(frame, "double") {
                Ok(popped) => popped,
                Err(exception) => return exception,
            };
            let doubled = match value::number(popped * 2.0) {
                Ok(doubled) => doubled,
                Err(exception) => return exception,
            };
            match stack_ops::push(frame, doubled) {
                Ok(()) => ptr::null_mut(),
                Err(exception) => exception,
            }
        }
    }

    #[test]
    fn test_module_primitive_and_collector_driven_finalize() {
        FINALIZED.with(|count| count.set(0));
        with_vm(MIN_HEAP_CAPACITY, |frame| unsafe {
            // "Load" a module exporting one primitive and register it.
            let module = fabricate_library("demo-module", counting_finalize).unwrap();
            (*frame).registers[0] = module;
            dictionary::register_function(frame, "double", (*frame).registers[0], double_primitive)
                .unwrap();
            (*frame).registers[0] = ptr::null_mut();

            // Invoke it through the dictionary with 21; expect 42.
            stack_ops::push(frame, value::number(21.0).unwrap()).unwrap();
            dictionary::dispatch(frame, "double").unwrap();
            assert_eq!(stack_ops::depth(frame), 1);
            let result = stack_ops::pop(frame, "test").unwrap();
            assert_eq!(value::number_value(result), 42.0);

            // The dictionary still reaches the library through the
            // function binding, so a collection keeps it alive.
            gc::collect().unwrap();
            assert_eq!(FINALIZED.with(|count| count.get()), 0);

            // Drop the binding; the next collection finalizes exactly once.
            *(*frame).dictionary = ptr::null_mut();
            gc::collect().unwrap();
            assert_eq!(FINALIZED.with(|count| count.get()), 1);

            // And never again.
            gc::collect().unwrap();
            assert_eq!(FINALIZED.with(|count| count.get()), 1);
        });
    }

    #[test]
    fn test_failing_finalizer_surfaces_singleton() {
        with_vm(MIN_HEAP_CAPACITY, |_frame| unsafe {
            // Nothing roots the module; sweeping it fails.
            let _ = fabricate_library("broken-module", failing_finalize).unwrap();
            let exception = gc::collect().unwrap_err();
            assert_eq!(exception, exception::finalization_failure());
        });
    }

    #[test]
    fn test_teardown_finalizes_survivors() {
        FINALIZED.with(|count| count.set(0));
        with_vm(MIN_HEAP_CAPACITY, |frame| unsafe {
            let module = fabricate_library("resident-module", counting_finalize).unwrap();
            (*frame).registers[0] = module;
            // Still rooted when the VM goes down; teardown must finalize.
        });
        assert_eq!(FINALIZED.with(|count| count.get()), 1);
    }
}
