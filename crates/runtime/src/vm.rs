//! VM Lifecycle
//!
//! The process-wide pieces of the runtime — the heap spaces, the current
//! top frame, the library registry, and the preallocated singletons — are
//! thread-local: one VM per thread is the supported concurrency model.
//! `setup` creates them, `teardown` releases them; re-entering `setup`
//! while a VM is live on the thread is a programming error and panics.

use crate::frame::{self, Frame};
use crate::{exception, gc, loader};
use std::cell::Cell;

thread_local! {
    static INITIALIZED: Cell<bool> = const { Cell::new(false) };
}

/// Whether a VM is live on this thread.
pub fn is_initialized() -> bool {
    INITIALIZED.with(|flag| flag.get())
}

/// Boot a VM on this thread: heap spaces of `capacity` bytes each (rounded
/// up to a power of two) and the permanent singletons.
///
/// # Panics
/// Panics if a VM is already live on this thread; re-entrancy into setup
/// is forbidden.
pub fn setup(capacity: usize) {
    INITIALIZED.with(|flag| {
        assert!(!flag.get(), "bowl runtime already initialized on this thread");
        flag.set(true);
    });
    gc::install_heap(capacity);
    exception::install_singletons();
    tracing::debug!(capacity, "runtime initialized");
}

/// Shut the VM down: finalize every still-loaded library in reverse load
/// order, then release the singletons and the heap. Any frames still
/// linked are abandoned.
///
/// # Panics
/// Panics if no VM is live on this thread.
pub fn teardown() {
    INITIALIZED.with(|flag| {
        assert!(flag.get(), "bowl runtime not initialized on this thread");
        flag.set(false);
    });

    // Finalizers get a linked empty frame to satisfy the module ABI even
    // though the host's frames are already gone.
    let mut bottom = Frame::empty();
    unsafe {
        frame::link(&mut bottom);
        loader::teardown_libraries(&mut bottom);
        frame::unlink(&mut bottom);
    }

    exception::uninstall_singletons();
    gc::uninstall_heap();
    frame::reset_chain();
    tracing::debug!("runtime torn down");
}

// =============================================================================
// FFI
// =============================================================================

/// Boot a VM on the calling thread. Returns false if one is already live
/// (the C surface reports instead of panicking).
#[unsafe(no_mangle)]
pub extern "C" fn bowl_setup(capacity: usize) -> bool {
    if is_initialized() {
        return false;
    }
    setup(capacity);
    true
}

/// Shut down the VM on the calling thread. Returns false if none is live.
#[unsafe(no_mangle)]
pub extern "C" fn bowl_teardown() -> bool {
    if !is_initialized() {
        return false;
    }
    teardown();
    true
}

// =============================================================================
// Tests
// =============================================================================
