//! Shared harness: a booted VM with a host-style bottom frame.

use bowl_runtime::{Frame, Ref, frame};
use std::ptr;

/// Run `body` inside a fresh VM with a linked bottom frame whose three
/// slots point at locals, exactly the way a host embeds the runtime.
pub fn with_vm<F: FnOnce(*mut Frame)>(capacity: usize, body: F) {
    bowl_runtime::setup(capacity);

    let mut dictionary: Ref = ptr::null_mut();
    let mut callstack: Ref = ptr::null_mut();
    let mut datastack: Ref = ptr::null_mut();

    let mut bottom = Frame::empty();
    bottom.dictionary = &mut dictionary;
    bottom.callstack = &mut callstack;
    bottom.datastack = &mut datastack;

    unsafe {
        frame::link(&mut bottom);
        body(&mut bottom);
        frame::unlink(&mut bottom);
    }

    bowl_runtime::teardown();
}
