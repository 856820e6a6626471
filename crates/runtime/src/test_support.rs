//! Unit-test harness: a booted VM with a host-style bottom frame.

use crate::frame::{self, Frame};
use crate::vm;
use bowl_core::cell::Ref;
use std::ptr;

/// Run `body` inside a fresh VM with a linked bottom frame whose three
/// slots point at locals, the way a host embeds the runtime. The VM is
/// torn down afterwards; thread-local state keeps parallel tests apart.
pub(crate) fn with_vm<F: FnOnce(*mut Frame)>(capacity: usize, body: F) {
    vm::setup(capacity);

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

    vm::teardown();
}
