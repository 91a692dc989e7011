use std::{
    alloc::{GlobalAlloc, Layout},
    ffi::c_void,
    ptr,
};

use crate::externc::{ensure_resolved, BOOTSTRAP};

use super::{bootstrap::BOOTSTRAP_ALIGN, raw::RawAllocator};

/// The crate's own Rust heap. Goes straight to the real allocator, so
/// nothing we allocate for ourselves (symbolizer caches, TLS destructor
/// lists) is ever accounted or logged.
pub struct RealAlloc;

unsafe impl GlobalAlloc for RealAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some(context) = ensure_resolved() else {
            return BOOTSTRAP.allocate(layout.size(), layout.align()).cast();
        };
        if layout.align() <= BOOTSTRAP_ALIGN && layout.align() <= layout.size() {
            return context.allocator().allocate(layout.size()).cast();
        }
        let mut out: *mut c_void = ptr::null_mut();
        let align = layout.align().max(std::mem::size_of::<usize>());
        match libc::posix_memalign(&mut out, align, layout.size()) {
            0 => out.cast(),
            _ => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _: Layout) {
        let ptr = ptr.cast::<c_void>();
        if BOOTSTRAP.contains(ptr) {
            return;
        }
        // a block can only be ours to free once the real `free()` is known
        if let Some(context) = ensure_resolved() {
            context.allocator().release(ptr);
        }
    }
}
