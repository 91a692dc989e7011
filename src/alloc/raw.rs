//! The allocator underneath us, and the lookup that finds it.

use std::{
    ffi::{c_void, CStr},
    mem,
};

use libc::size_t;

use crate::error::{DlErrorText, Fatal};

pub type MallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);

/// The C heap contract the interposer sits on top of.
///
/// # Safety
///
/// Implementors must behave like `malloc()`/`free()`: `allocate()` returns
/// null or a live block of at least `size` bytes, and `usable_size()` reports
/// the real extent of a block this allocator handed out.
pub unsafe trait RawAllocator: Sync {
    /// # Safety
    ///
    /// Same contract as `malloc()`
    unsafe fn allocate(&self, size: usize) -> *mut c_void;

    /// # Safety
    ///
    /// Same contract as `free()`
    unsafe fn release(&self, ptr: *mut c_void);

    /// The size oracle. What the allocator actually reserved for `ptr`, which
    /// may be more than was asked for.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live, non-null block from this allocator
    unsafe fn usable_size(&self, ptr: *mut c_void) -> usize;
}

/// `malloc_usable_size()`, for any block owned by the process heap
///
/// # Safety
///
/// `ptr` must be a live, non-null block from the process heap
pub unsafe fn usable_size(ptr: *mut c_void) -> usize {
    libc::malloc_usable_size(ptr)
}

/// The process's real `malloc()` and `free()`: whatever comes after us in
/// link order.
#[derive(Clone, Copy)]
pub struct RealAllocator {
    malloc: MallocFn,
    free: FreeFn,
}

impl RealAllocator {
    /// Look up the next `malloc` and `free` with `dlsym(RTLD_NEXT, ..)`.
    ///
    /// Must not allocate or print anything itself: whatever `dlsym()`
    /// allocates will re-enter the interposer before we are done.
    pub fn resolve() -> Result<Self, Fatal> {
        // SAFETY: both symbols have exactly these C signatures
        unsafe {
            let malloc = Self::next_symbol(c"malloc")?;
            let free = Self::next_symbol(c"free")?;
            Ok(Self {
                malloc: mem::transmute::<*mut c_void, MallocFn>(malloc),
                free: mem::transmute::<*mut c_void, FreeFn>(free),
            })
        }
    }

    fn next_symbol(name: &'static CStr) -> Result<*mut c_void, Fatal> {
        // SAFETY: `name` is nul-terminated; RTLD_NEXT is a valid pseudo-handle
        let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
        if sym.is_null() {
            return Err(Fatal::ResolverFailure {
                symbol: name.to_str().unwrap_or("?"),
                reason: DlErrorText::take(),
            });
        }
        Ok(sym)
    }
}

// SAFETY: these are the process heap's own entry points
unsafe impl RawAllocator for RealAllocator {
    unsafe fn allocate(&self, size: usize) -> *mut c_void {
        (self.malloc)(size)
    }

    unsafe fn release(&self, ptr: *mut c_void) {
        (self.free)(ptr)
    }

    unsafe fn usable_size(&self, ptr: *mut c_void) -> usize {
        usable_size(ptr)
    }
}
