use std::{
    cell::UnsafeCell,
    ffi::c_void,
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::util::num::{checked_round_up, round_up};

/// Alignment of everything handed out, matching what `malloc()` promises on
/// 64-bit glibc
pub const BOOTSTRAP_ALIGN: usize = 16;

#[repr(C, align(16))]
struct Arena<const N: usize>([u8; N]);

/// A simple stack allocator over a static buffer, for the window in which the
/// real allocator is still being looked up. `dlsym()` is allowed to call
/// `malloc()`, and that `malloc()` is us; we can't wait for ourselves, so
/// those requests get bump-allocated out of here instead.
///
/// `release()` is a nop and `allocate()` is just an sp bump. Running out is
/// an allocation failure (null), not a crash.
pub struct BootstrapArena<const N: usize> {
    arena: UnsafeCell<Arena<N>>,
    sp: AtomicUsize,
}

// SAFETY: `sp` hands out disjoint ranges, and we never touch the bytes
//         ourselves once they are handed out.
unsafe impl<const N: usize> Sync for BootstrapArena<N> {}

impl<const N: usize> BootstrapArena<N> {
    pub const fn new() -> Self {
        Self {
            arena: UnsafeCell::new(Arena([0; N])),
            sp: AtomicUsize::new(0),
        }
    }

    fn base(&self) -> *mut u8 {
        self.arena.get().cast()
    }

    /// Bump-allocate `size` bytes aligned to at least [`BOOTSTRAP_ALIGN`] (or
    /// `align`, if bigger). Zero-sized requests still get a unique address.
    pub fn allocate(&self, size: usize, align: usize) -> *mut c_void {
        let align = align.max(BOOTSTRAP_ALIGN);
        if !align.is_power_of_two() {
            return ptr::null_mut();
        }
        let Some(size) = checked_round_up(size.max(1), BOOTSTRAP_ALIGN) else {
            return ptr::null_mut();
        };
        let base = self.base() as usize;
        let bumped = self.sp.fetch_update(Ordering::AcqRel, Ordering::Acquire, |sp| {
            let start = round_up(base + sp, align) - base;
            let end = start.checked_add(size)?;
            (end <= N).then_some(end)
        });
        match bumped {
            Ok(sp) => {
                let start = round_up(base + sp, align) - base;
                // SAFETY: `start + size <= N`, checked above
                unsafe { self.base().add(start).cast() }
            }
            Err(_) => ptr::null_mut(),
        }
    }

    /// Does `ptr` point into this arena? Pointers from here must never reach
    /// the real allocator.
    pub fn contains(&self, ptr: *const c_void) -> bool {
        let base = self.base() as usize;
        (base..base + N).contains(&(ptr as usize))
    }

    /// Bytes handed out so far, including alignment padding
    #[cfg(test)]
    fn used(&self) -> usize {
        self.sp.load(Ordering::Acquire)
    }
}

impl<const N: usize> Default for BootstrapArena<N> {
    fn default() -> Self {
        Self::new()
    }
}
