//! Which ledger slot a thread writes to, and whether it is already inside the
//! interposer.

use std::{
    cell::Cell,
    ffi::c_void,
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::util::hint::cold;

/// Maps the calling thread to a small index. Anything `>= T` is passed
/// through to the interposer, which treats it as bound-exceeded.
pub trait ThreadIdentity: Sync {
    fn current_index(&self) -> usize;
}

/// No thread support configured: every thread is thread 0
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleThread;

impl ThreadIdentity for SingleThread {
    fn current_index(&self) -> usize {
        0
    }
}

/// Slot content for "nobody"
const VACANT: usize = 0;

/// An opaque, non-zero handle for the calling thread
pub(crate) fn thread_handle() -> usize {
    // SAFETY: always safe to call
    let handle = unsafe { libc::pthread_self() } as usize;
    debug_assert_ne!(handle, VACANT);
    handle
}

/// Hands out the lowest free index to each thread, keeps it for the thread's
/// lifetime and takes it back when the thread exits (so indices get reused,
/// like an OpenMP team's thread numbers).
///
/// Slots hold the owner's `pthread_self()`. A registry with every slot taken
/// answers `capacity()` for newcomers.
///
/// The slot is given back from a `pthread_key` destructor, not a Rust
/// thread-local one: Rust TLS destructors run before the key destructors,
/// and those (libgomp's team teardown, say) still call `free()`.
pub struct ThreadRegistry {
    slots: &'static [AtomicUsize],
    active: AtomicUsize,
    /// The `pthread_key_t` whose destructor releases slots, once created
    exit_key: AtomicUsize,
}

/// `exit_key` before the key exists
const NO_KEY: usize = usize::MAX;

/// glibc's `PTHREAD_DESTRUCTOR_ITERATIONS`: key destructors get this many
/// passes, and a value re-armed during the last one is dropped
const DESTRUCTOR_PASSES: usize = 4;

/// Key values are the registry's address with the number of passes seen so
/// far in the low bits (the registry is at least 8-byte aligned)
const PASS_MASK: usize = 0b111;

thread_local! {
    /// Last answer, so the common case is one TLS read. No destructor, so
    /// this stays readable for as long as the thread runs code.
    static CACHED: Cell<Option<(&'static ThreadRegistry, usize)>> = const { Cell::new(None) };
}

/// Runs once per destructor pass. Re-arms itself until the last pass so the
/// slot outlives every other key destructor that might still allocate.
unsafe extern "C" fn release_on_exit(value: *mut c_void) {
    let value = value as usize;
    let passes = (value & PASS_MASK) + 1;
    // SAFETY: the key only ever holds the address of a `'static` registry
    let registry = &*((value & !PASS_MASK) as *const ThreadRegistry);
    if passes < DESTRUCTOR_PASSES {
        if let Some(key) = registry.exit_key() {
            let rearmed = (value & !PASS_MASK) | passes;
            if libc::pthread_setspecific(key, rearmed as *const c_void) == 0 {
                return;
            }
        }
    }
    registry.release_current();
}

impl ThreadRegistry {
    pub const fn new(slots: &'static [AtomicUsize]) -> Self {
        Self {
            slots,
            active: AtomicUsize::new(0),
            exit_key: AtomicUsize::new(NO_KEY),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Threads currently holding a slot
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// The calling thread's index, claiming one on first use
    pub fn index(&'static self) -> usize {
        let cached = CACHED.try_with(Cell::get).ok().flatten();
        if let Some((registry, index)) = cached {
            if ptr::eq(registry, self) {
                return index;
            }
        }
        cold(|| self.index_slow())
    }

    fn index_slow(&'static self) -> usize {
        let handle = thread_handle();
        let index = match self.find(handle) {
            Some(index) => index,
            None => match self.claim(handle) {
                Some(index) => {
                    self.release_at_exit();
                    index
                }
                // full, which the caller reports as bound-exceeded
                None => return self.capacity(),
            },
        };
        _ = CACHED.try_with(|cached| cached.set(Some((self, index))));
        index
    }

    fn find(&self, handle: usize) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.load(Ordering::Acquire) == handle)
    }

    fn claim(&self, handle: usize) -> Option<usize> {
        let index = self.slots.iter().position(|slot| {
            slot.compare_exchange(VACANT, handle, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        })?;
        self.active.fetch_add(1, Ordering::AcqRel);
        log::trace!("thread {handle:#x} claimed slot {index}");
        Some(index)
    }

    /// The destructor key, created on first use. `None` if the process is out
    /// of keys, in which case slots are never given back.
    fn exit_key(&self) -> Option<libc::pthread_key_t> {
        let key = self.exit_key.load(Ordering::Acquire);
        if key != NO_KEY {
            return Some(key as libc::pthread_key_t);
        }
        let mut created: libc::pthread_key_t = 0;
        // SAFETY: `created` is a valid out pointer
        if unsafe { libc::pthread_key_create(&mut created, Some(release_on_exit)) } != 0 {
            return None;
        }
        match self.exit_key.compare_exchange(
            NO_KEY,
            created as usize,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Some(created),
            Err(winner) => {
                // SAFETY: nobody has seen `created`
                unsafe { libc::pthread_key_delete(created) };
                Some(winner as libc::pthread_key_t)
            }
        }
    }

    fn release_at_exit(&'static self) {
        let Some(key) = self.exit_key() else {
            log::trace!("out of pthread keys, slots will not be reused");
            return;
        };
        // SAFETY: `key` is live; the value is a `'static` address
        unsafe { libc::pthread_setspecific(key, self as *const Self as *const c_void) };
    }

    /// Gives back the calling thread's slot and forgets its cached index
    fn release_current(&self) {
        let handle = thread_handle();
        _ = CACHED.try_with(|cached| {
            if cached.get().is_some_and(|(registry, _)| ptr::eq(registry, self)) {
                cached.set(None);
            }
        });
        if let Some(index) = self.find(handle) {
            if self.slots[index]
                .compare_exchange(handle, VACANT, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.active.fetch_sub(1, Ordering::AcqRel);
                log::trace!("thread {handle:#x} released slot {index}");
            }
        }
    }
}

impl ThreadIdentity for &'static ThreadRegistry {
    fn current_index(&self) -> usize {
        self.index()
    }
}

/// Registry when there is room for more than one thread, thread 0 otherwise
#[derive(Clone, Copy)]
pub enum Identity {
    Registry(&'static ThreadRegistry),
    Single(SingleThread),
}

impl ThreadIdentity for Identity {
    fn current_index(&self) -> usize {
        match self {
            Identity::Registry(registry) => registry.index(),
            Identity::Single(single) => single.current_index(),
        }
    }
}

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Marks the calling thread as inside the interposer. If the interposer
/// calls into something that calls `malloc()` again (libc loading the
/// unwinder for a backtrace, say), the nested call sees the flag and goes
/// straight to the real allocator: no accounting, no logging, and no second
/// attempt at the log lock.
pub struct HookGuard(());

impl HookGuard {
    /// `None` if this thread is already inside
    pub fn enter() -> Option<Self> {
        IN_HOOK
            .try_with(|flag| (!flag.replace(true)).then_some(HookGuard(())))
            .ok()
            .flatten()
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        _ = IN_HOOK.try_with(|flag| flag.set(false));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn registry(capacity: usize) -> &'static ThreadRegistry {
        let slots: Vec<AtomicUsize> = (0..capacity).map(|_| AtomicUsize::new(VACANT)).collect();
        Box::leak(Box::new(ThreadRegistry::new(Box::leak(slots.into_boxed_slice()))))
    }

    #[test]
    fn single_thread_is_always_zero() {
        let index = std::thread::spawn(|| SingleThread.current_index())
            .join()
            .unwrap();
        assert_eq!(index, 0);
        assert_eq!(SingleThread.current_index(), 0);
    }

    #[test]
    fn index_is_stable_for_a_thread() {
        let registry = registry(4);
        std::thread::spawn(move || {
            let first = registry.index();
            assert_eq!(registry.index(), first);
            assert_eq!(registry.active(), 1);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn live_threads_get_distinct_indices() {
        let registry = registry(8);
        let barrier = std::sync::Barrier::new(8);
        let indices = crossbeam::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|_| {
                        let index = registry.index();
                        // keep everybody alive until everybody has an index
                        barrier.wait();
                        index
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<HashSet<_>>()
        })
        .unwrap();
        assert_eq!(indices, (0..8).collect());
    }

    #[test]
    fn index_is_reused_after_exit() {
        let registry = registry(2);
        let first = std::thread::spawn(move || registry.index()).join().unwrap();
        assert_eq!(registry.active(), 0);
        let second = std::thread::spawn(move || registry.index()).join().unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 0);
    }

    #[test]
    fn full_registry_answers_capacity() {
        let registry = registry(1);
        let (hold_tx, hold_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            ready_tx.send(registry.index()).unwrap();
            hold_rx.recv().unwrap();
        });
        assert_eq!(ready_rx.recv().unwrap(), 0);
        let late = std::thread::spawn(move || registry.index()).join().unwrap();
        assert_eq!(late, registry.capacity());
        hold_tx.send(()).unwrap();
        holder.join().unwrap();
    }

    static SEEN_INDEX: AtomicUsize = AtomicUsize::new(usize::MAX);
    static SEEN_ACTIVE: AtomicUsize = AtomicUsize::new(usize::MAX);

    unsafe extern "C" fn late_destructor(registry: *mut c_void) {
        let registry = &*(registry as *const ThreadRegistry);
        SEEN_INDEX.store(registry.index(), Ordering::SeqCst);
        SEEN_ACTIVE.store(registry.active(), Ordering::SeqCst);
    }

    #[test]
    fn slot_outlives_other_key_destructors() {
        let registry = registry(2);
        std::thread::spawn(move || {
            assert_eq!(registry.index(), 0);
            let mut key: libc::pthread_key_t = 0;
            unsafe {
                assert_eq!(libc::pthread_key_create(&mut key, Some(late_destructor)), 0);
                let value = registry as *const ThreadRegistry as *const c_void;
                assert_eq!(libc::pthread_setspecific(key, value), 0);
            }
        })
        .join()
        .unwrap();
        // the other destructor still saw the slot held by its thread
        assert_eq!(SEEN_INDEX.load(Ordering::SeqCst), 0);
        assert_eq!(SEEN_ACTIVE.load(Ordering::SeqCst), 1);
        assert_eq!(registry.active(), 0);
        assert_eq!(registry.slots[0].load(Ordering::SeqCst), VACANT);
    }

    #[test]
    fn hook_guard_detects_nesting() {
        let outer = HookGuard::enter().expect("not inside yet");
        assert!(HookGuard::enter().is_none());
        drop(outer);
        let again = HookGuard::enter();
        assert!(again.is_some());
        drop(again);
        assert!(HookGuard::enter().is_some());
    }
}
