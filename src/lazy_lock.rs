use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
};

use crate::{thread::thread_handle, util::hint::cold};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LazyLockState {
    /// Signifies this lock is uninitialized
    Uninit,
    /// Signifies this lock is initialized
    Init,
    /// Signifies this lock is mid initialization. The interposer needs this:
    /// anything the initializer itself allocates comes back into `malloc()`
    /// while we are in this state, and must not wait on the lock.
    Initializing,
}

impl LazyLockState {
    fn from_u8(state: u8) -> Self {
        match state {
            0 => Self::Uninit,
            1 => Self::Init,
            _ => Self::Initializing,
        }
    }
}

/// Nobody is running `init`
const NO_INITIALIZER: usize = 0;

/// A LazyLock that lets you poll its initialization state (including
/// mid-init). The mutex is only ever taken on the first-use path; once the
/// state reads `Init` every access is a single acquire load.
pub struct LazyLock<T, F = fn() -> T> {
    cell: UnsafeCell<MaybeUninit<T>>,
    lock: Mutex<()>,
    state: AtomicU8,
    /// `pthread_self()` of the thread inside `init`, if any
    initializer: AtomicUsize,
    init: F,
}

// SAFETY: the cell is written exactly once, under `lock`, before `state`
//         is published as `Init` with release ordering. After that it is
//         only ever read.
unsafe impl<T, F> Sync for LazyLock<T, F>
where
    T: Sync + Send,
    F: Sync,
{
}

impl<T, F> LazyLock<T, F>
where
    F: Fn() -> T,
{
    pub const fn new(init: F) -> Self {
        Self {
            cell: UnsafeCell::new(MaybeUninit::uninit()),
            lock: Mutex::new(()),
            state: AtomicU8::new(LazyLockState::Uninit as u8),
            initializer: AtomicUsize::new(NO_INITIALIZER),
            init,
        }
    }

    pub fn state(lock: &Self) -> LazyLockState {
        LazyLockState::from_u8(lock.state.load(Ordering::Acquire))
    }

    /// # Safety
    ///
    /// The state must be [`LazyLockState::Init`].
    pub unsafe fn assume_init(&self) -> &T {
        (*self.cell.get()).assume_init_ref()
    }

    /// Initialize if nobody has yet, waiting if somebody else is doing it.
    ///
    /// # Stuck
    ///
    /// - Forever, if called from inside `init` on the same thread. Use
    ///   [`LazyLock::get_unless_initializing()`] where that can happen.
    pub fn initialize(&self) -> &T {
        if LazyLock::state(self) != LazyLockState::Init {
            cold(|| {
                // `init` never panics while holding this, but if it somehow
                // did the protected data is the state byte, which is still
                // meaningful.
                let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
                if LazyLock::state(self) == LazyLockState::Uninit {
                    self.initializer.store(thread_handle(), Ordering::Release);
                    self.state
                        .store(LazyLockState::Initializing as u8, Ordering::Release);
                    let value = (self.init)();
                    // SAFETY: we hold `lock` and the state was Uninit, so
                    //         nobody else can be reading or writing the cell
                    unsafe { *self.cell.get() = MaybeUninit::new(value) };
                    self.state.store(LazyLockState::Init as u8, Ordering::Release);
                    self.initializer.store(NO_INITIALIZER, Ordering::Release);
                }
            })
        }
        // SAFETY: either we or whoever held the lock before us set Init
        unsafe { self.assume_init() }
    }

    /// Like [`LazyLock::initialize()`], except that the thread currently
    /// inside `init` gets `None` instead of waiting on itself. Every other
    /// thread waits for the value.
    pub fn get_unless_initializing(&self) -> Option<&T> {
        match LazyLock::state(self) {
            // SAFETY: state is Init
            LazyLockState::Init => Some(unsafe { self.assume_init() }),
            LazyLockState::Initializing
                if self.initializer.load(Ordering::Acquire) == thread_handle() =>
            {
                None
            }
            _ => Some(self.initialize()),
        }
    }
}
