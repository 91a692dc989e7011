//! The exported `malloc()` and `free()`, and the process-wide state behind
//! them. Only built for the preload object.

use std::sync::atomic::AtomicUsize;

use libc::{c_void, size_t};

use crate::{
    alloc::{
        bootstrap::{BootstrapArena, BOOTSTRAP_ALIGN},
        global::RealAlloc,
        raw::{RawAllocator, RealAllocator},
        tracker::Tracker,
    },
    config::{Config, MAX_THREADS},
    diag::logger::Logger,
    error::Fatal,
    lazy_lock::LazyLock,
    thread::{HookGuard, Identity, SingleThread, ThreadRegistry},
    util::print::Stderr,
};

pub type Context = Tracker<'static, RealAllocator, Identity, MAX_THREADS>;

static SLOTS: [AtomicUsize; MAX_THREADS] = [const { AtomicUsize::new(0) }; MAX_THREADS];
static REGISTRY: ThreadRegistry = ThreadRegistry::new(&SLOTS);

/// Serves whatever gets allocated while [`CONTEXT`] is being built
pub static BOOTSTRAP: BootstrapArena<{ 64 * 1024 }> = BootstrapArena::new();

static CONTEXT: LazyLock<Context> = LazyLock::new(init_context);

fn init_context() -> Context {
    let allocator = match RealAllocator::resolve() {
        Ok(allocator) => allocator,
        Err(err) => fatal(&Logger::new(&Stderr, Config::BUILD.prefix), err),
    };
    let identity = if MAX_THREADS > 1 {
        Identity::Registry(&REGISTRY)
    } else {
        Identity::Single(SingleThread)
    };
    Tracker::new(allocator, identity, &Stderr, Config::BUILD)
        .skipping_frames_through([malloc as usize, free as usize])
}

/// The tracker, resolving the real allocator on first use. Threads that
/// arrive mid-resolution wait for it; only the resolving thread itself (whose
/// `dlsym()` may call back into `malloc()`) gets `None` and falls back to
/// [`BOOTSTRAP`].
pub fn ensure_resolved() -> Option<&'static Context> {
    CONTEXT.get_unless_initializing()
}

fn fatal(logger: &Logger<'_>, err: Fatal) -> ! {
    logger.error(&err);
    // SAFETY: always safe to call; nothing of ours needs unwinding
    unsafe { libc::_exit(libc::EXIT_FAILURE) }
}

/// # Safety
///
/// Same contract as `malloc()`
#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    let Some(context) = ensure_resolved() else {
        return BOOTSTRAP.allocate(size, BOOTSTRAP_ALIGN);
    };
    let Some(_guard) = HookGuard::enter() else {
        return context.allocator().allocate(size);
    };
    context
        .allocate(size)
        .unwrap_or_else(|err| fatal(context.logger(), err))
}

/// # Safety
///
/// Same contract as `free()`
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() || BOOTSTRAP.contains(ptr) {
        return;
    }
    let Some(context) = ensure_resolved() else {
        return;
    };
    let Some(_guard) = HookGuard::enter() else {
        return context.allocator().release(ptr);
    };
    if let Err(err) = context.release(ptr) {
        fatal(context.logger(), err)
    }
}

#[global_allocator]
static GLOBAL: RealAlloc = RealAlloc;
