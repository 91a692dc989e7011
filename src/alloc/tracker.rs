//! The interposer proper: the allocator underneath, who is calling, how much
//! they hold, and what gets printed about it.

use std::{ffi::c_void, fmt};

use crate::{
    config::Config,
    diag::{
        logger::{AllocationEvent, Logger, Op, ThreadTag},
        stack::StackCapturer,
    },
    error::Fatal,
    thread::ThreadIdentity,
    util::print::Sink,
};

use super::{
    ledger::{Ledger, SlotIndex},
    raw::RawAllocator,
};

/// Everything the interposer needs, in one place. The preload build keeps
/// exactly one of these in a static (see `externc`); tests build their own.
///
/// `T` is the thread limit: the ledger has `T` slots, and a thread whose
/// index is `T` or more is fatal.
pub struct Tracker<'a, A, I, const T: usize> {
    allocator: A,
    identity: I,
    ledger: Ledger<T>,
    logger: Logger<'a>,
    capturer: StackCapturer,
    config: Config,
}

impl<'a, A, I, const T: usize> Tracker<'a, A, I, T>
where
    A: RawAllocator,
    I: ThreadIdentity,
{
    pub fn new(allocator: A, identity: I, sink: &'a dyn Sink, config: Config) -> Self {
        Self {
            allocator,
            identity,
            ledger: Ledger::new(),
            logger: Logger::new(sink, config.prefix),
            capturer: StackCapturer::new(config.frame_limit()),
            config,
        }
    }

    /// Leave the frames of `entry_points` (and everything they call) out of
    /// stack traces
    pub fn skipping_frames_through(mut self, entry_points: [usize; 2]) -> Self {
        self.capturer = self.capturer.skipping_through(entry_points);
        self
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn ledger(&self) -> &Ledger<T> {
        &self.ledger
    }

    pub fn logger(&self) -> &Logger<'a> {
        &self.logger
    }

    /// The calling thread's slot, or bound-exceeded
    pub fn current_slot(&self) -> Result<SlotIndex, Fatal> {
        self.ledger.slot(self.identity.current_index())
    }

    /// Live bytes attributed to the calling thread
    pub fn current_usage(&self) -> Result<usize, Fatal> {
        self.current_slot().map(|slot| self.ledger.read(slot))
    }

    fn tag(slot: SlotIndex) -> ThreadTag {
        ThreadTag {
            index: slot.get(),
            total: T,
        }
    }

    fn trace(&self, enabled: bool) -> Option<&StackCapturer> {
        enabled.then_some(&self.capturer)
    }

    /// `malloc()`, accounted and logged. The returned pointer is exactly what
    /// the real allocator returned, null included.
    ///
    /// # Safety
    ///
    /// Same contract as `malloc()`
    pub unsafe fn allocate(&self, requested_size: usize) -> Result<*mut c_void, Fatal> {
        let slot = self.current_slot()?;
        let address = self.allocator.allocate(requested_size);

        // A failed allocation is still worth a line, but there is no block to
        // measure and nothing to credit.
        let usable_size = if address.is_null() {
            0
        } else {
            self.allocator.usable_size(address)
        };
        let used = if address.is_null() {
            self.ledger.read(slot)
        } else {
            self.ledger.credit(slot, usable_size)
        };

        let event = AllocationEvent {
            op: Op::Malloc,
            address,
            requested_size,
            usable_size,
            thread: Self::tag(slot),
        };
        self.logger.event(
            &event,
            used,
            self.trace(self.config.trace_on_alloc && !address.is_null()),
        );
        Ok(address)
    }

    /// `free()`, accounted and logged. Null is a no-op, as `free()` promises.
    ///
    /// # Safety
    ///
    /// Same contract as `free()`
    pub unsafe fn release(&self, address: *mut c_void) -> Result<(), Fatal> {
        if address.is_null() {
            return Ok(());
        }
        let slot = self.current_slot()?;
        // has to be measured while the block is still ours
        let usable_size = self.allocator.usable_size(address);
        self.allocator.release(address);
        let used = self.ledger.debit(slot, usable_size);

        let event = AllocationEvent {
            op: Op::Free,
            address,
            requested_size: usable_size,
            usable_size,
            thread: Self::tag(slot),
        };
        self.logger
            .event(&event, used, self.trace(self.config.trace_on_release));
        Ok(())
    }

    /// A free-form diagnostic line for the calling thread
    pub fn log(&self, args: fmt::Arguments<'_>) -> Result<(), Fatal> {
        let slot = self.current_slot()?;
        self.logger
            .log(Self::tag(slot), self.ledger.read(slot), args);
        Ok(())
    }
}
