//! Live bytes per thread slot.
//!
//! Each slot is only written by the thread that currently owns its index, so
//! there is no locking. The counters are still atomics (updated `Relaxed`) so
//! that the short overlap between a dying thread's last `free()` and a new
//! thread inheriting its index is a misattribution rather than a data race.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::Fatal;

/// A thread index that has been checked against the ledger's capacity. The
/// only way to touch a slot is through one of these, so a bad index can't get
/// past [`Ledger::slot()`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotIndex(usize);

impl SlotIndex {
    pub const fn get(self) -> usize {
        self.0
    }
}

pub struct Ledger<const T: usize> {
    live_bytes: [AtomicUsize; T],
}

impl<const T: usize> Ledger<T> {
    pub const fn new() -> Self {
        Self {
            live_bytes: [const { AtomicUsize::new(0) }; T],
        }
    }

    /// Bound-check a thread index. Everything past `T` is fatal: there is no
    /// slot to put it in.
    pub fn slot(&self, index: usize) -> Result<SlotIndex, Fatal> {
        if index < T {
            Ok(SlotIndex(index))
        } else {
            Err(Fatal::BoundExceeded { index, limit: T })
        }
    }

    /// `live_bytes += delta`, returning the new value. Wraps rather than
    /// panicking: releasing a block we never saw allocated (libc's own
    /// `calloc()`s, say) can legitimately drive a slot below zero.
    pub fn adjust(&self, slot: SlotIndex, delta: isize) -> usize {
        let counter = &self.live_bytes[slot.0];
        let prev = counter.fetch_add(delta as usize, Ordering::Relaxed);
        prev.wrapping_add(delta as usize)
    }

    pub fn credit(&self, slot: SlotIndex, bytes: usize) -> usize {
        self.adjust(slot, bytes as isize)
    }

    pub fn debit(&self, slot: SlotIndex, bytes: usize) -> usize {
        self.adjust(slot, (bytes as isize).wrapping_neg())
    }

    pub fn read(&self, slot: SlotIndex) -> usize {
        self.live_bytes[slot.0].load(Ordering::Relaxed)
    }

    /// Sum over every slot (wrapping, like the slots themselves)
    pub fn total(&self) -> usize {
        self.live_bytes
            .iter()
            .fold(0usize, |acc, slot| acc.wrapping_add(slot.load(Ordering::Relaxed)))
    }
}

impl<const T: usize> Default for Ledger<T> {
    fn default() -> Self {
        Self::new()
    }
}
