//! Everything between the caller and the real heap.

pub mod bootstrap;
#[cfg(all(feature = "preload", not(test)))]
pub mod global;
pub mod ledger;
pub mod raw;
pub mod tracker;
