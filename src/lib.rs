//! `memtrack`: preload it, and every `malloc()`/`free()` in the process is
//! passed to the real allocator, counted against the calling thread and
//! logged to stderr.
//!
//! ```plaintext
//! LD_PRELOAD=target/release/libmemtrack.so ./host
//! ```

pub mod alloc;
pub mod config;
pub mod diag;
pub mod error;
#[cfg(all(feature = "preload", not(test)))]
pub mod externc;
mod futex_lock;
mod lazy_lock;
pub mod thread;
pub mod util;

pub use alloc::tracker::Tracker;
pub use config::Config;
pub use error::Fatal;
