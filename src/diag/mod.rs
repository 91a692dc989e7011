//! The diagnostic stream: event lines, human-readable sizes and stack traces.

pub mod logger;
pub mod stack;
pub mod units;
