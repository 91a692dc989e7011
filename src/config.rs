//! Compile-time configuration. The constants are generated by `build.rs` from
//! the `MEMTRACK_*` environment variables at build time; nothing is read at
//! runtime.

mod build {
    include!(concat!(env!("OUT_DIR"), "/config.rs"));
}

pub use build::{MAX_FRAMES, MAX_THREADS, PREFIX, TRACE_ON_ALLOC, TRACE_ON_RELEASE};

/// Value-level view of the configuration, so a [`Tracker`] can be built with
/// something other than the build constants (which is what the tests do).
///
/// The thread limit is not here: it sizes the ledger, so it is a const
/// generic on [`Tracker`] instead.
///
/// [`Tracker`]: crate::alloc::tracker::Tracker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Prepended to every line of the diagnostic stream
    pub prefix: &'static str,
    /// Upper bound on captured frames, clamped to [`MAX_FRAMES`]
    pub max_frames: usize,
    pub trace_on_alloc: bool,
    pub trace_on_release: bool,
}

impl Config {
    pub const BUILD: Config = Config {
        prefix: PREFIX,
        max_frames: MAX_FRAMES,
        trace_on_alloc: TRACE_ON_ALLOC,
        trace_on_release: TRACE_ON_RELEASE,
    };

    /// The number of frames the capturer will actually collect
    pub fn frame_limit(&self) -> usize {
        self.max_frames.min(MAX_FRAMES)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::BUILD
    }
}
