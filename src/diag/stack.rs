//! Call stacks at allocation time.
//!
//! Return addresses are collected into an array on the stack. Symbolization
//! is left to the `backtrace` crate, whose caches live on the Rust heap, and
//! in a preload build the Rust heap is the real allocator (see
//! `alloc::global`), so none of this comes back through `malloc()`.

use std::{ffi::c_void, fmt::Write, ptr};

use crate::{
    config::MAX_FRAMES,
    util::print::{Sink, StackBuf},
};

use super::logger::ThreadTag;

/// Big enough for a mangled-then-demangled C++ name plus a path
const FRAME_LINE: usize = 512;

/// How deep we look for an entry point before giving up and keeping the
/// whole stack
const ENTRY_SEARCH_DEPTH: usize = 32;

pub const TRACE_FOOTER: &str = "===============================";
pub const EMPTY_TRACE: &str = "error: empty back trace";

/// One captured frame. Both addresses are runtime addresses, so their
/// difference is the offset into the function whatever the load bias.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameAddr {
    pub ip: *mut c_void,
    /// Start of the enclosing function, as the unwinder sees it (null if
    /// unknown)
    pub symbol_address: *mut c_void,
}

impl FrameAddr {
    pub const NULL: FrameAddr = FrameAddr {
        ip: ptr::null_mut(),
        symbol_address: ptr::null_mut(),
    };

    fn of(frame: &backtrace::Frame) -> Self {
        Self {
            ip: frame.ip(),
            symbol_address: frame.symbol_address(),
        }
    }

    fn offset(&self) -> Option<usize> {
        let (ip, start) = (self.ip as usize, self.symbol_address as usize);
        (start != 0 && start <= ip).then(|| ip - start)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackCapturer {
    max_frames: usize,
    /// Function addresses whose frame, and everything inside it, is left
    /// out of a trace. Zero means unset.
    entry_points: [usize; 2],
}

impl StackCapturer {
    /// At most `max_frames` frames per trace, never more than [`MAX_FRAMES`]
    pub fn new(max_frames: usize) -> Self {
        Self {
            max_frames: max_frames.min(MAX_FRAMES),
            entry_points: [0; 2],
        }
    }

    /// Start traces at the caller of whichever of `entry_points` is found
    /// on the stack (the exported `malloc` and `free`, in a preload build).
    pub fn skipping_through(self, entry_points: [usize; 2]) -> Self {
        Self {
            entry_points,
            ..self
        }
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    fn is_entry_point(&self, frame: &FrameAddr) -> bool {
        let start = frame.symbol_address as usize;
        start != 0 && self.entry_points.contains(&start)
    }

    /// Snapshot up to `max_frames` frames, innermost first. Returns how many
    /// were written.
    pub fn capture(&self, frames: &mut [FrameAddr; MAX_FRAMES]) -> usize {
        let mut scratch = [FrameAddr::NULL; MAX_FRAMES + ENTRY_SEARCH_DEPTH];
        let mut len = 0;
        // index of the first frame we keep; 0 until an entry point is seen
        let mut start = 0;
        backtrace::trace(|frame| {
            let addr = FrameAddr::of(frame);
            scratch[len] = addr;
            len += 1;
            if start == 0 && len <= ENTRY_SEARCH_DEPTH && self.is_entry_point(&addr) {
                start = len;
            }
            let searching = start == 0 && len < ENTRY_SEARCH_DEPTH;
            len < scratch.len() && (searching || len - start < self.max_frames)
        });
        let kept = &scratch[start.min(len)..len];
        let kept = &kept[..kept.len().min(self.max_frames)];
        frames[..kept.len()].copy_from_slice(kept);
        kept.len()
    }

    /// Capture the current stack and print it as a framed block
    pub fn capture_and_print(&self, sink: &dyn Sink, prefix: &str, tag: ThreadTag) {
        let mut frames = [FrameAddr::NULL; MAX_FRAMES];
        let len = self.capture(&mut frames);
        print_frames(sink, prefix, tag, &frames[..len]);
    }
}

/// ```plaintext
/// ==== MEMTRACKER BACKTRACE (thread 1/64)
/// #0  0x55d0c1b2e4d7 threads::main::{{closure}}+0x47 at demos/threads.rs:20
/// ...
/// ===============================
/// ```
pub fn print_frames(sink: &dyn Sink, prefix: &str, tag: ThreadTag, frames: &[FrameAddr]) {
    let mut line = StackBuf::<FRAME_LINE>::new();
    _ = writeln!(line, "==== {prefix} BACKTRACE ({tag})");
    line.flush_to(sink);
    if frames.is_empty() {
        _ = writeln!(line, "{EMPTY_TRACE}");
        line.flush_to(sink);
    }
    for (n, frame) in frames.iter().enumerate() {
        write_frame(&mut line, n, frame);
        line.flush_to(sink);
    }
    _ = writeln!(line, "{TRACE_FOOTER}");
    line.flush_to(sink);
}

fn write_frame<const N: usize>(line: &mut StackBuf<N>, n: usize, frame: &FrameAddr) {
    _ = write!(line, "#{n:<3} {:p}", frame.ip);
    let mut resolved = false;
    backtrace::resolve(frame.ip, |symbol| {
        // inlined frames resolve to several symbols, the first is the
        // innermost
        if resolved {
            return;
        }
        resolved = true;
        match symbol.name() {
            Some(name) => {
                _ = write!(line, " {name}");
            }
            None => {
                _ = write!(line, " <unknown>");
            }
        }
        if let Some(offset) = frame.offset() {
            _ = write!(line, "+{offset:#x}");
        }
        if let (Some(file), Some(lineno)) = (symbol.filename(), symbol.lineno()) {
            _ = write!(line, " at {}:{lineno}", file.display());
        }
    });
    if !resolved {
        _ = write!(line, " <unknown>");
    }
    _ = writeln!(line);
    line.restore_newline();
}
