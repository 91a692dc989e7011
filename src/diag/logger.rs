use std::{
    ffi::c_void,
    fmt::{self, Write},
};

use crate::{
    futex_lock::FutexLock,
    util::print::{Sink, StackBuf},
};

use super::{stack::StackCapturer, units::HumanSize};

/// Longest event line we print; anything past it is clipped
const LINE: usize = 256;

/// `thread <index + 1>/<total>`, the thread part of every line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadTag {
    pub index: usize,
    pub total: usize,
}

impl fmt::Display for ThreadTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread {}/{}", self.index + 1, self.total)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Malloc,
    Free,
}

impl Op {
    pub const fn name(self) -> &'static str {
        match self {
            Op::Malloc => "malloc",
            Op::Free => "free",
        }
    }
}

/// One interposed call, for as long as it takes to account and print it
#[derive(Clone, Copy, Debug)]
pub struct AllocationEvent {
    pub op: Op,
    pub address: *mut c_void,
    pub requested_size: usize,
    pub usable_size: usize,
    pub thread: ThreadTag,
}

impl AllocationEvent {
    /// What goes after the `|`: what the caller asked for on the way in, what
    /// the heap actually gave back on the way out
    fn delta(&self) -> (char, usize) {
        match self.op {
            Op::Malloc => ('+', self.requested_size),
            Op::Free => ('-', self.usable_size),
        }
    }
}

/// Writes the diagnostic stream. One lock covers an event line *and* its
/// stack trace, so two threads' output never interleaves.
pub struct Logger<'a> {
    sink: &'a dyn Sink,
    prefix: &'static str,
    lock: FutexLock,
}

impl<'a> Logger<'a> {
    pub const fn new(sink: &'a dyn Sink, prefix: &'static str) -> Self {
        Self {
            sink,
            prefix,
            lock: FutexLock::new(),
        }
    }

    /// `<prefix>[thread i/T] (used= <human>): <args>`. The newline, if any,
    /// comes from `args`.
    pub fn log(&self, tag: ThreadTag, used: usize, args: fmt::Arguments<'_>) {
        let _guard = self.lock.lock();
        self.write_line(tag, used, args);
    }

    fn write_line(&self, tag: ThreadTag, used: usize, args: fmt::Arguments<'_>) {
        let mut line = StackBuf::<LINE>::new();
        _ = write!(
            line,
            "{}[{tag}] (used= {}): {args}",
            self.prefix,
            HumanSize::from_bytes(used)
        );
        line.restore_newline();
        line.flush_to(self.sink);
    }

    /// The line for one allocation or release, followed by a stack trace when
    /// `trace` is given. `used` is the thread's ledger value after the event.
    pub fn event(&self, event: &AllocationEvent, used: usize, trace: Option<&StackCapturer>) {
        let (sign, bytes) = event.delta();
        let _guard = self.lock.lock();
        self.write_line(
            event.thread,
            used,
            format_args!(
                "{:>6} @ {:p} | {sign}{bytes}B\n",
                event.op.name(),
                event.address
            ),
        );
        if let Some(capturer) = trace {
            capturer.capture_and_print(self.sink, self.prefix, event.thread);
        }
    }

    /// Last words before the process goes down
    pub fn error(&self, err: &dyn fmt::Display) {
        let _guard = self.lock.lock();
        let mut line = StackBuf::<LINE>::new();
        _ = writeln!(line, "{} error: {err}", self.prefix);
        line.restore_newline();
        line.flush_to(self.sink);
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;

    use super::*;
    use crate::{diag::stack::TRACE_FOOTER, util::print::capture::Capture};

    const TAG: ThreadTag = ThreadTag { index: 0, total: 4 };

    fn event(op: Op, address: usize, requested_size: usize, usable_size: usize) -> AllocationEvent {
        AllocationEvent {
            op,
            address: address as *mut c_void,
            requested_size,
            usable_size,
            thread: TAG,
        }
    }

    #[test]
    fn malloc_line_shows_the_request() {
        let sink = Capture::default();
        let logger = Logger::new(&sink, "MEMTRACKER");
        logger.event(&event(Op::Malloc, 0x1000, 10, 24), 1500, None);
        assert_eq!(
            sink.text(),
            "MEMTRACKER[thread 1/4] (used=    1.5K): malloc @ 0x1000 | +10B\n"
        );
    }

    #[test]
    fn free_line_shows_the_usable_size() {
        let sink = Capture::default();
        let logger = Logger::new(&sink, "MT");
        logger.event(&event(Op::Free, 0xbeef0, 10, 24), 0, None);
        assert_eq!(
            sink.text(),
            "MT[thread 1/4] (used=    0.0B):   free @ 0xbeef0 | -24B\n"
        );
    }

    #[test]
    fn newline_only_when_asked() {
        let sink = Capture::default();
        let logger = Logger::new(&sink, "P");
        logger.log(TAG, 999, format_args!("no newline"));
        logger.log(TAG, 1000, format_args!("newline\n"));
        assert_eq!(
            sink.chunks(),
            vec![
                "P[thread 1/4] (used=  999.0B): no newline".to_string(),
                "P[thread 1/4] (used=    1.0K): newline\n".to_string(),
            ]
        );
    }

    #[test]
    fn trace_follows_its_line() {
        let sink = Capture::default();
        let logger = Logger::new(&sink, "P");
        logger.event(
            &event(Op::Malloc, 0x10, 1, 24),
            24,
            Some(&StackCapturer::new(4)),
        );
        let lines = sink.lines();
        assert!(lines[0].ends_with("malloc @ 0x10 | +1B"));
        assert_eq!(lines[1], "==== P BACKTRACE (thread 1/4)");
        assert_eq!(lines.last().unwrap(), TRACE_FOOTER);
    }

    #[test]
    fn null_addresses_print() {
        let sink = Capture::default();
        let logger = Logger::new(&sink, "P");
        logger.event(&event(Op::Malloc, 0, 1 << 40, 0), 0, None);
        let expected = format!("malloc @ {:p} | +{}B", ptr::null::<c_void>(), 1u64 << 40);
        assert!(sink.text().contains(&expected));
    }

    #[test]
    fn error_line() {
        let sink = Capture::default();
        let logger = Logger::new(&sink, "P");
        logger.error(&"it broke");
        assert_eq!(sink.text(), "P error: it broke\n");
        assert!(!logger.lock.is_locked());
    }
}
