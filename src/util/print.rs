//! Printing that never touches the heap. Everything written from inside the
//! interposer goes through here: lines are built with `core::fmt` in a
//! [`StackBuf`] and handed to a [`Sink`] in one piece.

use std::{fmt, str};

/// Somewhere to put finished lines of diagnostics
pub trait Sink: Sync {
    /// Write all of `bytes`, best effort. Diagnostics have nowhere to report
    /// their own failure, so errors are swallowed.
    fn write_all(&self, bytes: &[u8]);
}

/// `write(2)` straight to fd 2, with no buffering (and no allocation)
pub struct Stderr;

impl Sink for Stderr {
    fn write_all(&self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            // SAFETY: `bytes` is a valid slice for reads of `bytes.len()`
            let n = unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
            // SAFETY: errno is thread-local and always readable
            if n < 0 && unsafe { *libc::__errno_location() } == libc::EINTR {
                continue;
            }
            if n <= 0 {
                return;
            }
            bytes = &bytes[n as usize..];
        }
    }
}

/// A fixed-capacity, on-stack text buffer. Writes past the end are dropped
/// (and remembered in [`StackBuf::truncated()`]) rather than failing, because
/// a diagnostic with a clipped tail beats a `fmt::Error` we can't report.
pub struct StackBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
    truncated: bool,
}

impl<const N: usize> StackBuf<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
            truncated: false,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_str(&self) -> &str {
        match str::from_utf8(self.as_bytes()) {
            Ok(s) => s,
            Err(e) => str::from_utf8(&self.as_bytes()[..e.valid_up_to()]).unwrap_or_default(),
        }
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.truncated = false;
    }

    /// A truncated line has lost its trailing newline: overwrite the last
    /// character with one, so the next line still starts on its own.
    pub fn restore_newline(&mut self) {
        if !self.truncated || self.len == 0 {
            return;
        }
        let valid = self.as_str().len();
        let mut keep = valid.min(self.len - 1);
        while !self.as_str().is_char_boundary(keep) {
            keep -= 1;
        }
        self.buf[keep] = b'\n';
        self.len = keep + 1;
    }

    /// Hand the contents to `sink` and start again
    pub fn flush_to(&mut self, sink: &dyn Sink) {
        sink.write_all(self.as_bytes());
        self.clear();
    }
}

impl<const N: usize> Default for StackBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for StackBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = N - self.len;
        let n = if s.len() <= room {
            s.len()
        } else {
            self.truncated = true;
            room
        };
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod capture {
    use std::sync::Mutex;

    use super::Sink;

    /// Records every `write_all()` as its own chunk, so tests can check that
    /// lines were emitted whole.
    #[derive(Default)]
    pub struct Capture {
        chunks: Mutex<Vec<Vec<u8>>>,
    }

    impl Capture {
        pub fn chunks(&self) -> Vec<String> {
            self.chunks
                .lock()
                .unwrap()
                .iter()
                .map(|c| String::from_utf8_lossy(c).into_owned())
                .collect()
        }

        pub fn text(&self) -> String {
            self.chunks().concat()
        }

        pub fn lines(&self) -> Vec<String> {
            self.text().lines().map(str::to_string).collect()
        }
    }

    impl Sink for Capture {
        fn write_all(&self, bytes: &[u8]) {
            self.chunks.lock().unwrap().push(bytes.to_vec());
        }
    }
}
