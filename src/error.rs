use std::{
    ffi::{c_char, CStr},
    fmt, str,
};

/// Conditions that leave the interposer with no trustworthy state. Both end
/// the process: see `externc::fatal()`.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Fatal {
    #[error("error in `dlsym` for `{symbol}`: {reason}")]
    ResolverFailure {
        symbol: &'static str,
        reason: DlErrorText,
    },
    #[error(
        "memtrack built with insufficient thread support \
         (thread index {index}, MAX_THREADS={limit})"
    )]
    BoundExceeded { index: usize, limit: usize },
}

/// A copy of the `dlerror()` message. The string libdl hands out is only
/// valid until the next `dl*` call, and we can't allocate to keep it, so it
/// gets truncated into an inline buffer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DlErrorText {
    buf: [u8; Self::CAPACITY],
    len: usize,
}

impl DlErrorText {
    pub const CAPACITY: usize = 160;

    /// Take whatever `dlerror()` currently reports
    pub fn take() -> Self {
        // SAFETY: `dlerror()` returns either null or a nul-terminated string
        //         that stays valid until the next call into libdl.
        unsafe { Self::from_ptr(libc::dlerror()) }
    }

    /// # Safety
    ///
    /// `msg` must be null or point to a nul-terminated string.
    pub unsafe fn from_ptr(msg: *const c_char) -> Self {
        if msg.is_null() {
            return Self::from_bytes(b"symbol not found");
        }
        Self::from_bytes(CStr::from_ptr(msg).to_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; Self::CAPACITY];
        let len = bytes.len().min(Self::CAPACITY);
        buf[..len].copy_from_slice(&bytes[..len]);
        Self { buf, len }
    }

    pub fn as_str(&self) -> &str {
        let bytes = &self.buf[..self.len];
        match str::from_utf8(bytes) {
            Ok(s) => s,
            // truncation may have split a code point
            Err(e) => str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or_default(),
        }
    }
}

impl fmt::Display for DlErrorText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for DlErrorText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}
