//! Line-oriented diagnostics on stderr.
//!
//! Everything here runs inside `malloc`/`free`, so nothing may allocate: lines
//! are formatted into a fixed stack buffer and handed to `write(2)` directly.

use core::fmt::{self, Write};

/// Prefix of every diagnostic line, for easy filtering.
pub const PREFIX: &str = "malloc_count ### ";

const LINE_CAPACITY: usize = 256;

/// A single diagnostic line, formatted on the stack. Output that does not fit
/// is truncated.
pub struct Line {
    buf: [u8; LINE_CAPACITY],
    len: usize,
}

impl Line {
    const fn new() -> Self {
        Self {
            buf: [0; LINE_CAPACITY],
            len: 0,
        }
    }

    /// Format `args` behind the prefix and terminate with a newline.
    pub fn format(args: fmt::Arguments<'_>) -> Self {
        let mut line = Self::new();
        // Truncation is the only failure mode, and a truncated line is fine.
        let _ = line.write_str(PREFIX);
        let _ = line.write_fmt(args);
        line.buf[line.len] = b'\n';
        line.len += 1;
        line
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    #[cfg(test)]
    fn as_str(&self) -> &str {
        // Truncation can split a multi-byte character, keep the valid prefix.
        match core::str::from_utf8(self.as_bytes()) {
            Ok(s) => s,
            Err(e) => {
                let valid = e.valid_up_to();
                core::str::from_utf8(&self.buf[..valid]).unwrap_or_default()
            }
        }
    }
}

impl Write for Line {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        // Keep one byte free for the newline.
        let room = LINE_CAPACITY - 1 - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        if n < s.len() {
            Err(fmt::Error)
        } else {
            Ok(())
        }
    }
}

/// Write one prefixed line to stderr.
pub fn emit(args: fmt::Arguments<'_>) {
    let line = Line::format(args);
    let bytes = line.as_bytes();
    let mut written = 0;
    while written < bytes.len() {
        // SAFETY: the pointer and length describe the initialized tail of
        // `bytes`, which outlives the call.
        let n = unsafe {
            libc::write(
                libc::STDERR_FILENO,
                bytes[written..].as_ptr() as *const libc::c_void,
                bytes.len() - written,
            )
        };
        if n <= 0 {
            return;
        }
        written += n as usize;
    }
}

/// Emit a diagnostic and terminate the process. Used when no allocator can
/// safely service the process any more.
#[cold]
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    emit(args);
    std::process::exit(libc::EXIT_FAILURE)
}

/// `format!`-style wrapper around [`emit`].
#[macro_export]
macro_rules! diag {
    ($($arg:tt)*) => {
        $crate::diag::emit(format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_is_prefixed_and_terminated() {
        let line = Line::format(format_args!("current {}, peak {}", 150, 200));
        assert_eq!(line.as_str(), "malloc_count ### current 150, peak 200\n");
    }

    #[test]
    fn long_line_is_truncated_but_still_terminated() {
        let long = "x".repeat(2 * LINE_CAPACITY);
        let line = Line::format(format_args!("{}", long));
        assert_eq!(line.as_bytes().len(), LINE_CAPACITY);
        assert!(line.as_str().starts_with(PREFIX));
        assert!(line.as_str().ends_with("x\n"));
    }
}
