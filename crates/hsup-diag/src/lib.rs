//! Fixed-size ring buffer for diagnostic text.
//!
//! Similar in spirit to ordinary logging, but retention is bounded: records
//! are written into a fixed byte ring and old records are evicted as the
//! cursor wraps. The intended use is a cheap, always-on trace of supervisor
//! internals that can be dumped post-mortem when a deadly signal arrives.
//!
//! There is a process-global ring (see [`log`], [`contents`]) plus the
//! [`Diag`] type for private instances.

use std::fmt::Write as _;
use std::sync::Mutex;

use once_cell::sync::Lazy;

/// Default retention of the process-global ring, in bytes.
const DEFAULT_RETENTION: usize = 1024 * 1024;

static DEFAULT_DIAG: Lazy<Diag> = Lazy::new(|| Diag::new(DEFAULT_RETENTION));

/// Appends a record to the process-global ring.
pub fn log(record: impl AsRef<str>) {
    DEFAULT_DIAG.log(record.as_ref());
}

/// Appends a formatted record to the process-global ring.
pub fn logf(args: std::fmt::Arguments<'_>) {
    DEFAULT_DIAG.logf(args);
}

/// Returns the records currently retained by the process-global ring,
/// oldest first.
pub fn contents() -> Vec<String> {
    DEFAULT_DIAG.contents()
}

/// Formats and appends a record to the process-global diagnostic ring.
#[macro_export]
macro_rules! diag {
    ($($arg:tt)*) => {
        $crate::logf(::std::format_args!($($arg)*))
    };
}

struct Ring {
    buf: Vec<u8>,
    pos: usize,
}

/// A fixed-size diagnostic record ring.
///
/// Records are stored back to back, each terminated by a NUL byte. The
/// record ahead of the cursor is cleared after every write so a dump never
/// shows a half-evicted record.
pub struct Diag {
    inner: Mutex<Ring>,
}

impl Diag {
    /// Creates a ring retaining `retention` bytes.
    ///
    /// # Panics
    ///
    /// Panics when `retention` is zero; a ring that can hold nothing is a
    /// programming error, not a runtime condition.
    #[must_use]
    pub fn new(retention: usize) -> Self {
        assert!(
            retention > 0,
            "diag ring requires a positive retention size, got {retention}"
        );
        Self {
            inner: Mutex::new(Ring {
                buf: vec![0; retention],
                pos: 0,
            }),
        }
    }

    /// Appends one record.
    ///
    /// A record at least as large as the ring itself cannot be represented
    /// and is dropped in its entirety rather than stored truncated.
    pub fn log(&self, record: &str) {
        let mut ring = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if record.is_empty() || record.len() >= ring.buf.len() {
            return;
        }

        for &b in record.as_bytes() {
            let pos = ring.pos;
            ring.buf[pos] = b;
            ring.pos = (pos + 1) % ring.buf.len();
        }

        // Terminate the record.
        let pos = ring.pos;
        ring.buf[pos] = 0;
        ring.pos = (pos + 1) % ring.buf.len();

        // Clear the partial record ahead of the cursor so dumps never show
        // truncated output.
        let mut i = ring.pos;
        while ring.buf[i] != 0 {
            ring.buf[i] = 0;
            i = (i + 1) % ring.buf.len();
        }
    }

    /// Appends one formatted record.
    pub fn logf(&self, args: std::fmt::Arguments<'_>) {
        let mut s = String::new();
        let _ = s.write_fmt(args);
        self.log(&s);
    }

    /// Returns retained records, oldest first.
    ///
    /// The lock is held only long enough to copy the raw bytes.
    #[must_use]
    pub fn contents(&self) -> Vec<String> {
        let (buf, pos) = {
            let ring = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            (ring.buf.clone(), ring.pos)
        };

        let mut out = Vec::new();
        let mut accum = Vec::new();
        let mut i = pos;
        loop {
            if buf[i] == 0 {
                if !accum.is_empty() {
                    out.push(String::from_utf8_lossy(&accum).into_owned());
                    accum.clear();
                }
            } else {
                accum.push(buf[i]);
            }

            i = (i + 1) % buf.len();
            if i == pos {
                break;
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity() {
        let dg = Diag::new(10);
        dg.log("hi");
        assert_eq!(dg.contents(), vec!["hi".to_string()]);

        dg.log("hello");
        assert_eq!(dg.contents(), vec!["hi".to_string(), "hello".to_string()]);

        dg.log("evict");
        assert_eq!(dg.contents(), vec!["evict".to_string()]);
    }

    #[test]
    fn too_long_records_are_dropped() {
        let dg = Diag::new(1);
        dg.log("hi");
        assert!(dg.contents().is_empty());
    }

    #[test]
    #[should_panic(expected = "positive retention")]
    fn zero_retention_panics() {
        let _ = Diag::new(0);
    }

    #[test]
    fn empty_records_are_not_representable() {
        let dg = Diag::new(1);
        dg.log("");
        assert!(dg.contents().is_empty());
    }

    #[test]
    fn formatted_records() {
        let dg = Diag::new(1024);
        dg.logf(format_args!("{} {} {:?}", "hello", 1, None::<u8>));
        assert_eq!(dg.contents(), vec!["hello 1 None".to_string()]);
    }

    #[test]
    fn multi_byte() {
        let dg = Diag::new(1);
        dg.log("世界");
        assert!(dg.contents().is_empty());

        let dg = Diag::new(100);
        dg.log("世界");
        dg.log("日本語");
        dg.log("ascii");
        assert_eq!(
            dg.contents(),
            vec![
                "世界".to_string(),
                "日本語".to_string(),
                "ascii".to_string()
            ]
        );
    }

    #[test]
    fn global_ring_macro() {
        diag!("answer {}", 42);
        assert!(contents().iter().any(|r| r == "answer 42"));
    }
}
