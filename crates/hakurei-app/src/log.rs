//! Logging setup.
//!
//! Output goes to stderr through a [`SuspendableWriter`] so the monitor can
//! hold its own messages back while the application owns the terminal.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

const DEFAULT_FILTER: &str = "hakurei=info";
const VERBOSE_FILTER: &str = "hakurei=debug";

#[derive(Debug, Default)]
struct Inner {
    suspended: bool,
    buf: Vec<u8>,
}

/// A stderr writer that buffers while suspended.
#[derive(Debug, Clone, Default)]
pub struct SuspendableWriter {
    inner: Arc<Mutex<Inner>>,
}

impl SuspendableWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panic mid-write leaves the buffer usable
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hold output back until [`resume`](Self::resume). Returns `false` if
    /// already suspended.
    pub fn suspend(&self) -> bool {
        let mut inner = self.lock();
        !std::mem::replace(&mut inner.suspended, true)
    }

    /// Flush held output to stderr. Returns `false` if not suspended.
    pub fn resume(&self) -> io::Result<bool> {
        let mut inner = self.lock();
        if !std::mem::replace(&mut inner.suspended, false) {
            return Ok(false);
        }
        let buf = std::mem::take(&mut inner.buf);
        io::stderr().write_all(&buf)?;
        Ok(true)
    }

    fn write_into(&self, buf: &[u8], out: &mut impl Write) -> io::Result<usize> {
        let mut inner = self.lock();
        if inner.suspended {
            inner.buf.extend_from_slice(buf);
            Ok(buf.len())
        } else {
            drop(inner);
            out.write(buf)
        }
    }
}

impl Write for SuspendableWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_into(buf, &mut io::stderr())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

impl<'a> MakeWriter<'a> for SuspendableWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init(verbose: bool, writer: SuspendableWriter) {
    let default = if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .without_time()
        .with_target(false)
        .with_writer(writer)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspend_buffers() {
        let w = SuspendableWriter::new();
        let mut out = Vec::new();
        w.write_into(b"direct ", &mut out).unwrap();
        assert_eq!(out, b"direct ");

        assert!(w.suspend());
        assert!(!w.suspend());
        w.write_into(b"held", &mut out).unwrap();
        assert_eq!(out, b"direct ");
        assert_eq!(w.lock().buf, b"held");

        assert!(w.resume().unwrap());
        assert!(w.lock().buf.is_empty());
        assert!(!w.resume().unwrap());
    }

    #[test]
    fn clones_share_state() {
        let w = SuspendableWriter::new();
        let c = w.make_writer();
        w.suspend();
        c.write_into(b"x", &mut Vec::new()).unwrap();
        assert_eq!(w.lock().buf, b"x");
        w.resume().unwrap();
    }
}
