//! Shared, cloneable sink for provisioning output.
//!
//! Provisioning streams container and command output to the user through a
//! `LogWriter`. Several tasks write concurrently (the log tail of a clone
//! container and the clone command itself), so the underlying writer sits
//! behind a mutex and every write is a whole line.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct LogWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl LogWriter {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// A writer that discards everything.
    pub fn sink() -> Self {
        Self::new(io::sink())
    }

    /// Append to a log file, creating it and its parent directory if needed.
    pub fn to_file(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file: File = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(file))
    }

    /// A writer backed by an in-memory buffer, returned alongside a handle to read it.
    pub fn capture() -> (Self, CapturedLog) {
        let buffer = CapturedLog::default();
        (Self::new(buffer.clone()), buffer)
    }

    pub fn write_line(&self, line: &str) {
        // A poisoned lock only means another writer panicked mid-line.
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(guard, "{line}") {
            tracing::debug!("Dropping log line: {}", e);
        }
    }
}

impl fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogWriter").finish_non_exhaustive()
    }
}

/// In-memory log buffer used by `LogWriter::capture`.
#[derive(Clone, Default)]
pub struct CapturedLog {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLog {
    pub fn contents(&self) -> String {
        let guard = match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        String::from_utf8_lossy(&guard).into_owned()
    }
}

impl Write for CapturedLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
