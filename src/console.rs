//! Console capture
//!
//! Writers handed out by [`ConsoleCapture`] pass everything through to the
//! wrapped stream and keep a copy. The copies are sent with the run when it
//! ends.
//!
//! A capture can also feed a tracing subscriber, since any
//! `Fn() -> impl Write` is a writer factory:
//!
//! ```no_run
//! use arcee::console::ConsoleCapture;
//!
//! let capture = ConsoleCapture::new();
//! let stderr = capture.clone();
//! tracing_subscriber::fmt()
//!     .with_writer(move || stderr.stderr())
//!     .init();
//! ```

use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

/// Which captured stream a writer feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Output,
    Error,
}

/// Captured text of both streams
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleOutput {
    pub output: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct ConsoleCapture {
    output: Arc<Mutex<Vec<u8>>>,
    error: Arc<Mutex<Vec<u8>>>,
}

impl ConsoleCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap `inner`, keeping a copy of what is written into `stream`
    pub fn tee<W: Write>(&self, stream: Stream, inner: W) -> TeeWriter<W> {
        let buffer = match stream {
            Stream::Output => &self.output,
            Stream::Error => &self.error,
        };
        TeeWriter {
            inner,
            buffer: Arc::clone(buffer),
        }
    }

    pub fn stdout(&self) -> TeeWriter<io::Stdout> {
        self.tee(Stream::Output, io::stdout())
    }

    pub fn stderr(&self) -> TeeWriter<io::Stderr> {
        self.tee(Stream::Error, io::stderr())
    }

    /// Everything captured so far
    pub fn snapshot(&self) -> ConsoleOutput {
        ConsoleOutput {
            output: String::from_utf8_lossy(&lock(&self.output)).into_owned(),
            error: String::from_utf8_lossy(&lock(&self.error)).into_owned(),
        }
    }
}

/// Writer that copies accepted bytes into a capture buffer
pub struct TeeWriter<W> {
    inner: W,
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl<W: Write> Write for TeeWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        lock(&self.buffer).extend_from_slice(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
