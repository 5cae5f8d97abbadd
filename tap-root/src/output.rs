// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Writing to an output stream whose reader may go away.
//!
//! TAP output is commonly piped into another program (`| head`, a reporter, a parent runner). If
//! that reader exits early, every later write fails with a broken pipe. That is not a failure of
//! the test run, so [`EpipeGuard`] swallows it.

use debug_ignore::DebugIgnore;
use std::io::{self, Write};
use tracing::debug;

/// A writer that discards broken-pipe errors from the destination it wraps.
///
/// Once a broken pipe is seen the destination is treated as disconnected: later writes are
/// discarded without touching it. Every other error is returned unchanged.
#[derive(Debug)]
pub struct EpipeGuard<W> {
    inner: W,
    disconnected: bool,
}

impl<W: Write> EpipeGuard<W> {
    /// Wraps a destination.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            disconnected: false,
        }
    }

    /// Returns true if the reader has gone away.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Handles an error raised by the destination.
    ///
    /// Returns `Ok(false)` if the error was a broken pipe and has been suppressed, and `Err` with
    /// the original error otherwise.
    pub fn emit_error(&mut self, error: io::Error) -> io::Result<bool> {
        if error.kind() == io::ErrorKind::BrokenPipe {
            if !self.disconnected {
                debug!("output reader disconnected, discarding further output");
            }
            self.disconnected = true;
            Ok(false)
        } else {
            Err(error)
        }
    }
}

impl<W: Write> Write for EpipeGuard<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.disconnected {
            return Ok(buf.len());
        }
        match self.inner.write(buf) {
            Ok(n) => Ok(n),
            Err(error) => self.emit_error(error).map(|_| buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.disconnected {
            return Ok(());
        }
        match self.inner.flush() {
            Ok(()) => Ok(()),
            Err(error) => self.emit_error(error).map(|_| ()),
        }
    }
}

/// Where the root's output goes.
pub enum OutputTarget {
    /// The process's real standard output. Attaching it registers the root with the process.
    Stdout,

    /// Any other destination.
    Writer(Box<dyn Write + Send>),
}

impl OutputTarget {
    /// Returns true if this is the process's standard output.
    pub fn is_stdout(&self) -> bool {
        matches!(self, Self::Stdout)
    }

    pub(crate) fn into_destination(self) -> Destination {
        match self {
            Self::Stdout => Destination::Stdout(io::stdout()),
            Self::Writer(writer) => Destination::Writer(DebugIgnore(writer)),
        }
    }
}

impl std::fmt::Debug for OutputTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => f.write_str("Stdout"),
            Self::Writer(_) => f.write_str("Writer(..)"),
        }
    }
}

/// An attached destination, before it is wrapped in an [`EpipeGuard`].
#[derive(Debug)]
pub(crate) enum Destination {
    Stdout(io::Stdout),
    Writer(DebugIgnore<Box<dyn Write + Send>>),
}

impl Write for Destination {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Stdout(stdout) => stdout.write(buf),
            Self::Writer(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Stdout(stdout) => stdout.flush(),
            Self::Writer(writer) => writer.flush(),
        }
    }
}
