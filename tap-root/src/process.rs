// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Effects on the surrounding process.
//!
//! The driver never touches the exit status, the error stream or the process's own signal
//! disposition directly. It goes through [`ProcessControl`], so that tests can observe those
//! effects instead of being killed by them.

use crate::signal::TimeoutSignal;
use std::{
    io::{self, Write},
    sync::atomic::{AtomicI32, Ordering},
};

/// Operations the root performs on the process it runs in.
pub trait ProcessControl {
    /// Records the status the process should exit with once it runs out of work.
    fn set_exit_code(&self, code: i32);

    /// Returns the status most recently passed to [`set_exit_code`](Self::set_exit_code), or 0.
    fn exit_code(&self) -> i32;

    /// Terminates the process immediately.
    fn exit(&self, code: i32);

    /// Restores the default disposition of `signal` and sends it to this process.
    ///
    /// If this returns `Ok`, the process is normally gone before the caller gets to run again.
    fn raise_timeout_signal(&self, signal: TimeoutSignal) -> io::Result<()>;

    /// Writes a line to the process's error stream.
    fn report_error(&self, line: &str);
}

/// The [`ProcessControl`] implementation for a real process.
#[derive(Debug, Default)]
pub struct StandardProcess {
    exit_code: AtomicI32,
}

impl StandardProcess {
    /// Creates a new `StandardProcess` with an exit status of 0.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessControl for StandardProcess {
    fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
    }

    fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }

    fn exit(&self, code: i32) {
        std::process::exit(code)
    }

    fn raise_timeout_signal(&self, signal: TimeoutSignal) -> io::Result<()> {
        imp::raise(signal)
    }

    fn report_error(&self, line: &str) {
        // Nothing useful can be done if stderr is gone too.
        _ = writeln!(io::stderr().lock(), "{line}");
    }
}

#[cfg(unix)]
mod imp {
    use super::*;
    use nix::sys::signal::{self, SigHandler, Signal};

    pub(super) fn raise(signal: TimeoutSignal) -> io::Result<()> {
        let signal = Signal::try_from(signal.as_raw())?;
        // SAFETY: the default disposition is not a Rust function, so no handler code can run at an
        // unexpected point.
        unsafe { signal::signal(signal, SigHandler::SigDfl) }?;
        signal::raise(signal)?;
        Ok(())
    }
}

#[cfg(not(unix))]
mod imp {
    use super::*;

    pub(super) fn raise(signal: TimeoutSignal) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("cannot send {} on this platform", signal.name()),
        ))
    }
}
