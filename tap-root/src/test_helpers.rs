// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fakes shared by the unit tests in this crate.

use crate::{
    aggregate::{Aggregate, EndMarker, FinalResults},
    diagnostic::TimeoutDiagnostic,
    process::ProcessControl,
    signal::TimeoutSignal,
};
use std::{
    io::{self, Write},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

/// An in-memory destination that can be inspected while something else owns a clone of it.
#[derive(Clone, Debug, Default)]
pub(crate) struct SharedBuffer {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub(crate) fn contents(&self) -> String {
        String::from_utf8(self.buf.lock().unwrap().clone()).expect("output is valid UTF-8")
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A destination on which every write fails with the same error kind.
#[derive(Clone, Debug)]
pub(crate) struct FailingWriter {
    kind: io::ErrorKind,
    attempts: Arc<AtomicUsize>,
}

impl FailingWriter {
    pub(crate) fn new(kind: io::ErrorKind) -> Self {
        Self {
            kind,
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The number of writes that reached this destination.
    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Write for FailingWriter {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(io::Error::from(self.kind))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A scripted aggregate. Clones share state, so a test can keep one while the driver owns another.
#[derive(Clone, Debug, Default)]
pub(crate) struct FakeAggregate {
    state: Arc<Mutex<FakeState>>,
}

#[derive(Debug)]
pub(crate) struct FakeState {
    pub(crate) idle: bool,
    pub(crate) results: Option<FinalResults>,
    /// Results produced as soon as `end` is called.
    pub(crate) results_on_end: Option<FinalResults>,
    /// Results produced as soon as `end_all` is called.
    pub(crate) results_on_end_all: Option<FinalResults>,
    /// Results produced as soon as a timeout is reported.
    pub(crate) results_on_timeout: Option<FinalResults>,
    pub(crate) supports_timeout: bool,
    pub(crate) elapsed: Duration,

    pub(crate) ends: Vec<EndMarker>,
    pub(crate) end_all_calls: usize,
    pub(crate) timeouts: Vec<TimeoutDiagnostic>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            idle: false,
            results: None,
            results_on_end: None,
            results_on_end_all: None,
            results_on_timeout: None,
            supports_timeout: true,
            elapsed: Duration::ZERO,
            ends: Vec::new(),
            end_all_calls: 0,
            timeouts: Vec::new(),
        }
    }
}

impl FakeAggregate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }
}

impl Aggregate for FakeAggregate {
    fn is_idle(&self) -> bool {
        self.state().idle
    }

    fn results(&self) -> Option<FinalResults> {
        self.state().results
    }

    fn end(&mut self, marker: EndMarker) {
        let mut state = self.state();
        state.ends.push(marker);
        if let Some(results) = state.results_on_end {
            state.results.get_or_insert(results);
        }
    }

    fn end_all(&mut self) {
        let mut state = self.state();
        state.end_all_calls += 1;
        if let Some(results) = state.results_on_end_all {
            state.results.get_or_insert(results);
        }
    }

    fn supports_timeout(&self) -> bool {
        self.state().supports_timeout
    }

    fn report_timeout(&mut self, diagnostic: TimeoutDiagnostic) {
        let mut state = self.state();
        state.timeouts.push(diagnostic);
        if let Some(results) = state.results_on_timeout {
            state.results.get_or_insert(results);
        }
    }

    fn elapsed(&self) -> Duration {
        self.state().elapsed
    }
}

/// A [`ProcessControl`] that records what would have happened to the process.
#[derive(Clone, Debug, Default)]
pub(crate) struct RecordingProcess {
    state: Arc<Mutex<ProcessRecord>>,
}

#[derive(Debug, Default)]
pub(crate) struct ProcessRecord {
    pub(crate) exit_code: i32,
    pub(crate) exits: Vec<i32>,
    pub(crate) raised: Vec<TimeoutSignal>,
    pub(crate) errors: Vec<String>,
    /// Makes `raise_timeout_signal` fail, as it does on platforms without signals.
    pub(crate) fail_raise: bool,
}

impl RecordingProcess {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self) -> MutexGuard<'_, ProcessRecord> {
        self.state.lock().unwrap()
    }
}

impl ProcessControl for RecordingProcess {
    fn set_exit_code(&self, code: i32) {
        self.record().exit_code = code;
    }

    fn exit_code(&self) -> i32 {
        self.record().exit_code
    }

    fn exit(&self, code: i32) {
        self.record().exits.push(code);
    }

    fn raise_timeout_signal(&self, signal: TimeoutSignal) -> io::Result<()> {
        let mut record = self.record();
        if record.fail_raise {
            return Err(io::Error::from(io::ErrorKind::Unsupported));
        }
        record.raised.push(signal);
        Ok(())
    }

    fn report_error(&self, line: &str) {
        self.record().errors.push(line.to_owned());
    }
}
