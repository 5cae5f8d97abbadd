// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Detecting that a supervising process has timed this one out.
//!
//! A parent runner that enforces a time budget tells a child it has run out of time in one of two
//! ways:
//!
//! * On Unix, it sends `SIGALRM`.
//! * Where signals cannot be caught (Windows), or as an alternative, it writes a JSON message of
//!   the form `{"abortReason": "timeout"}` on a line of the IPC channel it shares with the child.
//!
//! Both paths end up as the same [`TimeoutSource`] event on the driver's control channel. The
//! tasks in this module do nothing but forward: the decision about what a timeout means is made
//! by the driver, which also makes sure that only the first timeout has any effect.

use crate::errors::{IpcChannelError, TimeoutBridgeSetupError};
use debug_ignore::DebugIgnore;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    sync::mpsc::UnboundedSender,
    task::JoinHandle,
};
use tracing::debug;

/// The kind of timeout signal handling to set up.
///
/// A `TimeoutHandlerKind` can be passed into
/// [`RootDriverBuilder::build`](crate::root::RootDriverBuilder::build).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TimeoutHandlerKind {
    /// Listen for the timeout signal on platforms that have one.
    Standard,

    /// Do not listen for signals. IPC messages are still handled. Useful for tests.
    Noop,
}

/// The OS signal a supervisor sends to report a timeout.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TimeoutSignal {
    /// `SIGALRM`.
    Alarm,
}

impl TimeoutSignal {
    /// Returns the conventional name of the signal.
    pub fn name(self) -> &'static str {
        match self {
            Self::Alarm => "SIGALRM",
        }
    }

    #[cfg(unix)]
    pub(crate) fn as_raw(self) -> libc::c_int {
        match self {
            Self::Alarm => libc::SIGALRM,
        }
    }
}

/// How a timeout was delivered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TimeoutSource {
    /// An OS signal.
    Signal(TimeoutSignal),

    /// A message on the IPC channel.
    Ipc,
}

impl TimeoutSource {
    /// Returns the signal, if the timeout was delivered as one.
    pub fn signal(self) -> Option<TimeoutSignal> {
        match self {
            Self::Signal(signal) => Some(signal),
            Self::Ipc => None,
        }
    }
}

/// An event sent to the driver from outside the aggregate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ControlEvent {
    /// The context was registered with the process.
    Registered,

    /// A supervisor reported a timeout.
    Timeout(TimeoutSource),
}

/// Ensures that only the first timeout is acted upon.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct TimeoutLatch {
    fired: bool,
}

impl TimeoutLatch {
    /// Sets the latch. Returns true only the first time.
    pub(crate) fn fire(&mut self) -> bool {
        !std::mem::replace(&mut self.fired, true)
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.fired
    }
}

/// A channel over which a parent process sends newline-delimited JSON messages.
#[derive(Debug)]
pub struct IpcChannel {
    source: IpcSource,
}

#[derive(Debug)]
enum IpcSource {
    Reader(DebugIgnore<Box<dyn AsyncRead + Send + Unpin>>),
    // Registered with the reactor once the bridge starts listening, which needs a runtime.
    #[cfg(unix)]
    Descriptor(std::os::fd::OwnedFd),
}

impl IpcChannel {
    /// Creates a channel from any reader.
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            source: IpcSource::Reader(DebugIgnore(Box::new(reader))),
        }
    }

    /// Takes ownership of an inherited descriptor: a file descriptor on Unix, a handle value on
    /// Windows.
    ///
    /// The descriptor must not be used by anything else in the process. On Unix, pipes and
    /// sockets are read without a blocking thread, so a pending read never holds up runtime
    /// shutdown.
    pub fn from_descriptor(descriptor: i64) -> Result<Self, IpcChannelError> {
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                use std::os::fd::{FromRawFd, OwnedFd, RawFd};

                let fd = RawFd::try_from(descriptor).map_err(|_| IpcChannelError::NotOpen {
                    descriptor,
                    error: std::io::Error::from(std::io::ErrorKind::InvalidInput),
                })?;
                // SAFETY: F_GETFD only inspects the descriptor table.
                if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
                    return Err(IpcChannelError::NotOpen {
                        descriptor,
                        error: std::io::Error::last_os_error(),
                    });
                }
                // SAFETY: the descriptor is open, and the caller hands its ownership to us.
                let fd = unsafe { OwnedFd::from_raw_fd(fd) };
                Ok(Self {
                    source: IpcSource::Descriptor(fd),
                })
            } else if #[cfg(windows)] {
                use std::os::windows::io::{FromRawHandle, RawHandle};

                // SAFETY: the caller hands ownership of the inherited handle to us.
                let file = unsafe { std::fs::File::from_raw_handle(descriptor as usize as RawHandle) };
                Ok(Self::new(tokio::fs::File::from_std(file)))
            } else {
                _ = descriptor;
                Err(IpcChannelError::Unsupported)
            }
        }
    }

    /// Turns the channel into a reader. Must be called from within a Tokio runtime.
    fn into_reader(self) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin>> {
        match self.source {
            IpcSource::Reader(reader) => Ok(reader.0),
            #[cfg(unix)]
            IpcSource::Descriptor(fd) => imp::descriptor_reader(fd),
        }
    }
}

/// Parses a single line received over the IPC channel.
///
/// Returns `Some` if the line is a JSON object asking for a timeout abort. Everything else is
/// ignored.
pub(crate) fn parse_ipc_message(line: &str) -> Option<TimeoutSource> {
    let Ok(Value::Object(message)) = serde_json::from_str::<Value>(line) else {
        return None;
    };
    // `tapAbort` is the name older parents use.
    ["abortReason", "tapAbort"]
        .iter()
        .any(|key| message.get(*key).and_then(Value::as_str) == Some("timeout"))
        .then_some(TimeoutSource::Ipc)
}

/// The listeners that forward timeouts to the driver.
///
/// The listeners never keep the process alive: the driver does not wait for them to finish, and
/// they are aborted as soon as the bridge is dropped.
#[derive(Debug, Default)]
pub(crate) struct TimeoutBridge {
    tasks: Vec<JoinHandle<()>>,
}

impl TimeoutBridge {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Starts forwarding timeout messages from an IPC channel.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn listen_ipc(
        &mut self,
        channel: IpcChannel,
        tx: UnboundedSender<ControlEvent>,
    ) -> Result<(), TimeoutBridgeSetupError> {
        let reader = channel.into_reader()?;
        self.tasks.push(tokio::spawn(forward_ipc(reader, tx)));
        Ok(())
    }

    /// Starts forwarding the timeout signal.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn listen_signal(
        &mut self,
        kind: TimeoutHandlerKind,
        tx: UnboundedSender<ControlEvent>,
    ) -> Result<(), TimeoutBridgeSetupError> {
        match kind {
            TimeoutHandlerKind::Standard => {
                if let Some(task) = imp::spawn_signal_listener(tx)? {
                    self.tasks.push(task);
                }
                Ok(())
            }
            TimeoutHandlerKind::Noop => Ok(()),
        }
    }
}

impl Drop for TimeoutBridge {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn forward_ipc(reader: Box<dyn AsyncRead + Send + Unpin>, tx: UnboundedSender<ControlEvent>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_ipc_message(&line) {
                Some(source) => {
                    debug!("received timeout message over IPC");
                    if tx.send(ControlEvent::Timeout(source)).is_err() {
                        break;
                    }
                }
                None => debug!(line, "ignoring IPC message"),
            },
            Ok(None) => {
                debug!("IPC channel closed");
                break;
            }
            Err(error) => {
                debug!(%error, "error reading from IPC channel, no longer listening");
                break;
            }
        }
    }
}

#[cfg(unix)]
mod imp {
    use super::*;
    use std::os::{fd::OwnedFd, unix::fs::FileTypeExt};
    use tokio::signal::unix::{SignalKind, signal};

    /// Wraps an inherited descriptor in a reader driven by the reactor.
    ///
    /// Regular files and other descriptors that can't be polled fall back to a blocking read,
    /// which reaches the end of the file on its own.
    pub(super) fn descriptor_reader(
        fd: OwnedFd,
    ) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin>> {
        let file = std::fs::File::from(fd);
        let file_type = file.metadata()?.file_type();
        if file_type.is_fifo() {
            // Also switches the descriptor to non-blocking mode.
            let receiver = tokio::net::unix::pipe::Receiver::from_file(file)?;
            Ok(Box::new(receiver))
        } else if file_type.is_socket() {
            let stream = std::os::unix::net::UnixStream::from(OwnedFd::from(file));
            stream.set_nonblocking(true)?;
            Ok(Box::new(tokio::net::UnixStream::from_std(stream)?))
        } else {
            Ok(Box::new(tokio::fs::File::from_std(file)))
        }
    }

    pub(super) fn spawn_signal_listener(
        tx: UnboundedSender<ControlEvent>,
    ) -> std::io::Result<Option<JoinHandle<()>>> {
        let mut sigalrm = signal(SignalKind::alarm())?;
        let task = tokio::spawn(async move {
            while sigalrm.recv().await.is_some() {
                let event = ControlEvent::Timeout(TimeoutSource::Signal(TimeoutSignal::Alarm));
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        Ok(Some(task))
    }
}

#[cfg(not(unix))]
mod imp {
    use super::*;

    // There is no catchable timeout signal here: timeouts only arrive over IPC.
    pub(super) fn spawn_signal_listener(
        _tx: UnboundedSender<ControlEvent>,
    ) -> std::io::Result<Option<JoinHandle<()>>> {
        Ok(None)
    }
}
