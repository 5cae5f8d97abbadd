// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by the root coordinator.

use std::{error, fmt};
use thiserror::Error;

/// An error returned when a second [`RootDriver`](crate::root::RootDriver) is requested from a
/// [`RootContext`](crate::root::RootContext).
///
/// The driver owns the aggregate and the receiving end of the control channel, so there can only
/// ever be one per context.
#[derive(Clone, Debug, Error)]
#[error("the root driver for this process was already built")]
#[non_exhaustive]
pub struct DriverAlreadyTakenError;

/// An error that occurred while installing a timeout listener, for the signal or the IPC channel.
#[derive(Debug, Error)]
#[error("error setting up a timeout listener")]
pub struct TimeoutBridgeSetupError(#[from] std::io::Error);

/// An error that occurred while opening the inter-process channel used to deliver timeouts.
#[derive(Debug, Error)]
pub enum IpcChannelError {
    /// The descriptor did not refer to an open file, pipe or socket.
    #[error("IPC descriptor {descriptor} is not open")]
    NotOpen {
        /// The descriptor that was passed in.
        descriptor: i64,

        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// This platform has no way to turn a raw descriptor into a channel.
    #[error("IPC descriptors are not supported on this platform")]
    Unsupported,
}

/// An error that occurred while building a [`RootDriver`](crate::root::RootDriver).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RootBuildError {
    /// The driver was already built for this context.
    #[error(transparent)]
    DriverAlreadyTaken(#[from] DriverAlreadyTakenError),

    /// The configured IPC channel could not be opened.
    #[error("error opening the timeout IPC channel")]
    IpcChannel(#[from] IpcChannelError),
}

/// Displays an error along with its chain of sources, one per line.
pub struct DisplayErrorChain<E> {
    error: E,
}

impl<E: error::Error> DisplayErrorChain<E> {
    /// Creates a new `DisplayErrorChain`.
    pub fn new(error: E) -> Self {
        Self { error }
    }
}

impl<E> fmt::Display for DisplayErrorChain<E>
where
    E: error::Error,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;

        let mut source = self.error.source();
        while let Some(s) = source {
            write!(f, "\n  caused by: {s}")?;
            source = s.source();
        }

        Ok(())
    }
}
