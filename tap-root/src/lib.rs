// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Process lifecycle coordination for the root test of a TAP test process.
//!
//! A process that runs TAP tests has exactly one top-level test aggregate. This crate owns the
//! parts of that process that are not about tests at all:
//!
//! * deciding when an aggregate that was never explicitly ended should be finalized
//!   ([`autoend`]),
//! * noticing that a supervising process has killed this one for running too long, and reporting
//!   what was still pending ([`signal`], [`diagnostic`]),
//! * writing to a shared output stream that a reader may abandon at any time ([`output`]).
//!
//! The entry point is [`RootContext::global`](root::RootContext::global), from which a single
//! [`RootDriver`](root::RootDriver) is built and run on a current-thread runtime.

pub mod aggregate;
pub mod autoend;
pub mod config;
pub mod diagnostic;
pub mod errors;
pub mod exit_codes;
pub mod logging;
pub mod output;
pub mod process;
pub mod root;
pub mod signal;
#[cfg(test)]
mod test_helpers;
