// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Exit codes used by the root.

/// Documented exit codes for a process coordinated by the root.
///
/// Any failure that is not listed here also results in exit code 1.
pub enum TapExitCode {}

impl TapExitCode {
    /// The aggregate passed, or the process was never registered.
    pub const OK: i32 = 0;

    /// The aggregate did not pass, a bail was requested, or a late timeout could not be re-raised
    /// as a signal.
    pub const FAILED: i32 = 1;
}
