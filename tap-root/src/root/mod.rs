// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The root coordinator.
//!
//! The main structures in this module are [`RootContext`], the process-wide state shared with the
//! aggregate and its output, and [`RootDriver`], the single task that reacts to everything that
//! happens to the root.

mod driver;
mod imp;

pub use driver::*;
pub use imp::*;
