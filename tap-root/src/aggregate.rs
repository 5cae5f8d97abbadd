// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The interface between the root and the top-level test aggregate.
//!
//! The aggregate (the object that creates subtests, counts assertions and renders test points) is
//! not part of this crate. The root drives it through the [`Aggregate`] trait, and the aggregate
//! tells the root what it is doing through an [`AggregateEvents`] handle.

use crate::diagnostic::TimeoutDiagnostic;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Options resolved from the environment that the aggregate should be constructed with.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AggregateOptions {
    /// The name of the top-level test.
    pub name: String,
    /// Print diagnostics for passing test points too.
    pub diagnostic: Option<bool>,
    /// Stop at the first failure.
    pub bail: Option<bool>,
    /// Debug mode.
    pub debug: Option<bool>,
    /// Do not print the `TAP version` line.
    pub omit_version: Option<bool>,
    /// Keep blank lines in the output.
    pub preserve_whitespace: bool,
}

/// The final counts of a finished aggregate.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FinalResults {
    /// True if the run passed as a whole.
    pub ok: bool,
    /// The number of test points.
    pub count: usize,
    /// The number of passing test points.
    pub pass: usize,
    /// The number of failing test points.
    pub fail: usize,
    /// The number of test points marked todo.
    pub todo: usize,
    /// The number of skipped test points.
    pub skip: usize,
}

/// How an aggregate is being ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EndMarker {
    /// The caller asked for the end, or the process is about to run out of work.
    Explicit,

    /// The root decided that the aggregate has been idle for long enough.
    Implicit,
}

/// The hooks the root calls on the top-level aggregate.
///
/// All calls happen on the driver's task, one at a time.
pub trait Aggregate {
    /// Returns true if no subtest is running and nothing else is queued.
    fn is_idle(&self) -> bool;

    /// Returns the final results, once the aggregate has produced them.
    fn results(&self) -> Option<FinalResults>;

    /// Ends the aggregate. Queued subtests may still run to completion afterwards.
    fn end(&mut self, marker: EndMarker);

    /// Ends the aggregate and every subtest that is still pending, producing results immediately.
    fn end_all(&mut self);

    /// Returns true if the aggregate can turn a timeout into a failure of its own.
    fn supports_timeout(&self) -> bool {
        true
    }

    /// Reports that a supervising process timed this process out.
    fn report_timeout(&mut self, diagnostic: TimeoutDiagnostic);

    /// Returns the time since the aggregate started.
    fn elapsed(&self) -> Duration;
}

/// A notification from the aggregate to the root.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AggregateEvent {
    /// The aggregate has become idle.
    Idle,

    /// New work was queued or started.
    Activity,

    /// The aggregate finished with these results.
    Complete(FinalResults),

    /// The aggregate asked for the whole run to stop immediately.
    Bail,
}

/// A cloneable handle over which the aggregate notifies the root.
///
/// Once every clone has been dropped, the root treats the process as out of work: see
/// [`RootDriver::run`](crate::root::RootDriver::run).
#[derive(Clone, Debug)]
pub struct AggregateEvents {
    tx: UnboundedSender<AggregateEvent>,
}

impl AggregateEvents {
    pub(crate) fn new(tx: UnboundedSender<AggregateEvent>) -> Self {
        Self { tx }
    }

    /// Reports that the aggregate is idle.
    pub fn idle(&self) {
        self.send(AggregateEvent::Idle);
    }

    /// Reports that new work was queued or started.
    pub fn activity(&self) {
        self.send(AggregateEvent::Activity);
    }

    /// Reports that the aggregate finished.
    pub fn complete(&self, results: FinalResults) {
        self.send(AggregateEvent::Complete(results));
    }

    /// Reports that the aggregate bailed out.
    pub fn bail(&self) {
        self.send(AggregateEvent::Bail);
    }

    fn send(&self, event: AggregateEvent) {
        // The driver may already have returned, in which case there is nobody left to tell.
        _ = self.tx.send(event);
    }
}
