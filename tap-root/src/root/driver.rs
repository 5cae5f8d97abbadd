// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The root's event loop.
//!
//! Everything that happens to the root ends up as an [`InternalEvent`] handled on a single task:
//! notifications from the aggregate, registration and timeouts from the control channel, and the
//! auto-end confirmation timer. Handlers never block, and none of them run concurrently.

use super::RootContext;
use crate::{
    aggregate::{Aggregate, AggregateEvent, EndMarker, FinalResults},
    autoend::{AutoEndDebouncer, DebounceAction},
    diagnostic::{ActiveResources, TimeoutDiagnostic},
    errors::DisplayErrorChain,
    exit_codes::TapExitCode,
    process::ProcessControl,
    signal::{
        ControlEvent, IpcChannel, TimeoutBridge, TimeoutHandlerKind, TimeoutLatch, TimeoutSignal,
        TimeoutSource,
    },
};
use debug_ignore::DebugIgnore;
use std::{fmt::Write as _, pin::Pin, time::Duration};
use tokio::{
    sync::mpsc::UnboundedReceiver,
    time::{Sleep, sleep},
};
use tracing::{debug, warn};

/// The line written to the error stream when a timeout arrives after the aggregate finished.
pub const LATE_TIMEOUT_MESSAGE: &str = "possible timeout: timeout signal received after tap end";

/// Reacts to aggregate notifications, timeouts and the auto-end timer until the run is over.
///
/// Created by [`RootDriverBuilder::build`](super::RootDriverBuilder::build).
#[derive(Debug)]
pub struct RootDriver<'ctx> {
    pub(super) ctx: &'ctx RootContext,
    pub(super) aggregate: DebugIgnore<Box<dyn Aggregate + 'ctx>>,
    pub(super) process: DebugIgnore<Box<dyn ProcessControl + 'ctx>>,
    pub(super) handler_kind: TimeoutHandlerKind,
    pub(super) ipc: Option<IpcChannel>,
    pub(super) resources: ActiveResources,
    pub(super) autoend_turn: Duration,
    pub(super) events_rx: UnboundedReceiver<AggregateEvent>,
    pub(super) control_rx: UnboundedReceiver<ControlEvent>,
}

/// The result of [`RootDriver::run`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RunOutcome {
    /// The status the process should exit with.
    pub exit_code: i32,

    /// The aggregate's final results, if it produced any.
    pub results: Option<FinalResults>,

    /// True if a supervisor reported a timeout.
    pub timed_out: bool,
}

impl RootDriver<'_> {
    /// Runs the root until one of the following happens:
    ///
    /// * Every [`AggregateEvents`](crate::aggregate::AggregateEvents) handle has been dropped.
    ///   This means nothing is left that could move the run forward, so a registered root
    ///   force-finalizes the aggregate before returning.
    /// * A timeout was reported to the aggregate, and the aggregate has produced its results.
    /// * A registered root bailed out, or a late timeout could not be re-raised as a signal. In a
    ///   real process [`ProcessControl::exit`] does not return in these cases.
    ///
    /// This should be run on a current-thread runtime.
    pub async fn run(self) -> RunOutcome {
        let Self {
            ctx,
            aggregate,
            process,
            handler_kind,
            ipc,
            resources,
            autoend_turn,
            mut events_rx,
            mut control_rx,
        } = self;

        let mut state = DriverState {
            ctx,
            aggregate: aggregate.0,
            process: process.0,
            handler_kind,
            ipc,
            resources,
            autoend_turn,
            debouncer: AutoEndDebouncer::new(),
            timer: None,
            latch: TimeoutLatch::default(),
            bridge: None,
            results: None,
            timeout_reported: false,
        };

        loop {
            let internal_event = tokio::select! {
                // Control events are rare but time-sensitive, so they go first.
                biased;

                Some(event) = control_rx.recv() => InternalEvent::Control(event),
                event = events_rx.recv() => {
                    match event {
                        Some(event) => InternalEvent::Aggregate(event),
                        None => InternalEvent::Drained,
                    }
                },
                () = wait_for_timer(&mut state.timer) => InternalEvent::AutoEndTimer,
            };

            match state.handle_event(internal_event) {
                HandleEventResponse::Continue => {}
                HandleEventResponse::Finished => break,
            }
        }

        state.into_outcome()
    }
}

#[derive(Debug)]
enum InternalEvent {
    Aggregate(AggregateEvent),
    Control(ControlEvent),
    AutoEndTimer,
    Drained,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum HandleEventResponse {
    Continue,
    Finished,
}

struct DriverState<'ctx> {
    ctx: &'ctx RootContext,
    aggregate: Box<dyn Aggregate + 'ctx>,
    process: Box<dyn ProcessControl + 'ctx>,
    handler_kind: TimeoutHandlerKind,
    ipc: Option<IpcChannel>,
    resources: ActiveResources,
    autoend_turn: Duration,
    debouncer: AutoEndDebouncer,
    // At most one confirmation timer is alive at a time.
    timer: Option<Pin<Box<Sleep>>>,
    latch: TimeoutLatch,
    bridge: Option<TimeoutBridge>,
    results: Option<FinalResults>,
    timeout_reported: bool,
}

impl DriverState<'_> {
    fn handle_event(&mut self, event: InternalEvent) -> HandleEventResponse {
        match event {
            InternalEvent::Aggregate(AggregateEvent::Idle | AggregateEvent::Activity) => {
                let action = self
                    .debouncer
                    .on_idle(self.ctx.is_autoend(), self.aggregate.is_idle());
                self.apply(action);
            }
            InternalEvent::Aggregate(AggregateEvent::Complete(results)) => {
                self.complete(results);
            }
            InternalEvent::Aggregate(AggregateEvent::Bail) => {
                if self.ctx.is_registered() {
                    debug!("aggregate bailed out, exiting");
                    self.process.set_exit_code(TapExitCode::FAILED);
                    self.process.exit(TapExitCode::FAILED);
                    return HandleEventResponse::Finished;
                }
            }
            InternalEvent::Control(ControlEvent::Registered) => self.arm_bridge(),
            InternalEvent::Control(ControlEvent::Timeout(source)) => {
                if self.timeout(source) == HandleEventResponse::Finished {
                    return HandleEventResponse::Finished;
                }
            }
            InternalEvent::AutoEndTimer => {
                self.timer = None;
                let action = self
                    .debouncer
                    .on_timer(self.ctx.is_autoend(), self.aggregate.is_idle());
                self.apply(action);
            }
            InternalEvent::Drained => {
                self.drain();
                return HandleEventResponse::Finished;
            }
        }

        self.poll_results();
        if self.timeout_reported && self.results.is_some() {
            HandleEventResponse::Finished
        } else {
            HandleEventResponse::Continue
        }
    }

    fn apply(&mut self, action: DebounceAction) {
        match action {
            DebounceAction::None => {}
            DebounceAction::Cancel => {
                self.timer = None;
            }
            DebounceAction::Schedule => {
                self.timer = Some(Box::pin(sleep(self.autoend_turn)));
            }
            DebounceAction::Finalize => {
                self.timer = None;
                self.ctx.disarm_autoend();
                debug!("aggregate confirmed idle, ending implicitly");
                self.aggregate.end(EndMarker::Implicit);
            }
        }
    }

    fn arm_bridge(&mut self) {
        if self.bridge.is_some() {
            return;
        }
        let mut bridge = TimeoutBridge::new();
        if let Some(ipc) = self.ipc.take()
            && let Err(error) = bridge.listen_ipc(ipc, self.ctx.control_sender())
        {
            warn!(
                "continuing without the IPC channel: {}",
                DisplayErrorChain::new(error)
            );
        }
        if let Err(error) = bridge.listen_signal(self.handler_kind, self.ctx.control_sender()) {
            warn!(
                "continuing without the timeout signal: {}",
                DisplayErrorChain::new(error)
            );
        }
        self.bridge = Some(bridge);
    }

    fn timeout(&mut self, source: TimeoutSource) -> HandleEventResponse {
        if !self.latch.fire() {
            debug!(?source, "ignoring repeated timeout");
            return HandleEventResponse::Continue;
        }

        let diagnostic = TimeoutDiagnostic {
            signal: source.signal().map(|signal| signal.name().to_owned()),
            ..self.resources.snapshot()
        };

        if self.results.is_none()
            && self.aggregate.results().is_none()
            && self.aggregate.supports_timeout()
        {
            debug!(?source, "reporting timeout to the aggregate");
            self.aggregate.report_timeout(diagnostic);
            self.timeout_reported = true;
            HandleEventResponse::Continue
        } else {
            self.escalate(diagnostic)
        }
    }

    /// Nothing is left to fail: tell the supervisor through the error stream and by dying of the
    /// signal it sent.
    fn escalate(&mut self, diagnostic: TimeoutDiagnostic) -> HandleEventResponse {
        self.process.report_error(LATE_TIMEOUT_MESSAGE);
        let diagnostic = diagnostic.without_signal();
        if diagnostic.has_pending() {
            self.process.report_error(&diagnostic.to_json_pretty());
        }

        match self.process.raise_timeout_signal(TimeoutSignal::Alarm) {
            Ok(()) => HandleEventResponse::Continue,
            Err(error) => {
                debug!(%error, "unable to re-raise the timeout signal, exiting");
                self.process.exit(TapExitCode::FAILED);
                HandleEventResponse::Finished
            }
        }
    }

    fn drain(&mut self) {
        self.timer = None;
        if !self.ctx.is_registered() {
            debug!("aggregate handles dropped");
            return;
        }

        self.poll_results();
        if self.results.is_some() {
            return;
        }
        debug!("out of work with the aggregate still open, ending it");
        self.aggregate.end(EndMarker::Explicit);
        self.poll_results();
        if self.results.is_none() {
            self.aggregate.end_all();
            self.poll_results();
        }
    }

    fn poll_results(&mut self) {
        if self.results.is_none() {
            if let Some(results) = self.aggregate.results() {
                self.complete(results);
            }
        }
    }

    fn complete(&mut self, results: FinalResults) {
        if self.results.is_some() {
            return;
        }
        self.results = Some(results);

        let summary = completion_summary(
            &results,
            self.ctx.config().is_top_level(),
            self.aggregate.elapsed(),
        );
        if let Err(error) = self.ctx.write(&summary) {
            warn!(%error, "error writing run summary");
        }

        if self.ctx.is_registered() && !results.ok {
            self.process.set_exit_code(TapExitCode::FAILED);
        }
    }

    fn into_outcome(self) -> RunOutcome {
        RunOutcome {
            exit_code: self.process.exit_code(),
            results: self.results,
            timed_out: self.latch.is_fired(),
        }
    }
}

async fn wait_for_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Renders the comment lines that follow a finished run.
fn completion_summary(results: &FinalResults, top_level: bool, elapsed: Duration) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail.
    for (label, n) in [
        ("fail", results.fail),
        ("todo", results.todo),
        ("skip", results.skip),
    ] {
        if n > 0 {
            _ = writeln!(out, "# {label}: {n}");
        }
    }
    if top_level {
        _ = writeln!(out, "# pass {} / {}", results.pass, results.count);
    }
    if !results.ok {
        out.push_str("# fail\n");
    }
    if top_level {
        _ = writeln!(out, "# time={:.3}ms", elapsed.as_secs_f64() * 1000.0);
    }
    out
}
