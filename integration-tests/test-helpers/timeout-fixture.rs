// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A test process that never finishes on its own, for exercising timeout handling.
//!
//! The process writes its TAP output to stdout, which registers the root, and then prints
//! `# ready` once timeout listeners are installed. From then on it waits to be told it has timed
//! out.
//!
//! Modes, selected through `TIMEOUT_FIXTURE_MODE`:
//! - `pending` (default): one subtest never completes. A timeout fails the run.
//! - `finished`: the run has already passed. A timeout is reported after the end and re-raised.
//!
//! If `TIMEOUT_FIXTURE_STDIN_IPC=1`, timeout messages are read from stdin instead of the
//! `TAP_IPC_FD` descriptor.

use serde_json::json;
use std::{
    env,
    process::{ExitCode, exit},
    time::{Duration, Instant},
};
use tap_root::{
    aggregate::{Aggregate, EndMarker, FinalResults},
    diagnostic::{ActiveResources, TimeoutDiagnostic},
    errors::DisplayErrorChain,
    logging,
    process::StandardProcess,
    root::{RootContext, RootDriverBuilder},
    signal::{IpcChannel, TimeoutHandlerKind},
};

struct FixtureAggregate {
    ctx: &'static RootContext,
    results: Option<FinalResults>,
    started: Instant,
}

impl FixtureAggregate {
    fn write(&self, chunk: &str) {
        if let Err(error) = self.ctx.write(chunk) {
            eprintln!("timeout-fixture: error writing output: {error}");
        }
    }
}

impl Aggregate for FixtureAggregate {
    fn is_idle(&self) -> bool {
        false
    }

    fn results(&self) -> Option<FinalResults> {
        self.results
    }

    fn end(&mut self, _marker: EndMarker) {}

    fn end_all(&mut self) {}

    fn report_timeout(&mut self, diagnostic: TimeoutDiagnostic) {
        self.write("not ok 1 - timeout!\n");
        self.write(&format!(
            "# signal: {}\n",
            diagnostic.signal.as_deref().unwrap_or("none")
        ));
        self.write("1..1\n");
        self.results = Some(FinalResults {
            ok: false,
            count: 1,
            fail: 1,
            ..FinalResults::default()
        });
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let ctx = RootContext::global();
    logging::init(ctx.config());

    let finished = env::var("TIMEOUT_FIXTURE_MODE").as_deref() == Ok("finished");
    let mut aggregate = FixtureAggregate {
        ctx,
        results: None,
        started: Instant::now(),
    };

    // Attaches stdout, which registers the root.
    aggregate.write("TAP version 14\n");
    if finished {
        aggregate.write("ok 1 - fine\n1..1\n");
        aggregate.results = Some(FinalResults {
            ok: true,
            count: 1,
            pass: 1,
            ..FinalResults::default()
        });
    }

    let resources = ActiveResources::new();
    let _timer = resources.track_handle(json!({ "type": "Timeout", "msecs": 30000 }));

    let mut builder = RootDriverBuilder::new();
    builder.set_resources(resources);
    let stdin_ipc = env::var("TIMEOUT_FIXTURE_STDIN_IPC").as_deref() == Ok("1");
    if stdin_ipc {
        builder.set_ipc_channel(IpcChannel::new(tokio::io::stdin()));
    }
    let (driver, _events) = match builder.build(
        ctx,
        aggregate,
        StandardProcess::new(),
        TimeoutHandlerKind::Standard,
    ) {
        Ok(built) => built,
        Err(error) => {
            eprintln!("timeout-fixture: {}", DisplayErrorChain::new(error));
            exit(2);
        }
    };

    // The driver handles registration, and with it installs its listeners, the first time it is
    // polled. The second future only gets to run after that.
    let ready = async {
        tokio::task::yield_now().await;
        if let Err(error) = ctx.write("# ready\n") {
            eprintln!("timeout-fixture: error writing output: {error}");
        }
    };
    let (outcome, ()) = tokio::join!(driver.run(), ready);

    if stdin_ipc {
        // Tokio's stdin reads on a blocking thread, which would hold up runtime shutdown.
        exit(outcome.exit_code);
    }
    // Returning shuts down the runtime, even with a read pending on `TAP_IPC_FD`.
    ExitCode::from(u8::try_from(outcome.exit_code).unwrap_or(1))
}
