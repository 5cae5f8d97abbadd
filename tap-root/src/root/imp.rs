// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::RootDriver;
use crate::{
    aggregate::{Aggregate, AggregateEvents, AggregateOptions},
    config::RootConfig,
    diagnostic::ActiveResources,
    errors::{DriverAlreadyTakenError, RootBuildError},
    output::{Destination, EpipeGuard, OutputTarget},
    process::ProcessControl,
    signal::{ControlEvent, IpcChannel, TimeoutHandlerKind},
};
use debug_ignore::DebugIgnore;
use std::{
    io::{self, Write},
    sync::{
        Mutex, MutexGuard, OnceLock, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::debug;

static ROOT_CLAIMED: AtomicBool = AtomicBool::new(false);

/// Proof that the caller is constructing the one root context of this process.
#[derive(Debug)]
pub struct RootToken {
    _private: (),
}

impl RootToken {
    /// Claims the root slot for this process.
    ///
    /// # Panics
    ///
    /// Panics if the slot was already claimed, including implicitly by
    /// [`RootContext::global`].
    pub fn claim() -> Self {
        if ROOT_CLAIMED.swap(true, Ordering::SeqCst) {
            panic!("the root test context can only be created once per process");
        }
        Self { _private: () }
    }

    /// Creates a token without claiming the slot, so that tests can build as many contexts as
    /// they need.
    #[cfg(test)]
    pub(crate) fn unchecked() -> Self {
        Self { _private: () }
    }
}

/// Process-wide state of the root test.
///
/// The context is shared: the aggregate writes its output through it, and the code that runs
/// tests arms auto-end on it. Everything that reacts to events is done by the [`RootDriver`] built
/// from it.
#[derive(Debug)]
pub struct RootContext {
    config: RootConfig,
    registered: AtomicBool,
    piped: AtomicBool,
    autoend: AtomicBool,
    output: Mutex<Option<EpipeGuard<Destination>>>,
    control_tx: UnboundedSender<ControlEvent>,
    control_rx: Mutex<Option<UnboundedReceiver<ControlEvent>>>,
}

impl RootContext {
    /// Returns the root context of this process, creating it from the environment the first time.
    pub fn global() -> &'static RootContext {
        static GLOBAL: OnceLock<RootContext> = OnceLock::new();
        GLOBAL.get_or_init(|| RootContext::new(RootToken::claim(), RootConfig::from_env()))
    }

    /// Creates a new context.
    pub fn new(token: RootToken, config: RootConfig) -> Self {
        let RootToken { _private: () } = token;
        let (control_tx, control_rx) = unbounded_channel();
        Self {
            config,
            registered: AtomicBool::new(false),
            piped: AtomicBool::new(false),
            autoend: AtomicBool::new(false),
            output: Mutex::new(None),
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
        }
    }

    /// Returns the configuration this context was created with.
    pub fn config(&self) -> &RootConfig {
        &self.config
    }

    /// Returns the options the aggregate should be constructed with.
    pub fn aggregate_options(&self) -> AggregateOptions {
        self.config.aggregate_options()
    }

    /// Puts the root in charge of the process.
    ///
    /// Once registered, a failing run sets the process exit status, a bail exits the process, and
    /// running out of work force-finalizes the aggregate. Timeout listeners are installed by the
    /// driver. Registering more than once has no further effect.
    pub fn register(&self) {
        if self.registered.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("root registered with the process");
        // The receiver lives as long as the context or the driver, and events are only lost if
        // the driver has already returned.
        _ = self.control_tx.send(ControlEvent::Registered);
    }

    /// Returns true if [`register`](Self::register) was called.
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Attaches a destination for the output.
    ///
    /// Attaching standard output registers the root. A destination that was attached earlier is
    /// replaced, and flushed on the way out.
    pub fn pipe(&self, target: OutputTarget) -> io::Result<()> {
        let is_stdout = target.is_stdout();
        let previous = self
            .lock_output()
            .replace(EpipeGuard::new(target.into_destination()));
        self.piped.store(true, Ordering::SeqCst);
        if is_stdout {
            self.register();
        }

        match previous {
            Some(mut previous) => previous.flush(),
            None => Ok(()),
        }
    }

    /// Returns true if a destination has been attached.
    pub fn is_piped(&self) -> bool {
        self.piped.load(Ordering::SeqCst)
    }

    /// Writes a chunk of output, attaching standard output first if nothing is attached yet.
    pub fn write(&self, chunk: &str) -> io::Result<()> {
        let mut output = self.lock_output();
        let attached_stdout = output.is_none();
        let guard =
            output.get_or_insert_with(|| EpipeGuard::new(OutputTarget::Stdout.into_destination()));
        let res = guard
            .write_all(chunk.as_bytes())
            .and_then(|()| guard.flush());
        drop(output);

        if attached_stdout {
            self.piped.store(true, Ordering::SeqCst);
            self.register();
        }
        res
    }

    /// Arms auto-end: once the aggregate is confirmed idle, it is ended implicitly.
    pub fn arm_autoend(&self) {
        self.autoend.store(true, Ordering::SeqCst);
    }

    /// Returns true if auto-end is armed.
    pub fn is_autoend(&self) -> bool {
        self.autoend.load(Ordering::SeqCst)
    }

    pub(crate) fn disarm_autoend(&self) {
        self.autoend.store(false, Ordering::SeqCst);
    }

    pub(crate) fn control_sender(&self) -> UnboundedSender<ControlEvent> {
        self.control_tx.clone()
    }

    fn lock_output(&self) -> MutexGuard<'_, Option<EpipeGuard<Destination>>> {
        // A panic mid-write at worst leaves a partial line behind.
        self.output.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The default length of one auto-end confirmation turn.
pub const DEFAULT_AUTOEND_TURN: Duration = Duration::from_millis(1);

/// Root driver configuration.
#[derive(Debug)]
pub struct RootDriverBuilder {
    autoend_turn: Duration,
    ipc: Option<IpcChannel>,
    resources: ActiveResources,
}

impl Default for RootDriverBuilder {
    fn default() -> Self {
        Self {
            autoend_turn: DEFAULT_AUTOEND_TURN,
            ipc: None,
            resources: ActiveResources::new(),
        }
    }
}

impl RootDriverBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long each of the two auto-end confirmation turns lasts.
    pub fn set_autoend_turn(&mut self, turn: Duration) -> &mut Self {
        self.autoend_turn = turn;
        self
    }

    /// Sets the channel over which timeout messages arrive, instead of the one configured by the
    /// environment.
    pub fn set_ipc_channel(&mut self, channel: IpcChannel) -> &mut Self {
        self.ipc = Some(channel);
        self
    }

    /// Sets the registry that pending handles and requests are tracked in.
    pub fn set_resources(&mut self, resources: ActiveResources) -> &mut Self {
        self.resources = resources;
        self
    }

    /// Creates the driver for `ctx`, along with the handle the aggregate notifies it through.
    ///
    /// Only one driver can be built per context.
    pub fn build<'ctx>(
        self,
        ctx: &'ctx RootContext,
        aggregate: impl Aggregate + 'ctx,
        process: impl ProcessControl + 'ctx,
        handler_kind: TimeoutHandlerKind,
    ) -> Result<(RootDriver<'ctx>, AggregateEvents), RootBuildError> {
        let mut control_rx = ctx
            .control_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if control_rx.is_none() {
            return Err(DriverAlreadyTakenError.into());
        }

        let ipc = match self.ipc {
            Some(channel) => Some(channel),
            None => ctx
                .config
                .ipc_descriptor()
                .map(IpcChannel::from_descriptor)
                .transpose()?,
        };
        let control_rx = control_rx.take().ok_or(DriverAlreadyTakenError)?;

        let aggregate: Box<dyn Aggregate + 'ctx> = Box::new(aggregate);
        let process: Box<dyn ProcessControl + 'ctx> = Box::new(process);
        let (events_tx, events_rx) = unbounded_channel();
        let driver = RootDriver {
            ctx,
            aggregate: DebugIgnore(aggregate),
            process: DebugIgnore(process),
            handler_kind,
            ipc,
            resources: self.resources,
            autoend_turn: self.autoend_turn,
            events_rx,
            control_rx,
        };
        Ok((driver, AggregateEvents::new(events_tx)))
    }
}
