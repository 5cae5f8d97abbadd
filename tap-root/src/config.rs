// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Environment-driven configuration for the root.
//!
//! The root does not own any of these settings. Most of them are resolved here and handed through
//! to the aggregate in [`AggregateOptions`]; the rest tell the root whether it is running as a
//! nested child process and where its IPC channel lives.

use crate::aggregate::AggregateOptions;
use std::collections::HashMap;
use tracing::warn;

/// Environment variable: diagnostic verbosity for passing test points.
pub const TAP_DIAG: &str = "TAP_DIAG";
/// Environment variable: stop the run at the first failure.
pub const TAP_BAIL: &str = "TAP_BAIL";
/// Environment variable: debug mode. Also raises the log level.
pub const TAP_DEBUG: &str = "TAP_DEBUG";
/// Environment variable: do not print the `TAP version` line.
pub const TAP_OMIT_VERSION: &str = "TAP_OMIT_VERSION";
/// Environment variable: strip blank lines from the output.
pub const TAP_OMIT_WHITESPACE: &str = "TAP_OMIT_WHITESPACE";
/// Environment variable: set by a parent runner when this process is one of its children.
pub const TAP_CHILD_ID: &str = "TAP_CHILD_ID";
/// Environment variable: a descriptor (Unix fd or Windows handle value) over which a parent
/// sends newline-delimited JSON control messages.
pub const TAP_IPC_FD: &str = "TAP_IPC_FD";

/// Configuration for a [`RootContext`](crate::root::RootContext).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RootConfig {
    diagnostic: Option<bool>,
    bail: Option<bool>,
    debug: Option<bool>,
    omit_version: Option<bool>,
    omit_whitespace: Option<bool>,
    child_id: Option<String>,
    ipc_descriptor: Option<i64>,
}

impl RootConfig {
    /// Reads the configuration from the process environment.
    ///
    /// Variables that are not valid UTF-8 are treated as unset.
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?))),
        )
    }

    /// Reads the configuration from an explicit set of variables.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let flag = |key: &str| env_flag(vars.get(key).map(String::as_str));

        let ipc_descriptor = vars.get(TAP_IPC_FD).and_then(|value| {
            match value.trim().parse::<i64>() {
                Ok(descriptor) if descriptor >= 0 => Some(descriptor),
                _ => {
                    warn!("ignoring {TAP_IPC_FD}={value:?}: not a valid descriptor");
                    None
                }
            }
        });

        Self {
            diagnostic: flag(TAP_DIAG),
            bail: flag(TAP_BAIL),
            debug: flag(TAP_DEBUG),
            omit_version: flag(TAP_OMIT_VERSION),
            omit_whitespace: flag(TAP_OMIT_WHITESPACE),
            child_id: vars.get(TAP_CHILD_ID).cloned(),
            ipc_descriptor,
        }
    }

    /// Returns the options the aggregate should be constructed with.
    pub fn aggregate_options(&self) -> AggregateOptions {
        AggregateOptions {
            name: "TAP".to_owned(),
            diagnostic: self.diagnostic,
            bail: self.bail,
            debug: self.debug,
            omit_version: self.omit_version,
            // An unset flag means whitespace is preserved.
            preserve_whitespace: self.omit_whitespace != Some(true),
        }
    }

    /// Returns true if this process is the top-level runner rather than a child of one.
    pub fn is_top_level(&self) -> bool {
        self.child_id.is_none()
    }

    /// Returns the child ID assigned by a parent runner, if any.
    pub fn child_id(&self) -> Option<&str> {
        self.child_id.as_deref()
    }

    /// Returns true if debug mode was explicitly enabled.
    pub fn debug(&self) -> bool {
        self.debug == Some(true)
    }

    /// Returns the descriptor of the IPC channel, if one was configured.
    pub fn ipc_descriptor(&self) -> Option<i64> {
        self.ipc_descriptor
    }

    /// Sets the IPC descriptor, overriding the environment.
    pub fn set_ipc_descriptor(&mut self, descriptor: Option<i64>) -> &mut Self {
        self.ipc_descriptor = descriptor;
        self
    }
}

/// Resolves a tri-state flag: unset is `None`, `"1"` is `Some(true)`, and anything else is
/// `Some(false)`.
fn env_flag(value: Option<&str>) -> Option<bool> {
    value.map(|v| v == "1")
}
