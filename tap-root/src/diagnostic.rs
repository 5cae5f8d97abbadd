// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Snapshots of pending work, taken when a timeout is detected.
//!
//! When a supervisor kills this process for running too long, the most useful thing to report is
//! what the process was still waiting on. Code that owns long-lived asynchronous work (timers,
//! sockets, servers, in-flight requests) registers it with [`ActiveResources`], and the registry
//! is summarized into a [`TimeoutDiagnostic`] by [`snapshot`].
//!
//! Entries are free-form JSON. Summarizing is best-effort: only a kind name and a small set of
//! well-known fields are kept, and entries that are not objects are passed through unchanged.

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Number, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// One of the three standard streams.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StdioStream {
    /// Standard input.
    Stdin,
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// A pending handle, as reported by [`ActiveResources::handles`].
#[derive(Clone, Debug, PartialEq)]
pub enum ActiveHandle {
    /// A standard stream. These are always pending and are never reported.
    Stdio(StdioStream),

    /// Anything else.
    Resource(Value),
}

/// A summary of a pending handle.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum HandleSummary {
    /// The handle was an object, and these are the fields worth reporting.
    Described(HandleDescription),

    /// The handle was not an object and is reported as-is.
    Opaque(Value),
}

/// The reportable fields of a pending handle.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleDescription {
    /// The kind of handle, e.g. `Timeout` or `Socket`.
    #[serde(rename = "type")]
    pub kind: String,

    /// For timers, the delay in milliseconds after which the timer fires.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msecs: Option<Number>,

    /// The names of events that have listeners registered on the handle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<String>>,

    /// For sockets, the local socket name: a path, or an address object such as
    /// `{"port": 8080}`. Reported as given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sockname: Option<Value>,

    /// For servers, the key identifying the listening connection. Reported as given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<Value>,
}

/// A summary of a pending request.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RequestSummary {
    /// The request was an object.
    Described(RequestDescription),

    /// The request was not an object and is reported as-is.
    Opaque(Value),
}

/// The reportable fields of a pending request.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RequestDescription {
    /// The kind of request, e.g. `FSReqCallback`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Whatever context the request carried.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// What was still pending when a timeout was detected.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TimeoutDiagnostic {
    /// The signal that delivered the timeout, or `None` if it arrived over IPC.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,

    /// Pending requests, in registration order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub requests: Vec<RequestSummary>,

    /// Pending handles other than the standard streams, in registration order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub handles: Vec<HandleSummary>,
}

impl TimeoutDiagnostic {
    /// Returns true if anything at all was pending.
    pub fn has_pending(&self) -> bool {
        !self.requests.is_empty() || !self.handles.is_empty()
    }

    /// Returns this diagnostic with the signal removed.
    pub fn without_signal(self) -> Self {
        Self {
            signal: None,
            ..self
        }
    }

    /// Renders the diagnostic as indented JSON.
    pub fn to_json_pretty(&self) -> String {
        // Serializing a tree of strings, numbers and `Value`s cannot fail.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// Summarizes pending handles and requests.
///
/// Standard streams are dropped from `handles`. Inputs are not modified.
pub fn snapshot(handles: &[ActiveHandle], requests: &[Value]) -> TimeoutDiagnostic {
    let handles = handles
        .iter()
        .filter_map(|handle| match handle {
            ActiveHandle::Stdio(_) => None,
            ActiveHandle::Resource(value) => Some(summarize_handle(value)),
        })
        .collect();
    let requests = requests.iter().map(summarize_request).collect();

    TimeoutDiagnostic {
        signal: None,
        requests,
        handles,
    }
}

fn summarize_handle(value: &Value) -> HandleSummary {
    let Value::Object(map) = value else {
        return HandleSummary::Opaque(value.clone());
    };

    // Any non-zero number, including fractional and negative delays.
    let msecs = field(map, &["msecs"]).and_then(|ms| match ms {
        Value::Number(ms) => Some(ms.clone()),
        _ => None,
    });
    let events = field(map, &["_events", "events"]).and_then(|events| match events {
        Value::Object(listeners) => Some(listeners.keys().cloned().collect()),
        Value::Array(names) => Some(
            names
                .iter()
                .filter_map(|name| name.as_str().map(str::to_owned))
                .collect(),
        ),
        _ => None,
    });

    HandleSummary::Described(HandleDescription {
        kind: kind_name(map),
        msecs,
        events,
        sockname: field(map, &["_sockname", "sockname"]).cloned(),
        connection_key: field(map, &["_connectionKey", "connectionKey"]).cloned(),
    })
}

fn summarize_request(value: &Value) -> RequestSummary {
    let Value::Object(map) = value else {
        return RequestSummary::Opaque(value.clone());
    };

    RequestSummary::Described(RequestDescription {
        kind: kind_name(map),
        context: field(map, &["context"]).cloned(),
    })
}

fn kind_name(map: &Map<String, Value>) -> String {
    field(map, &["type", "constructor"])
        .and_then(Value::as_str)
        .unwrap_or("Object")
        .to_owned()
}

/// Returns the first of `keys` that is present with a truthy value.
fn field<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| map.get(*key))
        .find(|value| is_truthy(value))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// A registry of pending handles and requests.
///
/// Cloning the registry produces another reference to the same set of resources.
#[derive(Clone, Debug, Default)]
pub struct ActiveResources {
    inner: Arc<Mutex<ResourcesInner>>,
}

#[derive(Debug, Default)]
struct ResourcesInner {
    next_id: u64,
    handles: IndexMap<u64, Value>,
    requests: IndexMap<u64, Value>,
}

#[derive(Clone, Copy, Debug)]
enum ResourceKind {
    Handle,
    Request,
}

impl ActiveResources {
    /// Creates a new, empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending handle. It is unregistered when the returned guard is dropped.
    pub fn track_handle(&self, description: Value) -> ResourceGuard {
        self.track(ResourceKind::Handle, description)
    }

    /// Registers a pending request. It is unregistered when the returned guard is dropped.
    pub fn track_request(&self, description: Value) -> ResourceGuard {
        self.track(ResourceKind::Request, description)
    }

    /// Returns all pending handles, starting with the three standard streams.
    pub fn handles(&self) -> Vec<ActiveHandle> {
        let inner = self.lock();
        [StdioStream::Stdin, StdioStream::Stdout, StdioStream::Stderr]
            .into_iter()
            .map(ActiveHandle::Stdio)
            .chain(inner.handles.values().cloned().map(ActiveHandle::Resource))
            .collect()
    }

    /// Returns all pending requests.
    pub fn requests(&self) -> Vec<Value> {
        self.lock().requests.values().cloned().collect()
    }

    /// Summarizes everything that is currently pending.
    pub fn snapshot(&self) -> TimeoutDiagnostic {
        snapshot(&self.handles(), &self.requests())
    }

    fn track(&self, kind: ResourceKind, description: Value) -> ResourceGuard {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        match kind {
            ResourceKind::Handle => inner.handles.insert(id, description),
            ResourceKind::Request => inner.requests.insert(id, description),
        };

        ResourceGuard {
            registry: Arc::downgrade(&self.inner),
            kind,
            id,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ResourcesInner> {
        // The registry only holds plain data, so a panic while it was locked leaves it usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps a resource registered with [`ActiveResources`] until dropped.
#[derive(Debug)]
#[must_use = "the resource is unregistered as soon as the guard is dropped"]
pub struct ResourceGuard {
    registry: Weak<Mutex<ResourcesInner>>,
    kind: ResourceKind,
    id: u64,
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut inner = registry.lock().unwrap_or_else(PoisonError::into_inner);
        match self.kind {
            ResourceKind::Handle => inner.handles.shift_remove(&self.id),
            ResourceKind::Request => inner.requests.shift_remove(&self.id),
        };
    }
}
