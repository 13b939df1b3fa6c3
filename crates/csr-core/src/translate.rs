use serde_json::Value;
use tracing::warn;

use crate::model::{SigningRequest, SIGNING_REQUEST_KIND};
use crate::store::{RawEvent, EVENT_ADDED, EVENT_DELETED, EVENT_MODIFIED};

/// Result of classifying one raw change notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Delivered(SigningRequest),
    Skipped(MalformedEvent),
}

/// Which change a delivered request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl ChangeKind {
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            EVENT_ADDED => Some(Self::Added),
            EVENT_MODIFIED => Some(Self::Modified),
            EVENT_DELETED => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// A translated request together with the change that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub kind: ChangeKind,
    pub request: SigningRequest,
}

/// An event that did not carry a signing request, together with why.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedEvent {
    pub event: RawEvent,
    pub reason: String,
}

/// Receives events dropped by a translation task.
pub trait DiagnosticSink: Send + Sync {
    fn malformed_event(&self, diagnostic: &MalformedEvent);
}

impl<F> DiagnosticSink for F
where
    F: Fn(&MalformedEvent) + Send + Sync,
{
    fn malformed_event(&self, diagnostic: &MalformedEvent) {
        (self)(diagnostic)
    }
}

/// Reports dropped events as warnings.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl DiagnosticSink for TracingDiagnostics {
    fn malformed_event(&self, diagnostic: &MalformedEvent) {
        warn!(
            target = "csr.watch",
            event_type = %diagnostic.event.event_type,
            reason = %diagnostic.reason,
            event = %diagnostic.event.object,
            "dropping watch event"
        );
    }
}

pub fn translate(event: RawEvent) -> Outcome {
    match translate_change(event) {
        Ok(change) => Outcome::Delivered(change.request),
        Err(diagnostic) => Outcome::Skipped(diagnostic),
    }
}

/// Like [`translate`], keeping the change kind of a delivered request.
pub fn translate_change(event: RawEvent) -> Result<WatchEvent, MalformedEvent> {
    match classify(&event) {
        Ok((kind, request)) => Ok(WatchEvent { kind, request }),
        Err(reason) => Err(MalformedEvent { event, reason }),
    }
}

fn classify(event: &RawEvent) -> Result<(ChangeKind, SigningRequest), String> {
    let kind = match event.event_type.as_str() {
        "" => return Err("event has no type".into()),
        other => ChangeKind::from_event_type(other)
            .ok_or_else(|| format!("event type {other} does not carry a signing request"))?,
    };

    let Value::Object(object) = &event.object else {
        return Err("event object is not a JSON object".into());
    };
    match object.get("kind") {
        None => {}
        Some(Value::String(kind)) if kind == SIGNING_REQUEST_KIND => {}
        Some(other) => return Err(format!("unexpected object kind {other}")),
    }

    let request: SigningRequest = serde_json::from_value(event.object.clone())
        .map_err(|err| format!("object does not decode as a signing request: {err}"))?;
    if request.name().is_empty() {
        return Err("signing request has no name".into());
    }
    Ok((kind, request))
}
