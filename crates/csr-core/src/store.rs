use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::model::SigningRequest;

pub const EVENT_ADDED: &str = "ADDED";
pub const EVENT_MODIFIED: &str = "MODIFIED";
pub const EVENT_DELETED: &str = "DELETED";
pub const EVENT_BOOKMARK: &str = "BOOKMARK";
pub const EVENT_ERROR: &str = "ERROR";

/// Remote store holding signing requests. Implementations must be safe to use
/// from several watch sessions and approval calls at once.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Open a subscription yielding every change notification for signing
    /// requests, starting with the current set of requests.
    async fn watch_signing_requests(&self) -> Result<Subscription, StoreError>;

    /// Conditionally write `request`'s status conditions to the approval
    /// subresource of the request called `name`.
    async fn submit_approval_update(
        &self,
        name: &str,
        request: &SigningRequest,
    ) -> Result<SigningRequest, StoreError>;
}

/// One change notification exactly as the store delivered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub object: Value,
}

impl RawEvent {
    pub fn new(event_type: impl Into<String>, object: Value) -> Self {
        Self {
            event_type: event_type.into(),
            object,
        }
    }

    pub fn added(request: &SigningRequest) -> Self {
        Self::for_request(EVENT_ADDED, request)
    }

    pub fn modified(request: &SigningRequest) -> Self {
        Self::for_request(EVENT_MODIFIED, request)
    }

    pub fn deleted(request: &SigningRequest) -> Self {
        Self::for_request(EVENT_DELETED, request)
    }

    fn for_request(event_type: &str, request: &SigningRequest) -> Self {
        Self::new(
            event_type,
            serde_json::to_value(request).unwrap_or_default(),
        )
    }

    /// Decode one line of a newline-delimited watch body. Lines that are not a
    /// watch event envelope are kept verbatim as an untyped event so the
    /// translator can report them.
    pub fn decode_line(line: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(line) {
            Ok(Value::Object(map)) if map.contains_key("type") => {
                serde_json::from_value(Value::Object(map.clone()))
                    .unwrap_or_else(|_| Self::new("", Value::Object(map)))
            }
            Ok(other) => Self::new("", other),
            Err(_) => Self::new("", Value::String(String::from_utf8_lossy(line).into_owned())),
        }
    }
}

/// Receive side of a watch. Dropping it releases the underlying connection.
pub struct Subscription {
    events: BoxStream<'static, Result<RawEvent, StoreError>>,
}

impl Subscription {
    pub fn new<S>(events: S) -> Self
    where
        S: Stream<Item = Result<RawEvent, StoreError>> + Send + 'static,
    {
        Self {
            events: events.boxed(),
        }
    }

    pub fn from_receiver(mut rx: mpsc::UnboundedReceiver<Result<RawEvent, StoreError>>) -> Self {
        Self::new(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)))
    }

    pub async fn next_event(&mut self) -> Option<Result<RawEvent, StoreError>> {
        self.events.next().await
    }
}

type WatchSender = mpsc::UnboundedSender<Result<RawEvent, StoreError>>;

/// In-memory store for tests and local wiring. Updates are checked against the
/// stored `resourceVersion` the same way the cluster does.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    requests: BTreeMap<String, SigningRequest>,
    submissions: Vec<SigningRequest>,
    watchers: Vec<WatchSender>,
    next_update_error: Option<StoreError>,
    next_watch_error: Option<StoreError>,
    revision: u64,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create or replace a request and notify open watches.
    pub fn insert(&self, mut request: SigningRequest) -> SigningRequest {
        let mut guard = self.inner.lock();
        guard.revision += 1;
        request.metadata.resource_version = Some(guard.revision.to_string());
        let event = if guard.requests.contains_key(request.name()) {
            RawEvent::modified(&request)
        } else {
            RawEvent::added(&request)
        };
        guard
            .requests
            .insert(request.name().to_string(), request.clone());
        broadcast(&mut guard.watchers, Ok(event));
        request
    }

    pub fn remove(&self, name: &str) -> Option<SigningRequest> {
        let mut guard = self.inner.lock();
        let removed = guard.requests.remove(name)?;
        broadcast(&mut guard.watchers, Ok(RawEvent::deleted(&removed)));
        Some(removed)
    }

    /// Push an arbitrary raw event to every open watch.
    pub fn emit(&self, event: RawEvent) {
        broadcast(&mut self.inner.lock().watchers, Ok(event));
    }

    /// Fail every open watch with `err`.
    pub fn fail_watches(&self, err: StoreError) {
        broadcast(&mut self.inner.lock().watchers, Err(err));
    }

    /// End every open watch as if the server closed the connection.
    pub fn close_watches(&self) {
        self.inner.lock().watchers.clear();
    }

    pub fn fail_next_update(&self, err: StoreError) {
        self.inner.lock().next_update_error = Some(err);
    }

    pub fn fail_next_watch(&self, err: StoreError) {
        self.inner.lock().next_watch_error = Some(err);
    }

    pub fn get(&self, name: &str) -> Option<SigningRequest> {
        self.inner.lock().requests.get(name).cloned()
    }

    /// Every approval update accepted or rejected by the store, in call order.
    pub fn submissions(&self) -> Vec<SigningRequest> {
        self.inner.lock().submissions.clone()
    }

    /// Number of watches whose receiver is still alive.
    pub fn open_watches(&self) -> usize {
        let mut guard = self.inner.lock();
        guard.watchers.retain(|tx| !tx.is_closed());
        guard.watchers.len()
    }
}

fn broadcast(watchers: &mut Vec<WatchSender>, item: Result<RawEvent, StoreError>) {
    watchers.retain(|tx| tx.send(item.clone()).is_ok());
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn watch_signing_requests(&self) -> Result<Subscription, StoreError> {
        let mut guard = self.inner.lock();
        if let Some(err) = guard.next_watch_error.take() {
            return Err(err);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for request in guard.requests.values() {
            let _ = tx.send(Ok(RawEvent::added(request)));
        }
        guard.watchers.push(tx);
        Ok(Subscription::from_receiver(rx))
    }

    async fn submit_approval_update(
        &self,
        name: &str,
        request: &SigningRequest,
    ) -> Result<SigningRequest, StoreError> {
        let mut guard = self.inner.lock();
        guard.submissions.push(request.clone());
        if let Some(err) = guard.next_update_error.take() {
            return Err(err);
        }
        let Some(current) = guard.requests.get(name) else {
            return Err(StoreError::Api {
                status: 404,
                message: format!("certificatesigningrequests \"{name}\" not found"),
            });
        };
        if let Some(expected) = request.metadata.resource_version.as_deref() {
            if current.metadata.resource_version.as_deref() != Some(expected) {
                return Err(StoreError::Conflict {
                    name: name.to_string(),
                    message: "the object has been modified; please apply your changes to the latest version and try again".into(),
                });
            }
        }
        let mut updated = current.clone();
        updated.status.conditions = request.status.conditions.clone();
        guard.revision += 1;
        updated.metadata.resource_version = Some(guard.revision.to_string());
        guard.requests.insert(name.to_string(), updated.clone());
        broadcast(&mut guard.watchers, Ok(RawEvent::modified(&updated)));
        Ok(updated)
    }
}
