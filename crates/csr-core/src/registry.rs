use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{StoreError, WatchError};
use crate::model::SigningRequest;
use crate::store::{RequestStore, Subscription};
use crate::translate::{translate_change, DiagnosticSink, WatchEvent};

const DEFAULT_WATCH_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Requests translated ahead of the consumer before the session waits.
    pub buffer: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            buffer: DEFAULT_WATCH_BUFFER,
        }
    }
}

/// Why a watch stream stopped producing requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// The store closed the subscription.
    Exhausted,
    /// The session was cancelled or its consumer went away.
    Cancelled,
    /// The subscription failed mid-stream.
    Failed(StoreError),
}

/// Owns every watch session opened by one controller instance.
///
/// The session table is the only shared mutable state. Its lock is held for
/// table mutation and cancellation only, never while talking to the store.
#[derive(Clone)]
pub struct WatchRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    store: Arc<dyn RequestStore>,
    diagnostics: Arc<dyn DiagnosticSink>,
    config: WatchConfig,
    next_id: AtomicU64,
    sessions: Mutex<SessionTable>,
}

#[derive(Default)]
struct SessionTable {
    stopped: bool,
    handles: Vec<SessionHandle>,
}

struct SessionHandle {
    id: u64,
    cancel: CancellationToken,
}

impl WatchRegistry {
    pub fn new(
        store: Arc<dyn RequestStore>,
        diagnostics: Arc<dyn DiagnosticSink>,
        config: WatchConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                store,
                diagnostics,
                config,
                next_id: AtomicU64::new(1),
                sessions: Mutex::new(SessionTable::default()),
            }),
        }
    }

    /// Open a subscription and start translating it into a stream of requests.
    ///
    /// Nothing is registered when the store refuses the subscription. A
    /// subscription that finishes opening after [`stop_all`](Self::stop_all)
    /// is dropped straight away and reported as [`WatchError::Stopped`].
    pub async fn open_watch(&self) -> Result<WatchStream, WatchError> {
        if self.is_stopped() {
            return Err(WatchError::Stopped);
        }

        let subscription = self
            .inner
            .store
            .watch_signing_requests()
            .await
            .map_err(|err| {
                warn!(target = "csr.watch", error = %err, "failed to open watch");
                WatchError::Subscription(err)
            })?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        {
            let mut table = self.inner.sessions.lock();
            if table.stopped {
                debug!(target = "csr.watch", session_id = id, "registry stopped while opening watch");
                return Err(WatchError::Stopped);
            }
            table.handles.push(SessionHandle {
                id,
                cancel: cancel.clone(),
            });
        }

        let (tx, rx) = mpsc::channel(self.inner.config.buffer.max(1));
        let (end_tx, end_rx) = oneshot::channel();
        let session = WatchSession {
            id,
            subscription,
            cancel: cancel.clone(),
            output: tx,
            diagnostics: Arc::clone(&self.inner.diagnostics),
            registry: Arc::downgrade(&self.inner),
        };
        tokio::spawn(session.run(end_tx));
        debug!(target = "csr.watch", session_id = id, "watch session started");

        Ok(WatchStream {
            id,
            rx,
            cancelled: cancel.child_token(),
            end: end_rx,
        })
    }

    /// Cancel every registered session. Later calls are no-ops and later
    /// `open_watch` calls fail with [`WatchError::Stopped`].
    pub fn stop_all(&self) {
        let mut table = self.inner.sessions.lock();
        let first = !table.stopped;
        table.stopped = true;
        let count = table.handles.len();
        for handle in table.handles.drain(..) {
            handle.cancel.cancel();
        }
        drop(table);
        if first {
            info!(target = "csr.watch", sessions = count, "stopped watch sessions");
        }
    }

    /// Cancel a single session. Returns false if it already ended.
    pub fn cancel(&self, session_id: u64) -> bool {
        let mut table = self.inner.sessions.lock();
        let Some(pos) = table.handles.iter().position(|h| h.id == session_id) else {
            return false;
        };
        table.handles.swap_remove(pos).cancel.cancel();
        true
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.lock().handles.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.sessions.lock().stopped
    }
}

impl RegistryInner {
    fn deregister(&self, session_id: u64) {
        self.sessions.lock().handles.retain(|h| h.id != session_id);
    }
}

/// One live subscription and the task translating it.
struct WatchSession {
    id: u64,
    subscription: Subscription,
    cancel: CancellationToken,
    output: mpsc::Sender<WatchEvent>,
    diagnostics: Arc<dyn DiagnosticSink>,
    registry: Weak<RegistryInner>,
}

impl WatchSession {
    async fn run(mut self, end_tx: oneshot::Sender<StreamEnd>) {
        let end = loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break StreamEnd::Cancelled,
                _ = self.output.closed() => break StreamEnd::Cancelled,
                next = self.subscription.next_event() => next,
            };

            let event = match next {
                None => break StreamEnd::Exhausted,
                Some(Err(err)) => {
                    warn!(target = "csr.watch", session_id = self.id, error = %err, "watch stream failed");
                    break StreamEnd::Failed(err);
                }
                Some(Ok(event)) => event,
            };

            match translate_change(event) {
                Ok(change) => {
                    // A consumer that stopped reading must not hold up cancellation.
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break StreamEnd::Cancelled,
                        sent = self.output.send(change) => {
                            if sent.is_err() {
                                break StreamEnd::Cancelled;
                            }
                        }
                    }
                }
                Err(diagnostic) => self.diagnostics.malformed_event(&diagnostic),
            }
        };

        debug!(target = "csr.watch", session_id = self.id, end = ?end, "watch session finished");
        drop(self.subscription);
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(self.id);
        }
        let _ = end_tx.send(end);
    }
}

/// Consumer side of a watch session: translated requests in receive order.
pub struct WatchStream {
    id: u64,
    rx: mpsc::Receiver<WatchEvent>,
    cancelled: CancellationToken,
    end: oneshot::Receiver<StreamEnd>,
}

impl WatchStream {
    pub fn session_id(&self) -> u64 {
        self.id
    }

    /// Next request, or `None` once the session has ended. Requests still
    /// buffered when the session is cancelled are discarded.
    pub async fn recv(&mut self) -> Option<SigningRequest> {
        self.recv_event().await.map(|change| change.request)
    }

    /// Like [`recv`](Self::recv), keeping whether the request was added,
    /// modified or deleted.
    pub async fn recv_event(&mut self) -> Option<WatchEvent> {
        if self.cancelled.is_cancelled() {
            self.rx.close();
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancelled.cancelled() => {
                self.rx.close();
                None
            }
            next = self.rx.recv() => next,
        }
    }

    /// How the session ended. Meant to be awaited after `recv` returned
    /// `None`; calling it earlier closes the stream.
    pub async fn end(self) -> StreamEnd {
        let WatchStream { rx, end, .. } = self;
        drop(rx);
        end.await.unwrap_or(StreamEnd::Cancelled)
    }
}

impl Stream for WatchStream {
    type Item = SigningRequest;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancelled.is_cancelled() {
            self.rx.close();
            return Poll::Ready(None);
        }
        self.rx
            .poll_recv(cx)
            .map(|next| next.map(|change| change.request))
    }
}
