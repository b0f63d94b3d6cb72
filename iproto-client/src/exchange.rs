//! Request state machines.
//!
//! Every in-flight exchange on a connection is registered under its sync.
//! A [`SingleShot`] resolves exactly once, through a oneshot channel; a
//! [`Watch`] stays registered for as long as the subscription lives.

use crate::connection::Connection;
use crate::error::ClientError;
use dashmap::DashMap;
use iproto_protocol::constants::body_key;
use iproto_protocol::{request, Request, Response};
use parking_lot::Mutex;
use rmpv::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

/// Callback for out-of-band pushes tied to a pending request.
pub type PushCallback = Arc<dyn Fn(Response) + Send + Sync>;

/// Callback for watcher notifications.
pub type EventCallback = Arc<dyn Fn(WatchEvent) + Send + Sync>;

/// Callback for a watch that terminated with an error.
pub type ErrorHandler = Arc<dyn Fn(ClientError) + Send + Sync>;

/// Result delivered to the caller of a single-shot exchange.
pub type ResponseResult = Result<Response, ClientError>;

/// One in-flight exchange, as seen by the receive loop.
pub(crate) trait Exchange: Send + Sync {
    /// Feeds a response. Returns `true` once the exchange is resolved and
    /// must leave the registry.
    fn process(&self, response: Response) -> bool;

    /// Resolves the exchange exceptionally. No-op once resolved.
    fn kill(&self, error: ClientError);
}

/// Map of sync to in-flight exchange, shared by a connection and its
/// exchanges.
#[derive(Default)]
pub(crate) struct Registry {
    entries: DashMap<u64, Arc<dyn Exchange>>,
    drained: Notify,
}

impl Registry {
    pub(crate) fn insert(&self, sync: u64, exchange: Arc<dyn Exchange>) {
        let previous = self.entries.insert(sync, exchange);
        debug_assert!(
            previous.is_none(),
            "sync {sync} registered while still in flight"
        );
    }

    pub(crate) fn get(&self, sync: u64) -> Option<Arc<dyn Exchange>> {
        self.entries.get(&sync).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn remove(&self, sync: u64) -> Option<Arc<dyn Exchange>> {
        let removed = self.entries.remove(&sync).map(|(_, exchange)| exchange);
        if self.entries.is_empty() {
            self.drained.notify_waiters();
        }
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes and returns every registered exchange.
    pub(crate) fn drain(&self) -> Vec<Arc<dyn Exchange>> {
        let syncs: Vec<u64> = self.entries.iter().map(|entry| *entry.key()).collect();
        syncs
            .into_iter()
            .filter_map(|sync| self.remove(sync))
            .collect()
    }

    /// Waits until no exchange is registered.
    pub(crate) async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// Per-request options.
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Overrides the connection's default request timeout.
    pub timeout: Option<Duration>,
    /// Places the request in a transaction stream.
    pub stream_id: Option<u64>,
    /// Receives `CHUNK` pushes sent before the final response.
    pub on_push: Option<PushCallback>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_stream_id(mut self, stream_id: u64) -> Self {
        self.stream_id = Some(stream_id);
        self
    }

    pub fn with_push_callback(mut self, callback: impl Fn(Response) + Send + Sync + 'static) -> Self {
        self.on_push = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptions")
            .field("timeout", &self.timeout)
            .field("stream_id", &self.stream_id)
            .field("on_push", &self.on_push.is_some())
            .finish()
    }
}

/// Completion handle of a single-shot exchange.
#[derive(Debug)]
pub struct ResponseHandle {
    sync: u64,
    rx: oneshot::Receiver<ResponseResult>,
}

impl ResponseHandle {
    /// Sync the request was sent under.
    pub fn sync(&self) -> u64 {
        self.sync
    }

    /// Waits for the exchange to resolve.
    pub async fn wait(self) -> ResponseResult {
        self.rx
            .await
            .unwrap_or_else(|_| Err(ClientError::closed("closed unexpectedly")))
    }
}

/// A request that resolves exactly once.
pub struct SingleShot {
    request: Mutex<Option<Request>>,
    timeout: Duration,
    on_push: Option<PushCallback>,
    started: AtomicBool,
    sync: AtomicU64,
    tx: Mutex<Option<oneshot::Sender<ResponseResult>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    registry: Mutex<Weak<Registry>>,
}

impl SingleShot {
    pub fn new(request: Request, timeout: Duration, on_push: Option<PushCallback>) -> Arc<Self> {
        Arc::new(Self {
            request: Mutex::new(Some(request)),
            timeout,
            on_push,
            started: AtomicBool::new(false),
            sync: AtomicU64::new(0),
            tx: Mutex::new(None),
            timer: Mutex::new(None),
            registry: Mutex::new(Weak::new()),
        })
    }

    /// Registers under a fresh sync, arms the timer and sends the request.
    /// Fails with `ProtocolUsage` when called a second time.
    pub async fn start(self: &Arc<Self>, connection: &Connection) -> Result<ResponseHandle, ClientError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ClientError::ProtocolUsage("single-shot request started twice"));
        }
        let mut request = self
            .request
            .lock()
            .take()
            .ok_or(ClientError::ProtocolUsage("single-shot request started twice"))?;

        let sync = connection.next_sync();
        request.set_sync(sync);
        let frame = request.encode()?;

        let (tx, rx) = oneshot::channel();
        self.sync.store(sync, Ordering::SeqCst);
        *self.tx.lock() = Some(tx);

        let registry = connection.registry();
        *self.registry.lock() = Arc::downgrade(registry);
        registry.insert(sync, Arc::clone(self) as Arc<dyn Exchange>);
        self.arm_timer();

        // teardown flips the state before draining, so an entry inserted
        // after the drain is caught here
        if connection.is_closed() {
            self.kill(connection.closed_error());
            return Err(connection.closed_error());
        }

        tracing::debug!(
            "sending {} sync={} ({} bytes)",
            request.request_type(),
            sync,
            frame.len()
        );
        if let Err(e) = connection.write_frame(&frame).await {
            self.disarm();
            registry.remove(sync);
            self.tx.lock().take();
            return Err(e);
        }

        Ok(ResponseHandle { sync, rx })
    }

    pub fn sync(&self) -> u64 {
        self.sync.load(Ordering::SeqCst)
    }

    pub fn is_resolved(&self) -> bool {
        self.started.load(Ordering::SeqCst) && self.tx.lock().is_none()
    }

    fn arm_timer(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let timeout = self.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(exchange) = weak.upgrade() {
                tracing::debug!("request sync={} timed out", exchange.sync());
                exchange.kill(ClientError::Timeout);
            }
        });
        *self.timer.lock() = Some(timer);
    }

    fn disarm(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }

    fn resolve(&self, result: ResponseResult) -> bool {
        let Some(tx) = self.tx.lock().take() else {
            return false;
        };
        self.disarm();
        if let Some(registry) = self.registry.lock().upgrade() {
            registry.remove(self.sync());
        }
        // the caller may have dropped the handle
        let _ = tx.send(result);
        true
    }
}

impl Exchange for SingleShot {
    fn process(&self, response: Response) -> bool {
        if response.is_push() {
            match self.on_push {
                Some(ref callback) => callback(response),
                None => tracing::debug!("dropping push for sync={} without callback", self.sync()),
            }
            return false;
        }
        let result = match response.server_error() {
            Some(error) => Err(ClientError::Server(error)),
            None => Ok(response),
        };
        self.resolve(result);
        true
    }

    fn kill(&self, error: ClientError) {
        self.resolve(Err(error));
    }
}

/// A watcher notification.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub key: String,
    /// Value of the key; absent when the key is unset.
    pub data: Option<Value>,
}

impl WatchEvent {
    pub fn from_response(response: &Response) -> Result<Self, ClientError> {
        let key = response
            .event_key()
            .ok_or(iproto_protocol::ProtocolError::MissingField("event key"))?;
        let data = response.field(body_key::EVENT_DATA)?;
        Ok(Self { key, data })
    }
}

/// A long-lived subscription to one key.
///
/// Each notification invokes the callback and re-sends `WATCH` to
/// acknowledge it, which asks the server for the next change.
pub struct Watch {
    key: String,
    on_event: EventCallback,
    on_error: Option<ErrorHandler>,
    started: AtomicBool,
    terminated: AtomicBool,
    sync: AtomicU64,
    connection: Weak<Connection>,
}

impl Watch {
    pub(crate) fn new(
        key: impl Into<String>,
        connection: &Arc<Connection>,
        on_event: EventCallback,
        on_error: Option<ErrorHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            on_event,
            on_error,
            started: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            sync: AtomicU64::new(0),
            connection: Arc::downgrade(connection),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Sends the first `WATCH`. Fails with `ProtocolUsage` when called twice.
    pub(crate) async fn start(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ClientError::ProtocolUsage("watch started twice"));
        }
        self.send().await
    }

    /// (Re-)sends `WATCH` under a fresh sync, replacing the previous
    /// registration so errors still reach this watch.
    pub(crate) async fn send(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.is_terminated() {
            return Ok(());
        }
        let connection = self.connection.upgrade().ok_or(ClientError::NotConnected)?;
        let sync = connection.next_sync();
        let previous = self.sync.swap(sync, Ordering::SeqCst);

        let registry = connection.registry();
        registry.insert(sync, Arc::clone(self) as Arc<dyn Exchange>);
        if previous != 0 {
            registry.remove(previous);
        }
        if connection.is_closed() {
            registry.remove(sync);
            return Err(connection.closed_error());
        }

        let frame = request::watch(&self.key).with_sync(sync).encode()?;
        tracing::debug!("sending WATCH key={} sync={}", self.key, sync);
        if let Err(e) = connection.write_frame(&frame).await {
            registry.remove(sync);
            return Err(e);
        }
        Ok(())
    }

    /// Delivers a notification to the callback.
    pub(crate) fn notify(&self, response: &Response) {
        if self.is_terminated() {
            return;
        }
        match WatchEvent::from_response(response) {
            Ok(event) => (self.on_event)(event),
            Err(e) => tracing::warn!("malformed event for key {}: {}", self.key, e),
        }
    }

    /// Stops the watch without reporting an error. Returns the sync it was
    /// last registered under.
    pub(crate) fn cancel(&self) -> u64 {
        self.terminated.store(true, Ordering::SeqCst);
        self.sync.load(Ordering::SeqCst)
    }

    fn terminate(&self, error: ClientError) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(connection) = self.connection.upgrade() {
            connection.forget_watch(&self.key);
        }
        match self.on_error {
            Some(ref handler) => handler(error),
            None => tracing::warn!("watch on {} terminated: {}", self.key, error),
        }
    }
}

impl Exchange for Watch {
    fn process(&self, response: Response) -> bool {
        match response.server_error() {
            Some(error) => {
                self.terminate(ClientError::Server(error));
                true
            }
            None => {
                if response.is_event() {
                    self.notify(&response);
                }
                false
            }
        }
    }

    fn kill(&self, error: ClientError) {
        self.terminate(error);
    }
}
