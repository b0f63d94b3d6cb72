//! Connection management.

use crate::config::{ClientConfig, InstanceConnectionGroup};
use crate::error::ClientError;
use crate::exchange::{
    ErrorHandler, EventCallback, Exchange, PushCallback, Registry, RequestOptions,
    ResponseHandle, SingleShot, Watch,
};
use dashmap::DashMap;
use iproto_protocol::constants::{body_key, feature};
use iproto_protocol::greeting::GREETING_SIZE;
use iproto_protocol::{request, AuthMechanism, Decoder, Greeting, Request, Response, PROTOCOL_VERSION};
use parking_lot::RwLock;
use rmpv::Value;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

pub(crate) const REASON_SERVER: &str = "shutdown by server";
pub(crate) const REASON_CLIENT: &str = "shutdown by client";
pub(crate) const REASON_UNEXPECTED: &str = "closed unexpectedly";

const GUEST: &str = "guest";

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Connection plus greeting timeout.
    pub connect_timeout: Duration,
    /// Default request timeout.
    pub request_timeout: Duration,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    pub user: String,
    pub password: String,
    pub auth_mechanism: AuthMechanism,
    /// Send an ID request after the greeting.
    pub identify: bool,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            user: GUEST.to_string(),
            password: String::new(),
            auth_mechanism: AuthMechanism::ChapSha1,
            identify: true,
        }
    }

    /// Derives the configuration of one pool slot.
    pub fn from_group(group: &InstanceConnectionGroup, config: &ClientConfig) -> Self {
        Self::new(group.host.clone(), group.port)
            .with_credentials(group.user.clone(), group.password.clone())
            .with_auth_mechanism(group.auth_mechanism)
            .with_connect_timeout(config.connect_timeout())
            .with_request_timeout(config.request_timeout())
            .with_read_buffer_size(config.read_buffer_size)
            .with_identify(config.identify)
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_auth_mechanism(mut self, mechanism: AuthMechanism) -> Self {
        self.auth_mechanism = mechanism;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_identify(mut self, identify: bool) -> Self {
        self.identify = identify;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn needs_auth(&self) -> bool {
        !(self.user == GUEST && self.password.is_empty())
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Protocol version and features announced by the server in the ID exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFeatures {
    pub version: u64,
    pub features: Vec<u64>,
}

impl ServerFeatures {
    pub fn supports(&self, feature: u64) -> bool {
        self.features.contains(&feature)
    }
}

/// A multiplexed connection to an IProto server.
pub struct Connection {
    config: ConnectionConfig,
    state: AtomicU8,
    /// Write half of the socket; every frame is written under this lock.
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// In-flight exchanges by sync.
    registry: Arc<Registry>,
    /// Active watches by key.
    watchers: DashMap<String, Arc<Watch>>,
    next_sync: AtomicU64,
    next_stream_id: AtomicU64,
    /// Highest schema version seen on any response.
    schema_version: AtomicU64,
    greeting: RwLock<Option<Greeting>>,
    features: RwLock<Option<ServerFeatures>>,
    /// Receives out-of-band frames that belong to no exchange.
    push_sink: RwLock<Option<PushCallback>>,
    /// Why the connection closed; set once, before the state flips.
    close_reason: RwLock<Option<&'static str>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            writer: Mutex::new(None),
            registry: Arc::new(Registry::default()),
            watchers: DashMap::new(),
            next_sync: AtomicU64::new(1),
            next_stream_id: AtomicU64::new(1),
            schema_version: AtomicU64::new(0),
            greeting: RwLock::new(None),
            features: RwLock::new(None),
            push_sink: RwLock::new(None),
            close_reason: RwLock::new(None),
            reader: parking_lot::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Error for requests that race with teardown.
    pub(crate) fn closed_error(&self) -> ClientError {
        ClientError::closed(self.close_reason.read().unwrap_or(REASON_UNEXPECTED))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn greeting(&self) -> Option<Greeting> {
        self.greeting.read().clone()
    }

    pub fn server_features(&self) -> Option<ServerFeatures> {
        self.features.read().clone()
    }

    /// Highest schema version reported by the server so far.
    pub fn schema_version(&self) -> u64 {
        self.schema_version.load(Ordering::SeqCst)
    }

    /// Number of registered in-flight exchanges.
    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    /// Attaches a sink for out-of-band frames that match no exchange.
    pub fn set_push_sink(&self, sink: impl Fn(Response) + Send + Sync + 'static) {
        *self.push_sink.write() = Some(Arc::new(sink));
    }

    /// Allocates a stream id for a server-side transaction.
    pub fn next_stream_id(&self) -> u64 {
        self.next_stream_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn next_sync(&self) -> u64 {
        self.next_sync.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Connects, reads the greeting, negotiates features and authenticates.
    pub async fn connect(self: &Arc<Self>) -> Result<Greeting, ClientError> {
        if !self.transition(ConnectionState::Disconnected, ConnectionState::Connecting) {
            return Err(ClientError::ProtocolUsage("connect called on a used connection"));
        }

        let address = self.config.address();
        tracing::debug!("Connecting to {}...", address);

        let opened = tokio::time::timeout(self.config.connect_timeout, async {
            let mut stream = TcpStream::connect((self.config.host.as_str(), self.config.port)).await?;
            stream.set_nodelay(true).ok();
            let mut buf = [0u8; GREETING_SIZE];
            stream.read_exact(&mut buf).await?;
            let greeting = Greeting::parse(&buf)?;
            Ok::<_, ClientError>((stream, greeting))
        })
        .await;

        let (stream, greeting) = match opened {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                tracing::debug!("Connection to {} failed: {}", address, e);
                self.state.store(ConnectionState::Closed as u8, Ordering::SeqCst);
                return Err(e);
            }
            Err(_) => {
                tracing::debug!("Connection to {} timed out", address);
                self.state.store(ConnectionState::Closed as u8, Ordering::SeqCst);
                return Err(ClientError::Timeout);
            }
        };
        tracing::debug!(
            "Greeting from {} {} instance {}",
            greeting.product,
            greeting.version,
            greeting.instance_id
        );

        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        *self.greeting.write() = Some(greeting.clone());

        let reader = tokio::spawn(read_loop(
            Arc::downgrade(self),
            read_half,
            self.config.read_buffer_size,
        ));
        *self.reader.lock() = Some(reader);

        if let Err(e) = self.handshake(&greeting).await {
            tracing::debug!("Handshake with {} failed: {}", address, e);
            self.close().await;
            return Err(e);
        }

        if !self.transition(ConnectionState::Connecting, ConnectionState::Connected) {
            return Err(ClientError::closed(REASON_UNEXPECTED));
        }
        tracing::info!("Connected to {}", address);
        Ok(greeting)
    }

    async fn handshake(&self, greeting: &Greeting) -> Result<(), ClientError> {
        if self.config.identify {
            self.identify().await;
        }
        if self.config.needs_auth() {
            self.auth_with_salt(
                &self.config.user,
                &self.config.password,
                self.config.auth_mechanism,
                &greeting.salt,
            )
            .await?;
            tracing::debug!("Authenticated as {}", self.config.user);
        }
        Ok(())
    }

    /// ID exchange. Servers predating it answer with an error, which is
    /// tolerated.
    async fn identify(&self) {
        let request = request::id(
            PROTOCOL_VERSION,
            &[
                feature::STREAMS,
                feature::TRANSACTIONS,
                feature::ERROR_EXTENSION,
                feature::WATCHERS,
            ],
        );
        let response = match self.exchange(request, RequestOptions::default()).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("ID exchange not supported: {}", e);
                return;
            }
        };

        let version = match response.field(body_key::VERSION) {
            Ok(Some(v)) => v.as_u64().unwrap_or_default(),
            _ => 0,
        };
        let features = match response.field(body_key::FEATURES) {
            Ok(Some(Value::Array(items))) => items.iter().filter_map(Value::as_u64).collect(),
            _ => Vec::new(),
        };
        tracing::debug!("Server protocol version {} features {:?}", version, features);
        *self.features.write() = Some(ServerFeatures { version, features });
    }

    /// Authenticates the connection as `user`.
    pub async fn authenticate(
        &self,
        user: &str,
        password: &str,
        mechanism: AuthMechanism,
    ) -> Result<(), ClientError> {
        let salt = self
            .greeting
            .read()
            .as_ref()
            .map(|g| g.salt.clone())
            .ok_or(ClientError::NotConnected)?;
        self.auth_with_salt(user, password, mechanism, &salt).await
    }

    async fn auth_with_salt(
        &self,
        user: &str,
        password: &str,
        mechanism: AuthMechanism,
        salt: &[u8],
    ) -> Result<(), ClientError> {
        let request = mechanism.auth_request(user, password, salt)?;
        self.exchange(request, RequestOptions::default()).await?;
        Ok(())
    }

    /// Sends a request and returns its completion handle.
    pub async fn send(
        &self,
        request: Request,
        options: RequestOptions,
    ) -> Result<ResponseHandle, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.start(request, options).await
    }

    /// Sends a request and waits for its response.
    pub async fn request(
        &self,
        request: Request,
        options: RequestOptions,
    ) -> Result<Response, ClientError> {
        self.send(request, options).await?.wait().await
    }

    /// Sends a PING and returns the schema version it reports.
    pub async fn ping(&self, timeout: Duration) -> Result<u64, ClientError> {
        let response = self
            .request(request::ping(), RequestOptions::default().with_timeout(timeout))
            .await?;
        Ok(response.schema_version().unwrap_or_default())
    }

    /// Request path shared by the handshake, which runs before the
    /// connection is marked connected.
    async fn exchange(&self, request: Request, options: RequestOptions) -> Result<Response, ClientError> {
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Connected => {}
            _ => return Err(ClientError::NotConnected),
        }
        self.start(request, options).await?.wait().await
    }

    async fn start(
        &self,
        mut request: Request,
        options: RequestOptions,
    ) -> Result<ResponseHandle, ClientError> {
        if options.stream_id.is_some() {
            request.set_stream_id(options.stream_id);
        }
        let timeout = options.timeout.unwrap_or(self.config.request_timeout);
        let exchange = SingleShot::new(request, timeout, options.on_push);
        exchange.start(self).await
    }

    /// Writes one encoded frame to the socket.
    pub(crate) async fn write_frame(&self, frame: &[u8]) -> Result<(), ClientError> {
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer.write_all(frame).await.map_err(ClientError::Io)
    }

    /// Subscribes to changes of `key`.
    pub async fn watch(
        self: &Arc<Self>,
        key: &str,
        on_event: EventCallback,
        on_error: Option<ErrorHandler>,
    ) -> Result<Arc<Watch>, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        if self.watchers.contains_key(key) {
            return Err(ClientError::InvalidArgument(format!(
                "key {key} is already watched on this connection"
            )));
        }
        let watch = Watch::new(key, self, on_event, on_error);
        self.watchers.insert(key.to_string(), Arc::clone(&watch));
        if let Err(e) = watch.start().await {
            self.watchers.remove(key);
            return Err(e);
        }
        Ok(watch)
    }

    /// Stops watching `key`.
    pub async fn unwatch(&self, key: &str) -> Result<(), ClientError> {
        let Some((_, watch)) = self.watchers.remove(key) else {
            return Ok(());
        };
        self.registry.remove(watch.cancel());
        if !self.is_connected() {
            return Ok(());
        }
        // no response is sent for UNWATCH, so the sync is not registered
        let frame = request::unwatch(key).with_sync(self.next_sync()).encode()?;
        self.write_frame(&frame).await
    }

    pub(crate) fn forget_watch(&self, key: &str) {
        self.watchers.remove(key);
    }

    /// Dispatches one received frame. Never waits: callbacks run inline and
    /// watch acknowledgements are written from a separate task.
    fn dispatch(&self, response: Response) {
        if let Some(version) = response.schema_version() {
            self.schema_version.fetch_max(version, Ordering::SeqCst);
        }

        if response.is_event() {
            self.dispatch_event(response);
            return;
        }

        match response.sync() {
            Some(sync) => match self.registry.get(sync) {
                Some(exchange) => {
                    if exchange.process(response) {
                        self.registry.remove(sync);
                    }
                }
                None => tracing::debug!("Dropping response for unknown sync={}", sync),
            },
            None => {
                let sink = self.push_sink.read().clone();
                match sink {
                    Some(sink) => sink(response),
                    None => tracing::warn!(
                        "Dropping out-of-band message of type {:#x}",
                        response.header().code
                    ),
                }
            }
        }
    }

    fn dispatch_event(&self, response: Response) {
        let Some(key) = response.event_key() else {
            tracing::warn!("Dropping event without a key");
            return;
        };
        let watch = self.watchers.get(&key).map(|w| Arc::clone(w.value()));
        let Some(watch) = watch else {
            tracing::debug!("Dropping event for unwatched key {}", key);
            return;
        };

        watch.notify(&response);
        if self.is_connected() {
            tokio::spawn(async move {
                if let Err(e) = watch.send().await {
                    tracing::warn!("Failed to re-arm watch on {}: {}", watch.key(), e);
                }
            });
        }
    }

    /// Fails every in-flight exchange and watch with `reason`. Runs once.
    fn teardown(&self, reason: &'static str) {
        {
            let mut close_reason = self.close_reason.write();
            if close_reason.is_none() {
                *close_reason = Some(reason);
            }
        }
        let previous = self.state.swap(ConnectionState::Closed as u8, Ordering::SeqCst);
        if previous == ConnectionState::Closed as u8 {
            return;
        }

        let pending = self.registry.drain();
        let watchers: Vec<Arc<Watch>> = self
            .watchers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.watchers.clear();

        tracing::info!(
            "Connection to {} closed ({}), failing {} in-flight requests",
            self.config.address(),
            reason,
            pending.len()
        );
        for exchange in pending {
            exchange.kill(ClientError::closed(reason));
        }
        for watch in watchers {
            watch.kill(ClientError::closed(reason));
        }
    }

    /// Closes the connection immediately.
    pub async fn close(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.teardown(REASON_CLIENT);
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await.ok();
        }
    }

    /// Stops accepting new requests, waits up to `timeout` for in-flight
    /// requests to finish, then closes.
    pub async fn close_gracefully(&self, timeout: Duration) {
        if self.transition(ConnectionState::Connected, ConnectionState::Closing) {
            let keys: Vec<String> = self.watchers.iter().map(|e| e.key().clone()).collect();
            for key in keys {
                if let Some((_, watch)) = self.watchers.remove(&key) {
                    self.registry.remove(watch.cancel());
                }
            }

            if tokio::time::timeout(timeout, self.registry.wait_drained())
                .await
                .is_err()
            {
                tracing::warn!(
                    "{} requests still in flight on {} after {:?}",
                    self.registry.len(),
                    self.config.address(),
                    timeout
                );
            }
        }
        self.close().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

/// Background task that reads and dispatches frames.
async fn read_loop(connection: Weak<Connection>, mut reader: OwnedReadHalf, buffer_size: usize) {
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; buffer_size];

    let reason = 'read: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break REASON_SERVER,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("Read error: {}", e);
                break REASON_UNEXPECTED;
            }
        };
        decoder.extend(&buf[..n]);

        let Some(conn) = connection.upgrade() else {
            return;
        };
        loop {
            match decoder.decode_response() {
                Ok(Some(response)) => conn.dispatch(response),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Framing error from {}: {}", conn.config.address(), e);
                    break 'read REASON_UNEXPECTED;
                }
            }
        }
    };

    if let Some(conn) = connection.upgrade() {
        conn.teardown(reason);
        if let Some(mut writer) = conn.writer.lock().await.take() {
            writer.shutdown().await.ok();
        }
    }
}
