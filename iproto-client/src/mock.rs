//! In-process IProto server for tests.
//!
//! Speaks the real greeting and framing. Calls and evals echo their
//! arguments, the catalog spaces serve a small configurable schema, and
//! responses can be withheld to exercise timeouts.

use crate::config::{ClientConfig, InstanceConnectionGroup};
use crate::connection::ConnectionConfig;
use crate::schema::{VINDEX_ID, VSPACE_ID};
use bytes::Bytes;
use iproto_protocol::auth::chap_sha1_scramble;
use iproto_protocol::constants::{body_key, error_key, RequestType, TYPE_ERROR};
use iproto_protocol::{Decoder, Encoder, Greeting, Response};
use parking_lot::Mutex;
use rmpv::Value;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

pub(crate) const ERR_NO_SUCH_SPACE: u32 = 36;
pub(crate) const ERR_PROC_LUA: u32 = 32;
pub(crate) const ERR_CREDENTIALS: u32 = 47;
pub(crate) const ERR_UNKNOWN_REQUEST_TYPE: u32 = 48;

/// Watching this key is answered with an error.
pub(crate) const FORBIDDEN_KEY: &str = "forbidden";

const SALT: [u8; 32] = [7; 32];
const INSTANCE_ID: &str = "5d6f1a6e-3c1b-4a4f-9a0e-8c3f0b2e1d77";

#[derive(Debug, Clone, Default)]
pub(crate) struct MockConfig {
    users: HashMap<String, String>,
    console_greeting: bool,
    legacy: bool,
}

impl MockConfig {
    pub(crate) fn with_user(mut self, user: &str, password: &str) -> Self {
        self.users.insert(user.to_string(), password.to_string());
        self
    }

    /// Announce a Lua console instead of the binary protocol.
    pub(crate) fn with_console_greeting(mut self) -> Self {
        self.console_greeting = true;
        self
    }

    /// Reject the ID request like servers that predate it.
    pub(crate) fn legacy(mut self) -> Self {
        self.legacy = true;
        self
    }
}

#[derive(Debug, Clone)]
struct MockSpace {
    id: u32,
    name: String,
    indexes: Vec<String>,
}

#[derive(Debug, Clone)]
enum Command {
    Release,
    Kick,
    Event(String),
}

struct MockState {
    config: MockConfig,
    schema_version: AtomicU64,
    spaces: Mutex<Vec<MockSpace>>,
    values: Mutex<HashMap<String, Value>>,
    withhold: AtomicBool,
    requests: Mutex<HashMap<u32, usize>>,
    streams: Mutex<Vec<(RequestType, Option<u64>)>>,
    request_seen: Notify,
    accepted: AtomicUsize,
    commands: broadcast::Sender<Command>,
}

pub(crate) struct MockServer {
    addr: SocketAddr,
    state: Arc<MockState>,
    accept: JoinHandle<()>,
}

impl MockServer {
    pub(crate) async fn start() -> Self {
        Self::with_config(MockConfig::default()).await
    }

    pub(crate) async fn with_config(config: MockConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (commands, _) = broadcast::channel(64);
        let state = Arc::new(MockState {
            config,
            schema_version: AtomicU64::new(1),
            spaces: Mutex::new(vec![MockSpace {
                id: 512,
                name: "tester".to_string(),
                indexes: vec!["primary".to_string(), "by_name".to_string()],
            }]),
            values: Mutex::new(HashMap::new()),
            withhold: AtomicBool::new(false),
            requests: Mutex::new(HashMap::new()),
            streams: Mutex::new(Vec::new()),
            request_seen: Notify::new(),
            accepted: AtomicUsize::new(0),
            commands,
        });

        let accept = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    state.accepted.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(Arc::clone(&state), stream));
                }
            })
        };

        Self { addr, state, accept }
    }

    pub(crate) fn port(&self) -> u16 {
        self.addr.port()
    }

    pub(crate) fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::new("127.0.0.1", self.port())
            .with_connect_timeout(Duration::from_secs(1))
            .with_request_timeout(Duration::from_secs(2))
    }

    pub(crate) fn group(&self, tag: &str, size: usize) -> InstanceConnectionGroup {
        InstanceConnectionGroup::new(tag, "127.0.0.1", self.port()).with_size(size)
    }

    pub(crate) fn client_config(&self) -> ClientConfig {
        ClientConfig {
            groups: vec![self.group("default", 1)],
            connect_timeout_ms: 1_000,
            request_timeout_ms: 2_000,
            graceful_close_timeout_ms: 500,
            ..ClientConfig::default()
        }
    }

    /// Number of accepted TCP connections.
    pub(crate) fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub(crate) fn schema_version(&self) -> u64 {
        self.state.schema_version.load(Ordering::SeqCst)
    }

    /// Creates a space with a primary index and bumps the schema version.
    pub(crate) fn create_space(&self, name: &str, id: u32) {
        let mut spaces = self.state.spaces.lock();
        spaces.push(MockSpace {
            id,
            name: name.to_string(),
            indexes: vec!["primary".to_string()],
        });
        spaces.sort_by_key(|s| s.id);
        self.state.schema_version.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn request_count(&self, request_type: RequestType) -> usize {
        self.state
            .requests
            .lock()
            .get(&request_type.code())
            .copied()
            .unwrap_or_default()
    }

    /// Waits until `count` requests of `request_type` have been received.
    pub(crate) async fn wait_for_requests(&self, request_type: RequestType, count: usize) {
        let wait = async {
            loop {
                let notified = self.state.request_seen.notified();
                if self.request_count(request_type) >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("never saw {count} {request_type} requests"));
    }

    /// Request types and stream ids of transactional requests, in arrival order.
    pub(crate) fn stream_log(&self) -> Vec<(RequestType, Option<u64>)> {
        self.state.streams.lock().clone()
    }

    /// Holds back responses to data requests until released.
    pub(crate) fn set_withhold(&self, withhold: bool) {
        self.state.withhold.store(withhold, Ordering::SeqCst);
    }

    pub(crate) fn release_withheld(&self) {
        let _ = self.state.commands.send(Command::Release);
    }

    /// Drops every open connection.
    pub(crate) fn kick(&self) {
        let _ = self.state.commands.send(Command::Kick);
    }

    /// Sets a watched key and notifies its watchers.
    pub(crate) fn notify(&self, key: &str, value: Value) {
        self.state.values.lock().insert(key.to_string(), value);
        let _ = self.state.commands.send(Command::Event(key.to_string()));
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept.abort();
        let _ = self.state.commands.send(Command::Kick);
    }
}

#[derive(Default)]
struct Session {
    watching: HashSet<String>,
    withheld: Vec<Bytes>,
}

async fn serve(state: Arc<MockState>, stream: TcpStream) {
    let mut commands = state.commands.subscribe();
    let (mut reader, mut writer) = stream.into_split();

    if writer.write_all(&greeting(&state.config)).await.is_err() {
        return;
    }

    let mut session = Session::default();
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                decoder.extend(&buf[..n]);
                while let Ok(Some(request)) = decoder.decode_response() {
                    let frames = handle(&state, &request, &mut session);
                    let holds = state.withhold.load(Ordering::SeqCst)
                        && !matches!(request.request_type(), Some(RequestType::Id | RequestType::Auth));
                    for frame in frames {
                        if holds {
                            session.withheld.push(frame);
                        } else if writer.write_all(&frame).await.is_err() {
                            return;
                        }
                    }
                }
            }
            command = commands.recv() => match command {
                Ok(Command::Release) => {
                    for frame in std::mem::take(&mut session.withheld) {
                        if writer.write_all(&frame).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(Command::Event(key)) => {
                    if session.watching.contains(&key) {
                        let frame = event(&state, &key);
                        if writer.write_all(&frame).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(Command::Kick) | Err(broadcast::error::RecvError::Closed) => return,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            }
        }
    }
}

fn greeting(config: &MockConfig) -> [u8; 128] {
    let greeting = Greeting {
        product: "Tarantool".to_string(),
        version: "2.11.1".to_string(),
        protocol: if config.console_greeting {
            "Lua console".to_string()
        } else {
            "Binary".to_string()
        },
        instance_id: INSTANCE_ID.parse().unwrap(),
        salt: SALT.to_vec(),
    };
    greeting.encode()
}

fn ok(state: &MockState, sync: u64, body: Vec<(u8, Value)>) -> Bytes {
    Encoder::encode_response(
        0,
        Some(sync),
        state.schema_version.load(Ordering::SeqCst),
        body,
    )
    .unwrap()
}

fn error(state: &MockState, sync: u64, code: u32, message: &str) -> Bytes {
    let entry = Value::Map(vec![
        (Value::from(error_key::TYPE), Value::from("ClientError")),
        (Value::from(error_key::FILE), Value::from("mock.c")),
        (Value::from(error_key::LINE), Value::from(1)),
        (Value::from(error_key::MESSAGE), Value::from(message)),
        (Value::from(error_key::ERRNO), Value::from(0)),
        (Value::from(error_key::CODE), Value::from(code)),
    ]);
    let stack = Value::Map(vec![(
        Value::from(error_key::STACK),
        Value::Array(vec![entry]),
    )]);
    Encoder::encode_response(
        TYPE_ERROR | code,
        Some(sync),
        state.schema_version.load(Ordering::SeqCst),
        vec![
            (body_key::ERROR_24, Value::from(message)),
            (body_key::ERROR, stack),
        ],
    )
    .unwrap()
}

fn event(state: &MockState, key: &str) -> Bytes {
    let mut body = vec![(body_key::EVENT_KEY, Value::from(key))];
    if let Some(value) = state.values.lock().get(key) {
        body.push((body_key::EVENT_DATA, value.clone()));
    }
    Encoder::encode_response(
        RequestType::Event.code(),
        None,
        state.schema_version.load(Ordering::SeqCst),
        body,
    )
    .unwrap()
}

fn field(request: &Response, key: u8) -> Value {
    request.field(key).ok().flatten().unwrap_or(Value::Nil)
}

fn text(request: &Response, key: u8) -> String {
    field(request, key).as_str().unwrap_or_default().to_string()
}

fn handle(state: &MockState, request: &Response, session: &mut Session) -> Vec<Bytes> {
    let code = request.header().code;
    *state.requests.lock().entry(code).or_default() += 1;
    state.request_seen.notify_waiters();

    let sync = request.sync().unwrap_or_default();
    let Some(request_type) = request.request_type() else {
        return vec![error(state, sync, ERR_UNKNOWN_REQUEST_TYPE, "Unknown request type")];
    };

    match request_type {
        RequestType::Begin
        | RequestType::Commit
        | RequestType::Rollback
        | RequestType::Insert
        | RequestType::Replace
        | RequestType::Update
        | RequestType::Upsert
        | RequestType::Delete => {
            state
                .streams
                .lock()
                .push((request_type, request.header().stream_id));
        }
        _ => {}
    }

    let frame = match request_type {
        RequestType::Ping | RequestType::Begin | RequestType::Commit | RequestType::Rollback => {
            ok(state, sync, vec![])
        }
        RequestType::Id => {
            if state.config.legacy {
                error(state, sync, ERR_UNKNOWN_REQUEST_TYPE, "Unknown request type 73")
            } else {
                ok(
                    state,
                    sync,
                    vec![
                        (body_key::VERSION, Value::from(3)),
                        (
                            body_key::FEATURES,
                            Value::Array((0..4).map(Value::from).collect()),
                        ),
                    ],
                )
            }
        }
        RequestType::Auth => authenticate(state, request, sync),
        RequestType::Eval => ok(
            state,
            sync,
            vec![(body_key::DATA, field(request, body_key::TUPLE))],
        ),
        RequestType::Call => return call(state, request, sync),
        RequestType::Select => select(state, request, sync),
        RequestType::Insert
        | RequestType::Replace
        | RequestType::Update
        | RequestType::Upsert
        | RequestType::Delete
            if !space_exists(state, request) =>
        {
            no_such_space(state, request, sync)
        }
        RequestType::Insert | RequestType::Replace => {
            let tuple = field(request, body_key::TUPLE);
            ok(state, sync, vec![(body_key::DATA, Value::Array(vec![tuple]))])
        }
        RequestType::Update | RequestType::Delete => {
            let key = field(request, body_key::KEY);
            ok(state, sync, vec![(body_key::DATA, Value::Array(vec![key]))])
        }
        RequestType::Upsert => ok(state, sync, vec![(body_key::DATA, Value::Array(vec![]))]),
        RequestType::Execute => ok(
            state,
            sync,
            vec![
                (
                    body_key::METADATA,
                    Value::Array(vec![Value::Map(vec![
                        (Value::from(0), Value::from("COLUMN_1")),
                        (Value::from(1), Value::from("any")),
                    ])]),
                ),
                (
                    body_key::DATA,
                    Value::Array(vec![Value::Array(vec![Value::from(
                        text(request, body_key::SQL_TEXT),
                    )])]),
                ),
            ],
        ),
        RequestType::Watch => {
            let key = text(request, body_key::EVENT_KEY);
            if key == FORBIDDEN_KEY {
                error(state, sync, ERR_PROC_LUA, "watching this key is not allowed")
            } else if session.watching.insert(key.clone()) {
                event(state, &key)
            } else {
                // acknowledgement; the next event is sent on change
                return Vec::new();
            }
        }
        RequestType::Unwatch => {
            session.watching.remove(&text(request, body_key::EVENT_KEY));
            return Vec::new();
        }
        other => error(
            state,
            sync,
            ERR_UNKNOWN_REQUEST_TYPE,
            &format!("Unsupported request {other}"),
        ),
    };
    vec![frame]
}

fn authenticate(state: &MockState, request: &Response, sync: u64) -> Bytes {
    let user = text(request, body_key::USER_NAME);
    let Value::Array(tuple) = field(request, body_key::TUPLE) else {
        return error(state, sync, ERR_CREDENTIALS, "Invalid auth request");
    };
    let valid = match (state.config.users.get(&user), tuple.as_slice()) {
        (Some(password), [Value::String(mechanism), Value::Binary(scramble)])
            if mechanism.as_str() == Some("chap-sha1") =>
        {
            chap_sha1_scramble(password, &SALT)
                .map(|expected| expected.as_slice() == scramble.as_slice())
                .unwrap_or(false)
        }
        (Some(password), [Value::String(mechanism), Value::String(given)])
            if mechanism.as_str() == Some("pap-sha256") =>
        {
            given.as_str() == Some(password.as_str())
        }
        _ => false,
    };
    if valid {
        ok(state, sync, vec![])
    } else {
        error(
            state,
            sync,
            ERR_CREDENTIALS,
            "User not found or supplied credentials are invalid",
        )
    }
}

fn call(state: &MockState, request: &Response, sync: u64) -> Vec<Bytes> {
    let function = text(request, body_key::FUNCTION_NAME);
    let args = field(request, body_key::TUPLE);
    match function.as_str() {
        "box.error" => vec![error(state, sync, ERR_PROC_LUA, "raised by box.error")],
        "push" => {
            let count = match &args {
                Value::Array(items) => items.first().and_then(Value::as_u64).unwrap_or(1),
                _ => 1,
            };
            let mut frames: Vec<Bytes> = (0..count)
                .map(|i| {
                    Encoder::encode_response(
                        RequestType::Chunk.code(),
                        Some(sync),
                        state.schema_version.load(Ordering::SeqCst),
                        vec![(body_key::DATA, Value::Array(vec![Value::from(i)]))],
                    )
                    .unwrap()
                })
                .collect();
            frames.push(ok(state, sync, vec![(body_key::DATA, args)]));
            frames
        }
        _ => vec![ok(state, sync, vec![(body_key::DATA, args)])],
    }
}

fn select(state: &MockState, request: &Response, sync: u64) -> Bytes {
    let space_id = field(request, body_key::SPACE_ID).as_u64().unwrap_or_default() as u32;
    let spaces = state.spaces.lock().clone();

    let rows = match space_id {
        VSPACE_ID => spaces.iter().map(space_row).collect(),
        VINDEX_ID => spaces.iter().flat_map(index_rows).collect(),
        id if spaces.iter().any(|s| s.id == id) => vec![field(request, body_key::KEY)],
        _ => return no_such_space(state, request, sync),
    };
    ok(state, sync, vec![(body_key::DATA, Value::Array(rows))])
}

fn space_exists(state: &MockState, request: &Response) -> bool {
    let id = field(request, body_key::SPACE_ID).as_u64().unwrap_or_default();
    state.spaces.lock().iter().any(|s| u64::from(s.id) == id)
}

fn no_such_space(state: &MockState, request: &Response, sync: u64) -> Bytes {
    let id = field(request, body_key::SPACE_ID).as_u64().unwrap_or_default();
    error(
        state,
        sync,
        ERR_NO_SUCH_SPACE,
        &format!("Space '{id}' does not exist"),
    )
}

fn format_entry(name: &str, field_type: &str) -> Value {
    Value::Map(vec![
        (Value::from("name"), Value::from(name)),
        (Value::from("type"), Value::from(field_type)),
    ])
}

fn space_row(space: &MockSpace) -> Value {
    Value::Array(vec![
        Value::from(space.id),
        Value::from(1),
        Value::from(space.name.as_str()),
        Value::from("memtx"),
        Value::from(0),
        Value::Map(vec![]),
        Value::Array(vec![
            format_entry("id", "unsigned"),
            format_entry("name", "string"),
        ]),
    ])
}

fn index_rows(space: &MockSpace) -> Vec<Value> {
    space
        .indexes
        .iter()
        .enumerate()
        .map(|(iid, name)| {
            // primary uses the legacy part layout, secondaries the map layout
            let parts = if iid == 0 {
                Value::Array(vec![Value::Array(vec![
                    Value::from(0),
                    Value::from("unsigned"),
                ])])
            } else {
                Value::Array(vec![Value::Map(vec![
                    (Value::from("field"), Value::from(1)),
                    (Value::from("type"), Value::from("string")),
                ])])
            };
            Value::Array(vec![
                Value::from(space.id),
                Value::from(iid as u32),
                Value::from(name.as_str()),
                Value::from("tree"),
                Value::Map(vec![(Value::from("unique"), Value::from(iid == 0))]),
                parts,
            ])
        })
        .collect()
}
