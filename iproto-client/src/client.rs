//! High-level client.
//!
//! Ties the pool, the balancer and the schema cache together. Spaces and
//! indexes may be addressed by name once the schema is fetched, or by id
//! at any time.

use crate::balancer::Balancer;
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::ClientError;
use crate::exchange::{ErrorHandler, RequestOptions, Watch, WatchEvent};
use crate::pool::Pool;
use crate::schema::{SchemaFetcher, Space, SpaceRef};
use crate::transaction::{Transaction, TransactionOptions};
use iproto_protocol::constants::body_key;
use iproto_protocol::request::{self, SelectParams};
use iproto_protocol::{Request, Response};
use rmpv::Value;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Reference to an index by name or id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexRef<'a> {
    Name(&'a str),
    Id(u32),
}

impl<'a> From<&'a str> for IndexRef<'a> {
    fn from(name: &'a str) -> Self {
        IndexRef::Name(name)
    }
}

impl From<u32> for IndexRef<'_> {
    fn from(id: u32) -> Self {
        IndexRef::Id(id)
    }
}

impl fmt::Display for IndexRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexRef::Name(name) => write!(f, "index '{name}'"),
            IndexRef::Id(id) => write!(f, "index {id}"),
        }
    }
}

/// Converts any serializable value into a MessagePack value, for use as a
/// tuple, key or argument list.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, ClientError> {
    let raw = rmp_serde::to_vec(value).map_err(|e| ClientError::Encode(e.to_string()))?;
    rmpv::decode::read_value(&mut raw.as_slice()).map_err(|e| ClientError::Encode(e.to_string()))
}

/// Tuples carried in the `DATA` field of a response.
pub fn tuples(response: &Response) -> Result<Vec<Value>, ClientError> {
    match response.field(body_key::DATA)? {
        Some(Value::Array(rows)) => Ok(rows),
        Some(other) => Ok(vec![other]),
        None => Ok(Vec::new()),
    }
}

pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    pub(crate) pool: Arc<Pool>,
    pub(crate) balancer: Arc<Balancer>,
    pub(crate) schema: Option<Arc<SchemaFetcher>>,
}

impl ClientInner {
    /// Passes a response through the schema cache.
    pub(crate) async fn finish(&self, response: Response) -> Result<Response, ClientError> {
        match self.schema {
            Some(ref schema) => schema.process_response(response).await,
            None => Ok(response),
        }
    }

    async fn space(&self, space: SpaceRef<'_>) -> Result<Arc<Space>, ClientError> {
        match self.schema {
            Some(ref schema) => schema.get_space(space).await,
            None => Err(ClientError::NoSchema(format!(
                "{space} (schema fetching is disabled)"
            ))),
        }
    }

    async fn space_id(&self, space: SpaceRef<'_>) -> Result<u32, ClientError> {
        match space {
            SpaceRef::Id(id) => Ok(id),
            SpaceRef::Name(_) => Ok(self.space(space).await?.id),
        }
    }

    async fn index_id(
        &self,
        space: SpaceRef<'_>,
        index: IndexRef<'_>,
    ) -> Result<(u32, u32), ClientError> {
        match (space, index) {
            (SpaceRef::Id(space), IndexRef::Id(index)) => Ok((space, index)),
            (_, IndexRef::Id(index)) => Ok((self.space_id(space).await?, index)),
            (_, IndexRef::Name(name)) => {
                let found = self.space(space).await?;
                let index = found
                    .index(name)
                    .ok_or_else(|| ClientError::NoSchema(format!("{index} of {space}")))?;
                Ok((found.id, index.id))
            }
        }
    }

    pub(crate) async fn select_request(
        &self,
        space: SpaceRef<'_>,
        index: IndexRef<'_>,
        key: Value,
        params: SelectParams,
    ) -> Result<Request, ClientError> {
        let (space, index) = self.index_id(space, index).await?;
        Ok(request::select(space, index, key, params))
    }

    pub(crate) async fn insert_request(
        &self,
        space: SpaceRef<'_>,
        tuple: Value,
    ) -> Result<Request, ClientError> {
        Ok(request::insert(self.space_id(space).await?, tuple))
    }

    pub(crate) async fn replace_request(
        &self,
        space: SpaceRef<'_>,
        tuple: Value,
    ) -> Result<Request, ClientError> {
        Ok(request::replace(self.space_id(space).await?, tuple))
    }

    pub(crate) async fn update_request(
        &self,
        space: SpaceRef<'_>,
        index: IndexRef<'_>,
        key: Value,
        ops: Value,
    ) -> Result<Request, ClientError> {
        let (space, index) = self.index_id(space, index).await?;
        Ok(request::update(space, index, key, ops))
    }

    pub(crate) async fn upsert_request(
        &self,
        space: SpaceRef<'_>,
        tuple: Value,
        ops: Value,
    ) -> Result<Request, ClientError> {
        Ok(request::upsert(self.space_id(space).await?, tuple, ops))
    }

    pub(crate) async fn delete_request(
        &self,
        space: SpaceRef<'_>,
        index: IndexRef<'_>,
        key: Value,
    ) -> Result<Request, ClientError> {
        let (space, index) = self.index_id(space, index).await?;
        Ok(request::delete(space, index, key))
    }
}

/// Async IProto client over a balanced connection pool.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Builds the pool and, when enabled, fetches the schema.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        config
            .validate()
            .map_err(|e| ClientError::InvalidArgument(e.to_string()))?;

        let pool = Pool::with_groups(config.clone())?;
        let balancer = Arc::new(Balancer::new(Arc::clone(&pool), config.balancer));
        let schema = if config.fetch_schema {
            match SchemaFetcher::new(
                Arc::clone(&balancer),
                config.ignore_stale_schema,
                config.request_timeout(),
            )
            .await
            {
                Ok(schema) => Some(schema),
                Err(e) => {
                    pool.close().await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        tracing::info!(
            "Client ready: {} connections in {} groups",
            pool.available_connections(),
            pool.tags().len()
        );
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                pool,
                balancer,
                schema,
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.inner.pool
    }

    pub fn balancer(&self) -> &Arc<Balancer> {
        &self.inner.balancer
    }

    pub fn schema(&self) -> Option<&Arc<SchemaFetcher>> {
        self.inner.schema.as_ref()
    }

    /// Sends a request on the next balanced connection.
    pub async fn request(
        &self,
        request: Request,
        options: RequestOptions,
    ) -> Result<Response, ClientError> {
        let conn = self.inner.balancer.get_next().await?;
        let response = conn.request(request, options).await?;
        self.inner.finish(response).await
    }

    /// Pings one connection and returns the reported schema version.
    pub async fn ping(&self) -> Result<u64, ClientError> {
        let response = self.request(request::ping(), RequestOptions::default()).await?;
        Ok(response.schema_version().unwrap_or_default())
    }

    /// Calls a stored function and returns its results.
    pub async fn call(&self, function: &str, args: Value) -> Result<Value, ClientError> {
        self.call_with(function, args, RequestOptions::default()).await
    }

    /// Like [`call`](Self::call), with per-request options such as a push
    /// callback.
    pub async fn call_with(
        &self,
        function: &str,
        args: Value,
        options: RequestOptions,
    ) -> Result<Value, ClientError> {
        let response = self.request(request::call(function, args), options).await?;
        Ok(response.field(body_key::DATA)?.unwrap_or(Value::Nil))
    }

    /// Evaluates an expression and returns its results.
    pub async fn eval(&self, expr: &str, args: Value) -> Result<Value, ClientError> {
        let response = self
            .request(request::eval(expr, args), RequestOptions::default())
            .await?;
        Ok(response.field(body_key::DATA)?.unwrap_or(Value::Nil))
    }

    /// Executes an SQL statement. The response carries `METADATA` and
    /// `DATA` for queries, `SQL_INFO` for other statements.
    pub async fn execute(&self, sql: &str, binds: Value) -> Result<Response, ClientError> {
        self.request(request::execute(sql, binds), RequestOptions::default())
            .await
    }

    pub async fn select<'a>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        index: impl Into<IndexRef<'a>>,
        key: Value,
        params: SelectParams,
    ) -> Result<Vec<Value>, ClientError> {
        let request = self
            .inner
            .select_request(space.into(), index.into(), key, params)
            .await?;
        tuples(&self.request(request, RequestOptions::default()).await?)
    }

    pub async fn insert<'a>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        tuple: Value,
    ) -> Result<Vec<Value>, ClientError> {
        let request = self.inner.insert_request(space.into(), tuple).await?;
        tuples(&self.request(request, RequestOptions::default()).await?)
    }

    pub async fn replace<'a>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        tuple: Value,
    ) -> Result<Vec<Value>, ClientError> {
        let request = self.inner.replace_request(space.into(), tuple).await?;
        tuples(&self.request(request, RequestOptions::default()).await?)
    }

    pub async fn update<'a>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        index: impl Into<IndexRef<'a>>,
        key: Value,
        ops: Value,
    ) -> Result<Vec<Value>, ClientError> {
        let request = self
            .inner
            .update_request(space.into(), index.into(), key, ops)
            .await?;
        tuples(&self.request(request, RequestOptions::default()).await?)
    }

    pub async fn upsert<'a>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        tuple: Value,
        ops: Value,
    ) -> Result<Vec<Value>, ClientError> {
        let request = self.inner.upsert_request(space.into(), tuple, ops).await?;
        tuples(&self.request(request, RequestOptions::default()).await?)
    }

    pub async fn delete<'a>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        index: impl Into<IndexRef<'a>>,
        key: Value,
    ) -> Result<Vec<Value>, ClientError> {
        let request = self
            .inner
            .delete_request(space.into(), index.into(), key)
            .await?;
        tuples(&self.request(request, RequestOptions::default()).await?)
    }

    /// Starts an interactive transaction on one pooled connection.
    pub async fn begin(&self, options: TransactionOptions) -> Result<Transaction, ClientError> {
        Transaction::begin(Arc::clone(&self.inner), options).await
    }

    /// Subscribes to changes of `key` on the next balanced connection.
    pub async fn watch(
        &self,
        key: &str,
        on_event: impl Fn(WatchEvent) + Send + Sync + 'static,
    ) -> Result<WatchHandle, ClientError> {
        self.watch_with(key, on_event, None).await
    }

    /// Like [`watch`](Self::watch), reporting termination to `on_error`.
    pub async fn watch_with(
        &self,
        key: &str,
        on_event: impl Fn(WatchEvent) + Send + Sync + 'static,
        on_error: Option<ErrorHandler>,
    ) -> Result<WatchHandle, ClientError> {
        let connection = self.inner.balancer.get_next().await?;
        let watch = connection.watch(key, Arc::new(on_event), on_error).await?;
        Ok(WatchHandle { connection, watch })
    }

    /// Cached metadata of a space.
    pub async fn space(&self, name: &str) -> Result<Arc<Space>, ClientError> {
        self.inner.space(SpaceRef::Name(name)).await
    }

    /// Closes every pooled connection, letting in-flight requests drain.
    pub async fn close(&self) {
        self.inner.pool.close().await;
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("tags", &self.inner.pool.tags())
            .field("schema_version", &self.inner.schema.as_ref().map(|s| s.version()))
            .finish()
    }
}

/// A live subscription returned by [`Client::watch`].
pub struct WatchHandle {
    connection: Arc<Connection>,
    watch: Arc<Watch>,
}

impl WatchHandle {
    pub fn key(&self) -> &str {
        self.watch.key()
    }

    /// Whether the subscription ended, by error or by connection loss.
    pub fn is_terminated(&self) -> bool {
        self.watch.is_terminated()
    }

    pub async fn unwatch(self) -> Result<(), ClientError> {
        self.connection.unwatch(self.watch.key()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockServer, ERR_NO_SUCH_SPACE, ERR_PROC_LUA};
    use iproto_protocol::{IteratorType, RequestType};
    use parking_lot::Mutex;
    use std::time::Duration;

    async fn client(server: &MockServer) -> Client {
        Client::connect(server.client_config()).await.unwrap()
    }

    #[test]
    fn test_to_value() {
        #[derive(Serialize)]
        struct Row {
            id: u32,
            name: String,
        }
        let value = to_value(&(1u32, "a", vec![true])).unwrap();
        assert_eq!(
            value,
            Value::Array(vec![
                Value::from(1),
                Value::from("a"),
                Value::Array(vec![Value::from(true)]),
            ])
        );
        // structs serialize as arrays, matching tuple layout
        let row = to_value(&Row {
            id: 7,
            name: "x".into(),
        })
        .unwrap();
        assert_eq!(row, Value::Array(vec![Value::from(7), Value::from("x")]));
    }

    #[tokio::test]
    async fn test_connect_and_ping() {
        let server = MockServer::start().await;
        let client = client(&server).await;
        assert_eq!(client.ping().await.unwrap(), server.schema_version());
        assert_eq!(client.schema().unwrap().version(), server.schema_version());
        client.close().await;
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let mut config = ClientConfig::new("127.0.0.1", 1);
        config.request_timeout_ms = 0;
        assert!(matches!(
            Client::connect(config).await,
            Err(ClientError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_call_and_eval() {
        let server = MockServer::start().await;
        let client = client(&server).await;

        let args = Value::Array(vec![Value::from(1), Value::from("two")]);
        assert_eq!(client.call("echo", args.clone()).await.unwrap(), args);
        assert_eq!(client.eval("return ...", args.clone()).await.unwrap(), args);

        let err = client.call("box.error", Value::Array(vec![])).await.unwrap_err();
        assert_eq!(err.server_code(), Some(ERR_PROC_LUA));
    }

    #[tokio::test]
    async fn test_call_with_pushes() {
        let server = MockServer::start().await;
        let client = client(&server).await;
        let pushed = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&pushed);
        let options = RequestOptions::default().with_push_callback(move |response| {
            sink.lock().push(response.field(body_key::DATA).unwrap());
        });
        let result = client
            .call_with("push", Value::Array(vec![Value::from(3)]), options)
            .await
            .unwrap();

        assert_eq!(result, Value::Array(vec![Value::from(3)]));
        assert_eq!(pushed.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_execute() {
        let server = MockServer::start().await;
        let client = client(&server).await;
        let response = client
            .execute("SELECT 1", Value::Array(vec![]))
            .await
            .unwrap();
        assert!(response.field(body_key::METADATA).unwrap().is_some());
        assert_eq!(
            tuples(&response).unwrap(),
            vec![Value::Array(vec![Value::from("SELECT 1")])]
        );
    }

    #[tokio::test]
    async fn test_space_operations_by_name() {
        let server = MockServer::start().await;
        let client = client(&server).await;
        let key = Value::Array(vec![Value::from(1)]);
        let tuple = Value::Array(vec![Value::from(1), Value::from("a")]);

        let rows = client
            .select(
                "tester",
                "by_name",
                key.clone(),
                SelectParams::default().with_iterator(IteratorType::Eq),
            )
            .await
            .unwrap();
        assert_eq!(rows, vec![key.clone()]);

        assert_eq!(client.insert("tester", tuple.clone()).await.unwrap(), vec![tuple.clone()]);
        assert_eq!(client.replace(512u32, tuple.clone()).await.unwrap(), vec![tuple.clone()]);
        assert_eq!(
            client
                .update("tester", 0u32, key.clone(), Value::Array(vec![]))
                .await
                .unwrap(),
            vec![key.clone()]
        );
        assert!(client
            .upsert("tester", tuple, Value::Array(vec![]))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            client.delete("tester", "primary", key.clone()).await.unwrap(),
            vec![key]
        );
    }

    #[tokio::test]
    async fn test_unknown_names() {
        let server = MockServer::start().await;
        let client = client(&server).await;
        let key = Value::Array(vec![]);

        assert!(matches!(
            client.insert("nope", key.clone()).await,
            Err(ClientError::NoSchema(_))
        ));
        assert!(matches!(
            client
                .select("tester", "nope", key.clone(), SelectParams::default())
                .await,
            Err(ClientError::NoSchema(_))
        ));
        // ids bypass the cache and reach the server
        let err = client.insert(9999u32, key.clone()).await.unwrap_err();
        assert_eq!(err.server_code(), Some(ERR_NO_SUCH_SPACE));
        let err = client.delete(9999u32, 0u32, key).await.unwrap_err();
        assert_eq!(err.server_code(), Some(ERR_NO_SUCH_SPACE));
    }

    #[tokio::test]
    async fn test_without_schema() {
        let server = MockServer::start().await;
        let mut config = server.client_config();
        config.fetch_schema = false;
        let client = Client::connect(config).await.unwrap();

        assert!(client.schema().is_none());
        assert_eq!(server.request_count(RequestType::Select), 0);
        assert!(matches!(
            client.space("tester").await,
            Err(ClientError::NoSchema(_))
        ));
        let key = Value::Array(vec![Value::from(5)]);
        assert_eq!(
            client
                .select(512u32, 0u32, key.clone(), SelectParams::default())
                .await
                .unwrap(),
            vec![key]
        );
    }

    #[tokio::test]
    async fn test_schema_follows_server() {
        let server = MockServer::start().await;
        let client = client(&server).await;
        let before = client.schema().unwrap().version();

        server.create_space("fresh", 900);
        client.ping().await.unwrap();

        assert_eq!(client.schema().unwrap().version(), before + 1);
        let space = client.space("fresh").await.unwrap();
        assert_eq!(space.id, 900);
        assert_eq!(space.index_by_id(0).unwrap().name, "primary");
    }

    #[tokio::test]
    async fn test_watch_and_unwatch() {
        let server = MockServer::start().await;
        let client = client(&server).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let handle = client
            .watch("config", move |event| {
                let _ = tx.send(event);
            })
            .await
            .unwrap();
        assert_eq!(handle.key(), "config");

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.key, "config");

        server.notify("config", Value::from(42));
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.data, Some(Value::from(42)));

        assert!(!handle.is_terminated());
        handle.unwatch().await.unwrap();
        server.wait_for_requests(RequestType::Unwatch, 1).await;
    }

    #[tokio::test]
    async fn test_close() {
        let server = MockServer::start().await;
        let client = client(&server).await;
        client.close().await;
        assert!(matches!(client.ping().await, Err(ClientError::PoolClosed)));
    }
}
