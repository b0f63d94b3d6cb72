//! Interactive transactions.
//!
//! A transaction pins one pooled connection and tags every request with a
//! stream id, so the server applies them in order inside one transaction.

use crate::client::{tuples, ClientInner, IndexRef};
use crate::connection::Connection;
use crate::error::ClientError;
use crate::exchange::RequestOptions;
use crate::schema::SpaceRef;
use iproto_protocol::constants::{body_key, feature};
use iproto_protocol::request::{self, SelectParams};
use iproto_protocol::{Request, Response, TransactionIsolation};
use rmpv::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionOptions {
    /// Server-side transaction timeout.
    pub timeout: Option<Duration>,
    pub isolation: TransactionIsolation,
}

impl TransactionOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_isolation(mut self, isolation: TransactionIsolation) -> Self {
        self.isolation = isolation;
        self
    }
}

/// An open transaction. Dropping it without `commit` rolls it back.
pub struct Transaction {
    inner: Arc<ClientInner>,
    connection: Arc<Connection>,
    stream_id: u64,
    finished: AtomicBool,
}

impl Transaction {
    pub(crate) async fn begin(
        inner: Arc<ClientInner>,
        options: TransactionOptions,
    ) -> Result<Self, ClientError> {
        let connection = inner.balancer.get_next().await?;
        if let Some(features) = connection.server_features() {
            if !features.supports(feature::STREAMS) || !features.supports(feature::TRANSACTIONS) {
                return Err(ClientError::ProtocolUsage(
                    "server does not support interactive transactions",
                ));
            }
        }

        let stream_id = connection.next_stream_id();
        let transaction = Self {
            inner,
            connection,
            stream_id,
            finished: AtomicBool::new(false),
        };
        let begin = request::begin(options.timeout.map(|t| t.as_secs_f64()), options.isolation);
        if let Err(e) = transaction.request(begin).await {
            transaction.finished.store(true, Ordering::SeqCst);
            return Err(e);
        }
        tracing::debug!("Transaction started on stream {}", stream_id);
        Ok(transaction)
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Sends a request inside the transaction.
    pub async fn request(&self, request: Request) -> Result<Response, ClientError> {
        if self.finished.load(Ordering::SeqCst) {
            return Err(ClientError::ProtocolUsage("transaction already finished"));
        }
        let options = RequestOptions::default().with_stream_id(self.stream_id);
        let response = self.connection.request(request, options).await?;
        self.inner.finish(response).await
    }

    pub async fn call(&self, function: &str, args: Value) -> Result<Value, ClientError> {
        let response = self.request(request::call(function, args)).await?;
        Ok(response.field(body_key::DATA)?.unwrap_or(Value::Nil))
    }

    pub async fn execute(&self, sql: &str, binds: Value) -> Result<Response, ClientError> {
        self.request(request::execute(sql, binds)).await
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
        tuples(&self.request(request).await?)
    }

    pub async fn insert<'a>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        tuple: Value,
    ) -> Result<Vec<Value>, ClientError> {
        let request = self.inner.insert_request(space.into(), tuple).await?;
        tuples(&self.request(request).await?)
    }

    pub async fn replace<'a>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        tuple: Value,
    ) -> Result<Vec<Value>, ClientError> {
        let request = self.inner.replace_request(space.into(), tuple).await?;
        tuples(&self.request(request).await?)
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
        tuples(&self.request(request).await?)
    }

    pub async fn upsert<'a>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        tuple: Value,
        ops: Value,
    ) -> Result<Vec<Value>, ClientError> {
        let request = self.inner.upsert_request(space.into(), tuple, ops).await?;
        tuples(&self.request(request).await?)
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
        tuples(&self.request(request).await?)
    }

    pub async fn commit(self) -> Result<(), ClientError> {
        self.finish(request::commit()).await
    }

    pub async fn rollback(self) -> Result<(), ClientError> {
        self.finish(request::rollback()).await
    }

    async fn finish(&self, request: Request) -> Result<(), ClientError> {
        let result = self.request(request).await;
        self.finished.store(true, Ordering::SeqCst);
        result.map(|_| ())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let connection = Arc::clone(&self.connection);
        let stream_id = self.stream_id;
        tracing::debug!("Rolling back abandoned transaction on stream {}", stream_id);
        runtime.spawn(async move {
            let options = RequestOptions::default().with_stream_id(stream_id);
            if let Err(e) = connection.request(request::rollback(), options).await {
                tracing::debug!("Rollback of stream {} failed: {}", stream_id, e);
            }
        });
    }
}
