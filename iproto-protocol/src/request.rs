//! Builders for every request kind.
//!
//! Keys, tuples and argument lists are taken as MessagePack values; callers
//! holding serde types can use [`Request::with_serialized`] instead.

use crate::auth::AuthMechanism;
use crate::constants::{body_key, IteratorType, RequestType, TransactionIsolation};
use crate::message::Request;
use rmpv::Value;

/// Paging and iteration parameters of a SELECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectParams {
    pub limit: u32,
    pub offset: u32,
    pub iterator: IteratorType,
}

impl Default for SelectParams {
    fn default() -> Self {
        Self {
            limit: u32::MAX,
            offset: 0,
            iterator: IteratorType::Eq,
        }
    }
}

impl SelectParams {
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_iterator(mut self, iterator: IteratorType) -> Self {
        self.iterator = iterator;
        self
    }
}

pub fn ping() -> Request {
    Request::new(RequestType::Ping)
}

pub fn select(space_id: u32, index_id: u32, key: Value, params: SelectParams) -> Request {
    Request::new(RequestType::Select)
        .with_field(body_key::SPACE_ID, space_id)
        .with_field(body_key::INDEX_ID, index_id)
        .with_field(body_key::LIMIT, params.limit)
        .with_field(body_key::OFFSET, params.offset)
        .with_field(body_key::ITERATOR, params.iterator.code())
        .with_field(body_key::KEY, key)
}

pub fn insert(space_id: u32, tuple: Value) -> Request {
    Request::new(RequestType::Insert)
        .with_field(body_key::SPACE_ID, space_id)
        .with_field(body_key::TUPLE, tuple)
}

pub fn replace(space_id: u32, tuple: Value) -> Request {
    Request::new(RequestType::Replace)
        .with_field(body_key::SPACE_ID, space_id)
        .with_field(body_key::TUPLE, tuple)
}

pub fn update(space_id: u32, index_id: u32, key: Value, ops: Value) -> Request {
    Request::new(RequestType::Update)
        .with_field(body_key::SPACE_ID, space_id)
        .with_field(body_key::INDEX_ID, index_id)
        .with_field(body_key::KEY, key)
        .with_field(body_key::TUPLE, ops)
}

/// UPSERT: insert `tuple`, or apply `ops` if a tuple with the same primary key exists.
pub fn upsert(space_id: u32, tuple: Value, ops: Value) -> Request {
    Request::new(RequestType::Upsert)
        .with_field(body_key::SPACE_ID, space_id)
        .with_field(body_key::TUPLE, tuple)
        .with_field(body_key::OPS, ops)
}

pub fn delete(space_id: u32, index_id: u32, key: Value) -> Request {
    Request::new(RequestType::Delete)
        .with_field(body_key::SPACE_ID, space_id)
        .with_field(body_key::INDEX_ID, index_id)
        .with_field(body_key::KEY, key)
}

pub fn call(function: &str, args: Value) -> Request {
    Request::new(RequestType::Call)
        .with_field(body_key::FUNCTION_NAME, function)
        .with_field(body_key::TUPLE, args)
}

pub fn eval(expr: &str, args: Value) -> Request {
    Request::new(RequestType::Eval)
        .with_field(body_key::EXPR, expr)
        .with_field(body_key::TUPLE, args)
}

pub fn execute(sql: &str, binds: Value) -> Request {
    Request::new(RequestType::Execute)
        .with_field(body_key::SQL_TEXT, sql)
        .with_field(body_key::SQL_BIND, binds)
}

pub fn execute_prepared(statement_id: u64, binds: Value) -> Request {
    Request::new(RequestType::Execute)
        .with_field(body_key::STMT_ID, statement_id)
        .with_field(body_key::SQL_BIND, binds)
}

pub fn prepare(sql: &str) -> Request {
    Request::new(RequestType::Prepare).with_field(body_key::SQL_TEXT, sql)
}

/// BEGIN. `timeout` is in seconds; the stream id is set by the caller.
pub fn begin(timeout: Option<f64>, isolation: TransactionIsolation) -> Request {
    let mut request = Request::new(RequestType::Begin);
    if let Some(timeout) = timeout {
        request = request.with_field(body_key::TIMEOUT, timeout);
    }
    if isolation != TransactionIsolation::Default {
        request = request.with_field(body_key::TXN_ISOLATION, isolation.code());
    }
    request
}

pub fn commit() -> Request {
    Request::new(RequestType::Commit)
}

pub fn rollback() -> Request {
    Request::new(RequestType::Rollback)
}

pub fn auth(user: &str, mechanism: AuthMechanism, scramble: Value) -> Request {
    Request::new(RequestType::Auth)
        .with_field(body_key::USER_NAME, user)
        .with_field(
            body_key::TUPLE,
            Value::Array(vec![Value::from(mechanism.name()), scramble]),
        )
}

/// ID exchange: advertises the protocol version and feature set.
pub fn id(version: u64, features: &[u64]) -> Request {
    Request::new(RequestType::Id)
        .with_field(body_key::VERSION, version)
        .with_field(
            body_key::FEATURES,
            Value::Array(features.iter().map(|f| Value::from(*f)).collect()),
        )
}

pub fn watch(key: &str) -> Request {
    Request::new(RequestType::Watch).with_field(body_key::EVENT_KEY, key)
}

pub fn unwatch(key: &str) -> Request {
    Request::new(RequestType::Unwatch).with_field(body_key::EVENT_KEY, key)
}
