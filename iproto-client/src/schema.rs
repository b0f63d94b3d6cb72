//! Schema cache.
//!
//! Keeps space and index metadata in step with the server's schema
//! version. Every response carries the version it was produced under; a
//! newer version triggers a re-fetch of the `_vspace` and `_vindex`
//! catalogs before the response is handed back.

use crate::balancer::Balancer;
use crate::error::ClientError;
use crate::exchange::RequestOptions;
use iproto_protocol::constants::body_key;
use iproto_protocol::request::{self, SelectParams};
use iproto_protocol::{IteratorType, Response};
use parking_lot::RwLock;
use rmpv::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Space catalog view.
pub const VSPACE_ID: u32 = 281;

/// Index catalog view.
pub const VINDEX_ID: u32 = 289;

const FETCH_ATTEMPTS: usize = 3;

/// One entry of a space's field format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub field_type: String,
    pub is_nullable: bool,
}

/// One key part of an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPart {
    pub field: u32,
    pub field_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub space_id: u32,
    pub id: u32,
    pub name: String,
    pub index_type: String,
    pub unique: bool,
    pub parts: Vec<IndexPart>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Space {
    pub id: u32,
    pub owner: u32,
    pub name: String,
    pub engine: String,
    pub field_count: u32,
    pub format: Vec<Field>,
    /// Indexes ordered by id.
    pub indexes: Vec<Index>,
}

impl Space {
    pub fn index(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|i| i.name == name)
    }

    pub fn index_by_id(&self, id: u32) -> Option<&Index> {
        self.indexes.iter().find(|i| i.id == id)
    }

    /// Position of a field in the tuple.
    pub fn field_position(&self, name: &str) -> Option<usize> {
        self.format.iter().position(|f| f.name == name)
    }
}

/// Reference to a space by name or id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceRef<'a> {
    Name(&'a str),
    Id(u32),
}

impl<'a> From<&'a str> for SpaceRef<'a> {
    fn from(name: &'a str) -> Self {
        SpaceRef::Name(name)
    }
}

impl<'a> From<&'a String> for SpaceRef<'a> {
    fn from(name: &'a String) -> Self {
        SpaceRef::Name(name)
    }
}

impl From<u32> for SpaceRef<'_> {
    fn from(id: u32) -> Self {
        SpaceRef::Id(id)
    }
}

impl fmt::Display for SpaceRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpaceRef::Name(name) => write!(f, "space '{name}'"),
            SpaceRef::Id(id) => write!(f, "space {id}"),
        }
    }
}

/// Snapshot of the server schema.
#[derive(Debug, Default)]
pub struct SchemaCache {
    pub version: u64,
    by_name: HashMap<String, Arc<Space>>,
    by_id: HashMap<u32, Arc<Space>>,
}

impl SchemaCache {
    fn new(version: u64, spaces: Vec<Space>) -> Self {
        let mut cache = Self {
            version,
            by_name: HashMap::with_capacity(spaces.len()),
            by_id: HashMap::with_capacity(spaces.len()),
        };
        for space in spaces {
            let space = Arc::new(space);
            cache.by_name.insert(space.name.clone(), Arc::clone(&space));
            cache.by_id.insert(space.id, space);
        }
        cache
    }

    pub fn get(&self, space: SpaceRef<'_>) -> Option<Arc<Space>> {
        match space {
            SpaceRef::Name(name) => self.by_name.get(name).cloned(),
            SpaceRef::Id(id) => self.by_id.get(&id).cloned(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Spaces ordered by id.
    pub fn spaces(&self) -> Vec<Arc<Space>> {
        let mut spaces: Vec<_> = self.by_id.values().cloned().collect();
        spaces.sort_by_key(|s| s.id);
        spaces
    }
}

/// Keeps the schema cache consistent with the server.
pub struct SchemaFetcher {
    balancer: Arc<Balancer>,
    ignore_stale: bool,
    timeout: Duration,
    cache: RwLock<Arc<SchemaCache>>,
    /// Serializes re-fetches.
    refresh: tokio::sync::Mutex<()>,
}

impl SchemaFetcher {
    /// Creates the fetcher and performs the initial fetch.
    pub async fn new(
        balancer: Arc<Balancer>,
        ignore_stale: bool,
        timeout: Duration,
    ) -> Result<Arc<Self>, ClientError> {
        let fetcher = Arc::new(Self {
            balancer,
            ignore_stale,
            timeout,
            cache: RwLock::new(Arc::new(SchemaCache::default())),
            refresh: tokio::sync::Mutex::new(()),
        });
        fetcher.refresh(None).await?;
        Ok(fetcher)
    }

    pub fn version(&self) -> u64 {
        self.cache.read().version
    }

    /// Current snapshot.
    pub fn cache(&self) -> Arc<SchemaCache> {
        Arc::clone(&self.cache.read())
    }

    /// Checks a response's schema version against the cache, re-fetching
    /// when the server moved ahead. The response itself is passed through.
    pub async fn process_response(&self, response: Response) -> Result<Response, ClientError> {
        let Some(version) = response.schema_version() else {
            return Ok(response);
        };
        let cached = self.version();
        match version.cmp(&cached) {
            Ordering::Equal => Ok(response),
            Ordering::Less if self.ignore_stale => {
                tracing::debug!("Passing response with stale schema {} < {}", version, cached);
                Ok(response)
            }
            Ordering::Less => Err(ClientError::SchemaFetching(format!(
                "response schema version {version} is older than cached {cached}"
            ))),
            Ordering::Greater => {
                tracing::debug!("Schema version moved {} -> {}, re-fetching", cached, version);
                self.refresh(Some(version)).await?;
                Ok(response)
            }
        }
    }

    /// Looks a space up, re-fetching once on a miss.
    pub async fn get_space<'a>(&self, space: impl Into<SpaceRef<'a>>) -> Result<Arc<Space>, ClientError> {
        let space = space.into();
        if let Some(found) = self.cache.read().get(space) {
            return Ok(found);
        }
        self.refresh(None).await?;
        self.cache
            .read()
            .get(space)
            .ok_or_else(|| ClientError::NoSchema(space.to_string()))
    }

    /// Re-fetches the catalogs. With `at_least`, a fetch already covering
    /// that version (done by a concurrent caller) is reused.
    pub async fn refresh(&self, at_least: Option<u64>) -> Result<(), ClientError> {
        let _refresh = self.refresh.lock().await;
        if let Some(wanted) = at_least {
            if self.version() >= wanted {
                return Ok(());
            }
        }

        let (version, spaces) = self.fetch().await?;
        let cached = self.version();
        if version < cached && !self.ignore_stale {
            return Err(ClientError::SchemaFetching(format!(
                "fetched schema version {version} is older than cached {cached}"
            )));
        }

        tracing::info!("Schema version {}: {} spaces", version, spaces.len());
        *self.cache.write() = Arc::new(SchemaCache::new(version, spaces));
        Ok(())
    }

    /// Reads both catalogs over one connection. Retried when a schema change
    /// lands between the two reads.
    async fn fetch(&self) -> Result<(u64, Vec<Space>), ClientError> {
        for attempt in 1..=FETCH_ATTEMPTS {
            let conn = self.balancer.get_next().await?;
            let options = RequestOptions::default().with_timeout(self.timeout);
            let all = SelectParams::default().with_iterator(IteratorType::All);

            let spaces = conn
                .send(
                    request::select(VSPACE_ID, 0, Value::Array(vec![]), all),
                    options.clone(),
                )
                .await?;
            let indexes = conn
                .send(
                    request::select(VINDEX_ID, 0, Value::Array(vec![]), all),
                    options,
                )
                .await?;
            let spaces = spaces.wait().await?;
            let indexes = indexes.wait().await?;

            let version = spaces.schema_version().unwrap_or_default();
            if indexes.schema_version().unwrap_or_default() != version {
                tracing::debug!("Schema changed during fetch (attempt {})", attempt);
                continue;
            }

            let spaces = rows(&spaces)?
                .iter()
                .map(parse_space)
                .collect::<Result<Vec<_>, _>>()?;
            let indexes = rows(&indexes)?
                .iter()
                .map(parse_index)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok((version, merge(spaces, indexes)));
        }
        Err(ClientError::SchemaFetching(format!(
            "schema kept changing during {FETCH_ATTEMPTS} fetch attempts"
        )))
    }
}

/// Attaches index rows to their spaces. Both inputs are ordered by space
/// id, so one linear pass suffices.
fn merge(mut spaces: Vec<Space>, indexes: Vec<Index>) -> Vec<Space> {
    let mut indexes = indexes.into_iter().peekable();
    for space in spaces.iter_mut() {
        while let Some(index) = indexes.peek() {
            if index.space_id < space.id {
                // index of a space not visible to this user
                indexes.next();
            } else if index.space_id == space.id {
                if let Some(index) = indexes.next() {
                    space.indexes.push(index);
                }
            } else {
                break;
            }
        }
    }
    spaces
}

fn rows(response: &Response) -> Result<Vec<Value>, ClientError> {
    match response.field(body_key::DATA)? {
        Some(Value::Array(rows)) => Ok(rows),
        Some(_) => Err(malformed("catalog data is not an array")),
        None => Ok(Vec::new()),
    }
}

fn malformed(reason: &str) -> ClientError {
    ClientError::SchemaFetching(reason.to_string())
}

fn tuple(row: &Value, min_len: usize) -> Result<&[Value], ClientError> {
    match row {
        Value::Array(fields) if fields.len() >= min_len => Ok(fields),
        _ => Err(malformed("catalog row is too short")),
    }
}

fn uint(value: &Value, what: &str) -> Result<u32, ClientError> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| malformed(&format!("{what} is not an unsigned integer")))
}

/// Like [`uint`], but an absent or nil field reads as zero.
fn opt_uint(value: Option<&Value>, what: &str) -> Result<u32, ClientError> {
    match value {
        None | Some(Value::Nil) => Ok(0),
        Some(value) => uint(value, what),
    }
}

fn string(value: &Value) -> String {
    value.as_str().unwrap_or_default().to_string()
}

fn map_get<'v>(value: &'v Value, key: &str) -> Option<&'v Value> {
    value
        .as_map()?
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

fn parse_space(row: &Value) -> Result<Space, ClientError> {
    let fields = tuple(row, 3)?;
    let format = match fields.get(6) {
        Some(Value::Array(entries)) => entries
            .iter()
            .map(|entry| Field {
                name: map_get(entry, "name").map(string).unwrap_or_default(),
                field_type: map_get(entry, "type").map(string).unwrap_or_default(),
                is_nullable: map_get(entry, "is_nullable")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
            .collect(),
        _ => Vec::new(),
    };
    Ok(Space {
        id: uint(&fields[0], "space id")?,
        owner: opt_uint(fields.get(1), "space owner")?,
        name: string(&fields[2]),
        engine: fields.get(3).map(string).unwrap_or_default(),
        field_count: opt_uint(fields.get(4), "space field count")?,
        format,
        indexes: Vec::new(),
    })
}

fn parse_index(row: &Value) -> Result<Index, ClientError> {
    let fields = tuple(row, 3)?;
    let unique = fields
        .get(4)
        .and_then(|opts| map_get(opts, "unique"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let parts = match fields.get(5) {
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| parse_part(part).transpose())
            .collect::<Result<Vec<_>, _>>()?,
        _ => Vec::new(),
    };
    Ok(Index {
        space_id: uint(&fields[0], "index space id")?,
        id: uint(&fields[1], "index id")?,
        name: string(&fields[2]),
        index_type: fields.get(3).map(string).unwrap_or_default(),
        unique,
        parts,
    })
}

/// Parts come either as `[field, type]` or as `{field = .., type = ..}`.
/// Other shapes are skipped.
fn parse_part(part: &Value) -> Result<Option<IndexPart>, ClientError> {
    let (field, field_type) = match part {
        Value::Array(items) => (items.first(), items.get(1)),
        Value::Map(_) => (map_get(part, "field"), map_get(part, "type")),
        _ => return Ok(None),
    };
    let Some(field) = field else {
        return Ok(None);
    };
    Ok(Some(IndexPart {
        field: uint(field, "index part field")?,
        field_type: field_type.map(string).unwrap_or_default(),
    }))
}
