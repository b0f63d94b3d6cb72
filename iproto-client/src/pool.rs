//! Connection pool.
//!
//! The pool holds one ordered list of slots per group tag. Resizing keeps
//! the indices of surviving slots stable: groups grow at the end and shrink
//! from the highest index. Removed slots are closed gracefully in the
//! background so their in-flight requests can finish.

use crate::config::{validate_groups, ClientConfig, InstanceConnectionGroup};
use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use crate::heartbeat;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// One position in a group. Owns at most one live connection and replaces
/// it when it dies.
pub struct Slot {
    tag: String,
    index: usize,
    config: ConnectionConfig,
    graceful_close_timeout: Duration,
    connection: RwLock<Option<Arc<Connection>>>,
    connecting: tokio::sync::Mutex<()>,
    healthy: AtomicBool,
    closed: AtomicBool,
    heartbeat: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Slot {
    fn new(tag: &str, index: usize, config: ConnectionConfig, graceful_close_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            tag: tag.to_string(),
            index,
            config,
            graceful_close_timeout,
            connection: RwLock::new(None),
            connecting: tokio::sync::Mutex::new(()),
            healthy: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            heartbeat: parking_lot::Mutex::new(None),
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Current connection, whatever its state.
    pub fn current(&self) -> Option<Arc<Connection>> {
        self.connection.read().clone()
    }

    /// Whether the slot holds a connected, healthy connection.
    pub fn is_ready(&self) -> bool {
        self.is_healthy() && self.current().is_some_and(|c| c.is_connected())
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Returns the slot's connection, connecting or reconnecting first when
    /// needed. Unhealthy connections are refused.
    pub async fn acquire(&self) -> Result<Arc<Connection>, ClientError> {
        if self.is_closed() {
            return Err(ClientError::PoolClosed);
        }
        if let Some(conn) = self.current().filter(|c| c.is_connected()) {
            return self.checked(conn);
        }

        let _connecting = self.connecting.lock().await;
        if self.is_closed() {
            return Err(ClientError::PoolClosed);
        }
        if let Some(conn) = self.current().filter(|c| c.is_connected()) {
            return self.checked(conn);
        }

        tracing::debug!("Connecting slot {}[{}] to {}", self.tag, self.index, self.config.address());
        let conn = Arc::new(Connection::new(self.config.clone()));
        conn.connect().await?;

        if self.is_closed() {
            conn.close().await;
            return Err(ClientError::PoolClosed);
        }
        *self.connection.write() = Some(Arc::clone(&conn));
        self.set_healthy(true);
        Ok(conn)
    }

    fn checked(&self, conn: Arc<Connection>) -> Result<Arc<Connection>, ClientError> {
        if self.is_healthy() {
            Ok(conn)
        } else {
            Err(ClientError::NotConnected)
        }
    }

    /// Drops the current connection; the next acquisition reconnects.
    pub(crate) async fn invalidate(&self) {
        self.set_healthy(false);
        let conn = self.connection.write().take();
        if let Some(conn) = conn {
            conn.close().await;
        }
    }

    fn start(self: &Arc<Self>, heartbeat: Option<&crate::config::HeartbeatConfig>) {
        let Ok(handle) = Handle::try_current() else {
            // connects lazily on first acquisition
            return;
        };
        let slot = Arc::clone(self);
        handle.spawn(async move {
            if let Err(e) = slot.acquire().await {
                tracing::debug!("Initial connect of {}[{}] failed: {}", slot.tag, slot.index, e);
            }
        });
        if let Some(config) = heartbeat {
            let task = heartbeat::spawn(Arc::downgrade(self), config.clone());
            *self.heartbeat.lock() = Some(task);
        }
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.heartbeat.lock().take() {
            task.abort();
        }
    }

    /// Closes the slot, letting in-flight requests drain.
    pub(crate) async fn close(&self) {
        self.mark_closed();
        let conn = self.connection.write().take();
        if let Some(conn) = conn {
            conn.close_gracefully(self.graceful_close_timeout).await;
        }
    }

    fn retire(self: Arc<Self>) {
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { self.close().await });
            }
            Err(_) => self.mark_closed(),
        }
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("tag", &self.tag)
            .field("index", &self.index)
            .field("ready", &self.is_ready())
            .finish()
    }
}

struct Group {
    definition: InstanceConnectionGroup,
    slots: Vec<Arc<Slot>>,
}

#[derive(Default)]
struct PoolInner {
    /// Tags in configuration order.
    order: Vec<String>,
    groups: HashMap<String, Group>,
}

/// Named groups of connections.
pub struct Pool {
    config: ClientConfig,
    inner: RwLock<PoolInner>,
    closed: AtomicBool,
}

impl Pool {
    /// Creates an empty pool. Connection settings other than the groups are
    /// taken from `config`.
    pub fn new(config: ClientConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: RwLock::new(PoolInner::default()),
            closed: AtomicBool::new(false),
        })
    }

    /// Creates a pool populated with the configured groups.
    pub fn with_groups(config: ClientConfig) -> Result<Arc<Self>, ClientError> {
        let groups = config.groups.clone();
        let pool = Self::new(config);
        pool.set_groups(groups)?;
        Ok(pool)
    }

    fn new_slot(&self, definition: &InstanceConnectionGroup, index: usize) -> Arc<Slot> {
        Slot::new(
            &definition.tag,
            index,
            ConnectionConfig::from_group(definition, &self.config),
            self.config.graceful_close_timeout(),
        )
    }

    /// Reconciles the pool with `groups`.
    pub fn set_groups(&self, groups: Vec<InstanceConnectionGroup>) -> Result<(), ClientError> {
        validate_groups(&groups).map_err(|e| ClientError::InvalidArgument(e.to_string()))?;
        if self.is_closed() {
            return Err(ClientError::PoolClosed);
        }

        let mut created = Vec::new();
        let mut removed = Vec::new();
        {
            let mut inner = self.inner.write();
            let wanted: HashSet<&str> = groups.iter().map(|g| g.tag.as_str()).collect();
            inner.groups.retain(|tag, group| {
                if wanted.contains(tag.as_str()) {
                    return true;
                }
                removed.append(&mut group.slots);
                false
            });

            for definition in &groups {
                match inner.groups.get_mut(&definition.tag) {
                    Some(group) if same_endpoint(&group.definition, definition) => {
                        while group.slots.len() > definition.size {
                            if let Some(slot) = group.slots.pop() {
                                removed.push(slot);
                            }
                        }
                        for index in group.slots.len()..definition.size {
                            let slot = self.new_slot(definition, index);
                            created.push(Arc::clone(&slot));
                            group.slots.push(slot);
                        }
                        group.definition = definition.clone();
                    }
                    Some(group) => {
                        removed.append(&mut group.slots);
                        for index in 0..definition.size {
                            let slot = self.new_slot(definition, index);
                            created.push(Arc::clone(&slot));
                            group.slots.push(slot);
                        }
                        group.definition = definition.clone();
                    }
                    None => {
                        let slots: Vec<_> = (0..definition.size)
                            .map(|i| self.new_slot(definition, i))
                            .collect();
                        created.extend(slots.iter().cloned());
                        inner.groups.insert(
                            definition.tag.clone(),
                            Group {
                                definition: definition.clone(),
                                slots,
                            },
                        );
                    }
                }
            }
            inner.order = groups.iter().map(|g| g.tag.clone()).collect();
        }

        if !created.is_empty() || !removed.is_empty() {
            tracing::info!(
                "Pool resized: {} slots added, {} removed, {} total",
                created.len(),
                removed.len(),
                self.available_connections()
            );
        }
        for slot in &created {
            slot.start(self.config.heartbeat.as_ref());
        }
        for slot in removed {
            slot.retire();
        }
        Ok(())
    }

    /// Returns the slot at `index` in group `tag`.
    pub fn get(&self, tag: &str, index: usize) -> Result<Arc<Slot>, ClientError> {
        if self.is_closed() {
            return Err(ClientError::PoolClosed);
        }
        let inner = self.inner.read();
        let group = inner
            .groups
            .get(tag)
            .ok_or_else(|| ClientError::NoSuchGroup(tag.to_string()))?;
        group
            .slots
            .get(index)
            .cloned()
            .ok_or_else(|| ClientError::IndexOutOfRange {
                tag: tag.to_string(),
                index,
                size: group.slots.len(),
            })
    }

    /// Returns a ready connection of the slot at `index` in group `tag`.
    pub async fn connection(&self, tag: &str, index: usize) -> Result<Arc<Connection>, ClientError> {
        self.get(tag, index)?.acquire().await
    }

    /// Tags and group sizes in configuration order.
    pub fn layout(&self) -> Vec<(String, usize)> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|tag| inner.groups.get(tag).map(|g| (tag.clone(), g.slots.len())))
            .collect()
    }

    pub fn tags(&self) -> Vec<String> {
        self.inner.read().order.clone()
    }

    pub fn group_size(&self, tag: &str) -> Option<usize> {
        self.inner.read().groups.get(tag).map(|g| g.slots.len())
    }

    /// Sum of all group sizes.
    pub fn available_connections(&self) -> usize {
        self.inner.read().groups.values().map(|g| g.slots.len()).sum()
    }

    /// Number of slots holding a connected, healthy connection.
    pub fn live_connections(&self) -> usize {
        self.slots().iter().filter(|s| s.is_ready()).count()
    }

    /// Whether acquisition can still succeed.
    pub fn has_available_clients(&self) -> bool {
        !self.is_closed() && self.available_connections() > 0
    }

    fn slots(&self) -> Vec<Arc<Slot>> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|tag| inner.groups.get(tag))
            .flat_map(|g| g.slots.iter().cloned())
            .collect()
    }

    /// Applies `action` to every connected connection.
    pub fn for_each(&self, mut action: impl FnMut(&Slot, &Arc<Connection>)) {
        for slot in self.slots() {
            if let Some(conn) = slot.current().filter(|c| c.is_connected()) {
                action(&slot, &conn);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes every group. Later calls to `get` fail with `PoolClosed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let slots: Vec<Arc<Slot>> = {
            let mut inner = self.inner.write();
            inner.order.clear();
            inner.groups.drain().flat_map(|(_, g)| g.slots).collect()
        };
        tracing::info!("Closing pool with {} slots", slots.len());

        let mut closing = tokio::task::JoinSet::new();
        for slot in slots {
            closing.spawn(async move { slot.close().await });
        }
        while closing.join_next().await.is_some() {}
    }
}

fn same_endpoint(a: &InstanceConnectionGroup, b: &InstanceConnectionGroup) -> bool {
    a.host == b.host
        && a.port == b.port
        && a.user == b.user
        && a.password == b.password
        && a.auth_mechanism == b.auth_mechanism
}
