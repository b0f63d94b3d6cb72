//! Connection selection over a pool.
//!
//! A policy only decides which `(tag, index)` to try next; the cursor is
//! mutated under a short lock and the acquisition itself runs outside it.

use crate::config::BalancerKind;
use crate::connection::Connection;
use crate::error::ClientError;
use crate::pool::{Pool, Slot};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Chooses the next slot position given the current pool layout.
pub trait SelectionPolicy: Send + Sync {
    /// `layout` lists tags with their group sizes, in configuration order.
    /// Returns `None` when every group is empty.
    fn next(&self, layout: &[(String, usize)]) -> Option<(String, usize)>;
}

#[derive(Debug, Default)]
struct Cursor {
    tag: usize,
    connection: usize,
}

/// Walks every connection of a tag, then moves to the next tag.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: Mutex<Cursor>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionPolicy for RoundRobin {
    fn next(&self, layout: &[(String, usize)]) -> Option<(String, usize)> {
        if layout.is_empty() {
            return None;
        }
        let mut cursor = self.cursor.lock();
        // one extra turn lets a cursor left past a shrunk group wrap around
        for _ in 0..=layout.len() {
            if cursor.tag >= layout.len() {
                cursor.tag = 0;
                cursor.connection = 0;
            }
            let (tag, size) = &layout[cursor.tag];
            if cursor.connection < *size {
                let pick = (tag.clone(), cursor.connection);
                cursor.connection += 1;
                if cursor.connection >= *size {
                    cursor.tag += 1;
                    cursor.connection = 0;
                }
                return Some(pick);
            }
            cursor.tag += 1;
            cursor.connection = 0;
        }
        None
    }
}

#[derive(Debug, Default)]
struct DistributingCursor {
    tag: usize,
    per_tag: HashMap<String, usize>,
}

/// Switches tag on every call and keeps a separate connection cursor per
/// tag, so load is spread across tags at the same cadence as within them.
#[derive(Debug, Default)]
pub struct DistributingRoundRobin {
    cursor: Mutex<DistributingCursor>,
}

impl DistributingRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionPolicy for DistributingRoundRobin {
    fn next(&self, layout: &[(String, usize)]) -> Option<(String, usize)> {
        let mut cursor = self.cursor.lock();
        for _ in 0..layout.len() {
            let position = cursor.tag % layout.len();
            cursor.tag = position + 1;
            let (tag, size) = &layout[position];
            if *size == 0 {
                continue;
            }
            let next = cursor.per_tag.entry(tag.clone()).or_insert(0);
            let index = *next % size;
            *next = index + 1;
            return Some((tag.clone(), index));
        }
        None
    }
}

/// Selection policy chosen from configuration.
#[derive(Debug)]
pub enum Policy {
    RoundRobin(RoundRobin),
    DistributingRoundRobin(DistributingRoundRobin),
}

impl Policy {
    pub fn new(kind: BalancerKind) -> Self {
        match kind {
            BalancerKind::RoundRobin => Policy::RoundRobin(RoundRobin::new()),
            BalancerKind::DistributingRoundRobin => {
                Policy::DistributingRoundRobin(DistributingRoundRobin::new())
            }
        }
    }
}

impl SelectionPolicy for Policy {
    fn next(&self, layout: &[(String, usize)]) -> Option<(String, usize)> {
        match self {
            Policy::RoundRobin(policy) => policy.next(layout),
            Policy::DistributingRoundRobin(policy) => policy.next(layout),
        }
    }
}

/// Picks a connection for each outgoing request.
pub struct Balancer {
    pool: Arc<Pool>,
    policy: Policy,
}

impl Balancer {
    pub fn new(pool: Arc<Pool>, kind: BalancerKind) -> Self {
        Self {
            pool,
            policy: Policy::new(kind),
        }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Returns the next connection, skipping slots whose acquisition fails.
    pub async fn get_next(&self) -> Result<Arc<Connection>, ClientError> {
        self.get_next_slot().await.map(|(_, conn)| conn)
    }

    /// Like [`get_next`](Self::get_next), also returning the slot chosen.
    ///
    /// Gives up with `NoAvailableClients` when the pool reports no clients
    /// or when as many consecutive attempts as the pool has slots failed.
    pub async fn get_next_slot(&self) -> Result<(Arc<Slot>, Arc<Connection>), ClientError> {
        let mut failures = 0usize;
        loop {
            if !self.pool.has_available_clients() {
                return Err(if self.pool.is_closed() {
                    ClientError::PoolClosed
                } else {
                    ClientError::NoAvailableClients
                });
            }
            let layout = self.pool.layout();
            let total: usize = layout.iter().map(|(_, size)| size).sum();
            if failures >= total {
                return Err(ClientError::NoAvailableClients);
            }
            let Some((tag, index)) = self.policy.next(&layout) else {
                return Err(ClientError::NoAvailableClients);
            };

            let slot = match self.pool.get(&tag, index) {
                Ok(slot) => slot,
                Err(ClientError::PoolClosed) => return Err(ClientError::PoolClosed),
                Err(e) => {
                    // resized between layout and lookup
                    tracing::debug!("Skipping {}[{}]: {}", tag, index, e);
                    failures += 1;
                    continue;
                }
            };
            match slot.acquire().await {
                Ok(conn) => return Ok((slot, conn)),
                Err(ClientError::PoolClosed) if self.pool.is_closed() => {
                    return Err(ClientError::PoolClosed)
                }
                Err(e) => {
                    tracing::debug!("Skipping {}[{}]: {}", tag, index, e);
                    failures += 1;
                }
            }
        }
    }
}
