//! Sharded pool registry.
//!
//! WHY: Every checkout and checkin touches the registry, from many threads at
//! once. One global lock would serialise unrelated hosts.
//!
//! WHAT: `N` shards, each a `Mutex<HashMap<PoolKey, KeyPool>>`, picked by key
//! hash. A key pool holds idle connections (oldest first) and the ids of its
//! checked-out connections. Taking an idle connection moves it to checked-out
//! under the shard lock, so two callers never receive the same one.
//! Checked-out entries are weak watches; handles dropped without a checkin
//! or release are forgotten by the next reap.

use super::PoolKey;
use crate::connection::Connection;
use crate::types::{ConnectionId, ConnectionWatch};
use std::collections::hash_map::RandomState;
use std::collections::{HashMap, VecDeque};
use std::hash::BuildHasher;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Entry stored in the idle queue: (connection, time it went idle).
type IdleEntry = (Connection, Instant);

#[derive(Default)]
struct KeyPool {
    idle: VecDeque<IdleEntry>,
    checked_out: HashMap<ConnectionId, ConnectionWatch>,
}

impl KeyPool {
    fn is_empty(&self) -> bool {
        self.idle.is_empty() && self.checked_out.is_empty()
    }
}

type Shard = HashMap<PoolKey, KeyPool>;

/// What happened to a connection handed to [`PoolRegistry::mark_idle`].
#[derive(Debug)]
pub enum CheckinOutcome {
    /// Parked as idle.
    Parked,
    /// Parked; the oldest idle connection for the key was pushed out over
    /// the per-key limit and must be closed.
    Evicted(Connection),
    /// Not reusable; handed back to be closed.
    Rejected(Connection),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub keys: usize,
    pub idle: usize,
    pub checked_out: usize,
}

pub struct PoolRegistry {
    shards: Vec<Mutex<Shard>>,
    hasher: RandomState,
    max_idle_per_key: usize,
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("shards", &self.shards.len())
            .field("max_idle_per_key", &self.max_idle_per_key)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PoolRegistry {
    #[must_use]
    pub fn new(shards: usize, max_idle_per_key: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
            max_idle_per_key,
        }
    }

    fn shard(&self, key: &PoolKey) -> MutexGuard<'_, Shard> {
        let hash = self.hasher.hash_one(key);
        let index = usize::try_from(hash % self.shards.len() as u64).unwrap_or_default();
        // A panicking holder leaves the map consistent; every mutation below
        // is a single insert or remove.
        self.shards[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the most recently parked idle connection for `key` and records
    /// it as checked out.
    #[must_use]
    pub fn lookup_idle(&self, key: &PoolKey) -> Option<Connection> {
        let mut shard = self.shard(key);
        let pool = shard.get_mut(key)?;
        let (connection, _) = pool.idle.pop_back()?;
        pool.checked_out.insert(connection.id(), connection.watch());
        Some(connection)
    }

    /// Records a freshly opened connection as checked out.
    pub fn register(&self, key: &PoolKey, watch: ConnectionWatch) {
        self.shard(key)
            .entry(key.clone())
            .or_default()
            .checked_out
            .insert(watch.id(), watch);
    }

    /// Moves one specific idle connection to checked out.
    #[must_use]
    pub fn mark_checked_out(&self, key: &PoolKey, id: ConnectionId) -> Option<Connection> {
        let mut shard = self.shard(key);
        let pool = shard.get_mut(key)?;
        let position = pool.idle.iter().position(|(conn, _)| conn.id() == id)?;
        let (connection, _) = pool.idle.remove(position)?;
        pool.checked_out.insert(id, connection.watch());
        Some(connection)
    }

    /// Parks a connection as idle under its endpoint's key.
    ///
    /// Connections the registry has never seen are adopted.
    pub fn mark_idle(&self, connection: Connection) -> CheckinOutcome {
        let key = PoolKey::from(connection.endpoint());
        let mut shard = self.shard(&key);
        let pool = shard.entry(key.clone()).or_default();
        pool.checked_out.remove(&connection.id());

        if !connection.is_reusable() || self.max_idle_per_key == 0 {
            if pool.is_empty() {
                shard.remove(&key);
            }
            return CheckinOutcome::Rejected(connection);
        }

        pool.idle.push_back((connection, Instant::now()));
        if pool.idle.len() > self.max_idle_per_key {
            if let Some((oldest, _)) = pool.idle.pop_front() {
                return CheckinOutcome::Evicted(oldest);
            }
        }
        CheckinOutcome::Parked
    }

    /// Forgets a connection, returning it when it was parked idle.
    pub fn remove(&self, key: &PoolKey, id: ConnectionId) -> Option<Connection> {
        let mut shard = self.shard(key);
        let pool = shard.get_mut(key)?;
        pool.checked_out.remove(&id);

        let removed = pool
            .idle
            .iter()
            .position(|(conn, _)| conn.id() == id)
            .and_then(|position| pool.idle.remove(position))
            .map(|(connection, _)| connection);

        if pool.is_empty() {
            shard.remove(key);
        }
        removed
    }

    /// Takes out idle connections parked longer than `max_idle`, or whose
    /// socket has closed since, and forgets checked-out handles that were
    /// dropped.
    #[must_use]
    pub fn reap_idle(&self, max_idle: Duration) -> Vec<Connection> {
        let now = Instant::now();
        let mut reaped = Vec::new();

        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            for pool in shard.values_mut() {
                let (stale, fresh): (VecDeque<_>, VecDeque<_>) =
                    pool.idle.drain(..).partition(|(conn, since)| {
                        now.duration_since(*since) >= max_idle || !conn.is_reusable()
                    });
                pool.idle = fresh;
                pool.checked_out.retain(|_, watch| watch.is_alive());
                reaped.extend(stale.into_iter().map(|(connection, _)| connection));
            }
            shard.retain(|_, pool| !pool.is_empty());
        }

        reaped
    }

    /// Empties the registry, returning every idle connection.
    #[must_use]
    pub fn drain(&self) -> Vec<Connection> {
        let mut drained = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            for (_, pool) in shard.drain() {
                drained.extend(pool.idle.into_iter().map(|(connection, _)| connection));
            }
        }
        drained
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for shard in &self.shards {
            let shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            stats.keys += shard.len();
            for pool in shard.values() {
                stats.idle += pool.idle.len();
                stats.checked_out += pool.checked_out.len();
            }
        }
        stats
    }

    #[must_use]
    pub fn stats_for(&self, key: &PoolKey) -> RegistryStats {
        let shard = self.shard(key);
        shard
            .get(key)
            .map(|pool| RegistryStats {
                keys: 1,
                idle: pool.idle.len(),
                checked_out: pool.checked_out.len(),
            })
            .unwrap_or_default()
    }
}
