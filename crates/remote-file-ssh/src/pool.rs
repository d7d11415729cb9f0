//! Connection pool and admission control
//!
//! One client per [`ConnectionIdentity`] is shared by every caller holding a
//! slot for it. Each identity admits at most `max_sessions` concurrent
//! holders; further callers wait until a slot is released. The client is
//! created on first acquisition and closed as soon as the last holder
//! releases it.

use crate::error::RemoteError;
use crate::identity::ConnectionIdentity;
use crate::transport::Transport;
use crate::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default per-identity session ceiling
pub const DEFAULT_MAX_SESSIONS: usize = 3;

/// Connection pool configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum concurrent sessions per identity
    pub max_sessions: usize,
    /// Upper bound on how long a waiter sleeps before re-checking for a slot
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            poll_interval: Duration::from_millis(25),
        }
    }
}

impl PoolConfig {
    /// Config with the given ceiling and the default poll interval
    pub fn with_max_sessions(max_sessions: usize) -> Self {
        Self {
            max_sessions,
            ..Default::default()
        }
    }
}

/// Connection pool entry
#[derive(Debug)]
struct PoolEntry<C> {
    /// Shared client
    client: Arc<C>,
    /// Holders of this client; never zero while the entry exists
    active: usize,
}

struct PoolInner<C> {
    config: PoolConfig,
    entries: Mutex<HashMap<ConnectionIdentity, PoolEntry<C>>>,
    released: Notify,
}

/// Pool of shared transports keyed by connection identity
pub struct ConnectionPool<C: Transport> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Transport> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Transport> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .finish()
    }
}

impl<C: Transport + 'static> ConnectionPool<C> {
    /// Create a new connection pool
    pub fn new(mut config: PoolConfig) -> Self {
        if config.max_sessions == 0 {
            warn!("max_sessions of 0 would block every caller, using 1");
            config.max_sessions = 1;
        }
        Self {
            inner: Arc::new(PoolInner {
                config,
                entries: Mutex::new(HashMap::new()),
                released: Notify::new(),
            }),
        }
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Take a session slot for `identity`, dialing with `connect` if no client exists
    ///
    /// Waits while the identity is at its ceiling. A new client is dialed
    /// while the pool lock is held, so a slow dial delays acquisitions for
    /// every identity until it finishes. A failed dial leaves nothing behind.
    pub async fn acquire<F, Fut>(&self, identity: &ConnectionIdentity, connect: F) -> Result<Arc<C>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        let max = self.inner.config.max_sessions;
        loop {
            let mut entries = self.inner.entries.lock().await;
            match entries.get_mut(identity) {
                Some(entry) if entry.active < max => {
                    entry.active += 1;
                    debug!(
                        "Reusing connection {} ({}/{} sessions)",
                        identity, entry.active, max
                    );
                    return Ok(Arc::clone(&entry.client));
                }
                Some(_) => {
                    // Register before unlocking so a release in between is not missed.
                    let released = self.inner.released.notified();
                    drop(entries);
                    debug!("Connection {} at {} sessions, waiting", identity, max);
                    let _ = timeout(self.inner.config.poll_interval, released).await;
                }
                None => {
                    debug!("Creating new connection {}", identity);
                    let client = Arc::new(connect().await?);
                    entries.insert(
                        identity.clone(),
                        PoolEntry {
                            client: Arc::clone(&client),
                            active: 1,
                        },
                    );
                    info!("Opened connection {}", identity);
                    return Ok(client);
                }
            }
        }
    }

    /// Give back a slot taken with [`acquire`](Self::acquire)
    ///
    /// Releasing the last slot removes the entry and closes its client. A
    /// close failure is returned, but the entry is gone either way. Releasing
    /// an identity that holds no slot fails with
    /// [`RemoteError::NotAcquired`].
    pub async fn release(&self, identity: &ConnectionIdentity) -> Result<()> {
        match self.checkin(identity).await? {
            Some(client) => Self::close_client(identity, client).await,
            None => Ok(()),
        }
    }

    /// Decrement the slot count for `identity`
    ///
    /// The count is committed once the pool lock is taken; the only await
    /// point is the lock itself. Returns the client when this was the last
    /// slot so the caller can close it.
    async fn checkin(&self, identity: &ConnectionIdentity) -> Result<Option<Arc<C>>> {
        let closing = {
            let mut entries = self.inner.entries.lock().await;
            let entry = entries
                .get_mut(identity)
                .ok_or_else(|| RemoteError::NotAcquired(identity.to_string()))?;
            entry.active -= 1;
            if entry.active > 0 {
                debug!("Released connection {} ({} sessions left)", identity, entry.active);
                None
            } else {
                entries.remove(identity).map(|entry| entry.client)
            }
        };
        self.inner.released.notify_waiters();
        Ok(closing)
    }

    async fn close_client(identity: &ConnectionIdentity, client: Arc<C>) -> Result<()> {
        info!("Closing idle connection {}", identity);
        client.close().await.map_err(|e| {
            warn!("Error closing connection {}: {}", identity, e);
            e
        })
    }

    /// Acquire a slot wrapped in a [`PoolLease`]
    pub async fn lease<F, Fut>(&self, identity: &ConnectionIdentity, connect: F) -> Result<PoolLease<C>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        let client = self.acquire(identity, connect).await?;
        Ok(PoolLease {
            id: Uuid::new_v4(),
            identity: identity.clone(),
            client,
            pool: self.clone(),
            released: false,
        })
    }

    /// Sessions currently held for `identity`
    pub async fn active_sessions(&self, identity: &ConnectionIdentity) -> usize {
        let entries = self.inner.entries.lock().await;
        entries.get(identity).map_or(0, |entry| entry.active)
    }

    /// Get pool statistics
    pub async fn stats(&self) -> PoolStats {
        let entries = self.inner.entries.lock().await;
        PoolStats {
            identities: entries.len(),
            active_sessions: entries.values().map(|entry| entry.active).sum(),
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Identities with a live client
    pub identities: usize,
    /// Sessions held across all identities
    pub active_sessions: usize,
}

/// A held session slot
///
/// Call [`release`](Self::release) to return it and observe close errors.
/// A lease dropped without releasing is returned in the background.
pub struct PoolLease<C: Transport + 'static> {
    id: Uuid,
    identity: ConnectionIdentity,
    client: Arc<C>,
    pool: ConnectionPool<C>,
    released: bool,
}

impl<C: Transport + 'static> PoolLease<C> {
    /// Get the lease ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Identity the slot belongs to
    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    /// The shared client
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Return the slot to the pool
    ///
    /// If this future is dropped before the slot count is updated, the
    /// lease's `Drop` still returns the slot.
    pub async fn release(mut self) -> Result<()> {
        let closing = self.pool.checkin(&self.identity).await;
        self.released = true;
        match closing? {
            Some(client) => ConnectionPool::close_client(&self.identity, client).await,
            None => Ok(()),
        }
    }
}

impl<C: Transport + 'static> Drop for PoolLease<C> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let pool = self.pool.clone();
        let identity = self.identity.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = pool.release(&identity).await {
                        warn!("Failed to release dropped lease for {}: {}", identity, e);
                    }
                });
            }
            Err(_) => warn!(
                "Lease {} for {} dropped outside a runtime, slot not released",
                self.id, identity
            ),
        }
    }
}
