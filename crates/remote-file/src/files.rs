//! Pooled remote file management
//!
//! Every call takes a session slot from the shared pool for the file's
//! connection, runs its file operations, and gives the slot back whether or
//! not the operations succeeded.

use crate::config::{FileTarget, ProviderConfig};
use crate::error::FileError;
use crate::Result;
use remote_file_ssh::{
    build_connection, build_proxy_connection, ConnectionIdentity, ConnectionOptions, ConnectionPool,
    Connector, FileOps, PoolLease, RemoteError, SshConnector, Transport,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Observed state of a remote file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    /// Resource identifier
    pub id: String,
    /// Remote path
    pub path: String,
    /// Current content
    pub content: String,
    /// Permission bits as four octal digits
    pub permissions: String,
    /// Numeric owner, unless the target tracks the owner by name
    pub owner: Option<String>,
    /// Numeric group, unless the target tracks the group by name
    pub group: Option<String>,
    /// Owner name, when the target tracks the owner by name
    pub owner_name: Option<String>,
    /// Group name, when the target tracks the group by name
    pub group_name: Option<String>,
}

/// Remote files reached through a shared connection pool
pub struct RemoteFiles<K: Connector = SshConnector> {
    config: ProviderConfig,
    connector: K,
    pool: ConnectionPool<K::Client>,
}

impl RemoteFiles<SshConnector> {
    /// Files reached over real SSH connections
    pub fn new(config: ProviderConfig) -> Result<Self> {
        Self::with_connector(config, SshConnector)
    }
}

impl<K: Connector> RemoteFiles<K> {
    /// Files reached through `connector`
    pub fn with_connector(config: ProviderConfig, connector: K) -> Result<Self> {
        config.validate()?;
        let pool = ConnectionPool::new(config.pool_config());
        Ok(Self {
            config,
            connector,
            pool,
        })
    }

    /// Provider configuration
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// The connection pool
    pub fn pool(&self) -> &ConnectionPool<K::Client> {
        &self.pool
    }

    /// Stable identifier: `host:port:path`, behind `proxy_host:proxy_port|` when proxied
    pub fn resource_id(&self, target: &FileTarget) -> Result<String> {
        let conn = self.connection(target)?;
        let id = format!("{}:{}:{}", conn.host, conn.port, target.path);
        Ok(match &self.config.proxy_conn {
            Some(proxy) => format!("{}:{}|{}", proxy.host, proxy.port, id),
            None => id,
        })
    }

    /// Write the target's content, permissions and ownership, then report the result
    pub async fn apply(&self, target: &FileTarget) -> Result<FileState> {
        target.validate()?;
        info!("Applying {}", target.path);
        let (lease, sudo) = self.checkout(target).await?;
        let ops = FileOps::new(lease.client(), sudo);
        let result = self.apply_with(&ops, target).await;
        drop(ops);
        settle(result, lease.release().await)
    }

    /// Current state of the target's file, `None` if it does not exist
    pub async fn read(&self, target: &FileTarget) -> Result<Option<FileState>> {
        debug!("Reading {}", target.path);
        let (lease, sudo) = self.checkout(target).await?;
        let ops = FileOps::new(lease.client(), sudo);
        let result = self.state_with(&ops, target).await;
        drop(ops);
        settle(result, lease.release().await)
    }

    /// Remove the target's file
    pub async fn delete(&self, target: &FileTarget) -> Result<()> {
        info!("Deleting {}", target.path);
        let (lease, sudo) = self.checkout(target).await?;
        let ops = FileOps::new(lease.client(), sudo);
        let result = ops.delete(&target.path).await.map_err(FileError::from);
        drop(ops);
        settle(result, lease.release().await)
    }

    fn connection<'a>(&'a self, target: &'a FileTarget) -> Result<&'a ConnectionOptions> {
        target
            .conn
            .as_ref()
            .or(self.config.conn.as_ref())
            .ok_or_else(|| FileError::MissingConnection(target.path.clone()))
    }

    async fn checkout(&self, target: &FileTarget) -> Result<(PoolLease<K::Client>, bool)> {
        let (_, descriptor) = build_connection(self.connection(target)?)?;
        let proxy = build_proxy_connection(self.config.proxy_conn.as_ref())?;
        let proxy = proxy.as_ref().map(|(_, descriptor)| descriptor);

        let identity = ConnectionIdentity::of(&descriptor, proxy);
        let connector = &self.connector;
        let descriptor_ref = &descriptor;
        let lease = self
            .pool
            .lease(&identity, move || connector.connect(descriptor_ref, proxy))
            .await?;
        Ok((lease, descriptor.sudo()))
    }

    async fn apply_with<T>(&self, ops: &FileOps<'_, T>, target: &FileTarget) -> Result<FileState>
    where
        T: Transport + ?Sized,
    {
        let path = &target.path;
        ops.write(path, &target.content, &target.permissions).await?;
        // scp keeps the mode of an existing file and tee never sets one.
        ops.chmod(path, &target.permissions).await?;
        if let Some(owner) = target.owner_spec() {
            ops.chown(path, owner).await?;
        }
        if let Some(group) = target.group_spec() {
            ops.chgrp(path, group).await?;
        }

        self.state_with(ops, target)
            .await?
            .ok_or_else(|| RemoteError::NotFound(path.clone()).into())
    }

    async fn state_with<T>(&self, ops: &FileOps<'_, T>, target: &FileTarget) -> Result<Option<FileState>>
    where
        T: Transport + ?Sized,
    {
        let path = &target.path;
        if !ops.exists(path).await? {
            debug!("{} does not exist", path);
            return Ok(None);
        }

        let content = ops.read(path).await?;
        let permissions = ops.permissions(path).await?;
        let (owner, owner_name) = if target.symbolic_owner() {
            (None, Some(ops.owner_name(path).await?))
        } else {
            (Some(ops.owner(path).await?), None)
        };
        let (group, group_name) = if target.symbolic_group() {
            (None, Some(ops.group_name(path).await?))
        } else {
            (Some(ops.group(path).await?), None)
        };

        Ok(Some(FileState {
            id: self.resource_id(target)?,
            path: path.clone(),
            content,
            permissions,
            owner,
            group,
            owner_name,
            group_name,
        }))
    }
}

// The operation's own error wins; a release error surfaces only on success.
fn settle<T>(result: Result<T>, released: remote_file_ssh::Result<()>) -> Result<T> {
    match (result, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release)) => {
            warn!("Releasing session after failure also failed: {}", release);
            Err(e)
        }
    }
}
