//! Provider and file-target configuration

use crate::error::FileError;
use crate::Result;
use remote_file_ssh::pool::DEFAULT_MAX_SESSIONS;
use remote_file_ssh::{ConnectionOptions, PoolConfig, RemoteError};
use serde::{Deserialize, Serialize};

/// Permissions applied when a target does not name any
pub const DEFAULT_PERMISSIONS: &str = "0644";

/// Provider-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Connection used by targets that do not bring their own
    pub conn: Option<ConnectionOptions>,
    /// Jump host every connection goes through
    pub proxy_conn: Option<ConnectionOptions>,
    /// Maximum concurrent sessions per connection
    pub max_sessions: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            conn: None,
            proxy_conn: None,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

impl ProviderConfig {
    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the default connection
    pub fn with_conn(mut self, conn: ConnectionOptions) -> Self {
        self.conn = Some(conn);
        self
    }

    /// Set the proxy connection
    pub fn with_proxy(mut self, proxy: ConnectionOptions) -> Self {
        self.proxy_conn = Some(proxy);
        self
    }

    /// Set the session ceiling
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Reject settings the pool cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(RemoteError::Configuration("max_sessions must be at least 1".to_string()).into());
        }
        Ok(())
    }

    /// Pool settings derived from this config
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::with_max_sessions(self.max_sessions)
    }
}

fn default_permissions() -> String {
    DEFAULT_PERMISSIONS.to_string()
}

/// A file to manage on a remote host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTarget {
    /// Connection for this file, overriding the provider's
    #[serde(default)]
    pub conn: Option<ConnectionOptions>,
    /// Absolute path on the remote host
    pub path: String,
    /// Desired content
    #[serde(default)]
    pub content: String,
    /// Octal permission string
    #[serde(default = "default_permissions")]
    pub permissions: String,
    /// Numeric owner
    #[serde(default)]
    pub owner: Option<String>,
    /// Numeric group
    #[serde(default)]
    pub group: Option<String>,
    /// Owner name
    #[serde(default)]
    pub owner_name: Option<String>,
    /// Group name
    #[serde(default)]
    pub group_name: Option<String>,
}

impl FileTarget {
    /// Target for `path` with `content` and default permissions
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            conn: None,
            path: path.into(),
            content: content.into(),
            permissions: default_permissions(),
            owner: None,
            group: None,
            owner_name: None,
            group_name: None,
        }
    }

    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let target: Self = serde_json::from_str(json)?;
        target.validate()?;
        Ok(target)
    }

    /// Use `conn` instead of the provider's connection
    pub fn with_conn(mut self, conn: ConnectionOptions) -> Self {
        self.conn = Some(conn);
        self
    }

    /// Set permissions
    pub fn with_permissions(mut self, permissions: impl Into<String>) -> Self {
        self.permissions = permissions.into();
        self
    }

    /// Set the numeric owner
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Set the numeric group
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Set the owner name
    pub fn with_owner_name(mut self, owner_name: impl Into<String>) -> Self {
        self.owner_name = Some(owner_name.into());
        self
    }

    /// Set the group name
    pub fn with_group_name(mut self, group_name: impl Into<String>) -> Self {
        self.group_name = Some(group_name.into());
        self
    }

    /// Owner to apply, numeric or symbolic
    pub fn owner_spec(&self) -> Option<&str> {
        non_empty(&self.owner).or_else(|| non_empty(&self.owner_name))
    }

    /// Group to apply, numeric or symbolic
    pub fn group_spec(&self) -> Option<&str> {
        non_empty(&self.group).or_else(|| non_empty(&self.group_name))
    }

    /// Whether ownership is tracked by name rather than id
    pub fn symbolic_owner(&self) -> bool {
        non_empty(&self.owner_name).is_some()
    }

    /// Whether the group is tracked by name rather than id
    pub fn symbolic_group(&self) -> bool {
        non_empty(&self.group_name).is_some()
    }

    /// Check the target is self-consistent
    pub fn validate(&self) -> Result<()> {
        if self.path.is_empty() {
            return Err(FileError::InvalidTarget("path is required".to_string()));
        }
        let octal = self.permissions.bytes().all(|b| (b'0'..=b'7').contains(&b));
        if !(3..=4).contains(&self.permissions.len()) || !octal {
            return Err(FileError::InvalidTarget(format!(
                "permissions {:?} must be 3 or 4 octal digits",
                self.permissions
            )));
        }
        if non_empty(&self.owner).is_some() && non_empty(&self.owner_name).is_some() {
            return Err(FileError::InvalidTarget(
                "only one of owner and owner_name may be set".to_string(),
            ));
        }
        if non_empty(&self.group).is_some() && non_empty(&self.group_name).is_some() {
            return Err(FileError::InvalidTarget(
                "only one of group and group_name may be set".to_string(),
            ));
        }
        Ok(())
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}
