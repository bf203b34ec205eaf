//! Persistent host endpoint storage.
//!
//! This module provides a thread-safe store of configured container-runtime
//! hosts. Each entry names a daemon endpoint: the local default socket, or a
//! TCP address with optional TLS material. Exactly one entry at a time can be
//! the "active" host, which is the default target for new sessions. The store
//! persists to TOML at `~/.config/dockbridge/hosts.toml`.
//!
//! The session core treats this store as read-only; mutation happens through
//! the management API and CLI.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Default daemon socket path used when an endpoint has no TCP address.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/docker.sock";

/// A configured daemon endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEndpoint {
    /// Display name, unique within the store.
    pub name: String,

    /// TCP address of the daemon. `None` means the local default socket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<TcpTarget>,

    /// TLS material for daemons that require client certificates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsMaterial>,
}

/// A TCP host and port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpTarget {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

/// File paths to TLS material for a daemon endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsMaterial {
    /// CA certificate used to verify the daemon (PEM).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,
    /// Client certificate presented to the daemon (PEM).
    pub cert_file: PathBuf,
    /// Client private key (PEM, PKCS#8).
    pub key_file: PathBuf,
}

impl HostEndpoint {
    /// Creates an endpoint for the local default socket.
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: None,
            tls: None,
        }
    }

    /// Creates an endpoint for a TCP daemon.
    pub fn tcp(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            address: Some(TcpTarget {
                host: host.into(),
                port,
            }),
            tls: None,
        }
    }

    /// Whether this endpoint targets the local default socket.
    pub fn is_local(&self) -> bool {
        self.address.is_none()
    }

    /// A human-readable label, e.g. `prod (tcp://10.0.0.5:2376)`.
    pub fn label(&self) -> String {
        match &self.address {
            Some(addr) => format!("{} (tcp://{}:{})", self.name, addr.host, addr.port),
            None => format!("{} (local)", self.name),
        }
    }
}

/// On-disk shape of the store.
///
/// `active` precedes `hosts` so the TOML serializer emits the scalar before
/// the array of tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HostsFile {
    /// Name of the active host, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    active: Option<String>,
    #[serde(default)]
    hosts: Vec<HostEndpoint>,
}

/// Thread-safe, file-backed store of host endpoints.
pub struct HostStore {
    path: PathBuf,
    inner: RwLock<HostsFile>,
}

impl HostStore {
    /// Loads the store from `path`, or starts empty if the file is missing.
    pub fn load_or_default(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("failed to read host store at {}", path.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("failed to parse host store at {}", path.display()))?
        } else {
            HostsFile::default()
        };
        Ok(Self {
            path,
            inner: RwLock::new(file),
        })
    }

    /// Returns the default store path under the user config directory.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dockbridge")
            .join("hosts.toml")
    }

    /// Path this store persists to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns all configured endpoints.
    pub fn list(&self) -> Vec<HostEndpoint> {
        self.inner.read().unwrap().hosts.clone()
    }

    /// Looks up an endpoint by name.
    pub fn get(&self, name: &str) -> Option<HostEndpoint> {
        self.inner
            .read()
            .unwrap()
            .hosts
            .iter()
            .find(|h| h.name == name)
            .cloned()
    }

    /// Returns the active endpoint, if one is configured.
    pub fn active(&self) -> Option<HostEndpoint> {
        let inner = self.inner.read().unwrap();
        let name = inner.active.as_deref()?;
        inner.hosts.iter().find(|h| h.name == name).cloned()
    }

    /// Name of the active endpoint, if any.
    pub fn active_name(&self) -> Option<String> {
        self.inner.read().unwrap().active.clone()
    }

    /// Adds a new endpoint. The first endpoint added becomes active.
    pub fn add(&self, endpoint: HostEndpoint) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.hosts.iter().any(|h| h.name == endpoint.name) {
            bail!("host '{}' already exists", endpoint.name);
        }
        if inner.hosts.is_empty() {
            inner.active = Some(endpoint.name.clone());
        }
        inner.hosts.push(endpoint);
        self.save(&inner)
    }

    /// Removes an endpoint by name.
    ///
    /// If the removed endpoint was active, the first remaining endpoint is
    /// promoted. Returns `false` if no endpoint had that name.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        let before = inner.hosts.len();
        inner.hosts.retain(|h| h.name != name);
        if inner.hosts.len() == before {
            return Ok(false);
        }
        if inner.active.as_deref() == Some(name) {
            inner.active = inner.hosts.first().map(|h| h.name.clone());
        }
        self.save(&inner)?;
        Ok(true)
    }

    /// Makes the named endpoint active. Returns `false` if it does not exist.
    pub fn set_active(&self, name: &str) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        if !inner.hosts.iter().any(|h| h.name == name) {
            return Ok(false);
        }
        inner.active = Some(name.to_string());
        self.save(&inner)?;
        Ok(true)
    }

    fn save(&self, file: &HostsFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create store directory {}", parent.display())
            })?;
        }
        let text = toml::to_string_pretty(file).context("failed to serialize host store")?;
        fs::write(&self.path, text)
            .with_context(|| format!("failed to write host store at {}", self.path.display()))?;
        Ok(())
    }
}
