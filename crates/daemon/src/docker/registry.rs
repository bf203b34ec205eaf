//! Host connection registry.
//!
//! One registry instance owns every cached [`Transport`] in the process. It
//! hands out reference-counted guards so concurrent sessions to the same
//! host share one transport, closes transports that sit idle past a bound,
//! and rebuilds entries that consumers have invalidated after fatal errors.
//!
//! The cache map and reference counts live behind a single mutex held only
//! for map mutation; dialing and health-checking happen outside the lock.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::docker::transport::{ConnectError, Transport};
use crate::hosts::HostEndpoint;

/// Timing knobs for the registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Bound on establishing and health-checking a new transport.
    pub connect_timeout: Duration,
    /// How long an unreferenced transport may linger before it is closed.
    pub idle_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(90),
        }
    }
}

struct Entry {
    transport: Arc<Transport>,
    refcount: usize,
    /// Set when the refcount last hit zero.
    idle_since: Option<Instant>,
}

struct Shared {
    entries: Mutex<HashMap<String, Entry>>,
    config: RegistryConfig,
    /// Transports built over the registry's lifetime, for reuse accounting.
    created: AtomicU64,
}

/// Registry of live transports, keyed by host endpoint name.
#[derive(Clone)]
pub struct HostRegistry {
    shared: Arc<Shared>,
}

impl HostRegistry {
    /// Creates an empty registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
                config,
                created: AtomicU64::new(0),
            }),
        }
    }

    /// Returns a usable transport for the endpoint, dialing one if none is
    /// cached or the cached one is invalid or was reconfigured.
    ///
    /// Dropping the returned guard releases the reference.
    pub async fn acquire(&self, endpoint: &HostEndpoint) -> Result<TransportGuard, ConnectError> {
        {
            let mut entries = self.shared.entries.lock().unwrap();
            if let Some(entry) = entries.get_mut(&endpoint.name) {
                if entry.transport.is_valid() && entry.transport.endpoint() == endpoint {
                    entry.refcount += 1;
                    entry.idle_since = None;
                    return Ok(TransportGuard {
                        transport: Arc::clone(&entry.transport),
                        shared: Arc::clone(&self.shared),
                    });
                }
                // Stale or reconfigured; discard and rebuild below.
                entries.remove(&endpoint.name);
            }
        }

        let transport = Arc::new(
            Transport::connect(endpoint.clone(), self.shared.config.connect_timeout).await?,
        );
        self.shared.created.fetch_add(1, Ordering::Relaxed);

        let mut entries = self.shared.entries.lock().unwrap();
        match entries.get_mut(&endpoint.name) {
            // Another caller raced us to a valid entry; use theirs.
            Some(entry) if entry.transport.is_valid() => {
                entry.refcount += 1;
                entry.idle_since = None;
                Ok(TransportGuard {
                    transport: Arc::clone(&entry.transport),
                    shared: Arc::clone(&self.shared),
                })
            }
            _ => {
                entries.insert(
                    endpoint.name.clone(),
                    Entry {
                        transport: Arc::clone(&transport),
                        refcount: 1,
                        idle_since: None,
                    },
                );
                Ok(TransportGuard {
                    transport,
                    shared: Arc::clone(&self.shared),
                })
            }
        }
    }

    /// Marks a transport unusable and evicts it from the cache.
    ///
    /// Outstanding guards keep the transport alive until they drop, but no
    /// new acquires will see it.
    pub fn invalidate(&self, transport: &Transport) {
        transport.mark_invalid();
        let name = &transport.endpoint().name;
        let mut entries = self.shared.entries.lock().unwrap();
        if let Some(entry) = entries.get(name) {
            if std::ptr::eq(entry.transport.as_ref(), transport) {
                entries.remove(name);
                tracing::info!(host = %name, "invalidated transport");
            }
        }
    }

    /// Drops the cached transport for an endpoint name, if any.
    ///
    /// Used when the stored endpoint configuration changes; sessions holding
    /// guards keep their transport until they end.
    pub fn evict(&self, name: &str) -> bool {
        let mut entries = self.shared.entries.lock().unwrap();
        match entries.remove(name) {
            Some(entry) => {
                entry.transport.mark_invalid();
                tracing::info!(host = %name, "evicted cached transport");
                true
            }
            None => false,
        }
    }

    /// Closes transports that have been unreferenced past the idle timeout.
    ///
    /// Returns how many entries were closed.
    pub fn sweep_idle(&self) -> usize {
        let idle_timeout = self.shared.config.idle_timeout;
        let now = Instant::now();
        let mut entries = self.shared.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|name, entry| {
            let expired = entry.refcount == 0
                && entry
                    .idle_since
                    .is_some_and(|t| now.duration_since(t) >= idle_timeout);
            if expired {
                tracing::debug!(host = %name, "closing idle transport");
            }
            !expired
        });
        before - entries.len()
    }

    /// Starts a background task that periodically closes idle transports.
    pub fn start_sweep_task(&self, interval: Duration) {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                registry.sweep_idle();
            }
        });
    }

    /// Current reference count for a cached endpoint, if cached.
    pub fn refcount(&self, name: &str) -> Option<usize> {
        self.shared
            .entries
            .lock()
            .unwrap()
            .get(name)
            .map(|e| e.refcount)
    }

    /// Whether a transport is currently cached for the endpoint.
    pub fn cached(&self, name: &str) -> bool {
        self.shared.entries.lock().unwrap().contains_key(name)
    }

    /// Total transports built since the registry was created.
    pub fn transports_created(&self) -> u64 {
        self.shared.created.load(Ordering::Relaxed)
    }
}

/// A counted reference to a cached transport.
///
/// Releases the reference on drop, on every exit path, so transport counts
/// cannot leak even when a session task unwinds.
pub struct TransportGuard {
    transport: Arc<Transport>,
    shared: Arc<Shared>,
}

impl TransportGuard {
    /// A shareable handle to the underlying transport.
    pub fn transport(&self) -> Arc<Transport> {
        Arc::clone(&self.transport)
    }
}

impl Deref for TransportGuard {
    type Target = Transport;

    fn deref(&self) -> &Transport {
        &self.transport
    }
}

impl Drop for TransportGuard {
    fn drop(&mut self) {
        let name = &self.transport.endpoint().name;
        let mut entries = self.shared.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(name) {
            if std::ptr::eq(entry.transport.as_ref(), self.transport.as_ref()) {
                entry.refcount = entry.refcount.saturating_sub(1);
                if entry.refcount == 0 {
                    entry.idle_since = Some(Instant::now());
                }
            }
        }
    }
}
