//! Tunnel and control registries
//!
//! Both are owned by [`ServerContext`](crate::context::ServerContext) and
//! passed to connection tasks; nothing here is process-global.

use std::collections::HashMap;
use std::hash::BuildHasher;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use anyhow::{bail, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tuncache::{RegistryCache, Weighted};

use crate::control::Control;

/// Attempts at picking a free random subdomain before giving up
const RANDOM_URL_ATTEMPTS: usize = 8;

/// Public URL remembered for a client between connections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheUrl(pub String);

impl Weighted for CacheUrl {
    fn size(&self) -> u64 {
        self.0.len() as u64
    }
}

/// A public endpoint bound to a control connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    pub url: String,
    pub protocol: String,
    pub client_id: String,
}

/// Live tunnels by URL, plus the affinity cache mapping
/// `protocol;client_id` to the URL that client last held.
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<String, Tunnel, RandomState>>,
    affinity: RegistryCache<String, CacheUrl>,
    domain: String,
    hasher: RandomState,
}

impl TunnelRegistry {
    /// Registry whose affinity cache holds at most `cache_size` bytes of URLs
    pub fn new(cache_size: u64, domain: impl Into<String>) -> Self {
        Self {
            tunnels: RwLock::new(HashMap::with_hasher(RandomState::new())),
            affinity: RegistryCache::new(cache_size),
            domain: domain.into(),
            hasher: RandomState::new(),
        }
    }

    /// Restore affinity entries from a snapshot, if the file exists.
    ///
    /// A missing file is not an error; an unreadable one is returned to the
    /// caller.
    pub fn load_affinity(&self, path: &Path) -> tuncache::Result<usize> {
        if !path.exists() {
            info!("No registry cache at {:?}, starting empty", path);
            return Ok(0);
        }
        self.affinity.load_from_file(path)
    }

    /// Write the affinity cache to `path`
    pub fn save_affinity(&self, path: &Path) -> tuncache::Result<usize> {
        self.affinity.save_to_file(path)
    }

    /// Save the affinity cache every `interval` on a background task
    pub fn spawn_saver(self: &Arc<Self>, path: PathBuf, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                if let Err(e) = registry.save_affinity(&path) {
                    error!("Failed to save registry cache to {:?}: {}", path, e);
                }
            }
        })
    }

    /// Register `tunnel` under its URL; fails if the URL is taken
    pub fn register(&self, tunnel: Tunnel) -> Result<()> {
        let mut tunnels = self.tunnels.write();
        if tunnels.contains_key(&tunnel.url) {
            bail!("The tunnel {} is already registered", tunnel.url);
        }
        info!(
            "Registered {} tunnel {} for client {} ({} live)",
            tunnel.protocol,
            tunnel.url,
            tunnel.client_id,
            tunnels.len() + 1
        );
        tunnels.insert(tunnel.url.clone(), tunnel);
        Ok(())
    }

    /// Register a tunnel for `client_id`.
    ///
    /// With a requested subdomain that exact URL is used. Otherwise the URL
    /// this client held last time is tried first, then random subdomains;
    /// the URL finally chosen is remembered in the affinity cache.
    pub fn register_for_client(
        &self,
        protocol: &str,
        client_id: &str,
        subdomain: Option<&str>,
    ) -> Result<String> {
        let tunnel = |url: String| Tunnel {
            url,
            protocol: protocol.to_string(),
            client_id: client_id.to_string(),
        };

        if let Some(subdomain) = subdomain {
            let url = self.url_for(protocol, subdomain);
            self.register(tunnel(url.clone()))?;
            return Ok(url);
        }

        let cache_key = format!("{};{}", protocol, client_id);
        if let Some(CacheUrl(url)) = self.affinity.get(&cache_key) {
            if self.register(tunnel(url.clone())).is_ok() {
                return Ok(url);
            }
        }

        for attempt in 0..RANDOM_URL_ATTEMPTS {
            let subdomain = format!("{:08x}", self.hasher.hash_one((client_id, attempt)) as u32);
            let url = self.url_for(protocol, &subdomain);
            if self.register(tunnel(url.clone())).is_ok() {
                self.affinity.set(cache_key, CacheUrl(url.clone()));
                return Ok(url);
            }
        }

        bail!("Failed to find a free {} URL for client {}", protocol, client_id)
    }

    /// Look up a live tunnel by URL
    pub fn get(&self, url: &str) -> Option<Tunnel> {
        self.tunnels.read().get(url).cloned()
    }

    /// Remove a live tunnel; its affinity entry is kept
    pub fn remove(&self, url: &str) -> bool {
        self.tunnels.write().remove(url).is_some()
    }

    /// Number of live tunnels
    pub fn len(&self) -> usize {
        self.tunnels.read().len()
    }

    /// Affinity cache statistics as JSON
    pub fn cache_stats_json(&self) -> String {
        self.affinity.stats_json()
    }

    fn url_for(&self, protocol: &str, subdomain: &str) -> String {
        format!("{}://{}.{}", protocol, subdomain, self.domain)
    }
}

/// Live control connections by client id
#[derive(Default)]
pub struct ControlRegistry {
    controls: RwLock<HashMap<String, Arc<Control>>>,
}

impl ControlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `control`, shutting down any previous control for the
    /// same client
    pub fn add(&self, control: Arc<Control>) {
        let old = self
            .controls
            .write()
            .insert(control.client_id().to_string(), Arc::clone(&control));

        if let Some(old) = old {
            info!("Replacing control for client {}", control.client_id());
            old.shutdown();
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<Control>> {
        self.controls.read().get(client_id).cloned()
    }

    /// Remove `control` unless it has already been replaced
    pub fn remove(&self, control: &Arc<Control>) -> bool {
        let mut controls = self.controls.write();
        match controls.get(control.client_id()) {
            Some(current) if Arc::ptr_eq(current, control) => {
                controls.remove(control.client_id());
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.controls.read().len()
    }
}
