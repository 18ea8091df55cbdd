//! In-memory routing table keyed by subdomain
//!
//! The registry is the single source of truth for routing decisions. It is
//! written by the event ingestion task and read by every proxy handler.
//! Entries are replaced wholesale under a write lock, so a reader sees either
//! the previous entry or the new one, never a mix.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One routable backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingEntry {
    /// Routing key, also the externally visible subdomain
    pub name: String,
    /// Reachable address of the backend (IP or resolvable host)
    pub address: String,
    /// Default TCP port of the backend
    pub port: u16,
    /// Container that registered this entry, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

impl RoutingEntry {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            container_id: None,
        }
    }

    pub fn with_container_id(mut self, id: impl Into<String>) -> Self {
        self.container_id = Some(id.into());
        self
    }

    /// `host:port` authority for outbound connections
    pub fn authority(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            // Bare IPv6 literal
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

/// Thread-safe `name -> RoutingEntry` map
///
/// Keys are compared case-insensitively. Reads share the lock, writes are
/// serialized, and the backing map never leaves this type.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    entries: RwLock<HashMap<String, Arc<RoutingEntry>>>,
}

impl ServiceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Find the entry registered under `name`
    pub fn lookup(&self, name: &str) -> Option<Arc<RoutingEntry>> {
        self.entries.read().get(&normalize(name)).cloned()
    }

    /// Insert or replace the entry with the same name (last write wins).
    ///
    /// Returns the entry that was replaced, if any.
    pub fn upsert(&self, entry: RoutingEntry) -> Option<Arc<RoutingEntry>> {
        let key = normalize(&entry.name);
        self.entries.write().insert(key, Arc::new(entry))
    }

    /// Remove `name` only if it is still owned by `container_id`.
    ///
    /// A name that has since been taken over by another container is left
    /// alone. Returns the removed entry.
    pub fn remove_if_owned(&self, name: &str, container_id: &str) -> Option<Arc<RoutingEntry>> {
        let key = normalize(name);
        let mut entries = self.entries.write();
        let owned = entries
            .get(&key)
            .is_some_and(|e| e.container_id.as_deref() == Some(container_id));
        if owned {
            entries.remove(&key)
        } else {
            None
        }
    }

    /// Remove whichever entry was registered by `container_id`.
    ///
    /// Used when a stop event carries only the container id.
    pub fn remove_by_container(&self, container_id: &str) -> Option<Arc<RoutingEntry>> {
        let mut entries = self.entries.write();
        let key = entries
            .iter()
            .find(|(_, e)| e.container_id.as_deref() == Some(container_id))
            .map(|(k, _)| k.clone())?;
        entries.remove(&key)
    }

    /// Drop entries registered by containers that are not in `live`.
    ///
    /// Entries without a container id are kept. Returns the removed entries.
    pub fn retain_containers(&self, live: &HashSet<String>) -> Vec<Arc<RoutingEntry>> {
        let mut removed = Vec::new();
        self.entries.write().retain(|_, entry| match entry.container_id.as_deref() {
            Some(id) if !live.contains(id) => {
                removed.push(Arc::clone(entry));
                false
            }
            _ => true,
        });
        removed
    }

    /// Read-only copy of every entry, sorted by name
    pub fn snapshot(&self) -> Vec<RoutingEntry> {
        let mut list: Vec<RoutingEntry> = self
            .entries
            .read()
            .values()
            .map(|e| RoutingEntry::clone(e))
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Shared handle used by the proxy, the ingestion loop and the admin API
pub type SharedRegistry = Arc<ServiceRegistry>;

fn normalize(name: &str) -> String {
    name.to_ascii_lowercase()
}
