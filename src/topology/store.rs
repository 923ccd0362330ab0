//! Topology store - the sole source of truth for the graph
//!
//! The store is a trait so the orchestrator can run against the cluster's
//! custom resource API or against memory. Link edits go through
//! [`update_links`], which re-reads and re-applies the edit when the
//! record's version token moved underneath it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::graph::TopologyGraph;
use super::model::{HalfLink, TopologyRecord};

/// Attempts made by [`update_links`] before giving up on a conflict
pub const DEFAULT_CONFLICT_RETRIES: u32 = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Topology record '{0}' not found")]
    NotFound(String),

    #[error("Topology record '{0}' already exists")]
    AlreadyExists(String),

    #[error("Topology record '{0}' was modified concurrently")]
    Conflict(String),

    #[error("Store transport error: {0}")]
    Transport(String),

    #[error("Failed to decode topology record: {0}")]
    Decode(String),
}

#[async_trait]
pub trait TopologyStore: Send + Sync {
    async fn list(&self, namespace: &str) -> Result<Vec<TopologyRecord>, StoreError>;

    async fn get(&self, namespace: &str, name: &str) -> Result<TopologyRecord, StoreError>;

    async fn create(
        &self,
        namespace: &str,
        record: &TopologyRecord,
    ) -> Result<TopologyRecord, StoreError>;

    /// Replace the record's link list.
    ///
    /// With `resource_version` set, the write fails with
    /// [`StoreError::Conflict`] if the stored record has moved on.
    async fn patch_links(
        &self,
        namespace: &str,
        name: &str,
        links: &[HalfLink],
        resource_version: Option<&str>,
    ) -> Result<TopologyRecord, StoreError>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

/// Read every record into a snapshot
pub async fn load_graph(
    store: &dyn TopologyStore,
    namespace: &str,
) -> Result<TopologyGraph, StoreError> {
    Ok(TopologyGraph::from_records(store.list(namespace).await?))
}

/// Apply `edit` to a record's links with optimistic concurrency.
///
/// Returns the stored record after the write.
pub async fn update_links<F>(
    store: &dyn TopologyStore,
    namespace: &str,
    name: &str,
    retries: u32,
    mut edit: F,
) -> Result<TopologyRecord, StoreError>
where
    F: FnMut(&mut Vec<HalfLink>) + Send,
{
    let mut attempt = 0;
    loop {
        let mut record = store.get(namespace, name).await?;
        edit(&mut record.spec.links);
        let version = record.metadata.resource_version.clone();
        match store
            .patch_links(namespace, name, &record.spec.links, version.as_deref())
            .await
        {
            Err(StoreError::Conflict(_)) if attempt + 1 < retries => {
                attempt += 1;
                debug!("Conflict updating {}, retrying ({}/{})", name, attempt, retries);
            }
            other => return other,
        }
    }
}

/// Append one half-link to a record
pub async fn append_link(
    store: &dyn TopologyStore,
    namespace: &str,
    name: &str,
    link: HalfLink,
) -> Result<TopologyRecord, StoreError> {
    update_links(store, namespace, name, DEFAULT_CONFLICT_RETRIES, |links| {
        links.retain(|l| l.uid != link.uid);
        links.push(link.clone());
    })
    .await
}

/// Drop every half of a record that points at `peer`
pub async fn remove_links_to(
    store: &dyn TopologyStore,
    namespace: &str,
    name: &str,
    peer: &str,
) -> Result<TopologyRecord, StoreError> {
    update_links(store, namespace, name, DEFAULT_CONFLICT_RETRIES, |links| {
        links.retain(|l| l.peer != peer)
    })
    .await
}

// ============================================================================
// Allocation lock
// ============================================================================

/// Per-namespace async mutex held across snapshot, allocation and record
/// writes
#[derive(Clone, Default)]
pub struct AllocationLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl AllocationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, namespace: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Store backed by a concurrent map, with monotonically increasing version
/// tokens
#[derive(Clone, Default)]
pub struct MemoryTopologyStore {
    records: Arc<DashMap<(String, String), TopologyRecord>>,
    version: Arc<AtomicU64>,
    failing_patches: Arc<DashMap<String, ()>>,
}

impl MemoryTopologyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Patches to `name` fail with a transport error until cleared
    pub fn set_patch_failure(&self, name: &str, fail: bool) {
        if fail {
            self.failing_patches.insert(name.to_string(), ());
        } else {
            self.failing_patches.remove(name);
        }
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn key(namespace: &str, name: &str) -> (String, String) {
        (namespace.to_string(), name.to_string())
    }
}

#[async_trait]
impl TopologyStore for MemoryTopologyStore {
    async fn list(&self, namespace: &str) -> Result<Vec<TopologyRecord>, StoreError> {
        let mut records: Vec<TopologyRecord> = self
            .records
            .iter()
            .filter(|e| e.key().0 == namespace)
            .map(|e| e.value().clone())
            .collect();
        records.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(records)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<TopologyRecord, StoreError> {
        self.records
            .get(&Self::key(namespace, name))
            .map(|r| r.clone())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn create(
        &self,
        namespace: &str,
        record: &TopologyRecord,
    ) -> Result<TopologyRecord, StoreError> {
        let key = Self::key(namespace, record.name());
        match self.records.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(StoreError::AlreadyExists(record.name().to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let mut stored = record.clone();
                stored.metadata.namespace = Some(namespace.to_string());
                stored.metadata.resource_version = Some(self.next_version());
                slot.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    async fn patch_links(
        &self,
        namespace: &str,
        name: &str,
        links: &[HalfLink],
        resource_version: Option<&str>,
    ) -> Result<TopologyRecord, StoreError> {
        if self.failing_patches.contains_key(name) {
            return Err(StoreError::Transport(format!("injected failure patching {}", name)));
        }
        let mut entry = self
            .records
            .get_mut(&Self::key(namespace, name))
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        if let Some(expected) = resource_version {
            if entry.metadata.resource_version.as_deref() != Some(expected) {
                return Err(StoreError::Conflict(name.to_string()));
            }
        }
        entry.spec.links = links.to_vec();
        entry.metadata.resource_version = Some(self.next_version());
        Ok(entry.clone())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.records
            .remove(&Self::key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }
}
