//! File-backed [`ContextStore`] driver.
//!
//! Layout: two files per context under the data directory, `{id}.json` for
//! the payload and `{id}.meta.json` for the metadata. Writes go through a
//! temp file and an atomic rename, and a metadata failure after the payload
//! landed rolls the payload back so readers never observe a half-committed
//! context.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use ctxmesh_bus::EventBus;
use ctxmesh_types::{ContextEntry, ContextEvent, ContextId, ContextMetadata, StoreError};

use crate::cache::ContextCache;
use crate::ContextStore;

/// Default bound of the in-memory LRU front.
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Default freshness window of cached entries.
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

const PAYLOAD_SUFFIX: &str = ".json";
const META_MARKER: &str = ".meta.";

//─────────────────────────────
//  File store
//─────────────────────────────

/// Durable context store persisting each context as a JSON file pair.
///
/// Mutations on a given id are serialized by a keyed lock; the LRU front is
/// updated under that same lock before the resulting event is published, so
/// cache, disk and bus always agree on commit order.
pub struct FileStore {
    data_dir: PathBuf,
    bus: Arc<dyn EventBus>,
    locks: DashMap<ContextId, Arc<Mutex<()>>>,
    cache: Mutex<ContextCache>,
}

impl FileStore {
    /// Open a store rooted at `data_dir`, creating the directory if needed.
    pub async fn open(data_dir: impl AsRef<Path>, bus: Arc<dyn EventBus>) -> Result<Self, StoreError> {
        Self::open_with_cache(data_dir, bus, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL).await
    }

    /// Open a store with an explicit cache bound and TTL.
    pub async fn open_with_cache(
        data_dir: impl AsRef<Path>,
        bus: Arc<dyn EventBus>,
        cache_capacity: usize,
        cache_ttl: Duration,
    ) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir).await?;

        Ok(Self {
            data_dir,
            bus,
            locks: DashMap::new(),
            cache: Mutex::new(ContextCache::new(cache_capacity, cache_ttl)),
        })
    }

    fn payload_path(&self, id: &ContextId) -> PathBuf {
        self.data_dir.join(format!("{id}{PAYLOAD_SUFFIX}"))
    }

    fn meta_path(&self, id: &ContextId) -> PathBuf {
        self.data_dir.join(format!("{id}.meta.json"))
    }

    fn lock_for(&self, id: &ContextId) -> Arc<Mutex<()>> {
        self.locks.entry(id.clone()).or_default().clone()
    }

    /// Drop a context's lock entry once nothing else holds it.
    fn release_lock(&self, id: &ContextId) {
        self.locks
            .remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn read_payload(&self, id: &ContextId) -> Result<Value, StoreError> {
        let bytes = match fs::read(self.payload_path(id)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.clone()))
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn read_meta_optional(&self, id: &ContextId) -> Result<Option<ContextMetadata>, StoreError> {
        let bytes = match fs::read(self.meta_path(id)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Write payload then metadata, rolling the payload back if the metadata
    /// write fails. Caller must hold the context's lock.
    async fn commit_pair(
        &self,
        id: &ContextId,
        payload_bytes: &[u8],
        metadata: &ContextMetadata,
    ) -> Result<(), StoreError> {
        let payload_path = self.payload_path(id);
        let meta_path = self.meta_path(id);

        let prior_payload = fs::read(&payload_path).await.ok();
        write_atomic(&payload_path, payload_bytes).await?;

        let meta_bytes = serde_json::to_vec(metadata)?;
        if let Err(err) = write_atomic(&meta_path, &meta_bytes).await {
            let restore = match &prior_payload {
                Some(bytes) => write_atomic(&payload_path, bytes).await,
                None => fs::remove_file(&payload_path).await.map_err(StoreError::from),
            };
            if let Err(restore_err) = restore {
                warn!(context_id = %id, error = %restore_err, "payload rollback failed");
            }
            return Err(err);
        }
        Ok(())
    }

    async fn remove_pair(&self, id: &ContextId) -> Result<bool, StoreError> {
        let mut existed = false;
        for path in [self.payload_path(id), self.meta_path(id)] {
            match fs::remove_file(&path).await {
                Ok(()) => existed = true,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(existed)
    }
}

#[async_trait]
impl ContextStore for FileStore {
    async fn get(&self, id: &ContextId) -> Result<Value, StoreError> {
        if let Some((payload, _)) = self.cache.lock().await.get(id) {
            return Ok(payload);
        }

        // Cache fills count as cache mutations and happen under the same
        // per-id lock as file writes.
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        if let Some((payload, _)) = self.cache.lock().await.get(id) {
            return Ok(payload);
        }

        let payload = self.read_payload(id).await?;
        match self.read_meta_optional(id).await? {
            Some(metadata) => {
                self.cache
                    .lock()
                    .await
                    .put(id.clone(), payload.clone(), metadata);
            }
            None => warn!(context_id = %id, "payload present without metadata"),
        }
        Ok(payload)
    }

    async fn get_metadata(&self, id: &ContextId) -> Result<ContextMetadata, StoreError> {
        if let Some((_, metadata)) = self.cache.lock().await.get(id) {
            return Ok(metadata);
        }
        self.read_meta_optional(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn save(
        &self,
        id: &ContextId,
        payload: &Value,
        extra: Map<String, Value>,
    ) -> Result<ContextMetadata, StoreError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let current = self.read_meta_optional(id).await?;
        let payload_bytes = serde_json::to_vec(payload)?;
        let metadata = ContextMetadata {
            version: current.map(|m| m.version + 1).unwrap_or(1),
            last_modified: Utc::now(),
            size: payload_bytes.len() as u64,
            extra: ContextMetadata::sanitize_extra(extra),
        };

        self.commit_pair(id, &payload_bytes, &metadata).await?;
        self.cache
            .lock()
            .await
            .put(id.clone(), payload.clone(), metadata.clone());

        debug!(context_id = %id, version = metadata.version, "context saved");
        let event = ContextEvent::Updated {
            id: id.clone(),
            metadata: metadata.clone(),
        };
        if let Err(err) = self.bus.publish(&event) {
            warn!(context_id = %id, error = %err, "event publish failed");
        }

        Ok(metadata)
    }

    async fn apply_update(
        &self,
        id: &ContextId,
        payload: &Value,
        metadata: ContextMetadata,
    ) -> Result<bool, StoreError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        if let Some(current) = self.read_meta_optional(id).await? {
            if metadata.version <= current.version {
                debug!(
                    context_id = %id,
                    local = current.version,
                    received = metadata.version,
                    "stale upstream update ignored"
                );
                return Ok(false);
            }
        }

        let payload_bytes = serde_json::to_vec(payload)?;
        self.commit_pair(id, &payload_bytes, &metadata).await?;
        self.cache
            .lock()
            .await
            .put(id.clone(), payload.clone(), metadata);
        Ok(true)
    }

    async fn delete(&self, id: &ContextId) -> Result<(), StoreError> {
        let lock = self.lock_for(id);
        {
            let _guard = lock.lock().await;

            if !self.remove_pair(id).await? {
                return Err(StoreError::NotFound(id.clone()));
            }
            self.cache.lock().await.remove(id);

            debug!(context_id = %id, "context deleted");
            let event = ContextEvent::Deleted { id: id.clone() };
            if let Err(err) = self.bus.publish(&event) {
                warn!(context_id = %id, error = %err, "event publish failed");
            }
        }
        drop(lock);
        self.release_lock(id);
        Ok(())
    }

    async fn apply_delete(&self, id: &ContextId) -> Result<(), StoreError> {
        let lock = self.lock_for(id);
        {
            let _guard = lock.lock().await;
            self.remove_pair(id).await?;
            self.cache.lock().await.remove(id);
        }
        drop(lock);
        self.release_lock(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ContextId>, StoreError> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.data_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(PAYLOAD_SUFFIX) || name.contains(META_MARKER) {
                continue;
            }
            let stem = &name[..name.len() - PAYLOAD_SUFFIX.len()];
            match ContextId::new(stem) {
                Ok(id) => ids.push(id),
                Err(err) => warn!(file = name, error = %err, "skipping unparseable data file"),
            }
        }
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(ids)
    }

    async fn list_with_metadata(&self) -> Result<Vec<ContextEntry>, StoreError> {
        let mut entries = Vec::new();
        for id in self.list().await? {
            // A context may vanish between listing and the metadata read.
            if let Some(metadata) = self.read_meta_optional(&id).await? {
                entries.push(ContextEntry { id, metadata });
            }
        }
        Ok(entries)
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut file = fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp, path).await?;
    Ok(())
}
