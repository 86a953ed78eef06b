use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::warn;

use pkg_types::meta::Object;

use crate::client::StateStore;

/// Errors from the typed registry layer. `Conflict` is the one callers
/// are expected to match on and retry.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object {key} not found")]
    NotFound { key: String },
    #[error("object {key} already exists")]
    AlreadyExists { key: String },
    #[error("version conflict on {key}: write had {submitted}, store has {stored}")]
    Conflict {
        key: String,
        submitted: u64,
        stored: u64,
    },
    #[error("corrupt record at {key}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Typed object access over the raw store, with optimistic concurrency.
///
/// Every record's `metadata.resource_version` is the concurrency token:
/// `update` refuses a write whose token does not match the stored record,
/// and bumps the token on success. Mutations serialize through one async
/// mutex; with a single active broker writer this makes the
/// read-compare-write linearizable per key. Reads take no lock.
///
/// Deletion follows the finalizer contract: while finalizers remain the
/// record is only marked with a deletion timestamp, and the write that
/// clears the last finalizer removes it physically.
#[derive(Clone)]
pub struct Registry {
    store: StateStore,
    write_lock: Arc<Mutex<()>>,
}

impl Registry {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn key_prefix<T: Object>() -> String {
        format!("/registry/{}/", T::KIND)
    }

    fn key<T: Object>(namespace: &str, name: &str) -> String {
        format!("/registry/{}/{}/{}", T::KIND, namespace, name)
    }

    pub async fn get<T>(&self, namespace: &str, name: &str) -> Result<Option<T>, StoreError>
    where
        T: Object + DeserializeOwned,
    {
        let key = Self::key::<T>(namespace, name);
        match self.store.get(&key).await? {
            Some(bytes) => {
                let obj =
                    serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                        key: key.clone(),
                        source,
                    })?;
                Ok(Some(obj))
            }
            None => Ok(None),
        }
    }

    /// All records of a kind across namespaces, in key order. Corrupt
    /// records are skipped with a warning rather than failing the listing.
    pub async fn list<T>(&self) -> Result<Vec<T>, StoreError>
    where
        T: Object + DeserializeOwned,
    {
        let entries = self.store.list_prefix(&Self::key_prefix::<T>()).await?;
        let mut objects = Vec::with_capacity(entries.len());
        for (key, bytes) in entries {
            match serde_json::from_slice(&bytes) {
                Ok(obj) => objects.push(obj),
                Err(e) => warn!("Skipping corrupt record at {}: {}", key, e),
            }
        }
        Ok(objects)
    }

    /// Persist a new record. Stamps creation time and version 1.
    pub async fn create<T>(&self, obj: &mut T) -> Result<(), StoreError>
    where
        T: Object + Serialize + DeserializeOwned,
    {
        let key = Self::key::<T>(&obj.meta().namespace, &obj.meta().name);
        let _guard = self.write_lock.lock().await;

        if self.store.get(&key).await?.is_some() {
            return Err(StoreError::AlreadyExists { key });
        }
        obj.meta_mut().resource_version = 1;
        obj.meta_mut().creation_timestamp = Utc::now();
        let data = serde_json::to_vec(obj).map_err(|e| anyhow::anyhow!(e))?;
        self.store.put(&key, &data).await?;
        Ok(())
    }

    /// Compare-and-swap write. On success the object's version is bumped
    /// in place so the caller keeps working with the stored state.
    ///
    /// When the record is marked for deletion and this write leaves no
    /// finalizers, the record is removed instead of re-persisted.
    pub async fn update<T>(&self, obj: &mut T) -> Result<(), StoreError>
    where
        T: Object + Serialize + DeserializeOwned,
    {
        let key = Self::key::<T>(&obj.meta().namespace, &obj.meta().name);
        let _guard = self.write_lock.lock().await;

        let stored_bytes = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| StoreError::NotFound { key: key.clone() })?;
        let stored: T = serde_json::from_slice(&stored_bytes).map_err(|source| {
            StoreError::Corrupt {
                key: key.clone(),
                source,
            }
        })?;

        let submitted = obj.meta().resource_version;
        let current = stored.meta().resource_version;
        if submitted != current {
            return Err(StoreError::Conflict {
                key,
                submitted,
                stored: current,
            });
        }

        obj.meta_mut().resource_version = current + 1;
        if obj.meta().deletion_timestamp.is_some() && obj.meta().finalizers.is_empty() {
            self.store.delete(&key).await?;
            return Ok(());
        }
        let data = serde_json::to_vec(obj).map_err(|e| anyhow::anyhow!(e))?;
        self.store.put(&key, &data).await?;
        Ok(())
    }

    /// Delete a record. With finalizers present this only stamps the
    /// deletion timestamp; the record stays until they are cleared.
    pub async fn delete<T>(&self, namespace: &str, name: &str) -> Result<(), StoreError>
    where
        T: Object + Serialize + DeserializeOwned,
    {
        let key = Self::key::<T>(namespace, name);
        let _guard = self.write_lock.lock().await;

        let stored_bytes = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| StoreError::NotFound { key: key.clone() })?;
        let mut stored: T = serde_json::from_slice(&stored_bytes).map_err(|source| {
            StoreError::Corrupt {
                key: key.clone(),
                source,
            }
        })?;

        if stored.meta().finalizers.is_empty() {
            self.store.delete(&key).await?;
            return Ok(());
        }
        if stored.meta().deletion_timestamp.is_none() {
            stored.meta_mut().deletion_timestamp = Some(Utc::now());
            stored.meta_mut().resource_version += 1;
            let data = serde_json::to_vec(&stored).map_err(|e| anyhow::anyhow!(e))?;
            self.store.put(&key, &data).await?;
        }
        Ok(())
    }
}
