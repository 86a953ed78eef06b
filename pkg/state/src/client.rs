use std::sync::Arc;

use bytes::Bytes;
use slatedb::db::Db;
use slatedb::object_store::local::LocalFileSystem;
use slatedb::object_store::path::Path;
use tracing::info;

use crate::watch::{EventLog, EventType};

/// Smallest key that is strictly greater than every key starting with `prefix`,
/// or `None` if `prefix` has no upper bound (e.g. it is empty or all `0xff`).
fn prefix_upper_bound(prefix: &[u8]) -> Option<Bytes> {
    let mut end = prefix.to_vec();
    while let Some(&last) = end.last() {
        if last == 0xff {
            end.pop();
        } else {
            *end.last_mut().unwrap() += 1;
            return Some(Bytes::from(end));
        }
    }
    None
}

/// Persistent key-value store backed by SlateDB on a local filesystem.
/// Emits a watch event for every mutation.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Db>,
    pub event_log: EventLog,
}

impl StateStore {
    /// Open (or create) a store rooted at `path`.
    pub async fn new(path: &str) -> anyhow::Result<Self> {
        info!("Opening state store at {}", path);

        std::fs::create_dir_all(path)
            .map_err(|e| anyhow::anyhow!("failed to create data directory {}: {}", path, e))?;

        let object_store = Arc::new(
            LocalFileSystem::new_with_prefix(path)
                .map_err(|e| anyhow::anyhow!("failed to create local object store: {}", e))?,
        );
        let db = Db::open(Path::from("/"), object_store)
            .await
            .map_err(|e| anyhow::anyhow!("failed to open state store: {}", e))?;

        Ok(Self {
            db: Arc::new(db),
            event_log: EventLog::new(1024),
        })
    }

    pub async fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.db
            .put(key.as_bytes(), value)
            .await
            .map_err(|e| anyhow::anyhow!("store put failed: {}", e))?;
        self.event_log.emit(EventType::Put, key);
        Ok(())
    }

    pub async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match self.db.get(key.as_bytes()).await {
            Ok(Some(bytes)) => Ok(Some(bytes.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("store get failed: {}", e)),
        }
    }

    pub async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.db
            .delete(key.as_bytes())
            .await
            .map_err(|e| anyhow::anyhow!("store delete failed: {}", e))?;
        self.event_log.emit(EventType::Delete, key);
        Ok(())
    }

    /// All key-value pairs whose keys start with `prefix`, in key order.
    pub async fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let mut results = Vec::new();
        let start = Bytes::copy_from_slice(prefix.as_bytes());
        let range: (std::ops::Bound<Bytes>, std::ops::Bound<Bytes>) =
            match prefix_upper_bound(prefix.as_bytes()) {
                Some(end) => (std::ops::Bound::Included(start), std::ops::Bound::Excluded(end)),
                None => (std::ops::Bound::Included(start), std::ops::Bound::Unbounded),
            };
        let mut iter = self
            .db
            .scan(range)
            .await
            .map_err(|e| anyhow::anyhow!("store scan failed: {}", e))?;

        while let Ok(Some(kv)) = iter.next().await {
            let key = String::from_utf8_lossy(&kv.key).to_string();
            results.push((key, kv.value.to_vec()));
        }
        Ok(results)
    }

    pub async fn close(self) -> anyhow::Result<()> {
        info!("Closing state store");
        self.db
            .close()
            .await
            .map_err(|e| anyhow::anyhow!("store close failed: {}", e))
    }
}
