//! Persistence — JSON document collections and the readings log
//!
//! Three logical collections (instruments, setups, readings) live as JSON
//! array documents under the data directory. Every write replaces the whole
//! file atomically (sibling tempfile + rename); mutations on one file are
//! serialized under a per-file mutex while readers go through an in-memory
//! view behind an `RwLock`.

mod catalog;
mod readings;

pub use catalog::{Catalog, InstrumentDraft, InstrumentPatch, SetupDraft, SetupPatch};
pub use readings::ReadingsLog;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

use crate::error::{EngineError, EngineResult};

/// One JSON array document with an in-memory view.
///
/// Readers clone out of the `RwLock`; mutations run under `write_gate` so
/// that read-modify-write cycles and the file replacement are serialized.
pub struct JsonCollection<T> {
    path: PathBuf,
    items: RwLock<Vec<T>>,
    write_gate: Mutex<()>,
}

impl<T> JsonCollection<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    /// Load the collection, treating a missing file as empty. A present but
    /// unparseable file is a `Corruption` error — the subsystem that owns
    /// this collection must refuse to start.
    pub async fn load(path: impl Into<PathBuf>) -> EngineResult<Self> {
        let path = path.into();
        let items = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                serde_json::from_slice::<Vec<T>>(&bytes).map_err(|e| EngineError::Corruption {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            items: RwLock::new(items),
            write_gate: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of all items.
    pub async fn snapshot(&self) -> Vec<T> {
        self.items.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    /// Apply a mutation to the item list, persist, then publish.
    ///
    /// The mutation runs on a working copy; the in-memory view only changes
    /// after the file replacement succeeded, so a failed write leaves both
    /// views on the previous state.
    pub async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut Vec<T>) -> EngineResult<R>,
    ) -> EngineResult<R> {
        let _gate = self.write_gate.lock().await;
        let mut working = self.items.read().await.clone();
        let result = f(&mut working)?;
        persist_atomically(&self.path, &working).await?;
        *self.items.write().await = working;
        Ok(result)
    }
}

/// Pretty-print `items` to a sibling tempfile, then rename over `path`.
async fn persist_atomically<T: Serialize>(path: &Path, items: &[T]) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(items).map_err(EngineError::internal)?;
    let tmp = sibling_tmp(path);
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn sibling_tmp(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "collection".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: i64,
        name: String,
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let coll: JsonCollection<Item> =
            JsonCollection::load(dir.path().join("items.json")).await.unwrap();
        assert!(coll.is_empty().await);
    }

    #[tokio::test]
    async fn test_mutate_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.json");

        let coll: JsonCollection<Item> = JsonCollection::load(&path).await.unwrap();
        coll.mutate(|items| {
            items.push(Item {
                id: 1,
                name: "a".to_string(),
            });
            Ok(())
        })
        .await
        .unwrap();

        let reloaded: JsonCollection<Item> = JsonCollection::load(&path).await.unwrap();
        assert_eq!(reloaded.snapshot().await, coll.snapshot().await);
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_state_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.json");
        let coll: JsonCollection<Item> = JsonCollection::load(&path).await.unwrap();

        let err = coll
            .mutate::<()>(|items| {
                items.push(Item {
                    id: 1,
                    name: "a".to_string(),
                });
                Err(EngineError::validation("name", "rejected"))
            })
            .await;

        assert!(err.is_err());
        assert!(coll.is_empty().await);
        // Nothing was flushed either.
        let reloaded: JsonCollection<Item> = JsonCollection::load(&path).await.unwrap();
        assert!(reloaded.is_empty().await);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.json");
        tokio::fs::write(&path, b"{ not json ]").await.unwrap();

        let err = JsonCollection::<Item>::load(&path).await.err().unwrap();
        assert!(matches!(err, EngineError::Corruption { .. }));
    }
}
