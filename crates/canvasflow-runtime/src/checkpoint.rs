//! Checkpoint persistence.
//!
//! A narrow key-value surface keyed `(execution_id, node_key)`: the
//! scheduler writes each node's output after completion when the schema
//! requires checkpointing, and on resume skips every node with a persisted
//! output. Backends range from the in-memory store used in tests to a disk
//! layout; remote stores implement the same trait.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use canvasflow_core::error::WorkflowError;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn put(
        &self,
        execution_id: Uuid,
        node_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), WorkflowError>;

    async fn get(
        &self,
        execution_id: Uuid,
        node_key: &str,
    ) -> Result<Option<Vec<u8>>, WorkflowError>;

    /// All persisted `(node_key, payload)` pairs of one execution.
    async fn list(&self, execution_id: Uuid) -> Result<Vec<(String, Vec<u8>)>, WorkflowError>;

    async fn clear(&self, execution_id: Uuid) -> Result<(), WorkflowError>;
}

/// Volatile store; checkpoints die with the process.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: RwLock<HashMap<Uuid, HashMap<String, Vec<u8>>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn put(
        &self,
        execution_id: Uuid,
        node_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), WorkflowError> {
        self.entries
            .write()
            .await
            .entry(execution_id)
            .or_default()
            .insert(node_key.to_string(), payload);
        Ok(())
    }

    async fn get(
        &self,
        execution_id: Uuid,
        node_key: &str,
    ) -> Result<Option<Vec<u8>>, WorkflowError> {
        Ok(self
            .entries
            .read()
            .await
            .get(&execution_id)
            .and_then(|m| m.get(node_key).cloned()))
    }

    async fn list(&self, execution_id: Uuid) -> Result<Vec<(String, Vec<u8>)>, WorkflowError> {
        Ok(self
            .entries
            .read()
            .await
            .get(&execution_id)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn clear(&self, execution_id: Uuid) -> Result<(), WorkflowError> {
        self.entries.write().await.remove(&execution_id);
        Ok(())
    }
}

/// One file per `(execution_id, node_key)` under a root directory. Node
/// keys are sanitized into file names; the execution id is the directory.
pub struct DiskCheckpointStore {
    root: PathBuf,
}

impl DiskCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn execution_dir(&self, execution_id: Uuid) -> PathBuf {
        self.root.join(execution_id.to_string())
    }

    fn node_file(&self, execution_id: Uuid, node_key: &str) -> PathBuf {
        let safe: String = node_key
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.execution_dir(execution_id).join(format!("{safe}.ckpt"))
    }
}

#[async_trait]
impl CheckpointStore for DiskCheckpointStore {
    async fn put(
        &self,
        execution_id: Uuid,
        node_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), WorkflowError> {
        let dir = self.execution_dir(execution_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| WorkflowError::operation(format!("checkpoint dir: {e}")))?;
        tokio::fs::write(self.node_file(execution_id, node_key), payload)
            .await
            .map_err(|e| WorkflowError::operation(format!("checkpoint write: {e}")))
    }

    async fn get(
        &self,
        execution_id: Uuid,
        node_key: &str,
    ) -> Result<Option<Vec<u8>>, WorkflowError> {
        match tokio::fs::read(self.node_file(execution_id, node_key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(WorkflowError::operation(format!("checkpoint read: {e}"))),
        }
    }

    async fn list(&self, execution_id: Uuid) -> Result<Vec<(String, Vec<u8>)>, WorkflowError> {
        let dir = self.execution_dir(execution_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(WorkflowError::operation(format!("checkpoint list: {e}"))),
        };
        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WorkflowError::operation(format!("checkpoint list: {e}")))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(node_key) = name.strip_suffix(".ckpt") else {
                continue;
            };
            let bytes = tokio::fs::read(entry.path())
                .await
                .map_err(|e| WorkflowError::operation(format!("checkpoint read: {e}")))?;
            out.push((node_key.to_string(), bytes));
        }
        Ok(out)
    }

    async fn clear(&self, execution_id: Uuid) -> Result<(), WorkflowError> {
        match tokio::fs::remove_dir_all(self.execution_dir(execution_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WorkflowError::operation(format!("checkpoint clear: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_round_trip() {
        let store = MemoryCheckpointStore::new();
        let id = Uuid::new_v4();
        store.put(id, "node_a", b"{\"x\":1}".to_vec()).await.unwrap();
        store.put(id, "node_b", b"{\"y\":2}".to_vec()).await.unwrap();

        assert_eq!(store.get(id, "node_a").await.unwrap(), Some(b"{\"x\":1}".to_vec()));
        assert_eq!(store.list(id).await.unwrap().len(), 2);

        store.clear(id).await.unwrap();
        assert!(store.list(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disk_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskCheckpointStore::new(dir.path());
        let id = Uuid::new_v4();

        assert_eq!(store.get(id, "missing").await.unwrap(), None);
        store.put(id, "node/with/slashes", b"data".to_vec()).await.unwrap();
        assert_eq!(
            store.get(id, "node/with/slashes").await.unwrap(),
            Some(b"data".to_vec())
        );

        let listed = store.list(id).await.unwrap();
        assert_eq!(listed.len(), 1);

        store.clear(id).await.unwrap();
        assert!(store.list(id).await.unwrap().is_empty());
    }
}
