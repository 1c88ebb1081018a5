//! Flat in-process vector index with snapshot persistence.
//!
//! Embeddings live in parallel arrays behind an `RwLock` and are searched by
//! exhaustive cosine similarity. Every mutation rewrites a single JSON
//! snapshot file (full read on startup, full rewrite on change — not an
//! append log), so the index survives restarts without a database.
//!
//! Reads proceed concurrently; mutations hold the write lock across both the
//! in-memory update and the snapshot write so a snapshot never races a
//! concurrent mutation.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::embedding::cosine_similarity;
use crate::error::EngineError;
use crate::models::{RetrievedDocument, VectorRecord};

use super::VectorBackend;

/// On-disk snapshot shape: parallel arrays, one entry per record.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    documents: Vec<String>,
    embeddings: Vec<Vec<f32>>,
    metadatas: Vec<serde_json::Value>,
    ids: Vec<String>,
}

pub struct LocalIndexBackend {
    snapshot_path: PathBuf,
    inner: RwLock<Snapshot>,
}

impl LocalIndexBackend {
    /// Open the index, loading an existing snapshot when present. A missing
    /// or unreadable snapshot starts an empty index (logged, not fatal).
    pub fn open(snapshot_path: impl Into<PathBuf>) -> Self {
        let snapshot_path = snapshot_path.into();
        let snapshot = match std::fs::read_to_string(&snapshot_path) {
            Ok(raw) => match serde_json::from_str::<Snapshot>(&raw) {
                Ok(snap) => {
                    info!(
                        path = %snapshot_path.display(),
                        documents = snap.ids.len(),
                        "loaded local index snapshot"
                    );
                    snap
                }
                Err(e) => {
                    warn!(
                        path = %snapshot_path.display(),
                        error = %e,
                        "corrupt snapshot; starting with an empty index"
                    );
                    Snapshot::default()
                }
            },
            Err(_) => Snapshot::default(),
        };

        Self {
            snapshot_path,
            inner: RwLock::new(snapshot),
        }
    }

    /// Serialize under the write lock; the caller holds the guard.
    fn persist(&self, snapshot: &Snapshot) -> Result<(), EngineError> {
        if let Some(parent) = self.snapshot_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let raw = serde_json::to_string(snapshot)?;
        std::fs::write(&self.snapshot_path, raw)?;
        Ok(())
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Export every record, e.g. for migration to a managed backend.
    pub fn records(&self) -> Vec<VectorRecord> {
        let inner = self.inner.read().unwrap();
        inner
            .ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let mut payload = inner.metadatas[i].clone();
                if let Some(obj) = payload.as_object_mut() {
                    obj.insert(
                        "document".to_string(),
                        serde_json::Value::String(inner.documents[i].clone()),
                    );
                }
                VectorRecord {
                    id: id.clone(),
                    vector: inner.embeddings[i].clone(),
                    payload,
                }
            })
            .collect()
    }
}

#[async_trait]
impl VectorBackend for LocalIndexBackend {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<(), EngineError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.write().unwrap();
        for record in records {
            let document = record
                .payload
                .get("document")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let mut metadata = record.payload.clone();
            if let Some(obj) = metadata.as_object_mut() {
                obj.remove("document");
            }

            // One record per id: re-ingesting overwrites, never duplicates.
            match inner.ids.iter().position(|id| *id == record.id) {
                Some(i) => {
                    inner.documents[i] = document;
                    inner.embeddings[i] = record.vector;
                    inner.metadatas[i] = metadata;
                }
                None => {
                    inner.ids.push(record.id);
                    inner.documents.push(document);
                    inner.embeddings.push(record.vector);
                    inner.metadatas.push(metadata);
                }
            }
        }
        self.persist(&inner)
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<RetrievedDocument>, EngineError> {
        let inner = self.inner.read().unwrap();

        let mut scored: Vec<(usize, f32)> = inner
            .embeddings
            .iter()
            .enumerate()
            .map(|(i, emb)| (i, cosine_similarity(vector, emb)))
            .filter(|(_, sim)| *sim >= threshold)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        Ok(scored
            .into_iter()
            .map(|(i, sim)| {
                RetrievedDocument::new(inner.documents[i].clone(), inner.metadatas[i].clone(), sim)
            })
            .collect())
    }

    async fn clear(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.write().unwrap();
        *inner = Snapshot::default();
        self.persist(&inner)
    }

    async fn count(&self) -> Result<usize, EngineError> {
        Ok(self.inner.read().unwrap().ids.len())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, vector: Vec<f32>, text: &str) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            vector,
            payload: json!({"document": text, "source_id": "doc1", "chunk_index": 0}),
        }
    }

    fn temp_index() -> (tempfile::TempDir, LocalIndexBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalIndexBackend::open(dir.path().join("vectors.json"));
        (dir, backend)
    }

    #[tokio::test]
    async fn test_upsert_and_search() {
        let (_dir, backend) = temp_index();
        backend
            .upsert(vec![
                record("a", vec![1.0, 0.0], "about orders"),
                record("b", vec![0.0, 1.0], "about auth"),
            ])
            .await
            .unwrap();

        let results = backend.search(&[1.0, 0.0], 5, 0.5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "about orders");
        assert!((results[0].similarity - 1.0).abs() < 1e-6);
        assert_eq!(results[0].metadata["source_id"], "doc1");
        assert!(results[0].metadata.get("document").is_none());
    }

    #[tokio::test]
    async fn test_threshold_filters() {
        let (_dir, backend) = temp_index();
        backend
            .upsert(vec![
                record("a", vec![1.0, 0.0], "close"),
                record("b", vec![0.7, 0.7], "diagonal"),
            ])
            .await
            .unwrap();

        let strict = backend.search(&[1.0, 0.0], 5, 0.9).await.unwrap();
        assert_eq!(strict.len(), 1);
        for doc in &strict {
            assert!(doc.similarity >= 0.9);
        }

        let relaxed = backend.search(&[1.0, 0.0], 5, 0.5).await.unwrap();
        assert_eq!(relaxed.len(), 2);
    }

    #[tokio::test]
    async fn test_results_sorted_descending() {
        let (_dir, backend) = temp_index();
        backend
            .upsert(vec![
                record("far", vec![0.2, 0.98], "far"),
                record("near", vec![0.99, 0.1], "near"),
                record("mid", vec![0.7, 0.7], "mid"),
            ])
            .await
            .unwrap();

        let results = backend.search(&[1.0, 0.0], 5, 0.0).await.unwrap();
        let sims: Vec<f32> = results.iter().map(|d| d.similarity).collect();
        let mut sorted = sims.clone();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
        assert_eq!(sims, sorted);
    }

    #[tokio::test]
    async fn test_upsert_same_id_overwrites() {
        let (_dir, backend) = temp_index();
        backend
            .upsert(vec![record("a", vec![1.0, 0.0], "old text")])
            .await
            .unwrap();
        backend
            .upsert(vec![record("a", vec![1.0, 0.0], "new text")])
            .await
            .unwrap();

        assert_eq!(backend.count().await.unwrap(), 1);
        let results = backend.search(&[1.0, 0.0], 5, 0.5).await.unwrap();
        assert_eq!(results[0].text, "new text");
    }

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.json");

        {
            let backend = LocalIndexBackend::open(&path);
            backend
                .upsert(vec![record("a", vec![0.0, 1.0], "persisted")])
                .await
                .unwrap();
        }

        let reopened = LocalIndexBackend::open(&path);
        assert_eq!(reopened.count().await.unwrap(), 1);
        let results = reopened.search(&[0.0, 1.0], 5, 0.5).await.unwrap();
        assert_eq!(results[0].text, "persisted");
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.json");
        std::fs::write(&path, "{definitely not json").unwrap();

        let backend = LocalIndexBackend::open(&path);
        assert_eq!(backend.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear_empties_index_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.json");
        let backend = LocalIndexBackend::open(&path);
        backend
            .upsert(vec![record("a", vec![1.0, 0.0], "text")])
            .await
            .unwrap();

        backend.clear().await.unwrap();
        assert_eq!(backend.count().await.unwrap(), 0);

        let reopened = LocalIndexBackend::open(&path);
        assert_eq!(reopened.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_records_export_includes_document() {
        let (_dir, backend) = temp_index();
        backend
            .upsert(vec![record("a", vec![1.0, 0.0], "exported text")])
            .await
            .unwrap();

        let records = backend.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload["document"], "exported text");
    }
}
