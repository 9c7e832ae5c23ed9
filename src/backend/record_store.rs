//! Signal record store
//!
//! Directory layout:
//! ```text
//! <data_dir>/
//! └── <owner>/
//!     └── signals.jsonl   one {"signal": .., "embedding": [..]} per line
//! ```

use crate::cluster::dot;
use crate::error::Result;
use crate::model::{Direction, Modality, Signal};
use crate::store::{jsonl, validate_owner};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A signal together with its embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSignal {
    pub signal: Signal,
    pub embedding: Vec<f32>,
}

/// Metadata filter for similarity search
#[derive(Debug, Clone, Default)]
pub struct SignalFilter {
    pub direction: Option<Direction>,
    /// Empty means any modality
    pub modalities: Vec<Modality>,
    pub active_only: bool,
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
    /// Exact source context
    pub context: Option<String>,
}

impl SignalFilter {
    /// Only active signals
    pub fn active() -> Self {
        Self {
            active_only: true,
            ..Self::default()
        }
    }

    pub fn matches(&self, signal: &Signal) -> bool {
        if self.active_only && !signal.is_active() {
            return false;
        }
        if let Some(direction) = self.direction {
            if signal.direction != direction {
                return false;
            }
        }
        if !self.modalities.is_empty() && !self.modalities.contains(&signal.modality) {
            return false;
        }
        if let Some(since) = self.since {
            if signal.source.date < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if signal.source.date > until {
                return false;
            }
        }
        if let Some(context) = &self.context {
            if &signal.source.context != context {
                return false;
            }
        }
        true
    }
}

/// Append-only signal persistence.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Append records, skipping ids already stored. Returns the number added.
    async fn append(&self, owner: &str, records: Vec<StoredSignal>) -> Result<usize>;

    /// Every stored record of the owner, in insertion order.
    async fn load_all(&self, owner: &str) -> Result<Vec<StoredSignal>>;

    /// Top `k` matching signals by cosine similarity, most similar first.
    async fn similarity_search(
        &self,
        owner: &str,
        embedding: &[f32],
        filter: &SignalFilter,
        k: usize,
    ) -> Result<Vec<(Signal, f32)>>;

    /// Point lookup; unknown ids are skipped, request order is kept.
    async fn get_by_ids(&self, owner: &str, ids: &[String]) -> Result<Vec<Signal>>;

    /// Mark a signal inactive. Returns false when the id is unknown.
    async fn deactivate(&self, owner: &str, id: &str, reason: &str) -> Result<bool>;
}

/// File-backed record store with an in-memory cache per owner
pub struct JsonlRecordStore {
    base_dir: PathBuf,
    cache: Arc<RwLock<HashMap<String, Vec<StoredSignal>>>>,
}

impl JsonlRecordStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn signals_path(&self, owner: &str) -> PathBuf {
        self.base_dir.join(owner).join("signals.jsonl")
    }

    /// Load the owner's records into the cache if not already there
    async fn ensure_loaded(&self, owner: &str) -> Result<()> {
        validate_owner(owner)?;
        if self.cache.read().await.contains_key(owner) {
            return Ok(());
        }
        let records: Vec<StoredSignal> = jsonl::read_jsonl(&self.signals_path(owner)).await?;
        tracing::debug!("Loaded {} signals for owner {}", records.len(), owner);
        self.cache
            .write()
            .await
            .entry(owner.to_string())
            .or_insert(records);
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonlRecordStore {
    async fn append(&self, owner: &str, records: Vec<StoredSignal>) -> Result<usize> {
        self.ensure_loaded(owner).await?;
        let mut cache = self.cache.write().await;
        let existing = cache.entry(owner.to_string()).or_default();

        let mut seen: HashSet<String> = existing.iter().map(|r| r.signal.id.clone()).collect();
        let fresh: Vec<StoredSignal> = records
            .into_iter()
            .filter(|r| seen.insert(r.signal.id.clone()))
            .collect();

        jsonl::append_jsonl(&self.signals_path(owner), &fresh).await?;
        let added = fresh.len();
        existing.extend(fresh);
        Ok(added)
    }

    async fn load_all(&self, owner: &str) -> Result<Vec<StoredSignal>> {
        self.ensure_loaded(owner).await?;
        Ok(self
            .cache
            .read()
            .await
            .get(owner)
            .cloned()
            .unwrap_or_default())
    }

    async fn similarity_search(
        &self,
        owner: &str,
        embedding: &[f32],
        filter: &SignalFilter,
        k: usize,
    ) -> Result<Vec<(Signal, f32)>> {
        self.ensure_loaded(owner).await?;
        let cache = self.cache.read().await;
        let Some(records) = cache.get(owner) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<(&StoredSignal, f32)> = records
            .iter()
            .filter(|r| filter.matches(&r.signal))
            .map(|r| (r, dot(&r.embedding, embedding)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(scored
            .into_iter()
            .take(k)
            .map(|(r, score)| (r.signal.clone(), score))
            .collect())
    }

    async fn get_by_ids(&self, owner: &str, ids: &[String]) -> Result<Vec<Signal>> {
        self.ensure_loaded(owner).await?;
        let cache = self.cache.read().await;
        let Some(records) = cache.get(owner) else {
            return Ok(Vec::new());
        };
        let by_id: HashMap<&str, &Signal> = records
            .iter()
            .map(|r| (r.signal.id.as_str(), &r.signal))
            .collect();
        Ok(ids
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).map(|s| (*s).clone()))
            .collect())
    }

    async fn deactivate(&self, owner: &str, id: &str, reason: &str) -> Result<bool> {
        self.ensure_loaded(owner).await?;
        let mut cache = self.cache.write().await;
        let Some(records) = cache.get_mut(owner) else {
            return Ok(false);
        };
        let Some(pos) = records.iter().position(|r| r.signal.id == id) else {
            return Ok(false);
        };
        let mut updated = records.clone();
        updated[pos].signal.lifecycle.active = false;
        updated[pos].signal.lifecycle.deactivated_reason = Some(reason.to_string());

        // the cache only changes once the file does
        jsonl::write_jsonl(&self.signals_path(owner), &updated).await?;
        *records = updated;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::make_signal;
    use tempfile::TempDir;

    fn stored(id: &str, embedding: Vec<f32>) -> StoredSignal {
        StoredSignal {
            signal: make_signal(id, Direction::Output, Modality::WrittenCasual, 1, "email"),
            embedding,
        }
    }

    #[tokio::test]
    async fn test_append_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = JsonlRecordStore::new(dir.path().to_path_buf());

        let added = store
            .append("alice", vec![stored("s1", vec![1.0, 0.0]), stored("s2", vec![0.0, 1.0])])
            .await
            .unwrap();
        assert_eq!(added, 2);

        let added = store
            .append("alice", vec![stored("s2", vec![0.0, 1.0]), stored("s3", vec![1.0, 0.0]), stored("s3", vec![1.0, 0.0])])
            .await
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(store.load_all("alice").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        {
            let store = JsonlRecordStore::new(dir.path().to_path_buf());
            store.append("alice", vec![stored("s1", vec![1.0, 0.0])]).await.unwrap();
        }
        let store = JsonlRecordStore::new(dir.path().to_path_buf());
        let all = store.load_all("alice").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].signal.id, "s1");
        assert!(store.load_all("bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_similarity_search_with_filter() {
        let dir = TempDir::new().unwrap();
        let store = JsonlRecordStore::new(dir.path().to_path_buf());
        let mut input = stored("in", vec![1.0, 0.0]);
        input.signal.direction = Direction::Input;
        store
            .append("alice", vec![stored("a", vec![0.6, 0.8]), stored("b", vec![1.0, 0.0]), input])
            .await
            .unwrap();

        let hits = store
            .similarity_search("alice", &[1.0, 0.0], &SignalFilter::default(), 2)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].1 >= hits[1].1);

        let filter = SignalFilter {
            direction: Some(Direction::Output),
            ..SignalFilter::default()
        };
        let hits = store.similarity_search("alice", &[1.0, 0.0], &filter, 5).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|(s, _)| s.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_get_by_ids_keeps_request_order() {
        let dir = TempDir::new().unwrap();
        let store = JsonlRecordStore::new(dir.path().to_path_buf());
        store
            .append("alice", vec![stored("s1", vec![1.0]), stored("s2", vec![1.0])])
            .await
            .unwrap();
        let found = store
            .get_by_ids("alice", &["s2".to_string(), "nope".to_string(), "s1".to_string()])
            .await
            .unwrap();
        let ids: Vec<&str> = found.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s2", "s1"]);
    }

    #[tokio::test]
    async fn test_deactivate_persists() {
        let dir = TempDir::new().unwrap();
        let store = JsonlRecordStore::new(dir.path().to_path_buf());
        store.append("alice", vec![stored("s1", vec![1.0])]).await.unwrap();
        assert!(store.deactivate("alice", "s1", "duplicate import").await.unwrap());
        assert!(!store.deactivate("alice", "missing", "x").await.unwrap());

        let reopened = JsonlRecordStore::new(dir.path().to_path_buf());
        let all = reopened.load_all("alice").await.unwrap();
        assert!(!all[0].signal.is_active());

        let hits = reopened
            .similarity_search("alice", &[1.0], &SignalFilter::active(), 5)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_failed_deactivate_leaves_cache_untouched() {
        let dir = TempDir::new().unwrap();
        let store = JsonlRecordStore::new(dir.path().to_path_buf());
        store.append("alice", vec![stored("s1", vec![1.0])]).await.unwrap();

        // a non-empty directory in place of the file makes the rewrite fail
        let path = dir.path().join("alice").join("signals.jsonl");
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir_all(path.join("blocker")).unwrap();

        assert!(store.deactivate("alice", "s1", "typo").await.is_err());
        let all = store.load_all("alice").await.unwrap();
        assert!(all[0].signal.is_active());
        assert!(all[0].signal.lifecycle.deactivated_reason.is_none());
    }

    #[tokio::test]
    async fn test_rejects_path_like_owner() {
        let dir = TempDir::new().unwrap();
        let store = JsonlRecordStore::new(dir.path().to_path_buf());
        assert!(store.load_all("../etc").await.is_err());
    }
}
