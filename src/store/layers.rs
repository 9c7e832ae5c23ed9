//! Versioned snapshot store for the derived layers

use super::index::VectorIndex;
use super::jsonl::{read_jsonl, write_atomic, write_jsonl};
use super::snapshot::Snapshot;
use super::validate_owner;
use crate::error::{Error, Result};
use crate::model::Arena;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

const CURRENT: &str = "CURRENT";
const SNAPSHOTS: &str = "snapshots";
const INDEX_FILE: &str = "index.json";
const LAYER_FILES: [&str; 5] = [
    "convictions.jsonl",
    "traces.jsonl",
    "frames.jsonl",
    "identity.jsonl",
    "checked_pairs.jsonl",
];
const LOAD_ATTEMPTS: usize = 3;

/// Per-owner async mutexes serializing writers.
#[derive(Default, Clone)]
pub struct OwnerLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl OwnerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive write access to an owner's layers.
    pub async fn lock(&self, owner: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(owner.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// File-backed store of committed layer generations
pub struct LayerStore {
    base_dir: PathBuf,
    keep_generations: usize,
    locks: OwnerLocks,
}

impl LayerStore {
    pub fn new(base_dir: PathBuf, keep_generations: usize) -> Self {
        Self {
            base_dir,
            keep_generations: keep_generations.max(1),
            locks: OwnerLocks::new(),
        }
    }

    /// Wait for exclusive write access to an owner's layers.
    ///
    /// Every load-mutate-commit cycle holds this guard for its duration.
    pub async fn lock(&self, owner: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(owner).await
    }

    fn owner_dir(&self, owner: &str) -> PathBuf {
        self.base_dir.join(owner)
    }

    fn generation_dir(&self, owner: &str, generation: u64) -> PathBuf {
        self.owner_dir(owner)
            .join(SNAPSHOTS)
            .join(format!("gen-{:06}", generation))
    }

    // =========================================================================
    // Reading
    // =========================================================================

    /// The committed generation number; 0 when nothing was committed yet
    pub async fn current_generation(&self, owner: &str) -> Result<u64> {
        validate_owner(owner)?;
        let path = self.owner_dir(owner).join(CURRENT);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => text.trim().parse::<u64>().map_err(|e| {
                Error::Storage(format!("Corrupt pointer {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Load the latest committed snapshot.
    ///
    /// A generation pruned while it is being read is never returned
    /// partially; the load restarts from `CURRENT` and gives up with
    /// [`Error::Conflict`] after a few tries.
    pub async fn load(&self, owner: &str) -> Result<Snapshot> {
        for _ in 0..LOAD_ATTEMPTS {
            let generation = self.current_generation(owner).await?;
            if generation == 0 {
                return Ok(Snapshot::empty(owner));
            }
            match self.read_generation(owner, generation).await? {
                Some(snapshot) => return Ok(snapshot),
                None => tracing::debug!(
                    "Generation {} of {} vanished while loading, retrying",
                    generation,
                    owner
                ),
            }
        }
        Err(Error::Conflict(format!(
            "Generation of {} could not be read completely after {} attempts",
            owner, LOAD_ATTEMPTS
        )))
    }

    /// Read one generation; None when any layer file is gone
    async fn read_generation(&self, owner: &str, generation: u64) -> Result<Option<Snapshot>> {
        let dir = self.generation_dir(owner, generation);
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(None);
        }

        let snapshot = Snapshot {
            owner: owner.to_string(),
            generation,
            convictions: Arena::from_vec(read_jsonl(&dir.join("convictions.jsonl")).await?),
            traces: Arena::from_vec(read_jsonl(&dir.join("traces.jsonl")).await?),
            frames: Arena::from_vec(read_jsonl(&dir.join("frames.jsonl")).await?),
            identities: Arena::from_vec(read_jsonl(&dir.join("identity.jsonl")).await?),
            checked_pairs: read_jsonl(&dir.join("checked_pairs.jsonl")).await?,
        };

        // a file read as empty because it was removed is still missing now
        for name in LAYER_FILES {
            if !tokio::fs::try_exists(&dir.join(name)).await? {
                return Ok(None);
            }
        }
        Ok(Some(snapshot))
    }

    /// Every generation still on disk, oldest first.
    ///
    /// Generations pruned while listing are skipped.
    pub async fn history(&self, owner: &str) -> Result<Vec<Snapshot>> {
        validate_owner(owner)?;
        let current = self.current_generation(owner).await?;
        let mut generations = list_generations(&self.owner_dir(owner).join(SNAPSHOTS)).await?;
        generations.retain(|g| *g <= current);
        generations.sort_unstable();

        let mut snapshots = Vec::with_capacity(generations.len());
        for generation in generations {
            if let Some(snapshot) = self.read_generation(owner, generation).await? {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    /// Load the vector index stored with a generation, if any
    pub async fn load_index(&self, owner: &str, generation: u64) -> Result<Option<VectorIndex>> {
        validate_owner(owner)?;
        if generation == 0 {
            return Ok(None);
        }
        let path = self.generation_dir(owner, generation).join(INDEX_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(index) => Ok(Some(index)),
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}", path.display(), e);
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Writing
    // =========================================================================

    /// Commit a snapshot as a new generation.
    ///
    /// Fails with [`Error::Conflict`] if the owner's current generation is no
    /// longer the one the snapshot was loaded from. On success the snapshot's
    /// `generation` is updated to the new number. The previous generation's
    /// vector index is carried forward.
    pub async fn commit(&self, snapshot: &mut Snapshot) -> Result<u64> {
        let owner = snapshot.owner.clone();
        let current = self.current_generation(&owner).await?;
        if current != snapshot.generation {
            return Err(Error::Conflict(format!(
                "Owner {} is at generation {}, snapshot was based on {}",
                owner, current, snapshot.generation
            )));
        }

        let next = self.next_generation(&owner, current).await?;
        let final_dir = self.generation_dir(&owner, next);
        let partial_dir = final_dir.with_extension("partial");
        if tokio::fs::try_exists(&partial_dir).await? {
            tokio::fs::remove_dir_all(&partial_dir).await?;
        }
        tokio::fs::create_dir_all(&partial_dir).await?;

        write_jsonl(&partial_dir.join("convictions.jsonl"), snapshot.convictions.as_slice()).await?;
        write_jsonl(&partial_dir.join("traces.jsonl"), snapshot.traces.as_slice()).await?;
        write_jsonl(&partial_dir.join("frames.jsonl"), snapshot.frames.as_slice()).await?;
        write_jsonl(&partial_dir.join("identity.jsonl"), snapshot.identities.as_slice()).await?;
        write_jsonl(&partial_dir.join("checked_pairs.jsonl"), &snapshot.checked_pairs).await?;

        if current > 0 {
            let previous_index = self.generation_dir(&owner, current).join(INDEX_FILE);
            if tokio::fs::try_exists(&previous_index).await? {
                tokio::fs::copy(&previous_index, partial_dir.join(INDEX_FILE)).await?;
            }
        }

        tokio::fs::rename(&partial_dir, &final_dir).await?;
        write_atomic(
            &self.owner_dir(&owner).join(CURRENT),
            next.to_string().as_bytes(),
        )
        .await?;

        tracing::info!("Committed generation {} for owner {}", next, owner);
        snapshot.generation = next;
        self.prune(&owner, next).await;
        Ok(next)
    }

    /// Store a vector index with an already committed generation
    pub async fn save_index(&self, owner: &str, generation: u64, index: &VectorIndex) -> Result<()> {
        validate_owner(owner)?;
        let dir = self.generation_dir(owner, generation);
        if !tokio::fs::try_exists(&dir).await? {
            return Err(Error::NotFound(format!(
                "Generation {} of owner {}",
                generation, owner
            )));
        }
        let json = serde_json::to_vec(index)?;
        write_atomic(&dir.join(INDEX_FILE), &json).await
    }

    /// Save a daily digest as pretty JSON
    pub async fn save_digest(&self, owner: &str, date: NaiveDate, digest: &serde_json::Value) -> Result<PathBuf> {
        validate_owner(owner)?;
        let path = self
            .owner_dir(owner)
            .join("digests")
            .join(format!("{}.json", date.format("%Y-%m-%d")));
        let json = serde_json::to_string_pretty(digest)?;
        write_atomic(&path, json.as_bytes()).await?;
        Ok(path)
    }

    /// Pick a generation number above both the pointer and any directory
    /// left behind by an interrupted commit
    async fn next_generation(&self, owner: &str, current: u64) -> Result<u64> {
        let existing = list_generations(&self.owner_dir(owner).join(SNAPSHOTS)).await?;
        let highest = existing.into_iter().max().unwrap_or(0).max(current);
        Ok(highest + 1)
    }

    /// Remove old generations, keeping the newest `keep_generations`
    async fn prune(&self, owner: &str, current: u64) {
        let snapshots = self.owner_dir(owner).join(SNAPSHOTS);
        let mut generations = match list_generations(&snapshots).await {
            Ok(generations) => generations,
            Err(e) => {
                tracing::warn!("Failed to list generations for {}: {}", owner, e);
                return;
            }
        };
        generations.sort_unstable_by(|a, b| b.cmp(a));
        for generation in generations.into_iter().skip(self.keep_generations) {
            if generation == current {
                continue;
            }
            let dir = self.generation_dir(owner, generation);
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                tracing::warn!("Failed to prune {}: {}", dir.display(), e);
            }
        }
    }
}

/// Generation numbers of complete `gen-NNNNNN` directories
async fn list_generations(snapshots: &Path) -> Result<Vec<u64>> {
    let mut entries = match tokio::fs::read_dir(snapshots).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut generations = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(number) = name.strip_prefix("gen-") {
            if let Ok(generation) = number.parse::<u64>() {
                generations.push(generation);
            }
        }
    }
    Ok(generations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::IndexEntry;
    use crate::testing::{make_conviction, make_trace};
    use tempfile::TempDir;

    fn make_store(dir: &TempDir) -> LayerStore {
        LayerStore::new(dir.path().to_path_buf(), 2)
    }

    #[tokio::test]
    async fn test_load_empty_owner() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let snap = store.load("alice").await.unwrap();
        assert_eq!(snap.generation, 0);
        assert!(snap.convictions.is_empty());
        assert!(store.load_index("alice", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_and_reload() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);

        let mut snap = store.load("alice").await.unwrap();
        snap.convictions.insert(make_conviction("conv_a", "Trust compounds", 0.6));
        snap.traces.insert(make_trace("trace_1", &["conv_a"], 2));
        let generation = store.commit(&mut snap).await.unwrap();
        assert_eq!(generation, 1);
        assert_eq!(snap.generation, 1);

        let reloaded = store.load("alice").await.unwrap();
        assert_eq!(reloaded.generation, 1);
        assert_eq!(reloaded.convictions.get("conv_a").unwrap().statement, "Trust compounds");
        assert_eq!(reloaded.traces.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_commit_conflicts() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);

        let mut first = store.load("alice").await.unwrap();
        let mut second = store.load("alice").await.unwrap();
        store.commit(&mut first).await.unwrap();

        second.convictions.insert(make_conviction("conv_b", "B", 0.3));
        let err = store.commit(&mut second).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(store.load("alice").await.unwrap().convictions.is_empty());
    }

    #[tokio::test]
    async fn test_prunes_old_generations() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        for _ in 0..4 {
            let mut snap = store.load("alice").await.unwrap();
            store.commit(&mut snap).await.unwrap();
        }
        let mut generations = list_generations(&dir.path().join("alice").join(SNAPSHOTS))
            .await
            .unwrap();
        generations.sort_unstable();
        assert_eq!(generations, vec![3, 4]);
        assert_eq!(store.current_generation("alice").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_removed_generation_is_not_read_as_empty() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let mut snap = store.load("alice").await.unwrap();
        snap.convictions.insert(make_conviction("conv_a", "Trust compounds", 0.6));
        store.commit(&mut snap).await.unwrap();

        let gen_dir = dir.path().join("alice").join(SNAPSHOTS).join("gen-000001");
        std::fs::remove_file(gen_dir.join("convictions.jsonl")).unwrap();
        let err = store.load("alice").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        std::fs::remove_dir_all(&gen_dir).unwrap();
        let err = store.load("alice").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_history_lists_retained_generations() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        assert!(store.history("alice").await.unwrap().is_empty());
        for score in [0.3, 0.5, 0.7] {
            let mut snap = store.load("alice").await.unwrap();
            snap.convictions.insert(make_conviction("conv_a", "Trust compounds", score));
            store.commit(&mut snap).await.unwrap();
        }
        let history = store.history("alice").await.unwrap();
        let generations: Vec<u64> = history.iter().map(|s| s.generation).collect();
        assert_eq!(generations, vec![2, 3]);
        assert_eq!(history[0].convictions.get("conv_a").unwrap().strength.score, 0.5);
    }

    #[tokio::test]
    async fn test_interrupted_commit_directory_skipped() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let mut snap = store.load("alice").await.unwrap();
        store.commit(&mut snap).await.unwrap();

        // A crashed writer left gen-000002 without publishing it
        let orphan = dir.path().join("alice").join(SNAPSHOTS).join("gen-000002");
        std::fs::create_dir_all(&orphan).unwrap();

        let mut snap = store.load("alice").await.unwrap();
        assert_eq!(snap.generation, 1);
        let generation = store.commit(&mut snap).await.unwrap();
        assert_eq!(generation, 3);
    }

    #[tokio::test]
    async fn test_index_saved_and_carried_forward() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let mut snap = store.load("alice").await.unwrap();
        let generation = store.commit(&mut snap).await.unwrap();

        let index = VectorIndex {
            built_at_generation: generation,
            convictions: vec![IndexEntry {
                id: "conv_a".to_string(),
                vector: vec![1.0, 0.0],
            }],
            ..VectorIndex::default()
        };
        store.save_index("alice", generation, &index).await.unwrap();
        assert_eq!(store.load_index("alice", generation).await.unwrap(), Some(index.clone()));

        let next = store.commit(&mut snap).await.unwrap();
        assert_eq!(store.load_index("alice", next).await.unwrap(), Some(index));
    }

    #[tokio::test]
    async fn test_save_index_unknown_generation() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let err = store
            .save_index("alice", 9, &VectorIndex::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_owner_lock_serializes() {
        let locks = OwnerLocks::new();
        let guard = locks.lock("alice").await;
        let other_owner = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            locks.lock("bob"),
        )
        .await;
        assert!(other_owner.is_ok());

        let same_owner = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            locks.lock("alice"),
        )
        .await;
        assert!(same_owner.is_err());
        drop(guard);
        assert!(tokio::time::timeout(std::time::Duration::from_millis(50), locks.lock("alice"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_save_digest() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let date = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();
        let path = store
            .save_digest("alice", date, &serde_json::json!({"summary": "quiet day"}))
            .await
            .unwrap();
        assert!(path.ends_with("digests/2025-03-14.json"));
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("quiet day"));
    }
}
