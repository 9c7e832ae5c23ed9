//! Query sessions pinned to one committed generation

use crate::error::Result;
use crate::store::{LayerStore, Snapshot, VectorIndex};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Read-only view of one owner's layers and vector index
#[derive(Debug)]
pub struct QuerySession {
    pub snapshot: Snapshot,
    pub index: Option<VectorIndex>,
    /// Creation timestamp
    pub loaded_at: i64,
}

impl QuerySession {
    pub fn new(snapshot: Snapshot, index: Option<VectorIndex>) -> Self {
        Self {
            snapshot,
            index,
            loaded_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.snapshot.owner
    }

    pub fn generation(&self) -> u64 {
        self.snapshot.generation
    }
}

/// Per-owner cache of query sessions.
///
/// A cached session is served only while its generation is still the
/// owner's committed one.
#[derive(Default)]
pub struct SessionCache {
    sessions: RwLock<HashMap<String, Arc<QuerySession>>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached session for `owner`, loading it if it is missing
    /// or stale.
    pub async fn get_or_load(&self, layers: &LayerStore, owner: &str) -> Result<Arc<QuerySession>> {
        let current = layers.current_generation(owner).await?;
        if let Some(session) = self.sessions.read().await.get(owner) {
            if session.generation() == current {
                return Ok(session.clone());
            }
        }

        let snapshot = layers.load(owner).await?;
        let index = layers.load_index(owner, snapshot.generation).await?;
        let session = Arc::new(QuerySession::new(snapshot, index));
        tracing::debug!(
            "Loaded query session for {} at generation {}",
            owner,
            session.generation()
        );
        self.sessions
            .write()
            .await
            .insert(owner.to_string(), session.clone());
        Ok(session)
    }

    /// Drop the cached session of one owner
    pub async fn invalidate(&self, owner: &str) {
        self.sessions.write().await.remove(owner);
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
