//! Brute-force vector index over the derived layers
//!
//! Built by the index builder for one generation and carried forward by
//! later commits until rebuilt. Entries may therefore name ids that no
//! longer exist; callers filter hits against their snapshot.

use crate::cluster::dot;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Frames,
    Convictions,
    Traces,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VectorIndex {
    /// Generation the vectors were computed from
    pub built_at_generation: u64,
    #[serde(default)]
    pub frames: Vec<IndexEntry>,
    #[serde(default)]
    pub convictions: Vec<IndexEntry>,
    #[serde(default)]
    pub traces: Vec<IndexEntry>,
}

impl VectorIndex {
    pub fn section(&self, kind: IndexKind) -> &[IndexEntry] {
        match kind {
            IndexKind::Frames => &self.frames,
            IndexKind::Convictions => &self.convictions,
            IndexKind::Traces => &self.traces,
        }
    }

    pub fn has(&self, kind: IndexKind) -> bool {
        !self.section(kind).is_empty()
    }

    /// Nearest entries by cosine distance (0–2 scale), closest first.
    ///
    /// Vectors are expected to be L2-normalized. `accept` filters ids
    /// before ranking, so stale entries never take a slot.
    pub fn nearest(
        &self,
        kind: IndexKind,
        query: &[f32],
        k: usize,
        accept: impl Fn(&str) -> bool,
    ) -> Vec<(String, f32)> {
        let mut hits: Vec<(&str, f32)> = self
            .section(kind)
            .iter()
            .filter(|e| accept(&e.id))
            .map(|e| (e.id.as_str(), (1.0 - dot(&e.vector, query)).clamp(0.0, 2.0)))
            .collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        hits.into_iter()
            .take(k)
            .map(|(id, d)| (id.to_string(), d))
            .collect()
    }
}
