//! Vector index construction for one snapshot

use crate::backend::Embedder;
use crate::error::{Error, Result};
use crate::store::{IndexEntry, Snapshot, VectorIndex};
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub generation: u64,
    pub frames_indexed: usize,
    pub convictions_indexed: usize,
    pub traces_indexed: usize,
}

/// Embed frames, convictions and traces of `snapshot`
pub async fn build_index(snapshot: &Snapshot, embedder: &dyn Embedder) -> Result<(VectorIndex, IndexStats)> {
    let frames = embed_section(
        embedder,
        snapshot.frames.iter().map(|f| (f.id.clone(), f.index_text())).collect(),
    )
    .await?;
    let convictions = embed_section(
        embedder,
        snapshot
            .convictions
            .iter()
            .map(|c| (c.id.clone(), c.statement.clone()))
            .collect(),
    )
    .await?;
    let traces = embed_section(
        embedder,
        snapshot
            .traces
            .iter()
            .map(|t| (t.id.clone(), format!("{} {}", t.trigger.situation, t.conclusion.decision)))
            .collect(),
    )
    .await?;

    let stats = IndexStats {
        generation: snapshot.generation,
        frames_indexed: frames.len(),
        convictions_indexed: convictions.len(),
        traces_indexed: traces.len(),
    };
    tracing::info!(
        "Built index for {} at generation {}: {} frames, {} convictions, {} traces",
        snapshot.owner,
        stats.generation,
        stats.frames_indexed,
        stats.convictions_indexed,
        stats.traces_indexed
    );
    Ok((
        VectorIndex {
            built_at_generation: snapshot.generation,
            frames,
            convictions,
            traces,
        },
        stats,
    ))
}

async fn embed_section(embedder: &dyn Embedder, items: Vec<(String, String)>) -> Result<Vec<IndexEntry>> {
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let (ids, texts): (Vec<String>, Vec<String>) = items.into_iter().unzip();
    let vectors = embedder.encode_batch(&texts).await?;
    if vectors.len() != ids.len() {
        return Err(Error::Embedding(format!(
            "Expected {} vectors, got {}",
            ids.len(),
            vectors.len()
        )));
    }
    Ok(ids
        .into_iter()
        .zip(vectors)
        .map(|(id, vector)| IndexEntry { id, vector })
        .collect())
}
