//! Multi-layer retrieval for one question
//!
//! ```text
//! question ─► frame match ─► conviction activation ─► trace retrieval
//!             (reflex, then       (frame profile, then     (temporal sampling
//!              frame index)        index, then strength)    or nearest/history)
//!                                        │
//!                                        ▼
//!                         evidence backtracking ─► confidence ─► ContextBundle
//! ```
//!
//! The question is embedded at most once, and only when some vector index
//! section is available to search. Without an index every step falls back
//! to a heuristic and the query still succeeds.

use super::session::QuerySession;
use crate::backend::{Embedder, RecordStore};
use crate::config::QueryConfig;
use crate::error::Result;
use crate::model::*;
use crate::store::{IndexKind, Snapshot};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Words implying the question is about change over time
const TEMPORAL_KEYWORDS: &[&str] = &[
    "changed",
    "change over",
    "used to",
    "lately",
    "recently",
    "over time",
    "over the years",
    "evolve",
    "trend",
    "shifted",
    "anymore",
    "in the past",
    "these days",
    "nowadays",
    "still the same",
    "變化",
    "改變",
    "以前",
    "之前",
    "最近",
    "一直",
    "演變",
    "轉變",
    "過去",
    "現在",
    "從前",
    "後來",
    "趨勢",
    "還是一樣",
    "不一樣了",
];

/// Evidence signal ids taken from each evidence entry
const IDS_PER_EVIDENCE_ENTRY: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    /// Trigger keyword hit, no embedding needed
    Reflex,
    /// Nearest frame in the vector index
    Embedding,
}

/// Everything retrieved for one question
#[derive(Debug, Clone, Serialize)]
pub struct ContextBundle {
    pub question: String,
    pub caller: Option<String>,
    pub matched_frame: Option<ContextFrame>,
    pub match_method: Option<MatchMethod>,
    pub activated_convictions: Vec<Conviction>,
    pub relevant_traces: Vec<ReasoningTrace>,
    pub identity_constraints: Vec<IdentityCore>,
    /// Raw signals backing the activated convictions
    pub evidence: Vec<Signal>,
    pub low_confidence: bool,
    pub is_temporal: bool,
}

/// How much to retrieve
#[derive(Debug, Clone, Copy)]
pub struct RetrievalLimits {
    pub convictions: usize,
    pub traces: usize,
}

/// True when the question asks about change over time
pub fn is_temporal_query(question: &str) -> bool {
    let lowered = question.to_lowercase();
    TEMPORAL_KEYWORDS.iter().any(|kw| lowered.contains(kw))
}

pub struct Retriever {
    config: QueryConfig,
    embedder: Arc<dyn Embedder>,
    records: Arc<dyn RecordStore>,
}

impl Retriever {
    pub fn new(config: QueryConfig, embedder: Arc<dyn Embedder>, records: Arc<dyn RecordStore>) -> Self {
        Self {
            config,
            embedder,
            records,
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Limits for answering a question
    pub fn query_limits(&self) -> RetrievalLimits {
        RetrievalLimits {
            convictions: self.config.conviction_limit,
            traces: self.config.trace_limit,
        }
    }

    /// Limits for content generation
    pub fn generate_limits(&self) -> RetrievalLimits {
        RetrievalLimits {
            convictions: self.config.generate_conviction_limit,
            traces: self.config.generate_trace_limit,
        }
    }

    /// Assemble the context bundle for `question` from one session
    pub async fn retrieve(
        &self,
        session: &QuerySession,
        question: &str,
        caller: Option<&str>,
        limits: RetrievalLimits,
    ) -> Result<ContextBundle> {
        let snapshot = &session.snapshot;
        let mut embedding = QueryEmbedding::new(self.embedder.as_ref(), question, session);

        // 1. Frame match
        let mut match_method = None;
        let mut matched_frame = reflex_match(question, snapshot).cloned();
        if matched_frame.is_some() {
            match_method = Some(MatchMethod::Reflex);
        } else if let Some(frame) = self.embedding_match(snapshot, &mut embedding).await? {
            matched_frame = Some(frame.clone());
            match_method = Some(MatchMethod::Embedding);
        }

        // 2. Conviction activation
        let mut activated: Vec<Conviction> = Vec::new();
        if let Some(frame) = &matched_frame {
            activated = frame
                .profile
                .primary
                .iter()
                .filter_map(|a| snapshot.convictions.get(&a.conviction_id))
                .cloned()
                .collect();
        }
        if activated.is_empty() {
            activated = self
                .relevant_convictions(snapshot, &mut embedding, limits.convictions)
                .await?;
        }

        // 3. Trace retrieval
        let is_temporal = is_temporal_query(question);
        let relevant_traces = if is_temporal {
            self.temporal_traces(snapshot, &mut embedding, limits.traces).await?
        } else {
            self.relevant_traces(snapshot, matched_frame.as_ref(), &mut embedding, limits.traces)
                .await?
        };

        // 4. Evidence backtracking
        let evidence = self.collect_evidence(&snapshot.owner, &activated).await;

        // 5. Confidence calibration
        let low_confidence = self.check_low_confidence(snapshot, &mut embedding).await?;

        tracing::debug!(
            "Retrieved for {}: frame={:?} via {:?}, {} convictions, {} traces, {} evidence, low_confidence={}",
            snapshot.owner,
            matched_frame.as_ref().map(|f| f.id.as_str()),
            match_method,
            activated.len(),
            relevant_traces.len(),
            evidence.len(),
            low_confidence
        );

        Ok(ContextBundle {
            question: question.to_string(),
            caller: caller.map(str::to_string),
            matched_frame,
            match_method,
            activated_convictions: activated,
            relevant_traces,
            // 6. Identity constraints
            identity_constraints: snapshot.identities.iter().cloned().collect(),
            evidence,
            low_confidence,
            is_temporal,
        })
    }

    async fn embedding_match<'a>(
        &self,
        snapshot: &'a Snapshot,
        embedding: &mut QueryEmbedding<'_>,
    ) -> Result<Option<&'a ContextFrame>> {
        let Some(index) = embedding.index_with(IndexKind::Frames) else {
            return Ok(None);
        };
        let query = embedding.get().await?;
        let active: HashSet<&str> = snapshot.active_frames().map(|f| f.id.as_str()).collect();
        let hit = index
            .nearest(IndexKind::Frames, query, 1, |id| active.contains(id))
            .into_iter()
            .next();
        Ok(hit
            .filter(|(_, distance)| *distance < self.config.frame_distance_threshold)
            .and_then(|(id, _)| snapshot.frames.get(&id)))
    }

    async fn relevant_convictions(
        &self,
        snapshot: &Snapshot,
        embedding: &mut QueryEmbedding<'_>,
        limit: usize,
    ) -> Result<Vec<Conviction>> {
        if let Some(index) = embedding.index_with(IndexKind::Convictions) {
            let query = embedding.get().await?;
            let found: Vec<Conviction> = index
                .nearest(IndexKind::Convictions, query, limit, |id| {
                    snapshot.convictions.get(id).is_some_and(|c| c.is_active())
                })
                .into_iter()
                .filter_map(|(id, _)| snapshot.convictions.get(&id).cloned())
                .collect();
            if !found.is_empty() {
                return Ok(found);
            }
        }

        let mut strongest: Vec<&Conviction> = snapshot.active_convictions().collect();
        strongest.sort_by(|a, b| {
            b.strength
                .score
                .total_cmp(&a.strength.score)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(strongest.into_iter().take(limit).cloned().collect())
    }

    async fn relevant_traces(
        &self,
        snapshot: &Snapshot,
        frame: Option<&ContextFrame>,
        embedding: &mut QueryEmbedding<'_>,
        limit: usize,
    ) -> Result<Vec<ReasoningTrace>> {
        let history: Vec<&ReasoningTrace> = match frame {
            Some(frame) => {
                let ids: HashSet<&str> = frame
                    .patterns
                    .historical_traces
                    .iter()
                    .map(String::as_str)
                    .collect();
                snapshot.traces.iter().filter(|t| ids.contains(t.id.as_str())).collect()
            }
            None => Vec::new(),
        };
        if !history.is_empty() && history.len() >= limit {
            return Ok(history.into_iter().take(limit).cloned().collect());
        }

        if let Some(index) = embedding.index_with(IndexKind::Traces) {
            let query = embedding.get().await?;
            let found: Vec<ReasoningTrace> = index
                .nearest(IndexKind::Traces, query, limit, |id| snapshot.traces.contains(id))
                .into_iter()
                .filter_map(|(id, _)| snapshot.traces.get(&id).cloned())
                .collect();
            if !found.is_empty() {
                return Ok(found);
            }
        }

        if !history.is_empty() {
            return Ok(history.into_iter().take(limit).cloned().collect());
        }

        let mut recent: Vec<&ReasoningTrace> = snapshot.traces.iter().collect();
        recent.sort_by(|a, b| b.source.date.cmp(&a.source.date).then_with(|| a.id.cmp(&b.id)));
        Ok(recent.into_iter().take(limit).cloned().collect())
    }

    /// Traces spread across time: early, middle and recent thirds
    async fn temporal_traces(
        &self,
        snapshot: &Snapshot,
        embedding: &mut QueryEmbedding<'_>,
        limit: usize,
    ) -> Result<Vec<ReasoningTrace>> {
        let mut pool: Vec<&ReasoningTrace> = match embedding.index_with(IndexKind::Traces) {
            Some(index) => {
                let query = embedding.get().await?;
                index
                    .nearest(IndexKind::Traces, query, limit * 3, |id| snapshot.traces.contains(id))
                    .into_iter()
                    .filter_map(|(id, _)| snapshot.traces.get(&id))
                    .collect()
            }
            None => snapshot.traces.iter().collect(),
        };
        pool.sort_by(|a, b| a.source.date.cmp(&b.source.date).then_with(|| a.id.cmp(&b.id)));
        Ok(sample_across_time(&pool, limit).into_iter().cloned().collect())
    }

    /// Raw signals behind the activated convictions, fetched by id
    async fn collect_evidence(&self, owner: &str, convictions: &[Conviction]) -> Vec<Signal> {
        let limit = self.config.evidence_limit;
        let mut ids: Vec<String> = Vec::new();
        for conviction in convictions {
            ids.extend(evidence_signal_ids(&conviction.evidence));
            if ids.len() >= limit * 2 {
                break;
            }
        }
        let mut seen = HashSet::new();
        ids.retain(|id| seen.insert(id.clone()));
        ids.truncate(limit);
        if ids.is_empty() {
            return Vec::new();
        }

        match self.records.get_by_ids(owner, &ids).await {
            Ok(signals) => signals.into_iter().filter(|s| s.is_active()).collect(),
            Err(e) => {
                tracing::warn!("Failed to fetch evidence signals for {}: {}", owner, e);
                Vec::new()
            }
        }
    }

    /// Low confidence when every available conviction/trace index has its
    /// nearest entry at or beyond the distance threshold
    async fn check_low_confidence(
        &self,
        snapshot: &Snapshot,
        embedding: &mut QueryEmbedding<'_>,
    ) -> Result<bool> {
        let mut checked = 0;
        for kind in [IndexKind::Convictions, IndexKind::Traces] {
            let Some(index) = embedding.index_with(kind) else {
                continue;
            };
            let query = embedding.get().await?;
            let nearest = index.nearest(kind, query, 1, |id| match kind {
                IndexKind::Convictions => snapshot.convictions.contains(id),
                _ => snapshot.traces.contains(id),
            });
            let Some((_, distance)) = nearest.into_iter().next() else {
                continue;
            };
            checked += 1;
            if distance < self.config.low_confidence_distance {
                return Ok(false);
            }
        }
        Ok(checked > 0)
    }
}

/// Active frame with the most trigger keyword hits, at least one
fn reflex_match<'a>(question: &str, snapshot: &'a Snapshot) -> Option<&'a ContextFrame> {
    let mut best: Option<(&ContextFrame, usize)> = None;
    for frame in snapshot.active_frames() {
        let hits = frame.keyword_hits(question);
        if hits > best.map_or(0, |(_, h)| h) {
            best = Some((frame, hits));
        }
    }
    best.map(|(frame, _)| frame)
}

/// Pick up to `limit` items from a date-sorted pool: the earliest third,
/// a slice from the middle, and the most recent third. Below three slots
/// only the most recent items are kept.
fn sample_across_time<'a, T>(pool: &[&'a T], limit: usize) -> Vec<&'a T> {
    let n = pool.len();
    if n <= limit {
        return pool.to_vec();
    }
    if limit < 3 {
        return pool[n - limit..].to_vec();
    }
    let third = limit / 3;
    let middle_take = limit.saturating_sub(2 * third);
    let mut picked: Vec<usize> = (0..third).collect();
    picked.extend((n / 3..2 * n / 3).take(middle_take));
    picked.extend(n - third..n);

    let mut seen = HashSet::new();
    picked.retain(|i| seen.insert(*i));
    picked.sort_unstable();
    picked.into_iter().map(|i| pool[i]).collect()
}

/// Up to two signal ids per evidence entry, category by category
fn evidence_signal_ids(evidence: &ResonanceEvidence) -> Vec<String> {
    let mut ids = Vec::new();
    for tp in &evidence.temporal_persistence {
        ids.extend(tp.signal_ids.iter().take(IDS_PER_EVIDENCE_ENTRY).cloned());
    }
    for ccc in &evidence.cross_context_consistency {
        ids.extend(ccc.signal_ids.iter().take(IDS_PER_EVIDENCE_ENTRY).cloned());
    }
    for ioc in &evidence.input_output_convergence {
        ids.push(ioc.input_signal.clone());
        ids.push(ioc.output_signal.clone());
    }
    for sm in &evidence.spontaneous_mentions {
        ids.push(sm.signal_id.clone());
    }
    for aa in &evidence.action_alignment {
        ids.push(aa.statement_signal.clone());
        ids.push(aa.action_signal.clone());
    }
    ids
}

/// Lazily computed question embedding plus the session's index
struct QueryEmbedding<'s> {
    embedder: &'s dyn Embedder,
    question: &'s str,
    session: &'s QuerySession,
    vector: Option<Vec<f32>>,
}

impl<'s> QueryEmbedding<'s> {
    fn new(embedder: &'s dyn Embedder, question: &'s str, session: &'s QuerySession) -> Self {
        Self {
            embedder,
            question,
            session,
            vector: None,
        }
    }

    /// The index, if it has a non-empty section of `kind`
    fn index_with(&self, kind: IndexKind) -> Option<&'s crate::store::VectorIndex> {
        self.session.index.as_ref().filter(|index| index.has(kind))
    }

    async fn get(&mut self) -> Result<&[f32]> {
        if self.vector.is_none() {
            self.vector = Some(self.embedder.encode(self.question).await?);
        }
        Ok(self.vector.as_deref().unwrap_or_default())
    }
}
