//! Exploration of one owner's belief model
//!
//! Read-only views that answer "what is on record" rather than "what
//! would the owner say":
//!
//! - `recall`: raw signals nearest a text, with metadata filters
//! - `explore`: convictions, traces, frames and tensions around a topic
//! - `evolution`: how the convictions of a topic moved across generations
//! - `blindspots`: gaps between what is held, said and done
//! - `connections`: what two topics share
//! - `simulate`: a first-person walk through a hypothetical scenario
//!
//! Every view runs against a pinned [`QuerySession`]. A session without a
//! vector index yields empty topic layers rather than an error.

use super::session::QuerySession;
use crate::backend::{Embedder, Generator, RecordStore, SignalFilter, Tier};
use crate::config::ExplorerConfig;
use crate::error::Result;
use crate::model::*;
use crate::store::{IndexKind, Snapshot};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Metadata filters for [`Explorer::recall`]
#[derive(Debug, Clone, Default)]
pub struct RecallOptions {
    pub context: Option<String>,
    pub direction: Option<Direction>,
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
    /// Falls back to `recall_limit` when unset
    pub limit: Option<usize>,
}

/// One recalled signal and its cosine similarity to the query
#[derive(Debug, Clone, Serialize)]
pub struct RecallHit {
    pub signal: Signal,
    pub similarity: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExploreDepth {
    /// Convictions only
    Lite,
    /// Convictions, traces, frames, tensions and raw signals
    Full,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelatedConviction {
    pub conviction_id: String,
    pub statement: String,
    pub strength: f32,
    pub level: StrengthLevel,
    pub trend: Trend,
    pub domains: Vec<String>,
    /// `1 - distance`, rounded to two decimals
    pub relevance: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceSummary {
    pub trace_id: String,
    pub date: NaiveDate,
    pub context: Option<String>,
    pub situation: String,
    pub style: ReasoningStyle,
    pub steps: Vec<StepAction>,
    pub decision: String,
    pub confidence: ConclusionConfidence,
}

impl From<&ReasoningTrace> for TraceSummary {
    fn from(trace: &ReasoningTrace) -> Self {
        Self {
            trace_id: trace.id.clone(),
            date: trace.source.date,
            context: trace.source.context.clone(),
            situation: trace.trigger.situation.clone(),
            style: trace.reasoning_path.style,
            steps: trace.reasoning_path.steps.iter().map(|s| s.action).collect(),
            decision: trace.conclusion.decision.clone(),
            confidence: trace.conclusion.confidence,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameSummary {
    pub frame_id: String,
    pub name: String,
    pub description: String,
    pub preferred_style: Option<ReasoningStyle>,
    pub tone: Option<Tone>,
}

impl From<&ContextFrame> for FrameSummary {
    fn from(frame: &ContextFrame) -> Self {
        Self {
            frame_id: frame.id.clone(),
            name: frame.name.clone(),
            description: frame.description.clone(),
            preferred_style: frame.patterns.preferred_style,
            tone: frame.voice.tone,
        }
    }
}

/// A tension seen from one conviction towards another
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TensionView {
    pub conviction_a: String,
    pub conviction_b: String,
    pub relationship: TensionKind,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Exploration {
    pub topic: String,
    pub depth: ExploreDepth,
    pub convictions: Vec<RelatedConviction>,
    pub traces: Vec<TraceSummary>,
    pub frames: Vec<FrameSummary>,
    pub tensions: Vec<TensionView>,
    pub raw_signals: Vec<RecallHit>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrengthPoint {
    pub generation: u64,
    pub computed_on: NaiveDate,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvictionTimeline {
    pub conviction_id: String,
    pub statement: String,
    pub current_strength: f32,
    pub current_level: StrengthLevel,
    pub trend: Trend,
    pub first_detected: NaiveDate,
    /// One point per retained generation where the score changed
    pub strength_history: Vec<StrengthPoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StylePeriod {
    /// `YYYY-MM`
    pub period: String,
    pub dominant_style: ReasoningStyle,
    pub counts: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Evolution {
    pub topic: String,
    pub convictions: Vec<ConvictionTimeline>,
    /// Oldest first
    pub traces: Vec<TraceSummary>,
    pub style_evolution: Vec<StylePeriod>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvictionNote {
    pub conviction_id: String,
    pub statement: String,
    pub strength: f32,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicBalance {
    pub topic: String,
    pub input_count: usize,
    pub output_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StyleShare {
    pub count: usize,
    pub ratio: f32,
}

/// One reasoning style dominating the trace history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThinkingInertia {
    pub dominant_style: ReasoningStyle,
    pub ratio: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Blindspots {
    /// Strong convictions never seen in an action or a trace
    pub say_do_gaps: Vec<ConvictionNote>,
    /// Convictions whose evidence is entirely the owner's own output
    pub output_only_convictions: Vec<ConvictionNote>,
    /// Topics the owner takes in but never speaks about
    pub input_heavy_topics: Vec<TopicBalance>,
    pub contradictions: Vec<TensionView>,
    pub style_distribution: BTreeMap<String, StyleShare>,
    pub thinking_inertia: Option<ThinkingInertia>,
    pub total_traces_analyzed: usize,
    pub total_convictions_analyzed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SharedConviction {
    pub conviction_id: String,
    pub statement: String,
    pub strength: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStrength {
    pub shared_convictions: usize,
    pub shared_traces: usize,
    pub shared_frames: usize,
    pub tension_links: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Connections {
    pub topic_a: String,
    pub topic_b: String,
    pub shared_convictions: Vec<SharedConviction>,
    pub shared_traces: Vec<TraceSummary>,
    pub shared_frames: Vec<FrameSummary>,
    pub tension_links: Vec<TensionView>,
    pub connection_strength: ConnectionStrength,
}

#[derive(Debug, Clone, Serialize)]
pub struct Simulation {
    pub scenario: String,
    pub context: Option<String>,
    pub simulation: String,
    pub triggered_frame: Option<String>,
    pub activated_convictions: Vec<String>,
    pub relevant_traces: usize,
    pub tensions_involved: usize,
    pub blindspot_warning: Option<ThinkingInertia>,
}

/// Read-only explorer over sessions, the record store and the generator
pub struct Explorer {
    config: ExplorerConfig,
    embedder: Arc<dyn Embedder>,
    records: Arc<dyn RecordStore>,
    generator: Arc<dyn Generator>,
}

impl Explorer {
    pub fn new(
        config: ExplorerConfig,
        embedder: Arc<dyn Embedder>,
        records: Arc<dyn RecordStore>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self {
            config,
            embedder,
            records,
            generator,
        }
    }

    /// Active signals nearest `text` that pass the metadata filters
    pub async fn recall(&self, owner: &str, text: &str, options: &RecallOptions) -> Result<Vec<RecallHit>> {
        let embedding = self.embedder.encode(text).await?;
        let limit = options.limit.unwrap_or(self.config.recall_limit);
        self.recall_embedded(owner, &embedding, options, limit).await
    }

    async fn recall_embedded(
        &self,
        owner: &str,
        embedding: &[f32],
        options: &RecallOptions,
        limit: usize,
    ) -> Result<Vec<RecallHit>> {
        let filter = SignalFilter {
            direction: options.direction,
            since: options.since,
            until: options.until,
            context: options.context.clone(),
            ..SignalFilter::active()
        };
        let hits = self
            .records
            .similarity_search(owner, embedding, &filter, limit)
            .await?;
        Ok(hits
            .into_iter()
            .map(|(signal, similarity)| RecallHit { signal, similarity })
            .collect())
    }

    pub async fn explore(&self, session: &QuerySession, topic: &str, depth: ExploreDepth) -> Result<Exploration> {
        let snapshot = &session.snapshot;
        let embedding = self.embedder.encode(topic).await?;
        let related = self.related_convictions(session, &embedding, self.config.explore_limit);

        let mut exploration = Exploration {
            topic: topic.to_string(),
            depth,
            convictions: related.iter().map(|(c, d)| related_view(c, *d)).collect(),
            traces: Vec::new(),
            frames: Vec::new(),
            tensions: Vec::new(),
            raw_signals: Vec::new(),
        };
        if depth == ExploreDepth::Lite {
            return Ok(exploration);
        }

        let related_ids: HashSet<&str> = related.iter().map(|(c, _)| c.id.as_str()).collect();
        exploration.traces = self
            .nearest_traces(session, &embedding, self.config.explore_limit)
            .into_iter()
            .map(TraceSummary::from)
            .collect();
        exploration.frames = frames_using(snapshot, &related_ids)
            .into_iter()
            .map(FrameSummary::from)
            .collect();
        exploration.tensions = related
            .iter()
            .flat_map(|(c, _)| tension_views(snapshot, c))
            .collect();
        exploration.raw_signals = self
            .recall_embedded(
                session.owner(),
                &embedding,
                &RecallOptions::default(),
                self.config.explore_signals,
            )
            .await?;

        tracing::debug!(
            "Explored '{}' for {}: {} convictions, {} traces, {} frames",
            topic,
            session.owner(),
            exploration.convictions.len(),
            exploration.traces.len(),
            exploration.frames.len()
        );
        Ok(exploration)
    }

    /// `history` holds the retained generations, oldest first.
    pub async fn evolution(&self, session: &QuerySession, topic: &str, history: &[Snapshot]) -> Result<Evolution> {
        let embedding = self.embedder.encode(topic).await?;
        let convictions = self
            .related_convictions(session, &embedding, self.config.evolution_convictions)
            .into_iter()
            .map(|(c, _)| ConvictionTimeline {
                conviction_id: c.id.clone(),
                statement: c.statement.clone(),
                current_strength: c.strength.score,
                current_level: c.strength.level,
                trend: c.strength.trend,
                first_detected: c.lifecycle.first_detected,
                strength_history: strength_history(&c.id, history),
            })
            .collect();

        let mut traces = self.nearest_traces(session, &embedding, self.config.evolution_traces);
        traces.sort_by(|a, b| a.source.date.cmp(&b.source.date).then_with(|| a.id.cmp(&b.id)));

        Ok(Evolution {
            topic: topic.to_string(),
            convictions,
            style_evolution: style_evolution(&traces),
            traces: traces.into_iter().map(TraceSummary::from).collect(),
        })
    }

    pub async fn blindspots(&self, session: &QuerySession) -> Result<Blindspots> {
        let snapshot = &session.snapshot;
        let config = &self.config;

        let acted_on: HashSet<&str> = snapshot
            .traces
            .iter()
            .flat_map(|t| t.activated_convictions.iter().map(|a| a.conviction_id.as_str()))
            .collect();
        let say_do_gaps = snapshot
            .active_convictions()
            .filter(|c| c.strength.score >= config.say_do_min_score)
            .filter(|c| c.evidence.action_alignment.is_empty() && !acted_on.contains(c.id.as_str()))
            .map(|c| note(c, "held strongly but never seen in an action or a decision"))
            .collect();

        let output_only_convictions = self.output_only(session).await?;
        let input_heavy_topics = self.input_heavy(session.owner()).await?;

        let mut seen_pairs = HashSet::new();
        let contradictions = snapshot
            .active_convictions()
            .flat_map(|c| c.tensions.iter().map(move |t| (c, t)))
            .filter(|(_, t)| t.relationship == TensionKind::Contradiction)
            .filter(|(c, t)| seen_pairs.insert(pair_key(&c.id, &t.opposing_id)))
            .map(|(c, t)| tension_view(snapshot, c, t))
            .collect();

        let total_traces = snapshot.traces.len();
        let mut counts: BTreeMap<ReasoningStyle, usize> = BTreeMap::new();
        for trace in &snapshot.traces {
            *counts.entry(trace.reasoning_path.style).or_default() += 1;
        }
        let style_distribution = counts
            .iter()
            .map(|(style, &count)| {
                let ratio = round2(count as f32 / total_traces as f32);
                (style.as_str().to_string(), StyleShare { count, ratio })
            })
            .collect();
        let thinking_inertia = dominant(&counts).and_then(|(style, count)| {
            let ratio = count as f32 / total_traces as f32;
            (total_traces > config.inertia_min_traces && ratio > config.inertia_ratio).then(|| ThinkingInertia {
                dominant_style: style,
                ratio: round2(ratio),
            })
        });

        Ok(Blindspots {
            say_do_gaps,
            output_only_convictions,
            input_heavy_topics,
            contradictions,
            style_distribution,
            thinking_inertia,
            total_traces_analyzed: total_traces,
            total_convictions_analyzed: snapshot.convictions.len(),
        })
    }

    pub async fn connections(&self, session: &QuerySession, topic_a: &str, topic_b: &str) -> Result<Connections> {
        let snapshot = &session.snapshot;
        let embeddings = self
            .embedder
            .encode_batch(&[topic_a.to_string(), topic_b.to_string()])
            .await?;
        let (embedding_a, embedding_b) = match embeddings.as_slice() {
            [a, b] => (a, b),
            _ => return Err(crate::error::Error::Embedding("expected two topic vectors".to_string())),
        };

        let k = self.config.connection_limit;
        let convictions_a: BTreeSet<&str> = self
            .related_convictions(session, embedding_a, k)
            .into_iter()
            .map(|(c, _)| c.id.as_str())
            .collect();
        let convictions_b: BTreeSet<&str> = self
            .related_convictions(session, embedding_b, k)
            .into_iter()
            .map(|(c, _)| c.id.as_str())
            .collect();
        let traces_a: BTreeSet<&str> = self
            .nearest_traces(session, embedding_a, k)
            .into_iter()
            .map(|t| t.id.as_str())
            .collect();
        let traces_b: BTreeSet<&str> = self
            .nearest_traces(session, embedding_b, k)
            .into_iter()
            .map(|t| t.id.as_str())
            .collect();

        let shared_convictions: Vec<SharedConviction> = convictions_a
            .intersection(&convictions_b)
            .filter_map(|id| snapshot.convictions.get(id))
            .map(|c| SharedConviction {
                conviction_id: c.id.clone(),
                statement: c.statement.clone(),
                strength: c.strength.score,
            })
            .collect();
        let shared_traces: Vec<TraceSummary> = traces_a
            .intersection(&traces_b)
            .filter_map(|id| snapshot.traces.get(id))
            .map(TraceSummary::from)
            .collect();

        let ids_a: HashSet<&str> = convictions_a.iter().copied().collect();
        let ids_b: HashSet<&str> = convictions_b.iter().copied().collect();
        let frames_b: HashSet<&str> = frames_using(snapshot, &ids_b).into_iter().map(|f| f.id.as_str()).collect();
        let shared_frames: Vec<FrameSummary> = frames_using(snapshot, &ids_a)
            .into_iter()
            .filter(|f| frames_b.contains(f.id.as_str()))
            .map(FrameSummary::from)
            .collect();

        let tension_links: Vec<TensionView> = convictions_a
            .iter()
            .filter_map(|id| snapshot.convictions.get(id))
            .flat_map(|c| c.tensions.iter().map(move |t| (c, t)))
            .filter(|(_, t)| ids_b.contains(t.opposing_id.as_str()))
            .map(|(c, t)| tension_view(snapshot, c, t))
            .collect();

        let connection_strength = ConnectionStrength {
            shared_convictions: shared_convictions.len(),
            shared_traces: shared_traces.len(),
            shared_frames: shared_frames.len(),
            tension_links: tension_links.len(),
        };
        Ok(Connections {
            topic_a: topic_a.to_string(),
            topic_b: topic_b.to_string(),
            shared_convictions,
            shared_traces,
            shared_frames,
            tension_links,
            connection_strength,
        })
    }

    /// Walk through a hypothetical scenario in the owner's voice
    pub async fn simulate(&self, session: &QuerySession, scenario: &str, context: Option<&str>) -> Result<Simulation> {
        let exploration = self.explore(session, scenario, ExploreDepth::Full).await?;
        let blindspots = self.blindspots(session).await?;

        let prompt = simulation_prompt(scenario, context, &exploration, &blindspots);
        let simulation = self.generator.complete(&prompt, Tier::Strong).await?;
        tracing::info!("Simulated scenario for {}", session.owner());

        Ok(Simulation {
            scenario: scenario.to_string(),
            context: context.map(str::to_string),
            simulation: simulation.trim().to_string(),
            triggered_frame: exploration.frames.first().map(|f| f.name.clone()),
            activated_convictions: exploration
                .convictions
                .iter()
                .take(5)
                .map(|c| c.statement.clone())
                .collect(),
            relevant_traces: exploration.traces.len(),
            tensions_involved: exploration.tensions.len(),
            blindspot_warning: blindspots.thinking_inertia,
        })
    }

    /// Active convictions within `relevance_distance`, nearest first
    fn related_convictions<'s>(
        &self,
        session: &'s QuerySession,
        embedding: &[f32],
        k: usize,
    ) -> Vec<(&'s Conviction, f32)> {
        let Some(index) = &session.index else {
            return Vec::new();
        };
        let snapshot = &session.snapshot;
        index
            .nearest(IndexKind::Convictions, embedding, k, |id| {
                snapshot.convictions.get(id).map_or(false, |c| c.is_active())
            })
            .into_iter()
            .filter(|(_, d)| *d < self.config.relevance_distance)
            .filter_map(|(id, d)| snapshot.convictions.get(&id).map(|c| (c, d)))
            .collect()
    }

    fn nearest_traces<'s>(&self, session: &'s QuerySession, embedding: &[f32], k: usize) -> Vec<&'s ReasoningTrace> {
        let Some(index) = &session.index else {
            return Vec::new();
        };
        let snapshot = &session.snapshot;
        index
            .nearest(IndexKind::Traces, embedding, k, |id| snapshot.traces.contains(id))
            .into_iter()
            .filter_map(|(id, _)| snapshot.traces.get(&id))
            .collect()
    }

    async fn output_only(&self, session: &QuerySession) -> Result<Vec<ConvictionNote>> {
        let candidates: Vec<(&Conviction, Vec<String>)> = session
            .snapshot
            .active_convictions()
            .filter(|c| c.strength.score >= self.config.output_only_min_score)
            .map(|c| (c, statement_evidence_ids(c)))
            .filter(|(_, ids)| !ids.is_empty())
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let all_ids: Vec<String> = candidates
            .iter()
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let directions: HashMap<String, Direction> = self
            .records
            .get_by_ids(session.owner(), &all_ids)
            .await?
            .into_iter()
            .map(|s| (s.id, s.direction))
            .collect();

        Ok(candidates
            .into_iter()
            .filter(|(_, ids)| {
                let found: Vec<Direction> = ids.iter().filter_map(|id| directions.get(id).copied()).collect();
                !found.is_empty() && found.iter().all(|d| *d == Direction::Output)
            })
            .map(|(c, _)| note(c, "only ever expressed by the owner, never corroborated by input"))
            .collect())
    }

    async fn input_heavy(&self, owner: &str) -> Result<Vec<TopicBalance>> {
        let mut balance: HashMap<String, (usize, usize)> = HashMap::new();
        for record in self.records.load_all(owner).await? {
            let signal = &record.signal;
            if !signal.is_active() {
                continue;
            }
            for topic in &signal.topics {
                let entry = balance.entry(topic.clone()).or_default();
                match signal.direction {
                    Direction::Input => entry.0 += 1,
                    Direction::Output => entry.1 += 1,
                }
            }
        }

        let mut topics: Vec<TopicBalance> = balance
            .into_iter()
            .filter(|(_, (input, output))| *input >= self.config.input_heavy_min_signals && *output == 0)
            .map(|(topic, (input_count, output_count))| TopicBalance {
                topic,
                input_count,
                output_count,
            })
            .collect();
        topics.sort_by(|a, b| b.input_count.cmp(&a.input_count).then_with(|| a.topic.cmp(&b.topic)));
        topics.truncate(self.config.input_heavy_top);
        Ok(topics)
    }
}

fn related_view(c: &Conviction, distance: f32) -> RelatedConviction {
    RelatedConviction {
        conviction_id: c.id.clone(),
        statement: c.statement.clone(),
        strength: c.strength.score,
        level: c.strength.level,
        trend: c.strength.trend,
        domains: c.domains.clone(),
        relevance: round2(1.0 - distance),
    }
}

fn note(c: &Conviction, text: &str) -> ConvictionNote {
    ConvictionNote {
        conviction_id: c.id.clone(),
        statement: c.statement.clone(),
        strength: c.strength.score,
        note: text.to_string(),
    }
}

/// Active frames whose primary profile uses one of `conviction_ids`
fn frames_using<'s>(snapshot: &'s Snapshot, conviction_ids: &HashSet<&str>) -> Vec<&'s ContextFrame> {
    snapshot
        .active_frames()
        .filter(|f| {
            f.profile
                .primary
                .iter()
                .any(|p| conviction_ids.contains(p.conviction_id.as_str()))
        })
        .collect()
}

/// Name the opposing side by statement when it exists
fn tension_view(snapshot: &Snapshot, c: &Conviction, t: &Tension) -> TensionView {
    TensionView {
        conviction_a: c.statement.clone(),
        conviction_b: snapshot
            .convictions
            .get(&t.opposing_id)
            .map_or_else(|| t.opposing_id.clone(), |o| o.statement.clone()),
        relationship: t.relationship,
        note: t.note.clone(),
    }
}

fn tension_views(snapshot: &Snapshot, c: &Conviction) -> Vec<TensionView> {
    c.tensions.iter().map(|t| tension_view(snapshot, c, t)).collect()
}

/// Signal ids from the statement-type evidence categories
fn statement_evidence_ids(c: &Conviction) -> Vec<String> {
    let evidence = &c.evidence;
    let ids: BTreeSet<&String> = evidence
        .temporal_persistence
        .iter()
        .flat_map(|e| e.signal_ids.iter())
        .chain(evidence.cross_context_consistency.iter().flat_map(|e| e.signal_ids.iter()))
        .chain(evidence.spontaneous_mentions.iter().map(|e| &e.signal_id))
        .collect();
    ids.into_iter().cloned().collect()
}

fn strength_history(conviction_id: &str, history: &[Snapshot]) -> Vec<StrengthPoint> {
    let mut points: Vec<StrengthPoint> = Vec::new();
    for snapshot in history {
        let Some(c) = snapshot.convictions.get(conviction_id) else {
            continue;
        };
        let point = StrengthPoint {
            generation: snapshot.generation,
            computed_on: c.strength.last_computed,
            score: c.strength.score,
        };
        let unchanged = points
            .last()
            .map_or(false, |p| p.score == point.score && p.computed_on == point.computed_on);
        if !unchanged {
            points.push(point);
        }
    }
    points
}

/// Style counts per calendar month, for traces already sorted by date
fn style_evolution(traces: &[&ReasoningTrace]) -> Vec<StylePeriod> {
    let mut periods: BTreeMap<String, BTreeMap<ReasoningStyle, usize>> = BTreeMap::new();
    for trace in traces {
        *periods
            .entry(trace.source.date.format("%Y-%m").to_string())
            .or_default()
            .entry(trace.reasoning_path.style)
            .or_default() += 1;
    }
    periods
        .into_iter()
        .filter_map(|(period, counts)| {
            let (dominant_style, _) = dominant(&counts)?;
            Some(StylePeriod {
                period,
                dominant_style,
                counts: counts.iter().map(|(s, n)| (s.as_str().to_string(), *n)).collect(),
            })
        })
        .collect()
}

/// Most frequent style; ties go to the first style in declaration order
fn dominant(counts: &BTreeMap<ReasoningStyle, usize>) -> Option<(ReasoningStyle, usize)> {
    counts
        .iter()
        .fold(None, |best: Option<(ReasoningStyle, usize)>, (&style, &count)| match best {
            Some((_, n)) if n >= count => best,
            _ => Some((style, count)),
        })
}

fn round2(value: f32) -> f32 {
    (value * 100.0).round() / 100.0
}

fn simulation_prompt(
    scenario: &str,
    context: Option<&str>,
    exploration: &Exploration,
    blindspots: &Blindspots,
) -> String {
    let convictions = if exploration.convictions.is_empty() {
        "(none on record)".to_string()
    } else {
        exploration
            .convictions
            .iter()
            .take(8)
            .map(|c| format!("- {} (strength: {:.2})", c.statement, c.strength))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let traces = exploration
        .traces
        .iter()
        .take(5)
        .map(|t| format!("- [{}] {} -> {}", t.date, t.situation, t.decision))
        .collect::<Vec<_>>()
        .join("\n");
    let frame = exploration
        .frames
        .first()
        .map(|f| {
            let style = f.preferred_style.map(|s| s.as_str()).unwrap_or("unknown");
            format!("Situational frame: {}\nReasoning style: {}\n", f.name, style)
        })
        .unwrap_or_default();
    let tensions = exploration
        .tensions
        .iter()
        .take(5)
        .map(|t| format!("- {} <-> {}", t.conviction_a, t.conviction_b))
        .collect::<Vec<_>>()
        .join("\n");
    let inertia = blindspots
        .thinking_inertia
        .as_ref()
        .map(|i| {
            format!(
                "Known tendency: relies on {} reasoning in {:.0}% of decisions.\n",
                i.dominant_style.as_str(),
                i.ratio * 100.0
            )
        })
        .unwrap_or_default();
    let context = context
        .map(|c| format!("Context: {}\n", c))
        .unwrap_or_default();

    format!(
        "You are simulating how one person would react to a hypothetical scenario, \
         using only their recorded beliefs and past decisions.\n\n\
         Scenario: {scenario}\n{context}\n\
         Relevant convictions:\n{convictions}\n\n\
         Past decisions:\n{traces}\n\n\
         {frame}\
         Tensions:\n{tensions}\n\n\
         {inertia}\n\
         Describe, in the first person:\n\
         1. First reaction\n\
         2. Reasoning path\n\
         3. Likely decision\n\
         4. What would probably be overlooked\n\
         5. Any internal conflict\n",
        scenario = scenario,
        context = context,
        convictions = convictions,
        traces = traces,
        frame = frame,
        tensions = tensions,
        inertia = inertia,
    )
}
