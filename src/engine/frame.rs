//! Context frame rebuild
//!
//! Traces are embedded from a short feature text, clustered, and every
//! sufficiently large cluster becomes a frame: behavioral statistics are
//! computed locally, name/description/triggers/tone come from one
//! generation call per cluster. The frame layer is replaced wholesale.

use super::parse::parse_json_object;
use super::Services;
use crate::backend::Tier;
use crate::cluster::agglomerative;
use crate::config::FrameConfig;
use crate::error::Result;
use crate::model::*;
use crate::store::Snapshot;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

const MAX_TRIGGER_PATTERNS: usize = 4;
const MAX_TYPICAL_STEPS: usize = 5;
const MAX_FEATURE_CONVICTIONS: usize = 3;

#[derive(Debug, Clone, Default, Serialize)]
pub struct FrameReport {
    pub traces: usize,
    pub clusters: usize,
    pub qualified: usize,
    pub skipped: usize,
    pub frames: Vec<String>,
    pub replaced: usize,
}

/// Statistics of one trace cluster
struct ClusterStats {
    trace_ids: Vec<String>,
    activations: Vec<ConvictionActivation>,
    preferred_style: Option<ReasoningStyle>,
    typical_steps: Vec<String>,
    triggers: Vec<(StimulusType, usize)>,
    effectiveness: FrameEffectiveness,
    first: Option<NaiveDate>,
    last: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct RawFrameMeta {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    trigger_patterns: Vec<TriggerPattern>,
    #[serde(default)]
    tone: Option<String>,
}

pub struct FrameEngine {
    config: FrameConfig,
    services: Services,
}

impl FrameEngine {
    pub fn new(config: FrameConfig, services: Services) -> Self {
        Self { config, services }
    }

    /// Rebuild the frame layer from all traces in `snapshot`
    pub async fn rebuild(&self, snapshot: &mut Snapshot, today: NaiveDate) -> Result<FrameReport> {
        let mut report = FrameReport {
            traces: snapshot.traces.len(),
            replaced: snapshot.frames.len(),
            ..FrameReport::default()
        };

        let view: &Snapshot = snapshot;
        let mut traces: Vec<&ReasoningTrace> = view.traces.iter().collect();
        traces.sort_by(|a, b| a.id.cmp(&b.id));

        let mut frames: Vec<(ContextFrame, Vec<String>)> = Vec::new();
        if traces.len() >= self.config.min_cluster_size {
            let texts: Vec<String> = traces.iter().map(|t| feature_text(t, view)).collect();
            let vectors = self.services.embedder.encode_batch(&texts).await?;
            let clusters: Vec<Vec<usize>> = agglomerative(&vectors, self.config.similarity_threshold)
                .into_iter()
                .filter(|c| c.len() >= self.config.min_cluster_size)
                .collect();
            report.clusters = clusters.len();
            report.qualified = clusters.len();

            let stats: Vec<ClusterStats> = clusters
                .iter()
                .map(|c| {
                    let members: Vec<&ReasoningTrace> = c.iter().map(|&i| traces[i]).collect();
                    self.analyze(&members, view)
                })
                .collect();
            let prompts: Vec<String> = stats.iter().map(|s| metadata_prompt(s, view)).collect();
            let answers = self
                .services
                .generator
                .complete_batch(&prompts, Tier::Light, self.services.concurrency)
                .await;

            for (stats, answer) in stats.into_iter().zip(answers) {
                let meta = match answer {
                    Ok(text) => parse_json_object::<RawFrameMeta>(&text),
                    Err(e) => {
                        tracing::warn!("Failed to generate frame metadata: {}", e);
                        None
                    }
                };
                let Some(meta) = meta.filter(|m| !m.name.trim().is_empty()) else {
                    tracing::warn!("Skipping frame of {} traces: no usable metadata", stats.trace_ids.len());
                    report.skipped += 1;
                    continue;
                };
                frames.push(self.build_frame(&view.owner, meta, &stats, today));
            }
        }

        // Replace the layer and re-point traces
        let mut membership: HashMap<String, String> = HashMap::new();
        snapshot.frames = Arena::new();
        for (frame, members) in frames {
            for trace_id in members {
                membership.insert(trace_id, frame.id.clone());
            }
            report.frames.push(frame.id.clone());
            snapshot.frames.insert(frame);
        }
        for trace in snapshot.traces.iter_mut() {
            trace.context_frame_id = membership.get(&trace.id).cloned();
        }
        prune_identity_frames(snapshot);

        tracing::info!(
            "Frame rebuild for {}: {} traces, {} clusters, {} frames, {} skipped",
            snapshot.owner,
            report.traces,
            report.clusters,
            report.frames.len(),
            report.skipped
        );
        Ok(report)
    }

    fn analyze(&self, members: &[&ReasoningTrace], snapshot: &Snapshot) -> ClusterStats {
        let total = members.len().max(1) as f32;

        // conviction id → (trace count, role counts)
        let mut usage: Vec<(String, usize, HashMap<Role, usize>)> = Vec::new();
        for trace in members {
            let mut seen = HashSet::new();
            for ac in &trace.activated_convictions {
                if !snapshot.convictions.contains(&ac.conviction_id) {
                    continue;
                }
                let pos = match usage.iter().position(|(id, _, _)| *id == ac.conviction_id) {
                    Some(pos) => pos,
                    None => {
                        usage.push((ac.conviction_id.clone(), 0, HashMap::new()));
                        usage.len() - 1
                    }
                };
                if seen.insert(ac.conviction_id.as_str()) {
                    usage[pos].1 += 1;
                }
                *usage[pos].2.entry(ac.role).or_default() += 1;
            }
        }
        usage.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let activations = usage
            .into_iter()
            .map(|(id, count, roles)| ConvictionActivation {
                conviction_id: id,
                weight: ((count as f32 / total) * 100.0).round() / 100.0,
                typical_role: most_common(roles.into_iter()),
            })
            .filter(|a| a.weight >= self.config.min_weight)
            .take(self.config.max_primary)
            .collect();

        let preferred_style = most_common(
            count_all(members.iter().map(|t| t.reasoning_path.style)).into_iter(),
        );

        let mut steps: Vec<(&'static str, usize)> = Vec::new();
        for action in members.iter().flat_map(|t| t.reasoning_path.steps.iter().map(|s| s.action)) {
            match steps.iter_mut().find(|(a, _)| *a == action.as_str()) {
                Some((_, n)) => *n += 1,
                None => steps.push((action.as_str(), 1)),
            }
        }
        steps.sort_by(|a, b| b.1.cmp(&a.1));
        let typical_steps = steps
            .into_iter()
            .take(MAX_TYPICAL_STEPS)
            .map(|(s, _)| s.to_string())
            .collect();

        let mut triggers: Vec<(StimulusType, usize)> = Vec::new();
        for stimulus in members.iter().map(|t| t.trigger.stimulus_type) {
            match triggers.iter_mut().find(|(s, _)| *s == stimulus) {
                Some((_, n)) => *n += 1,
                None => triggers.push((stimulus, 1)),
            }
        }
        triggers.sort_by(|a, b| b.1.cmp(&a.1));

        let positive = members
            .iter()
            .filter(|t| matches!(&t.outcome, Some(o) if o.result == OutcomeResult::Positive))
            .count();
        let negative = members
            .iter()
            .filter(|t| matches!(&t.outcome, Some(o) if o.result == OutcomeResult::Negative))
            .count();
        let definite = members.iter().filter(|t| t.has_definite_outcome()).count();
        let success_rate = if definite > 0 {
            Some(((positive as f32 / definite as f32) * 100.0).round() / 100.0)
        } else {
            None
        };

        ClusterStats {
            trace_ids: members.iter().map(|t| t.id.clone()).collect(),
            activations,
            preferred_style,
            typical_steps,
            triggers,
            effectiveness: FrameEffectiveness {
                success_rate,
                total_traces: members.len(),
                positive,
                negative,
            },
            first: members.iter().map(|t| t.source.date).min(),
            last: members.iter().map(|t| t.source.date).max(),
        }
    }

    /// Returns the frame and the ids of its member traces
    fn build_frame(
        &self,
        owner: &str,
        meta: RawFrameMeta,
        stats: &ClusterStats,
        today: NaiveDate,
    ) -> (ContextFrame, Vec<String>) {
        let trigger_patterns = meta
            .trigger_patterns
            .into_iter()
            .filter(|p| !p.pattern.trim().is_empty())
            .take(MAX_TRIGGER_PATTERNS)
            .collect();
        let frame = ContextFrame {
            owner: owner.to_string(),
            id: short_id("frame"),
            name: meta.name.trim().to_string(),
            description: meta.description.trim().to_string(),
            trigger_patterns,
            profile: ConvictionProfile {
                primary: stats.activations.clone(),
                suppressed: Vec::new(),
            },
            patterns: FramePatterns {
                preferred_style: stats.preferred_style,
                typical_steps: stats.typical_steps.clone(),
                historical_traces: stats
                    .trace_ids
                    .iter()
                    .take(self.config.max_historical_traces)
                    .cloned()
                    .collect(),
            },
            voice: FrameVoice {
                tone: meta.tone.as_deref().and_then(Tone::parse),
                ..FrameVoice::default()
            },
            effectiveness: stats.effectiveness.clone(),
            lifecycle: FrameLifecycle {
                status: FrameStatus::Active,
                first_observed: stats.first.or(Some(today)),
                last_activated: stats.last.or(Some(today)),
            },
        };
        (frame, stats.trace_ids.clone())
    }
}

/// Text a trace is embedded from for clustering
pub fn feature_text(trace: &ReasoningTrace, snapshot: &Snapshot) -> String {
    let statements: Vec<&str> = trace
        .activated_convictions
        .iter()
        .filter_map(|ac| snapshot.convictions.get(&ac.conviction_id))
        .take(MAX_FEATURE_CONVICTIONS)
        .map(|c| c.statement.as_str())
        .collect();
    format!(
        "{} {} {} style:{} stimulus:{}",
        trace.trigger.situation,
        trace.conclusion.decision,
        statements.join(" "),
        trace.reasoning_path.style.as_str(),
        trace.trigger.stimulus_type.as_str()
    )
}

/// Drop identity references to frames that no longer exist
fn prune_identity_frames(snapshot: &mut Snapshot) {
    let frame_ids: HashSet<String> = snapshot.frames.ids().map(str::to_string).collect();
    for identity in snapshot.identities.iter_mut() {
        identity
            .universality
            .active_in_frames
            .retain(|f| frame_ids.contains(f));
        identity.expressions.retain(|e| frame_ids.contains(&e.frame_id));
    }
}

fn count_all<T: std::hash::Hash + Eq>(items: impl Iterator<Item = T>) -> HashMap<T, usize> {
    let mut counts = HashMap::new();
    for item in items {
        *counts.entry(item).or_default() += 1;
    }
    counts
}

/// Most frequent key; ties go to the smallest key
fn most_common<T: Ord + Copy>(counts: impl Iterator<Item = (T, usize)>) -> Option<T> {
    counts
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map(|(k, _)| k)
}

fn metadata_prompt(stats: &ClusterStats, snapshot: &Snapshot) -> String {
    let total = stats.trace_ids.len();
    let convictions: Vec<String> = stats
        .activations
        .iter()
        .take(5)
        .map(|a| {
            let statement = snapshot
                .convictions
                .get(&a.conviction_id)
                .map(|c| c.statement.as_str())
                .unwrap_or(a.conviction_id.as_str());
            format!("- {} (weight {:.2})", statement, a.weight)
        })
        .collect();
    let triggers: Vec<String> = stats
        .triggers
        .iter()
        .take(5)
        .map(|(t, n)| format!("- {}: {} times", t.as_str(), n))
        .collect();
    let style = stats
        .preferred_style
        .map(|s| s.as_str())
        .unwrap_or("mixed");

    format!(
        r#"Below are statistics of how one person reasons in a recurring kind of situation.

Reasoning episodes: {total}
Main beliefs:
{convictions}

Trigger types:
{triggers}

Preferred style: {style}
Typical steps: {steps}

Generate for this situational frame:
1. name: a short frame name (at most 6 words)
2. description: how this person behaves in this situation (at most 60 words)
3. trigger_patterns: 2-4 patterns, each with a pattern description and 2-3 keywords
4. tone: one of professional/warm/direct/patient/passionate/casual/authoritative

Output JSON (no markdown):
{{"name": "...", "description": "...", "trigger_patterns": [{{"pattern": "...", "keywords": ["...", "..."]}}], "tone": "..."}}"#,
        total = total,
        convictions = convictions.join("\n"),
        triggers = triggers.join("\n"),
        style = style,
        steps = stats.typical_steps.join(", "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use std::sync::Arc;

    const META: &str = r#"{"name": "Pricing talks", "description": "Holds firm on price", "trigger_patterns": [
        {"pattern": "discount request", "keywords": ["discount", "cheaper"]},
        {"pattern": "b", "keywords": []}, {"pattern": "c", "keywords": []},
        {"pattern": "d", "keywords": []}, {"pattern": "e", "keywords": []}], "tone": "Direct"}"#;

    /// Six traces in two tight groups; group one activates conv_a in all
    /// traces and conv_b in one
    fn fixture() -> (Snapshot, StubEmbedder) {
        let mut snapshot = Snapshot::empty(OWNER);
        snapshot.convictions.insert(make_conviction("conv_a", "Price reflects value", 0.8));
        snapshot.convictions.insert(make_conviction("conv_b", "Listen first", 0.6));
        let mut embedder = StubEmbedder::new(8);
        for (i, day) in [1u32, 2, 3].iter().enumerate() {
            let ids: Vec<&str> = if i == 0 { vec!["conv_a", "conv_b"] } else { vec!["conv_a"] };
            let mut trace = make_trace(&format!("trace_p{i}"), &ids, *day);
            if i == 0 {
                trace.outcome = Some(TraceOutcome {
                    result: OutcomeResult::Positive,
                    note: None,
                    conviction_impact: vec![],
                    recorded_at: date(10),
                });
            }
            embedder.set(&feature_text(&trace, &snapshot), angle_vector(i as f32, 8));
            snapshot.traces.insert(trace);
        }
        for i in 0..3 {
            let trace = make_trace(&format!("trace_t{i}"), &["conv_b"], 5);
            embedder.set(&feature_text(&trace, &snapshot), angle_vector(90.0 + i as f32, 8));
            snapshot.traces.insert(trace);
        }
        (snapshot, embedder)
    }

    fn engine(embedder: StubEmbedder, generator: ScriptedGenerator) -> FrameEngine {
        let services = Services {
            embedder: Arc::new(embedder),
            generator: Arc::new(generator),
            concurrency: 2,
        };
        FrameEngine::new(FrameConfig::default(), services)
    }

    #[tokio::test]
    async fn test_rebuild_builds_frames_with_statistics() {
        let (mut snapshot, embedder) = fixture();
        snapshot.frames.insert(make_frame("frame_old", &[], &[]));
        snapshot.identities.insert(make_identity("id_001", "conv_a", &["frame_old"]));

        let engine = engine(embedder, ScriptedGenerator::new(META));
        let report = engine.rebuild(&mut snapshot, date(20)).await.unwrap();

        assert_eq!(report.clusters, 2);
        assert_eq!(report.frames.len(), 2);
        assert_eq!(report.replaced, 1);
        assert!(!snapshot.frames.contains("frame_old"));

        let pricing = snapshot
            .frames
            .iter()
            .find(|f| f.patterns.historical_traces.contains(&"trace_p0".to_string()))
            .unwrap();
        assert_eq!(pricing.name, "Pricing talks");
        assert_eq!(pricing.trigger_patterns.len(), 4);
        assert_eq!(pricing.voice.tone, Some(Tone::Direct));
        assert_eq!(pricing.profile.primary[0].conviction_id, "conv_a");
        assert!((pricing.profile.primary[0].weight - 1.0).abs() < 1e-6);
        assert!((pricing.profile.primary[1].weight - 0.33).abs() < 1e-6);
        assert_eq!(pricing.profile.primary[0].typical_role, Some(Role::Premise));
        assert_eq!(pricing.effectiveness.success_rate, Some(1.0));
        assert_eq!(pricing.effectiveness.total_traces, 3);
        assert_eq!(pricing.lifecycle.first_observed, Some(date(1)));
        assert_eq!(pricing.lifecycle.last_activated, Some(date(3)));
        assert_eq!(pricing.patterns.typical_steps, vec!["analyze"]);

        for trace in &snapshot.traces {
            let frame_id = trace.context_frame_id.as_deref().unwrap();
            let frame = snapshot.frames.get(frame_id).unwrap();
            assert!(frame.patterns.historical_traces.contains(&trace.id));
        }
        let identity = snapshot.identities.get("id_001").unwrap();
        assert!(identity.universality.active_in_frames.is_empty());
        assert!(snapshot.dangling_references().is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_membership_is_deterministic() {
        let (mut first, embedder) = fixture();
        let engine = engine(embedder, ScriptedGenerator::new(META));
        engine.rebuild(&mut first, date(20)).await.unwrap();
        let mut second = first.clone();
        engine.rebuild(&mut second, date(20)).await.unwrap();

        let members = |s: &Snapshot| {
            let mut groups: Vec<Vec<String>> = s
                .frames
                .iter()
                .map(|f| f.patterns.historical_traces.clone())
                .collect();
            groups.sort();
            groups
        };
        assert_eq!(members(&first), members(&second));
    }

    #[tokio::test]
    async fn test_malformed_metadata_skips_cluster() {
        let (mut snapshot, embedder) = fixture();
        let generator =
            ScriptedGenerator::new("Sorry, here is a name: Pricing").rule("Price reflects value", META);
        let engine = engine(embedder, generator);
        let report = engine.rebuild(&mut snapshot, date(20)).await.unwrap();
        // only the cluster whose prompt lists conv_a's statement parses
        assert_eq!(report.skipped, 1);
        assert_eq!(report.frames.len(), 1);
        assert!(snapshot
            .traces
            .iter()
            .filter(|t| t.id.starts_with("trace_t"))
            .all(|t| t.context_frame_id.is_none()));
    }

    #[tokio::test]
    async fn test_too_few_traces_clears_frames() {
        let mut snapshot = Snapshot::empty(OWNER);
        snapshot.traces.insert(make_trace("trace_1", &[], 1));
        snapshot.frames.insert(make_frame("frame_old", &[], &["trace_1"]));
        let engine = engine(StubEmbedder::new(8), ScriptedGenerator::new(META));
        let report = engine.rebuild(&mut snapshot, date(2)).await.unwrap();
        assert!(report.frames.is_empty());
        assert!(snapshot.frames.is_empty());
    }

    #[test]
    fn test_most_common_tie_breaks_low() {
        let counts = vec![(Role::Framework, 2), (Role::Premise, 2), (Role::Evidence, 1)];
        assert_eq!(most_common(counts.into_iter()), Some(Role::Premise));
    }
}
