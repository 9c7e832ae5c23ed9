//! Identity promotion
//!
//! A conviction listed as a primary activation in nearly every active frame
//! is promoted to an identity-level invariant. The identity layer is
//! rebuilt from scratch on every run.

use super::parse::{parse_json_object, truncate_chars};
use super::Services;
use crate::backend::Tier;
use crate::config::IdentityConfig;
use crate::error::Result;
use crate::model::*;
use crate::store::Snapshot;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const MAX_PROMPT_FRAMES: usize = 8;
const MAX_FALLBACK_EXPRESSIONS: usize = 5;
const MAX_CORE_BELIEF_CHARS: usize = 150;
const MAX_EXPRESSION_CHARS: usize = 200;

#[derive(Debug, Clone, Default, Serialize)]
pub struct IdentityReport {
    pub active_frames: usize,
    pub fallback: bool,
    pub promoted: Vec<String>,
    pub templated_expressions: usize,
}

/// A conviction selected for promotion
struct Candidate {
    conviction_id: String,
    frame_ids: Vec<String>,
    coverage: f32,
}

#[derive(Debug, Deserialize)]
struct RawExpressions {
    #[serde(default)]
    expressions: Vec<Expression>,
}

pub struct IdentityPromoter {
    config: IdentityConfig,
    services: Services,
}

impl IdentityPromoter {
    pub fn new(config: IdentityConfig, services: Services) -> Self {
        Self { config, services }
    }

    /// Rebuild the identity layer from the active frames in `snapshot`
    pub async fn rebuild(&self, snapshot: &mut Snapshot) -> Result<IdentityReport> {
        let mut report = IdentityReport::default();
        let view: &Snapshot = snapshot;
        let frames: Vec<&ContextFrame> = view.active_frames().collect();
        report.active_frames = frames.len();

        let mut identities = Vec::new();
        if frames.len() >= self.config.min_frames {
            let (candidates, fallback) = self.select(view, &frames);
            report.fallback = fallback;

            let prompts: Vec<String> = candidates
                .iter()
                .filter_map(|c| view.convictions.get(&c.conviction_id))
                .map(|c| expression_prompt(c, &frames))
                .collect();
            let answers = self
                .services
                .generator
                .complete_batch(&prompts, Tier::Light, self.services.concurrency)
                .await;

            let frame_ids: HashSet<&str> = frames.iter().map(|f| f.id.as_str()).collect();
            for (seq, (candidate, answer)) in candidates.iter().zip(answers).enumerate() {
                let Some(conviction) = view.convictions.get(&candidate.conviction_id) else {
                    continue;
                };
                let mut expressions: Vec<Expression> = match answer {
                    Ok(text) => parse_json_object::<RawExpressions>(&text)
                        .map(|r| r.expressions)
                        .unwrap_or_default(),
                    Err(e) => {
                        tracing::warn!("Failed to generate expressions for {}: {}", conviction.id, e);
                        Vec::new()
                    }
                };
                expressions.retain(|e| frame_ids.contains(e.frame_id.as_str()));
                let mut seen = HashSet::new();
                expressions.retain(|e| seen.insert(e.frame_id.clone()));
                for expression in expressions.iter_mut() {
                    expression.how_it_manifests =
                        truncate_chars(expression.how_it_manifests.trim(), MAX_EXPRESSION_CHARS);
                }
                if expressions.is_empty() {
                    expressions = templated_expressions(conviction, &candidate.frame_ids);
                    report.templated_expressions += 1;
                }

                let identity = IdentityCore {
                    owner: view.owner.clone(),
                    id: format!("id_{:03}", seq + 1),
                    core_belief: truncate_chars(&conviction.statement, MAX_CORE_BELIEF_CHARS),
                    conviction_id: conviction.id.clone(),
                    universality: Universality {
                        active_in_frames: candidate.frame_ids.clone(),
                        total_active_frames: frames.len(),
                        coverage: (candidate.coverage * 100.0).round() / 100.0,
                    },
                    expressions,
                    non_negotiable: conviction.strength.score >= self.config.non_negotiable_score,
                    stability: Some(Stability {
                        held_since: conviction.lifecycle.first_detected,
                        consistency_score: conviction.strength.score,
                    }),
                };
                report.promoted.push(identity.conviction_id.clone());
                identities.push(identity);
            }
        }

        snapshot.identities = Arena::from_vec(identities);
        tracing::info!(
            "Identity rebuild for {}: {} active frames, {} promoted{}",
            snapshot.owner,
            report.active_frames,
            report.promoted.len(),
            if report.fallback { " (fallback)" } else { "" }
        );
        Ok(report)
    }

    /// Convictions above the coverage threshold, or the fallback top-N
    /// among those present in at least `min_frames` frames
    fn select(&self, snapshot: &Snapshot, frames: &[&ContextFrame]) -> (Vec<Candidate>, bool) {
        let mut by_conviction: Vec<(String, Vec<String>)> = Vec::new();
        for frame in frames {
            let mut seen = HashSet::new();
            for activation in &frame.profile.primary {
                if !seen.insert(activation.conviction_id.as_str()) {
                    continue;
                }
                match by_conviction.iter_mut().find(|(id, _)| *id == activation.conviction_id) {
                    Some((_, ids)) => ids.push(frame.id.clone()),
                    None => by_conviction.push((activation.conviction_id.clone(), vec![frame.id.clone()])),
                }
            }
        }

        let total = frames.len() as f32;
        let score = |id: &str| {
            snapshot
                .convictions
                .get(id)
                .map(|c| c.strength.score)
                .unwrap_or(0.0)
        };
        let mut all: Vec<Candidate> = by_conviction
            .into_iter()
            .filter(|(id, _)| snapshot.convictions.get(id).is_some_and(|c| c.is_active()))
            .map(|(conviction_id, frame_ids)| Candidate {
                coverage: frame_ids.len() as f32 / total,
                conviction_id,
                frame_ids,
            })
            .collect();
        all.sort_by(|a, b| {
            b.coverage
                .total_cmp(&a.coverage)
                .then_with(|| score(&b.conviction_id).total_cmp(&score(&a.conviction_id)))
                .then_with(|| a.conviction_id.cmp(&b.conviction_id))
        });

        let promoted: Vec<Candidate> = all
            .iter()
            .filter(|c| c.coverage >= self.config.coverage_threshold)
            .map(|c| Candidate {
                conviction_id: c.conviction_id.clone(),
                frame_ids: c.frame_ids.clone(),
                coverage: c.coverage,
            })
            .collect();
        if !promoted.is_empty() {
            return (promoted, false);
        }

        let fallback = all
            .into_iter()
            .filter(|c| c.frame_ids.len() >= self.config.min_frames)
            .take(self.config.fallback_top)
            .collect();
        (fallback, true)
    }
}

fn templated_expressions(conviction: &Conviction, frame_ids: &[String]) -> Vec<Expression> {
    let short = truncate_chars(&conviction.statement, 30);
    frame_ids
        .iter()
        .take(MAX_FALLBACK_EXPRESSIONS)
        .map(|frame_id| Expression {
            frame_id: frame_id.clone(),
            how_it_manifests: format!("Shows up here as \"{}\"", short),
        })
        .collect()
}

fn expression_prompt(conviction: &Conviction, frames: &[&ContextFrame]) -> String {
    let frame_lines: Vec<String> = frames
        .iter()
        .take(MAX_PROMPT_FRAMES)
        .map(|f| format!("- {}: {} ({})", f.id, f.name, truncate_chars(&f.description, 60)))
        .collect();
    format!(
        r#"Below is one of a person's core beliefs:
"{}"

These are the person's situational frames:
{}

Describe concretely how this belief shows up in each frame, one sentence per frame
(at most 30 words): how it shapes what the person does or says in that situation.

Output JSON (no markdown):
{{"expressions": [{{"frame_id": "...", "how_it_manifests": "..."}}]}}"#,
        conviction.statement,
        frame_lines.join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use std::sync::Arc;

    fn promoter(generator: ScriptedGenerator) -> IdentityPromoter {
        let services = Services {
            embedder: Arc::new(StubEmbedder::new(8)),
            generator: Arc::new(generator),
            concurrency: 2,
        };
        IdentityPromoter::new(IdentityConfig::default(), services)
    }

    /// conv_a in all 5 frames, conv_b in 4, conv_c in 2
    fn fixture() -> Snapshot {
        let mut snapshot = Snapshot::empty(OWNER);
        snapshot.convictions.insert(make_conviction("conv_a", "Honesty first", 0.95));
        snapshot.convictions.insert(make_conviction("conv_b", "Keep learning", 0.7));
        snapshot.convictions.insert(make_conviction("conv_c", "Move fast", 0.5));
        for i in 0..5 {
            let mut profile = vec![("conv_a", 0.9)];
            if i < 4 {
                profile.push(("conv_b", 0.5));
            }
            if i < 2 {
                profile.push(("conv_c", 0.3));
            }
            snapshot.frames.insert(make_frame(&format!("frame_{i}"), &profile, &[]));
        }
        snapshot
    }

    #[tokio::test]
    async fn test_promotes_high_coverage() {
        let mut snapshot = fixture();
        snapshot.identities.insert(make_identity("id_old", "conv_c", &[]));
        let generator = ScriptedGenerator::new(
            r#"{"expressions": [{"frame_id": "frame_0", "how_it_manifests": "Tells clients the truth"},
                {"frame_id": "frame_unknown", "how_it_manifests": "nope"}]}"#,
        );
        let report = promoter(generator).rebuild(&mut snapshot).await.unwrap();

        assert!(!report.fallback);
        assert_eq!(report.promoted, vec!["conv_a", "conv_b"]);
        assert!(!snapshot.identities.contains("id_old"));

        let first = snapshot.identities.get("id_001").unwrap();
        assert_eq!(first.conviction_id, "conv_a");
        assert!((first.universality.coverage - 1.0).abs() < 1e-6);
        assert_eq!(first.universality.total_active_frames, 5);
        assert!(first.non_negotiable);
        assert_eq!(first.expressions.len(), 1);
        assert_eq!(first.expressions[0].frame_id, "frame_0");

        let second = snapshot.identities.get("id_002").unwrap();
        assert!((second.universality.coverage - 0.8).abs() < 1e-6);
        assert!(!second.non_negotiable);
        assert!(snapshot.dangling_references().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_top_convictions() {
        let mut snapshot = Snapshot::empty(OWNER);
        snapshot.convictions.insert(make_conviction("conv_a", "A", 0.6));
        snapshot.convictions.insert(make_conviction("conv_b", "B", 0.8));
        snapshot.convictions.insert(make_conviction("conv_c", "C", 0.9));
        snapshot.frames.insert(make_frame("frame_0", &[("conv_a", 0.5), ("conv_b", 0.5), ("conv_c", 0.5)], &[]));
        snapshot.frames.insert(make_frame("frame_1", &[("conv_a", 0.5), ("conv_b", 0.5)], &[]));
        snapshot.frames.insert(make_frame("frame_2", &[("conv_x", 0.5)], &[]));

        let report = promoter(ScriptedGenerator::new("!ERR")).rebuild(&mut snapshot).await.unwrap();
        assert!(report.fallback);
        // equal coverage 2/3: stronger conviction first; conv_c is in one frame only
        assert_eq!(report.promoted, vec!["conv_b", "conv_a"]);
        assert_eq!(report.templated_expressions, 2);
        let identity = snapshot.identities.get("id_001").unwrap();
        assert_eq!(identity.expressions.len(), 2);
        assert!(identity.expressions[0].how_it_manifests.contains("B"));
    }

    #[tokio::test]
    async fn test_requires_two_active_frames() {
        let mut snapshot = Snapshot::empty(OWNER);
        snapshot.convictions.insert(make_conviction("conv_a", "A", 0.9));
        snapshot.frames.insert(make_frame("frame_0", &[("conv_a", 0.9)], &[]));
        let mut deprecated = make_frame("frame_1", &[("conv_a", 0.9)], &[]);
        deprecated.lifecycle.status = FrameStatus::Deprecated;
        snapshot.frames.insert(deprecated);

        let generator = ScriptedGenerator::new("{}");
        let report = promoter(generator).rebuild(&mut snapshot).await.unwrap();
        assert_eq!(report.active_frames, 1);
        assert!(report.promoted.is_empty());
        assert!(snapshot.identities.is_empty());
    }
}
