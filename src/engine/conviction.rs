//! Conviction detection
//!
//! ```text
//! active signals ──cluster──► clusters ──resonance──► qualified clusters
//!                                                        │
//!                     ┌──── mean ≈ existing statement ───┤
//!                     ▼                                  ▼
//!              reinforce in place              new statement (light tier)
//!                     └──────────────┬───────────────────┘
//!                                    ▼
//!                  recompute every strength from its evidence
//! ```

use super::parse::{clean_line, truncate_chars};
use super::Services;
use crate::backend::{StoredSignal, Tier};
use crate::cluster::{agglomerative, cosine_similarity, mean_vector, normalize};
use crate::config::ConvictionConfig;
use crate::error::Result;
use crate::model::*;
use crate::store::Snapshot;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Phrases marking a statement as the generator talking about itself
const SELF_REFERENCE_BLOCKLIST: &[&str] = &[
    "i need to",
    "i cannot",
    "i can't",
    "let me",
    "based on the above",
    "as an ai",
    "as a language model",
    "need more information",
    "cannot summarize",
    "unable to summarize",
    "these documents",
    "我需要先查看",
    "我需要先了解",
    "我需要查看",
    "我無法確定",
    "我無法判斷",
    "讓我先",
    "讓我查看",
    "根據以上",
    "根據這些",
    "需要更多資訊",
    "需要更多信息",
    "作為AI",
    "作為一個AI",
    "作為語言模型",
    "無法從這些",
    "無法歸納",
    "這些文件",
];

const MAX_PROMPT_SIGNALS: usize = 10;
const MAX_SPONTANEOUS: usize = 3;

/// Summary of one detection run
#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectReport {
    pub signals: usize,
    pub clusters: usize,
    pub qualified: usize,
    pub reinforced: Vec<String>,
    pub created: Vec<String>,
    pub skipped: usize,
    pub recomputed: usize,
}

impl DetectReport {
    pub fn changed(&self) -> bool {
        !self.reinforced.is_empty() || !self.created.is_empty() || self.recomputed > 0
    }
}

/// A cluster that passed the resonance checks
struct Qualified<'a> {
    members: Vec<&'a Signal>,
    evidence: ResonanceEvidence,
    centroid: Vec<f32>,
}

pub struct ConvictionEngine {
    config: ConvictionConfig,
    services: Services,
}

impl ConvictionEngine {
    pub fn new(config: ConvictionConfig, services: Services) -> Self {
        Self { config, services }
    }

    /// Cluster the owner's active signals and create or reinforce
    /// convictions in `snapshot`.
    pub async fn detect(
        &self,
        snapshot: &mut Snapshot,
        records: &[StoredSignal],
        today: NaiveDate,
    ) -> Result<DetectReport> {
        let active: Vec<&StoredSignal> = records.iter().filter(|r| r.signal.is_active()).collect();
        let mut report = DetectReport {
            signals: active.len(),
            ..DetectReport::default()
        };
        if active.len() < 2 {
            return Ok(report);
        }

        let embeddings: Vec<&[f32]> = active.iter().map(|r| r.embedding.as_slice()).collect();
        let clusters = agglomerative(&embeddings, self.config.similarity_threshold);
        report.clusters = clusters.len();

        let mut qualified = Vec::new();
        for cluster in clusters {
            if cluster.len() < self.config.min_cluster_size {
                continue;
            }
            let members: Vec<&Signal> = cluster.iter().map(|&i| &active[i].signal).collect();
            let evidence = self.resonance(&members, today);
            if evidence.resonance_count() < self.config.min_resonance_count {
                tracing::debug!(
                    "Dropping cluster of {} signals: resonance {}",
                    members.len(),
                    evidence.resonance_count()
                );
                continue;
            }
            let vectors: Vec<&[f32]> = cluster.iter().map(|&i| embeddings[i]).collect();
            let mut centroid = mean_vector(&vectors);
            normalize(&mut centroid);
            qualified.push(Qualified {
                members,
                evidence,
                centroid,
            });
        }
        report.qualified = qualified.len();
        if qualified.is_empty() {
            self.recompute_all(snapshot, &active, &HashSet::new(), today, &mut report);
            return Ok(report);
        }

        // Existing statements, encoded once
        let existing: Vec<(String, String)> = snapshot
            .active_convictions()
            .map(|c| (c.id.clone(), c.statement.clone()))
            .collect();
        let existing_vectors = if existing.is_empty() {
            Vec::new()
        } else {
            let texts: Vec<String> = existing.iter().map(|(_, s)| s.clone()).collect();
            self.services.embedder.encode_batch(&texts).await?
        };

        let mut reinforced_ids: HashSet<String> = HashSet::new();
        let mut needs_statement = Vec::new();
        for cluster in qualified {
            let hit = existing.iter().zip(&existing_vectors).find(|((id, _), vector)| {
                !reinforced_ids.contains(id)
                    && cosine_similarity(&cluster.centroid, vector) > self.config.reinforce_similarity
            });
            match hit {
                Some(((id, _), _)) => {
                    if let Some(conviction) = snapshot.convictions.get_mut(id) {
                        conviction.evidence.absorb(&cluster.evidence);
                        conviction.lifecycle.last_reinforced = Some(today);
                        tracing::debug!("Reinforced {} from {} signals", id, cluster.members.len());
                    }
                    reinforced_ids.insert(id.clone());
                    report.reinforced.push(id.clone());
                }
                None => needs_statement.push(cluster),
            }
        }

        let mut created_ids = HashSet::new();
        if !needs_statement.is_empty() {
            let prompts: Vec<String> = needs_statement
                .iter()
                .map(|c| statement_prompt(&c.members))
                .collect();
            let answers = self
                .services
                .generator
                .complete_batch(&prompts, Tier::Light, self.services.concurrency)
                .await;

            for (cluster, answer) in needs_statement.into_iter().zip(answers) {
                let statement = match answer {
                    Ok(text) => match validate_statement(&text) {
                        Some(statement) => statement,
                        None => {
                            tracing::warn!("Discarding generated statement: {:?}", text);
                            report.skipped += 1;
                            continue;
                        }
                    },
                    Err(e) => {
                        tracing::warn!("Failed to generate conviction statement: {}", e);
                        report.skipped += 1;
                        continue;
                    }
                };

                let strength = Strength::compute(
                    cluster.evidence.resonance_count(),
                    &cluster.members,
                    None,
                    today,
                );
                let conviction = Conviction {
                    owner: snapshot.owner.clone(),
                    id: short_id("conv"),
                    statement,
                    variants: Vec::new(),
                    strength,
                    domains: top_domains(&cluster.members),
                    evidence: cluster.evidence,
                    tensions: Vec::new(),
                    lifecycle: ConvictionLifecycle {
                        status: ConvictionStatus::Active,
                        first_detected: today,
                        last_reinforced: Some(today),
                        superseded_by: None,
                    },
                };
                tracing::debug!("New conviction {}: {}", conviction.id, conviction.statement);
                created_ids.insert(conviction.id.clone());
                report.created.push(conviction.id.clone());
                snapshot.convictions.insert(conviction);
            }
        }

        self.recompute_all(snapshot, &active, &created_ids, today, &mut report);
        tracing::info!(
            "Conviction detection for {}: {} clusters, {} qualified, {} reinforced, {} created, {} skipped",
            snapshot.owner,
            report.clusters,
            report.qualified,
            report.reinforced.len(),
            report.created.len(),
            report.skipped
        );
        Ok(report)
    }

    /// Evaluate the five resonance checks for one cluster
    pub fn resonance(&self, members: &[&Signal], today: NaiveDate) -> ResonanceEvidence {
        let mut evidence = ResonanceEvidence::default();
        let ids: Vec<String> = members.iter().map(|s| s.id.clone()).collect();

        let first_input = members.iter().find(|s| s.direction == Direction::Input);
        let first_output = members.iter().find(|s| s.direction == Direction::Output);
        if let (Some(input), Some(output)) = (first_input, first_output) {
            evidence.input_output_convergence.push(InputOutputConvergence {
                input_signal: input.id.clone(),
                output_signal: output.id.clone(),
                detected_at: today,
            });
        }

        let dates: HashSet<NaiveDate> = members.iter().map(|s| s.source.date).collect();
        if let (Some(first), Some(last)) = (dates.iter().min(), dates.iter().max()) {
            let span = (*last - *first).num_days();
            if dates.len() >= 2 && span >= self.config.min_span_days {
                evidence.temporal_persistence.push(TemporalPersistence {
                    signal_ids: ids.clone(),
                    time_span_days: span,
                    first_date: *first,
                    last_date: *last,
                });
            }
        }

        let mut contexts: Vec<String> = members.iter().map(|s| s.source.context.clone()).collect();
        contexts.sort();
        contexts.dedup();
        if contexts.len() >= self.config.min_contexts {
            evidence.cross_context_consistency.push(CrossContextConsistency {
                signal_ids: ids,
                contexts,
            });
        }

        evidence.spontaneous_mentions = members
            .iter()
            .filter(|s| s.direction == Direction::Output && s.modality.is_spontaneous())
            .take(MAX_SPONTANEOUS)
            .map(|s| SpontaneousMention {
                signal_id: s.id.clone(),
            })
            .collect();

        let action = members.iter().find(|s| s.modality.is_action());
        let statement = members.iter().find(|s| !s.modality.is_action());
        if let (Some(statement), Some(action)) = (statement, action) {
            evidence.action_alignment.push(ActionAlignment {
                statement_signal: statement.id.clone(),
                action_signal: action.id.clone(),
            });
        }

        evidence
    }

    /// Recompute strength for every conviction from its accumulated evidence.
    /// Convictions created in this run already carry a fresh strength.
    fn recompute_all(
        &self,
        snapshot: &mut Snapshot,
        active: &[&StoredSignal],
        skip: &HashSet<String>,
        today: NaiveDate,
        report: &mut DetectReport,
    ) {
        let by_id: HashMap<&str, &Signal> = active
            .iter()
            .map(|r| (r.signal.id.as_str(), &r.signal))
            .collect();

        for conviction in snapshot.convictions.iter_mut() {
            if skip.contains(&conviction.id) {
                continue;
            }
            let found: Vec<&Signal> = conviction
                .evidence
                .signal_ids()
                .iter()
                .filter_map(|id| by_id.get(id.as_str()).copied())
                .collect();
            if found.is_empty() {
                continue;
            }
            conviction.strength = Strength::compute(
                conviction.evidence.resonance_count(),
                &found,
                Some(conviction.strength.score),
                today,
            );
            report.recomputed += 1;
        }
    }
}

/// Prompt asking for a one-sentence belief statement
fn statement_prompt(members: &[&Signal]) -> String {
    let lines: Vec<String> = members
        .iter()
        .take(MAX_PROMPT_SIGNALS)
        .map(|s| {
            format!(
                "- [{}/{}] {}",
                s.direction.as_str(),
                s.source.context,
                s.content.text
            )
        })
        .collect();
    format!(
        "Below are similar ideas one person expressed repeatedly in different situations:\n\n\
         {}\n\n\
         Summarize this person's core belief in one concise sentence (at most 50 words). \
         Output only the belief itself, without prefix or explanation.\n\n\
         Rules:\n\
         - You are describing this person's belief, not your own thoughts\n\
         - Never write self-referential phrases such as \"I need to\", \"I cannot\", \"Let me\" or \"Based on the above\"\n\
         - If the ideas are too scattered to form a clear belief, answer only SKIP",
        lines.join("\n")
    )
}

/// Validate a generated statement; `None` discards it
pub fn validate_statement(raw: &str) -> Option<String> {
    let statement = clean_line(raw);
    if statement.is_empty() || statement.to_uppercase().starts_with("SKIP") {
        return None;
    }
    let lowered = statement.to_lowercase();
    if SELF_REFERENCE_BLOCKLIST
        .iter()
        .any(|phrase| lowered.contains(&phrase.to_lowercase()))
    {
        return None;
    }
    Some(truncate_chars(&statement, MAX_STATEMENT_CHARS))
}

/// Three most frequent topics, ties by first appearance
fn top_domains(members: &[&Signal]) -> Vec<String> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for topic in members.iter().flat_map(|s| s.topics.iter()) {
        match counts.iter_mut().find(|(t, _)| t == topic) {
            Some((_, n)) => *n += 1,
            None => counts.push((topic.clone(), 1)),
        }
    }
    // stable sort keeps first-appearance order among ties
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    let domains: Vec<String> = counts.into_iter().take(3).map(|(t, _)| t).collect();
    if domains.is_empty() {
        vec!["general".to_string()]
    } else {
        domains
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use std::sync::Arc;

    fn engine(generator: ScriptedGenerator) -> ConvictionEngine {
        let services = Services {
            embedder: Arc::new(StubEmbedder::new(16)),
            generator: Arc::new(generator),
            concurrency: 2,
        };
        ConvictionEngine::new(ConvictionConfig::default(), services)
    }

    fn stored(signal: Signal, angle: f32) -> StoredSignal {
        StoredSignal {
            signal,
            embedding: angle_vector(angle, 16),
        }
    }

    /// 3 outputs and 2 inputs over 10 days in 2 contexts, all close together
    fn scenario_cluster(prefix: &str, angle: f32) -> Vec<StoredSignal> {
        vec![
            stored(make_signal(&format!("{prefix}1"), Direction::Output, Modality::WrittenDeliberate, 1, "work"), angle),
            stored(make_signal(&format!("{prefix}2"), Direction::Output, Modality::WrittenDeliberate, 4, "work"), angle + 1.0),
            stored(make_signal(&format!("{prefix}3"), Direction::Output, Modality::SpokenScripted, 11, "home"), angle + 2.0),
            stored(make_signal(&format!("{prefix}4"), Direction::Input, Modality::Consumed, 2, "work"), angle + 3.0),
            stored(make_signal(&format!("{prefix}5"), Direction::Input, Modality::Highlighted, 6, "home"), angle + 4.0),
        ]
    }

    #[test]
    fn test_resonance_scenario_scores_070() {
        let engine = engine(ScriptedGenerator::new("unused"));
        let records = scenario_cluster("s", 0.0);
        let members: Vec<&Signal> = records.iter().map(|r| &r.signal).collect();
        let evidence = engine.resonance(&members, date(20));

        assert_eq!(evidence.input_output_convergence.len(), 1);
        assert_eq!(evidence.input_output_convergence[0].input_signal, "s4");
        assert_eq!(evidence.input_output_convergence[0].output_signal, "s1");
        assert_eq!(evidence.temporal_persistence[0].time_span_days, 10);
        assert_eq!(evidence.cross_context_consistency[0].contexts, vec!["home", "work"]);
        assert!(evidence.spontaneous_mentions.is_empty());
        assert!(evidence.action_alignment.is_empty());
        assert_eq!(evidence.resonance_count(), 3);

        let strength = Strength::compute(evidence.resonance_count(), &members, None, date(20));
        assert!((strength.score - 0.70).abs() < 1e-6);
        assert_eq!(strength.level, StrengthLevel::Established);
    }

    #[test]
    fn test_resonance_spontaneous_and_action() {
        let engine = engine(ScriptedGenerator::new("unused"));
        let signals = vec![
            make_signal("a", Direction::Output, Modality::SpokenSpontaneous, 1, "work"),
            make_signal("b", Direction::Output, Modality::WrittenCasual, 1, "work"),
            make_signal("c", Direction::Output, Modality::Decided, 1, "work"),
        ];
        let members: Vec<&Signal> = signals.iter().collect();
        let evidence = engine.resonance(&members, date(2));
        assert_eq!(evidence.spontaneous_mentions.len(), 2);
        assert_eq!(evidence.action_alignment[0].statement_signal, "a");
        assert_eq!(evidence.action_alignment[0].action_signal, "c");
        assert!(evidence.input_output_convergence.is_empty());
        assert!(evidence.temporal_persistence.is_empty());
        assert_eq!(evidence.resonance_count(), 2);
    }

    #[tokio::test]
    async fn test_detect_creates_conviction() {
        let engine = engine(ScriptedGenerator::new("「Quality matters more than speed」"));
        let mut snapshot = Snapshot::empty(OWNER);
        let records = scenario_cluster("s", 0.0);

        let report = engine.detect(&mut snapshot, &records, date(20)).await.unwrap();
        assert_eq!(report.qualified, 1);
        assert_eq!(report.created.len(), 1);

        let conviction = snapshot.convictions.get(&report.created[0]).unwrap();
        assert_eq!(conviction.statement, "Quality matters more than speed");
        assert!(conviction.id.starts_with("conv_"));
        assert!((conviction.strength.score - 0.70).abs() < 1e-6);
        assert_eq!(conviction.strength.trend, Trend::Strengthening);
        assert_eq!(conviction.domains, vec!["general"]);
        assert_eq!(conviction.evidence.signal_ids().len(), 5);
    }

    #[tokio::test]
    async fn test_low_resonance_cluster_never_produces_conviction() {
        let generator = ScriptedGenerator::new("A belief");
        let engine = engine(generator);
        let mut snapshot = Snapshot::empty(OWNER);
        // Same day, same context, one direction: no check passes
        let records: Vec<StoredSignal> = (0..4)
            .map(|i| stored(make_signal(&format!("x{i}"), Direction::Output, Modality::WrittenDeliberate, 1, "work"), i as f32))
            .collect();

        let report = engine.detect(&mut snapshot, &records, date(2)).await.unwrap();
        assert_eq!(report.qualified, 0);
        assert!(snapshot.convictions.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_statements_skip_cluster() {
        let generator = ScriptedGenerator::new("SKIP");
        let engine = engine(generator);
        let mut snapshot = Snapshot::empty(OWNER);
        let mut records = scenario_cluster("a", 0.0);
        records.extend(scenario_cluster("b", 90.0));

        let report = engine.detect(&mut snapshot, &records, date(20)).await.unwrap();
        assert_eq!(report.qualified, 2);
        assert_eq!(report.skipped, 2);
        assert!(snapshot.convictions.is_empty());
    }

    #[tokio::test]
    async fn test_detect_reinforces_existing_statement() {
        let statement = "Quality matters more than speed";
        let services = Services {
            embedder: Arc::new(StubEmbedder::new(16).with(statement, angle_vector(2.0, 16))),
            generator: Arc::new(ScriptedGenerator::new("!ERR")),
            concurrency: 2,
        };
        let engine = ConvictionEngine::new(ConvictionConfig::default(), services);
        let mut snapshot = Snapshot::empty(OWNER);
        snapshot.convictions.insert(make_conviction("conv_q", statement, 0.3));

        let records = scenario_cluster("s", 0.0);
        let report = engine.detect(&mut snapshot, &records, date(20)).await.unwrap();
        assert_eq!(report.reinforced, vec!["conv_q"]);
        assert!(report.created.is_empty());

        let conviction = snapshot.convictions.get("conv_q").unwrap();
        assert_eq!(conviction.lifecycle.last_reinforced, Some(date(20)));
        assert_eq!(conviction.evidence.resonance_count(), 3);
        assert!((conviction.strength.score - 0.70).abs() < 1e-6);
        assert_eq!(conviction.strength.trend, Trend::Strengthening);
    }

    #[tokio::test]
    async fn test_too_few_signals_is_noop() {
        let engine = engine(ScriptedGenerator::new("A belief"));
        let mut snapshot = Snapshot::empty(OWNER);
        let records = vec![stored(make_signal("only", Direction::Output, Modality::Acted, 1, "w"), 0.0)];
        let report = engine.detect(&mut snapshot, &records, date(2)).await.unwrap();
        assert_eq!(report.clusters, 0);
        assert!(!report.changed());
    }

    #[test]
    fn test_validate_statement() {
        assert_eq!(validate_statement("  \"Be direct\" ").as_deref(), Some("Be direct"));
        assert!(validate_statement("").is_none());
        assert!(validate_statement("skip").is_none());
        assert!(validate_statement("Let me look at the files first").is_none());
        assert!(validate_statement("根據以上內容，他重視品質").is_none());
        let long = "x".repeat(500);
        assert_eq!(validate_statement(&long).unwrap().chars().count(), MAX_STATEMENT_CHARS);
    }

    #[test]
    fn test_top_domains() {
        let mut a = make_signal("a", Direction::Output, Modality::Acted, 1, "w");
        a.topics = vec!["sales".into(), "pricing".into()];
        let mut b = make_signal("b", Direction::Output, Modality::Acted, 1, "w");
        b.topics = vec!["pricing".into(), "team".into(), "hiring".into()];
        assert_eq!(top_domains(&[&a, &b]), vec!["pricing", "sales", "team"]);
        let c = make_signal("c", Direction::Output, Modality::Acted, 1, "w");
        assert_eq!(top_domains(&[&c]), vec!["general"]);
    }
}
