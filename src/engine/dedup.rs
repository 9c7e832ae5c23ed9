//! Duplicate conviction merging with cascading reference repair
//!
//! Candidates are pairs of statements whose embeddings are nearly identical.
//! A light-tier YES/NO call confirms each candidate. Confirmed secondaries
//! are folded into their primary and every reference to a removed id is
//! rewritten in the same snapshot, so a commit never exposes a dangling id.

use super::Services;
use crate::backend::Tier;
use crate::cluster::cosine_similarity;
use crate::config::DedupConfig;
use crate::error::Result;
use crate::model::*;
use crate::store::Snapshot;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

/// A pair of convictions above the similarity threshold
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub a: String,
    pub b: String,
    pub similarity: f32,
}

/// Which conviction survives a confirmed pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergePlan {
    pub primary: String,
    pub secondary: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupReport {
    pub dry_run: bool,
    pub candidates: Vec<Candidate>,
    pub confirmed: Vec<MergePlan>,
    /// Merges actually applied (empty in dry-run mode)
    pub merged: Vec<MergePlan>,
    /// Removed id → surviving id, resolved transitively
    pub id_map: BTreeMap<String, String>,
    pub traces_updated: usize,
    pub frames_updated: usize,
    pub identities_updated: usize,
    pub checked_pairs_removed: usize,
}

impl DedupReport {
    pub fn changed(&self) -> bool {
        !self.merged.is_empty()
    }
}

pub struct Deduplicator {
    config: DedupConfig,
    services: Services,
}

impl Deduplicator {
    pub fn new(config: DedupConfig, services: Services) -> Self {
        Self { config, services }
    }

    /// Find, confirm and merge duplicate convictions in `snapshot`.
    ///
    /// In dry-run mode the snapshot is left untouched and the report lists
    /// the intended primary/secondary choice for each confirmed pair.
    pub async fn dedupe(&self, snapshot: &mut Snapshot, dry_run: bool) -> Result<DedupReport> {
        let mut report = DedupReport {
            dry_run,
            ..DedupReport::default()
        };
        if snapshot.convictions.len() < 2 {
            return Ok(report);
        }

        report.candidates = self.find_candidates(snapshot).await?;
        if report.candidates.is_empty() {
            return Ok(report);
        }

        let prompts: Vec<String> = report
            .candidates
            .iter()
            .map(|c| {
                let a = statement_of(snapshot, &c.a);
                let b = statement_of(snapshot, &c.b);
                duplicate_prompt(a, b)
            })
            .collect();
        let answers = self
            .services
            .generator
            .complete_batch(&prompts, Tier::Light, self.services.concurrency)
            .await;

        for (candidate, answer) in report.candidates.iter().zip(answers) {
            let confirmed = match answer {
                Ok(text) => text.trim().to_uppercase().starts_with("YES"),
                Err(e) => {
                    tracing::warn!(
                        "Failed to confirm duplicate {} / {}: {}",
                        candidate.a,
                        candidate.b,
                        e
                    );
                    false
                }
            };
            if confirmed {
                if let Some(plan) = choose_primary(snapshot, candidate) {
                    report.confirmed.push(plan);
                }
            }
        }

        if dry_run || report.confirmed.is_empty() {
            return Ok(report);
        }

        let mut removed: HashSet<String> = HashSet::new();
        let mut id_map: HashMap<String, String> = HashMap::new();
        for plan in report.confirmed.clone() {
            if removed.contains(&plan.primary) || removed.contains(&plan.secondary) {
                tracing::debug!(
                    "Skipping pair {} / {}: already merged",
                    plan.primary,
                    plan.secondary
                );
                continue;
            }
            merge_into(snapshot, &plan.primary, &plan.secondary, &id_map);
            removed.insert(plan.secondary.clone());
            id_map.insert(plan.secondary.clone(), plan.primary.clone());
            report.merged.push(plan);
        }

        let resolved: HashMap<String, String> = id_map
            .keys()
            .map(|id| (id.clone(), resolve(&id_map, id).to_string()))
            .collect();
        self.repair_references(snapshot, &resolved, &removed, &mut report);
        snapshot.verify_removed(&removed)?;

        report.id_map = resolved.into_iter().collect();
        tracing::info!(
            "Merged {} duplicate convictions for {} ({} traces, {} frames, {} identities updated)",
            report.merged.len(),
            snapshot.owner,
            report.traces_updated,
            report.frames_updated,
            report.identities_updated
        );
        Ok(report)
    }

    /// Pairs above the threshold, most similar first, ties by id pair
    async fn find_candidates(&self, snapshot: &Snapshot) -> Result<Vec<Candidate>> {
        let convictions = snapshot.convictions.as_slice();
        let texts: Vec<String> = convictions.iter().map(|c| c.statement.clone()).collect();
        let vectors = self.services.embedder.encode_batch(&texts).await?;

        let mut candidates = Vec::new();
        for i in 0..convictions.len() {
            for j in (i + 1)..convictions.len() {
                let similarity = cosine_similarity(&vectors[i], &vectors[j]);
                if similarity > self.config.threshold {
                    let [a, b] = pair_key(&convictions[i].id, &convictions[j].id);
                    candidates.push(Candidate { a, b, similarity });
                }
            }
        }
        candidates.sort_by(|x, y| {
            y.similarity
                .total_cmp(&x.similarity)
                .then_with(|| x.a.cmp(&y.a))
                .then_with(|| x.b.cmp(&y.b))
        });
        Ok(candidates)
    }

    /// Rewrite every reference through `id_map` and drop bookkeeping that
    /// mentions a removed id
    fn repair_references(
        &self,
        snapshot: &mut Snapshot,
        id_map: &HashMap<String, String>,
        removed: &HashSet<String>,
        report: &mut DedupReport,
    ) {
        let map = |id: &str| -> Option<String> { id_map.get(id).cloned() };

        for trace in snapshot.traces.iter_mut() {
            let mut changed = false;
            for ac in trace.activated_convictions.iter_mut() {
                if let Some(new_id) = map(&ac.conviction_id) {
                    ac.conviction_id = new_id;
                    changed = true;
                }
            }
            for step in trace.reasoning_path.steps.iter_mut() {
                if let Some(new_id) = step.uses_conviction.as_deref().and_then(map) {
                    step.uses_conviction = Some(new_id);
                    changed = true;
                }
            }
            if let Some(outcome) = trace.outcome.as_mut() {
                for impact in outcome.conviction_impact.iter_mut() {
                    if let Some(new_id) = map(&impact.conviction_id) {
                        impact.conviction_id = new_id;
                        changed = true;
                    }
                }
                dedup_by_key(&mut outcome.conviction_impact, |i| i.conviction_id.clone());
            }
            if changed {
                dedup_by_key(&mut trace.activated_convictions, |ac| ac.conviction_id.clone());
                report.traces_updated += 1;
            }
        }

        for frame in snapshot.frames.iter_mut() {
            let mut changed = false;
            for activation in frame.profile.primary.iter_mut() {
                if let Some(new_id) = map(&activation.conviction_id) {
                    activation.conviction_id = new_id;
                    changed = true;
                }
            }
            for suppressed in frame.profile.suppressed.iter_mut() {
                if let Some(new_id) = map(&suppressed.conviction_id) {
                    suppressed.conviction_id = new_id;
                    changed = true;
                }
            }
            if changed {
                frame.profile.primary = collapse_activations(std::mem::take(&mut frame.profile.primary));
                dedup_by_key(&mut frame.profile.suppressed, |s| s.conviction_id.clone());
                report.frames_updated += 1;
            }
        }

        let mut seen = HashSet::new();
        let mut duplicate_identities = Vec::new();
        for identity in snapshot.identities.iter_mut() {
            if let Some(new_id) = map(&identity.conviction_id) {
                identity.conviction_id = new_id;
                report.identities_updated += 1;
            }
            if !seen.insert(identity.conviction_id.clone()) {
                duplicate_identities.push(identity.id.clone());
            }
        }
        for id in duplicate_identities {
            snapshot.identities.remove(&id);
        }

        for conviction in snapshot.convictions.iter_mut() {
            let own_id = conviction.id.clone();
            for tension in conviction.tensions.iter_mut() {
                if let Some(new_id) = map(&tension.opposing_id) {
                    tension.opposing_id = new_id;
                }
            }
            conviction.tensions.retain(|t| t.opposing_id != own_id);
            dedup_by_key(&mut conviction.tensions, |t| t.opposing_id.clone());
            if let Some(new_id) = conviction.lifecycle.superseded_by.as_deref().and_then(map) {
                conviction.lifecycle.superseded_by = Some(new_id);
            }
        }

        let before = snapshot.checked_pairs.len();
        snapshot
            .checked_pairs
            .retain(|p| !p.pair.iter().any(|id| removed.contains(id)));
        report.checked_pairs_removed = before - snapshot.checked_pairs.len();
    }
}

/// Primary = higher strength score, tie → smaller id
fn choose_primary(snapshot: &Snapshot, candidate: &Candidate) -> Option<MergePlan> {
    let a = snapshot.convictions.get(&candidate.a)?;
    let b = snapshot.convictions.get(&candidate.b)?;
    let a_wins = a.strength.score > b.strength.score
        || (a.strength.score == b.strength.score && a.id <= b.id);
    let (primary, secondary) = if a_wins { (a, b) } else { (b, a) };
    Some(MergePlan {
        primary: primary.id.clone(),
        secondary: secondary.id.clone(),
        similarity: candidate.similarity,
    })
}

/// Fold `secondary` into `primary` and remove it from the arena
fn merge_into(
    snapshot: &mut Snapshot,
    primary_id: &str,
    secondary_id: &str,
    id_map: &HashMap<String, String>,
) {
    let Some(secondary) = snapshot.convictions.remove(secondary_id) else {
        return;
    };
    let Some(primary) = snapshot.convictions.get_mut(primary_id) else {
        snapshot.convictions.insert(secondary);
        return;
    };

    primary.evidence.absorb(&secondary.evidence);

    for domain in secondary.domains {
        if !primary.domains.contains(&domain) {
            primary.domains.push(domain);
        }
    }

    let mut variants = vec![StatementVariant {
        text: secondary.statement,
        context: "merged_duplicate".to_string(),
        signal_id: None,
    }];
    variants.extend(secondary.variants);
    for variant in variants {
        let known = variant.text == primary.statement
            || primary.variants.iter().any(|v| v.text == variant.text);
        if !known {
            primary.variants.push(variant);
        }
    }

    for tension in secondary.tensions {
        let opposing = resolve(id_map, &tension.opposing_id);
        if opposing != secondary_id {
            primary.add_tension(opposing, tension.relationship, tension.note);
        }
    }

    primary.lifecycle.last_reinforced = match (
        primary.lifecycle.last_reinforced,
        secondary.lifecycle.last_reinforced,
    ) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    if secondary.lifecycle.first_detected < primary.lifecycle.first_detected {
        primary.lifecycle.first_detected = secondary.lifecycle.first_detected;
    }
    tracing::debug!("Merged {} into {}", secondary_id, primary_id);
}

/// Follow the merge chain to the surviving id
fn resolve<'a>(id_map: &'a HashMap<String, String>, id: &'a str) -> &'a str {
    let mut current = id;
    let mut hops = 0;
    while let Some(next) = id_map.get(current) {
        current = next;
        hops += 1;
        if hops > id_map.len() {
            break;
        }
    }
    current
}

/// Collapse duplicate activations, keeping the maximum weight
fn collapse_activations(activations: Vec<ConvictionActivation>) -> Vec<ConvictionActivation> {
    let mut out: Vec<ConvictionActivation> = Vec::with_capacity(activations.len());
    for activation in activations {
        match out.iter_mut().find(|a| a.conviction_id == activation.conviction_id) {
            Some(existing) => {
                if activation.weight > existing.weight {
                    *existing = activation;
                }
            }
            None => out.push(activation),
        }
    }
    out
}

/// Keep the first item for each key
fn dedup_by_key<T, K: std::hash::Hash + Eq>(items: &mut Vec<T>, key: impl Fn(&T) -> K) {
    let mut seen = HashSet::new();
    items.retain(|item| seen.insert(key(item)));
}

fn statement_of<'a>(snapshot: &'a Snapshot, id: &str) -> &'a str {
    snapshot
        .convictions
        .get(id)
        .map(|c| c.statement.as_str())
        .unwrap_or_default()
}

fn duplicate_prompt(a: &str, b: &str) -> String {
    format!(
        "Do these two belief statements express the same meaning?\n\n\
         A: {}\n\
         B: {}\n\n\
         Answer only YES or NO. If the meaning is nearly identical and only wording or punctuation differ, answer YES.",
        a, b
    )
}
