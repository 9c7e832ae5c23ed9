//! Contradiction scanning over active convictions
//!
//! Pairs that are related but not duplicates (similarity inside the band)
//! are classified once each. Every parsed answer goes into the checked-pair
//! bookkeeping so later scans skip it; confident contradictions become
//! symmetric tensions.

use super::Services;
use crate::backend::Tier;
use crate::cluster::cosine_similarity;
use crate::config::ContradictionConfig;
use crate::error::Result;
use crate::model::*;
use crate::store::Snapshot;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub a: String,
    pub b: String,
    pub relationship: Relationship,
    pub confidence: u8,
    pub similarity: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContradictionReport {
    pub in_band: usize,
    pub already_checked: usize,
    pub classified: usize,
    pub unparseable: usize,
    /// Parsed answers at or above the confidence floor
    pub findings: Vec<Finding>,
    pub tensions_added: usize,
}

impl ContradictionReport {
    pub fn changed(&self) -> bool {
        self.classified > 0
    }

    pub fn contradictions(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(|f| f.relationship == Relationship::Contradiction)
    }
}

pub struct ContradictionScanner {
    config: ContradictionConfig,
    services: Services,
}

impl ContradictionScanner {
    pub fn new(config: ContradictionConfig, services: Services) -> Self {
        Self { config, services }
    }

    /// Classify in-band pairs and record contradictions on both sides.
    ///
    /// Pairs already in the bookkeeping are skipped unless `force` is set.
    pub async fn scan(
        &self,
        snapshot: &mut Snapshot,
        force: bool,
        today: NaiveDate,
    ) -> Result<ContradictionReport> {
        let mut report = ContradictionReport::default();
        let active: Vec<(String, String)> = snapshot
            .active_convictions()
            .map(|c| (c.id.clone(), c.statement.clone()))
            .collect();
        if active.len() < 2 {
            return Ok(report);
        }

        let texts: Vec<String> = active.iter().map(|(_, s)| s.clone()).collect();
        let vectors = self.services.embedder.encode_batch(&texts).await?;

        let checked: HashSet<[String; 2]> = snapshot
            .checked_pairs
            .iter()
            .map(|p| p.pair.clone())
            .collect();

        let mut pairs = Vec::new();
        for i in 0..active.len() {
            for j in (i + 1)..active.len() {
                let similarity = cosine_similarity(&vectors[i], &vectors[j]);
                if similarity < self.config.band_low || similarity > self.config.band_high {
                    continue;
                }
                report.in_band += 1;
                if !force && checked.contains(&pair_key(&active[i].0, &active[j].0)) {
                    report.already_checked += 1;
                    continue;
                }
                pairs.push((i, j, similarity));
            }
        }
        if pairs.is_empty() {
            return Ok(report);
        }

        let prompts: Vec<String> = pairs
            .iter()
            .map(|&(i, j, _)| relationship_prompt(&active[i].1, &active[j].1))
            .collect();
        let answers = self
            .services
            .generator
            .complete_batch(&prompts, Tier::Light, self.services.concurrency)
            .await;

        for (&(i, j, similarity), answer) in pairs.iter().zip(answers) {
            let (a, b) = (&active[i].0, &active[j].0);
            let parsed = match answer {
                Ok(text) => parse_relationship(&text),
                Err(e) => {
                    tracing::warn!("Failed to classify {} / {}: {}", a, b, e);
                    continue;
                }
            };
            let Some((relationship, confidence)) = parsed else {
                tracing::warn!("Unparseable relationship for {} / {}", a, b);
                report.unparseable += 1;
                continue;
            };

            let record = CheckedPair::new(a, b, relationship, confidence, today);
            match snapshot.checked_pairs.iter_mut().find(|p| p.pair == record.pair) {
                Some(existing) => *existing = record,
                None => snapshot.checked_pairs.push(record),
            }
            report.classified += 1;

            if confidence < self.config.confidence_floor {
                tracing::debug!(
                    "Discarding {:?} for {} / {}: confidence {}",
                    relationship,
                    a,
                    b,
                    confidence
                );
                continue;
            }

            if relationship == Relationship::Contradiction {
                let note = Some(format!("confidence {}/10", confidence));
                let mut added = false;
                if let Some(conviction) = snapshot.convictions.get_mut(a) {
                    added |= conviction.add_tension(b, TensionKind::Contradiction, note.clone());
                }
                if let Some(conviction) = snapshot.convictions.get_mut(b) {
                    added |= conviction.add_tension(a, TensionKind::Contradiction, note);
                }
                if added {
                    report.tensions_added += 1;
                }
            }
            report.findings.push(Finding {
                a: a.clone(),
                b: b.clone(),
                relationship,
                confidence,
                similarity,
            });
        }

        tracing::info!(
            "Contradiction scan for {}: {} in band, {} classified, {} contradictions",
            snapshot.owner,
            report.in_band,
            report.classified,
            report.contradictions().count()
        );
        Ok(report)
    }
}

/// Parse `<relationship> <confidence 0-10>`
pub fn parse_relationship(text: &str) -> Option<(Relationship, u8)> {
    let cleaned = text.trim().to_lowercase();
    let mut tokens = cleaned
        .split(|c: char| c.is_whitespace() || c == ',' || c == ':' || c == '/')
        .filter(|t| !t.is_empty());
    let relationship = Relationship::parse(tokens.next()?.trim_matches(|c: char| !c.is_alphanumeric() && c != '_'))?;
    let confidence: u8 = tokens
        .next()?
        .trim_matches(|c: char| !c.is_ascii_digit())
        .parse()
        .ok()?;
    if confidence > 10 {
        return None;
    }
    Some((relationship, confidence))
}

fn relationship_prompt(a: &str, b: &str) -> String {
    format!(
        "Below are two beliefs held by the same person:\n\n\
         A: {}\n\
         B: {}\n\n\
         Classify their relationship with exactly one of these words:\n\
         - contradiction (they directly contradict each other)\n\
         - evolution (the view evolved, B replaces A)\n\
         - context_dependent (both hold in different situations)\n\
         - creative_tension (in tension but coexisting)\n\
         - unrelated\n\n\
         Then give your confidence from 0 to 10.\n\
         Answer in the form: <relationship> <confidence>, for example: contradiction 8",
        a, b
    )
}
