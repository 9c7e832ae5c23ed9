//! Layer 2 conviction data types
//!
//! A conviction is a belief inferred from a cluster of corroborating signals.
//! Its strength is never set by hand: [`Strength::compute`] derives it from
//! the resonance evidence, the authority of the evidence signals and whether
//! the evidence spans both directions.

use super::signal::{Direction, Signal};
use super::HasId;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Maximum statement length in characters
pub const MAX_STATEMENT_CHARS: usize = 200;

/// Score cap for evidence that never crosses directions
pub const SINGLE_DIRECTION_CAP: f32 = 0.5;

/// An alternative phrasing kept after a merge or rewrite
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementVariant {
    pub text: String,
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrengthLevel {
    Emerging,
    Developing,
    Established,
    Core,
}

impl StrengthLevel {
    /// Map a score to its band: ≥0.8 core, ≥0.6 established, ≥0.4 developing
    pub fn from_score(score: f32) -> Self {
        if score >= 0.8 {
            Self::Core
        } else if score >= 0.6 {
            Self::Established
        } else if score >= 0.4 {
            Self::Developing
        } else {
            Self::Emerging
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Strengthening,
    Stable,
    Weakening,
    Fluctuating,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strength {
    pub score: f32,
    pub level: StrengthLevel,
    pub trend: Trend,
    pub last_computed: NaiveDate,
}

impl Strength {
    /// Compute strength from evidence.
    ///
    /// `base = min(1, resonance_count * 0.15 + signal_count * 0.05)`, scaled
    /// by the mean authority weight of `signals`. Evidence that is entirely
    /// one direction is capped at [`SINGLE_DIRECTION_CAP`]. The score is
    /// rounded to two decimals. `previous` decides the trend.
    pub fn compute(
        resonance_count: usize,
        signals: &[&Signal],
        previous: Option<f32>,
        today: NaiveDate,
    ) -> Self {
        let mut score =
            (resonance_count as f32 * 0.15 + signals.len() as f32 * 0.05).min(1.0);

        if !signals.is_empty() {
            let authority: f32 =
                signals.iter().map(|s| s.authority_weight()).sum::<f32>() / signals.len() as f32;
            score *= authority;

            if !has_cross_direction(signals) {
                score = score.min(SINGLE_DIRECTION_CAP);
            }
        }

        let score = round2(score.clamp(0.0, 1.0));
        let trend = match previous {
            None => Trend::Strengthening,
            Some(prev) if score > prev + 0.01 => Trend::Strengthening,
            Some(prev) if score < prev - 0.01 => Trend::Weakening,
            Some(_) => Trend::Stable,
        };

        Self {
            score,
            level: StrengthLevel::from_score(score),
            trend,
            last_computed: today,
        }
    }
}

/// True when the signals include both input and output directions
pub fn has_cross_direction(signals: &[&Signal]) -> bool {
    let input = signals.iter().any(|s| s.direction == Direction::Input);
    let output = signals.iter().any(|s| s.direction == Direction::Output);
    input && output
}

fn round2(value: f32) -> f32 {
    (value * 100.0).round() / 100.0
}

// =============================================================================
// Resonance evidence
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputOutputConvergence {
    pub input_signal: String,
    pub output_signal: String,
    pub detected_at: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalPersistence {
    pub signal_ids: Vec<String>,
    pub time_span_days: i64,
    pub first_date: NaiveDate,
    pub last_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossContextConsistency {
    pub signal_ids: Vec<String>,
    pub contexts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpontaneousMention {
    pub signal_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionAlignment {
    pub statement_signal: String,
    pub action_signal: String,
}

/// Five independent corroboration categories. An empty list means the
/// check did not pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResonanceEvidence {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_output_convergence: Vec<InputOutputConvergence>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub temporal_persistence: Vec<TemporalPersistence>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cross_context_consistency: Vec<CrossContextConsistency>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spontaneous_mentions: Vec<SpontaneousMention>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub action_alignment: Vec<ActionAlignment>,
}

impl ResonanceEvidence {
    /// Number of categories with at least one entry
    pub fn resonance_count(&self) -> usize {
        [
            !self.input_output_convergence.is_empty(),
            !self.temporal_persistence.is_empty(),
            !self.cross_context_consistency.is_empty(),
            !self.spontaneous_mentions.is_empty(),
            !self.action_alignment.is_empty(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }

    /// Every signal id referenced by any entry, sorted
    pub fn signal_ids(&self) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        for ioc in &self.input_output_convergence {
            ids.insert(ioc.input_signal.clone());
            ids.insert(ioc.output_signal.clone());
        }
        for tp in &self.temporal_persistence {
            ids.extend(tp.signal_ids.iter().cloned());
        }
        for ccc in &self.cross_context_consistency {
            ids.extend(ccc.signal_ids.iter().cloned());
        }
        for sm in &self.spontaneous_mentions {
            ids.insert(sm.signal_id.clone());
        }
        for aa in &self.action_alignment {
            ids.insert(aa.statement_signal.clone());
            ids.insert(aa.action_signal.clone());
        }
        ids
    }

    /// Union another evidence set into this one, dropping exact duplicates
    pub fn absorb(&mut self, other: &ResonanceEvidence) {
        extend_unique(&mut self.input_output_convergence, &other.input_output_convergence);
        extend_unique(&mut self.temporal_persistence, &other.temporal_persistence);
        extend_unique(&mut self.cross_context_consistency, &other.cross_context_consistency);
        extend_unique(&mut self.spontaneous_mentions, &other.spontaneous_mentions);
        extend_unique(&mut self.action_alignment, &other.action_alignment);
    }
}

fn extend_unique<T: Clone + PartialEq>(into: &mut Vec<T>, from: &[T]) {
    for item in from {
        if !into.contains(item) {
            into.push(item.clone());
        }
    }
}

// =============================================================================
// Tensions and lifecycle
// =============================================================================

/// Kind of tension stored on a conviction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensionKind {
    Contradiction,
    CreativeTension,
    ContextDependent,
    Evolving,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tension {
    pub opposing_id: String,
    pub relationship: TensionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvictionStatus {
    Active,
    Weakening,
    Superseded,
    Dormant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvictionLifecycle {
    pub status: ConvictionStatus,
    pub first_detected: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reinforced: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
}

/// A belief inferred from corroborated signals (Layer 2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conviction {
    pub owner: String,
    pub id: String,
    pub statement: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<StatementVariant>,
    pub strength: Strength,
    pub domains: Vec<String>,
    #[serde(default)]
    pub evidence: ResonanceEvidence,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tensions: Vec<Tension>,
    pub lifecycle: ConvictionLifecycle,
}

impl Conviction {
    pub fn is_active(&self) -> bool {
        self.lifecycle.status == ConvictionStatus::Active
    }

    /// Add a tension unless one toward the same conviction already exists.
    /// Returns true when added.
    pub fn add_tension(&mut self, opposing_id: &str, relationship: TensionKind, note: Option<String>) -> bool {
        if opposing_id == self.id || self.tensions.iter().any(|t| t.opposing_id == opposing_id) {
            return false;
        }
        self.tensions.push(Tension {
            opposing_id: opposing_id.to_string(),
            relationship,
            note,
        });
        true
    }
}

impl HasId for Conviction {
    fn id(&self) -> &str {
        &self.id
    }
}

// =============================================================================
// Contradiction bookkeeping
// =============================================================================

/// Relationship returned by the pair classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
    Contradiction,
    Evolution,
    ContextDependent,
    CreativeTension,
    Unrelated,
}

impl Relationship {
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "contradiction" => Some(Self::Contradiction),
            "evolution" => Some(Self::Evolution),
            "context_dependent" => Some(Self::ContextDependent),
            "creative_tension" => Some(Self::CreativeTension),
            "unrelated" => Some(Self::Unrelated),
            _ => None,
        }
    }
}

/// A conviction pair already classified by the contradiction scanner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckedPair {
    /// Ids in ascending order
    pub pair: [String; 2],
    pub relationship: Relationship,
    pub confidence: u8,
    pub checked_at: NaiveDate,
}

impl CheckedPair {
    pub fn new(a: &str, b: &str, relationship: Relationship, confidence: u8, checked_at: NaiveDate) -> Self {
        Self {
            pair: pair_key(a, b),
            relationship,
            confidence,
            checked_at,
        }
    }

    pub fn mentions(&self, id: &str) -> bool {
        self.pair[0] == id || self.pair[1] == id
    }
}

/// Order-insensitive key for a conviction pair
pub fn pair_key(a: &str, b: &str) -> [String; 2] {
    if a <= b {
        [a.to_string(), b.to_string()]
    } else {
        [b.to_string(), a.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::signal::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    fn signal(id: &str, direction: Direction, authority: Option<Authority>) -> Signal {
        Signal {
            owner: "alice".to_string(),
            id: id.to_string(),
            direction,
            modality: Modality::WrittenDeliberate,
            authority,
            content: SignalContent {
                text: format!("text {}", id),
                kind: "belief".to_string(),
                reasoning: None,
                confidence: None,
            },
            topics: vec![],
            source: SignalSource {
                date: date(1),
                context: "email".to_string(),
                participants: vec![],
                source_file: None,
            },
            lifecycle: SignalLifecycle::default(),
        }
    }

    #[test]
    fn test_strength_scenario_before_authority() {
        let signals: Vec<Signal> = (0..5)
            .map(|i| {
                let dir = if i < 3 { Direction::Output } else { Direction::Input };
                signal(&format!("s{}", i), dir, Some(Authority::OwnVoice))
            })
            .collect();
        let refs: Vec<&Signal> = signals.iter().collect();
        let strength = Strength::compute(3, &refs, None, date(10));
        assert!((strength.score - 0.70).abs() < 1e-6);
        assert_eq!(strength.level, StrengthLevel::Established);
        assert_eq!(strength.trend, Trend::Strengthening);
    }

    #[test]
    fn test_strength_authority_weighting() {
        let signals: Vec<Signal> = (0..5)
            .map(|i| {
                let dir = if i < 3 { Direction::Output } else { Direction::Input };
                signal(&format!("s{}", i), dir, Some(Authority::Endorsed))
            })
            .collect();
        let refs: Vec<&Signal> = signals.iter().collect();
        let strength = Strength::compute(3, &refs, None, date(10));
        assert!((strength.score - 0.56).abs() < 1e-6);
        assert_eq!(strength.level, StrengthLevel::Developing);
    }

    #[test]
    fn test_single_direction_capped() {
        let signals: Vec<Signal> = (0..12)
            .map(|i| signal(&format!("s{}", i), Direction::Output, Some(Authority::OwnVoice)))
            .collect();
        let refs: Vec<&Signal> = signals.iter().collect();
        let strength = Strength::compute(5, &refs, None, date(10));
        assert_eq!(strength.score, SINGLE_DIRECTION_CAP);
        assert_eq!(strength.level, StrengthLevel::Developing);
    }

    #[test]
    fn test_strength_bounded() {
        let signals: Vec<Signal> = (0..40)
            .map(|i| {
                let dir = if i % 2 == 0 { Direction::Output } else { Direction::Input };
                signal(&format!("s{}", i), dir, Some(Authority::OwnVoice))
            })
            .collect();
        let refs: Vec<&Signal> = signals.iter().collect();
        let strength = Strength::compute(5, &refs, None, date(10));
        assert_eq!(strength.score, 1.0);
        assert_eq!(strength.level, StrengthLevel::Core);

        let empty = Strength::compute(0, &[], None, date(10));
        assert_eq!(empty.score, 0.0);
        assert_eq!(empty.level, StrengthLevel::Emerging);
    }

    #[test]
    fn test_strength_trend() {
        let signals: Vec<Signal> = (0..4)
            .map(|i| {
                let dir = if i < 2 { Direction::Output } else { Direction::Input };
                signal(&format!("s{}", i), dir, Some(Authority::OwnVoice))
            })
            .collect();
        let refs: Vec<&Signal> = signals.iter().collect();
        assert_eq!(Strength::compute(2, &refs, Some(0.5), date(2)).trend, Trend::Stable);
        assert_eq!(Strength::compute(2, &refs, Some(0.3), date(2)).trend, Trend::Strengthening);
        assert_eq!(Strength::compute(2, &refs, Some(0.9), date(2)).trend, Trend::Weakening);
    }

    #[test]
    fn test_level_bands() {
        assert_eq!(StrengthLevel::from_score(0.8), StrengthLevel::Core);
        assert_eq!(StrengthLevel::from_score(0.79), StrengthLevel::Established);
        assert_eq!(StrengthLevel::from_score(0.4), StrengthLevel::Developing);
        assert_eq!(StrengthLevel::from_score(0.39), StrengthLevel::Emerging);
    }

    #[test]
    fn test_evidence_count_and_ids() {
        let mut evidence = ResonanceEvidence::default();
        assert_eq!(evidence.resonance_count(), 0);
        evidence.input_output_convergence.push(InputOutputConvergence {
            input_signal: "a".to_string(),
            output_signal: "b".to_string(),
            detected_at: date(1),
        });
        evidence.spontaneous_mentions.push(SpontaneousMention {
            signal_id: "c".to_string(),
        });
        assert_eq!(evidence.resonance_count(), 2);
        let ids: Vec<String> = evidence.signal_ids().into_iter().collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_evidence_absorb_dedupes() {
        let mention = SpontaneousMention {
            signal_id: "c".to_string(),
        };
        let mut a = ResonanceEvidence::default();
        a.spontaneous_mentions.push(mention.clone());
        let mut b = ResonanceEvidence::default();
        b.spontaneous_mentions.push(mention);
        b.action_alignment.push(ActionAlignment {
            statement_signal: "d".to_string(),
            action_signal: "e".to_string(),
        });
        a.absorb(&b);
        assert_eq!(a.spontaneous_mentions.len(), 1);
        assert_eq!(a.action_alignment.len(), 1);
        assert_eq!(a.resonance_count(), 2);
    }

    #[test]
    fn test_evidence_serialization_skips_empty() {
        let json = serde_json::to_string(&ResonanceEvidence::default()).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn test_relationship_parse() {
        assert_eq!(Relationship::parse(" Contradiction "), Some(Relationship::Contradiction));
        assert_eq!(Relationship::parse("context_dependent"), Some(Relationship::ContextDependent));
        assert_eq!(Relationship::parse("maybe"), None);
    }

    #[test]
    fn test_pair_key_order_insensitive() {
        assert_eq!(pair_key("b", "a"), pair_key("a", "b"));
        let checked = CheckedPair::new("z", "y", Relationship::Unrelated, 3, date(1));
        assert_eq!(checked.pair, ["y".to_string(), "z".to_string()]);
        assert!(checked.mentions("z"));
        assert!(!checked.mentions("x"));
    }
}
