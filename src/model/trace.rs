//! Layer 3 reasoning trace data types
//!
//! A trace reconstructs one decision episode: what triggered it, which
//! convictions were activated in which role, the reasoning steps and the
//! conclusion. Outcomes are recorded later by the decision tracker.

use super::HasId;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StimulusType {
    QuestionReceived,
    ProblemEncountered,
    DecisionRequired,
    OpinionChallenged,
    OpportunitySpotted,
    ConflictToResolve,
    TeachingMoment,
    SelfReflection,
}

impl StimulusType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QuestionReceived => "question_received",
            Self::ProblemEncountered => "problem_encountered",
            Self::DecisionRequired => "decision_required",
            Self::OpinionChallenged => "opinion_challenged",
            Self::OpportunitySpotted => "opportunity_spotted",
            Self::ConflictToResolve => "conflict_to_resolve",
            Self::TeachingMoment => "teaching_moment",
            Self::SelfReflection => "self_reflection",
        }
    }
}

/// Role an activated conviction plays in a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Premise,
    Framework,
    Evidence,
    Constraint,
    ValueAnchor,
    Counterpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Empathize,
    Reframe,
    Analyze,
    Compare,
    RecallExperience,
    ApplyFramework,
    ChallengeAssumption,
    WeighTradeoff,
    Synthesize,
    Decide,
}

impl StepAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Empathize => "empathize",
            Self::Reframe => "reframe",
            Self::Analyze => "analyze",
            Self::Compare => "compare",
            Self::RecallExperience => "recall_experience",
            Self::ApplyFramework => "apply_framework",
            Self::ChallengeAssumption => "challenge_assumption",
            Self::WeighTradeoff => "weigh_tradeoff",
            Self::Synthesize => "synthesize",
            Self::Decide => "decide",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningStyle {
    Analytical,
    Intuitive,
    Storytelling,
    Socratic,
    FirstPrinciples,
    PatternMatching,
    EmpathyDriven,
}

impl ReasoningStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Analytical => "analytical",
            Self::Intuitive => "intuitive",
            Self::Storytelling => "storytelling",
            Self::Socratic => "socratic",
            Self::FirstPrinciples => "first_principles",
            Self::PatternMatching => "pattern_matching",
            Self::EmpathyDriven => "empathy_driven",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConclusionConfidence {
    High,
    Medium,
    Low,
    Uncertain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeResult {
    Positive,
    Negative,
    Mixed,
    Unknown,
    Pending,
}

impl OutcomeResult {
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "positive" => Some(Self::Positive),
            "negative" => Some(Self::Negative),
            "mixed" => Some(Self::Mixed),
            "unknown" => Some(Self::Unknown),
            "pending" => Some(Self::Pending),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactEffect {
    Reinforced,
    Weakened,
    Unchanged,
}

impl From<OutcomeResult> for ImpactEffect {
    fn from(result: OutcomeResult) -> Self {
        match result {
            OutcomeResult::Positive => Self::Reinforced,
            OutcomeResult::Negative => Self::Weakened,
            _ => Self::Unchanged,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceTrigger {
    pub situation: String,
    pub stimulus_type: StimulusType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_signal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivatedConviction {
    pub conviction_id: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub action: StepAction,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses_conviction: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningPath {
    pub steps: Vec<ReasoningStep>,
    pub style: ReasoningStyle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceConclusion {
    pub decision: String,
    pub confidence: ConclusionConfidence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternative: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_signal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvictionImpact {
    pub conviction_id: String,
    pub effect: ImpactEffect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceOutcome {
    pub result: OutcomeResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conviction_impact: Vec<ConvictionImpact>,
    pub recorded_at: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSource {
    pub date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub participants: Vec<String>,
}

/// One reconstructed decision episode (Layer 3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningTrace {
    pub owner: String,
    pub id: String,
    pub trigger: TraceTrigger,
    pub activated_convictions: Vec<ActivatedConviction>,
    pub reasoning_path: ReasoningPath,
    pub conclusion: TraceConclusion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TraceOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_frame_id: Option<String>,
    pub source: TraceSource,
}

impl ReasoningTrace {
    /// Outcome recorded and not `pending`
    pub fn has_definite_outcome(&self) -> bool {
        matches!(&self.outcome, Some(o) if o.result != OutcomeResult::Pending)
    }

    /// Every conviction id this trace references, in order of appearance
    pub fn conviction_refs(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = self
            .activated_convictions
            .iter()
            .map(|ac| ac.conviction_id.as_str())
            .collect();
        refs.extend(
            self.reasoning_path
                .steps
                .iter()
                .filter_map(|s| s.uses_conviction.as_deref()),
        );
        if let Some(outcome) = &self.outcome {
            refs.extend(outcome.conviction_impact.iter().map(|ci| ci.conviction_id.as_str()));
        }
        refs
    }
}

impl HasId for ReasoningTrace {
    fn id(&self) -> &str {
        &self.id
    }
}
