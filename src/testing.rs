//! Test doubles and fixtures shared by unit tests

use crate::backend::{Embedder, Generator, HashingEmbedder, Tier};
use crate::error::{Error, Result};
use crate::model::*;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub const OWNER: &str = "alice";

/// 2025-03-`day`
pub fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, day).unwrap()
}

/// Unit vector in 2-D at the given angle, padded to `dims`
pub fn angle_vector(angle_deg: f32, dims: usize) -> Vec<f32> {
    let r = angle_deg.to_radians();
    let mut v = vec![0.0; dims.max(2)];
    v[0] = r.cos();
    v[1] = r.sin();
    v
}

// =============================================================================
// Embedder
// =============================================================================

/// Embedder returning fixed vectors for known texts and hashed vectors
/// for everything else.
pub struct StubEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    fallback: HashingEmbedder,
    pub calls: AtomicUsize,
}

impl StubEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            vectors: HashMap::new(),
            fallback: HashingEmbedder::new(dims).unwrap(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.to_string(), vector);
        self
    }

    pub fn set(&mut self, text: &str, vector: Vec<f32>) {
        self.vectors.insert(text.to_string(), vector);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for StubEmbedder {
    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            match self.vectors.get(text) {
                Some(v) => {
                    let mut v = v.clone();
                    crate::cluster::normalize(&mut v);
                    out.push(v);
                }
                None => out.push(self.fallback.encode(text).await?),
            }
        }
        Ok(out)
    }

    fn name(&self) -> &str {
        "stub"
    }
}

// =============================================================================
// Generator
// =============================================================================

/// Generator answering by the first rule whose needle occurs in the prompt.
/// A response of `!ERR` produces a generation error.
pub struct ScriptedGenerator {
    rules: Vec<(String, String)>,
    default: String,
    pub prompts: Mutex<Vec<(String, Tier)>>,
}

impl ScriptedGenerator {
    pub fn new(default: &str) -> Self {
        Self {
            rules: Vec::new(),
            default: default.to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn rule(mut self, needle: &str, response: &str) -> Self {
        self.rules.push((needle.to_string(), response.to_string()));
        self
    }

    pub fn prompts_containing(&self, needle: &str) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p.contains(needle))
            .map(|(p, _)| p.clone())
            .collect()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn complete(&self, prompt: &str, tier: Tier) -> Result<String> {
        self.prompts.lock().unwrap().push((prompt.to_string(), tier));
        let response = self
            .rules
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, r)| r.as_str())
            .unwrap_or(&self.default);
        if response == "!ERR" {
            return Err(Error::Generation("scripted failure".to_string()));
        }
        Ok(response.to_string())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn make_signal(id: &str, direction: Direction, modality: Modality, day: u32, context: &str) -> Signal {
    Signal {
        owner: OWNER.to_string(),
        id: id.to_string(),
        direction,
        modality,
        authority: Some(Authority::OwnVoice),
        content: SignalContent {
            text: format!("signal text {}", id),
            kind: "belief".to_string(),
            reasoning: None,
            confidence: None,
        },
        topics: vec![],
        source: SignalSource {
            date: date(day),
            context: context.to_string(),
            participants: vec![],
            source_file: None,
        },
        lifecycle: SignalLifecycle::default(),
    }
}

pub fn make_conviction(id: &str, statement: &str, score: f32) -> Conviction {
    Conviction {
        owner: OWNER.to_string(),
        id: id.to_string(),
        statement: statement.to_string(),
        variants: vec![],
        strength: Strength {
            score,
            level: StrengthLevel::from_score(score),
            trend: Trend::Stable,
            last_computed: date(1),
        },
        domains: vec!["general".to_string()],
        evidence: ResonanceEvidence::default(),
        tensions: vec![],
        lifecycle: ConvictionLifecycle {
            status: ConvictionStatus::Active,
            first_detected: date(1),
            last_reinforced: Some(date(1)),
            superseded_by: None,
        },
    }
}

pub fn make_trace(id: &str, conviction_ids: &[&str], day: u32) -> ReasoningTrace {
    ReasoningTrace {
        owner: OWNER.to_string(),
        id: id.to_string(),
        trigger: TraceTrigger {
            situation: format!("situation {}", id),
            stimulus_type: StimulusType::DecisionRequired,
            from_signal: None,
        },
        activated_convictions: conviction_ids
            .iter()
            .map(|c| ActivatedConviction {
                conviction_id: c.to_string(),
                role: Role::Premise,
                note: None,
            })
            .collect(),
        reasoning_path: ReasoningPath {
            steps: vec![ReasoningStep {
                action: StepAction::Analyze,
                description: "weigh the options".to_string(),
                uses_conviction: None,
            }],
            style: ReasoningStyle::Analytical,
        },
        conclusion: TraceConclusion {
            decision: format!("decision {}", id),
            confidence: ConclusionConfidence::High,
            alternative: None,
            output_signal: None,
        },
        outcome: None,
        context_frame_id: None,
        source: TraceSource {
            date: date(day),
            context: None,
            source_file: None,
            participants: vec![],
        },
    }
}

pub fn make_frame(id: &str, convictions: &[(&str, f32)], traces: &[&str]) -> ContextFrame {
    ContextFrame {
        owner: OWNER.to_string(),
        id: id.to_string(),
        name: format!("frame {}", id),
        description: format!("description {}", id),
        trigger_patterns: vec![],
        profile: ConvictionProfile {
            primary: convictions
                .iter()
                .map(|(c, w)| ConvictionActivation {
                    conviction_id: c.to_string(),
                    weight: *w,
                    typical_role: Some(Role::Premise),
                })
                .collect(),
            suppressed: vec![],
        },
        patterns: FramePatterns {
            preferred_style: Some(ReasoningStyle::Analytical),
            typical_steps: vec![],
            historical_traces: traces.iter().map(|t| t.to_string()).collect(),
        },
        voice: FrameVoice::default(),
        effectiveness: FrameEffectiveness::default(),
        lifecycle: FrameLifecycle {
            status: FrameStatus::Active,
            first_observed: Some(date(1)),
            last_activated: Some(date(1)),
        },
    }
}

pub fn make_identity(id: &str, conviction_id: &str, frames: &[&str]) -> IdentityCore {
    IdentityCore {
        owner: OWNER.to_string(),
        id: id.to_string(),
        core_belief: format!("belief of {}", conviction_id),
        conviction_id: conviction_id.to_string(),
        universality: Universality {
            active_in_frames: frames.iter().map(|f| f.to_string()).collect(),
            total_active_frames: frames.len(),
            coverage: 1.0,
        },
        expressions: vec![],
        non_negotiable: false,
        stability: None,
    }
}
