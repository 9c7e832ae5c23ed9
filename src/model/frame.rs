//! Layer 4 context frame data types

use super::trace::{ReasoningStyle, Role};
use super::HasId;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerPattern {
    pub pattern: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvictionActivation {
    pub conviction_id: String,
    /// Share of the frame's traces that activate this conviction
    pub weight: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typical_role: Option<Role>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuppressedConviction {
    pub conviction_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvictionProfile {
    pub primary: Vec<ConvictionActivation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suppressed: Vec<SuppressedConviction>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FramePatterns {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_style: Option<ReasoningStyle>,
    #[serde(default)]
    pub typical_steps: Vec<String>,
    #[serde(default)]
    pub historical_traces: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Professional,
    Warm,
    Direct,
    Patient,
    Passionate,
    Casual,
    Authoritative,
}

impl Tone {
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "professional" => Some(Self::Professional),
            "warm" => Some(Self::Warm),
            "direct" => Some(Self::Direct),
            "patient" => Some(Self::Patient),
            "passionate" => Some(Self::Passionate),
            "casual" => Some(Self::Casual),
            "authoritative" => Some(Self::Authoritative),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Professional => "professional",
            Self::Warm => "warm",
            Self::Direct => "direct",
            Self::Patient => "patient",
            Self::Passionate => "passionate",
            Self::Casual => "casual",
            Self::Authoritative => "authoritative",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameVoice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<Tone>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub typical_phrases: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub avoids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameEffectiveness {
    /// positive / traces with a definite outcome; None when no outcomes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f32>,
    pub total_traces: usize,
    pub positive: usize,
    pub negative: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStatus {
    Active,
    Evolving,
    Deprecated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameLifecycle {
    pub status: FrameStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_observed: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activated: Option<NaiveDate>,
}

/// A reusable situational reasoning pattern (Layer 4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextFrame {
    pub owner: String,
    pub id: String,
    pub name: String,
    pub description: String,
    pub trigger_patterns: Vec<TriggerPattern>,
    pub profile: ConvictionProfile,
    #[serde(default)]
    pub patterns: FramePatterns,
    #[serde(default)]
    pub voice: FrameVoice,
    #[serde(default)]
    pub effectiveness: FrameEffectiveness,
    pub lifecycle: FrameLifecycle,
}

impl ContextFrame {
    pub fn is_active(&self) -> bool {
        self.lifecycle.status == FrameStatus::Active
    }

    /// Ids of all profiled convictions, primary first
    pub fn conviction_ids(&self) -> impl Iterator<Item = &str> {
        self.profile
            .primary
            .iter()
            .map(|a| a.conviction_id.as_str())
            .chain(self.profile.suppressed.iter().map(|s| s.conviction_id.as_str()))
    }

    /// Count of trigger keywords found in `text` (case-insensitive)
    pub fn keyword_hits(&self, text: &str) -> usize {
        let lowered = text.to_lowercase();
        self.trigger_patterns
            .iter()
            .flat_map(|p| p.keywords.iter())
            .filter(|kw| !kw.trim().is_empty() && lowered.contains(&kw.to_lowercase()))
            .count()
    }

    /// Text used to embed the frame for the retrieval index
    pub fn index_text(&self) -> String {
        let patterns: Vec<&str> = self.trigger_patterns.iter().map(|p| p.pattern.as_str()).collect();
        format!("{} {} {}", self.name, self.description, patterns.join(" "))
    }
}

impl HasId for ContextFrame {
    fn id(&self) -> &str {
        &self.id
    }
}
