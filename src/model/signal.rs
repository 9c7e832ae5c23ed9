//! Layer 1 signal data types
//!
//! A signal is one atomic observation: something the owner said, heard,
//! read, decided or did. Signals are owned by the record store and are
//! immutable once ingested, except for deactivation.

use super::HasId;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Whether the owner received or produced the signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

/// How the signal was expressed or encountered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    SpokenSpontaneous,
    SpokenScripted,
    SpokenInterview,
    WrittenCasual,
    WrittenDeliberate,
    WrittenStructured,
    Highlighted,
    Consumed,
    Received,
    Decided,
    Acted,
}

impl Modality {
    /// A decision or an action rather than a statement
    pub fn is_action(self) -> bool {
        matches!(self, Self::Decided | Self::Acted)
    }

    /// Unprompted, off-the-cuff expression
    pub fn is_spontaneous(self) -> bool {
        matches!(self, Self::SpokenSpontaneous | Self::WrittenCasual)
    }

    /// Carries enough reasoning to reconstruct a trace from
    pub fn is_extractable(self) -> bool {
        matches!(
            self,
            Self::SpokenSpontaneous
                | Self::SpokenScripted
                | Self::SpokenInterview
                | Self::WrittenDeliberate
                | Self::WrittenStructured
                | Self::Decided
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SpokenSpontaneous => "spoken_spontaneous",
            Self::SpokenScripted => "spoken_scripted",
            Self::SpokenInterview => "spoken_interview",
            Self::WrittenCasual => "written_casual",
            Self::WrittenDeliberate => "written_deliberate",
            Self::WrittenStructured => "written_structured",
            Self::Highlighted => "highlighted",
            Self::Consumed => "consumed",
            Self::Received => "received",
            Self::Decided => "decided",
            Self::Acted => "acted",
        }
    }
}

/// Provenance of the signal's content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Authority {
    /// The owner's own words
    OwnVoice,
    /// Someone else's words the owner explicitly agreed with
    Endorsed,
    /// Third-party material the owner cited
    Referenced,
    /// Third-party material the owner was merely exposed to
    Received,
}

impl Authority {
    /// Strength multiplier for evidence with this provenance
    pub fn weight(self) -> f32 {
        match self {
            Self::OwnVoice => 1.0,
            Self::Endorsed => 0.8,
            Self::Referenced | Self::Received => 0.6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OwnVoice => "own_voice",
            Self::Endorsed => "endorsed",
            Self::Referenced => "referenced",
            Self::Received => "received",
        }
    }
}

/// Weight used when a signal carries no authority tag
pub const UNSPECIFIED_AUTHORITY_WEIGHT: f32 = 0.8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalContent {
    pub text: String,
    /// Content type tag, e.g. `belief`, `decision`, `story`
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<String>,
}

fn default_kind() -> String {
    "observation".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSource {
    pub date: NaiveDate,
    /// Situational context, e.g. `team_meeting`, `social_post`
    pub context: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub participants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalLifecycle {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deactivated_reason: Option<String>,
}

impl Default for SignalLifecycle {
    fn default() -> Self {
        Self {
            active: true,
            deactivated_reason: None,
        }
    }
}

/// An atomic observation (Layer 1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub owner: String,
    pub id: String,
    pub direction: Direction,
    pub modality: Modality,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority: Option<Authority>,
    pub content: SignalContent,
    #[serde(default)]
    pub topics: Vec<String>,
    pub source: SignalSource,
    #[serde(default)]
    pub lifecycle: SignalLifecycle,
}

impl Signal {
    pub fn is_active(&self) -> bool {
        self.lifecycle.active
    }

    pub fn authority_weight(&self) -> f32 {
        self.authority
            .map(Authority::weight)
            .unwrap_or(UNSPECIFIED_AUTHORITY_WEIGHT)
    }
}

impl HasId for Signal {
    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_deserialize_minimal() {
        let json = r#"{
            "owner": "alice",
            "id": "sig_001",
            "direction": "output",
            "modality": "spoken_spontaneous",
            "content": {"text": "Ship small and often"},
            "source": {"date": "2025-03-01", "context": "team_meeting"}
        }"#;
        let signal: Signal = serde_json::from_str(json).unwrap();
        assert_eq!(signal.direction, Direction::Output);
        assert!(signal.is_active());
        assert_eq!(signal.content.kind, "observation");
        assert!(signal.authority.is_none());
        assert_eq!(signal.authority_weight(), UNSPECIFIED_AUTHORITY_WEIGHT);
    }

    #[test]
    fn test_authority_weights() {
        assert_eq!(Authority::OwnVoice.weight(), 1.0);
        assert_eq!(Authority::Endorsed.weight(), 0.8);
        assert_eq!(Authority::Referenced.weight(), 0.6);
        assert_eq!(Authority::Received.weight(), 0.6);
    }

    #[test]
    fn test_modality_classes() {
        assert!(Modality::Acted.is_action());
        assert!(!Modality::WrittenCasual.is_action());
        assert!(Modality::WrittenCasual.is_spontaneous());
        assert!(!Modality::SpokenScripted.is_spontaneous());
        assert!(Modality::Decided.is_extractable());
        assert!(!Modality::Consumed.is_extractable());
        assert_eq!(Modality::SpokenInterview.as_str(), "spoken_interview");
    }
}
