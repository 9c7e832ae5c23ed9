//! Layer 5 identity core data types

use super::HasId;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Universality {
    pub active_in_frames: Vec<String>,
    pub total_active_frames: usize,
    pub coverage: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expression {
    pub frame_id: String,
    pub how_it_manifests: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stability {
    pub held_since: NaiveDate,
    pub consistency_score: f32,
}

/// A conviction present across nearly every frame (Layer 5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityCore {
    pub owner: String,
    pub id: String,
    pub core_belief: String,
    pub conviction_id: String,
    pub universality: Universality,
    #[serde(default)]
    pub expressions: Vec<Expression>,
    #[serde(default)]
    pub non_negotiable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stability: Option<Stability>,
}

impl HasId for IdentityCore {
    fn id(&self) -> &str {
        &self.id
    }
}
