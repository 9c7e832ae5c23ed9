//! Mindstack configuration management
//!
//! Every section carries `#[serde(default)]`, so a TOML file only needs the
//! keys it overrides. An empty file is a valid configuration.

use crate::error::{Error, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main Mindstack configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MindstackConfig {
    /// Layer and signal storage
    pub storage: StorageConfig,

    /// Embedding backend
    pub embedding: EmbeddingConfig,

    /// Generation backend
    pub llm: LlmConfig,

    /// Conviction detection
    pub conviction: ConvictionConfig,

    /// Duplicate conviction merging
    pub dedup: DedupConfig,

    /// Contradiction scanning
    pub contradiction: ContradictionConfig,

    /// Trace extraction
    pub traces: TraceConfig,

    /// Frame clustering
    pub frames: FrameConfig,

    /// Identity promotion
    pub identity: IdentityConfig,

    /// Query and retrieval
    pub query: QueryConfig,

    /// Decision follow-ups
    pub followup: FollowupConfig,

    /// Exploration of the belief model
    pub explorer: ExplorerConfig,
}

impl MindstackConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory; each owner gets a subdirectory
    pub data_dir: PathBuf,

    /// Committed generations kept on disk per owner (current included)
    pub keep_generations: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            keep_generations: 3,
        }
    }
}

/// Default data directory (~/.mindstack/data)
pub fn default_data_dir() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mindstack")
        .join("data")
}

/// Embedding provider selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    /// Offline deterministic feature hashing
    Hashing,
    /// OpenAI-compatible `/embeddings` endpoint
    Http,
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,

    /// Vector length (hashing provider only; HTTP vectors keep their size)
    pub dimensions: usize,

    /// Endpoint base URL, e.g. `http://127.0.0.1:8080/v1`
    pub base_url: String,

    /// Model name sent to the endpoint
    pub model: String,

    /// Environment variable holding the API key, if any
    pub api_key_ref: Option<String>,

    /// Texts per HTTP request
    pub batch_size: usize,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Hashing,
            dimensions: 384,
            base_url: "http://127.0.0.1:8080/v1".to_string(),
            model: "paraphrase-multilingual-MiniLM-L12-v2".to_string(),
            api_key_ref: None,
            batch_size: 64,
            timeout_secs: 60,
        }
    }
}

/// Generation backend variant, selected once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LlmBackend {
    /// Self-hosted OpenAI-compatible server (llama.cpp, vLLM, Ollama)
    Local {
        base_url: String,
        light_model: String,
        strong_model: String,
    },
    /// Hosted gateway with bearer authentication
    Gateway {
        base_url: String,
        /// Environment variable holding the API key
        api_key_ref: String,
        light_model: String,
        strong_model: String,
    },
}

impl Default for LlmBackend {
    fn default() -> Self {
        Self::Local {
            base_url: "http://127.0.0.1:11434/v1".to_string(),
            light_model: "qwen2.5:7b".to_string(),
            strong_model: "qwen2.5:32b".to_string(),
        }
    }
}

/// Generation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: LlmBackend,

    /// Concurrent calls in one batch
    pub concurrency: usize,

    pub temperature: f32,

    /// Maximum tokens per completion
    pub max_tokens: u32,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: LlmBackend::default(),
            concurrency: 5,
            temperature: 0.3,
            max_tokens: 2048,
            timeout_secs: 120,
        }
    }
}

/// Conviction detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvictionConfig {
    /// Cosine similarity at which signals join one cluster
    pub similarity_threshold: f32,

    /// Minimum signals per cluster
    pub min_cluster_size: usize,

    /// Minimum passing resonance checks
    pub min_resonance_count: usize,

    /// Similarity above which a cluster reinforces an existing conviction
    pub reinforce_similarity: f32,

    /// Minimum day span for temporal persistence
    pub min_span_days: i64,

    /// Minimum distinct contexts for cross-context consistency
    pub min_contexts: usize,
}

impl Default for ConvictionConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.75,
            min_cluster_size: 3,
            min_resonance_count: 2,
            reinforce_similarity: 0.85,
            min_span_days: 7,
            min_contexts: 2,
        }
    }
}

/// Duplicate merging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Statement similarity above which a pair is a merge candidate
    pub threshold: f32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { threshold: 0.90 }
    }
}

/// Contradiction scanning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContradictionConfig {
    /// Lower similarity bound (inclusive)
    pub band_low: f32,

    /// Upper similarity bound (inclusive)
    pub band_high: f32,

    /// Minimum classifier confidence on a 0-10 scale
    pub confidence_floor: u8,
}

impl Default for ContradictionConfig {
    fn default() -> Self {
        Self {
            band_low: 0.70,
            band_high: 0.95,
            confidence_floor: 7,
        }
    }
}

/// Trace extraction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Maximum signals per extraction prompt
    pub chunk_size: usize,

    /// Maximum groups processed per run (None = all)
    pub max_groups: Option<usize>,

    /// Active convictions listed in each prompt
    pub max_convictions_in_prompt: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            chunk_size: 30,
            max_groups: None,
            max_convictions_in_prompt: 60,
        }
    }
}

/// Frame clustering configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Cosine similarity at which traces join one cluster
    pub similarity_threshold: f32,

    /// Minimum traces per frame
    pub min_cluster_size: usize,

    /// Profiled convictions per frame
    pub max_primary: usize,

    /// Activation weight below which a conviction is not profiled
    pub min_weight: f32,

    /// Historical trace references kept per frame
    pub max_historical_traces: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.45,
            min_cluster_size: 3,
            max_primary: 7,
            min_weight: 0.1,
            max_historical_traces: 20,
        }
    }
}

/// Identity promotion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Frame coverage needed for promotion
    pub coverage_threshold: f32,

    /// Minimum active frames before promotion runs
    pub min_frames: usize,

    /// Fallback promotions when nothing reaches the threshold
    pub fallback_top: usize,

    /// Strength at or above which an identity is non-negotiable
    pub non_negotiable_score: f32,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            coverage_threshold: 0.8,
            min_frames: 2,
            fallback_top: 3,
            non_negotiable_score: 0.9,
        }
    }
}

/// Query configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Frame index distance (0-2 scale) below which a frame matches
    pub frame_distance_threshold: f32,

    /// Distance at or beyond which retrieval is flagged low-confidence
    pub low_confidence_distance: f32,

    /// Convictions activated for a question
    pub conviction_limit: usize,

    /// Convictions activated for content generation
    pub generate_conviction_limit: usize,

    /// Traces retrieved per query
    pub trace_limit: usize,

    /// Traces retrieved for content generation
    pub generate_trace_limit: usize,

    /// Raw evidence signals fetched per query
    pub evidence_limit: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            frame_distance_threshold: 0.7,
            low_confidence_distance: 0.8,
            conviction_limit: 5,
            generate_conviction_limit: 7,
            trace_limit: 5,
            generate_trace_limit: 8,
            evidence_limit: 6,
        }
    }
}

/// Decision follow-up configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowupConfig {
    /// Days after a decision before it is due for follow-up
    pub tactical_days: i64,

    /// Traces dated before this are historical backfill and never queued
    pub backfill_cutoff: Option<NaiveDate>,
}

impl Default for FollowupConfig {
    fn default() -> Self {
        Self {
            tactical_days: 14,
            backfill_cutoff: None,
        }
    }
}

/// Explorer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplorerConfig {
    /// Index distance (0-2 scale) below which a conviction relates to a topic
    pub relevance_distance: f32,

    /// Signals returned by recall when no limit is given
    pub recall_limit: usize,

    /// Index hits examined per layer when exploring a topic
    pub explore_limit: usize,

    /// Raw signals attached to a full exploration
    pub explore_signals: usize,

    /// Conviction hits examined when tracing evolution
    pub evolution_convictions: usize,

    /// Trace hits examined when tracing evolution
    pub evolution_traces: usize,

    /// Index hits per layer and topic when connecting two topics
    pub connection_limit: usize,

    /// Traces required before reasoning style inertia is reported
    pub inertia_min_traces: usize,

    /// Share of one style above which it counts as inertia
    pub inertia_ratio: f32,

    /// Signals on a topic before an input-only topic is reported
    pub input_heavy_min_signals: usize,

    /// Input-heavy topics reported
    pub input_heavy_top: usize,

    /// Strength at or above which a never-enacted conviction is a say/do gap
    pub say_do_min_score: f32,

    /// Strength below which convictions are left out of the output-only check
    pub output_only_min_score: f32,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            relevance_distance: 0.8,
            recall_limit: 20,
            explore_limit: 10,
            explore_signals: 6,
            evolution_convictions: 8,
            evolution_traces: 15,
            connection_limit: 8,
            inertia_min_traces: 10,
            inertia_ratio: 0.4,
            input_heavy_min_signals: 5,
            input_heavy_top: 10,
            say_do_min_score: 0.5,
            output_only_min_score: 0.3,
        }
    }
}

/// Resolve an API key from an environment variable reference.
///
/// Tries the reference as written, then its UPPER_CASE form.
pub fn resolve_api_key(key_ref: &str) -> Option<String> {
    std::env::var(key_ref)
        .or_else(|_| std::env::var(key_ref.to_uppercase()))
        .ok()
}
