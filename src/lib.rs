//! Mindstack - Layered Belief Model Engine
//!
//! Mindstack derives an evolving model of one person's belief system from
//! discrete observations ("signals") and answers questions or writes
//! content consistent with that model.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          Mindstack (pipeline)                        │
//! │                                                                      │
//! │   signals ──► RecordStore (signals.jsonl + embeddings)               │
//! │                    │                                                 │
//! │  ┌─────────────────▼─────────────────────────────────────────────┐   │
//! │  │                     Derived-layer engines                     │   │
//! │  │  ConvictionEngine ─► Deduplicator ─► ContradictionScanner     │   │
//! │  │  TraceExtractor ─► FrameEngine ─► IdentityPromoter            │   │
//! │  │  DecisionTracker (follow-ups, outcomes)                       │   │
//! │  └─────────────────┬─────────────────────────────────────────────┘   │
//! │                    │ commit                                          │
//! │  ┌─────────────────▼─────────────────────────────────────────────┐   │
//! │  │        LayerStore: versioned snapshots + vector index         │   │
//! │  └─────────────────┬─────────────────────────────────────────────┘   │
//! │                    │ pinned generation                               │
//! │  ┌─────────────────▼─────────────────────────────────────────────┐   │
//! │  │  SessionCache ─► Retriever ─► Responder (query/generate/ask)  │   │
//! │  │                └─► Explorer (recall/explore/blindspots)       │   │
//! │  └───────────────────────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────────┘
//!            │ Embedder                          │ Generator
//!            ▼                                   ▼
//!     hashing / HTTP /embeddings       OpenAI-compatible /chat/completions
//! ```
//!
//! ## Layers
//!
//! 1. Signal: an atomic observation, owned by the record store
//! 2. Conviction: a belief backed by corroborating signals
//! 3. ReasoningTrace: one reconstructed decision episode
//! 4. ContextFrame: a recurring situational reasoning pattern
//! 5. IdentityCore: a conviction present in nearly every frame
//!
//! ## Modules
//!
//! - [`model`]: layer data types and the id-indexed arena
//! - [`backend`]: record store, embedding and generation services
//! - [`store`]: versioned snapshot persistence and the vector index
//! - [`engine`]: derived-layer engines
//! - [`query`]: sessions, retrieval, exploration and response generation
//! - [`pipeline`]: owner-level operations and batch runs
//! - [`config`]: configuration management

pub mod backend;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod query;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::MindstackConfig;
pub use error::{Error, Result};
pub use pipeline::Mindstack;
