//! Derived-layer engines
//!
//! Each engine mutates an in-memory [`Snapshot`](crate::store::Snapshot);
//! the caller holds the owner lock, loads the snapshot, runs one or more
//! engines and commits the result as a new generation.
//!
//! ```text
//! signals ──► ConvictionEngine ──► Deduplicator ──► ContradictionScanner
//!                    │
//!                    └──► TraceExtractor ──► FrameEngine ──► IdentityPromoter
//!                                  │
//!                                  └──► DecisionTracker (outcomes)
//! ```

pub mod contradiction;
pub mod conviction;
pub mod dedup;
pub mod followup;
pub mod frame;
pub mod identity;
pub mod parse;
pub mod trace;

pub use contradiction::{ContradictionReport, ContradictionScanner};
pub use conviction::{ConvictionEngine, DetectReport};
pub use dedup::{DedupReport, Deduplicator, MergePlan};
pub use followup::{DecisionTracker, Followup, OutcomeUpdate};
pub use frame::{FrameEngine, FrameReport};
pub use identity::{IdentityPromoter, IdentityReport};
pub use trace::{ExtractReport, TraceExtractor};

use crate::backend::{Embedder, Generator};
use std::sync::Arc;

/// External services shared by the engines
#[derive(Clone)]
pub struct Services {
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn Generator>,
    /// Maximum generation calls in flight per batch
    pub concurrency: usize,
}
