//! Read path: sessions, retrieval and response generation
//!
//! Queries never touch the layer files directly. They run against a
//! [`QuerySession`] pinned to one committed generation and its vector index,
//! served from the [`SessionCache`] until a writer commits a newer one.

pub mod explorer;
pub mod indexer;
pub mod responder;
pub mod retrieval;
pub mod session;

pub use explorer::{
    Blindspots, Connections, Evolution, Exploration, ExploreDepth, Explorer, RecallHit, RecallOptions, Simulation,
};
pub use indexer::{build_index, IndexStats};
pub use responder::{
    classify_intent, AskResponse, GeneratedContent, Intent, OutputType, QueryAnswer, Responder,
    RetrievalSummary,
};
pub use retrieval::{ContextBundle, MatchMethod, RetrievalLimits, Retriever};
pub use session::{QuerySession, SessionCache};
