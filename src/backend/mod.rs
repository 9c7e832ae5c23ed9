//! External collaborators, consumed through traits
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │  Embedder    │   │  Generator   │   │   RecordStore    │
//! │ encode/batch │   │ complete/    │   │ append, load,    │
//! │ L2-normalized│   │ batch (tier) │   │ search, by ids   │
//! └──────┬───────┘   └──────┬───────┘   └────────┬─────────┘
//!   Hashing | Http      ChatGenerator      JsonlRecordStore
//!                     (Local | Gateway)
//! ```
//!
//! Implementations are selected from configuration once at startup.

pub mod embedder;
pub mod generator;
pub mod record_store;

pub use embedder::{build_embedder, Embedder, HashingEmbedder, HttpEmbedder};
pub use generator::{build_generator, ChatGenerator, Generator, Tier};
pub use record_store::{JsonlRecordStore, RecordStore, SignalFilter, StoredSignal};
