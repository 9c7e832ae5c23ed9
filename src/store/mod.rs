//! Derived-layer persistence
//!
//! Directory layout:
//! ```text
//! <data_dir>/<owner>/
//! ├── signals.jsonl                 record store (see backend::record_store)
//! ├── CURRENT                       committed generation number
//! ├── snapshots/
//! │   ├── gen-000006/
//! │   └── gen-000007/
//! │       ├── convictions.jsonl
//! │       ├── traces.jsonl
//! │       ├── frames.jsonl
//! │       ├── identity.jsonl
//! │       ├── checked_pairs.jsonl
//! │       └── index.json            optional vector index
//! └── digests/
//!     └── 2025-03-14.json
//! ```
//!
//! A generation directory is fully written under a `.partial` name, renamed
//! into place, and only then published by atomically replacing `CURRENT`.
//! Readers always see one complete generation.

pub mod index;
pub mod jsonl;
pub mod layers;
pub mod snapshot;

pub use index::{IndexEntry, IndexKind, VectorIndex};
pub use layers::{LayerStore, OwnerLocks};
pub use snapshot::Snapshot;

use crate::error::{Error, Result};

/// Reject owner ids that are empty or could escape the data directory.
pub fn validate_owner(owner: &str) -> Result<()> {
    let valid = !owner.is_empty()
        && owner.len() <= 128
        && owner
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        && owner != "."
        && owner != "..";
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!("Invalid owner id: {:?}", owner)))
    }
}
