//! One owner's derived layers at one generation

use crate::error::{Error, Result};
use crate::model::{Arena, CheckedPair, ContextFrame, Conviction, IdentityCore, ReasoningTrace};
use std::collections::HashSet;

/// All derived layers of one owner, as of `generation`.
///
/// `generation` is the committed generation this snapshot was loaded from;
/// committing it produces `generation + 1` (or later) and fails if another
/// writer got there first.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub owner: String,
    pub generation: u64,
    pub convictions: Arena<Conviction>,
    pub traces: Arena<ReasoningTrace>,
    pub frames: Arena<ContextFrame>,
    pub identities: Arena<IdentityCore>,
    pub checked_pairs: Vec<CheckedPair>,
}

impl Snapshot {
    /// An owner with no derived data yet
    pub fn empty(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            generation: 0,
            convictions: Arena::new(),
            traces: Arena::new(),
            frames: Arena::new(),
            identities: Arena::new(),
            checked_pairs: Vec::new(),
        }
    }

    pub fn active_convictions(&self) -> impl Iterator<Item = &Conviction> {
        self.convictions.iter().filter(|c| c.is_active())
    }

    pub fn active_frames(&self) -> impl Iterator<Item = &ContextFrame> {
        self.frames.iter().filter(|f| f.is_active())
    }

    /// Describe every reference to one of `ids` anywhere in the snapshot.
    pub fn references_to(&self, ids: &HashSet<String>) -> Vec<String> {
        let mut found = Vec::new();
        self.visit_conviction_refs(|location, id| {
            if ids.contains(id) {
                found.push(format!("{} -> {}", location, id));
            }
        });
        found
    }

    /// Describe every reference to a conviction, trace or frame id that does
    /// not exist in this snapshot.
    pub fn dangling_references(&self) -> Vec<String> {
        let mut found = Vec::new();
        self.visit_conviction_refs(|location, id| {
            if !self.convictions.contains(id) {
                found.push(format!("{} -> {}", location, id));
            }
        });
        for trace in &self.traces {
            if let Some(frame_id) = &trace.context_frame_id {
                if !self.frames.contains(frame_id) {
                    found.push(format!("trace {} frame -> {}", trace.id, frame_id));
                }
            }
        }
        for frame in &self.frames {
            for trace_id in &frame.patterns.historical_traces {
                if !self.traces.contains(trace_id) {
                    found.push(format!("frame {} history -> {}", frame.id, trace_id));
                }
            }
        }
        for identity in &self.identities {
            for frame_id in identity
                .universality
                .active_in_frames
                .iter()
                .chain(identity.expressions.iter().map(|e| &e.frame_id))
            {
                if !self.frames.contains(frame_id) {
                    found.push(format!("identity {} frame -> {}", identity.id, frame_id));
                }
            }
        }
        found
    }

    /// Fail with a consistency error if any id in `removed` is still referenced.
    pub fn verify_removed(&self, removed: &HashSet<String>) -> Result<()> {
        let refs = self.references_to(removed);
        if refs.is_empty() {
            return Ok(());
        }
        Err(Error::Consistency(format!(
            "{} reference(s) to removed convictions remain, first: {}",
            refs.len(),
            refs[0]
        )))
    }

    /// Call `visit(location, conviction_id)` for every conviction reference
    fn visit_conviction_refs<'a>(&'a self, mut visit: impl FnMut(String, &'a str)) {
        for conviction in &self.convictions {
            for tension in &conviction.tensions {
                visit(format!("conviction {} tension", conviction.id), &tension.opposing_id);
            }
            if let Some(by) = &conviction.lifecycle.superseded_by {
                visit(format!("conviction {} superseded_by", conviction.id), by);
            }
        }
        for trace in &self.traces {
            for id in trace.conviction_refs() {
                visit(format!("trace {}", trace.id), id);
            }
        }
        for frame in &self.frames {
            for id in frame.conviction_ids() {
                visit(format!("frame {}", frame.id), id);
            }
        }
        for identity in &self.identities {
            visit(format!("identity {}", identity.id), &identity.conviction_id);
        }
        for checked in &self.checked_pairs {
            for id in &checked.pair {
                visit("checked_pair".to_string(), id);
            }
        }
    }
}
