//! Decision follow-ups and outcome recording
//!
//! Decisions captured in reasoning traces are queued for follow-up once
//! they are old enough for their outcome to be known. Recording an outcome
//! marks the impact on every activated conviction and nudges their trend;
//! the score itself stays evidence-derived.

use crate::config::FollowupConfig;
use crate::error::{Error, Result};
use crate::model::*;
use crate::store::Snapshot;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashSet;

/// A decision due for follow-up
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Followup {
    pub trace_id: String,
    pub decision: String,
    pub confidence: ConclusionConfidence,
    pub date: NaiveDate,
    pub days_ago: i64,
    pub trigger: String,
    pub activated_convictions: Vec<String>,
}

/// Result of recording an outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeUpdate {
    pub trace_id: String,
    pub result: OutcomeResult,
    pub convictions_updated: Vec<String>,
}

pub struct DecisionTracker {
    config: FollowupConfig,
}

impl DecisionTracker {
    pub fn new(config: FollowupConfig) -> Self {
        Self { config }
    }

    /// Decisions without a definite outcome, oldest first
    pub fn pending_followups(&self, snapshot: &Snapshot, today: NaiveDate) -> Vec<Followup> {
        let mut pending: Vec<Followup> = snapshot
            .traces
            .iter()
            .filter(|t| t.conclusion.confidence != ConclusionConfidence::Uncertain)
            .filter(|t| !t.has_definite_outcome())
            .filter(|t| {
                self.config
                    .backfill_cutoff
                    .map_or(true, |cutoff| t.source.date >= cutoff)
            })
            .filter_map(|t| {
                let days_ago = (today - t.source.date).num_days();
                (days_ago >= self.config.tactical_days).then(|| Followup {
                    trace_id: t.id.clone(),
                    decision: t.conclusion.decision.clone(),
                    confidence: t.conclusion.confidence,
                    date: t.source.date,
                    days_ago,
                    trigger: t.trigger.situation.clone(),
                    activated_convictions: t
                        .activated_convictions
                        .iter()
                        .map(|ac| ac.conviction_id.clone())
                        .collect(),
                })
            })
            .collect();
        pending.sort_by(|a, b| b.days_ago.cmp(&a.days_ago).then_with(|| a.trace_id.cmp(&b.trace_id)));
        pending
    }

    /// Record the outcome of a traced decision
    pub fn record_outcome(
        &self,
        snapshot: &mut Snapshot,
        trace_id: &str,
        result: OutcomeResult,
        note: Option<String>,
        today: NaiveDate,
    ) -> Result<OutcomeUpdate> {
        let trace = snapshot
            .traces
            .get_mut(trace_id)
            .ok_or_else(|| Error::NotFound(format!("trace {}", trace_id)))?;

        let effect = ImpactEffect::from(result);
        let mut affected = Vec::new();
        let mut seen = HashSet::new();
        for ac in &trace.activated_convictions {
            if seen.insert(ac.conviction_id.clone()) {
                affected.push(ac.conviction_id.clone());
            }
        }
        trace.outcome = Some(TraceOutcome {
            result,
            note,
            conviction_impact: affected
                .iter()
                .map(|id| ConvictionImpact {
                    conviction_id: id.clone(),
                    effect,
                })
                .collect(),
            recorded_at: today,
        });

        let trend = match result {
            OutcomeResult::Positive => Some(Trend::Strengthening),
            OutcomeResult::Negative => Some(Trend::Weakening),
            _ => None,
        };
        let mut updated = Vec::new();
        if let Some(trend) = trend {
            for id in &affected {
                let Some(conviction) = snapshot.convictions.get_mut(id) else {
                    tracing::debug!("Outcome for {} names missing conviction {}", trace_id, id);
                    continue;
                };
                conviction.strength.trend = trend;
                if result == OutcomeResult::Positive {
                    conviction.lifecycle.last_reinforced = Some(today);
                }
                updated.push(id.clone());
            }
        }

        tracing::info!(
            "Recorded {:?} outcome for {} ({} convictions updated)",
            result,
            trace_id,
            updated.len()
        );
        Ok(OutcomeUpdate {
            trace_id: trace_id.to_string(),
            result,
            convictions_updated: updated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    fn fixture() -> Snapshot {
        let mut snapshot = Snapshot::empty(OWNER);
        snapshot.convictions.insert(make_conviction("conv_a", "Ship early", 0.6));
        snapshot.convictions.insert(make_conviction("conv_b", "Measure twice", 0.5));
        snapshot.traces.insert(make_trace("trace_old", &["conv_a", "conv_b"], 1));
        snapshot.traces.insert(make_trace("trace_mid", &["conv_a"], 5));
        snapshot.traces.insert(make_trace("trace_new", &["conv_b"], 20));
        let mut uncertain = make_trace("trace_unsure", &["conv_a"], 1);
        uncertain.conclusion.confidence = ConclusionConfidence::Uncertain;
        snapshot.traces.insert(uncertain);
        snapshot
    }

    #[test]
    fn test_pending_followups_oldest_first() {
        let snapshot = fixture();
        let tracker = DecisionTracker::new(FollowupConfig::default());
        let pending = tracker.pending_followups(&snapshot, date(25));
        let ids: Vec<&str> = pending.iter().map(|f| f.trace_id.as_str()).collect();
        assert_eq!(ids, vec!["trace_old", "trace_mid"]);
        assert_eq!(pending[0].days_ago, 24);
        assert_eq!(pending[0].activated_convictions, vec!["conv_a", "conv_b"]);
    }

    #[test]
    fn test_pending_followups_respects_cutoff_and_outcomes() {
        let mut snapshot = fixture();
        let tracker = DecisionTracker::new(FollowupConfig {
            backfill_cutoff: Some(date(3)),
            ..FollowupConfig::default()
        });
        assert_eq!(tracker.pending_followups(&snapshot, date(25)).len(), 1);

        tracker
            .record_outcome(&mut snapshot, "trace_mid", OutcomeResult::Pending, None, date(25))
            .unwrap();
        assert_eq!(tracker.pending_followups(&snapshot, date(25)).len(), 1);

        tracker
            .record_outcome(&mut snapshot, "trace_mid", OutcomeResult::Mixed, None, date(25))
            .unwrap();
        assert!(tracker.pending_followups(&snapshot, date(25)).is_empty());
    }

    #[test]
    fn test_positive_outcome_reinforces() {
        let mut snapshot = fixture();
        let tracker = DecisionTracker::new(FollowupConfig::default());
        let update = tracker
            .record_outcome(
                &mut snapshot,
                "trace_old",
                OutcomeResult::Positive,
                Some("Launch went well".to_string()),
                date(25),
            )
            .unwrap();
        assert_eq!(update.convictions_updated, vec!["conv_a", "conv_b"]);

        let trace = snapshot.traces.get("trace_old").unwrap();
        let outcome = trace.outcome.as_ref().unwrap();
        assert_eq!(outcome.recorded_at, date(25));
        assert!(outcome
            .conviction_impact
            .iter()
            .all(|ci| ci.effect == ImpactEffect::Reinforced));

        let conviction = snapshot.convictions.get("conv_a").unwrap();
        assert_eq!(conviction.strength.trend, Trend::Strengthening);
        assert_eq!(conviction.lifecycle.last_reinforced, Some(date(25)));
        assert!((conviction.strength.score - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_negative_outcome_weakens_trend_only() {
        let mut snapshot = fixture();
        let tracker = DecisionTracker::new(FollowupConfig::default());
        tracker
            .record_outcome(&mut snapshot, "trace_new", OutcomeResult::Negative, None, date(25))
            .unwrap();
        let conviction = snapshot.convictions.get("conv_b").unwrap();
        assert_eq!(conviction.strength.trend, Trend::Weakening);
        assert_eq!(conviction.lifecycle.last_reinforced, Some(date(1)));
    }

    #[test]
    fn test_unknown_trace_is_not_found() {
        let mut snapshot = fixture();
        let tracker = DecisionTracker::new(FollowupConfig::default());
        let err = tracker
            .record_outcome(&mut snapshot, "trace_missing", OutcomeResult::Positive, None, date(25))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
