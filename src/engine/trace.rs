//! Reasoning trace extraction from output signals
//!
//! Output signals that carry reasoning are grouped by (date, context) and
//! sent to the generator in chunks together with the owner's active
//! convictions. Each returned trace is parsed on its own; a malformed trace
//! never takes down the rest of its group.

use super::parse::parse_json_object;
use super::Services;
use crate::backend::{StoredSignal, Tier};
use crate::config::TraceConfig;
use crate::error::Result;
use crate::model::*;
use crate::store::Snapshot;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractReport {
    pub candidates: usize,
    pub groups: usize,
    pub failed_groups: usize,
    pub invalid_traces: usize,
    pub created: Vec<String>,
}

impl ExtractReport {
    pub fn changed(&self) -> bool {
        !self.created.is_empty()
    }
}

/// One chunk of signals sharing a date and context
struct Group<'a> {
    date: NaiveDate,
    context: String,
    signals: Vec<&'a Signal>,
}

// =============================================================================
// Generator output shape
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(default)]
    traces: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawTrace {
    #[serde(default)]
    from_signals: Vec<usize>,
    trigger: RawTrigger,
    #[serde(default)]
    activated_convictions: Vec<RawActivation>,
    reasoning_path: RawPath,
    conclusion: RawConclusion,
}

#[derive(Debug, Deserialize)]
struct RawTrigger {
    situation: String,
    stimulus_type: StimulusType,
}

#[derive(Debug, Deserialize)]
struct RawActivation {
    conviction_id: String,
    role: Role,
    #[serde(default)]
    activation_note: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPath {
    steps: Vec<RawStep>,
    style: ReasoningStyle,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    action: StepAction,
    description: String,
    #[serde(default)]
    uses_conviction: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawConclusion {
    decision: String,
    confidence: ConclusionConfidence,
    #[serde(default)]
    alternative_considered: Option<String>,
}

pub struct TraceExtractor {
    config: TraceConfig,
    services: Services,
}

impl TraceExtractor {
    pub fn new(config: TraceConfig, services: Services) -> Self {
        Self { config, services }
    }

    /// Extract traces from signals no trace was built from and append them to
    /// `snapshot`.
    pub async fn extract(&self, snapshot: &mut Snapshot, records: &[StoredSignal]) -> Result<ExtractReport> {
        let mut report = ExtractReport::default();

        let used: HashSet<&str> = snapshot
            .traces
            .iter()
            .flat_map(|t| [t.trigger.from_signal.as_deref(), t.conclusion.output_signal.as_deref()])
            .flatten()
            .collect();

        let candidates: Vec<&Signal> = records
            .iter()
            .map(|r| &r.signal)
            .filter(|s| {
                s.is_active()
                    && s.direction == Direction::Output
                    && s.modality.is_extractable()
                    && !used.contains(s.id.as_str())
            })
            .collect();
        report.candidates = candidates.len();
        if candidates.is_empty() {
            return Ok(report);
        }

        let groups = self.group(&candidates);
        report.groups = groups.len();
        let catalog = conviction_catalog(snapshot, self.config.max_convictions_in_prompt);
        let prompts: Vec<String> = groups.iter().map(|g| group_prompt(g, &catalog)).collect();
        let answers = self
            .services
            .generator
            .complete_batch(&prompts, Tier::Light, self.services.concurrency)
            .await;

        let mut new_traces = Vec::new();
        for (group, answer) in groups.iter().zip(answers) {
            let text = match answer {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(
                        "Failed to extract traces for {} / {}: {}",
                        group.date,
                        group.context,
                        e
                    );
                    report.failed_groups += 1;
                    continue;
                }
            };
            let Some(response) = parse_json_object::<RawResponse>(&text) else {
                tracing::warn!("Malformed trace response for {} / {}", group.date, group.context);
                report.failed_groups += 1;
                continue;
            };
            for value in response.traces {
                match serde_json::from_value::<RawTrace>(value) {
                    Ok(raw) => new_traces.push(build_trace(&snapshot.owner, raw, group, snapshot)),
                    Err(e) => {
                        tracing::debug!("Skipping invalid trace: {}", e);
                        report.invalid_traces += 1;
                    }
                }
            }
        }

        for trace in new_traces {
            report.created.push(trace.id.clone());
            snapshot.traces.insert(trace);
        }
        tracing::info!(
            "Trace extraction for {}: {} candidates in {} groups, {} traces",
            snapshot.owner,
            report.candidates,
            report.groups,
            report.created.len()
        );
        Ok(report)
    }

    /// Group by (date, context) in sorted order and split into chunks
    fn group<'a>(&self, candidates: &[&'a Signal]) -> Vec<Group<'a>> {
        let mut by_key: BTreeMap<(NaiveDate, String), Vec<&'a Signal>> = BTreeMap::new();
        for signal in candidates {
            by_key
                .entry((signal.source.date, signal.source.context.clone()))
                .or_default()
                .push(signal);
        }

        let chunk_size = self.config.chunk_size.max(1);
        let mut groups = Vec::new();
        for ((date, context), signals) in by_key {
            for chunk in signals.chunks(chunk_size) {
                groups.push(Group {
                    date,
                    context: context.clone(),
                    signals: chunk.to_vec(),
                });
            }
        }
        if let Some(limit) = self.config.max_groups {
            groups.truncate(limit);
        }
        groups
    }
}

/// Convert one parsed trace, mapping signal indexes back to ids and dropping
/// conviction ids the snapshot does not know
fn build_trace(owner: &str, raw: RawTrace, group: &Group<'_>, snapshot: &Snapshot) -> ReasoningTrace {
    let signal_ids: Vec<String> = raw
        .from_signals
        .iter()
        .filter(|&&i| i >= 1 && i <= group.signals.len())
        .map(|&i| group.signals[i - 1].id.clone())
        .collect();
    let known = |id: &str| snapshot.convictions.contains(id);

    let mut activated: Vec<ActivatedConviction> = Vec::new();
    for ac in raw.activated_convictions {
        if !known(&ac.conviction_id) {
            tracing::debug!("Dropping unknown conviction {}", ac.conviction_id);
            continue;
        }
        if activated.iter().any(|a| a.conviction_id == ac.conviction_id) {
            continue;
        }
        activated.push(ActivatedConviction {
            conviction_id: ac.conviction_id,
            role: ac.role,
            note: ac.activation_note.filter(|n| !n.trim().is_empty()),
        });
    }

    let steps = raw
        .reasoning_path
        .steps
        .into_iter()
        .map(|s| ReasoningStep {
            action: s.action,
            description: s.description,
            uses_conviction: s.uses_conviction.filter(|id| known(id)),
        })
        .collect();

    let first = group.signals.first();
    ReasoningTrace {
        owner: owner.to_string(),
        id: short_id("trace"),
        trigger: TraceTrigger {
            situation: raw.trigger.situation,
            stimulus_type: raw.trigger.stimulus_type,
            from_signal: signal_ids.first().cloned(),
        },
        activated_convictions: activated,
        reasoning_path: ReasoningPath {
            steps,
            style: raw.reasoning_path.style,
        },
        conclusion: TraceConclusion {
            decision: raw.conclusion.decision,
            confidence: raw.conclusion.confidence,
            alternative: raw
                .conclusion
                .alternative_considered
                .filter(|a| !a.trim().is_empty()),
            output_signal: signal_ids.first().cloned(),
        },
        outcome: None,
        context_frame_id: None,
        source: TraceSource {
            date: group.date,
            context: Some(group.context.clone()),
            source_file: first.and_then(|s| s.source.source_file.clone()),
            participants: first.map(|s| s.source.participants.clone()).unwrap_or_default(),
        },
    }
}

/// Active convictions, strongest first, one per line
fn conviction_catalog(snapshot: &Snapshot, limit: usize) -> String {
    let mut convictions: Vec<&Conviction> = snapshot.active_convictions().collect();
    convictions.sort_by(|a, b| b.strength.score.total_cmp(&a.strength.score));
    let lines: Vec<String> = convictions
        .iter()
        .take(limit)
        .map(|c| format!("- [{}] {} (strength: {:.2})", c.id, c.statement, c.strength.score))
        .collect();
    if lines.is_empty() {
        "(none yet)".to_string()
    } else {
        lines.join("\n")
    }
}

fn group_prompt(group: &Group<'_>, catalog: &str) -> String {
    let lines: Vec<String> = group
        .signals
        .iter()
        .enumerate()
        .map(|(i, s)| {
            format!(
                "{}. [{}|{}|{}] {}",
                i + 1,
                s.content.kind,
                s.modality.as_str(),
                s.content.confidence.as_deref().unwrap_or("unmarked"),
                s.content.text
            )
        })
        .collect();

    format!(
        r#"Below are several things one person expressed in the same situation.

Date: {date}
Context: {context}
{count} passages:

{signals}

---

The person's currently known beliefs:
{catalog}

Find the passages that contain a reasoning process (facing a problem, thinking it through, reaching a conclusion) and extract reasoning traces.

Notes:
- Not every passage contains reasoning; extract only genuine reasoning
- Several passages may form one trace (describe the problem, analyze, decide)
- Isolated quotes, citations or instructions are not reasoning
- List the passage numbers each trace is based on in from_signals
- Only use conviction ids from the list above

Output JSON (no markdown):

{{
  "traces": [
    {{
      "from_signals": [1, 3],
      "trigger": {{
        "situation": "what triggered the reasoning",
        "stimulus_type": "question_received|problem_encountered|decision_required|opinion_challenged|opportunity_spotted|conflict_to_resolve|teaching_moment|self_reflection"
      }},
      "activated_convictions": [
        {{"conviction_id": "conv_...", "role": "premise|framework|evidence|constraint|value_anchor|counterpoint", "activation_note": "why it was activated"}}
      ],
      "reasoning_path": {{
        "steps": [
          {{"action": "empathize|reframe|analyze|compare|recall_experience|apply_framework|challenge_assumption|weigh_tradeoff|synthesize|decide", "description": "what this step did", "uses_conviction": "conv_... or null"}}
        ],
        "style": "analytical|intuitive|storytelling|socratic|first_principles|pattern_matching|empathy_driven"
      }},
      "conclusion": {{"decision": "final conclusion", "confidence": "high|medium|low|uncertain", "alternative_considered": "alternative that was rejected, or null"}}
    }}
  ]
}}

If the passages contain no clear reasoning, return {{"traces": []}}"#,
        date = group.date,
        context = group.context,
        count = group.signals.len(),
        signals = lines.join("\n"),
        catalog = catalog,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use std::sync::Arc;

    const RESPONSE: &str = r#"```json
{"traces": [
  {"from_signals": [2, 1],
   "trigger": {"situation": "Client asks for a discount", "stimulus_type": "decision_required"},
   "activated_convictions": [
     {"conviction_id": "conv_a", "role": "value_anchor", "activation_note": "price reflects value"},
     {"conviction_id": "conv_ghost", "role": "premise"}
   ],
   "reasoning_path": {"steps": [
     {"action": "analyze", "description": "look at margins", "uses_conviction": "conv_ghost"},
     {"action": "decide", "description": "hold the price", "uses_conviction": "conv_a"}
   ], "style": "analytical"},
   "conclusion": {"decision": "No discount", "confidence": "high", "alternative_considered": null}},
  {"from_signals": [1],
   "trigger": {"situation": "x", "stimulus_type": "not_a_type"},
   "reasoning_path": {"steps": [], "style": "analytical"},
   "conclusion": {"decision": "y", "confidence": "low"}}
]}
```"#;

    fn extractor(generator: ScriptedGenerator, config: TraceConfig) -> TraceExtractor {
        let services = Services {
            embedder: Arc::new(StubEmbedder::new(8)),
            generator: Arc::new(generator),
            concurrency: 2,
        };
        TraceExtractor::new(config, services)
    }

    fn stored(signal: Signal) -> StoredSignal {
        StoredSignal {
            signal,
            embedding: vec![1.0, 0.0],
        }
    }

    #[tokio::test]
    async fn test_extract_parses_and_filters() {
        let mut snapshot = Snapshot::empty(OWNER);
        snapshot.convictions.insert(make_conviction("conv_a", "Price reflects value", 0.8));
        let records = vec![
            stored(make_signal("s1", Direction::Output, Modality::SpokenSpontaneous, 3, "sales")),
            stored(make_signal("s2", Direction::Output, Modality::Decided, 3, "sales")),
            stored(make_signal("s3", Direction::Input, Modality::Consumed, 3, "sales")),
            stored(make_signal("s4", Direction::Output, Modality::WrittenCasual, 3, "sales")),
        ];
        let generator = ScriptedGenerator::new(RESPONSE);
        let extractor = extractor(generator, TraceConfig::default());

        let report = extractor.extract(&mut snapshot, &records).await.unwrap();
        assert_eq!(report.candidates, 2);
        assert_eq!(report.groups, 1);
        assert_eq!(report.invalid_traces, 1);
        assert_eq!(report.created.len(), 1);

        let trace = snapshot.traces.get(&report.created[0]).unwrap();
        assert!(trace.id.starts_with("trace_"));
        assert_eq!(trace.trigger.from_signal.as_deref(), Some("s2"));
        assert_eq!(trace.conclusion.output_signal.as_deref(), Some("s2"));
        assert_eq!(trace.activated_convictions.len(), 1);
        assert_eq!(trace.activated_convictions[0].role, Role::ValueAnchor);
        assert_eq!(trace.reasoning_path.steps[0].uses_conviction, None);
        assert_eq!(trace.reasoning_path.steps[1].uses_conviction.as_deref(), Some("conv_a"));
        assert_eq!(trace.source.context.as_deref(), Some("sales"));
        assert_eq!(trace.source.date, date(3));
        assert!(snapshot.dangling_references().is_empty());

        // s2 is used by the trace, s1 is still open
        let again = extractor.extract(&mut snapshot, &records).await.unwrap();
        assert_eq!(again.candidates, 1);
    }

    #[tokio::test]
    async fn test_late_signal_on_traced_day_is_still_extracted() {
        let mut snapshot = Snapshot::empty(OWNER);
        let mut old = make_trace("trace_old", &[], 3);
        old.trigger.from_signal = Some("s_old".into());
        old.conclusion.output_signal = Some("s_old".into());
        old.source.context = Some("sales".into());
        snapshot.traces.insert(old);
        let records = vec![
            stored(make_signal("s_old", Direction::Output, Modality::Decided, 3, "sales")),
            stored(make_signal("s_new", Direction::Output, Modality::Decided, 3, "sales")),
        ];
        let generator = ScriptedGenerator::new(r#"{"traces": []}"#);
        let extractor = extractor(generator, TraceConfig::default());

        let report = extractor.extract(&mut snapshot, &records).await.unwrap();
        assert_eq!(report.candidates, 1);
        assert_eq!(report.groups, 1);
    }

    #[tokio::test]
    async fn test_groups_chunked_and_limited() {
        let mut snapshot = Snapshot::empty(OWNER);
        let mut records = Vec::new();
        for i in 0..5 {
            records.push(stored(make_signal(&format!("a{i}"), Direction::Output, Modality::WrittenDeliberate, 1, "blog")));
        }
        records.push(stored(make_signal("b0", Direction::Output, Modality::WrittenDeliberate, 2, "blog")));
        records.push(stored(make_signal("c0", Direction::Output, Modality::WrittenDeliberate, 1, "call")));

        let config = TraceConfig {
            chunk_size: 2,
            max_groups: Some(4),
            ..TraceConfig::default()
        };
        let generator = ScriptedGenerator::new(r#"{"traces": []}"#);
        let extractor = extractor(generator, config);
        let report = extractor.extract(&mut snapshot, &records).await.unwrap();
        // (1, blog) → 3 chunks, (1, call) → 1, (2, blog) cut by the limit
        assert_eq!(report.groups, 4);
        assert!(report.created.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_group_response_skipped() {
        let mut snapshot = Snapshot::empty(OWNER);
        let records = vec![stored(make_signal("s1", Direction::Output, Modality::Decided, 1, "x"))];
        let extractor = extractor(ScriptedGenerator::new("I could not find anything"), TraceConfig::default());
        let report = extractor.extract(&mut snapshot, &records).await.unwrap();
        assert_eq!(report.failed_groups, 1);
        assert!(snapshot.traces.is_empty());
    }

    #[test]
    fn test_group_prompt_lists_signals_and_convictions() {
        let mut snapshot = Snapshot::empty(OWNER);
        snapshot.convictions.insert(make_conviction("conv_a", "Price reflects value", 0.8));
        let signal = make_signal("s1", Direction::Output, Modality::Decided, 1, "sales");
        let group = Group {
            date: date(1),
            context: "sales".into(),
            signals: vec![&signal],
        };
        let prompt = group_prompt(&group, &conviction_catalog(&snapshot, 10));
        assert!(prompt.contains("1. [belief|decided|unmarked] signal text s1"));
        assert!(prompt.contains("- [conv_a] Price reflects value (strength: 0.80)"));
        assert!(prompt.contains("Context: sales"));
    }
}
