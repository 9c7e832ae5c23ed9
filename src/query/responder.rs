//! Answering and content generation over a context bundle
//!
//! Both modes share one retrieval pass and one prompt skeleton; they differ
//! in retrieval limits and in the instructions appended at the end.

use super::retrieval::{ContextBundle, MatchMethod, Retriever};
use super::session::QuerySession;
use crate::backend::{Generator, Tier};
use crate::engine::parse::truncate_chars;
use crate::error::{Error, Result};
use serde::Serialize;
use std::sync::Arc;

const MAX_EVIDENCE_CHARS: usize = 150;

/// Kind of content produced in generate mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    Article,
    Post,
    Decision,
    Script,
}

impl OutputType {
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "article" => Some(Self::Article),
            "post" => Some(Self::Post),
            "decision" => Some(Self::Decision),
            "script" => Some(Self::Script),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Article => "article",
            Self::Post => "post",
            Self::Decision => "decision",
            Self::Script => "script",
        }
    }

    fn guide(self) -> &'static str {
        match self {
            Self::Article => {
                "Write a complete article. Open with a hook (a story, a question or a \
                 counter-intuitive claim), develop the argument from the beliefs and \
                 reasoning examples with personal experience and concrete cases, and close \
                 by returning to the core belief with a clear call to action. \
                 Length: 800-1500 words."
            }
            Self::Post => {
                "Write a social media post. Start with a one-line hook, keep short \
                 sentences and paragraphs with a steady rhythm, and end with a call to \
                 action or a question that invites discussion. Length: 200-400 words."
            }
            Self::Decision => {
                "Analyze this decision the way this person reasons. List the core \
                 considerations, weigh the options through their beliefs and reasoning \
                 style, and give a clear recommendation with next steps. \
                 Length: 300-600 words."
            }
            Self::Script => {
                "Write a short video script. Hook the viewer in the first 3 seconds, use \
                 spoken language at a fast pace with one point per segment, and end with a \
                 call to action. Length: 200-400 words, with segments and estimated seconds \
                 marked."
            }
        }
    }
}

impl std::fmt::Display for OutputType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutputType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| Error::Config(format!("Unknown output type: {}", s)))
    }
}

/// Routing decision for free-form input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Query,
    Generate(OutputType),
}

/// Keyword intent routing; anything that is not an explicit production
/// request is a query.
pub fn classify_intent(text: &str) -> Intent {
    const ROUTES: &[(OutputType, &[&str])] = &[
        (OutputType::Script, &["video script", "write a script", "a script for", "腳本", "短影音"]),
        (
            OutputType::Article,
            &["write an article", "write a blog", "draft an article", "寫一篇", "幫我寫", "寫文章", "撰寫"],
        ),
        (
            OutputType::Post,
            &["write a post", "social post", "tweet", "threads", "貼文", "發文", "po文"],
        ),
        (
            OutputType::Decision,
            &["help me decide", "which should i choose", "should i choose", "decision analysis", "幫我決定", "該選哪個", "怎麼選"],
        ),
    ];
    let lowered = text.to_lowercase();
    for (output_type, keywords) in ROUTES {
        if keywords.iter().any(|kw| lowered.contains(kw)) {
            return Intent::Generate(*output_type);
        }
    }
    Intent::Query
}

/// Summary of the retrieval behind a response
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalSummary {
    pub matched_frame: Option<String>,
    pub match_method: Option<MatchMethod>,
    pub activated_convictions: Vec<String>,
    pub relevant_traces: usize,
    pub identity_constraints: Vec<String>,
    pub low_confidence: bool,
    pub is_temporal: bool,
}

impl From<&ContextBundle> for RetrievalSummary {
    fn from(bundle: &ContextBundle) -> Self {
        Self {
            matched_frame: bundle.matched_frame.as_ref().map(|f| f.name.clone()),
            match_method: bundle.match_method,
            activated_convictions: bundle
                .activated_convictions
                .iter()
                .map(|c| c.statement.clone())
                .collect(),
            relevant_traces: bundle.relevant_traces.len(),
            identity_constraints: bundle
                .identity_constraints
                .iter()
                .map(|i| i.core_belief.clone())
                .collect(),
            low_confidence: bundle.low_confidence,
            is_temporal: bundle.is_temporal,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryAnswer {
    pub response: String,
    #[serde(flatten)]
    pub retrieval: RetrievalSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedContent {
    pub content: String,
    pub output_type: OutputType,
    #[serde(flatten)]
    pub retrieval: RetrievalSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AskResponse {
    Query(QueryAnswer),
    Generate(GeneratedContent),
}

/// Retrieval plus strong-tier generation
pub struct Responder {
    retriever: Retriever,
    generator: Arc<dyn Generator>,
}

impl Responder {
    pub fn new(retriever: Retriever, generator: Arc<dyn Generator>) -> Self {
        Self {
            retriever,
            generator,
        }
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    /// Answer a question in the owner's voice
    pub async fn query(
        &self,
        session: &QuerySession,
        question: &str,
        caller: Option<&str>,
    ) -> Result<QueryAnswer> {
        let bundle = self
            .retriever
            .retrieve(session, question, caller, self.retriever.query_limits())
            .await?;
        let response = self
            .generator
            .complete(&query_prompt(&bundle), Tier::Strong)
            .await?;
        Ok(QueryAnswer {
            response: response.trim().to_string(),
            retrieval: RetrievalSummary::from(&bundle),
        })
    }

    /// Produce content of `output_type` for a task
    pub async fn generate(
        &self,
        session: &QuerySession,
        task: &str,
        output_type: OutputType,
        extra_instructions: Option<&str>,
        caller: Option<&str>,
    ) -> Result<GeneratedContent> {
        let bundle = self
            .retriever
            .retrieve(session, task, caller, self.retriever.generate_limits())
            .await?;
        let prompt = generation_prompt(&bundle, output_type, extra_instructions);
        let content = self.generator.complete(&prompt, Tier::Strong).await?;
        Ok(GeneratedContent {
            content: content.trim().to_string(),
            output_type,
            retrieval: RetrievalSummary::from(&bundle),
        })
    }

    /// Route free-form input to query or generate mode
    pub async fn ask(
        &self,
        session: &QuerySession,
        text: &str,
        caller: Option<&str>,
    ) -> Result<AskResponse> {
        match classify_intent(text) {
            Intent::Generate(output_type) => {
                tracing::debug!("Routing to generate mode ({})", output_type);
                self.generate(session, text, output_type, None, caller)
                    .await
                    .map(AskResponse::Generate)
            }
            Intent::Query => self.query(session, text, caller).await.map(AskResponse::Query),
        }
    }
}

// =============================================================================
// Prompts
// =============================================================================

struct PromptParts {
    frame_info: String,
    caller_info: String,
    convictions: String,
    traces: String,
    identity: String,
    evidence: String,
    confidence_note: &'static str,
    temporal_note: &'static str,
}

impl PromptParts {
    fn new(bundle: &ContextBundle) -> Self {
        let convictions = if bundle.activated_convictions.is_empty() {
            "(no specific belief activated)".to_string()
        } else {
            bundle
                .activated_convictions
                .iter()
                .map(|c| format!("- {} (strength: {:.2})", c.statement, c.strength.score))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let trace_limit = if bundle.is_temporal {
            bundle.relevant_traces.len()
        } else {
            5
        };
        let traces = if bundle.relevant_traces.is_empty() {
            "(no related reasoning examples)".to_string()
        } else {
            bundle
                .relevant_traces
                .iter()
                .take(trace_limit)
                .map(|t| {
                    let steps: Vec<&str> = t.reasoning_path.steps.iter().map(|s| s.action.as_str()).collect();
                    let date_prefix = if bundle.is_temporal {
                        format!("[{}] ", t.source.date)
                    } else {
                        String::new()
                    };
                    format!(
                        "- {}Situation: {}\n  Reasoning: {} ({})\n  Conclusion: {}",
                        date_prefix,
                        t.trigger.situation,
                        steps.join(" -> "),
                        t.reasoning_path.style.as_str(),
                        t.conclusion.decision
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        let identity = if bundle.identity_constraints.is_empty() {
            "(no identity constraints)".to_string()
        } else {
            bundle
                .identity_constraints
                .iter()
                .map(|i| format!("- {}", i.core_belief))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let mut frame_info = String::new();
        if let Some(frame) = &bundle.matched_frame {
            frame_info.push_str(&format!("Situational frame: {}\nDescription: {}\n", frame.name, frame.description));
            if let Some(tone) = frame.voice.tone {
                frame_info.push_str(&format!("Tone: {}\n", tone.as_str()));
            }
            if !frame.voice.typical_phrases.is_empty() {
                frame_info.push_str(&format!("Typical phrases: {}\n", frame.voice.typical_phrases.join(", ")));
            }
            if !frame.voice.avoids.is_empty() {
                frame_info.push_str(&format!("Avoids: {}\n", frame.voice.avoids.join(", ")));
            }
            if let Some(style) = frame.patterns.preferred_style {
                frame_info.push_str(&format!("Reasoning style: {}\n", style.as_str()));
            }
        }

        let quotes: Vec<String> = bundle
            .evidence
            .iter()
            .map(|s| s.content.text.trim())
            .filter(|t| !t.is_empty())
            .map(|t| format!("- \"{}\"", truncate_chars(t, MAX_EVIDENCE_CHARS)))
            .collect();
        let evidence = if quotes.is_empty() {
            String::new()
        } else {
            format!(
                "Things this person actually said (supporting evidence, quote sparingly):\n{}",
                quotes.join("\n")
            )
        };

        Self {
            frame_info,
            caller_info: bundle
                .caller
                .as_ref()
                .map(|c| format!("Asked by: {}", c))
                .unwrap_or_default(),
            convictions,
            traces,
            identity,
            evidence,
            confidence_note: if bundle.low_confidence {
                "\nNote: there is little on record about this topic. If you are not sure \
                 where this person stands, say so plainly instead of guessing.\n"
            } else {
                ""
            },
            temporal_note: if bundle.is_temporal {
                "\nThis question is about change over time. The reasoning examples above \
                 are in date order; pay attention to how the view differs between periods \
                 instead of only the latest one.\n"
            } else {
                ""
            },
        }
    }
}

/// Prompt for answering a question in the owner's voice
pub fn query_prompt(bundle: &ContextBundle) -> String {
    let p = PromptParts::new(bundle);
    format!(
        r#"You are answering as a specific person, following how they think.

{frame_info}
{caller_info}

This person's core beliefs:
{convictions}

Identity core (a guardrail: correct the answer only if it clearly contradicts these, do not make them the theme):
{identity}

How this person reasoned in similar situations:
{traces}

{evidence}
{confidence_note}{temporal_note}
Question: {question}

Answer in this person's way of thinking, reasoning style and tone.
Requirements:
- Answer in the first person
- Let the beliefs and reasoning examples above drive the content; do not always converge on the same conclusion
- Match the tone of the situational frame
- Moderate length (100-300 words)
- You may cite past reasoning or quotes as support"#,
        frame_info = p.frame_info,
        caller_info = p.caller_info,
        convictions = p.convictions,
        identity = p.identity,
        traces = p.traces,
        evidence = p.evidence,
        confidence_note = p.confidence_note,
        temporal_note = p.temporal_note,
        question = bundle.question,
    )
}

/// Prompt for producing content of one output type
pub fn generation_prompt(
    bundle: &ContextBundle,
    output_type: OutputType,
    extra_instructions: Option<&str>,
) -> String {
    let p = PromptParts::new(bundle);
    let extra = extra_instructions
        .filter(|e| !e.trim().is_empty())
        .map(|e| format!("\nAdditional requirements: {}", e.trim()))
        .unwrap_or_default();
    format!(
        r#"You are producing content in a specific person's way of thinking and style.

{frame_info}

This person's core beliefs:
{convictions}

Identity core (a guardrail: correct the content only if it clearly contradicts these, not a theme for every piece):
{identity}

How this person reasoned in similar situations:
{traces}

{evidence}
{confidence_note}{temporal_note}
Task: {task}

Output format: {guide}
{extra}

Requirements:
- Write in the first person
- Let the beliefs and reasoning examples above drive the content; do not always converge on the same conclusion
- Match the tone of the situational frame
- Keep this person's habits of wording, typical phrasing and way of thinking
- Make concrete points supported by the reasoning, cases or quotes above"#,
        frame_info = p.frame_info,
        convictions = p.convictions,
        identity = p.identity,
        traces = p.traces,
        evidence = p.evidence,
        confidence_note = p.confidence_note,
        temporal_note = p.temporal_note,
        task = bundle.question,
        guide = output_type.guide(),
        extra = extra,
    )
}
