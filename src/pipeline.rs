//! Owner-level operations over the record store and the layer store
//!
//! Every write follows the same cycle under the owner's lock:
//!
//! ```text
//! lock(owner) ─► load snapshot ─► run engine(s) ─► commit generation ─► invalidate session
//! ```
//!
//! Reads go through the session cache and never take the lock.

use crate::backend::{
    build_embedder, build_generator, Embedder, Generator, JsonlRecordStore, RecordStore, StoredSignal, Tier,
};
use crate::config::MindstackConfig;
use crate::engine::*;
use crate::error::{Error, Result};
use crate::model::{OutcomeResult, Signal};
use crate::query::{
    build_index, AskResponse, Blindspots, Connections, Evolution, Exploration, ExploreDepth, Explorer,
    GeneratedContent, IndexStats, OutputType, QueryAnswer, RecallHit, RecallOptions, Responder, Retriever,
    SessionCache, Simulation,
};
use crate::store::{LayerStore, Snapshot};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

const MAX_TOP_TOPICS: usize = 20;
const DIGEST_ITEMS: usize = 3;
const DIGEST_CONVICTIONS: usize = 5;

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub received: usize,
    pub skipped_empty: usize,
    pub appended: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LayerCounts {
    pub generation: u64,
    pub convictions: usize,
    pub active_convictions: usize,
    pub traces: usize,
    pub frames: usize,
    pub identities: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SignalStats {
    pub total: usize,
    pub active: usize,
    pub direction: BTreeMap<String, usize>,
    pub modality: BTreeMap<String, usize>,
    pub authority: BTreeMap<String, usize>,
    pub content_type: BTreeMap<String, usize>,
    pub context: BTreeMap<String, usize>,
    pub earliest: Option<NaiveDate>,
    pub latest: Option<NaiveDate>,
    pub top_topics: Vec<(String, usize)>,
    pub layers: LayerCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyReport {
    pub date: NaiveDate,
    pub owner: String,
    pub detect: DetectReport,
    pub extract: ExtractReport,
    pub contradictions: ContradictionReport,
    pub followups: Vec<Followup>,
    pub digest: Option<String>,
    pub digest_path: Option<PathBuf>,
    pub generation: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub frames: FrameReport,
    pub identity: IdentityReport,
    pub index: IndexStats,
}

/// Entry point for all owner-level operations
pub struct Mindstack {
    config: MindstackConfig,
    services: Services,
    records: Arc<dyn RecordStore>,
    layers: LayerStore,
    sessions: SessionCache,
    responder: Responder,
    explorer: Explorer,
}

impl Mindstack {
    pub fn new(
        config: MindstackConfig,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        let services = Services {
            embedder: embedder.clone(),
            generator: generator.clone(),
            concurrency: config.llm.concurrency.max(1),
        };
        let layers = LayerStore::new(config.storage.data_dir.clone(), config.storage.keep_generations);
        let retriever = Retriever::new(config.query.clone(), embedder.clone(), records.clone());
        Self {
            explorer: Explorer::new(config.explorer.clone(), embedder, records.clone(), generator.clone()),
            responder: Responder::new(retriever, generator),
            config,
            services,
            records,
            layers,
            sessions: SessionCache::new(),
        }
    }

    /// Build the backends selected by configuration
    pub fn from_config(config: MindstackConfig) -> Result<Self> {
        let embedder = build_embedder(&config.embedding)?;
        let generator = build_generator(&config.llm)?;
        let records: Arc<dyn RecordStore> = Arc::new(JsonlRecordStore::new(config.storage.data_dir.clone()));
        tracing::info!(
            "Mindstack data at {} (embedder: {}, generator: {})",
            config.storage.data_dir.display(),
            embedder.name(),
            generator.name()
        );
        Ok(Self::new(config, embedder, generator, records))
    }

    pub fn config(&self) -> &MindstackConfig {
        &self.config
    }

    pub fn layers(&self) -> &LayerStore {
        &self.layers
    }

    /// Latest committed snapshot
    pub async fn snapshot(&self, owner: &str) -> Result<Snapshot> {
        self.layers.load(owner).await
    }

    async fn commit(&self, snapshot: &mut Snapshot) -> Result<u64> {
        let generation = self.layers.commit(snapshot).await?;
        self.sessions.invalidate(&snapshot.owner).await;
        Ok(generation)
    }

    // =========================================================================
    // Signals
    // =========================================================================

    /// Embed and append signals; returns how many ids were new
    pub async fn ingest(&self, owner: &str, signals: Vec<Signal>) -> Result<IngestReport> {
        let mut report = IngestReport {
            received: signals.len(),
            ..IngestReport::default()
        };
        let mut seen = HashSet::new();
        let mut accepted = Vec::new();
        for mut signal in signals {
            if signal.content.text.trim().is_empty() {
                tracing::warn!("Skipping signal {} with empty text", signal.id);
                report.skipped_empty += 1;
                continue;
            }
            if !seen.insert(signal.id.clone()) {
                continue;
            }
            signal.owner = owner.to_string();
            accepted.push(signal);
        }
        if accepted.is_empty() {
            return Ok(report);
        }

        let texts: Vec<String> = accepted.iter().map(|s| s.content.text.clone()).collect();
        let vectors = self.services.embedder.encode_batch(&texts).await?;
        if vectors.len() != accepted.len() {
            return Err(Error::Embedding(format!(
                "Expected {} vectors, got {}",
                accepted.len(),
                vectors.len()
            )));
        }
        let records: Vec<StoredSignal> = accepted
            .into_iter()
            .zip(vectors)
            .map(|(signal, embedding)| StoredSignal { signal, embedding })
            .collect();
        report.appended = self.records.append(owner, records).await?;
        tracing::info!(
            "Ingested {} of {} signals for {}",
            report.appended,
            report.received,
            owner
        );
        Ok(report)
    }

    /// Mark a signal inactive so it no longer feeds clustering
    pub async fn deactivate_signal(&self, owner: &str, signal_id: &str, reason: &str) -> Result<()> {
        if self.records.deactivate(owner, signal_id, reason).await? {
            Ok(())
        } else {
            Err(Error::NotFound(format!("signal {}", signal_id)))
        }
    }

    /// Signal counts by dimension plus derived layer sizes
    pub async fn stats(&self, owner: &str) -> Result<SignalStats> {
        let records = self.records.load_all(owner).await?;
        let snapshot = self.layers.load(owner).await?;

        let mut stats = SignalStats {
            total: records.len(),
            layers: LayerCounts {
                generation: snapshot.generation,
                convictions: snapshot.convictions.len(),
                active_convictions: snapshot.active_convictions().count(),
                traces: snapshot.traces.len(),
                frames: snapshot.frames.len(),
                identities: snapshot.identities.len(),
            },
            ..SignalStats::default()
        };
        let mut topics: HashMap<&str, usize> = HashMap::new();
        for record in &records {
            let signal = &record.signal;
            if signal.is_active() {
                stats.active += 1;
            }
            *stats.direction.entry(signal.direction.as_str().to_string()).or_default() += 1;
            *stats.modality.entry(signal.modality.as_str().to_string()).or_default() += 1;
            let authority = signal.authority.map(|a| a.as_str()).unwrap_or("unknown");
            *stats.authority.entry(authority.to_string()).or_default() += 1;
            *stats.content_type.entry(signal.content.kind.clone()).or_default() += 1;
            *stats.context.entry(signal.source.context.clone()).or_default() += 1;
            for topic in &signal.topics {
                *topics.entry(topic.as_str()).or_default() += 1;
            }
            let date = signal.source.date;
            stats.earliest = Some(stats.earliest.map_or(date, |d| d.min(date)));
            stats.latest = Some(stats.latest.map_or(date, |d| d.max(date)));
        }
        let mut top: Vec<(String, usize)> = topics.into_iter().map(|(t, n)| (t.to_string(), n)).collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(MAX_TOP_TOPICS);
        stats.top_topics = top;
        Ok(stats)
    }

    // =========================================================================
    // Conviction layer
    // =========================================================================

    pub async fn detect(&self, owner: &str, today: NaiveDate) -> Result<DetectReport> {
        let _guard = self.layers.lock(owner).await;
        let records = self.records.load_all(owner).await?;
        let mut snapshot = self.layers.load(owner).await?;
        let engine = ConvictionEngine::new(self.config.conviction.clone(), self.services.clone());
        let report = engine.detect(&mut snapshot, &records, today).await?;
        if report.changed() {
            self.commit(&mut snapshot).await?;
        }
        Ok(report)
    }

    /// Merge duplicate convictions; the whole merge commits or nothing does
    pub async fn dedupe(&self, owner: &str, dry_run: bool) -> Result<DedupReport> {
        let _guard = self.layers.lock(owner).await;
        let mut snapshot = self.layers.load(owner).await?;
        let engine = Deduplicator::new(self.config.dedup.clone(), self.services.clone());
        let report = engine.dedupe(&mut snapshot, dry_run).await?;
        if report.changed() {
            self.commit(&mut snapshot).await.map_err(|e| match e {
                Error::Conflict(_) => e,
                other => Error::Consistency(format!("Merge of {} not committed: {}", owner, other)),
            })?;
        }
        Ok(report)
    }

    pub async fn contradictions(&self, owner: &str, force: bool, today: NaiveDate) -> Result<ContradictionReport> {
        let _guard = self.layers.lock(owner).await;
        let mut snapshot = self.layers.load(owner).await?;
        let scanner = ContradictionScanner::new(self.config.contradiction.clone(), self.services.clone());
        let report = scanner.scan(&mut snapshot, force, today).await?;
        if report.changed() {
            self.commit(&mut snapshot).await?;
        }
        Ok(report)
    }

    // =========================================================================
    // Trace, frame and identity layers
    // =========================================================================

    pub async fn extract(&self, owner: &str) -> Result<ExtractReport> {
        let _guard = self.layers.lock(owner).await;
        let records = self.records.load_all(owner).await?;
        let mut snapshot = self.layers.load(owner).await?;
        let extractor = TraceExtractor::new(self.config.traces.clone(), self.services.clone());
        let report = extractor.extract(&mut snapshot, &records).await?;
        if report.changed() {
            self.commit(&mut snapshot).await?;
        }
        Ok(report)
    }

    pub async fn rebuild_frames(&self, owner: &str, today: NaiveDate) -> Result<FrameReport> {
        let _guard = self.layers.lock(owner).await;
        let mut snapshot = self.layers.load(owner).await?;
        let engine = FrameEngine::new(self.config.frames.clone(), self.services.clone());
        let report = engine.rebuild(&mut snapshot, today).await?;
        self.commit(&mut snapshot).await?;
        Ok(report)
    }

    pub async fn rebuild_identity(&self, owner: &str) -> Result<IdentityReport> {
        let _guard = self.layers.lock(owner).await;
        let mut snapshot = self.layers.load(owner).await?;
        let promoter = IdentityPromoter::new(self.config.identity.clone(), self.services.clone());
        let report = promoter.rebuild(&mut snapshot).await?;
        self.commit(&mut snapshot).await?;
        Ok(report)
    }

    /// Embed the current generation and store its vector index
    pub async fn build_index(&self, owner: &str) -> Result<IndexStats> {
        let _guard = self.layers.lock(owner).await;
        let snapshot = self.layers.load(owner).await?;
        self.index_snapshot(&snapshot).await
    }

    async fn index_snapshot(&self, snapshot: &Snapshot) -> Result<IndexStats> {
        let (index, stats) = build_index(snapshot, self.services.embedder.as_ref()).await?;
        if snapshot.generation == 0 {
            tracing::warn!("Nothing committed for {} yet, index not saved", snapshot.owner);
            return Ok(stats);
        }
        self.layers
            .save_index(&snapshot.owner, snapshot.generation, &index)
            .await?;
        self.sessions.invalidate(&snapshot.owner).await;
        Ok(stats)
    }

    // =========================================================================
    // Decisions
    // =========================================================================

    pub async fn followups(&self, owner: &str, today: NaiveDate) -> Result<Vec<Followup>> {
        let snapshot = self.layers.load(owner).await?;
        Ok(DecisionTracker::new(self.config.followup.clone()).pending_followups(&snapshot, today))
    }

    pub async fn record_outcome(
        &self,
        owner: &str,
        trace_id: &str,
        result: OutcomeResult,
        note: Option<String>,
        today: NaiveDate,
    ) -> Result<OutcomeUpdate> {
        let _guard = self.layers.lock(owner).await;
        let mut snapshot = self.layers.load(owner).await?;
        let tracker = DecisionTracker::new(self.config.followup.clone());
        let update = tracker.record_outcome(&mut snapshot, trace_id, result, note, today)?;
        self.commit(&mut snapshot).await?;
        Ok(update)
    }

    // =========================================================================
    // Read path
    // =========================================================================

    pub async fn query(&self, owner: &str, question: &str, caller: Option<&str>) -> Result<QueryAnswer> {
        let session = self.sessions.get_or_load(&self.layers, owner).await?;
        self.responder.query(&session, question, caller).await
    }

    pub async fn generate(
        &self,
        owner: &str,
        task: &str,
        output_type: OutputType,
        extra_instructions: Option<&str>,
        caller: Option<&str>,
    ) -> Result<GeneratedContent> {
        let session = self.sessions.get_or_load(&self.layers, owner).await?;
        self.responder
            .generate(&session, task, output_type, extra_instructions, caller)
            .await
    }

    pub async fn ask(&self, owner: &str, text: &str, caller: Option<&str>) -> Result<AskResponse> {
        let session = self.sessions.get_or_load(&self.layers, owner).await?;
        self.responder.ask(&session, text, caller).await
    }

    // =========================================================================
    // Exploration
    // =========================================================================

    pub async fn recall(&self, owner: &str, text: &str, options: &RecallOptions) -> Result<Vec<RecallHit>> {
        self.explorer.recall(owner, text, options).await
    }

    pub async fn explore(&self, owner: &str, topic: &str, depth: ExploreDepth) -> Result<Exploration> {
        let session = self.sessions.get_or_load(&self.layers, owner).await?;
        self.explorer.explore(&session, topic, depth).await
    }

    /// Strength timelines come from the retained generations
    pub async fn evolution(&self, owner: &str, topic: &str) -> Result<Evolution> {
        let session = self.sessions.get_or_load(&self.layers, owner).await?;
        let history = self.layers.history(owner).await?;
        self.explorer.evolution(&session, topic, &history).await
    }

    pub async fn blindspots(&self, owner: &str) -> Result<Blindspots> {
        let session = self.sessions.get_or_load(&self.layers, owner).await?;
        self.explorer.blindspots(&session).await
    }

    pub async fn connections(&self, owner: &str, topic_a: &str, topic_b: &str) -> Result<Connections> {
        let session = self.sessions.get_or_load(&self.layers, owner).await?;
        self.explorer.connections(&session, topic_a, topic_b).await
    }

    pub async fn simulate(&self, owner: &str, scenario: &str, context: Option<&str>) -> Result<Simulation> {
        let session = self.sessions.get_or_load(&self.layers, owner).await?;
        self.explorer.simulate(&session, scenario, context).await
    }

    // =========================================================================
    // Batch runs
    // =========================================================================

    /// Detect, extract and scan in one generation, then queue follow-ups and
    /// write a digest when anything happened
    pub async fn run_daily(&self, owner: &str, today: NaiveDate) -> Result<DailyReport> {
        let _guard = self.layers.lock(owner).await;
        let records = self.records.load_all(owner).await?;
        let mut snapshot = self.layers.load(owner).await?;

        let detect = ConvictionEngine::new(self.config.conviction.clone(), self.services.clone())
            .detect(&mut snapshot, &records, today)
            .await?;
        let extract = TraceExtractor::new(self.config.traces.clone(), self.services.clone())
            .extract(&mut snapshot, &records)
            .await?;
        let contradictions = ContradictionScanner::new(self.config.contradiction.clone(), self.services.clone())
            .scan(&mut snapshot, false, today)
            .await?;
        if detect.changed() || extract.changed() || contradictions.changed() {
            self.commit(&mut snapshot).await?;
        }
        let followups = DecisionTracker::new(self.config.followup.clone()).pending_followups(&snapshot, today);

        let mut report = DailyReport {
            date: today,
            owner: owner.to_string(),
            detect,
            extract,
            contradictions,
            followups,
            digest: None,
            digest_path: None,
            generation: snapshot.generation,
        };

        if let Some(prompt) = digest_prompt(&snapshot, &report) {
            match self.services.generator.complete(&prompt, Tier::Light).await {
                Ok(text) if !text.trim().is_empty() => {
                    report.digest = Some(text.trim().to_string());
                    let value = serde_json::to_value(&report)?;
                    report.digest_path = Some(self.layers.save_digest(owner, today, &value).await?);
                }
                Ok(_) => tracing::warn!("Empty digest for {}", owner),
                Err(e) => tracing::warn!("Failed to generate digest for {}: {}", owner, e),
            }
        }

        tracing::info!(
            "Daily run for {}: {} new convictions, {} new traces, {} contradictions, {} follow-ups",
            owner,
            report.detect.created.len(),
            report.extract.created.len(),
            report.contradictions.contradictions().count(),
            report.followups.len()
        );
        Ok(report)
    }

    /// Frames, then identity, in one generation; then index that generation
    pub async fn rebuild(&self, owner: &str, today: NaiveDate) -> Result<RebuildReport> {
        let _guard = self.layers.lock(owner).await;
        let mut snapshot = self.layers.load(owner).await?;
        let frames = FrameEngine::new(self.config.frames.clone(), self.services.clone())
            .rebuild(&mut snapshot, today)
            .await?;
        let identity = IdentityPromoter::new(self.config.identity.clone(), self.services.clone())
            .rebuild(&mut snapshot)
            .await?;
        self.commit(&mut snapshot).await?;
        let index = self.index_snapshot(&snapshot).await?;
        Ok(RebuildReport { frames, identity, index })
    }
}

/// Light-tier digest prompt; None when the day produced nothing to report
fn digest_prompt(snapshot: &Snapshot, report: &DailyReport) -> Option<String> {
    let mut sections = Vec::new();

    let new_convictions: Vec<String> = report
        .detect
        .created
        .iter()
        .filter_map(|id| snapshot.convictions.get(id))
        .take(DIGEST_CONVICTIONS)
        .map(|c| format!("- {}", c.statement))
        .collect();
    if !new_convictions.is_empty() {
        sections.push(format!("New beliefs:\n{}", new_convictions.join("\n")));
    }

    let statement = |id: &str| {
        snapshot
            .convictions
            .get(id)
            .map(|c| c.statement.clone())
            .unwrap_or_else(|| id.to_string())
    };
    let tensions: Vec<String> = report
        .contradictions
        .contradictions()
        .take(DIGEST_ITEMS)
        .map(|f| format!("- {} vs {} (confidence {}/10)", statement(&f.a), statement(&f.b), f.confidence))
        .collect();
    if !tensions.is_empty() {
        sections.push(format!("Belief tensions:\n{}", tensions.join("\n")));
    }

    let followups: Vec<String> = report
        .followups
        .iter()
        .take(DIGEST_ITEMS)
        .map(|f| format!("- {} ({} days ago)", f.decision, f.days_ago))
        .collect();
    if !followups.is_empty() {
        sections.push(format!("Decisions to follow up:\n{}", followups.join("\n")));
    }

    if sections.is_empty() {
        return None;
    }
    Some(format!(
        "You are {owner}'s thinking assistant. Here is today's summary of observations:\n\n\
         {sections}\n\n\
         There are currently {active} active beliefs.\n\n\
         Turn this into a short morning briefing (under 120 words) in a warm, concise tone, \
         like a friend who knows {owner} well helping sort their thoughts. Do not use bullet points.",
        owner = snapshot.owner,
        sections = sections.join("\n\n"),
        active = snapshot.active_convictions().count(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::testing::*;
    use tempfile::TempDir;

    fn mindstack(dir: &TempDir, embedder: StubEmbedder, generator: ScriptedGenerator) -> Mindstack {
        let mut config = MindstackConfig::default();
        config.storage.data_dir = dir.path().to_path_buf();
        config.llm.concurrency = 2;
        Mindstack::new(
            config,
            Arc::new(embedder),
            Arc::new(generator),
            Arc::new(JsonlRecordStore::new(dir.path().to_path_buf())),
        )
    }

    /// Five signals on one theme: 3 outputs, 2 inputs, 10 days, 2 contexts
    fn theme_signals() -> Vec<Signal> {
        vec![
            make_signal("sig_1", Direction::Output, Modality::WrittenDeliberate, 1, "work"),
            make_signal("sig_2", Direction::Output, Modality::WrittenDeliberate, 4, "work"),
            make_signal("sig_3", Direction::Output, Modality::WrittenDeliberate, 11, "home"),
            make_signal("sig_4", Direction::Input, Modality::Consumed, 2, "work"),
            make_signal("sig_5", Direction::Input, Modality::Consumed, 6, "home"),
        ]
    }

    fn theme_embedder() -> StubEmbedder {
        let mut embedder = StubEmbedder::new(8);
        for (i, id) in ["sig_1", "sig_2", "sig_3", "sig_4", "sig_5"].iter().enumerate() {
            embedder.set(&format!("signal text {}", id), angle_vector(i as f32, 8));
        }
        embedder.set("Quality is worth waiting for", angle_vector(2.0, 8));
        embedder
    }

    #[tokio::test]
    async fn test_ingest_and_stats() {
        let dir = TempDir::new().unwrap();
        let ms = mindstack(&dir, theme_embedder(), ScriptedGenerator::new(""));
        let mut signals = theme_signals();
        signals.push(signals[0].clone());
        let mut empty = make_signal("sig_empty", Direction::Output, Modality::Decided, 3, "work");
        empty.content.text = "  ".to_string();
        signals.push(empty);

        let report = ms.ingest(OWNER, signals).await.unwrap();
        assert_eq!(report.received, 7);
        assert_eq!(report.skipped_empty, 1);
        assert_eq!(report.appended, 5);
        assert_eq!(ms.ingest(OWNER, theme_signals()).await.unwrap().appended, 0);

        let stats = ms.stats(OWNER).await.unwrap();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.direction.get("output"), Some(&3));
        assert_eq!(stats.context.get("home"), Some(&2));
        assert_eq!(stats.earliest, Some(date(1)));
        assert_eq!(stats.latest, Some(date(11)));
        assert_eq!(stats.layers.generation, 0);
    }

    #[tokio::test]
    async fn test_deactivate_signal() {
        let dir = TempDir::new().unwrap();
        let ms = mindstack(&dir, theme_embedder(), ScriptedGenerator::new(""));
        ms.ingest(OWNER, theme_signals()).await.unwrap();

        ms.deactivate_signal(OWNER, "sig_1", "misattributed").await.unwrap();
        let stats = ms.stats(OWNER).await.unwrap();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.active, 4);

        let err = ms.deactivate_signal(OWNER, "sig_x", "typo").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_exploration_over_committed_model() {
        let dir = TempDir::new().unwrap();
        let ms = mindstack(
            &dir,
            theme_embedder(),
            ScriptedGenerator::new("Quality is worth waiting for"),
        );
        ms.ingest(OWNER, theme_signals()).await.unwrap();
        ms.detect(OWNER, date(12)).await.unwrap();
        ms.build_index(OWNER).await.unwrap();

        let topic = "Quality is worth waiting for";
        let lite = ms.explore(OWNER, topic, ExploreDepth::Lite).await.unwrap();
        assert_eq!(lite.convictions.len(), 1);
        assert_eq!(lite.convictions[0].statement, topic);

        let evolution = ms.evolution(OWNER, topic).await.unwrap();
        let history = &evolution.convictions[0].strength_history;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].generation, 1);

        let options = RecallOptions {
            context: Some("work".to_string()),
            ..RecallOptions::default()
        };
        let hits = ms.recall(OWNER, "signal text sig_1", &options).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.signal.id.as_str()).collect();
        assert_eq!(ids[0], "sig_1");
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn test_detect_commits_and_invalidates_sessions() {
        let dir = TempDir::new().unwrap();
        let ms = mindstack(
            &dir,
            theme_embedder(),
            ScriptedGenerator::new("Quality is worth waiting for"),
        );
        ms.ingest(OWNER, theme_signals()).await.unwrap();

        let before = ms.sessions.get_or_load(&ms.layers, OWNER).await.unwrap();
        assert_eq!(before.generation(), 0);

        let report = ms.detect(OWNER, date(12)).await.unwrap();
        assert_eq!(report.created.len(), 1);
        assert!(ms.sessions.is_empty().await);

        let snapshot = ms.snapshot(OWNER).await.unwrap();
        assert_eq!(snapshot.generation, 1);
        let conviction = snapshot.convictions.iter().next().unwrap();
        assert_eq!(conviction.statement, "Quality is worth waiting for");
        assert!(conviction.strength.score <= 1.0);

        // the same cluster now reinforces instead of creating
        let again = ms.detect(OWNER, date(13)).await.unwrap();
        assert!(again.created.is_empty());
        assert_eq!(again.reinforced, vec![conviction.id.clone()]);
        assert_eq!(ms.snapshot(OWNER).await.unwrap().convictions.len(), 1);
    }

    #[tokio::test]
    async fn test_record_outcome_commits() {
        let dir = TempDir::new().unwrap();
        let ms = mindstack(&dir, StubEmbedder::new(8), ScriptedGenerator::new(""));
        let mut snapshot = ms.snapshot(OWNER).await.unwrap();
        snapshot.convictions.insert(make_conviction("conv_a", "Ship early", 0.6));
        snapshot.traces.insert(make_trace("trace_1", &["conv_a"], 1));
        ms.layers.commit(&mut snapshot).await.unwrap();

        assert_eq!(ms.followups(OWNER, date(20)).await.unwrap().len(), 1);
        ms.record_outcome(OWNER, "trace_1", OutcomeResult::Positive, None, date(20))
            .await
            .unwrap();
        assert!(ms.followups(OWNER, date(20)).await.unwrap().is_empty());
        assert_eq!(ms.layers.current_generation(OWNER).await.unwrap(), 2);

        let err = ms
            .record_outcome(OWNER, "trace_x", OutcomeResult::Positive, None, date(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(ms.layers.current_generation(OWNER).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_rebuild_indexes_new_generation() {
        let dir = TempDir::new().unwrap();
        let ms = mindstack(&dir, StubEmbedder::new(8), ScriptedGenerator::new("{}"));
        let mut snapshot = ms.snapshot(OWNER).await.unwrap();
        snapshot.convictions.insert(make_conviction("conv_a", "Ship early", 0.6));
        ms.layers.commit(&mut snapshot).await.unwrap();

        let report = ms.rebuild(OWNER, date(20)).await.unwrap();
        assert_eq!(report.index.convictions_indexed, 1);
        assert_eq!(report.index.generation, 2);
        let index = ms.layers.load_index(OWNER, 2).await.unwrap().unwrap();
        assert_eq!(index.built_at_generation, 2);
    }

    #[tokio::test]
    async fn test_daily_run_writes_digest() {
        let dir = TempDir::new().unwrap();
        let generator = ScriptedGenerator::new("Quality is worth waiting for")
            .rule("morning briefing", "A calm start: you keep choosing quality.");
        let ms = mindstack(&dir, theme_embedder(), generator);
        ms.ingest(OWNER, theme_signals()).await.unwrap();

        let report = ms.run_daily(OWNER, date(12)).await.unwrap();
        assert_eq!(report.detect.created.len(), 1);
        assert_eq!(report.generation, 1);
        assert_eq!(report.digest.as_deref(), Some("A calm start: you keep choosing quality."));
        let path = report.digest_path.unwrap();
        assert!(path.ends_with("2025-03-12.json"));
        let saved: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(saved["owner"], OWNER);
    }

    #[tokio::test]
    async fn test_daily_run_without_news_has_no_digest() {
        let dir = TempDir::new().unwrap();
        let generator = ScriptedGenerator::new("").rule("morning briefing", "should not be asked");
        let ms = mindstack(&dir, StubEmbedder::new(8), generator);
        let report = ms.run_daily(OWNER, date(12)).await.unwrap();
        assert!(report.digest.is_none());
        assert_eq!(report.generation, 0);
    }
}
