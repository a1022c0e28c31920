use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use awareness_llm::ReasoningOracle;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dreaming::{
    CycleOutcome, DreamingEngine, DreamingOptions, DreamingStats, ThresholdStatus,
    spawn_auto_dreaming,
};
use crate::embedding::EmbedFn;
use crate::error::MemoryResult;
use crate::insight::{Insight, InsightStore};
use crate::schema::{MemoryRecord, RecordKind};
use crate::scoring::AxisScorer;
use crate::store::{FeedbackContext, MemoryStore, StoreOptions, StoreStats};
use crate::weights::{AxisWeightState, AxisWeights, WeightRule};

/// On-disk layout owned by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryPaths {
    pub memory_log: PathBuf,
    pub insight_log: PathBuf,
    pub weights: PathBuf,
}

impl MemoryPaths {
    pub fn under(data_dir: impl AsRef<Path>) -> Self {
        let root = data_dir.as_ref();
        Self {
            memory_log: root.join("memory").join("events.jsonl"),
            insight_log: root.join("insights").join("insights.jsonl"),
            weights: root.join("axis_weights.json"),
        }
    }
}

#[derive(Clone)]
pub struct ManagerOptions {
    pub store: StoreOptions,
    pub dreaming: DreamingOptions,
    pub weight_rule: WeightRule,
    pub classify_temperature: f32,
    /// Per-call limit for scoring requests.
    pub scoring_timeout: Duration,
    pub embed_fn: Option<EmbedFn>,
    pub shutdown: Option<watch::Receiver<bool>>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            store: StoreOptions::default(),
            dreaming: DreamingOptions::default(),
            weight_rule: WeightRule::default(),
            classify_temperature: 0.3,
            scoring_timeout: Duration::from_secs(60),
            embed_fn: None,
            shutdown: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub store: StoreStats,
    pub dreaming: DreamingStats,
    pub weights: AxisWeightState,
    pub threshold: ThresholdStatus,
    pub generated_at: DateTime<Utc>,
}

/// Facade wiring the scorer, memory store, insight store, axis weights and
/// dreaming engine around one oracle.
pub struct MemoryManager {
    store: Arc<MemoryStore>,
    insights: Arc<InsightStore>,
    weights: Arc<AxisWeights>,
    dreaming: Arc<DreamingEngine>,
}

impl MemoryManager {
    /// Open every persisted component under `paths`, replaying logs,
    /// re-linking any insight whose batch was never marked consolidated and
    /// catching axis weights up with the insight log.
    pub async fn open(
        paths: &MemoryPaths,
        oracle: Arc<dyn ReasoningOracle>,
        options: ManagerOptions,
    ) -> MemoryResult<Self> {
        let insights = InsightStore::open(&paths.insight_log)?;
        let history = insights_snapshot(&insights);
        let weights = Arc::new(AxisWeights::load(&paths.weights, options.weight_rule, &history)?);
        let scorer = Arc::new(AxisScorer::new(
            oracle.clone(),
            weights.clone(),
            options.classify_temperature,
            options.scoring_timeout,
        ));
        let store = MemoryStore::open(&paths.memory_log, scorer, options.store)?;
        reconcile_batches(&store, &history).await?;
        info!(
            data = %paths.memory_log.display(),
            insights = history.len(),
            "memory manager opened"
        );
        Ok(Self::assemble(store, insights, weights, oracle, options))
    }

    pub fn in_memory(oracle: Arc<dyn ReasoningOracle>, options: ManagerOptions) -> Self {
        let weights = Arc::new(AxisWeights::in_memory(options.weight_rule));
        let scorer = Arc::new(AxisScorer::new(
            oracle.clone(),
            weights.clone(),
            options.classify_temperature,
            options.scoring_timeout,
        ));
        let store = MemoryStore::in_memory(scorer, options.store);
        Self::assemble(store, InsightStore::in_memory(), weights, oracle, options)
    }

    fn assemble(
        mut store: MemoryStore,
        insights: InsightStore,
        weights: Arc<AxisWeights>,
        oracle: Arc<dyn ReasoningOracle>,
        options: ManagerOptions,
    ) -> Self {
        if let Some(embed_fn) = options.embed_fn {
            store.set_embed_fn(embed_fn);
        }
        let store = Arc::new(store);
        let insights = Arc::new(insights);
        let mut engine = DreamingEngine::new(
            store.clone(),
            insights.clone(),
            weights.clone(),
            oracle,
            options.dreaming,
        );
        if let Some(shutdown) = options.shutdown {
            engine = engine.with_shutdown(shutdown);
        }
        Self {
            store,
            insights,
            weights,
            dreaming: Arc::new(engine),
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn insights(&self) -> &Arc<InsightStore> {
        &self.insights
    }

    pub fn dreaming(&self) -> &Arc<DreamingEngine> {
        &self.dreaming
    }

    pub async fn append(&self, kind: RecordKind, text: &str) -> MemoryResult<MemoryRecord> {
        self.store.append(kind, text).await
    }

    pub async fn append_at(
        &self,
        kind: RecordKind,
        text: &str,
        created_at: DateTime<Utc>,
    ) -> MemoryResult<MemoryRecord> {
        self.store.append_at(kind, text, created_at).await
    }

    pub async fn append_feedback(&self, feedback: &FeedbackContext) -> MemoryResult<MemoryRecord> {
        self.store.append_feedback(feedback).await
    }

    /// Manual trigger; returns once the cycle has finished.
    pub async fn trigger_dreaming_cycle(&self) -> MemoryResult<CycleOutcome> {
        self.dreaming.trigger().await
    }

    pub async fn check_and_run(&self) -> MemoryResult<CycleOutcome> {
        self.dreaming.check_and_run().await
    }

    pub fn spawn_auto_dreaming(
        &self,
        interval: Duration,
        shutdown_tx: &watch::Sender<bool>,
    ) -> JoinHandle<()> {
        spawn_auto_dreaming(self.dreaming.clone(), interval, shutdown_tx)
    }

    pub async fn list_recent_insights(&self, limit: usize) -> Vec<Insight> {
        self.insights.list_recent(limit).await
    }

    pub async fn unconsolidated_count(&self, kind: Option<RecordKind>) -> usize {
        self.store.unconsolidated_count(kind).await
    }

    pub fn axis_weights(&self) -> AxisWeightState {
        self.weights.snapshot()
    }

    /// Operator reset of the learned bias.
    pub async fn reset_axis_weights(&self) -> MemoryResult<AxisWeightState> {
        let latest = self.insights.latest().await.map(|i| i.id);
        self.weights.reset(latest).await
    }

    pub async fn search(&self, query: &str, k: usize) -> Vec<(MemoryRecord, f32)> {
        self.store.search_text(query, k).await
    }

    pub async fn stats(&self) -> MemoryStats {
        MemoryStats {
            store: self.store.stats().await,
            dreaming: self.dreaming.stats().await,
            weights: self.weights.snapshot(),
            threshold: self.dreaming.should_dream().await,
            generated_at: Utc::now(),
        }
    }
}

/// Mark the batch of every stored insight.  Only does work when a previous
/// run stopped between appending an insight and marking its records.
async fn reconcile_batches(store: &MemoryStore, history: &[Insight]) -> MemoryResult<usize> {
    let mut relinked = 0;
    for insight in history.iter().filter(|i| !i.record_ids.is_empty()) {
        relinked += store.mark_consolidated(&insight.batch()).await?;
    }
    if relinked > 0 {
        warn!(relinked, "re-linked records to insights whose batch was never marked");
    }
    Ok(relinked)
}

fn insights_snapshot(insights: &InsightStore) -> Vec<Insight> {
    // Freshly opened; no writer can hold the lock yet.
    insights.try_list_all().unwrap_or_default()
}
