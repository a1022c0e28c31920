//! Dreaming: consolidate unconsolidated memory into insights.
//!
//! One cycle walks `Idle → BatchAssembled → Synthesizing → Validating →
//! Committed`, or ends in `Failed` from Synthesizing/Validating without
//! touching memory.  At most one cycle runs at a time; a trigger that finds a
//! cycle in flight returns [`CycleOutcome::Coalesced`] immediately.

pub mod prompt;
pub mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use awareness_llm::{OracleRequest, ReasoningOracle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tracing::{info, instrument, warn};

use crate::error::{ErrorKind, MemoryError, MemoryResult};
use crate::insight::{Insight, InsightStore};
use crate::schema::{ConsolidationBatch, MemoryRecord};
use crate::store::MemoryStore;
use crate::weights::AxisWeights;

pub use prompt::{parse_insight_sections, synthesis_prompt};
pub use scheduler::spawn_auto_dreaming;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DreamPhase {
    Idle,
    BatchAssembled,
    Synthesizing,
    Validating,
    Committed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Threshold-gated; used by the scheduler.
    Automatic,
    /// Operator request; runs whenever anything is unconsolidated.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    BelowThreshold { count: usize, threshold: usize },
    EmptyBatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Skipped {
        reason: SkipReason,
    },
    Coalesced,
    Committed {
        insight_id: String,
        batch_id: String,
        records: usize,
        accepted: bool,
    },
    Failed {
        kind: ErrorKind,
        message: String,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct DreamingOptions {
    pub memory_threshold: usize,
    pub batch_limit: usize,
    pub oracle_timeout: Duration,
    pub temperature: f32,
    pub mark_retry_initial: Duration,
    pub mark_retry_max: Duration,
}

impl Default for DreamingOptions {
    fn default() -> Self {
        Self {
            memory_threshold: 50,
            batch_limit: 50,
            oracle_timeout: Duration::from_secs(300),
            temperature: 0.7,
            mark_retry_initial: Duration::from_millis(200),
            mark_retry_max: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThresholdStatus {
    pub unconsolidated: usize,
    pub threshold: usize,
    pub ready: bool,
}

/// Dreaming totals.  The first four fields are read from the insight log and
/// the memory store, so they survive restarts; the `_since_start` counters
/// and `last_outcome` cover this process only.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DreamingStats {
    pub cycles_committed: usize,
    pub records_consolidated: usize,
    pub last_dream_at: Option<DateTime<Utc>>,
    pub unconsolidated: usize,
    pub failed_since_start: u64,
    pub coalesced_since_start: u64,
    pub skipped_since_start: u64,
    pub last_outcome: Option<CycleOutcome>,
    pub last_outcome_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct SessionCounters {
    failed: u64,
    coalesced: u64,
    skipped: u64,
    last_outcome: Option<(CycleOutcome, DateTime<Utc>)>,
}

pub struct DreamingEngine {
    store: Arc<MemoryStore>,
    insights: Arc<InsightStore>,
    weights: Arc<AxisWeights>,
    oracle: Arc<dyn ReasoningOracle>,
    options: DreamingOptions,
    cycle_lock: Mutex<()>,
    phase: watch::Sender<DreamPhase>,
    shutdown: Option<watch::Receiver<bool>>,
    session: std::sync::Mutex<SessionCounters>,
}

impl DreamingEngine {
    pub fn new(
        store: Arc<MemoryStore>,
        insights: Arc<InsightStore>,
        weights: Arc<AxisWeights>,
        oracle: Arc<dyn ReasoningOracle>,
        options: DreamingOptions,
    ) -> Self {
        let (phase, _) = watch::channel(DreamPhase::Idle);
        Self {
            store,
            insights,
            weights,
            oracle,
            options,
            cycle_lock: Mutex::new(()),
            phase,
            shutdown: None,
            session: std::sync::Mutex::new(SessionCounters::default()),
        }
    }

    /// Cancel in-flight synthesis once `shutdown` turns `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn options(&self) -> &DreamingOptions {
        &self.options
    }

    pub fn phase(&self) -> DreamPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DreamPhase> {
        self.phase.subscribe()
    }

    pub async fn should_dream(&self) -> ThresholdStatus {
        let unconsolidated = self.store.unconsolidated_count(None).await;
        ThresholdStatus {
            unconsolidated,
            threshold: self.options.memory_threshold,
            ready: unconsolidated >= self.options.memory_threshold,
        }
    }

    /// Threshold-gated cycle.
    pub async fn check_and_run(&self) -> MemoryResult<CycleOutcome> {
        self.run_cycle(Trigger::Automatic).await
    }

    /// Operator-requested cycle; ignores the threshold.
    pub async fn trigger(&self) -> MemoryResult<CycleOutcome> {
        self.run_cycle(Trigger::Manual).await
    }

    /// Run one cycle.
    ///
    /// Oracle-side failures (bad reply, timeout, transport error, shutdown)
    /// come back as `Ok(CycleOutcome::Failed)` with the batch left
    /// unconsolidated.  Storage failures are returned as `Err`.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self, trigger: Trigger) -> MemoryResult<CycleOutcome> {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            info!("dreaming cycle already running; trigger coalesced");
            return Ok(self.record(CycleOutcome::Coalesced));
        };

        if trigger == Trigger::Automatic {
            let status = self.should_dream().await;
            if !status.ready {
                return Ok(self
                    .record(CycleOutcome::Skipped {
                        reason: SkipReason::BelowThreshold {
                            count: status.unconsolidated,
                            threshold: status.threshold,
                        },
                    }));
            }
        }

        let Some((batch, records)) = self.store.assemble_batch(self.options.batch_limit).await
        else {
            return Ok(self
                .record(CycleOutcome::Skipped {
                    reason: SkipReason::EmptyBatch,
                }));
        };
        self.set_phase(DreamPhase::BatchAssembled);
        info!(batch_id = %batch.id, records = batch.len(), "consolidation batch assembled");

        if let Some(existing) = self.insights.list_by_batch(&batch.id).await {
            let outcome = self.relink(existing, &batch).await;
            self.set_phase(DreamPhase::Committed);
            self.set_phase(DreamPhase::Idle);
            return Ok(self.record(outcome));
        }

        let result = self.consolidate(&batch, &records).await;
        match result {
            Ok(outcome) => {
                self.set_phase(DreamPhase::Committed);
                self.set_phase(DreamPhase::Idle);
                Ok(self.record(outcome))
            }
            Err(err) if err.is_retryable() => {
                warn!(batch_id = %batch.id, error = %err, "dreaming cycle failed; batch left for retry");
                self.set_phase(DreamPhase::Failed);
                self.set_phase(DreamPhase::Idle);
                Ok(self
                    .record(CycleOutcome::Failed {
                        kind: err.kind(),
                        message: err.to_string(),
                    }))
            }
            Err(err) => {
                tracing::error!(batch_id = %batch.id, error = %err, "dreaming cycle hit a storage failure");
                self.set_phase(DreamPhase::Failed);
                self.set_phase(DreamPhase::Idle);
                self.record(CycleOutcome::Failed {
                    kind: err.kind(),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn consolidate(
        &self,
        batch: &ConsolidationBatch,
        records: &[MemoryRecord],
    ) -> MemoryResult<CycleOutcome> {
        self.set_phase(DreamPhase::Synthesizing);
        let weights = self.weights.snapshot();
        let request = OracleRequest::synthesize(
            synthesis_prompt(records, &weights),
            self.options.temperature,
        );
        let reply = self.synthesize(&request).await?;

        self.set_phase(DreamPhase::Validating);
        let sections = parse_insight_sections(&reply)?;
        let insight = Insight::new(batch, sections);

        // From here on the cycle runs to completion; shutdown is not honoured.
        self.insights.append(insight.clone()).await?;
        self.mark_with_retry(batch).await;
        self.weights.absorb_insight(&insight).await;

        info!(
            insight_id = %insight.id,
            batch_id = %batch.id,
            accepted = insight.accepted,
            "dreaming cycle committed"
        );
        Ok(CycleOutcome::Committed {
            insight_id: insight.id,
            batch_id: batch.id.clone(),
            records: batch.len(),
            accepted: insight.accepted,
        })
    }

    /// The batch already has an insight whose records were never marked.
    /// Mark them without synthesizing again; the insight's weight update was
    /// applied when it was committed or replayed on load.
    async fn relink(&self, existing: Insight, batch: &ConsolidationBatch) -> CycleOutcome {
        warn!(insight_id = %existing.id, batch_id = %batch.id, "batch already has an insight; marking it consolidated");
        let stored = existing.batch();
        let target = if stored.record_ids.is_empty() { batch } else { &stored };
        self.mark_with_retry(target).await;
        CycleOutcome::Committed {
            insight_id: existing.id,
            batch_id: batch.id.clone(),
            records: target.len(),
            accepted: existing.accepted,
        }
    }

    async fn synthesize(&self, request: &OracleRequest) -> MemoryResult<String> {
        let timeout = self.options.oracle_timeout;
        let call = tokio::time::timeout(timeout, self.oracle.complete(request));
        let result = match self.shutdown.clone() {
            Some(mut shutdown) => {
                tokio::select! {
                    result = call => result,
                    _ = shutdown_requested(&mut shutdown) => return Err(MemoryError::Cancelled),
                }
            }
            None => call.await,
        };
        match result {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(err)) => Err(MemoryError::Oracle(err.to_string())),
            Err(_) => Err(MemoryError::OracleTimeout { after: timeout }),
        }
    }

    /// `mark_consolidated` is idempotent, so retrying until it lands is safe
    /// and keeps a stored insight from pointing at an unconsolidated batch.
    async fn mark_with_retry(&self, batch: &ConsolidationBatch) {
        let mut delay = self.options.mark_retry_initial;
        let mut attempt = 1u32;
        loop {
            match self.store.mark_consolidated(batch).await {
                Ok(_) => return,
                Err(err) => {
                    warn!(batch_id = %batch.id, attempt, error = %err, retry_in = ?delay, "mark_consolidated failed; retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.options.mark_retry_max);
                    attempt += 1;
                }
            }
        }
    }

    fn set_phase(&self, phase: DreamPhase) {
        self.phase.send_replace(phase);
    }

    fn record(&self, outcome: CycleOutcome) -> CycleOutcome {
        let mut session = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match &outcome {
            CycleOutcome::Committed { .. } => {}
            CycleOutcome::Failed { .. } => session.failed += 1,
            CycleOutcome::Coalesced => session.coalesced += 1,
            CycleOutcome::Skipped { .. } => session.skipped += 1,
        }
        session.last_outcome = Some((outcome.clone(), Utc::now()));
        outcome
    }

    pub async fn stats(&self) -> DreamingStats {
        let insights = self.insights.list_all().await;
        let mut stats = DreamingStats {
            cycles_committed: insights.len(),
            records_consolidated: insights.iter().map(|i| i.record_count).sum(),
            last_dream_at: insights.iter().map(|i| i.created_at).max(),
            unconsolidated: self.store.unconsolidated_count(None).await,
            ..DreamingStats::default()
        };
        let session = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        stats.failed_since_start = session.failed;
        stats.coalesced_since_start = session.coalesced;
        stats.skipped_since_start = session.skipped;
        if let Some((outcome, at)) = &session.last_outcome {
            stats.last_outcome = Some(outcome.clone());
            stats.last_outcome_at = Some(*at);
        }
        stats
    }
}

/// Resolves once `shutdown` reads `true`; never resolves if the sender is
/// dropped first.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use anyhow::Result;
    use awareness_llm::OracleTask;
    use chrono::TimeZone;

    use super::*;
    use crate::axis::Axis;
    use crate::schema::RecordKind;
    use crate::scoring::AxisScorer;
    use crate::store::StoreOptions;
    use crate::testing::{CallCounts, StubOracle, insight_reply, uniform_axes_reply};
    use crate::weights::WeightRule;

    struct Harness {
        engine: Arc<DreamingEngine>,
        store: Arc<MemoryStore>,
        insights: Arc<InsightStore>,
        weights: Arc<AxisWeights>,
        calls: Arc<CallCounts>,
    }

    fn options(threshold: usize) -> DreamingOptions {
        DreamingOptions {
            memory_threshold: threshold,
            batch_limit: 100,
            oracle_timeout: Duration::from_secs(2),
            mark_retry_initial: Duration::from_millis(5),
            mark_retry_max: Duration::from_millis(20),
            ..DreamingOptions::default()
        }
    }

    fn harness_with(
        oracle: StubOracle,
        options: DreamingOptions,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> Harness {
        build(oracle, options, shutdown, None).unwrap()
    }

    /// Memory and insight logs live under `dir`.
    fn harness_on_disk(oracle: StubOracle, options: DreamingOptions, dir: &Path) -> Result<Harness> {
        build(oracle, options, None, Some(dir))
    }

    fn build(
        oracle: StubOracle,
        options: DreamingOptions,
        shutdown: Option<watch::Receiver<bool>>,
        dir: Option<&Path>,
    ) -> Result<Harness> {
        let calls = oracle.calls();
        let oracle: Arc<dyn ReasoningOracle> = Arc::new(oracle.with_classify(uniform_axes_reply(0.5)));
        let weights = Arc::new(AxisWeights::in_memory(WeightRule::default()));
        let scorer = Arc::new(AxisScorer::new(
            oracle.clone(),
            weights.clone(),
            0.3,
            Duration::from_secs(1),
        ));
        let (store, insights) = match dir {
            Some(dir) => (
                MemoryStore::open(dir.join("memory").join("events.jsonl"), scorer, StoreOptions::default())?,
                InsightStore::open(dir.join("insights").join("insights.jsonl"))?,
            ),
            None => (
                MemoryStore::in_memory(scorer, StoreOptions::default()),
                InsightStore::in_memory(),
            ),
        };
        let store = Arc::new(store);
        let insights = Arc::new(insights);
        let mut engine = DreamingEngine::new(
            store.clone(),
            insights.clone(),
            weights.clone(),
            oracle,
            options,
        );
        if let Some(rx) = shutdown {
            engine = engine.with_shutdown(rx);
        }
        Ok(Harness {
            engine: Arc::new(engine),
            store,
            insights,
            weights,
            calls,
        })
    }

    fn harness(oracle: StubOracle, options: DreamingOptions) -> Harness {
        harness_with(oracle, options, None)
    }

    async fn fill(store: &MemoryStore, n: u32) -> Result<()> {
        let base = Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).unwrap();
        for i in 0..n {
            let at = base + chrono::Duration::seconds(i64::from(i));
            store.append_at(RecordKind::Turn, &format!("turn number {i}"), at).await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn threshold_gates_automatic_cycles() -> Result<()> {
        let h = harness(StubOracle::new().with_synthesize(insight_reply()), options(50));
        fill(&h.store, 49).await?;

        let outcome = h.engine.check_and_run().await?;
        assert_eq!(
            outcome,
            CycleOutcome::Skipped {
                reason: SkipReason::BelowThreshold { count: 49, threshold: 50 }
            }
        );
        assert_eq!(h.calls.synthesize(), 0);

        h.store.append(RecordKind::Turn, "the fiftieth turn").await?;
        assert!(h.engine.should_dream().await.ready);
        match h.engine.check_and_run().await? {
            CycleOutcome::Committed { records, .. } => assert_eq!(records, 50),
            other => panic!("expected commit, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn committed_cycle_marks_batch_and_stores_one_insight() -> Result<()> {
        let h = harness(StubOracle::new().with_synthesize(insight_reply()), options(50));
        fill(&h.store, 5).await?;

        let CycleOutcome::Committed { insight_id, batch_id, records, accepted } =
            h.engine.trigger().await?
        else {
            panic!("manual trigger should commit");
        };
        assert_eq!(records, 5);
        assert!(accepted);

        let all = h.store.all().await;
        assert!(all.iter().all(|r| r.consolidated
            && r.consolidation_batch_id.as_deref() == Some(batch_id.as_str())));
        assert_eq!(h.insights.len().await, 1);
        let stored = h.insights.list_by_batch(&batch_id).await.unwrap();
        assert_eq!(stored.id, insight_id);
        assert_eq!(h.engine.phase(), DreamPhase::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn accepted_insight_moves_weights() -> Result<()> {
        let h = harness(StubOracle::new().with_synthesize(insight_reply()), options(1));
        fill(&h.store, 2).await?;
        h.engine.trigger().await?;
        let state = h.weights.snapshot();
        // corrective +1.0 at rate 0.25; reinforcing -0.5 at half rate
        assert_eq!(state.bias.get(Axis::AnalysisOverview), 0.25);
        assert_eq!(state.bias.get(Axis::EmpathyResponsibility), -0.0625);
        assert_eq!(state.applied_insights, 1);
        Ok(())
    }

    #[tokio::test]
    async fn rejected_insight_consolidates_without_touching_weights() -> Result<()> {
        let reply = serde_json::json!({
            "corrective": [{"text": "be braver", "axis": "courage", "shift": 1.0}],
            "reinforcing": ["steady"],
            "emergent": ["curious"]
        })
        .to_string();
        let h = harness(StubOracle::new().with_synthesize(reply), options(1));
        fill(&h.store, 3).await?;
        let outcome = h.engine.trigger().await?;
        assert!(matches!(outcome, CycleOutcome::Committed { accepted: false, .. }));
        assert_eq!(h.store.unconsolidated_count(None).await, 0);
        assert!(h.weights.snapshot().bias.is_neutral());
        Ok(())
    }

    #[tokio::test]
    async fn malformed_synthesis_fails_without_side_effects() -> Result<()> {
        let h = harness(
            StubOracle::new().with_synthesize("Today was a good day, nothing to add."),
            options(1),
        );
        fill(&h.store, 4).await?;
        let outcome = h.engine.trigger().await?;
        assert!(matches!(
            outcome,
            CycleOutcome::Failed { kind: ErrorKind::SynthesisFormat, .. }
        ));
        assert_eq!(h.store.unconsolidated_count(None).await, 4);
        assert_eq!(h.insights.len().await, 0);
        assert!(h.weights.snapshot().bias.is_neutral());
        assert_eq!(h.engine.phase(), DreamPhase::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn failed_batch_is_retried_by_next_trigger() -> Result<()> {
        let h = harness(
            StubOracle::new()
                .with_synthesize("{}")
                .with_synthesize(insight_reply()),
            options(1),
        );
        fill(&h.store, 3).await?;
        let first = h.engine.trigger().await?;
        assert!(matches!(first, CycleOutcome::Failed { .. }));

        let CycleOutcome::Committed { batch_id, records, .. } = h.engine.trigger().await? else {
            panic!("retry should commit");
        };
        assert_eq!(records, 3);
        assert_eq!(h.insights.list_by_batch(&batch_id).await.map(|i| i.record_count), Some(3));
        Ok(())
    }

    #[tokio::test]
    async fn oracle_error_is_reported_as_failed() -> Result<()> {
        let h = harness(StubOracle::new().with_synthesize_error("503 from model server"), options(1));
        fill(&h.store, 2).await?;
        let outcome = h.engine.trigger().await?;
        assert!(matches!(outcome, CycleOutcome::Failed { kind: ErrorKind::Oracle, .. }));
        assert_eq!(h.store.unconsolidated_count(None).await, 2);
        Ok(())
    }

    #[tokio::test]
    async fn slow_oracle_times_out_and_leaves_batch() -> Result<()> {
        let opts = DreamingOptions {
            oracle_timeout: Duration::from_millis(50),
            ..options(1)
        };
        let h = harness(
            StubOracle::new()
                .with_synthesize(insight_reply())
                .with_delay(OracleTask::Synthesize, Duration::from_secs(5)),
            opts,
        );
        fill(&h.store, 2).await?;
        let outcome = h.engine.trigger().await?;
        assert!(matches!(outcome, CycleOutcome::Failed { kind: ErrorKind::Timeout, .. }));
        assert_eq!(h.store.unconsolidated_count(None).await, 2);
        assert_eq!(h.insights.len().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_triggers_run_one_cycle() -> Result<()> {
        let h = harness(
            StubOracle::new()
                .with_synthesize(insight_reply())
                .with_delay(OracleTask::Synthesize, Duration::from_millis(100)),
            options(1),
        );
        fill(&h.store, 3).await?;

        let (a, b) = tokio::join!(h.engine.trigger(), h.engine.trigger());
        let outcomes = [a?, b?];
        let committed = outcomes
            .iter()
            .filter(|o| matches!(o, CycleOutcome::Committed { .. }))
            .count();
        let coalesced = outcomes
            .iter()
            .filter(|o| matches!(o, CycleOutcome::Coalesced))
            .count();
        assert_eq!((committed, coalesced), (1, 1));
        assert_eq!(h.calls.synthesize(), 1);
        assert_eq!(h.insights.len().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_cancels_synthesis() -> Result<()> {
        let (tx, rx) = watch::channel(false);
        let h = harness_with(
            StubOracle::new()
                .with_synthesize(insight_reply())
                .with_delay(OracleTask::Synthesize, Duration::from_secs(5)),
            options(1),
            Some(rx),
        );
        fill(&h.store, 2).await?;

        let mut phases = h.engine.subscribe();
        let engine = h.engine.clone();
        let cycle = tokio::spawn(async move { engine.trigger().await });
        phases.wait_for(|p| *p == DreamPhase::Synthesizing).await?;
        tx.send(true)?;

        let outcome = cycle.await??;
        assert!(matches!(outcome, CycleOutcome::Failed { kind: ErrorKind::Cancelled, .. }));
        assert_eq!(h.store.unconsolidated_count(None).await, 2);
        assert_eq!(h.insights.len().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn manual_trigger_with_nothing_pending_is_skipped() -> Result<()> {
        let h = harness(StubOracle::new().with_synthesize(insight_reply()), options(50));
        let outcome = h.engine.trigger().await?;
        assert_eq!(outcome, CycleOutcome::Skipped { reason: SkipReason::EmptyBatch });
        assert_eq!(h.calls.synthesize(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn batch_limit_bounds_each_cycle() -> Result<()> {
        let opts = DreamingOptions { batch_limit: 4, ..options(1) };
        let h = harness(StubOracle::new().with_synthesize(insight_reply()), opts);
        fill(&h.store, 10).await?;
        let first = h.engine.trigger().await?;
        assert!(matches!(first, CycleOutcome::Committed { records: 4, .. }));
        assert_eq!(h.store.unconsolidated_count(None).await, 6);

        // Oldest records go first.
        let all = h.store.all().await;
        assert!(all[..4].iter().all(|r| r.consolidated));
        assert!(all[4..].iter().all(|r| !r.consolidated));
        Ok(())
    }

    #[tokio::test]
    async fn stats_count_outcomes() -> Result<()> {
        let h = harness(StubOracle::new().with_synthesize(insight_reply()), options(3));
        fill(&h.store, 1).await?;
        h.engine.check_and_run().await?;
        h.engine.trigger().await?;
        let stats = h.engine.stats().await;
        assert_eq!(stats.skipped_since_start, 1);
        assert_eq!(stats.failed_since_start, 0);
        assert_eq!(stats.cycles_committed, 1);
        assert_eq!(stats.records_consolidated, 1);
        assert_eq!(stats.last_dream_at, h.insights.latest().await.map(|i| i.created_at));
        assert_eq!(stats.unconsolidated, 0);
        assert!(matches!(stats.last_outcome, Some(CycleOutcome::Committed { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn batch_with_stored_insight_is_marked_without_synthesis() -> Result<()> {
        let h = harness(StubOracle::new().with_synthesize(insight_reply()), options(1));
        fill(&h.store, 3).await?;
        let (batch, _) = h.store.assemble_batch(100).await.unwrap();
        let existing = Insight::new(&batch, parse_insight_sections(&insight_reply())?);
        h.insights.append(existing.clone()).await?;

        let outcome = h.engine.trigger().await?;
        assert_eq!(
            outcome,
            CycleOutcome::Committed {
                insight_id: existing.id,
                batch_id: batch.id,
                records: 3,
                accepted: true,
            }
        );
        assert_eq!(h.calls.synthesize(), 0);
        assert_eq!(h.insights.len().await, 1);
        assert_eq!(h.store.unconsolidated_count(None).await, 0);
        assert!(h.weights.snapshot().bias.is_neutral());
        Ok(())
    }

    #[tokio::test]
    async fn mark_is_retried_until_the_memory_log_is_writable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let h = harness_on_disk(
            StubOracle::new().with_synthesize(insight_reply()),
            options(1),
            dir.path(),
        )?;
        fill(&h.store, 3).await?;

        // A file where the log directory was: every append fails.
        let memory_dir = dir.path().join("memory");
        let parked = dir.path().join("memory.parked");
        std::fs::rename(&memory_dir, &parked)?;
        std::fs::write(&memory_dir, b"not a directory")?;

        let engine = h.engine.clone();
        let cycle = tokio::spawn(async move { engine.trigger().await });
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.insights.is_empty().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!cycle.is_finished());
        assert_eq!(h.store.unconsolidated_count(None).await, 3);

        std::fs::remove_file(&memory_dir)?;
        std::fs::rename(&parked, &memory_dir)?;

        let outcome = tokio::time::timeout(Duration::from_secs(5), cycle).await???;
        assert!(matches!(outcome, CycleOutcome::Committed { records: 3, .. }));
        assert_eq!(h.insights.len().await, 1);
        assert_eq!(h.store.unconsolidated_count(None).await, 0);
        let batch_id = h.insights.latest().await.map(|i| i.batch_id);
        for record in h.store.all().await {
            assert_eq!(record.consolidation_batch_id, batch_id);
        }
        Ok(())
    }

    #[tokio::test]
    async fn insight_write_failure_fails_the_cycle_without_marking() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let h = harness_on_disk(
            StubOracle::new().with_synthesize(insight_reply()),
            options(1),
            dir.path(),
        )?;
        fill(&h.store, 3).await?;
        // A directory at the insight log path: appends fail.
        std::fs::create_dir_all(dir.path().join("insights").join("insights.jsonl"))?;

        let err = h.engine.trigger().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert_eq!(h.engine.phase(), DreamPhase::Idle);
        assert_eq!(h.store.unconsolidated_count(None).await, 3);
        assert!(h.store.all().await.iter().all(|r| r.consolidation_batch_id.is_none()));
        assert_eq!(h.insights.len().await, 0);
        assert!(h.weights.snapshot().bias.is_neutral());

        let stats = h.engine.stats().await;
        assert_eq!(stats.failed_since_start, 1);
        assert_eq!(stats.cycles_committed, 0);
        assert!(matches!(
            stats.last_outcome,
            Some(CycleOutcome::Failed { kind: ErrorKind::Storage, .. })
        ));
        Ok(())
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let json = serde_json::to_value(CycleOutcome::Failed {
            kind: ErrorKind::Timeout,
            message: "slow".into(),
        })
        .unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["kind"], "timeout");
    }
}
