//! Content-addressed store of turns, reflections and feedback.
//!
//! Every mutation is an event in a JSONL log (`recorded` or `consolidated`);
//! opening the store replays the log, so the `consolidated` flag and batch
//! links survive restarts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::axis::AxisVector;
use crate::embedding::{EmbedFn, cosine_similarity, hashed_embedding};
use crate::error::{MemoryError, MemoryResult};
use crate::event_log::JsonlLog;
use crate::schema::{ConsolidationBatch, MemoryRecord, RecordKind, record_id, truncate_str};
use crate::scoring::AxisScorer;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MemoryEvent {
    Recorded {
        record: MemoryRecord,
    },
    Consolidated {
        batch: ConsolidationBatch,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    pub embedding_dim: usize,
    /// A re-append of the same id inside this window is a replay error.
    pub duplicate_window: Duration,
    /// How many earlier turns are handed to the scorer as context.
    pub scoring_context_turns: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            embedding_dim: 64,
            duplicate_window: Duration::from_secs(3600),
            scoring_context_turns: 3,
        }
    }
}

/// Structured user feedback on one assistant response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackContext {
    pub user_input: String,
    pub assistant_output: String,
    pub feedback: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_axes: Option<AxisVector>,
}

impl FeedbackContext {
    pub fn render(&self) -> String {
        let mut text = format!(
            "User input: {}\nAssistant response: {}\nFeedback: {}",
            truncate_str(self.user_input.trim(), 100),
            truncate_str(self.assistant_output.trim(), 150),
            self.feedback.trim(),
        );
        if let Some(axes) = &self.response_axes {
            text.push_str(&format!("\nResponse axes: {}", axes.compact()));
        }
        text
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub turns: usize,
    pub reflections: usize,
    pub feedback: usize,
    pub consolidated: usize,
    pub unconsolidated: usize,
    pub unscored: usize,
}

#[derive(Default)]
struct StoreState {
    records: Vec<MemoryRecord>,
    index: HashMap<String, usize>,
}

impl StoreState {
    fn get(&self, id: &str) -> Option<&MemoryRecord> {
        self.index.get(id).map(|&i| &self.records[i])
    }

    fn insert(&mut self, record: MemoryRecord) {
        if self.index.contains_key(&record.id) {
            return;
        }
        self.index.insert(record.id.clone(), self.records.len());
        self.records.push(record);
    }

    /// Ids in `batch` that still need flipping.  Records already linked to a
    /// different batch are left alone.
    fn pending_marks(&self, batch: &ConsolidationBatch) -> Vec<usize> {
        batch
            .record_ids
            .iter()
            .filter_map(|id| {
                let Some(&pos) = self.index.get(id) else {
                    warn!(record_id = %id, batch_id = %batch.id, "batch references unknown record");
                    return None;
                };
                let record = &self.records[pos];
                match &record.consolidation_batch_id {
                    None => Some(pos),
                    Some(existing) if existing != &batch.id => {
                        warn!(record_id = %id, existing = %existing, batch_id = %batch.id, "record already consolidated by another batch");
                        None
                    }
                    Some(_) => None,
                }
            })
            .collect()
    }

    fn apply_marks(&mut self, positions: &[usize], batch_id: &str) {
        for &pos in positions {
            let record = &mut self.records[pos];
            record.consolidated = true;
            record.consolidation_batch_id = Some(batch_id.to_string());
        }
    }

    fn apply(&mut self, event: MemoryEvent) {
        match event {
            MemoryEvent::Recorded { record } => self.insert(record),
            MemoryEvent::Consolidated { batch, .. } => {
                let pending = self.pending_marks(&batch);
                self.apply_marks(&pending, &batch.id);
            }
        }
    }

    /// Oldest-first unconsolidated records.  Ties keep insertion order.
    fn unconsolidated_fifo(&self) -> Vec<&MemoryRecord> {
        let mut pending: Vec<&MemoryRecord> =
            self.records.iter().filter(|r| !r.consolidated).collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }
}

pub struct MemoryStore {
    state: Mutex<StoreState>,
    log: Option<JsonlLog>,
    scorer: Arc<AxisScorer>,
    embed_fn: Option<EmbedFn>,
    options: StoreOptions,
}

impl MemoryStore {
    pub fn in_memory(scorer: Arc<AxisScorer>, options: StoreOptions) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            log: None,
            scorer,
            embed_fn: None,
            options,
        }
    }

    /// Open (or create) the event log at `path` and replay it.
    pub fn open(
        path: impl AsRef<Path>,
        scorer: Arc<AxisScorer>,
        options: StoreOptions,
    ) -> MemoryResult<Self> {
        let log = JsonlLog::new(path.as_ref());
        let events: Vec<MemoryEvent> = log.load()?;
        let event_count = events.len();
        let mut state = StoreState::default();
        for event in events {
            state.apply(event);
        }
        info!(
            events = event_count,
            records = state.records.len(),
            path = %log.path().display(),
            "memory store replayed"
        );
        Ok(Self {
            state: Mutex::new(state),
            log: Some(log),
            scorer,
            embed_fn: None,
            options,
        })
    }

    pub fn set_embed_fn(&mut self, f: EmbedFn) {
        self.embed_fn = Some(f);
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub async fn append(&self, kind: RecordKind, text: &str) -> MemoryResult<MemoryRecord> {
        self.append_at(kind, text, Utc::now()).await
    }

    /// Store one record stamped `created_at`.
    ///
    /// Scoring is best effort: any scoring failure stores the record with
    /// neutral axes and `scored = false`.  Re-appending an id seen within the
    /// duplicate window fails with [`MemoryError::DuplicateRecord`]; an older
    /// duplicate returns the stored record unchanged.
    #[instrument(skip(self, kind, text), fields(kind = kind.slug()))]
    pub async fn append_at(
        &self,
        kind: RecordKind,
        text: &str,
        created_at: DateTime<Utc>,
    ) -> MemoryResult<MemoryRecord> {
        let text = text.trim();
        if text.is_empty() {
            return Err(MemoryError::InvalidInput("record text is empty".into()));
        }
        let id = record_id(kind, text, created_at);

        let context = {
            let state = self.state.lock().await;
            if let Some(existing) = state.get(&id) {
                return self.resolve_duplicate(existing);
            }
            self.context_turns(&state)
        };

        let (axes, scored) = match self.scorer.score(text, Some(context.as_slice())).await {
            Ok(axes) => (axes, true),
            Err(err) => {
                warn!(record_id = %id, error = %err, "scoring failed; storing record unscored");
                (AxisVector::NEUTRAL, false)
            }
        };
        let embedding = self.embed(text).await;

        let mut state = self.state.lock().await;
        if let Some(existing) = state.get(&id) {
            return self.resolve_duplicate(existing);
        }
        let record = MemoryRecord {
            id,
            kind,
            text: text.to_string(),
            axes,
            scored,
            embedding,
            created_at,
            recorded_at: Utc::now(),
            consolidated: false,
            consolidation_batch_id: None,
        };
        if let Some(log) = &self.log {
            log.append(&MemoryEvent::Recorded { record: record.clone() }).await?;
        }
        state.insert(record.clone());
        debug!(record_id = %record.id_short(), scored, "record appended");
        Ok(record)
    }

    pub async fn append_feedback(&self, feedback: &FeedbackContext) -> MemoryResult<MemoryRecord> {
        if feedback.feedback.trim().is_empty() {
            return Err(MemoryError::InvalidInput("feedback text is empty".into()));
        }
        self.append(RecordKind::Feedback, &feedback.render()).await
    }

    fn resolve_duplicate(&self, existing: &MemoryRecord) -> MemoryResult<MemoryRecord> {
        let age = (Utc::now() - existing.recorded_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if age < self.options.duplicate_window {
            warn!(record_id = %existing.id, "duplicate append rejected");
            return Err(MemoryError::DuplicateRecord {
                id: existing.id.clone(),
            });
        }
        debug!(record_id = %existing.id, "re-append outside duplicate window; returning stored record");
        Ok(existing.clone())
    }

    fn context_turns(&self, state: &StoreState) -> Vec<String> {
        let mut turns: Vec<String> = state
            .records
            .iter()
            .rev()
            .filter(|r| r.kind == RecordKind::Turn)
            .take(self.options.scoring_context_turns)
            .map(|r| r.text.clone())
            .collect();
        turns.reverse();
        turns
    }

    /// Remote embedding when configured and well-formed, local hashing
    /// otherwise, so every record has `embedding_dim` components.
    async fn embed(&self, text: &str) -> Vec<f32> {
        if let Some(embed_fn) = &self.embed_fn {
            match embed_fn(text.to_string()).await {
                Some(v) if v.len() == self.options.embedding_dim => return v,
                Some(v) => {
                    debug!(got = v.len(), want = self.options.embedding_dim, "embedding dimension mismatch; using local embedding");
                }
                None => debug!("embedding backend unavailable; using local embedding"),
            }
        }
        hashed_embedding(text, self.options.embedding_dim)
    }

    pub async fn unconsolidated_count(&self, kind: Option<RecordKind>) -> usize {
        self.state
            .lock()
            .await
            .records
            .iter()
            .filter(|r| !r.consolidated && kind.is_none_or(|k| r.kind == k))
            .count()
    }

    /// The oldest unconsolidated records, oldest first, at most `limit`.
    pub async fn select_for_consolidation(&self, limit: usize) -> Vec<MemoryRecord> {
        let state = self.state.lock().await;
        state
            .unconsolidated_fifo()
            .into_iter()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Select and snapshot a batch under one lock.  `None` when nothing is
    /// waiting.
    pub async fn assemble_batch(&self, limit: usize) -> Option<(ConsolidationBatch, Vec<MemoryRecord>)> {
        let state = self.state.lock().await;
        let records: Vec<MemoryRecord> = state
            .unconsolidated_fifo()
            .into_iter()
            .take(limit)
            .cloned()
            .collect();
        if records.is_empty() {
            return None;
        }
        let batch = ConsolidationBatch::new(records.iter().map(|r| r.id.clone()).collect());
        Some((batch, records))
    }

    /// Flip `consolidated` for every record in `batch`.  Idempotent: records
    /// already linked to this batch are skipped, and when nothing changes no
    /// event is written.  Returns the number of records newly marked.
    #[instrument(skip(self, batch), fields(batch_id = %batch.id))]
    pub async fn mark_consolidated(&self, batch: &ConsolidationBatch) -> MemoryResult<usize> {
        let mut state = self.state.lock().await;
        let pending = state.pending_marks(batch);
        if pending.is_empty() {
            return Ok(0);
        }
        if let Some(log) = &self.log {
            log.append(&MemoryEvent::Consolidated {
                batch: batch.clone(),
                at: Utc::now(),
            })
            .await?;
        }
        state.apply_marks(&pending, &batch.id);
        info!(marked = pending.len(), "records consolidated");
        Ok(pending.len())
    }

    /// Nearest `k` records by cosine similarity, best first; ties go to the
    /// older record.
    pub async fn similarity_search(&self, query: &[f32], k: usize) -> Vec<MemoryRecord> {
        self.similarity_search_scored(query, k)
            .await
            .into_iter()
            .map(|(record, _)| record)
            .collect()
    }

    pub async fn similarity_search_scored(&self, query: &[f32], k: usize) -> Vec<(MemoryRecord, f32)> {
        let state = self.state.lock().await;
        let mut scored: Vec<(&MemoryRecord, f32)> = state
            .records
            .iter()
            .map(|r| (r, cosine_similarity(&r.embedding, query)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.created_at.cmp(&b.0.created_at))
        });
        scored
            .into_iter()
            .take(k)
            .map(|(r, s)| (r.clone(), s))
            .collect()
    }

    pub async fn search_text(&self, query: &str, k: usize) -> Vec<(MemoryRecord, f32)> {
        let embedding = self.embed(query).await;
        self.similarity_search_scored(&embedding, k).await
    }

    /// Newest first.
    pub async fn recent(&self, limit: usize) -> Vec<MemoryRecord> {
        self.state
            .lock()
            .await
            .records
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: &str) -> Option<MemoryRecord> {
        self.state.lock().await.get(id).cloned()
    }

    pub async fn all(&self) -> Vec<MemoryRecord> {
        self.state.lock().await.records.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> StoreStats {
        let state = self.state.lock().await;
        let mut stats = StoreStats {
            total: state.records.len(),
            ..StoreStats::default()
        };
        for record in &state.records {
            match record.kind {
                RecordKind::Turn => stats.turns += 1,
                RecordKind::Reflection => stats.reflections += 1,
                RecordKind::Feedback => stats.feedback += 1,
            }
            if record.consolidated {
                stats.consolidated += 1;
            } else {
                stats.unconsolidated += 1;
            }
            if !record.scored {
                stats.unscored += 1;
            }
        }
        stats
    }
}
