//! Insights produced by dreaming cycles and the append-only store that keeps
//! them.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::axis::Axis;
use crate::error::MemoryResult;
use crate::event_log::JsonlLog;
use crate::schema::ConsolidationBatch;

/// One short statement inside an insight section.
///
/// `axis` and `shift` are optional: when both are present the statement
/// nudges that axis's scoring bias (negative shifts toward the negative
/// pole).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shift: Option<f32>,
}

impl Statement {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            axis: None,
            shift: None,
        }
    }

    pub fn tagged(text: impl Into<String>, axis: Axis, shift: f32) -> Self {
        Self {
            text: text.into(),
            axis: Some(axis.key().to_string()),
            shift: Some(shift),
        }
    }

    /// Resolved axis and finite shift, if this statement carries both.
    pub fn adjustment(&self) -> Option<(Axis, f32)> {
        let axis = Axis::from_key(self.axis.as_deref()?)?;
        let shift = self.shift.filter(|s| s.is_finite())?;
        Some((axis, shift))
    }

    fn is_valid(&self) -> bool {
        let axis_ok = self
            .axis
            .as_deref()
            .is_none_or(|key| Axis::from_key(key).is_some());
        let shift_ok = self.shift.is_none_or(f32::is_finite);
        axis_ok && shift_ok
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightSections {
    /// Areas to adjust.
    pub corrective: Vec<Statement>,
    /// Strengths to keep.
    pub reinforcing: Vec<Statement>,
    /// New understanding.
    pub emergent: Vec<Statement>,
}

impl InsightSections {
    pub fn all(&self) -> impl Iterator<Item = &Statement> {
        self.corrective
            .iter()
            .chain(self.reinforcing.iter())
            .chain(self.emergent.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub id: String,
    pub batch_id: String,
    pub sections: InsightSections,
    pub created_at: DateTime<Utc>,
    /// False when a statement references an unknown axis or carries a
    /// non-finite shift.  Rejected insights never move axis weights.
    pub accepted: bool,
    pub record_count: usize,
    /// Members of the consolidated batch, oldest first.  Lets an insight
    /// whose batch was never marked be re-linked on the next open.
    #[serde(default)]
    pub record_ids: Vec<String>,
}

impl Insight {
    pub fn new(batch: &ConsolidationBatch, sections: InsightSections) -> Self {
        let accepted = sections.all().all(Statement::is_valid);
        Self {
            id: Uuid::new_v4().to_string(),
            batch_id: batch.id.clone(),
            sections,
            created_at: Utc::now(),
            accepted,
            record_count: batch.len(),
            record_ids: batch.record_ids.clone(),
        }
    }

    /// The batch this insight consolidated.
    pub fn batch(&self) -> ConsolidationBatch {
        ConsolidationBatch {
            id: self.batch_id.clone(),
            record_ids: self.record_ids.clone(),
            created_at: self.created_at,
        }
    }

    /// Markdown dream report for operators.
    pub fn render_report(&self) -> String {
        let mut out = format!(
            "# Dream report {}\n\n- batch: `{}` ({} records)\n- created: {}\n- status: {}\n",
            &self.id[..8.min(self.id.len())],
            self.batch_id,
            self.record_count,
            self.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            if self.accepted { "accepted" } else { "rejected" },
        );
        let sections = [
            ("Corrective", &self.sections.corrective),
            ("Reinforcing", &self.sections.reinforcing),
            ("Emergent", &self.sections.emergent),
        ];
        for (title, statements) in sections {
            out.push_str(&format!("\n## {title}\n\n"));
            for statement in statements {
                match (&statement.axis, statement.shift) {
                    (Some(axis), Some(shift)) => {
                        out.push_str(&format!("- {} _({axis} {shift:+.2})_\n", statement.text))
                    }
                    _ => out.push_str(&format!("- {}\n", statement.text)),
                }
            }
        }
        out
    }
}

/// Append-only insight log.  There is no update or delete.
pub struct InsightStore {
    log: Option<JsonlLog>,
    insights: RwLock<Vec<Insight>>,
}

impl InsightStore {
    pub fn in_memory() -> Self {
        Self {
            log: None,
            insights: RwLock::new(Vec::new()),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> MemoryResult<Self> {
        let log = JsonlLog::new(path.as_ref());
        let insights: Vec<Insight> = log.load()?;
        debug!(count = insights.len(), path = %log.path().display(), "insight log loaded");
        Ok(Self {
            log: Some(log),
            insights: RwLock::new(insights),
        })
    }

    /// Persist `insight`.  Storage failures are returned to the caller.
    pub async fn append(&self, insight: Insight) -> MemoryResult<()> {
        let mut insights = self.insights.write().await;
        if let Some(log) = &self.log {
            log.append(&insight).await?;
        }
        info!(
            insight_id = %insight.id,
            batch_id = %insight.batch_id,
            accepted = insight.accepted,
            "insight stored"
        );
        insights.push(insight);
        Ok(())
    }

    /// Newest first.
    pub async fn list_recent(&self, limit: usize) -> Vec<Insight> {
        self.insights
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Oldest first, in append order.
    pub async fn list_all(&self) -> Vec<Insight> {
        self.insights.read().await.clone()
    }

    /// Non-blocking [`list_all`](Self::list_all); `None` while an append
    /// holds the lock.
    pub fn try_list_all(&self) -> Option<Vec<Insight>> {
        self.insights.try_read().ok().map(|guard| guard.clone())
    }

    pub async fn list_by_batch(&self, batch_id: &str) -> Option<Insight> {
        self.insights
            .read()
            .await
            .iter()
            .find(|i| i.batch_id == batch_id)
            .cloned()
    }

    pub async fn latest(&self) -> Option<Insight> {
        self.insights.read().await.last().cloned()
    }

    pub async fn len(&self) -> usize {
        self.insights.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.insights.read().await.is_empty()
    }
}
