//! Axis weighting state: a running scoring bias learned from accepted
//! insights.
//!
//! The state is owned by [`AxisWeights`]; the dreaming engine is its only
//! mutator (plus the operator reset).  Each update is persisted as a JSON
//! snapshot, and on load every accepted insight newer than the snapshot's
//! `last_insight_id` is re-applied, so a lost snapshot write never loses an
//! update.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::axis::AxisVector;
use crate::error::MemoryResult;
use crate::event_log::write_atomic;
use crate::insight::Insight;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisWeightState {
    pub bias: AxisVector,
    pub applied_insights: u64,
    #[serde(default)]
    pub last_insight_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AxisWeightState {
    pub fn neutral() -> Self {
        Self {
            bias: AxisVector::NEUTRAL,
            applied_insights: 0,
            last_insight_id: None,
            updated_at: Utc::now(),
        }
    }

    /// `clamp(raw + bias)`, per axis.
    pub fn apply(&self, raw: &AxisVector) -> AxisVector {
        raw.offset_by(&self.bias)
    }
}

/// How far one insight may move the bias.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightRule {
    pub learning_rate: f32,
    pub max_bias: f32,
}

impl Default for WeightRule {
    fn default() -> Self {
        Self {
            learning_rate: 0.25,
            max_bias: 2.0,
        }
    }
}

impl WeightRule {
    /// Fold one accepted insight into `state`.
    ///
    /// Corrective statements move an axis by `rate * clamp(shift, -1, 1)`,
    /// reinforcing statements by half that; emergent statements are
    /// descriptive only.
    pub fn absorb(&self, state: &mut AxisWeightState, insight: &Insight) {
        let corrective = insight.sections.corrective.iter().map(|s| (s, 1.0));
        let reinforcing = insight.sections.reinforcing.iter().map(|s| (s, 0.5));
        for (statement, factor) in corrective.chain(reinforcing) {
            let Some((axis, shift)) = statement.adjustment() else {
                continue;
            };
            let delta = self.learning_rate * factor * shift.clamp(-1.0, 1.0);
            let next = (state.bias.get(axis) + delta).clamp(-self.max_bias, self.max_bias);
            state.bias.set(axis, next);
        }
        state.applied_insights += 1;
        state.last_insight_id = Some(insight.id.clone());
        state.updated_at = Utc::now();
    }
}

pub struct AxisWeights {
    state: RwLock<AxisWeightState>,
    snapshot_path: Option<PathBuf>,
    rule: WeightRule,
}

impl AxisWeights {
    pub fn in_memory(rule: WeightRule) -> Self {
        Self {
            state: RwLock::new(AxisWeightState::neutral()),
            snapshot_path: None,
            rule,
        }
    }

    /// Load the snapshot at `path` (neutral if absent) and replay every
    /// accepted insight in `insights` that follows `last_insight_id`.
    pub fn load(path: impl AsRef<Path>, rule: WeightRule, insights: &[Insight]) -> MemoryResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut state = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str::<AxisWeightState>(&raw)?
        } else {
            AxisWeightState::neutral()
        };

        let start = match &state.last_insight_id {
            Some(last) => insights
                .iter()
                .position(|i| &i.id == last)
                .map(|pos| pos + 1)
                .unwrap_or_else(|| {
                    warn!(last_insight_id = %last, "snapshot references unknown insight; not replaying");
                    insights.len()
                }),
            None => 0,
        };
        let mut replayed = 0usize;
        for insight in insights[start..].iter().filter(|i| i.accepted) {
            rule.absorb(&mut state, insight);
            replayed += 1;
        }
        if replayed > 0 {
            info!(replayed, "axis weights caught up from insight log");
        }

        Ok(Self {
            state: RwLock::new(state),
            snapshot_path: Some(path),
            rule,
        })
    }

    pub fn snapshot(&self) -> AxisWeightState {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn apply(&self, raw: &AxisVector) -> AxisVector {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .apply(raw)
    }

    /// Apply an accepted insight.  Rejected insights are ignored.
    ///
    /// A failed snapshot write is logged, not returned: the in-memory state
    /// is already updated and the next load replays the insight.
    pub async fn absorb_insight(&self, insight: &Insight) -> AxisWeightState {
        if !insight.accepted {
            return self.snapshot();
        }
        let next = {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            self.rule.absorb(&mut state, insight);
            state.clone()
        };
        info!(insight_id = %insight.id, bias = %next.bias.compact(), "axis weights updated");
        if let Err(err) = self.persist(&next).await {
            warn!(error = %err, "axis weight snapshot not written; will replay on next load");
        }
        next
    }

    /// Operator reset: zero bias, pinned to `latest_insight_id` so older
    /// insights are not replayed on the next load.
    pub async fn reset(&self, latest_insight_id: Option<String>) -> MemoryResult<AxisWeightState> {
        let next = {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *state = AxisWeightState {
                last_insight_id: latest_insight_id,
                ..AxisWeightState::neutral()
            };
            state.clone()
        };
        self.persist(&next).await?;
        info!("axis weights reset to neutral");
        Ok(next)
    }

    async fn persist(&self, state: &AxisWeightState) -> MemoryResult<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(path, &bytes).await
    }
}
