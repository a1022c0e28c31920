use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::axis::AxisVector;

/// What a stored record represents.
///
/// | Kind         | Purpose                                                   |
/// |--------------|-----------------------------------------------------------|
/// | `Turn`       | One dialogue exchange unit, user or agent                 |
/// | `Reflection` | The agent's own thoughts about the conversation           |
/// | `Feedback`   | User feedback on a response                               |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Turn,
    Reflection,
    Feedback,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [Self::Turn, Self::Reflection, Self::Feedback];

    /// Canonical display label used in prompts and reports.
    pub fn label(self) -> &'static str {
        match self {
            Self::Turn => "Turn",
            Self::Reflection => "Reflection",
            Self::Feedback => "Feedback",
        }
    }

    /// Lowercase slug used in ids, CLI flags and log lines.
    pub fn slug(self) -> &'static str {
        match self {
            Self::Turn => "turn",
            Self::Reflection => "reflection",
            Self::Feedback => "feedback",
        }
    }

    pub fn from_label(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "turn" | "chat" | "message" => Some(Self::Turn),
            "reflection" | "thought" => Some(Self::Reflection),
            "feedback" => Some(Self::Feedback),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub kind: RecordKind,
    pub text: String,
    pub axes: AxisVector,
    /// False when scoring failed; `axes` is then [`AxisVector::NEUTRAL`].
    pub scored: bool,
    pub embedding: Vec<f32>,
    /// Timestamp of the turn itself (supplied by the caller or now).
    pub created_at: DateTime<Utc>,
    /// When the store accepted the record; drives the duplicate window.
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub consolidated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consolidation_batch_id: Option<String>,
}

impl MemoryRecord {
    /// First 8 characters of the id, used as a compact display identifier.
    pub fn id_short(&self) -> &str {
        truncate_str(&self.id, 8)
    }
}

/// Deterministic content id over (kind, timestamp, text).
///
/// The same turn appended twice with the same timestamp always hashes to the
/// same id, which is what replay detection keys on.
pub fn record_id(kind: RecordKind, text: &str, created_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.slug().as_bytes());
    hasher.update(b"\n");
    hasher.update(
        created_at
            .to_rfc3339_opts(SecondsFormat::Nanos, true)
            .as_bytes(),
    );
    hasher.update(b"\n");
    hasher.update(text.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..32].to_string()
}

/// Immutable snapshot of the records one dreaming cycle consolidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationBatch {
    pub id: String,
    /// Oldest first.
    pub record_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ConsolidationBatch {
    /// The id hashes the member ids, so a retried cycle over the same records
    /// produces the same batch id.
    pub fn new(record_ids: Vec<String>) -> Self {
        let mut hasher = Sha256::new();
        for id in &record_ids {
            hasher.update(id.as_bytes());
            hasher.update(b"\n");
        }
        let hex = format!("{:x}", hasher.finalize());
        Self {
            id: format!("batch-{}", &hex[..16]),
            record_ids,
            created_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.record_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.record_ids.is_empty()
    }
}

/// Truncate `s` to at most `max_chars` Unicode scalar values, returning a
/// sub-slice.
pub fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
