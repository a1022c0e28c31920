//! Synthesis prompt assembly and validation of the oracle's reply.

use awareness_llm::{extract_json_output, strip_think_block};
use serde::Deserialize;
use tracing::debug;

use crate::error::{MemoryError, MemoryResult};
use crate::insight::{InsightSections, Statement};
use crate::schema::{MemoryRecord, RecordKind, truncate_str};
use crate::weights::AxisWeightState;

const RECORD_CHARS: usize = 600;

pub fn synthesis_prompt(records: &[MemoryRecord], weights: &AxisWeightState) -> String {
    let (feedback, memories): (Vec<&MemoryRecord>, Vec<&MemoryRecord>) = records
        .iter()
        .partition(|r| r.kind == RecordKind::Feedback);

    let mut prompt = String::from(
        "You are consolidating an assistant's recent memories into insights, the way sleep \
         turns a day's experience into understanding.\n\n## Memories (oldest first)\n",
    );
    for record in &memories {
        prompt.push_str(&format!(
            "- [{} {}] {}\n  axes: {}\n",
            record.kind.label(),
            record.created_at.format("%Y-%m-%d %H:%M"),
            truncate_str(&record.text, RECORD_CHARS),
            if record.scored { record.axes.compact() } else { "unscored".to_string() },
        ));
    }
    if memories.is_empty() {
        prompt.push_str("(none)\n");
    }

    prompt.push_str("\n## User feedback\n");
    if feedback.is_empty() {
        prompt.push_str("(no user feedback)\n");
    }
    for record in &feedback {
        prompt.push_str(&format!(
            "- [{}]\n{}\n",
            record.created_at.format("%Y-%m-%d %H:%M"),
            truncate_str(&record.text, RECORD_CHARS),
        ));
    }

    prompt.push_str("\n## Current response tendencies\n");
    prompt.push_str(&weights.bias.describe());
    prompt.push_str(&format!(
        "\n(from {} earlier insights)\n\n",
        weights.applied_insights
    ));

    prompt.push_str(
        "## Task\n\
         Write three sections of short statements:\n\
         - corrective: what the assistant should adjust\n\
         - reinforcing: strengths to keep\n\
         - emergent: new understanding of the user or the relationship\n\
         Each section needs at least one statement. A corrective or reinforcing statement may \
         name one axis key and a shift between -1 and 1 (negative moves toward the first pole).\n\n\
         Reply with JSON only:\n\
         {\"corrective\": [{\"text\": \"...\", \"axis\": \"analysis_overview\", \"shift\": 0.5}],\n \
         \"reinforcing\": [{\"text\": \"...\"}],\n \
         \"emergent\": [{\"text\": \"...\"}]}\n",
    );
    prompt
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStatement {
    Plain(String),
    Tagged {
        text: String,
        #[serde(default)]
        axis: Option<String>,
        #[serde(default)]
        shift: Option<f32>,
    },
}

impl From<RawStatement> for Statement {
    fn from(raw: RawStatement) -> Self {
        match raw {
            RawStatement::Plain(text) => Statement::plain(text.trim()),
            RawStatement::Tagged { text, axis, shift } => Statement {
                text: text.trim().to_string(),
                axis: axis.map(|a| a.trim().to_string()).filter(|a| !a.is_empty()),
                shift,
            },
        }
    }
}

#[derive(Deserialize)]
struct RawSections {
    #[serde(default)]
    corrective: Vec<RawStatement>,
    #[serde(default)]
    reinforcing: Vec<RawStatement>,
    #[serde(default)]
    emergent: Vec<RawStatement>,
}

/// Parse the oracle's synthesis reply into three non-empty sections.
///
/// JSON is tried first; a reply of `CORRECTIVE:` / `REINFORCING:` /
/// `EMERGENT:` prefixed lines is accepted as a fallback.  `NONE` and blank
/// statements are dropped before the non-empty check.
pub fn parse_insight_sections(reply: &str) -> MemoryResult<InsightSections> {
    let sections = match extract_json_output::<RawSections>(reply) {
        Some(raw) => InsightSections {
            corrective: clean(raw.corrective),
            reinforcing: clean(raw.reinforcing),
            emergent: clean(raw.emergent),
        },
        None => parse_prefixed_lines(reply),
    };

    for (name, statements) in [
        ("corrective", &sections.corrective),
        ("reinforcing", &sections.reinforcing),
        ("emergent", &sections.emergent),
    ] {
        if statements.is_empty() {
            return Err(MemoryError::SynthesisFormat(format!("section `{name}` is empty or missing")));
        }
    }
    debug!(
        corrective = sections.corrective.len(),
        reinforcing = sections.reinforcing.len(),
        emergent = sections.emergent.len(),
        "insight sections parsed"
    );
    Ok(sections)
}

fn clean(raw: Vec<RawStatement>) -> Vec<Statement> {
    raw.into_iter()
        .map(Statement::from)
        .filter(|s| !is_none(&s.text))
        .collect()
}

fn parse_prefixed_lines(reply: &str) -> InsightSections {
    let mut sections = InsightSections {
        corrective: Vec::new(),
        reinforcing: Vec::new(),
        emergent: Vec::new(),
    };
    for line in strip_think_block(reply).lines() {
        let line = line.trim().trim_start_matches(['-', '*']).trim();
        let (target, rest) = if let Some(rest) = strip_key(line, "CORRECTIVE:") {
            (&mut sections.corrective, rest)
        } else if let Some(rest) = strip_key(line, "REINFORCING:") {
            (&mut sections.reinforcing, rest)
        } else if let Some(rest) = strip_key(line, "EMERGENT:") {
            (&mut sections.emergent, rest)
        } else {
            continue;
        };
        if !is_none(rest) {
            target.push(Statement::plain(rest));
        }
    }
    sections
}

fn strip_key<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    line.strip_prefix(key).map(str::trim)
}

fn is_none(s: &str) -> bool {
    let low = s.trim().to_lowercase();
    low.is_empty() || low == "none" || low == "n/a"
}
