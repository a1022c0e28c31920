//! Axis scoring: text in, clamped and bias-adjusted [`AxisVector`] out.

use std::sync::Arc;
use std::time::Duration;

use awareness_llm::{OracleRequest, ReasoningOracle, extract_json_output};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::axis::{Axis, AxisVector};
use crate::error::{MemoryError, MemoryResult};
use crate::schema::truncate_str;
use crate::weights::AxisWeights;

const CONTEXT_TURN_CHARS: usize = 400;

/// The oracle's classification before and after the weight bias.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisScore {
    pub raw: AxisVector,
    pub adjusted: AxisVector,
}

pub struct AxisScorer {
    oracle: Arc<dyn ReasoningOracle>,
    weights: Arc<AxisWeights>,
    temperature: f32,
    timeout: Duration,
}

impl AxisScorer {
    pub fn new(
        oracle: Arc<dyn ReasoningOracle>,
        weights: Arc<AxisWeights>,
        temperature: f32,
        timeout: Duration,
    ) -> Self {
        Self {
            oracle,
            weights,
            temperature,
            timeout,
        }
    }

    pub async fn score(&self, text: &str, context: Option<&[String]>) -> MemoryResult<AxisVector> {
        Ok(self.score_detailed(text, context).await?.adjusted)
    }

    #[instrument(skip(self, text, context), fields(chars = text.len()))]
    pub async fn score_detailed(
        &self,
        text: &str,
        context: Option<&[String]>,
    ) -> MemoryResult<AxisScore> {
        if text.trim().is_empty() {
            return Err(MemoryError::InvalidInput("text is empty".into()));
        }

        let request = OracleRequest::classify(scoring_prompt(text, context), self.temperature);
        let reply = match tokio::time::timeout(self.timeout, self.oracle.complete(&request)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => return Err(MemoryError::Oracle(err.to_string())),
            Err(_) => return Err(MemoryError::OracleTimeout { after: self.timeout }),
        };

        let raw = parse_axis_reply(&reply)?;
        let adjusted = self.weights.apply(&raw);
        debug!(raw = %raw.compact(), adjusted = %adjusted.compact(), "text scored");
        Ok(AxisScore { raw, adjusted })
    }
}

pub fn scoring_prompt(text: &str, context: Option<&[String]>) -> String {
    let mut prompt = String::from(
        "Place the INPUT below on six personality axes. Each axis runs from -5 to +5.\n\n",
    );
    for axis in Axis::ALL {
        prompt.push_str(&format!("- {} ({}): {}\n", axis.key(), axis.label(), axis.scale_hint()));
    }

    if let Some(turns) = context.filter(|turns| !turns.is_empty()) {
        prompt.push_str("\nEarlier turns, for context only (do not score these):\n");
        for turn in turns {
            prompt.push_str(&format!("- {}\n", truncate_str(turn, CONTEXT_TURN_CHARS)));
        }
    }

    prompt.push_str(&format!("\nINPUT:\n{text}\n\n"));
    prompt.push_str("Reply with JSON only, using exactly these six keys:\n");
    prompt.push_str("{\"input_axes\": {");
    let keys: Vec<String> = Axis::ALL.iter().map(|a| format!("\"{}\": 0", a.key())).collect();
    prompt.push_str(&keys.join(", "));
    prompt.push_str("}}\n");
    prompt
}

/// Validate an oracle reply into a clamped vector.
///
/// Accepts `{"input_axes": {...}}` or a bare six-key object.  Anything else
/// (missing, unknown or repeated axes, non-numeric or non-finite values) is
/// a [`MemoryError::ScoringFormat`].
pub fn parse_axis_reply(reply: &str) -> MemoryResult<AxisVector> {
    let value: Value = extract_json_output(reply)
        .ok_or_else(|| MemoryError::ScoringFormat("no JSON object in reply".into()))?;
    let object = match value.get("input_axes") {
        Some(Value::Object(inner)) => inner,
        Some(_) => return Err(MemoryError::ScoringFormat("`input_axes` is not an object".into())),
        None => value
            .as_object()
            .ok_or_else(|| MemoryError::ScoringFormat("reply is not an object".into()))?,
    };

    if object.len() != Axis::ALL.len() {
        return Err(MemoryError::ScoringFormat(format!(
            "expected {} axes, got {}",
            Axis::ALL.len(),
            object.len()
        )));
    }

    let mut seen = [false; 6];
    let mut values = [0.0f32; 6];
    for (key, raw) in object {
        let axis = Axis::from_key(key)
            .ok_or_else(|| MemoryError::ScoringFormat(format!("unknown axis `{key}`")))?;
        let slot = axis.index();
        if seen[slot] {
            return Err(MemoryError::ScoringFormat(format!("axis `{key}` repeated")));
        }
        let number = raw
            .as_f64()
            .filter(|n| n.is_finite())
            .ok_or_else(|| MemoryError::ScoringFormat(format!("axis `{key}` is not a finite number")))?;
        seen[slot] = true;
        values[slot] = number as f32;
    }
    Ok(AxisVector::new(values))
}
