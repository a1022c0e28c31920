//! The six personality axes and the bounded vector that places a piece of
//! text on them.
//!
//! | Axis                       | -5                          | +5                           |
//! |----------------------------|-----------------------------|------------------------------|
//! | `analysis_overview`        | detailed analysis           | big-picture overview         |
//! | `individual_collective`    | personal, subjective        | universal, objective         |
//! | `empathy_responsibility`   | feelings first              | realistic judgement first    |
//! | `cooperation_independence` | adapt to the other person   | assert one's own view        |
//! | `stability_transformation` | keep things as they are     | push for deep change         |
//! | `divergence_convergence`   | widen the options           | reach a conclusion           |

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const AXIS_MIN: f32 = -5.0;
pub const AXIS_MAX: f32 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    AnalysisOverview,
    IndividualCollective,
    EmpathyResponsibility,
    CooperationIndependence,
    StabilityTransformation,
    DivergenceConvergence,
}

impl Axis {
    pub const ALL: [Axis; 6] = [
        Axis::AnalysisOverview,
        Axis::IndividualCollective,
        Axis::EmpathyResponsibility,
        Axis::CooperationIndependence,
        Axis::StabilityTransformation,
        Axis::DivergenceConvergence,
    ];

    /// Snake-case key used in oracle JSON, persisted records and logs.
    pub fn key(self) -> &'static str {
        match self {
            Self::AnalysisOverview => "analysis_overview",
            Self::IndividualCollective => "individual_collective",
            Self::EmpathyResponsibility => "empathy_responsibility",
            Self::CooperationIndependence => "cooperation_independence",
            Self::StabilityTransformation => "stability_transformation",
            Self::DivergenceConvergence => "divergence_convergence",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::AnalysisOverview => "Analysis-Overview",
            Self::IndividualCollective => "Individual-Collective",
            Self::EmpathyResponsibility => "Empathy-Responsibility",
            Self::CooperationIndependence => "Cooperation-Independence",
            Self::StabilityTransformation => "Stability-Transformation",
            Self::DivergenceConvergence => "Divergence-Convergence",
        }
    }

    /// Short name of the -5 pole.
    pub fn negative_pole(self) -> &'static str {
        match self {
            Self::AnalysisOverview => "analysis",
            Self::IndividualCollective => "individual",
            Self::EmpathyResponsibility => "empathy",
            Self::CooperationIndependence => "cooperation",
            Self::StabilityTransformation => "stability",
            Self::DivergenceConvergence => "divergence",
        }
    }

    /// Short name of the +5 pole.
    pub fn positive_pole(self) -> &'static str {
        match self {
            Self::AnalysisOverview => "overview",
            Self::IndividualCollective => "collective",
            Self::EmpathyResponsibility => "responsibility",
            Self::CooperationIndependence => "independence",
            Self::StabilityTransformation => "transformation",
            Self::DivergenceConvergence => "convergence",
        }
    }

    /// One-line description of both poles, used in oracle prompts.
    pub fn scale_hint(self) -> &'static str {
        match self {
            Self::AnalysisOverview => {
                "-5 = dive into details, decompose, micro view; +5 = see the whole, recognise patterns, macro view"
            }
            Self::IndividualCollective => {
                "-5 = personal claim, subjective; +5 = universal perspective, objective, general"
            }
            Self::EmpathyResponsibility => {
                "-5 = stay with feelings, care first; +5 = realistic judgement, say what is right even when hard"
            }
            Self::CooperationIndependence => {
                "-5 = adapt to the other person, seek harmony; +5 = push one's own view, hold ground"
            }
            Self::StabilityTransformation => {
                "-5 = keep things consistent, maintain; +5 = dig to the essence, change at the root"
            }
            Self::DivergenceConvergence => {
                "-5 = lay out options and perspectives; +5 = lead to one conclusion, decide"
            }
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        let normalized = key.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Self::ALL.into_iter().find(|axis| axis.key() == normalized)
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Six bounded coordinates, one per [`Axis`].
///
/// Every constructor clamps into `[AXIS_MIN, AXIS_MAX]`; nothing is ever
/// dropped.  Serialises as a map keyed by [`Axis::key`], and deserialising a
/// map that lacks any of the six keys fails.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, f32>", into = "BTreeMap<String, f32>")]
pub struct AxisVector {
    values: [f32; 6],
}

impl AxisVector {
    /// All axes at zero.  Also the coordinates stored for unscored records.
    pub const NEUTRAL: AxisVector = AxisVector { values: [0.0; 6] };

    pub fn new(values: [f32; 6]) -> Self {
        Self {
            values: values.map(clamp_axis),
        }
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (Axis, f32)>) -> Self {
        let mut vector = Self::NEUTRAL;
        for (axis, value) in pairs {
            vector.set(axis, value);
        }
        vector
    }

    pub fn get(&self, axis: Axis) -> f32 {
        self.values[axis.index()]
    }

    pub fn set(&mut self, axis: Axis, value: f32) {
        self.values[axis.index()] = clamp_axis(value);
    }

    pub fn values(&self) -> [f32; 6] {
        self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (Axis, f32)> + '_ {
        Axis::ALL.into_iter().map(|axis| (axis, self.get(axis)))
    }

    /// Component-wise sum, clamped.
    pub fn offset_by(&self, bias: &AxisVector) -> AxisVector {
        let mut out = *self;
        for axis in Axis::ALL {
            out.set(axis, self.get(axis) + bias.get(axis));
        }
        out
    }

    pub fn is_neutral(&self) -> bool {
        self.values.iter().all(|v| *v == 0.0)
    }

    /// Compact `key:+1.0` rendering used in prompts and log lines.
    pub fn compact(&self) -> String {
        self.iter()
            .map(|(axis, value)| format!("{}:{value:+.1}", axis.key()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Render a persona block describing which pole each axis leans toward.
    pub fn describe(&self) -> String {
        let mut lines = vec!["## Response persona".to_string()];
        for (axis, value) in self.iter() {
            let direction = if value < -2.0 {
                format!("strongly {}", axis.negative_pole())
            } else if value <= -0.05 {
                format!("slightly {}", axis.negative_pole())
            } else if value < 0.05 {
                "balanced".to_string()
            } else if value <= 2.0 {
                format!("slightly {}", axis.positive_pole())
            } else {
                format!("strongly {}", axis.positive_pole())
            };
            lines.push(format!("- {}: {direction} ({value:+.1})", axis.label()));
        }
        lines.join("\n")
    }
}

fn clamp_axis(value: f32) -> f32 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(AXIS_MIN, AXIS_MAX)
}

impl From<AxisVector> for BTreeMap<String, f32> {
    fn from(vector: AxisVector) -> Self {
        vector
            .iter()
            .map(|(axis, value)| (axis.key().to_string(), value))
            .collect()
    }
}

impl TryFrom<BTreeMap<String, f32>> for AxisVector {
    type Error = String;

    fn try_from(map: BTreeMap<String, f32>) -> Result<Self, Self::Error> {
        let mut vector = AxisVector::NEUTRAL;
        for axis in Axis::ALL {
            let value = map
                .get(axis.key())
                .ok_or_else(|| format!("missing axis `{}`", axis.key()))?;
            vector.set(axis, *value);
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_clamps_out_of_range_values() {
        let v = AxisVector::new([9.0, -12.0, 4.5, -5.0, 5.0, f32::INFINITY]);
        assert_eq!(v.values(), [5.0, -5.0, 4.5, -5.0, 5.0, 5.0]);
    }

    #[test]
    fn nan_becomes_zero_instead_of_vanishing() {
        let v = AxisVector::new([f32::NAN, 1.0, 1.0, 1.0, 1.0, 1.0]);
        assert_eq!(v.get(Axis::AnalysisOverview), 0.0);
        assert_eq!(v.iter().count(), 6);
    }

    #[test]
    fn offset_by_clamps_the_sum() {
        let raw = AxisVector::from_pairs([(Axis::EmpathyResponsibility, 4.0)]);
        let bias = AxisVector::from_pairs([
            (Axis::EmpathyResponsibility, 2.0),
            (Axis::DivergenceConvergence, -1.5),
        ]);
        let out = raw.offset_by(&bias);
        assert_eq!(out.get(Axis::EmpathyResponsibility), 5.0);
        assert_eq!(out.get(Axis::DivergenceConvergence), -1.5);
        assert_eq!(out.get(Axis::AnalysisOverview), 0.0);
    }

    #[test]
    fn from_key_accepts_common_spellings() {
        assert_eq!(Axis::from_key("analysis_overview"), Some(Axis::AnalysisOverview));
        assert_eq!(Axis::from_key("Empathy-Responsibility"), Some(Axis::EmpathyResponsibility));
        assert_eq!(Axis::from_key("divergence convergence"), Some(Axis::DivergenceConvergence));
        assert_eq!(Axis::from_key("courage"), None);
    }

    #[test]
    fn serializes_as_keyed_map_and_back() {
        let v = AxisVector::from_pairs([(Axis::StabilityTransformation, 3.0)]);
        let json = serde_json::to_value(v).unwrap();
        assert_eq!(json["stability_transformation"], 3.0);
        assert_eq!(json.as_object().unwrap().len(), 6);
        let back: AxisVector = serde_json::from_value(json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn deserialize_rejects_missing_axis() {
        let json = serde_json::json!({ "analysis_overview": 1.0 });
        assert!(serde_json::from_value::<AxisVector>(json).is_err());
    }

    #[test]
    fn deserialize_clamps_stored_values() {
        let mut map = serde_json::Map::new();
        for axis in Axis::ALL {
            map.insert(axis.key().to_string(), serde_json::json!(7.5));
        }
        let v: AxisVector = serde_json::from_value(serde_json::Value::Object(map)).unwrap();
        assert!(v.values().iter().all(|x| *x == 5.0));
    }

    #[test]
    fn describe_uses_pole_names_and_strength() {
        let v = AxisVector::from_pairs([
            (Axis::AnalysisOverview, -3.0),
            (Axis::EmpathyResponsibility, 1.0),
            (Axis::DivergenceConvergence, 4.0),
        ]);
        let text = v.describe();
        assert!(text.contains("Analysis-Overview: strongly analysis (-3.0)"));
        assert!(text.contains("Empathy-Responsibility: slightly responsibility (+1.0)"));
        assert!(text.contains("Divergence-Convergence: strongly convergence (+4.0)"));
        assert!(text.contains("Stability-Transformation: balanced (+0.0)"));
    }
}
