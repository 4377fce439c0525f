//! Data model for per-image analysis records.
//!
//! ## Key Types
//!
//! - [`ConnectionRef`] - one pin reference produced by an annotation source
//! - [`ComponentDescription`] - a source's description of one component
//! - [`SourceAnalysis`] - one source's outcome for one component
//! - [`ComponentEntry`] - both sources plus the component verdict
//! - [`ImageRecord`] - everything persisted for one image
//! - [`ComponentVerdict`] / [`ImageVerdict`] - scoring results
//!
//! Box fields inside descriptions stay as text: model output may carry boxes
//! that do not parse, and those must survive until entity resolution drops
//! them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::geometry::BoundingBox;

/// Name recorded for components whose naming request failed.
pub const UNKNOWN_COMPONENT_NAME: &str = "unknown component";

/// Pin direction as reported by an annotation source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
    Bidirectional,
}

/// Direction-equivalence class used for counting.
///
/// Bidirectional pins count on the output side, the same convention the
/// detector agreement check uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Side {
    In,
    Out,
}

impl Direction {
    pub const ALL: [Self; 3] = [Self::Input, Self::Output, Self::Bidirectional];

    #[inline]
    #[must_use = "returns the equivalence class"]
    pub const fn side(self) -> Side {
        match self {
            Self::Input => Side::In,
            Self::Output | Self::Bidirectional => Side::Out,
        }
    }

    #[must_use = "returns the direction name"]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Bidirectional => "bidirectional",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reference from one component's pin to another component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRef {
    /// Name of the referenced component, as the source wrote it.
    #[serde(default)]
    pub name: String,
    /// Box of the referenced component; rewritten to the canonical key on
    /// successful resolution.
    #[serde(rename = "box", default)]
    pub box_text: String,
    /// Location of the pin itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visual_position: Option<String>,
    /// Anything else the source said about this pin (function, signal name).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ConnectionRef {
    #[must_use]
    pub fn new(name: impl Into<String>, box_text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            box_text: box_text.into(),
            ..Self::default()
        }
    }
}

/// Connections of one component, split by direction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Connections {
    #[serde(default)]
    pub input: Vec<ConnectionRef>,
    #[serde(default)]
    pub output: Vec<ConnectionRef>,
    #[serde(default)]
    pub bidirectional: Vec<ConnectionRef>,
}

impl Connections {
    #[must_use]
    pub fn get(&self, direction: Direction) -> &[ConnectionRef] {
        match direction {
            Direction::Input => &self.input,
            Direction::Output => &self.output,
            Direction::Bidirectional => &self.bidirectional,
        }
    }

    pub fn get_mut(&mut self, direction: Direction) -> &mut Vec<ConnectionRef> {
        match direction {
            Direction::Input => &mut self.input,
            Direction::Output => &mut self.output,
            Direction::Bidirectional => &mut self.bidirectional,
        }
    }

    /// All references with their direction.
    pub fn iter(&self) -> impl Iterator<Item = (Direction, &ConnectionRef)> {
        Direction::ALL
            .into_iter()
            .flat_map(move |d| self.get(d).iter().map(move |c| (d, c)))
    }

    /// Total pin count over all three directions.
    #[inline]
    #[must_use]
    pub fn total(&self) -> usize {
        self.input.len() + self.output.len() + self.bidirectional.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// One source's structured description of a component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentDescription {
    #[serde(default)]
    pub component_name: String,
    #[serde(rename = "box", default, skip_serializing_if = "Option::is_none")]
    pub box_text: Option<String>,
    #[serde(default)]
    pub connections: Connections,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ComponentDescription {
    /// Move top-level `input`/`output`/`bidirectional` lists under
    /// `connections`. Only applies when `connections` is empty; lists that
    /// are not arrays of references stay in `extra`.
    pub fn lift_flat_connections(&mut self) {
        if !self.connections.is_empty() {
            return;
        }
        for direction in Direction::ALL {
            let Some(value) = self.extra.remove(direction.as_str()) else {
                continue;
            };
            match serde_json::from_value::<Vec<ConnectionRef>>(value.clone()) {
                Ok(list) => *self.connections.get_mut(direction) = list,
                Err(_) => {
                    self.extra.insert(direction.as_str().to_string(), value);
                }
            }
        }
    }
}

/// Detector output for one component: its port boxes by direction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedComponent {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub input: Vec<BoundingBox>,
    #[serde(default)]
    pub output: Vec<BoundingBox>,
}

/// Outcome of asking one annotation source about one component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceAnalysis {
    /// Parsed description, when the output was usable JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<ComponentDescription>,
    /// Raw output kept when it could not be parsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    /// Call failure, after retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether pin counts agree with the detector's port counts.
    #[serde(default)]
    pub io_num_match: bool,
}

impl SourceAnalysis {
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// The description, if it has at least one connection.
    #[must_use]
    pub fn usable_description(&self) -> Option<&ComponentDescription> {
        self.description
            .as_ref()
            .filter(|d| !d.connections.is_empty())
    }
}

/// Structural score components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub n_consistent: usize,
    pub n_total1: usize,
    pub n_total2: usize,
    pub base_score: f64,
    pub final_score: u8,
}

/// Agreement between the two sources on the functional side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinAgreement {
    /// Pin descriptions agree.
    #[default]
    Aligned,
    /// Wording-level differences only.
    MinorMismatch,
    /// A critical pin's function contradicts between the sources.
    Contradiction,
}

impl fmt::Display for PinAgreement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aligned => write!(f, "aligned"),
            Self::MinorMismatch => write!(f, "minor_mismatch"),
            Self::Contradiction => write!(f, "contradiction"),
        }
    }
}

/// Qualitative review of two descriptions of the same component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitativeAssessment {
    #[serde(default)]
    pub pin_agreement: PinAgreement,
    #[serde(default = "default_true")]
    pub role_consistent: bool,
    #[serde(default)]
    pub critical_pins: Vec<String>,
    #[serde(default)]
    pub inconsistencies: Vec<String>,
    /// Label of the source whose description matched the diagram better.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub better_source: Option<String>,
    #[serde(default)]
    pub reasoning: String,
}

const fn default_true() -> bool {
    true
}

/// Verdict for one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentVerdict {
    pub component_key: String,
    pub consistency_score: u8,
    pub is_consistent: bool,
    pub score_breakdown: ScoreBreakdown,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assessment: Option<QualitativeAssessment>,
}

/// Verdict for one image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageVerdict {
    pub overall_score: f64,
    pub overall_consistent: bool,
    pub component_count: usize,
    pub consistent_count: usize,
}

/// Both sources' analyses of one component plus its verdict.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentEntry {
    /// Keyed by source label.
    #[serde(default)]
    pub sources: BTreeMap<String, SourceAnalysis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_result: Option<ComponentVerdict>,
}

/// Everything persisted for one image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Every detected component, keyed by canonical box string.
    #[serde(default)]
    pub components: BTreeMap<String, DetectedComponent>,
    /// Display names from the naming pass, for sampled components.
    #[serde(default)]
    pub component_names: BTreeMap<String, String>,
    /// Analyses for sampled components.
    #[serde(default)]
    pub component_details: BTreeMap<String, ComponentEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_eval_result: Option<ImageVerdict>,
}

impl ImageRecord {
    /// A record counts as done when it carries any content.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
            && self.component_details.is_empty()
            && self.total_eval_result.is_none()
    }

    /// Display name for a component key, falling back to the detector's.
    #[must_use]
    pub fn component_name(&self, key: &str) -> &str {
        self.component_names
            .get(key)
            .map(String::as_str)
            .or_else(|| self.components.get(key).map(|c| c.name.as_str()))
            .unwrap_or("")
    }
}
