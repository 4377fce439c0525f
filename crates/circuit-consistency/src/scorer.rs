//! Consistency scoring of two resolved descriptions of one component.
//!
//! ## Algorithm Overview
//!
//! 1. **Degenerate input**: a missing or connection-less description on
//!    either side scores 0 and is inconsistent.
//! 2. **Structural overlap**: pins are compared by resolved component key
//!    within their direction class (input vs. output + bidirectional). The
//!    Dice coefficient `100 * 2 * N_consistent / (N_total1 + N_total2)` is
//!    the base score.
//! 3. **Qualitative adjustment**: a [`ConsistencyJudge`] reviews the pin
//!    functions and component role against the diagram; its verdict moves the
//!    base score into one of three bands.
//! 4. **Aggregation**: an image is consistent when at least 75% of its
//!    components are.
//!
//! ## Bands
//!
//! | Judge verdict | Final score |
//! |---------------|-------------|
//! | aligned, same role | `round(base)` |
//! | minor mismatch, or role differs | `min(base - 10, 89)` |
//! | critical pin contradiction | `min(base * 0.5, 69)` |

#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::annotation::{AnnotationRequest, AnnotationService};
use crate::error::AnnotationError;
use crate::geometry::parse_box;
use crate::json_extract::extract_as;
use crate::models::{
    ComponentDescription, ComponentVerdict, Connections, ImageVerdict, PinAgreement,
    QualitativeAssessment, ScoreBreakdown, Side,
};
use crate::prompts::render;

/// Reasoning recorded when a source produced no description.
pub const EMPTY_INPUT_REASON: &str = "empty input";
/// Reasoning recorded when a description lists no connections.
pub const NO_CONNECTIONS_REASON: &str = "empty input: no connections described";

/// Thresholds and band constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    /// A component is consistent at or above this final score.
    pub component_threshold: u8,
    /// An image is consistent when at least this share of components is.
    pub image_ratio_threshold: f64,
    pub minor_penalty: f64,
    pub minor_ceiling: f64,
    pub major_factor: f64,
    pub major_ceiling: f64,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            component_threshold: 85,
            image_ratio_threshold: 0.75,
            minor_penalty: 10.0,
            minor_ceiling: 89.0,
            major_factor: 0.5,
            major_ceiling: 69.0,
        }
    }
}

impl ScoringPolicy {
    /// Move a base score into its band.
    #[must_use]
    pub fn final_score(&self, base_score: f64, assessment: Option<&QualitativeAssessment>) -> u8 {
        let adjusted = match assessment {
            None => base_score,
            Some(a) => match a.pin_agreement {
                PinAgreement::Contradiction => {
                    (base_score * self.major_factor).min(self.major_ceiling)
                }
                PinAgreement::MinorMismatch => {
                    (base_score - self.minor_penalty).min(self.minor_ceiling)
                }
                PinAgreement::Aligned if !a.role_consistent => {
                    (base_score - self.minor_penalty).min(self.minor_ceiling)
                }
                PinAgreement::Aligned => base_score,
            },
        };
        adjusted.round().clamp(0.0, 100.0) as u8
    }

    #[inline]
    #[must_use]
    pub const fn is_consistent(&self, final_score: u8) -> bool {
        final_score >= self.component_threshold
    }
}

/// Identity of a pin for matching: direction class plus resolved key.
fn pin_keys(connections: &Connections) -> HashMap<(Side, String), usize> {
    let mut keys = HashMap::new();
    for (direction, conn) in connections.iter() {
        let key = match parse_box(&conn.box_text) {
            Ok(bbox) => bbox.key(),
            Err(_) if !conn.name.trim().is_empty() => conn.name.trim().to_lowercase(),
            Err(_) => continue,
        };
        *keys.entry((direction.side(), key)).or_insert(0) += 1;
    }
    keys
}

/// Number of pins both sides describe: multiset intersection of
/// `(direction class, component key)` pairs.
#[must_use]
pub fn count_consistent(a: &Connections, b: &Connections) -> usize {
    let keys_b = pin_keys(b);
    pin_keys(a)
        .into_iter()
        .map(|(key, count_a)| count_a.min(keys_b.get(&key).copied().unwrap_or(0)))
        .sum()
}

/// Dice-style overlap in [0, 100]. Zero when both totals are zero.
#[must_use]
pub fn base_score(n_consistent: usize, n_total1: usize, n_total2: usize) -> f64 {
    let total = n_total1 + n_total2;
    if total == 0 {
        return 0.0;
    }
    100.0 * 2.0 * n_consistent as f64 / total as f64
}

/// Structural breakdown of two descriptions. `final_score` is set to the
/// rounded base score.
#[must_use]
pub fn structural_breakdown(a: &Connections, b: &Connections) -> ScoreBreakdown {
    let n_consistent = count_consistent(a, b);
    let n_total1 = a.total();
    let n_total2 = b.total();
    let base = base_score(n_consistent, n_total1, n_total2);
    ScoreBreakdown {
        n_consistent,
        n_total1,
        n_total2,
        base_score: base,
        final_score: base.round().clamp(0.0, 100.0) as u8,
    }
}

/// Everything a judge sees about one component.
#[derive(Debug, Clone, Copy)]
pub struct JudgeRequest<'a> {
    pub image_path: &'a Path,
    pub component_key: &'a str,
    pub component_name: &'a str,
    pub detail_a: &'a ComponentDescription,
    pub detail_b: &'a ComponentDescription,
    pub breakdown: &'a ScoreBreakdown,
}

/// Qualitative reviewer of two descriptions.
#[async_trait]
pub trait ConsistencyJudge: Send + Sync {
    /// # Errors
    ///
    /// Returns an [`AnnotationError`] when no assessment could be obtained.
    async fn assess(&self, request: &JudgeRequest<'_>) -> Result<QualitativeAssessment, AnnotationError>;
}

/// Judge that asks an annotation service.
#[derive(Debug, Clone)]
pub struct AnnotationJudge<S> {
    service: S,
    template: String,
}

impl<S> AnnotationJudge<S> {
    #[must_use]
    pub fn new(service: S, template: impl Into<String>) -> Self {
        Self {
            service,
            template: template.into(),
        }
    }
}

#[async_trait]
impl<S: AnnotationService> ConsistencyJudge for AnnotationJudge<S> {
    async fn assess(&self, request: &JudgeRequest<'_>) -> Result<QualitativeAssessment, AnnotationError> {
        let detail_a = serde_json::to_string_pretty(request.detail_a)
            .map_err(|e| AnnotationError::Content(e.to_string()))?;
        let detail_b = serde_json::to_string_pretty(request.detail_b)
            .map_err(|e| AnnotationError::Content(e.to_string()))?;
        let b = request.breakdown;
        let n_consistent = b.n_consistent.to_string();
        let n_total1 = b.n_total1.to_string();
        let n_total2 = b.n_total2.to_string();
        let base = format!("{:.1}", b.base_score);
        let prompt = render(
            &self.template,
            &[
                ("component_box", request.component_key),
                ("component_name", request.component_name),
                ("detail_a", detail_a.as_str()),
                ("detail_b", detail_b.as_str()),
                ("n_consistent", n_consistent.as_str()),
                ("n_total1", n_total1.as_str()),
                ("n_total2", n_total2.as_str()),
                ("base_score", base.as_str()),
            ],
        );
        let answer = self
            .service
            .generate(&AnnotationRequest::new(request.image_path, prompt).expecting_json())
            .await?;
        Ok(extract_as::<QualitativeAssessment>(&answer)?)
    }
}

/// Scores components and aggregates images.
#[derive(Clone, Default)]
pub struct ConsistencyScorer {
    policy: ScoringPolicy,
    judge: Option<Arc<dyn ConsistencyJudge>>,
}

impl std::fmt::Debug for ConsistencyScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistencyScorer")
            .field("policy", &self.policy)
            .field("judge", &self.judge.is_some())
            .finish()
    }
}

impl ConsistencyScorer {
    #[must_use]
    pub fn new(policy: ScoringPolicy, judge: Option<Arc<dyn ConsistencyJudge>>) -> Self {
        Self { policy, judge }
    }

    #[must_use]
    pub const fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    /// Score one component from both sources' resolved descriptions.
    ///
    /// Never fails: a judge failure leaves the base score unadjusted.
    pub async fn score(
        &self,
        component_key: &str,
        component_name: &str,
        detail_a: Option<&ComponentDescription>,
        detail_b: Option<&ComponentDescription>,
        image_path: &Path,
    ) -> ComponentVerdict {
        let (Some(a), Some(b)) = (detail_a, detail_b) else {
            return degenerate_verdict(component_key, EMPTY_INPUT_REASON);
        };
        if a.connections.is_empty() || b.connections.is_empty() {
            return degenerate_verdict(component_key, NO_CONNECTIONS_REASON);
        }

        let mut breakdown = structural_breakdown(&a.connections, &b.connections);

        let assessment = match &self.judge {
            Some(judge) => {
                let request = JudgeRequest {
                    image_path,
                    component_key,
                    component_name,
                    detail_a: a,
                    detail_b: b,
                    breakdown: &breakdown,
                };
                match judge.assess(&request).await {
                    Ok(assessment) => Some(assessment),
                    Err(err) => {
                        warn!("  judge failed for {}: {}", component_key, err);
                        None
                    }
                }
            }
            None => None,
        };

        let final_score = self.policy.final_score(breakdown.base_score, assessment.as_ref());
        breakdown.final_score = final_score;

        let reasoning = match &assessment {
            Some(a) => format!(
                "{} matched of {}/{} (base {:.1}); pins {}, role {}: {}",
                breakdown.n_consistent,
                breakdown.n_total1,
                breakdown.n_total2,
                breakdown.base_score,
                a.pin_agreement,
                if a.role_consistent { "consistent" } else { "differs" },
                a.reasoning
            ),
            None => format!(
                "{} matched of {}/{} (base {:.1}); qualitative review unavailable",
                breakdown.n_consistent, breakdown.n_total1, breakdown.n_total2, breakdown.base_score
            ),
        };
        debug!("{} -> {} ({})", component_key, final_score, reasoning);

        ComponentVerdict {
            component_key: component_key.to_string(),
            consistency_score: final_score,
            is_consistent: self.policy.is_consistent(final_score),
            score_breakdown: breakdown,
            reasoning,
            assessment,
        }
    }

    /// Image verdict from component verdicts.
    #[must_use]
    pub fn aggregate(&self, verdicts: &[ComponentVerdict]) -> ImageVerdict {
        aggregate(verdicts, &self.policy)
    }
}

/// Zero-score verdict for a component with a missing or empty description.
#[must_use]
pub fn degenerate_verdict(component_key: &str, reason: &str) -> ComponentVerdict {
    ComponentVerdict {
        component_key: component_key.to_string(),
        consistency_score: 0,
        is_consistent: false,
        score_breakdown: ScoreBreakdown::default(),
        reasoning: reason.to_string(),
        assessment: None,
    }
}

/// Image verdict: consistent iff `consistent / count >= ratio`; score is the
/// mean component score. No components means not consistent.
#[must_use]
pub fn aggregate(verdicts: &[ComponentVerdict], policy: &ScoringPolicy) -> ImageVerdict {
    let component_count = verdicts.len();
    if component_count == 0 {
        return ImageVerdict::default();
    }
    let consistent_count = verdicts.iter().filter(|v| v.is_consistent).count();
    let total: f64 = verdicts.iter().map(|v| f64::from(v.consistency_score)).sum();
    ImageVerdict {
        overall_score: total / component_count as f64,
        overall_consistent: consistent_count as f64 / component_count as f64
            >= policy.image_ratio_threshold,
        component_count,
        consistent_count,
    }
}
