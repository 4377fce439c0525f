//! Entity resolution of connection references to detected components.
//!
//! Two annotation sources name and box the same physical component
//! differently. Each [`ConnectionRef`] is matched against the image's
//! detected components and rewritten to the winner's canonical key and
//! display name, or dropped.
//!
//! ## Algorithm Overview
//!
//! For every candidate with a non-degenerate box:
//!
//! ```text
//! score = iou_weight * IoU(target.box, candidate.box)
//!       + name_weight * similarity(lower(target.name), lower(candidate.name))
//! ```
//!
//! The highest score wins (first candidate on ties) and is accepted only if
//! it is strictly greater than `min_score`. Geometry carries the higher weight
//! because detector boxes recur across sources while free-text names drift.
//!
//! ## Thresholds
//!
//! - **IoU weight**: 0.7
//! - **Name weight**: 0.3
//! - **Acceptance**: score > 0.1

#![allow(clippy::cast_precision_loss)]

use serde::{Deserialize, Serialize};
use similar::TextDiff;
use tracing::{debug, warn};

use crate::geometry::{canonicalize, parse_box, BoundingBox};
use crate::models::{ComponentDescription, Connections, ConnectionRef, Direction, ImageRecord};

/// Default weight of geometric overlap.
pub const DEFAULT_IOU_WEIGHT: f64 = 0.7;
/// Default weight of name similarity.
pub const DEFAULT_NAME_WEIGHT: f64 = 0.3;
/// Scores at or below this are never accepted.
pub const DEFAULT_MIN_SCORE: f64 = 0.1;

/// Resolver tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub iou_weight: f64,
    pub name_weight: f64,
    pub min_score: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            iou_weight: DEFAULT_IOU_WEIGHT,
            name_weight: DEFAULT_NAME_WEIGHT,
            min_score: DEFAULT_MIN_SCORE,
        }
    }
}

impl ResolverConfig {
    /// Strict acceptance test.
    #[inline]
    #[must_use = "returns whether the score is accepted"]
    pub fn accepts(&self, score: f64) -> bool {
        score > self.min_score
    }
}

/// A detected component offered as a resolution target.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub key: String,
    pub bbox: BoundingBox,
    pub name: String,
}

impl Candidate {
    #[must_use]
    pub fn new(bbox: BoundingBox, name: impl Into<String>) -> Self {
        Self {
            key: bbox.key(),
            bbox,
            name: name.into(),
        }
    }
}

/// Outcome of resolving one reference.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub target: ConnectionRef,
    /// Winning component key; `None` when rejected.
    pub resolved_key: Option<String>,
    /// Display name of the winner.
    pub resolved_name: Option<String>,
    /// Best score seen, even when rejected.
    pub score: f64,
}

impl MatchResult {
    fn rejected(target: &ConnectionRef, score: f64) -> Self {
        Self {
            target: target.clone(),
            resolved_key: None,
            resolved_name: None,
            score,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.resolved_key.is_some()
    }
}

/// Counts from resolving a batch of references.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolutionStats {
    pub resolved: usize,
    pub dropped: usize,
}

impl std::ops::AddAssign for ResolutionStats {
    fn add_assign(&mut self, rhs: Self) {
        self.resolved += rhs.resolved;
        self.dropped += rhs.dropped;
    }
}

/// Sequence-match ratio `2 * M / (|a| + |b|)` of two names, where `M` is
/// the number of matching characters. Case-insensitive; empty names have
/// zero similarity to everything.
#[must_use]
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    f64::from(TextDiff::from_chars(a.as_str(), b.as_str()).ratio())
}

/// Matches references to candidates.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntityResolver {
    config: ResolverConfig,
}

impl EntityResolver {
    #[must_use]
    pub const fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Combined score of one target/candidate pair.
    #[must_use]
    pub fn pair_score(&self, target_box: &BoundingBox, target_name: &str, candidate: &Candidate) -> f64 {
        let iou = target_box.iou(&candidate.bbox);
        let name_sim = name_similarity(target_name, &candidate.name);
        self.config.iou_weight * iou + self.config.name_weight * name_sim
    }

    /// Find the best candidate for `target`.
    ///
    /// Never fails: an empty or malformed target box is a rejection.
    #[must_use]
    pub fn resolve(&self, target: &ConnectionRef, candidates: &[Candidate]) -> MatchResult {
        if target.box_text.trim().is_empty() {
            return MatchResult::rejected(target, 0.0);
        }
        let target_box = match parse_box(&target.box_text) {
            Ok(b) => b,
            Err(err) => {
                debug!("unparsable connection box {:?}: {}", target.box_text, err);
                return MatchResult::rejected(target, 0.0);
            }
        };

        let mut best: Option<&Candidate> = None;
        let mut best_score = 0.0;
        for candidate in candidates.iter().filter(|c| !c.bbox.is_degenerate()) {
            let score = self.pair_score(&target_box, &target.name, candidate);
            if best.is_none() || score > best_score {
                best = Some(candidate);
                best_score = score;
            }
        }

        match best {
            Some(winner) if self.config.accepts(best_score) => MatchResult {
                target: target.clone(),
                resolved_key: Some(winner.key.clone()),
                resolved_name: Some(winner.name.clone()),
                score: best_score,
            },
            _ => MatchResult::rejected(target, best_score),
        }
    }

    /// Resolve every reference in place. Accepted references are rewritten to
    /// the winner's key and name; rejected ones are removed from their list.
    pub fn resolve_connections(
        &self,
        connections: &mut Connections,
        candidates: &[Candidate],
    ) -> ResolutionStats {
        let mut stats = ResolutionStats::default();
        for direction in Direction::ALL {
            let list = connections.get_mut(direction);
            let before = list.len();
            list.retain_mut(|conn| {
                let result = self.resolve(conn, candidates);
                match (result.resolved_key, result.resolved_name) {
                    (Some(key), Some(name)) => {
                        conn.box_text = key;
                        conn.name = name;
                        true
                    }
                    _ => {
                        debug!(
                            "dropping {} reference {:?} {:?} (best score {:.3})",
                            direction, conn.name, conn.box_text, result.score
                        );
                        false
                    }
                }
            });
            stats.resolved += list.len();
            stats.dropped += before - list.len();
        }
        stats
    }

    /// Resolve every parsed description in an image record against the
    /// record's detected components.
    pub fn resolve_record(&self, image_id: &str, record: &mut ImageRecord) -> ResolutionStats {
        let candidates = candidates_for(record);
        let mut stats = ResolutionStats::default();
        for (key, entry) in &mut record.component_details {
            for (source, analysis) in &mut entry.sources {
                if let Some(description) = analysis.description.as_mut() {
                    let s = self.resolve_connections(&mut description.connections, &candidates);
                    if s.dropped > 0 {
                        debug!(
                            "{} {} [{}]: {} resolved, {} dropped",
                            image_id, key, source, s.resolved, s.dropped
                        );
                    }
                    stats += s;
                }
            }
        }
        stats
    }
}

/// Resolution candidates from a record's detected components. Keys that do
/// not parse as boxes are skipped.
#[must_use]
pub fn candidates_for(record: &ImageRecord) -> Vec<Candidate> {
    record
        .components
        .keys()
        .filter_map(|key| match parse_box(key) {
            Ok(bbox) => Some(Candidate {
                key: key.clone(),
                bbox,
                name: record.component_name(key).to_string(),
            }),
            Err(err) => {
                warn!("skipping component with invalid key {:?}: {}", key, err);
                None
            }
        })
        .collect()
}

/// Rewrite every parsable box field of a description to canonical form.
/// Unparsable fields are left verbatim.
pub fn canonicalize_description(description: &mut ComponentDescription) {
    if let Some(text) = description.box_text.as_mut() {
        canonicalize_in_place(text);
    }
    for direction in Direction::ALL {
        for conn in description.connections.get_mut(direction) {
            canonicalize_in_place(&mut conn.box_text);
            if let Some(pos) = conn.visual_position.as_mut() {
                canonicalize_in_place(pos);
            }
        }
    }
}

fn canonicalize_in_place(text: &mut String) {
    if let Ok(key) = canonicalize(text) {
        *text = key;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ComponentEntry, DetectedComponent, SourceAnalysis};

    fn bx(x1: u32, y1: u32, x2: u32, y2: u32) -> BoundingBox {
        BoundingBox::new(x1, y1, x2, y2).unwrap()
    }

    fn candidates() -> Vec<Candidate> {
        vec![
            Candidate::new(bx(0, 0, 100, 100), "VCO"),
            Candidate::new(bx(200, 0, 300, 100), "Phase Detector"),
            Candidate::new(bx(400, 0, 500, 100), "Loop Filter"),
        ]
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_name_similarity() {
        assert_eq!(name_similarity("VCO", "vco"), 1.0);
        assert_eq!(name_similarity("", "vco"), 0.0);
        assert_eq!(name_similarity("vco", ""), 0.0);
        assert_eq!(
            name_similarity("loop filter", "loop filtr"),
            name_similarity("loop filtr", "loop filter")
        );
        assert!(name_similarity("Loop Filter", "loop filtr") > 0.8);
    }

    #[test]
    fn test_name_similarity_is_sequence_ratio() {
        let close = |a: &str, b: &str, expected: f64| {
            let got = name_similarity(a, b);
            assert!((got - expected).abs() < 1e-6, "{a:?} vs {b:?}: {got}");
        };
        close("VCO", "VCO block", 0.5);
        close("abcd", "bcde", 0.75);
        close("loop filter", "loop filtr", 20.0 / 21.0);
        close("pfd", "vco", 0.0);
    }

    #[test]
    fn test_name_only_match_above_threshold() {
        let resolver = EntityResolver::default();
        // Disjoint box: the score is 0.3 * 0.5 from the name alone.
        let target = ConnectionRef::new("VCO", "[900, 900, 950, 950]");
        let candidates = vec![Candidate::new(bx(0, 0, 100, 100), "VCO block")];
        let result = resolver.resolve(&target, &candidates);
        assert!((result.score - 0.15).abs() < 1e-6);
        assert_eq!(result.resolved_key.as_deref(), Some("(0, 0, 100, 100)"));
    }

    #[test]
    fn test_exact_box_always_selected() {
        let resolver = EntityResolver::default();
        // Name points at a different component; geometry still wins.
        let target = ConnectionRef::new("Loop Filter", "[200, 0, 300, 100]");
        let result = resolver.resolve(&target, &candidates());
        assert_eq!(result.resolved_key.as_deref(), Some("(200, 0, 300, 100)"));
        assert!(result.score >= 0.7);
    }

    #[test]
    fn test_name_breaks_geometric_tie() {
        let resolver = EntityResolver::default();
        let cands = vec![
            Candidate::new(bx(0, 0, 100, 100), "Mixer"),
            Candidate::new(bx(0, 0, 100, 100), "Amplifier"),
        ];
        let target = ConnectionRef::new("amplifier", "(0, 0, 100, 100)");
        let result = resolver.resolve(&target, &cands);
        assert_eq!(result.resolved_name.as_deref(), Some("Amplifier"));
    }

    #[test]
    fn test_score_equal_to_threshold_is_rejected() {
        let cands = candidates();
        let target = ConnectionRef::new("", "(50, 0, 150, 100)");
        let exact = EntityResolver::default().pair_score(&bx(50, 0, 150, 100), "", &cands[0]);
        assert!(exact > 0.0);

        let at_boundary = EntityResolver::new(ResolverConfig {
            min_score: exact,
            ..ResolverConfig::default()
        });
        assert!(!at_boundary.resolve(&target, &cands).is_resolved());

        let below_boundary = EntityResolver::new(ResolverConfig {
            min_score: exact - 1e-9,
            ..ResolverConfig::default()
        });
        assert!(below_boundary.resolve(&target, &cands).is_resolved());
    }

    #[test]
    fn test_default_threshold_is_strict() {
        let config = ResolverConfig::default();
        assert!(!config.accepts(0.1));
        assert!(config.accepts(0.100_001));
    }

    #[test]
    fn test_rejections() {
        let resolver = EntityResolver::default();
        let cands = candidates();
        assert!(!resolver
            .resolve(&ConnectionRef::new("VCO", ""), &cands)
            .is_resolved());
        assert!(!resolver
            .resolve(&ConnectionRef::new("VCO", "somewhere left"), &cands)
            .is_resolved());
        // Far away and unrelated name.
        assert!(!resolver
            .resolve(&ConnectionRef::new("Battery", "(900, 900, 950, 950)"), &cands)
            .is_resolved());
        assert!(!resolver
            .resolve(&ConnectionRef::new("VCO", "(0, 0, 100, 100)"), &[])
            .is_resolved());
    }

    #[test]
    fn test_degenerate_candidates_skipped() {
        let resolver = EntityResolver::default();
        let cands = vec![Candidate::new(bx(0, 0, 0, 100), "VCO")];
        let result = resolver.resolve(&ConnectionRef::new("VCO", "(0, 0, 100, 100)"), &cands);
        assert!(!result.is_resolved());
    }

    #[test]
    fn test_resolve_connections_rewrites_and_drops() {
        let resolver = EntityResolver::default();
        let mut connections = Connections {
            input: vec![
                ConnectionRef::new("vco block", "<|box_start|>(2,1),(98,99)<|box_end|>"),
                ConnectionRef::new("ghost", "(900, 900, 950, 950)"),
            ],
            output: vec![ConnectionRef::new("PD", "not a box")],
            bidirectional: vec![ConnectionRef::new("loop filter", "[400, 0, 500, 100]")],
        };
        let stats = resolver.resolve_connections(&mut connections, &candidates());

        assert_eq!(stats, ResolutionStats { resolved: 2, dropped: 2 });
        assert_eq!(connections.input.len(), 1);
        assert_eq!(connections.input[0].box_text, "(0, 0, 100, 100)");
        assert_eq!(connections.input[0].name, "VCO");
        assert!(connections.output.is_empty());
        assert_eq!(connections.bidirectional[0].name, "Loop Filter");
    }

    #[test]
    fn test_resolve_record_uses_component_names() {
        let mut record = ImageRecord::default();
        record
            .components
            .insert("(0, 0, 100, 100)".into(), DetectedComponent::default());
        record
            .component_names
            .insert("(0, 0, 100, 100)".into(), "ADC".into());

        let mut description = ComponentDescription::default();
        description
            .connections
            .output
            .push(ConnectionRef::new("adc", "(0, 0, 100, 100)"));
        let mut entry = ComponentEntry::default();
        entry.sources.insert(
            "primary".into(),
            SourceAnalysis {
                description: Some(description),
                ..SourceAnalysis::default()
            },
        );
        record
            .component_details
            .insert("(200, 0, 300, 100)".into(), entry);

        let stats = EntityResolver::default().resolve_record("img.png", &mut record);
        assert_eq!(stats.resolved, 1);
        let conn = &record.component_details["(200, 0, 300, 100)"].sources["primary"]
            .description
            .as_ref()
            .unwrap()
            .connections
            .output[0];
        assert_eq!(conn.name, "ADC");
    }

    #[test]
    fn test_canonicalize_description() {
        let mut description = ComponentDescription {
            box_text: Some("[1, 2, 3, 4]".into()),
            ..ComponentDescription::default()
        };
        let mut conn = ConnectionRef::new("x", "(5,6,7,8)");
        conn.visual_position = Some("<|box_start|>(1,1),(2,2)<|box_end|>".into());
        description.connections.input.push(conn);
        description
            .connections
            .output
            .push(ConnectionRef::new("y", "left side"));

        canonicalize_description(&mut description);
        assert_eq!(description.box_text.as_deref(), Some("(1, 2, 3, 4)"));
        assert_eq!(description.connections.input[0].box_text, "(5, 6, 7, 8)");
        assert_eq!(
            description.connections.input[0].visual_position.as_deref(),
            Some("(1, 1, 2, 2)")
        );
        assert_eq!(description.connections.output[0].box_text, "left side");
    }
}
