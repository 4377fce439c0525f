//! Per-image analysis: detection, naming, dual-source detail, resolution and
//! scoring.
//!
//! ## Stages
//!
//! 1. Detect components and group their ports.
//! 2. Sample `max(1, floor(n * rate))` components for analysis. Every
//!    detected component is still persisted and offered to the resolver.
//! 3. Ask the primary source for each sampled component's display name.
//! 4. Ask both sources for each sampled component's connections.
//! 5. Resolve every connection reference against the detected components.
//! 6. Score each component and aggregate the image.
//!
//! Stages 3, 4 and 6 fan out over the sampled components; the fan-out is
//! bounded only by whatever cap the services themselves enforce (see
//! [`crate::annotation::Throttled`]).

#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use rand::{RngCore, SeedableRng};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::annotation::{AnnotationRequest, AnnotationService};
use crate::detector::ComponentDetector;
use crate::error::AnnotationError;
use crate::geometry::{parse_box, BoundingBox};
use crate::json_extract::{extract_as, extract_json};
use crate::models::{
    ComponentDescription, ComponentEntry, DetectedComponent, ImageRecord, SourceAnalysis,
    UNKNOWN_COMPONENT_NAME,
};
use crate::orchestrator::ImageProcessor;
use crate::prompts::{render, PromptSet};
use crate::resolver::{canonicalize_description, EntityResolver, ResolutionStats};
use crate::scorer::ConsistencyScorer;

/// Builds one [`ImageRecord`] per image.
pub struct ImageAnalyzer {
    image_root: PathBuf,
    detector: Arc<dyn ComponentDetector>,
    primary: Arc<dyn AnnotationService>,
    secondary: Arc<dyn AnnotationService>,
    resolver: EntityResolver,
    scorer: ConsistencyScorer,
    prompts: PromptSet,
    sample_rate: f64,
    seed: Option<u64>,
}

impl std::fmt::Debug for ImageAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageAnalyzer")
            .field("image_root", &self.image_root)
            .field("primary", &self.primary.label())
            .field("secondary", &self.secondary.label())
            .field("resolver", &self.resolver)
            .field("scorer", &self.scorer)
            .field("sample_rate", &self.sample_rate)
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}

impl ImageAnalyzer {
    #[must_use]
    pub fn new(
        image_root: impl Into<PathBuf>,
        detector: Arc<dyn ComponentDetector>,
        primary: Arc<dyn AnnotationService>,
        secondary: Arc<dyn AnnotationService>,
    ) -> Self {
        Self {
            image_root: image_root.into(),
            detector,
            primary,
            secondary,
            resolver: EntityResolver::default(),
            scorer: ConsistencyScorer::default(),
            prompts: PromptSet::default(),
            sample_rate: 1.0,
            seed: None,
        }
    }

    #[must_use]
    pub const fn with_resolver(mut self, resolver: EntityResolver) -> Self {
        self.resolver = resolver;
        self
    }

    #[must_use]
    pub fn with_scorer(mut self, scorer: ConsistencyScorer) -> Self {
        self.scorer = scorer;
        self
    }

    #[must_use]
    pub fn with_prompts(mut self, prompts: PromptSet) -> Self {
        self.prompts = prompts;
        self
    }

    /// Analyse `rate` of each image's components. A seed makes the choice
    /// reproducible per image.
    #[must_use]
    pub fn with_sampling(mut self, rate: f64, seed: Option<u64>) -> Self {
        self.sample_rate = rate.clamp(0.0, 1.0);
        self.seed = seed;
        self
    }

    async fn name_component(&self, image_path: &Path, key: &str, bbox: BoundingBox) -> String {
        let prompt = render(&self.prompts.naming, &[("component_box", key)]);
        let request = AnnotationRequest::new(image_path, prompt).with_region(bbox);
        match self.primary.generate(&request).await {
            Ok(answer) => clean_name(&answer).unwrap_or_else(|| {
                debug!("  empty name for {}", key);
                UNKNOWN_COMPONENT_NAME.to_string()
            }),
            Err(err) => {
                warn!("  naming failed for {}: {}", key, err);
                UNKNOWN_COMPONENT_NAME.to_string()
            }
        }
    }

    async fn analyze_component(
        &self,
        image_path: &Path,
        key: &str,
        bbox: BoundingBox,
        name: &str,
        all_components: &str,
        detected: Option<&DetectedComponent>,
    ) -> ComponentEntry {
        let prompt = render(
            &self.prompts.detail,
            &[
                ("component_box", key),
                ("component_name", name),
                ("all_components", all_components),
            ],
        );
        let request = AnnotationRequest::new(image_path, prompt)
            .with_region(bbox)
            .expecting_json();

        let (answer_a, answer_b) = tokio::join!(
            self.primary.generate(&request),
            self.secondary.generate(&request)
        );

        let mut entry = ComponentEntry::default();
        for (service, answer) in [(&self.primary, answer_a), (&self.secondary, answer_b)] {
            let analysis = source_analysis(answer, detected);
            if let Some(err) = &analysis.error {
                warn!("  {} detail failed for {}: {}", service.label(), key, err);
            }
            entry.sources.insert(service.label().to_string(), analysis);
        }
        entry
    }
}

#[async_trait]
impl ImageProcessor for ImageAnalyzer {
    async fn process(&self, image_id: &str) -> Result<ImageRecord> {
        let image_path = self.image_root.join(image_id);
        let mut components = self
            .detector
            .detect(image_id, &image_path)
            .await
            .with_context(|| format!("detection failed for {image_id}"))?;

        let keys: Vec<String> = components.keys().cloned().collect();
        let targets: Vec<(String, BoundingBox)> =
            sample_keys(&keys, self.sample_rate, self.seed, image_id)
                .into_iter()
                .filter_map(|key| match parse_box(&key) {
                    Ok(bbox) => Some((key, bbox)),
                    Err(err) => {
                        warn!("{}: skipping component {:?}: {}", image_id, key, err);
                        None
                    }
                })
                .collect();
        info!(
            "{}: {} components, analysing {}",
            image_id,
            keys.len(),
            targets.len()
        );

        let names = join_all(
            targets
                .iter()
                .map(|(key, bbox)| self.name_component(&image_path, key, *bbox)),
        )
        .await;

        let mut record = ImageRecord::default();
        for ((key, _), name) in targets.iter().zip(names) {
            if let Some(component) = components.get_mut(key) {
                component.name.clone_from(&name);
            }
            record.component_names.insert(key.clone(), name);
        }

        let all_components = describe_components(&components);
        let entries = join_all(targets.iter().map(|(key, bbox)| {
            let name = record
                .component_names
                .get(key)
                .map_or(UNKNOWN_COMPONENT_NAME, String::as_str);
            self.analyze_component(
                &image_path,
                key,
                *bbox,
                name,
                &all_components,
                components.get(key),
            )
        }))
        .await;

        record.components = components;
        for ((key, _), entry) in targets.iter().zip(entries) {
            record.component_details.insert(key.clone(), entry);
        }

        if all_calls_failed(&record) {
            bail!("every annotation call failed for {image_id}");
        }

        let stats = self.resolver.resolve_record(image_id, &mut record);
        debug!(
            "{}: {} references resolved, {} dropped",
            image_id, stats.resolved, stats.dropped
        );

        let primary = self.primary.label();
        let secondary = self.secondary.label();
        let verdicts = join_all(record.component_details.iter().map(|(key, entry)| {
            let detail_a = entry.sources.get(primary).and_then(|s| s.description.as_ref());
            let detail_b = entry.sources.get(secondary).and_then(|s| s.description.as_ref());
            self.scorer.score(
                key,
                record.component_name(key),
                detail_a,
                detail_b,
                &image_path,
            )
        }))
        .await;

        let image_verdict = self.scorer.aggregate(&verdicts);
        for verdict in verdicts {
            if let Some(entry) = record.component_details.get_mut(&verdict.component_key) {
                entry.eval_result = Some(verdict);
            }
        }
        info!(
            "{}: {}/{} components consistent (mean {:.1})",
            image_id,
            image_verdict.consistent_count,
            image_verdict.component_count,
            image_verdict.overall_score
        );
        record.total_eval_result = Some(image_verdict);

        Ok(record)
    }
}

/// Number of components to analyse out of `n`.
#[must_use]
pub fn sample_count(n: usize, rate: f64) -> usize {
    if n == 0 {
        return 0;
    }
    let rate = rate.clamp(0.0, 1.0);
    ((n as f64 * rate).floor() as usize).clamp(1, n)
}

/// Random subset of `keys`, in their original order. With a seed, the subset
/// depends only on the seed, the image id and the keys.
#[must_use]
pub fn sample_keys(keys: &[String], rate: f64, seed: Option<u64>, image_id: &str) -> Vec<String> {
    let amount = sample_count(keys.len(), rate);
    if amount == keys.len() {
        return keys.to_vec();
    }

    let mut seeded_rng;
    let mut thread_rng;
    let rng: &mut dyn RngCore = match seed {
        Some(s) => {
            seeded_rng = rand::rngs::StdRng::seed_from_u64(s ^ fnv1a(image_id));
            &mut seeded_rng
        }
        None => {
            thread_rng = rand::rng();
            &mut thread_rng
        }
    };

    let mut picked = rand::seq::index::sample(rng, keys.len(), amount).into_vec();
    picked.sort_unstable();
    picked.into_iter().map(|i| keys[i].clone()).collect()
}

fn fnv1a(text: &str) -> u64 {
    text.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Display name from a naming answer. Accepts a bare name, a quoted name or
/// a JSON object with `component_name` or `name`.
#[must_use]
pub fn clean_name(answer: &str) -> Option<String> {
    let trimmed = answer.trim();
    if trimmed.contains('{') {
        if let Ok(value) = extract_json(trimmed) {
            let name = value
                .get("component_name")
                .or_else(|| value.get("name"))
                .and_then(serde_json::Value::as_str)
                .map(str::trim)
                .filter(|n| !n.is_empty());
            if let Some(name) = name {
                return Some(name.to_string());
            }
        }
    }
    let first_line = trimmed.lines().next().unwrap_or("");
    let name = first_line
        .trim()
        .trim_matches(|c| matches!(c, '"' | '\'' | '`'))
        .trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// Turn one source's answer into a persisted analysis.
#[must_use]
pub fn source_analysis(
    answer: Result<String, AnnotationError>,
    detected: Option<&DetectedComponent>,
) -> SourceAnalysis {
    let text = match answer {
        Ok(text) => text,
        Err(err) => return SourceAnalysis::failed(err.to_string()),
    };
    match extract_as::<ComponentDescription>(&text) {
        Ok(mut description) => {
            description.lift_flat_connections();
            canonicalize_description(&mut description);
            let io_num_match = detected.is_some_and(|d| io_counts_match(&description, d));
            SourceAnalysis {
                description: Some(description),
                io_num_match,
                ..SourceAnalysis::default()
            }
        }
        Err(err) => SourceAnalysis {
            raw: Some(text),
            error: Some(err.to_string()),
            ..SourceAnalysis::default()
        },
    }
}

/// Pin counts agree with the detector's port counts. Bidirectional pins count
/// as outputs.
#[must_use]
pub fn io_counts_match(description: &ComponentDescription, detected: &DetectedComponent) -> bool {
    let c = &description.connections;
    c.input.len() == detected.input.len()
        && c.output.len() + c.bidirectional.len() == detected.output.len()
}

fn describe_components(components: &BTreeMap<String, DetectedComponent>) -> String {
    components
        .iter()
        .map(|(key, c)| {
            if c.name.is_empty() {
                key.clone()
            } else {
                format!("{} {}", c.name, key)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// True when components were analysed and no source call returned anything.
fn all_calls_failed(record: &ImageRecord) -> bool {
    !record.component_details.is_empty()
        && record
            .component_details
            .values()
            .flat_map(|entry| entry.sources.values())
            .all(|s| s.description.is_none() && s.raw.is_none())
}

/// Re-run entity resolution over stored records, without any service calls.
pub fn reconcile_results(
    records: &mut BTreeMap<String, ImageRecord>,
    resolver: &EntityResolver,
) -> ResolutionStats {
    let mut stats = ResolutionStats::default();
    for (image_id, record) in records.iter_mut() {
        for entry in record.component_details.values_mut() {
            for analysis in entry.sources.values_mut() {
                if let Some(description) = analysis.description.as_mut() {
                    canonicalize_description(description);
                }
            }
        }
        stats += resolver.resolve_record(image_id, record);
    }
    info!(
        "Reconciled {} images: {} references resolved, {} dropped",
        records.len(),
        stats.resolved,
        stats.dropped
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConnectionRef;

    fn keys(n: usize) -> Vec<String> {
        (0..n as u32)
            .map(|i| BoundingBox::new(i * 10, 0, i * 10 + 5, 5).unwrap().key())
            .collect()
    }

    #[test]
    fn test_sample_count() {
        assert_eq!(sample_count(0, 0.5), 0);
        assert_eq!(sample_count(10, 1.0), 10);
        assert_eq!(sample_count(10, 0.35), 3);
        assert_eq!(sample_count(3, 0.1), 1);
        assert_eq!(sample_count(4, 7.0), 4);
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let all = keys(20);
        let a = sample_keys(&all, 0.25, Some(7), "a.png");
        let b = sample_keys(&all, 0.25, Some(7), "a.png");
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
        // subset, original order preserved
        let positions: Vec<usize> = a
            .iter()
            .map(|k| all.iter().position(|x| x == k).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_full_rate_keeps_everything() {
        let all = keys(6);
        assert_eq!(sample_keys(&all, 1.0, None, "x.png"), all);
    }

    #[test]
    fn test_clean_name() {
        assert_eq!(clean_name("  \"Loop Filter\"\n").as_deref(), Some("Loop Filter"));
        assert_eq!(clean_name("`VCO`").as_deref(), Some("VCO"));
        assert_eq!(
            clean_name("```json\n{\"component_name\": \"PFD\"}\n```").as_deref(),
            Some("PFD")
        );
        assert_eq!(clean_name("{\"name\": \"LNA\"}").as_deref(), Some("LNA"));
        assert_eq!(clean_name("  ").as_deref(), None);
    }

    #[test]
    fn test_source_analysis_parses_and_checks_ports() {
        let detected = DetectedComponent {
            name: "PLL".into(),
            input: vec![BoundingBox::new(0, 0, 2, 2).unwrap()],
            output: vec![
                BoundingBox::new(8, 0, 10, 2).unwrap(),
                BoundingBox::new(8, 8, 10, 10).unwrap(),
            ],
        };
        let answer = r#"Sure:
```json
{"component_name": "PLL", "connections": {
  "input": [{"name": "REF", "box": "[1, 2, 3, 4]"}],
  "output": [{"name": "DIV", "box": "<|box_start|>(5,6),(7,8)<|box_end|>"}],
  "bidirectional": [{"name": "BUS", "box": "(9,9,12,12)"}]
}}
```"#;
        let analysis = source_analysis(Ok(answer.into()), Some(&detected));
        let description = analysis.description.unwrap();
        assert!(analysis.io_num_match);
        assert_eq!(description.connections.input[0].box_text, "(1, 2, 3, 4)");
        assert_eq!(description.connections.output[0].box_text, "(5, 6, 7, 8)");
    }

    #[test]
    fn test_source_analysis_accepts_flat_answer() {
        let answer = r#"{"component_name": "VCO", "input": [{"name": "PFD", "box": "[200, 0, 300, 100]"}], "output": [], "bidirectional": []}"#;
        let analysis = source_analysis(Ok(answer.into()), None);
        let description = analysis.usable_description().unwrap();
        assert_eq!(description.connections.total(), 1);
        assert_eq!(description.connections.input[0].box_text, "(200, 0, 300, 100)");
        assert!(description.extra.is_empty());
    }

    #[test]
    fn test_source_analysis_keeps_raw_on_bad_content() {
        let analysis = source_analysis(Ok("no idea".into()), None);
        assert!(analysis.description.is_none());
        assert_eq!(analysis.raw.as_deref(), Some("no idea"));
        assert!(analysis.error.is_some());

        let failed = source_analysis(Err(AnnotationError::Transport("reset".into())), None);
        assert!(failed.raw.is_none());
        assert!(failed.error.unwrap().contains("reset"));
    }

    #[test]
    fn test_reconcile_results_rewrites_references() {
        let mut record = ImageRecord::default();
        record
            .components
            .insert("(0, 0, 100, 100)".into(), DetectedComponent::default());
        record
            .component_names
            .insert("(0, 0, 100, 100)".into(), "VCO".into());
        let mut description = ComponentDescription::default();
        description.connections.input = vec![
            ConnectionRef::new("vco", "[0, 0, 100, 90]"),
            ConnectionRef::new("ghost", "[900, 900, 950, 950]"),
        ];
        let mut entry = ComponentEntry::default();
        entry.sources.insert(
            "a".into(),
            SourceAnalysis {
                description: Some(description),
                ..SourceAnalysis::default()
            },
        );
        record.component_details.insert("(0, 0, 100, 100)".into(), entry);

        let mut records = BTreeMap::from([("img.png".to_string(), record)]);
        let stats = reconcile_results(&mut records, &EntityResolver::default());
        assert_eq!(stats, ResolutionStats { resolved: 1, dropped: 1 });

        let conn = &records["img.png"].component_details["(0, 0, 100, 100)"].sources["a"]
            .description
            .as_ref()
            .unwrap()
            .connections
            .input[0];
        assert_eq!(conn.box_text, "(0, 0, 100, 100)");
        assert_eq!(conn.name, "VCO");
    }
}
