//! Component detection and port grouping.
//!
//! The detector emits two kinds of boxes: component ("node") boxes and I/O
//! port boxes labelled `input` or `output`. A port belongs to every node box
//! it overlaps. Detection models run elsewhere; this crate consumes their
//! output through [`ComponentDetector`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info};

use crate::geometry::BoundingBox;
use crate::models::DetectedComponent;

/// Port class reported by the I/O detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortClass {
    Input,
    Output,
}

/// One detected port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDetection {
    pub class: PortClass,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
}

/// Raw detector output for one image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDetections {
    #[serde(default)]
    pub nodes: Vec<BoundingBox>,
    #[serde(default)]
    pub ports: Vec<PortDetection>,
}

impl ImageDetections {
    /// Group ports under their nodes.
    #[must_use]
    pub fn grouped(&self) -> BTreeMap<String, DetectedComponent> {
        assign_ports(&self.nodes, &self.ports)
    }
}

/// Assign each port to every node it overlaps (IoU > 0).
///
/// Result is keyed by the node's canonical box string; nodes with no ports
/// are still present. Duplicate node boxes collapse into one entry.
#[must_use]
pub fn assign_ports(
    nodes: &[BoundingBox],
    ports: &[PortDetection],
) -> BTreeMap<String, DetectedComponent> {
    let mut grouped = BTreeMap::new();
    for node in nodes {
        let key = node.key();
        if grouped.contains_key(&key) {
            continue;
        }
        let mut component = DetectedComponent::default();
        for port in ports.iter().filter(|p| node.iou(&p.bbox) > 0.0) {
            match port.class {
                PortClass::Input => component.input.push(port.bbox),
                PortClass::Output => component.output.push(port.bbox),
            }
        }
        grouped.insert(key, component);
    }
    grouped
}

/// Source of component boxes for an image.
#[async_trait]
pub trait ComponentDetector: Send + Sync {
    /// Components of `image_id`, keyed by canonical box string.
    ///
    /// # Errors
    ///
    /// Returns an error if detection is unavailable for the image.
    async fn detect(
        &self,
        image_id: &str,
        image_path: &Path,
    ) -> Result<BTreeMap<String, DetectedComponent>>;
}

/// Detector backed by a JSON file of precomputed detections, keyed by image
/// id.
#[derive(Debug, Clone, Default)]
pub struct PrecomputedDetections {
    by_image: HashMap<String, ImageDetections>,
}

impl PrecomputedDetections {
    #[must_use]
    pub const fn new(by_image: HashMap<String, ImageDetections>) -> Self {
        Self { by_image }
    }

    /// Load detections from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read detections {}", path.display()))?;
        let by_image: HashMap<String, ImageDetections> = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse detections {}", path.display()))?;
        info!("Loaded detections for {} images", by_image.len());
        Ok(Self { by_image })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_image.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_image.is_empty()
    }
}

#[async_trait]
impl ComponentDetector for PrecomputedDetections {
    async fn detect(
        &self,
        image_id: &str,
        _image_path: &Path,
    ) -> Result<BTreeMap<String, DetectedComponent>> {
        let detections = self
            .by_image
            .get(image_id)
            .with_context(|| format!("no detections for image {image_id}"))?;
        let grouped = detections.grouped();
        debug!(
            "{}: {} components, {} ports",
            image_id,
            grouped.len(),
            detections.ports.len()
        );
        Ok(grouped)
    }
}
