//! End-to-end pipeline tests with scripted annotation sources.

use async_trait::async_trait;
use circuit_consistency::detector::{ImageDetections, PortClass, PortDetection};
use circuit_consistency::orchestrator::{self, OrchestratorConfig};
use circuit_consistency::scorer::NO_CONNECTIONS_REASON;
use circuit_consistency::store::RESULTS_FILE;
use circuit_consistency::{
    AnnotationError, AnnotationRequest, AnnotationService, BoundingBox, ImageAnalyzer,
    ImageRecord, JsonResultStore, MemoryResultStore, PrecomputedDetections, ResultStore,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const VCO: &str = "(0, 0, 100, 100)";
const PFD: &str = "(200, 0, 300, 100)";

/// Answers by region: plain requests get a name, JSON requests a detail.
struct ScriptedSource {
    label: &'static str,
    names: HashMap<String, String>,
    details: HashMap<String, String>,
    calls: Mutex<Vec<PathBuf>>,
    fail: bool,
}

impl ScriptedSource {
    fn new(label: &'static str) -> Self {
        Self {
            label,
            names: HashMap::new(),
            details: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    fn name(mut self, region: &str, name: &str) -> Self {
        self.names.insert(region.to_string(), name.to_string());
        self
    }

    fn detail(mut self, region: &str, reply: &str) -> Self {
        self.details.insert(region.to_string(), reply.to_string());
        self
    }

    fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    fn calls(&self) -> Vec<PathBuf> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AnnotationService for ScriptedSource {
    fn label(&self) -> &str {
        self.label
    }

    async fn generate(&self, request: &AnnotationRequest) -> Result<String, AnnotationError> {
        self.calls.lock().unwrap().push(request.image_path.clone());
        if self.fail {
            return Err(AnnotationError::Transport("connection reset".into()));
        }
        let region = request.region.map(|b| b.key()).unwrap_or_default();
        let table = if request.expect_json {
            &self.details
        } else {
            &self.names
        };
        table
            .get(&region)
            .cloned()
            .ok_or_else(|| AnnotationError::Content(format!("nothing scripted for {region}")))
    }
}

fn bx(text: &str) -> BoundingBox {
    text.parse().unwrap()
}

fn detections(images: &[&str]) -> Arc<PrecomputedDetections> {
    let per_image = ImageDetections {
        nodes: vec![bx(VCO), bx(PFD)],
        ports: vec![PortDetection {
            class: PortClass::Input,
            bbox: bx("(0, 40, 10, 60)"),
        }],
    };
    Arc::new(PrecomputedDetections::new(
        images
            .iter()
            .map(|id| ((*id).to_string(), per_image.clone()))
            .collect(),
    ))
}

fn primary() -> ScriptedSource {
    ScriptedSource::new("model-a")
        .name(VCO, "VCO")
        .name(PFD, "\"PFD\"")
        .detail(
            VCO,
            r#"{"component_name": "VCO", "connections": {"input": [{"name": "PFD", "box": "[200, 0, 300, 100]", "function": "control voltage"}]}}"#,
        )
        .detail(
            PFD,
            r#"{"component_name": "PFD", "connections": {"output": [{"name": "VCO", "box": "(0,0,100,100)"}]}}"#,
        )
}

fn secondary() -> ScriptedSource {
    ScriptedSource::new("model-b")
        .detail(
            VCO,
            "The VCO has one input.\n```json\n{\"component_name\": \"vco\", \"connections\": {\"input\": [{\"name\": \"pfd\", \"box\": \"<|box_start|>(202,2),(298,98)<|box_end|>\"}], \"output\": [], \"bidirectional\": []}}\n```",
        )
        .detail(
            PFD,
            r#"{"component_name": "PFD", "connections": {"input": [], "output": [], "bidirectional": []}}"#,
        )
}

fn analyzer(
    images: &[&str],
    a: &Arc<ScriptedSource>,
    b: &Arc<ScriptedSource>,
) -> Arc<ImageAnalyzer> {
    Arc::new(ImageAnalyzer::new(
        "/diagrams",
        detections(images),
        Arc::clone(a) as Arc<dyn AnnotationService>,
        Arc::clone(b) as Arc<dyn AnnotationService>,
    ))
}

fn ids(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| (*s).to_string()).collect()
}

#[tokio::test]
async fn test_resume_only_calls_services_for_pending_images() {
    let a = Arc::new(primary());
    let b = Arc::new(secondary());

    let mut done = ImageRecord::default();
    done.components.insert(VCO.into(), Default::default());
    let mut store = MemoryResultStore::default();
    store.upsert("A.png", done.clone());

    let summary = orchestrator::run(
        &mut store,
        &ids(&["A.png", "B.png"]),
        analyzer(&["A.png", "B.png"], &a, &b),
        OrchestratorConfig::default(),
    )
    .await
    .unwrap();

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.succeeded, 1);
    assert!(!a.calls().is_empty());
    assert!(!b.calls().is_empty());
    for path in a.calls().iter().chain(b.calls().iter()) {
        assert_eq!(path, &PathBuf::from("/diagrams/B.png"));
    }
    // the done record is untouched
    assert_eq!(store.get("A.png"), Some(&done));
}

#[tokio::test]
async fn test_record_is_resolved_and_scored() {
    let a = Arc::new(primary());
    let b = Arc::new(secondary());
    let mut store = MemoryResultStore::default();

    orchestrator::run(
        &mut store,
        &ids(&["img.png"]),
        analyzer(&["img.png"], &a, &b),
        OrchestratorConfig::default(),
    )
    .await
    .unwrap();

    let record = store.get("img.png").unwrap();
    assert_eq!(record.components.len(), 2);
    assert_eq!(record.component_names[VCO], "VCO");
    assert_eq!(record.component_names[PFD], "PFD");
    assert_eq!(record.components[VCO].input.len(), 1);

    // both sources' references to the PFD resolve onto its detected key
    let vco = &record.component_details[VCO];
    for label in ["model-a", "model-b"] {
        let conn = &vco.sources[label].description.as_ref().unwrap().connections.input[0];
        assert_eq!(conn.box_text, PFD);
        assert_eq!(conn.name, "PFD");
    }
    assert!(vco.sources["model-a"].io_num_match);
    assert!(vco.sources["model-a"].description.as_ref().unwrap().connections.input[0]
        .extra
        .contains_key("function"));

    let verdict = vco.eval_result.as_ref().unwrap();
    assert_eq!(verdict.consistency_score, 100);
    assert!(verdict.is_consistent);
    assert_eq!(verdict.score_breakdown.n_consistent, 1);

    // a detail with no connections from one source scores zero
    let pfd = record.component_details[PFD].eval_result.as_ref().unwrap();
    assert_eq!(pfd.consistency_score, 0);
    assert!(!pfd.is_consistent);
    assert_eq!(pfd.reasoning, NO_CONNECTIONS_REASON);

    let image = record.total_eval_result.unwrap();
    assert_eq!(image.component_count, 2);
    assert_eq!(image.consistent_count, 1);
    assert!(!image.overall_consistent);
    assert!((image.overall_score - 50.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_failed_image_stays_pending() {
    let a = Arc::new(primary().failing());
    let b = Arc::new(secondary().failing());
    let mut store = MemoryResultStore::default();

    let summary = orchestrator::run(
        &mut store,
        &ids(&["img.png"]),
        analyzer(&["img.png"], &a, &b),
        OrchestratorConfig::default(),
    )
    .await
    .unwrap();

    assert_eq!(summary.failed, 1);
    assert!(!store.is_done("img.png"));
}

#[tokio::test]
async fn test_missing_detections_fail_only_that_image() {
    let a = Arc::new(primary());
    let b = Arc::new(secondary());
    let mut store = MemoryResultStore::default();

    let summary = orchestrator::run(
        &mut store,
        &ids(&["known.png", "unknown.png"]),
        analyzer(&["known.png"], &a, &b),
        OrchestratorConfig::default(),
    )
    .await
    .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    assert!(store.is_done("known.png"));
    assert!(store.get("unknown.png").is_none());
}

#[tokio::test]
async fn test_durable_store_resumes_across_runs() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(RESULTS_FILE);
    let images = ["x.png", "y.png"];

    {
        let a = Arc::new(primary());
        let b = Arc::new(secondary());
        let mut store = JsonResultStore::open(&path).unwrap();
        let summary = orchestrator::run(
            &mut store,
            &ids(&images),
            analyzer(&images, &a, &b),
            OrchestratorConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(summary.succeeded, 2);
    }

    let a = Arc::new(primary());
    let b = Arc::new(secondary());
    let mut store = JsonResultStore::open(&path).unwrap();
    let summary = orchestrator::run(
        &mut store,
        &ids(&images),
        analyzer(&images, &a, &b),
        OrchestratorConfig::default(),
    )
    .await
    .unwrap();

    assert_eq!(summary.skipped, 2);
    assert!(a.calls().is_empty());
    assert!(b.calls().is_empty());
    assert!(store.is_done("x.png"));
}
