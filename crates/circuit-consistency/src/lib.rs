//! Circuit Consistency - agreement benchmark between two diagram annotators
//!
//! Each circuit-diagram image is annotated independently by two vision-language
//! sources. The sources box and name the same physical component differently,
//! so their connection references are first resolved onto the detector's
//! canonical component keys, then compared pin by pin and judged
//! qualitatively. Results are persisted per image and the run can resume
//! after any interruption.
//!
//! ## Key Types
//!
//! - [`BoundingBox`] - canonical box, parsed from any accepted text encoding
//! - [`EntityResolver`] - maps a noisy reference onto a detected component
//! - [`ConsistencyScorer`] - per-component verdicts and image aggregation
//! - [`JsonResultStore`] - durable, atomically flushed results map
//! - [`orchestrator::run`] - resumable bounded-concurrency driver
//! - [`ImageAnalyzer`] - the per-image pipeline

pub mod annotation;
pub mod config;
pub mod detector;
pub mod discover;
pub mod error;
pub mod geometry;
pub mod json_extract;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod prompts;
pub mod report;
pub mod resolver;
pub mod retry;
pub mod scorer;
pub mod store;

pub use annotation::{
    AnnotationRequest, AnnotationService, EndpointConfig, OpenAiCompatibleClient, Throttled,
};
pub use config::{load_config, Config, EndpointRole};
pub use detector::{ComponentDetector, PrecomputedDetections};
pub use error::{AnnotationError, BoxParseError, ConfigError, ExtractError, StoreError};
pub use geometry::{canonicalize, parse_box, BoundingBox};
pub use models::{
    ComponentDescription, ComponentEntry, ComponentVerdict, ConnectionRef, Connections,
    DetectedComponent, Direction, ImageRecord, ImageVerdict, SourceAnalysis,
};
pub use orchestrator::{ImageProcessor, OrchestratorConfig, RunSummary};
pub use pipeline::{reconcile_results, ImageAnalyzer};
pub use report::BenchmarkStats;
pub use resolver::{EntityResolver, MatchResult, ResolverConfig};
pub use scorer::{AnnotationJudge, ConsistencyJudge, ConsistencyScorer, ScoringPolicy};
pub use store::{JsonResultStore, MemoryResultStore, ResultStore};
