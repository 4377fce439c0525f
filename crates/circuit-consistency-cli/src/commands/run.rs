//! Run command - annotate, reconcile and score every pending image

use anyhow::{Context as _, Result};
use circuit_consistency::config::{load_config, Config, EndpointRole};
use circuit_consistency::discover::discover_images;
use circuit_consistency::orchestrator::{self, OrchestratorConfig};
use circuit_consistency::report::{BenchmarkStats, STATS_FILE};
use circuit_consistency::store::{ResultStore, RESULTS_FILE};
use circuit_consistency::{
    AnnotationJudge, AnnotationService, ConsistencyJudge, ConsistencyScorer, EntityResolver,
    ImageAnalyzer, JsonResultStore, OpenAiCompatibleClient, PrecomputedDetections, Throttled,
};
use clap::Args;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{info, warn};

#[derive(Args)]
pub struct RunCommand {
    /// Directory containing the diagram images (overrides [input].image_root)
    #[arg(long)]
    image_root: Option<PathBuf>,

    /// Precomputed detections JSON (overrides [input].detections)
    #[arg(long)]
    detections: Option<PathBuf>,

    /// Output directory for results (overrides [output].dir)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Maximum concurrent images
    #[arg(long)]
    workers: Option<usize>,

    /// Reprocess images that already have results
    #[arg(long)]
    no_resume: bool,
}

impl RunCommand {
    pub async fn execute(self, config_path: &Path) -> Result<()> {
        let config = load_config(config_path)
            .with_context(|| format!("Failed to load config {}", config_path.display()))?;

        let image_root = self
            .image_root
            .or_else(|| config.image_root().map(Path::to_path_buf))
            .context("No image root: set [input].image_root or pass --image-root")?;
        let detections_path = self
            .detections
            .or_else(|| config.detections_path().map(Path::to_path_buf))
            .context("No detections file: set [input].detections or pass --detections")?;
        let output_dir = self.output_dir.unwrap_or_else(|| config.output_dir());
        let workers = self.workers.unwrap_or_else(|| config.workers()).max(1);
        let resume = config.resume() && !self.no_resume;

        info!("=== Circuit Consistency Run ===");
        info!("Image root: {}", image_root.display());
        info!("Output: {}", output_dir.display());

        let image_ids = discover_images(&image_root)?;
        if image_ids.is_empty() {
            warn!("No images found under {}", image_root.display());
        }
        let detector = Arc::new(PrecomputedDetections::load(&detections_path)?);

        let permits = config
            .max_inflight_calls()
            .map(|n| Arc::new(Semaphore::new(n)));
        if let Some(p) = &permits {
            info!("Max in-flight calls: {}", p.available_permits());
        }

        let primary = build_service(&config, EndpointRole::Primary, permits.as_ref())?;
        let secondary = build_service(&config, EndpointRole::Secondary, permits.as_ref())?;

        let prompts = config.prompts();
        let judge: Option<Arc<dyn ConsistencyJudge>> = if config.judge.is_some() {
            let service = build_service(&config, EndpointRole::Judge, permits.as_ref())?;
            Some(Arc::new(AnnotationJudge::new(service, prompts.judge.clone())))
        } else {
            warn!("No [judge] section: final scores are the structural scores");
            None
        };

        let analyzer = ImageAnalyzer::new(image_root, detector, primary, secondary)
            .with_resolver(EntityResolver::new(config.resolver()))
            .with_scorer(ConsistencyScorer::new(config.scoring(), judge))
            .with_prompts(prompts)
            .with_sampling(config.node_sample_rate(), config.sample_seed());

        let mut store = JsonResultStore::open(output_dir.join(RESULTS_FILE))?;

        let start = Instant::now();
        let summary = orchestrator::run(
            &mut store,
            &image_ids,
            Arc::new(analyzer),
            OrchestratorConfig {
                workers,
                checkpoint_interval: config.checkpoint_interval(),
                resume,
            },
        )
        .await?;
        info!(
            "Processed {} images in {:.1}s",
            summary.succeeded + summary.failed,
            start.elapsed().as_secs_f64()
        );
        if summary.failed > 0 {
            warn!("{} images failed; re-run to retry them", summary.failed);
        }

        let stats = BenchmarkStats::from_records(store.records());
        let stats_path = output_dir.join(STATS_FILE);
        stats.write(&stats_path)?;
        info!("Statistics written to {}", stats_path.display());
        println!("{stats}");

        Ok(())
    }
}

fn build_service(
    config: &Config,
    role: EndpointRole,
    permits: Option<&Arc<Semaphore>>,
) -> Result<Arc<dyn AnnotationService>> {
    let endpoint = config
        .endpoint(role)
        .with_context(|| format!("Invalid [{role}] endpoint"))?;
    info!("{}: {} via {}", role, endpoint.model, endpoint.api_base);
    let client = OpenAiCompatibleClient::new(endpoint)
        .with_context(|| format!("Failed to build [{role}] client"))?;
    Ok(match permits {
        Some(permits) => Arc::new(Throttled::new(client, Arc::clone(permits))),
        None => Arc::new(client),
    })
}
