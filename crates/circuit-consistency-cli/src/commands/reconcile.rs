//! Reconcile command - offline entity resolution over a results file

use anyhow::{Context as _, Result};
use circuit_consistency::config::load_config;
use circuit_consistency::store::{load, write_json_atomic};
use circuit_consistency::{reconcile_results, EntityResolver};
use clap::Args;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Args)]
pub struct ReconcileCommand {
    /// Results file to read
    #[arg(value_name = "RESULTS")]
    input: PathBuf,

    /// Where to write the reconciled results (defaults to overwriting the input)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl ReconcileCommand {
    pub fn execute(self, config_path: &Path) -> Result<()> {
        let config = load_config(config_path)
            .with_context(|| format!("Failed to load config {}", config_path.display()))?;
        let resolver = EntityResolver::new(config.resolver());

        let mut records = load(&self.input)?;
        if records.is_empty() {
            anyhow::bail!("No records in {}", self.input.display());
        }
        let stats = reconcile_results(&mut records, &resolver);

        let output = self.output.unwrap_or(self.input);
        write_json_atomic(&output, &records)?;
        info!(
            "Wrote {} images to {} ({} resolved, {} dropped)",
            records.len(),
            output.display(),
            stats.resolved,
            stats.dropped
        );
        Ok(())
    }
}
