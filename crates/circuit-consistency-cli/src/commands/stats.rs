//! Stats command - benchmark statistics for a results file

use anyhow::Result;
use circuit_consistency::store::load;
use circuit_consistency::BenchmarkStats;
use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct StatsCommand {
    /// Results file to summarise
    #[arg(value_name = "RESULTS")]
    input: PathBuf,

    /// Print JSON instead of a table
    #[arg(long)]
    json: bool,
}

impl StatsCommand {
    pub fn execute(self) -> Result<()> {
        let records = load(&self.input)?;
        let stats = BenchmarkStats::from_records(&records);
        if self.json {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        } else {
            println!("{stats}");
        }
        Ok(())
    }
}
