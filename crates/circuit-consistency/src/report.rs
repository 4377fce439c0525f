//! Corpus-level consistency statistics over a results map.

#![allow(clippy::cast_precision_loss)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::error::StoreError;
use crate::models::ImageRecord;
use crate::store::write_json_atomic;

/// File name of the statistics summary inside the output directory.
pub const STATS_FILE: &str = "consistency_stats.json";

/// Benchmark summary. Only images with an image verdict are counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkStats {
    pub total_images: usize,
    pub consistent_images: usize,
    pub inconsistent_images: usize,
    pub image_consistency_rate: f64,
    pub total_components: usize,
    pub consistent_components: usize,
    pub component_consistency_rate: f64,
    /// Mean component score over every scored component.
    pub average_consistency_score: f64,
}

impl BenchmarkStats {
    #[must_use]
    pub fn from_records(records: &BTreeMap<String, ImageRecord>) -> Self {
        let mut stats = Self::default();
        let mut score_sum = 0.0;

        for record in records.values() {
            let Some(verdict) = record.total_eval_result else {
                continue;
            };
            stats.total_images += 1;
            if verdict.overall_consistent {
                stats.consistent_images += 1;
            }
            for component in record
                .component_details
                .values()
                .filter_map(|entry| entry.eval_result.as_ref())
            {
                stats.total_components += 1;
                if component.is_consistent {
                    stats.consistent_components += 1;
                }
                score_sum += f64::from(component.consistency_score);
            }
        }

        stats.inconsistent_images = stats.total_images - stats.consistent_images;
        stats.image_consistency_rate = ratio(stats.consistent_images, stats.total_images);
        stats.component_consistency_rate =
            ratio(stats.consistent_components, stats.total_components);
        if stats.total_components > 0 {
            stats.average_consistency_score = score_sum / stats.total_components as f64;
        }
        stats
    }

    /// Write the summary next to the results.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be written.
    pub fn write(&self, path: &Path) -> Result<(), StoreError> {
        write_json_atomic(path, self)
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

impl fmt::Display for BenchmarkStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Images:     {}", self.total_images)?;
        writeln!(
            f,
            "  consistent:   {} ({:.1}%)",
            self.consistent_images,
            self.image_consistency_rate * 100.0
        )?;
        writeln!(f, "  inconsistent: {}", self.inconsistent_images)?;
        writeln!(f, "Components: {}", self.total_components)?;
        writeln!(
            f,
            "  consistent:   {} ({:.1}%)",
            self.consistent_components,
            self.component_consistency_rate * 100.0
        )?;
        write!(f, "Mean score: {:.2}", self.average_consistency_score)
    }
}
