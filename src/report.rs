//! Report generation for PSIS-LOO results and model comparisons.
//!
//! Reports carry a timestamp and the crate version and render to markdown
//! (tables via `tabled`) or pretty JSON.

use crate::compare::ComparisonTable;
use crate::psis::{ParetoKSummary, PsisLoo};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as FmtWrite;
use tabled::settings::Style;
use tabled::{Table, Tabled};

/// Report metadata
#[derive(Debug, Clone, Serialize)]
pub struct ReportMetadata {
    /// Report title
    pub title: String,
    /// Report generation timestamp
    pub generated_at: DateTime<Utc>,
    /// Crate version
    pub framework_version: String,
}

impl ReportMetadata {
    fn new(title: String) -> Self {
        Self {
            title,
            generated_at: Utc::now(),
            framework_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn write_header(&self, output: &mut String) {
        writeln!(output, "# {}", self.title).ok();
        writeln!(output).ok();
        writeln!(
            output,
            "**Generated:** {}",
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
        .ok();
        writeln!(output, "**Version:** {}", self.framework_version).ok();
        writeln!(output).ok();
    }
}

/// PSIS-LOO report for a single model
#[derive(Debug, Clone, Serialize)]
pub struct LooReport {
    /// Report metadata
    pub metadata: ReportMetadata,
    /// Model name
    pub model: String,
    /// Total ELPD
    pub elpd_loo: f64,
    /// Standard error of ELPD
    pub se_elpd_loo: f64,
    /// Effective number of parameters
    pub p_loo: Option<f64>,
    /// LOO information criterion
    pub looic: f64,
    /// Standard error of LOOIC
    pub se_looic: f64,
    /// Pareto k summary
    pub pareto_k: ParetoKSummary,
    /// Observations with k above threshold, with their k
    pub unreliable: Vec<(usize, f64)>,
}

impl LooReport {
    /// Build a report for a model's PSIS-LOO result
    #[must_use]
    pub fn new(model: &str, loo: &PsisLoo) -> Self {
        let unreliable = loo
            .unreliable_observations()
            .into_iter()
            .map(|i| (i, loo.pointwise[i].pareto_k))
            .collect();
        Self {
            metadata: ReportMetadata::new(format!("PSIS-LOO: {model}")),
            model: model.to_string(),
            elpd_loo: loo.elpd_loo,
            se_elpd_loo: loo.se_elpd_loo,
            p_loo: loo.p_loo,
            looic: loo.looic(),
            se_looic: loo.se_looic(),
            pareto_k: loo.summary(),
            unreliable,
        }
    }

    /// Render report as JSON
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Render report as markdown
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut output = String::new();
        self.metadata.write_header(&mut output);

        writeln!(output, "## Estimates").ok();
        writeln!(output).ok();
        writeln!(output, "| Estimate | Value | SE |").ok();
        writeln!(output, "|----------|-------|----|").ok();
        writeln!(
            output,
            "| elpd_loo | {:.2} | {:.2} |",
            self.elpd_loo, self.se_elpd_loo
        )
        .ok();
        if let Some(p_loo) = self.p_loo {
            writeln!(output, "| p_loo | {p_loo:.2} | |").ok();
        }
        writeln!(output, "| looic | {:.2} | {:.2} |", self.looic, self.se_looic).ok();
        writeln!(output).ok();

        let k = &self.pareto_k;
        writeln!(output, "## Pareto k diagnostics").ok();
        writeln!(output).ok();
        writeln!(output, "| Range | Share |").ok();
        writeln!(output, "|-------|-------|").ok();
        writeln!(output, "| k > 0.5 | {:.1}% |", k.frac_above_half * 100.0).ok();
        writeln!(
            output,
            "| k > {} | {:.1}% |",
            k.threshold,
            k.frac_above_threshold * 100.0
        )
        .ok();
        writeln!(output, "| k > 1 | {:.1}% |", k.frac_above_one * 100.0).ok();
        writeln!(output).ok();

        if self.unreliable.is_empty() {
            writeln!(output, "All Pareto k estimates are at or below {}.", k.threshold).ok();
        } else {
            writeln!(
                output,
                "**Warning:** {} of {} observations have k > {}; their LOO estimates are unreliable:",
                self.unreliable.len(),
                k.n_observations,
                k.threshold
            )
            .ok();
            writeln!(output).ok();
            for (i, k) in &self.unreliable {
                writeln!(output, "- observation {i}: k = {k:.2}").ok();
            }
        }

        output
    }
}

/// Table row for comparison output
#[derive(Tabled)]
struct ComparisonTableRow {
    #[tabled(rename = "Model")]
    model: String,
    #[tabled(rename = "elpd_loo")]
    elpd: String,
    #[tabled(rename = "SE")]
    se: String,
    #[tabled(rename = "elpd_diff")]
    diff: String,
    #[tabled(rename = "SE diff")]
    se_diff: String,
    #[tabled(rename = "k > threshold")]
    unreliable: String,
}

/// Comparison report across models
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonReport {
    /// Report metadata
    pub metadata: ReportMetadata,
    /// Ranked models
    pub comparison: ComparisonTable,
}

impl ComparisonReport {
    /// Wrap a comparison table
    #[must_use]
    pub fn new(comparison: ComparisonTable) -> Self {
        Self {
            metadata: ReportMetadata::new("LOO model comparison".to_string()),
            comparison,
        }
    }

    /// Render report as JSON
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Render report as markdown
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut output = String::new();
        self.metadata.write_header(&mut output);

        writeln!(
            output,
            "Ranked by elpd_loo over {} observations (higher is better).",
            self.comparison.n_observations
        )
        .ok();
        writeln!(output).ok();
        writeln!(output, "{}", comparison_table(&self.comparison)).ok();

        output
    }
}

fn format_optional(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.2}"))
}

/// Render the comparison as a markdown table
#[must_use]
pub fn comparison_table(comparison: &ComparisonTable) -> String {
    let rows: Vec<ComparisonTableRow> = comparison
        .rows
        .iter()
        .map(|row| ComparisonTableRow {
            model: row.name.clone(),
            elpd: format!("{:.2}", row.elpd_loo),
            se: format!("{:.2}", row.se_elpd_loo),
            diff: format_optional(row.elpd_diff),
            se_diff: format_optional(row.se_diff),
            unreliable: row.n_unreliable.to_string(),
        })
        .collect();

    Table::new(rows).with(Style::markdown()).to_string()
}
