//! Report artifacts: raw run data export, Markdown run reports with chart
//! blocks, and session summary / comparison rendering.
//!
//! A run produces two files in its session folder, `<name>_<runId>_data.json`
//! and `<name>_<runId>_report.md`. The JSON file is the durable record the
//! session statistics are computed from; the Markdown report is for humans.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::json;
use tracing::info;

use crate::collector::{DataType, Dataset};
use crate::parse::{format_bytes, format_duration};
use crate::recorder::RunData;
use crate::stats::{Comparison, RunTotals, SessionStats, Unit};

const MB: f64 = 1024.0 * 1024.0;

pub fn data_file_name(name: &str, run_id: &str) -> String {
    format!("{name}_{run_id}_data.json")
}

pub fn report_file_name(name: &str, run_id: &str) -> String {
    format!("{name}_{run_id}_report.md")
}

/// Write a run's data JSON and Markdown report into the session folder,
/// creating it if needed. Returns the data file path.
pub fn save_run(run: &RunData, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create session folder {dir:?}"))?;

    let data_path = dir.join(data_file_name(&run.name, &run.run_id));
    let json = serde_json::to_string_pretty(run).context("failed to serialize run data")?;
    fs::write(&data_path, json).with_context(|| format!("failed to write {data_path:?}"))?;

    let report_path = dir.join(report_file_name(&run.name, &run.run_id));
    fs::write(&report_path, render_run_report(run))
        .with_context(|| format!("failed to write {report_path:?}"))?;

    info!(data = %data_path.display(), report = %report_path.display(), "run saved");
    Ok(data_path)
}

/// Human run summary: duration plus the scalar totals with human units.
pub fn render_run_summary(name: &str, duration_ms: i64, totals: &RunTotals) -> String {
    format!(
        "{name}\n\
         duration: {}\n\
         CPU avg: {:.1}% max: {:.1}%\n\
         MEM avg: {} max: {}\n\
         RX total: {} avg: {}\n\
         TX total: {} avg: {}",
        format_duration(duration_ms.max(0) as u64),
        totals.cpu_avg,
        totals.cpu_max,
        format_bytes(totals.mem_avg),
        format_bytes(totals.mem_max),
        format_bytes(totals.rx_total),
        format_bytes(totals.rx_avg),
        format_bytes(totals.tx_total),
        format_bytes(totals.tx_avg),
    )
}

/// Markdown run report: summary block plus one chart block per dataset.
pub fn render_run_report(run: &RunData) -> String {
    let mut out = format!("# {} - {}\n\n", run.name, run.run_id);

    if let Some(summary) = &run.summary {
        out.push_str("```\n");
        out.push_str(summary);
        out.push_str("\n```\n\n");
    }

    for metric in &run.metrics {
        for dataset in &metric.data_sets {
            out.push_str(&format!("## {} ({})\n\n", dataset.name, metric.name));
            out.push_str("```chart\n");
            out.push_str(&chart_block(dataset));
            out.push_str("\n```\n\n");
        }
    }

    out
}

/// Line-chart JSON for one dataset. Byte series are scaled to MB so chart
/// axes stay readable.
fn chart_block(dataset: &Dataset) -> String {
    let scale = match dataset.data_type {
        DataType::Bytes => MB,
        DataType::Value => 1.0,
    };
    let unit = match dataset.data_type {
        DataType::Bytes => "MB",
        DataType::Value => "%",
    };

    let points: Vec<serde_json::Value> = dataset
        .data
        .iter()
        .map(|p| json!({ "x": p.tick, "y": p.value / scale }))
        .collect();

    let chart = json!({
        "type": "line",
        "title": dataset.name,
        "unit": unit,
        "data": points,
    });

    // Values already went through json!, this cannot fail.
    serde_json::to_string_pretty(&chart).unwrap_or_default()
}

fn format_value(value: f64, unit: Unit) -> String {
    match unit {
        Unit::Percent => format!("{value:.2}%"),
        Unit::Bytes => format_bytes(value),
        Unit::Duration => format_duration(value.max(0.0) as u64),
    }
}

/// Markdown session report: one aggregate table over all runs of a folder.
pub fn render_session_report(name: &str, session: &SessionStats) -> String {
    let mut out = format!("# Session: {name}\n\nruns: {}\n\n", session.runs);
    out.push_str("| measure | avg | std dev | std dev % |\n");
    out.push_str("| --- | --- | --- | --- |\n");

    let rows: [(&str, Unit, &crate::stats::Aggregate); 9] = [
        ("CPU avg", Unit::Percent, &session.cpu_avg),
        ("CPU max", Unit::Percent, &session.cpu_max),
        ("MEM avg", Unit::Bytes, &session.mem_avg),
        ("MEM max", Unit::Bytes, &session.mem_max),
        ("RX total", Unit::Bytes, &session.rx_total),
        ("RX avg", Unit::Bytes, &session.rx_avg),
        ("TX total", Unit::Bytes, &session.tx_total),
        ("TX avg", Unit::Bytes, &session.tx_avg),
        ("Duration", Unit::Duration, &session.duration),
    ];

    for (label, unit, agg) in rows {
        out.push_str(&format!(
            "| {label} | {} | {} | {:.2}% |\n",
            format_value(agg.avg, unit),
            format_value(agg.std_dev, unit),
            agg.std_dev_percent,
        ));
    }

    out
}

/// Markdown comparison table followed by one directional line per measure.
/// Rows whose absolute change exceeds 10 percent are rendered in bold.
pub fn render_comparison(
    base_name: &str,
    variation_name: &str,
    rows: &[Comparison],
) -> String {
    let mut out = format!("# {base_name} vs {variation_name}\n\n");
    out.push_str(&format!(
        "| measure | {base_name} | {variation_name} | change |\n"
    ));
    out.push_str("| --- | --- | --- | --- |\n");

    for row in rows {
        let change = format!("{:+.2}%", row.change_percent);
        let change = if row.emphasized {
            format!("**{change}**")
        } else {
            change
        };
        out.push_str(&format!(
            "| {} | {} | {} | {change} |\n",
            row.label,
            format_value(row.base, row.unit),
            format_value(row.variation, row.unit),
        ));
    }

    out.push('\n');
    for row in rows {
        let line = if row.emphasized {
            format!("- **{variation_name} {}**\n", row.description)
        } else {
            format!("- {variation_name} {}\n", row.description)
        };
        out.push_str(&line);
    }

    out
}
