//! Reductions over recorded runs: per-run totals, cross-run session
//! aggregates and session-to-session comparison.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::collector::{MetricData, MetricKind, SamplePoint};
use crate::recorder::RunData;

/// Scalar reductions of one run's sample series.
///
/// Network totals are the peak of the session-relative series; per-sample
/// averages are the mean of consecutive increments. With several metrics of
/// one family in a run (the WebKit case) network totals are summed across
/// them and process samples are flattened into one series.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunTotals {
    pub cpu_avg: f64,
    pub cpu_max: f64,
    pub mem_avg: f64,
    pub mem_max: f64,
    pub rx_total: f64,
    pub rx_avg: f64,
    pub tx_total: f64,
    pub tx_avg: f64,
}

/// Average with sample standard deviation, rounded to two decimals.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Aggregate {
    pub avg: f64,
    pub std_dev: f64,
    /// Standard deviation as a percentage of the average.
    pub std_dev_percent: f64,
}

/// Cross-run aggregates of one session folder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    pub runs: usize,
    pub cpu_avg: Aggregate,
    pub cpu_max: Aggregate,
    pub mem_avg: Aggregate,
    pub mem_max: Aggregate,
    pub rx_total: Aggregate,
    pub rx_avg: Aggregate,
    pub tx_total: Aggregate,
    pub tx_avg: Aggregate,
    /// Run length in milliseconds.
    pub duration: Aggregate,
}

/// How a comparison or report value should be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Percent,
    Bytes,
    /// Milliseconds, rendered as HH:MM:SS.d.
    Duration,
}

/// One baseline-vs-variation comparison row.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub label: &'static str,
    pub unit: Unit,
    pub base: f64,
    pub variation: f64,
    /// Relative change of the variation against the baseline, in percent.
    pub change_percent: f64,
    /// Set when the absolute change exceeds 10 percent.
    pub emphasized: bool,
    /// Directional phrasing, e.g. "uses 50.00% more CPU".
    pub description: String,
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn max(values: &[f64]) -> f64 {
    values.iter().copied().fold(0.0, f64::max)
}

/// Mean of consecutive increments; 0 with fewer than two samples.
fn mean_increment(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let diffs: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    mean(&diffs)
}

/// Aggregate a set of per-run values. Standard deviation is the sample
/// standard deviation (n-1 denominator), 0 with fewer than two values.
pub fn aggregate(values: &[f64]) -> Aggregate {
    let avg = mean(values);

    let std_dev = if values.len() < 2 {
        0.0
    } else {
        let variance =
            values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
        variance.sqrt()
    };

    let std_dev_percent = if avg != 0.0 {
        100.0 * std_dev / avg
    } else {
        0.0
    };

    Aggregate {
        avg: round2(avg),
        std_dev: round2(std_dev),
        std_dev_percent: round2(std_dev_percent),
    }
}

/// Reduce one run's metric series to scalar totals.
pub fn compute_totals(metrics: &[MetricData]) -> RunTotals {
    let mut totals = RunTotals::default();
    let mut cpu = Vec::new();
    let mut mem = Vec::new();

    for metric in metrics {
        match metric.metric {
            MetricKind::Process => {
                for sample in &metric.samples {
                    if let SamplePoint::Process(p) = sample {
                        cpu.push(p.cpu);
                        mem.push(p.mem as f64);
                    }
                }
            }
            MetricKind::Network => {
                let rx: Vec<f64> = metric
                    .samples
                    .iter()
                    .filter_map(|s| match s {
                        SamplePoint::Network(n) => Some(n.rx as f64),
                        _ => None,
                    })
                    .collect();
                let tx: Vec<f64> = metric
                    .samples
                    .iter()
                    .filter_map(|s| match s {
                        SamplePoint::Network(n) => Some(n.tx as f64),
                        _ => None,
                    })
                    .collect();

                totals.rx_total += max(&rx);
                totals.rx_avg += mean_increment(&rx);
                totals.tx_total += max(&tx);
                totals.tx_avg += mean_increment(&tx);
            }
        }
    }

    totals.cpu_avg = mean(&cpu);
    totals.cpu_max = max(&cpu);
    totals.mem_avg = mean(&mem);
    totals.mem_max = max(&mem);
    totals
}

/// Load every `*_data.json` run in a session folder, ordered by run id.
pub fn load_runs(dir: &Path) -> Result<Vec<RunData>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read session folder {dir:?}"))?;

    let mut runs = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !file_name.ends_with("_data.json") {
            continue;
        }

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read run data {path:?}"))?;
        let run: RunData = serde_json::from_str(&raw)
            .with_context(|| format!("invalid run data in {path:?}"))?;
        debug!(file = file_name, run_id = %run.run_id, "loaded run");
        runs.push(run);
    }

    runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
    Ok(runs)
}

/// Aggregate all runs of a session folder.
pub fn load_session(dir: &Path) -> Result<SessionStats> {
    let runs = load_runs(dir)?;
    if runs.is_empty() {
        bail!("no run data found in {dir:?}");
    }

    let totals: Vec<RunTotals> = runs.iter().map(|r| compute_totals(&r.metrics)).collect();
    let field = |f: fn(&RunTotals) -> f64| -> Aggregate {
        aggregate(&totals.iter().map(f).collect::<Vec<f64>>())
    };

    let durations: Vec<f64> = runs.iter().map(|r| r.duration.max(0) as f64).collect();

    Ok(SessionStats {
        runs: runs.len(),
        cpu_avg: field(|t| t.cpu_avg),
        cpu_max: field(|t| t.cpu_max),
        mem_avg: field(|t| t.mem_avg),
        mem_max: field(|t| t.mem_max),
        rx_total: field(|t| t.rx_total),
        rx_avg: field(|t| t.rx_avg),
        tx_total: field(|t| t.tx_total),
        tx_avg: field(|t| t.tx_avg),
        duration: aggregate(&durations),
    })
}

fn change_percent(base: f64, variation: f64) -> f64 {
    if variation == 0.0 {
        return 0.0;
    }
    round2((1.0 - base / variation) * 100.0)
}

fn describe(change: f64, noun: &str) -> String {
    if change == 0.0 {
        return format!("no change in {noun}");
    }
    let direction = if change > 0.0 { "more" } else { "less" };
    format!("uses {:.2}% {direction} {noun}", change.abs())
}

/// Compare a variation session against a baseline session: CPU average,
/// memory average, received and sent data, and combined transferred data.
pub fn compare_sessions(base: &SessionStats, variation: &SessionStats) -> Vec<Comparison> {
    let rows = [
        (
            "CPU",
            "CPU",
            Unit::Percent,
            base.cpu_avg.avg,
            variation.cpu_avg.avg,
        ),
        (
            "MEMORY",
            "memory",
            Unit::Bytes,
            base.mem_avg.avg,
            variation.mem_avg.avg,
        ),
        (
            "DATA RECEIVED",
            "received data",
            Unit::Bytes,
            base.rx_total.avg,
            variation.rx_total.avg,
        ),
        (
            "DATA SENT",
            "sent data",
            Unit::Bytes,
            base.tx_total.avg,
            variation.tx_total.avg,
        ),
        (
            "DATA",
            "combined data",
            Unit::Bytes,
            base.rx_total.avg + base.tx_total.avg,
            variation.rx_total.avg + variation.tx_total.avg,
        ),
    ];

    rows.into_iter()
        .map(|(label, noun, unit, base, variation)| {
            let change = change_percent(base, variation);
            Comparison {
                label,
                unit,
                base,
                variation,
                change_percent: change,
                emphasized: change.abs() > 10.0,
                description: describe(change, noun),
            }
        })
        .collect()
}
