//! Metric collectors: typed sample series built from raw subprocess output.
//!
//! Each collector owns one metric's time series. Raw text chunks arrive from
//! a shell subprocess (see [`crate::source`]) and are processed synchronously,
//! one chunk at a time, by a probe. Probes are a closed set of tagged
//! variants rather than a class hierarchy: CPU/memory, network counters, and
//! multi-process network counters, with the counter-normalization policy
//! factored into a [`CounterBaseline`] shared by the two network variants.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::parse;
use crate::source::ShellSource;

/// Metric family a collector belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricKind {
    #[serde(rename = "proc")]
    Process,
    #[serde(rename = "net")]
    Network,
}

/// How a dataset's values should be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bytes,
    Value,
}

/// One CPU/memory reading, tagged with elapsed seconds since recording start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    /// CPU usage as a percentage.
    pub cpu: f64,
    /// Resident memory in bytes.
    pub mem: u64,
    pub tick: f64,
}

/// One network reading as a delta since session start, not a raw counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSample {
    /// Bytes received since session start.
    pub rx: u64,
    /// Bytes sent since session start.
    pub tx: u64,
    pub tick: f64,
}

/// A sample of either metric family. Serializes as the bare sample object so
/// persisted run data keeps the original field layout.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SamplePoint {
    Process(ProcessSample),
    Network(NetworkSample),
}

/// One point of a chart-ready dataset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub tick: f64,
    pub value: f64,
}

/// A named, chart-ready projection of one field of a sample series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub data: Vec<DataPoint>,
    #[serde(rename = "dataType")]
    pub data_type: DataType,
}

/// Serializable snapshot of one collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricData {
    pub name: String,
    pub metric: MetricKind,
    pub samples: Vec<SamplePoint>,
    #[serde(rename = "dataSets")]
    pub data_sets: Vec<Dataset>,
}

/// Fatal chunk-processing failures. Recoverable anomalies (missing columns,
/// malformed numbers, counter regressions) are logged and skipped instead.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("chunk contained {lines} process lines, ambiguous process match")]
    AmbiguousProcessMatch { lines: usize },
}

// ---------------------------------------------------------------------------
// Counter normalization
// ---------------------------------------------------------------------------

/// Session-start offset and non-regression policy for cumulative counters.
///
/// Network tools report byte counters accumulated since device boot. The
/// first raw reading becomes the session offset and is emitted as a zero
/// sample; later readings are offset-subtracted. A reading that moves either
/// direction backwards relative to the last accepted sample (counter reset or
/// parse glitch) is discarded entirely, never clamped.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterBaseline {
    offset: Option<(u64, u64)>,
}

/// Outcome of normalizing one raw counter reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalized {
    /// First reading of the session; the baseline was just established.
    First,
    /// Session-relative delta, safe to append.
    Delta { rx: u64, tx: u64 },
    /// Reading regressed below the last accepted sample; drop it.
    Regressed,
}

impl CounterBaseline {
    /// Normalize a raw cumulative reading against the session offset and the
    /// last accepted sample.
    pub fn normalize(
        &mut self,
        raw_rx: u64,
        raw_tx: u64,
        last: Option<&NetworkSample>,
    ) -> Normalized {
        let (offset_rx, offset_tx) = match self.offset {
            Some(offset) => offset,
            None => {
                self.offset = Some((raw_rx, raw_tx));
                return Normalized::First;
            }
        };

        // A raw reading below the offset means the counter reset.
        let (Some(rx), Some(tx)) = (raw_rx.checked_sub(offset_rx), raw_tx.checked_sub(offset_tx))
        else {
            return Normalized::Regressed;
        };

        // Only the last accepted sample is the comparison baseline; a
        // regression followed by recovery above it resumes normally.
        if let Some(prev) = last {
            if rx < prev.rx || tx < prev.tx {
                return Normalized::Regressed;
            }
        }

        Normalized::Delta { rx, tx }
    }
}

/// Network sample series with counter normalization applied at the append
/// point. Shared by the single-process and multi-process network probes.
#[derive(Debug, Default)]
pub struct NetworkSeries {
    samples: Vec<NetworkSample>,
    current: NetworkSample,
    baseline: CounterBaseline,
}

impl NetworkSeries {
    /// Normalize a raw cumulative reading and append it, or drop it on
    /// regression. This is the series' single mutation point.
    fn emit(&mut self, collector: &str, raw_rx: u64, raw_tx: u64, tick: f64) {
        match self.baseline.normalize(raw_rx, raw_tx, self.samples.last()) {
            Normalized::First => self.push(NetworkSample { rx: 0, tx: 0, tick }),
            Normalized::Delta { rx, tx } => self.push(NetworkSample { rx, tx, tick }),
            Normalized::Regressed => {
                warn!(collector, raw_rx, raw_tx, "counter regressed, sample dropped");
            }
        }
    }

    fn push(&mut self, sample: NetworkSample) {
        self.samples.push(sample);
        self.current = sample;
    }

    fn datasets(&self) -> Vec<Dataset> {
        vec![
            Dataset {
                name: "DATA RECEIVED".to_string(),
                data: self
                    .samples
                    .iter()
                    .map(|s| DataPoint {
                        tick: s.tick,
                        value: s.rx as f64,
                    })
                    .collect(),
                data_type: DataType::Bytes,
            },
            Dataset {
                name: "DATA SENT".to_string(),
                data: self
                    .samples
                    .iter()
                    .map(|s| DataPoint {
                        tick: s.tick,
                        value: s.tx as f64,
                    })
                    .collect(),
                data_type: DataType::Bytes,
            },
        ]
    }
}

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

/// Collects CPU and memory for a single matched process.
#[derive(Debug, Default)]
pub struct ProcessProbe {
    samples: Vec<ProcessSample>,
    current: ProcessSample,
}

const PROC_COLUMNS: &[Option<&str>] = &[Some("cpu"), Some("mem")];

impl ProcessProbe {
    fn process_chunk(&mut self, collector: &str, chunk: &str, tick: f64) -> Result<(), ProbeError> {
        let lines: Vec<&str> = chunk
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();

        if lines.is_empty() {
            return Ok(());
        }

        // Combining CPU/mem across several matched processes is undefined;
        // more than one line means the process filter is misconfigured.
        if lines.len() > 1 {
            return Err(ProbeError::AmbiguousProcessMatch { lines: lines.len() });
        }

        let fields = parse::split_columns(lines[0], PROC_COLUMNS);

        let cpu = fields
            .get("cpu")
            .and_then(|v| v.trim_end_matches('%').parse::<f64>().ok());

        let Some(cpu) = cpu else {
            warn!(collector, line = lines[0], "cpu column missing or malformed, line skipped");
            return Ok(());
        };

        let mem = parse::parse_bytes(fields.get("mem").copied().unwrap_or(""));

        let sample = ProcessSample { cpu, mem, tick };
        self.samples.push(sample);
        self.current = sample;
        Ok(())
    }

    fn datasets(&self) -> Vec<Dataset> {
        vec![
            Dataset {
                name: "CPU".to_string(),
                data: self
                    .samples
                    .iter()
                    .map(|s| DataPoint {
                        tick: s.tick,
                        value: s.cpu,
                    })
                    .collect(),
                data_type: DataType::Value,
            },
            Dataset {
                name: "MEMORY".to_string(),
                data: self
                    .samples
                    .iter()
                    .map(|s| DataPoint {
                        tick: s.tick,
                        value: s.mem as f64,
                    })
                    .collect(),
                data_type: DataType::Bytes,
            },
        ]
    }
}

/// Column positions of a network counter line.
#[derive(Debug, Clone)]
pub struct NetLayout {
    pub name_field: Option<usize>,
    pub rx_field: usize,
    pub tx_field: usize,
}

impl NetLayout {
    /// `nettop`-style `name rx tx` lines.
    pub fn named() -> Self {
        Self {
            name_field: Some(0),
            rx_field: 1,
            tx_field: 2,
        }
    }

    /// Positional layout with rx/tx at arbitrary fields, other fields skipped
    /// (the `/proc/net/xt_qtaguid/stats` shape).
    pub fn positional(rx_field: usize, tx_field: usize) -> Self {
        Self {
            name_field: None,
            rx_field,
            tx_field,
        }
    }

    fn columns(&self) -> Vec<Option<&'static str>> {
        let len = self
            .rx_field
            .max(self.tx_field)
            .max(self.name_field.unwrap_or(0))
            + 1;

        let mut columns = vec![None; len];
        if let Some(name) = self.name_field {
            columns[name] = Some("name");
        }
        columns[self.rx_field] = Some("rx");
        columns[self.tx_field] = Some("tx");
        columns
    }
}

/// Collects cumulative rx/tx byte counters for one process, normalized into
/// session-relative deltas.
#[derive(Debug)]
pub struct NetworkProbe {
    layout: NetLayout,
    /// Sum all lines of a chunk into one reading instead of emitting per line
    /// (Android's per-tag counter dump spreads one app over several rows).
    sum_lines: bool,
    series: NetworkSeries,
}

impl NetworkProbe {
    pub fn new(layout: NetLayout, sum_lines: bool) -> Self {
        Self {
            layout,
            sum_lines,
            series: NetworkSeries::default(),
        }
    }

    fn process_chunk(&mut self, collector: &str, chunk: &str, tick: f64) {
        let columns = self.layout.columns();
        let mut readings = Vec::new();

        for line in chunk.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let fields = parse::split_columns(line, &columns);
            match (fields.get("rx"), fields.get("tx")) {
                (Some(rx), Some(tx)) => {
                    readings.push((parse::parse_bytes(rx), parse::parse_bytes(tx)));
                }
                _ => warn!(collector, line, "rx/tx columns missing, line skipped"),
            }
        }

        if self.sum_lines {
            if readings.is_empty() {
                return;
            }
            let rx = readings.iter().map(|r| r.0).sum();
            let tx = readings.iter().map(|r| r.1).sum();
            self.series.emit(collector, rx, tx, tick);
        } else {
            for (rx, tx) in readings {
                self.series.emit(collector, rx, tx, tick);
            }
        }
    }
}

/// Merges counters from several OS processes into one logical series.
///
/// Keeps the latest raw reading per process identifier and emits the sum over
/// all known processes on every chunk. Per-process readings are independently
/// cumulative, so the sum is cumulative too and goes through the same
/// [`CounterBaseline`] normalization. Entries are never evicted: a process
/// that exits mid-run keeps contributing its last known reading, and new
/// processes are picked up automatically.
#[derive(Debug, Default)]
pub struct MultiProcessProbe {
    per_process: HashMap<String, (u64, u64)>,
    series: NetworkSeries,
}

const MULTI_COLUMNS: &[Option<&str>] = &[Some("name"), Some("rx"), Some("tx")];

impl MultiProcessProbe {
    fn process_chunk(&mut self, collector: &str, chunk: &str, tick: f64) {
        for line in chunk.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let fields = parse::split_columns(line, MULTI_COLUMNS);
            match (fields.get("name"), fields.get("rx"), fields.get("tx")) {
                (Some(process), Some(rx), Some(tx)) => {
                    self.per_process.insert(
                        (*process).to_string(),
                        (parse::parse_bytes(rx), parse::parse_bytes(tx)),
                    );
                }
                _ => warn!(collector, line, "name/rx/tx columns missing, line skipped"),
            }
        }

        let rx = self.per_process.values().map(|v| v.0).sum();
        let tx = self.per_process.values().map(|v| v.1).sum();
        self.series.emit(collector, rx, tx, tick);
    }
}

/// The closed set of collector behaviors, dispatched by variant.
#[derive(Debug)]
pub enum Probe {
    Process(ProcessProbe),
    Network(NetworkProbe),
    MultiProcessNetwork(MultiProcessProbe),
}

impl Probe {
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Process(_) => MetricKind::Process,
            Self::Network(_) | Self::MultiProcessNetwork(_) => MetricKind::Network,
        }
    }

    fn process_chunk(&mut self, collector: &str, chunk: &str, tick: f64) -> Result<(), ProbeError> {
        match self {
            Self::Process(p) => p.process_chunk(collector, chunk, tick),
            Self::Network(p) => {
                p.process_chunk(collector, chunk, tick);
                Ok(())
            }
            Self::MultiProcessNetwork(p) => {
                p.process_chunk(collector, chunk, tick);
                Ok(())
            }
        }
    }

    fn datasets(&self) -> Vec<Dataset> {
        match self {
            Self::Process(p) => p.datasets(),
            Self::Network(p) => p.series.datasets(),
            Self::MultiProcessNetwork(p) => p.series.datasets(),
        }
    }

    fn samples(&self) -> Vec<SamplePoint> {
        match self {
            Self::Process(p) => p.samples.iter().copied().map(SamplePoint::Process).collect(),
            Self::Network(p) => p
                .series
                .samples
                .iter()
                .copied()
                .map(SamplePoint::Network)
                .collect(),
            Self::MultiProcessNetwork(p) => p
                .series
                .samples
                .iter()
                .copied()
                .map(SamplePoint::Network)
                .collect(),
        }
    }

    fn current(&self) -> SamplePoint {
        match self {
            Self::Process(p) => SamplePoint::Process(p.current),
            Self::Network(p) => SamplePoint::Network(p.series.current),
            Self::MultiProcessNetwork(p) => SamplePoint::Network(p.series.current),
        }
    }

    /// Running cpu/mem sums over the sample history. Zero for network probes.
    fn proc_sums(&self) -> (f64, f64, usize) {
        match self {
            Self::Process(p) => {
                let cpu: f64 = p.samples.iter().map(|s| s.cpu).sum();
                let mem: f64 = p.samples.iter().map(|s| s.mem as f64).sum();
                (cpu, mem, p.samples.len())
            }
            _ => (0.0, 0.0, 0),
        }
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

struct CollectorState {
    name: String,
    probe: Probe,
    started_at: Option<Instant>,
    failure: Option<String>,
}

impl CollectorState {
    /// Elapsed seconds since recording start, 0 before start.
    fn tick(&self) -> f64 {
        self.started_at
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    fn handle_chunk(&mut self, chunk: &str) -> Result<(), ProbeError> {
        let tick = self.tick();
        self.probe.process_chunk(&self.name, chunk, tick)
    }
}

#[derive(Default)]
struct CollectorRuntime {
    source: Option<ShellSource>,
    task: Option<JoinHandle<()>>,
}

/// Owns one metric's time series for one run.
///
/// Created at recorder construction, started when recording begins, frozen
/// when recording ends, then serialized into [`MetricData`]. Never reused
/// across runs. The mutable series state sits behind its own lock so the
/// recorder's live aggregation can read `current()` while the drain task
/// appends.
pub struct Collector {
    name: String,
    kind: MetricKind,
    cmd: String,
    state: Arc<Mutex<CollectorState>>,
    runtime: Mutex<CollectorRuntime>,
}

impl Collector {
    pub fn new(name: impl Into<String>, probe: Probe, cmd: impl Into<String>) -> Self {
        let name = name.into();
        let kind = probe.kind();
        Self {
            name: name.clone(),
            kind,
            cmd: cmd.into(),
            state: Arc::new(Mutex::new(CollectorState {
                name,
                probe,
                started_at: None,
                failure: None,
            })),
            runtime: Mutex::new(CollectorRuntime::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Begin recording: spawn the shell source and drain its chunks.
    ///
    /// Chunks are processed synchronously in arrival order; a fatal probe
    /// error cancels `fatal` to abort the whole run.
    pub fn start(&self, fatal: CancellationToken) -> Result<()> {
        let mut runtime = self.runtime.lock();
        if runtime.task.is_some() {
            bail!("collector {} already started", self.name);
        }

        let (source, mut chunks) = ShellSource::spawn(&self.cmd)?;
        self.state.lock().started_at = Some(Instant::now());

        let state = Arc::clone(&self.state);
        let name = self.name.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = fatal.cancelled() => break,
                    chunk = chunks.recv() => {
                        let Some(chunk) = chunk else {
                            debug!(collector = %name, "output stream ended");
                            break;
                        };

                        let mut state = state.lock();
                        if let Err(e) = state.handle_chunk(chunk.trim()) {
                            error!(collector = %name, error = %e, "fatal chunk error, aborting run");
                            state.failure = Some(e.to_string());
                            drop(state);
                            fatal.cancel();
                            break;
                        }
                    }
                }
            }
        });

        runtime.source = Some(source);
        runtime.task = Some(task);
        Ok(())
    }

    /// Feed one raw output chunk synchronously. The drain task goes through
    /// this same path; it is also the direct entry point for tests.
    pub fn process_chunk(&self, chunk: &str) -> Result<(), ProbeError> {
        self.state.lock().handle_chunk(chunk.trim())
    }

    /// Stop the collector: terminate the subprocess and the drain task.
    /// Idempotent; stopping an already-stopped collector is a no-op.
    pub fn stop(&self) {
        let mut runtime = self.runtime.lock();
        if let Some(mut source) = runtime.source.take() {
            source.terminate();
        }
        if let Some(task) = runtime.task.take() {
            task.abort();
        }
    }

    /// Last emitted sample (zero-valued before the first emission).
    pub fn current(&self) -> SamplePoint {
        self.state.lock().probe.current()
    }

    /// Running cpu/mem sums over the sample history. Zero for network probes.
    pub fn proc_sums(&self) -> (f64, f64, usize) {
        self.state.lock().probe.proc_sums()
    }

    /// Fatal failure message, if a chunk aborted the run.
    pub fn failure(&self) -> Option<String> {
        self.state.lock().failure.clone()
    }

    /// Serializable snapshot of the collector's series and datasets.
    pub fn to_metric_data(&self) -> MetricData {
        let state = self.state.lock();
        MetricData {
            name: self.name.clone(),
            metric: self.kind,
            samples: state.probe.samples(),
            data_sets: state.probe.datasets(),
        }
    }
}
