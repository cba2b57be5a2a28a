//! Run recording: platform collector factories, the recorder lifecycle and
//! the environment doctor.
//!
//! A recorder owns the collectors of one run. `start` spawns every platform
//! subprocess; `stop` freezes the series, computes the run summary and
//! returns the serializable [`RunData`]. Recorders are single-use.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::collector::{
    Collector, MetricData, MultiProcessProbe, NetLayout, NetworkProbe, Probe, ProcessProbe,
    SamplePoint,
};
use crate::parse::{format_bytes, format_duration};
use crate::{report, stats};

/// Android's per-tag counter dump: rx_bytes and tx_bytes column positions.
pub const ANDROID_RX_FIELD: usize = 5;
pub const ANDROID_TX_FIELD: usize = 7;

const SPINNER: [char; 4] = ['|', '/', '-', '\\'];

/// One completed recording, in the persisted report-folder layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunData {
    pub run_id: String,
    pub summary: Option<String>,
    pub name: String,
    pub report_name: String,
    /// Run length in milliseconds; -1 until the run has been stopped.
    pub duration: i64,
    pub metrics: Vec<MetricData>,
}

/// What to record and under which report name.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Process name pattern the platform tools grep for.
    pub process: String,
    /// App name used in artifact file names.
    pub name: String,
    pub report_name: String,
}

/// Start moment of a run: the monotonic clock for tick/duration math and
/// the wall-clock run id minted at the same instant.
#[derive(Clone)]
struct StartStamp {
    at: Instant,
    run_id: String,
}

struct RecorderInner {
    started: Option<StartStamp>,
    stopped: bool,
}

/// Owns the collectors of one recording run.
pub struct Recorder {
    config: RecorderConfig,
    collectors: Arc<Vec<Collector>>,
    fatal: CancellationToken,
    inner: Mutex<RecorderInner>,
}

impl Recorder {
    fn new(config: RecorderConfig, collectors: Vec<Collector>) -> Self {
        Self {
            config,
            collectors: Arc::new(collectors),
            fatal: CancellationToken::new(),
            inner: Mutex::new(RecorderInner {
                started: None,
                stopped: false,
            }),
        }
    }

    /// Build an Android recorder: CPU/memory via `adb shell top`, network via
    /// the per-UID counter dump. Resolves the app's UID over adb first.
    pub async fn android(config: RecorderConfig, package: &str) -> Result<Self> {
        let uid = android_uid(package).await?;
        info!(package, uid, "resolved app uid");

        let collectors = vec![
            Collector::new(
                "proc",
                Probe::Process(ProcessProbe::default()),
                android_proc_cmd(&config.process),
            ),
            Collector::new(
                "net",
                Probe::Network(NetworkProbe::new(
                    NetLayout::positional(ANDROID_RX_FIELD, ANDROID_TX_FIELD),
                    true,
                )),
                android_net_cmd(uid),
            ),
        ];

        Ok(Self::new(config, collectors))
    }

    /// Build an iOS recorder: CPU/memory via `top`, network via `nettop`.
    /// With `webkit` set, browser traffic routed through the out-of-process
    /// WebKit networking daemons is collected and merged as a third metric.
    pub fn ios(config: RecorderConfig, webkit: bool) -> Self {
        let mut collectors = vec![
            Collector::new(
                "proc",
                Probe::Process(ProcessProbe::default()),
                ios_proc_cmd(&config.process),
            ),
            Collector::new(
                "net",
                Probe::Network(NetworkProbe::new(NetLayout::named(), false)),
                ios_net_cmd(&config.process),
            ),
        ];

        if webkit {
            collectors.push(Collector::new(
                "webkit",
                Probe::MultiProcessNetwork(MultiProcessProbe::default()),
                ios_net_cmd("com.apple.Web"),
            ));
        }

        Self::new(config, collectors)
    }

    /// Token cancelled when any collector hits a fatal chunk error.
    pub fn fatal(&self) -> CancellationToken {
        self.fatal.clone()
    }

    /// Start every collector. Fails if called twice.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.started.is_some() {
            bail!("recorder already started");
        }

        for collector in self.collectors.iter() {
            collector.start(self.fatal.clone())?;
        }

        inner.started = Some(StartStamp {
            at: Instant::now(),
            run_id: Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
        });
        info!(
            name = %self.config.name,
            report = %self.config.report_name,
            "recording started"
        );
        Ok(())
    }

    /// Stop the run, freeze all series and produce the run data. Fails if the
    /// run never started, was already stopped, or aborted on a fatal chunk
    /// error.
    pub fn stop(&self) -> Result<RunData> {
        let (duration, run_id) = {
            let mut inner = self.inner.lock();
            let Some(stamp) = inner.started.clone() else {
                bail!("recorder was never started");
            };
            if inner.stopped {
                bail!("recorder already stopped");
            }
            inner.stopped = true;
            (stamp.at.elapsed().as_millis() as i64, stamp.run_id)
        };

        self.fatal.cancel();
        for collector in self.collectors.iter() {
            collector.stop();
        }

        if let Some(failure) = self.collectors.iter().find_map(|c| c.failure()) {
            bail!("recording aborted: {failure}");
        }

        let metrics: Vec<MetricData> =
            self.collectors.iter().map(|c| c.to_metric_data()).collect();
        let totals = stats::compute_totals(&metrics);
        let summary = report::render_run_summary(&self.config.name, duration, &totals);

        Ok(RunData {
            run_id,
            summary: Some(summary),
            name: self.config.name.clone(),
            report_name: self.config.report_name.clone(),
            duration,
            metrics,
        })
    }

    /// One-line live status: spinner, elapsed time, current and average
    /// CPU/memory readings, and rx/tx summed over every network collector.
    /// Rendered once a second while recording interactively.
    pub fn status_line(&self, frame: usize) -> String {
        let elapsed = self
            .inner
            .lock()
            .started
            .as_ref()
            .map(|s| s.at.elapsed().as_millis() as u64)
            .unwrap_or(0);

        let mut line = format!(
            "{} {}",
            SPINNER[frame % SPINNER.len()],
            format_duration(elapsed)
        );

        let mut net_rx = 0.0;
        let mut net_tx = 0.0;
        let mut has_net = false;

        for collector in self.collectors.iter() {
            match collector.current() {
                SamplePoint::Process(s) => {
                    let (cpu_sum, mem_sum, n) = collector.proc_sums();
                    let (cpu_avg, mem_avg) = if n > 0 {
                        (cpu_sum / n as f64, mem_sum / n as f64)
                    } else {
                        (0.0, 0.0)
                    };
                    line.push_str(&format!(
                        " [CPU: {:.1}% avg: {:.1}%] [MEM: {} avg: {}]",
                        s.cpu,
                        cpu_avg,
                        format_bytes(s.mem as f64),
                        format_bytes(mem_avg),
                    ));
                }
                SamplePoint::Network(s) => {
                    has_net = true;
                    net_rx += s.rx as f64;
                    net_tx += s.tx as f64;
                }
            }
        }

        if has_net {
            if !net_rx.is_finite() || !net_tx.is_finite() || net_rx < 0.0 || net_tx < 0.0 {
                warn!(rx = net_rx, tx = net_tx, "implausible live network totals");
            }
            line.push_str(&format!(
                " [RX: {} TX: {}]",
                format_bytes(net_rx),
                format_bytes(net_tx),
            ));
        }

        line
    }
}

// ---------------------------------------------------------------------------
// Platform commands
// ---------------------------------------------------------------------------

fn android_proc_cmd(process: &str) -> String {
    format!(
        "adb shell top -o %CPU,RES,CMDLINE -s 1 -n 10000 -d 1 -b -q | grep --line-buffered {process}"
    )
}

fn android_net_cmd(uid: u32) -> String {
    // The counter file is a one-shot dump, so poll it once a second.
    format!(
        "while true; do adb shell cat /proc/net/xt_qtaguid/stats | grep {uid}; sleep 1; done"
    )
}

fn ios_proc_cmd(process: &str) -> String {
    format!("top -stats cpu,mem,command -c n | grep --line-buffered {process}")
}

fn ios_net_cmd(process: &str) -> String {
    format!("nettop -l 0 -x -J bytes_in,bytes_out | grep --line-buffered {process}")
}

// ---------------------------------------------------------------------------
// Environment doctor
// ---------------------------------------------------------------------------

/// Verify the Android toolchain: exactly one healthy adb device, the counter
/// file's column layout, and that the app's UID resolves.
pub async fn doctor_android(package: &str) -> Result<()> {
    let devices = shell_output("adb devices").await?;
    let device = single_device(&devices)?;
    info!(device, "adb device found");

    let header = shell_output("adb shell head -1 /proc/net/xt_qtaguid/stats").await?;
    check_counter_header(&header)?;
    info!("network counter layout ok");

    let uid = android_uid(package).await?;
    info!(package, uid, "app uid resolved");
    Ok(())
}

/// Verify the iOS (macOS host) toolchain: `top` and `nettop` are on PATH.
pub async fn doctor_ios() -> Result<()> {
    for tool in ["top", "nettop"] {
        shell_output(&format!("command -v {tool}"))
            .await
            .with_context(|| format!("{tool} not found on PATH"))?;
        info!(tool, "found");
    }
    Ok(())
}

/// Resolve an Android app's UID from the package manager dump.
pub async fn android_uid(package: &str) -> Result<u32> {
    let out = shell_output(&format!(
        "adb shell dumpsys package {package} | grep userId="
    ))
    .await?;
    parse_uid(&out).with_context(|| format!("no userId found for package {package}"))
}

async fn shell_output(cmd: &str) -> Result<String> {
    let out = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .await
        .with_context(|| format!("failed to run: {cmd}"))?;

    if !out.status.success() {
        bail!("command failed ({}): {cmd}", out.status);
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

fn parse_uid(out: &str) -> Option<u32> {
    let rest = &out[out.find("userId=")? + "userId=".len()..];
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Expect exactly one attached device in `adb devices` output, in the
/// `device` state.
fn single_device(out: &str) -> Result<String> {
    let devices: Vec<(&str, &str)> = out
        .lines()
        .skip(1)
        .filter_map(|l| {
            let mut fields = l.split_whitespace();
            Some((fields.next()?, fields.next()?))
        })
        .collect();

    match devices.as_slice() {
        [] => bail!("no adb device attached"),
        [(serial, "device")] => Ok((*serial).to_string()),
        [(serial, state)] => bail!("adb device {serial} is {state}, not ready"),
        _ => bail!("{} adb devices attached, expected exactly one", devices.len()),
    }
}

/// Check the counter dump header still has rx_bytes/tx_bytes at the expected
/// positions.
fn check_counter_header(header: &str) -> Result<()> {
    let fields: Vec<&str> = header.split_whitespace().collect();

    let rx = fields.get(ANDROID_RX_FIELD).copied().unwrap_or("");
    let tx = fields.get(ANDROID_TX_FIELD).copied().unwrap_or("");

    if rx != "rx_bytes" || tx != "tx_bytes" {
        bail!(
            "unexpected counter column layout: field {ANDROID_RX_FIELD} is {rx:?}, \
             field {ANDROID_TX_FIELD} is {tx:?}"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uid() {
        assert_eq!(parse_uid("    userId=10054 gids=[3003]"), Some(10054));
        assert_eq!(parse_uid("no uid here"), None);
        assert_eq!(parse_uid("userId=abc"), None);
    }

    #[test]
    fn test_single_device_happy_path() {
        let out = "List of devices attached\nemulator-5554\tdevice\n\n";
        assert_eq!(single_device(out).expect("one device"), "emulator-5554");
    }

    #[test]
    fn test_single_device_none_attached() {
        let err = single_device("List of devices attached\n\n").expect_err("no device");
        assert!(err.to_string().contains("no adb device"));
    }

    #[test]
    fn test_single_device_offline() {
        let out = "List of devices attached\nemulator-5554\toffline\n";
        let err = single_device(out).expect_err("offline");
        assert!(err.to_string().contains("offline"));
    }

    #[test]
    fn test_single_device_multiple() {
        let out = "List of devices attached\na\tdevice\nb\tdevice\n";
        let err = single_device(out).expect_err("two devices");
        assert!(err.to_string().contains("expected exactly one"));
    }

    #[test]
    fn test_check_counter_header() {
        let ok = "idx iface acct_tag_hex uid_tag_int cnt_set rx_bytes rx_packets tx_bytes tx_packets";
        check_counter_header(ok).expect("expected layout");

        let moved = "idx iface acct_tag_hex uid_tag_int cnt_set rx_packets rx_bytes tx_bytes tx";
        assert!(check_counter_header(moved).is_err());
    }

    #[test]
    fn test_android_commands_reference_inputs() {
        assert!(android_proc_cmd("myapp").contains("grep --line-buffered myapp"));
        assert!(android_net_cmd(10054).contains("grep 10054"));
        assert!(android_net_cmd(10054).contains("xt_qtaguid/stats"));
    }

    #[test]
    fn test_ios_commands_reference_inputs() {
        assert!(ios_proc_cmd("MyApp").contains("grep --line-buffered MyApp"));
        assert!(ios_net_cmd("MyApp").contains("nettop"));
    }

    #[test]
    fn test_run_data_serializes_camel_case() {
        let data = RunData {
            run_id: "2024-01-01T00:00:00".to_string(),
            summary: None,
            name: "app".to_string(),
            report_name: "baseline".to_string(),
            duration: -1,
            metrics: Vec::new(),
        };

        let json = serde_json::to_value(&data).expect("serialize");
        assert_eq!(json["runId"], "2024-01-01T00:00:00");
        assert_eq!(json["reportName"], "baseline");
        assert_eq!(json["duration"], -1);
    }

    #[tokio::test]
    async fn test_stop_before_start_fails() {
        let recorder = Recorder::ios(
            RecorderConfig {
                process: "app".to_string(),
                name: "app".to_string(),
                report_name: "r".to_string(),
            },
            false,
        );
        assert!(recorder.stop().is_err());
    }

    #[tokio::test]
    async fn test_stop_is_single_use() {
        let recorder = Recorder::new(
            RecorderConfig {
                process: "app".to_string(),
                name: "app".to_string(),
                report_name: "r".to_string(),
            },
            Vec::new(),
        );

        recorder.start().expect("start");
        let data = recorder.stop().expect("first stop");
        assert!(data.duration >= 0);
        assert!(recorder.stop().is_err());
        assert!(recorder.start().is_err());
    }

    #[tokio::test]
    async fn test_status_line_has_spinner_and_elapsed() {
        let recorder = Recorder::new(
            RecorderConfig {
                process: "app".to_string(),
                name: "app".to_string(),
                report_name: "r".to_string(),
            },
            Vec::new(),
        );
        recorder.start().expect("start");

        let line = recorder.status_line(1);
        assert!(line.starts_with("/ 00:00:00"));
    }

    #[tokio::test]
    async fn test_status_line_sums_network_collectors() {
        let app = Collector::new(
            "net",
            Probe::Network(NetworkProbe::new(NetLayout::named(), false)),
            "true",
        );
        app.process_chunk("app 0 0").expect("offset");
        app.process_chunk("app 300 200").expect("delta");

        let web = Collector::new(
            "webkit",
            Probe::MultiProcessNetwork(MultiProcessProbe::default()),
            "true",
        );
        web.process_chunk("W1 0 0").expect("offset");
        web.process_chunk("W1 200 100").expect("delta");

        let recorder = Recorder::new(
            RecorderConfig {
                process: "app".to_string(),
                name: "app".to_string(),
                report_name: "r".to_string(),
            },
            vec![app, web],
        );

        let line = recorder.status_line(0);
        assert!(
            line.contains("[RX: 500 Bytes TX: 300 Bytes]"),
            "line: {line}"
        );
        assert_eq!(line.matches("[RX:").count(), 1);
    }

    #[tokio::test]
    async fn test_run_id_minted_at_start() {
        let recorder = Recorder::new(
            RecorderConfig {
                process: "app".to_string(),
                name: "app".to_string(),
                report_name: "r".to_string(),
            },
            Vec::new(),
        );

        let before = Utc::now().timestamp();
        recorder.start().expect("start");
        tokio::time::sleep(std::time::Duration::from_millis(2100)).await;
        let run = recorder.stop().expect("stop");

        let minted = chrono::NaiveDateTime::parse_from_str(&run.run_id, "%Y-%m-%dT%H:%M:%S")
            .expect("run id is a timestamp")
            .and_utc()
            .timestamp();

        // The id reflects the start moment, not the stop two seconds later.
        assert!(minted - before <= 1, "run id minted {}s after start", minted - before);
        assert!(run.duration >= 2000);
    }
}
