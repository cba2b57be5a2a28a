//! Blackbox pipeline test: collectors fed by real subprocesses, run data
//! saved to disk, then reloaded and aggregated as a session.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use appmeter::collector::{
    Collector, NetLayout, NetworkProbe, Probe, ProcessProbe, SamplePoint,
};
use appmeter::recorder::RunData;
use appmeter::{report, stats};

fn proc_collector(cmd: &str) -> Collector {
    Collector::new("proc", Probe::Process(ProcessProbe::default()), cmd)
}

fn net_collector(cmd: &str) -> Collector {
    Collector::new(
        "net",
        Probe::Network(NetworkProbe::new(NetLayout::named(), false)),
        cmd,
    )
}

#[tokio::test]
async fn test_run_round_trip_through_session_stats() {
    // Separate writes with a pause so each sample arrives as its own chunk.
    let proc = proc_collector(
        "printf '10.0 40M app\\n'; sleep 0.2; printf '20.0 60M app\\n'; sleep 2",
    );
    let net = net_collector(
        "printf 'app 1000 500\\n'; sleep 0.2; printf 'app 1500 800\\n'; sleep 2",
    );

    let fatal = CancellationToken::new();
    proc.start(fatal.clone()).expect("start proc");
    net.start(fatal.clone()).expect("start net");

    tokio::time::sleep(Duration::from_millis(700)).await;
    proc.stop();
    net.stop();

    let metrics = vec![proc.to_metric_data(), net.to_metric_data()];

    let proc_samples = &metrics[0].samples;
    assert_eq!(proc_samples.len(), 2, "proc samples: {proc_samples:?}");

    let net_samples: Vec<_> = metrics[1]
        .samples
        .iter()
        .map(|s| match s {
            SamplePoint::Network(n) => (n.rx, n.tx),
            other => panic!("expected network sample, got {other:?}"),
        })
        .collect();
    assert_eq!(net_samples, vec![(0, 0), (500, 300)]);

    let totals = stats::compute_totals(&metrics);
    assert_eq!(totals.cpu_avg, 15.0);
    assert_eq!(totals.cpu_max, 20.0);
    assert_eq!(totals.mem_max, 60.0 * 1024.0 * 1024.0);
    assert_eq!(totals.rx_total, 500.0);
    assert_eq!(totals.tx_total, 300.0);

    let run = RunData {
        run_id: "2024-01-01T00:00:00".to_string(),
        summary: Some(report::render_run_summary("app", 700, &totals)),
        name: "app".to_string(),
        report_name: "baseline".to_string(),
        duration: 700,
        metrics,
    };

    let dir = tempfile::tempdir().expect("tempdir");
    let data_path = report::save_run(&run, dir.path()).expect("save run");
    assert!(data_path.exists());

    let rendered = std::fs::read_to_string(
        dir.path().join("app_2024-01-01T00:00:00_report.md"),
    )
    .expect("read report");
    assert!(rendered.contains("```chart"));
    assert!(rendered.contains("## DATA RECEIVED (net)"));

    let session = stats::load_session(dir.path()).expect("load session");
    assert_eq!(session.runs, 1);
    assert_eq!(session.cpu_avg.avg, 15.0);
    assert_eq!(session.rx_total.avg, 500.0);
}

#[tokio::test]
async fn test_ambiguous_process_match_cancels_run() {
    // Two matching process lines in one chunk is unrecoverable.
    let proc = proc_collector("printf '10.0 40M a\\n20.0 60M b\\n'; sleep 2");

    let fatal = CancellationToken::new();
    proc.start(fatal.clone()).expect("start proc");

    tokio::time::timeout(Duration::from_secs(2), fatal.cancelled())
        .await
        .expect("fatal token should cancel");

    proc.stop();
    let failure = proc.failure().expect("failure recorded");
    assert!(failure.contains("ambiguous"), "failure: {failure}");
}

#[tokio::test]
async fn test_sessions_compare_end_to_end() {
    let dir_base = tempfile::tempdir().expect("tempdir");
    let dir_variation = tempfile::tempdir().expect("tempdir");

    for (dir, cpu) in [(&dir_base, "10.0"), (&dir_variation, "30.0")] {
        let proc = proc_collector(&format!("printf '{cpu} 40M app\\n'; sleep 2"));
        let fatal = CancellationToken::new();
        proc.start(fatal).expect("start proc");
        tokio::time::sleep(Duration::from_millis(300)).await;
        proc.stop();

        let run = RunData {
            run_id: "2024-01-01T00:00:00".to_string(),
            summary: None,
            name: "app".to_string(),
            report_name: "session".to_string(),
            duration: 300,
            metrics: vec![proc.to_metric_data()],
        };
        report::save_run(&run, dir.path()).expect("save run");
    }

    let base = stats::load_session(dir_base.path()).expect("load base");
    let variation = stats::load_session(dir_variation.path()).expect("load variation");

    let rows = stats::compare_sessions(&base, &variation);
    let cpu_row = &rows[0];
    assert_eq!(cpu_row.base, 10.0);
    assert_eq!(cpu_row.variation, 30.0);
    assert!(cpu_row.emphasized);

    let rendered = report::render_comparison("base", "variation", &rows);
    assert!(rendered.contains("| CPU |"));
}
