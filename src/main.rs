use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::time::MissedTickBehavior;
use tracing_subscriber::{fmt, EnvFilter};

use appmeter::recorder::{self, Recorder, RecorderConfig};
use appmeter::{report, stats};

/// Mobile app resource profiler: CPU, memory and network sampling.
#[derive(Parser)]
#[command(name = "appmeter", about)]
struct Cli {
    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record a run of an Android app over adb.
    RecordAndroid {
        /// Package id, e.g. com.example.app.
        #[arg(long)]
        package: String,

        /// Process name pattern to match; defaults to the package id.
        #[arg(long)]
        process: Option<String>,

        /// App name used in artifact file names; defaults to the package id.
        #[arg(long)]
        name: Option<String>,

        /// Report (session) name; runs of one session share it.
        #[arg(long)]
        report: String,

        /// Session folder to write artifacts into; defaults to ./<report>.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Record a run of an iOS app (run on the macOS host).
    RecordIos {
        /// Process name pattern to match.
        #[arg(long)]
        process: String,

        /// App name used in artifact file names; defaults to the process.
        #[arg(long)]
        name: Option<String>,

        /// Report (session) name; runs of one session share it.
        #[arg(long)]
        report: String,

        /// Also collect traffic of the out-of-process WebKit daemons.
        #[arg(long)]
        webkit: bool,

        /// Session folder to write artifacts into; defaults to ./<report>.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Aggregate all runs of a session folder into one report.
    SessionReport {
        /// Session folder holding *_data.json runs.
        dir: PathBuf,
    },

    /// Compare two session folders, baseline vs variation.
    SessionCompare {
        base: PathBuf,
        variation: PathBuf,
    },

    /// Check the Android toolchain (adb device, counter layout, app uid).
    DoctorAndroid {
        #[arg(long)]
        package: String,
    },

    /// Check the iOS toolchain (top and nettop on PATH).
    DoctorIos,

    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Command::Version = &cli.command {
        println!("appmeter {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cli.command).await })
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::RecordAndroid {
            package,
            process,
            name,
            report,
            out,
        } => {
            let out = out.unwrap_or_else(|| PathBuf::from(&report));
            let config = RecorderConfig {
                process: process.unwrap_or_else(|| package.clone()),
                name: name.unwrap_or_else(|| package.clone()),
                report_name: report,
            };
            let recorder = Recorder::android(config, &package).await?;
            record(recorder, &out).await
        }

        Command::RecordIos {
            process,
            name,
            report,
            webkit,
            out,
        } => {
            let out = out.unwrap_or_else(|| PathBuf::from(&report));
            let config = RecorderConfig {
                name: name.unwrap_or_else(|| process.clone()),
                process,
                report_name: report,
            };
            record(Recorder::ios(config, webkit), &out).await
        }

        Command::SessionReport { dir } => {
            let session = stats::load_session(&dir)?;
            print!(
                "{}",
                report::render_session_report(&folder_name(&dir), &session)
            );
            Ok(())
        }

        Command::SessionCompare { base, variation } => {
            let base_stats = stats::load_session(&base)?;
            let variation_stats = stats::load_session(&variation)?;
            let rows = stats::compare_sessions(&base_stats, &variation_stats);
            print!(
                "{}",
                report::render_comparison(&folder_name(&base), &folder_name(&variation), &rows)
            );
            Ok(())
        }

        Command::DoctorAndroid { package } => {
            recorder::doctor_android(&package).await?;
            println!("android toolchain ok");
            Ok(())
        }

        Command::DoctorIos => {
            recorder::doctor_ios().await?;
            println!("ios toolchain ok");
            Ok(())
        }

        Command::Version => Ok(()),
    }
}

/// Record until ctrl-c or a fatal collector error, then save the run.
async fn record(recorder: Recorder, out: &std::path::Path) -> Result<()> {
    recorder.start()?;
    let fatal = recorder.fatal();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    // Redraw the live status line once a second.
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut frame = 0usize;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("received SIGINT, stopping recording");
                break;
            }
            _ = fatal.cancelled() => break,
            _ = interval.tick() => {
                print!("\r{}", recorder.status_line(frame));
                std::io::stdout().flush().ok();
                frame += 1;
            }
        }
    }
    println!();

    let run = recorder.stop()?;
    if let Some(summary) = &run.summary {
        println!("{summary}");
    }

    let path = report::save_run(&run, out)?;
    println!("saved {}", path.display());
    Ok(())
}

fn folder_name(dir: &std::path::Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string())
}
