mod config;
mod controller;
mod shell;

use anyhow::Context;
use clap::{Parser, Subcommand};
use controller::{params_map, parse_param, print_report, Console};
use fleet_runtime::monitor_sync::AlignOutcome;
use fleet_runtime::session::RELEASE_TIMEOUT;
use fleet_runtime::BatchReport;
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex as StdMutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleet-console")]
#[command(about = "Operator console for a robot fleet", long_about = None)]
struct Cli {
    /// Backend base URL
    #[arg(long)]
    backend_url: Option<String>,
    /// Maximum robots operated on at once (1-100)
    #[arg(long)]
    parallelism: Option<usize>,
    /// Snapshot poll interval in milliseconds
    #[arg(long)]
    poll_ms: Option<u64>,
    /// TOML config file (default: ./fleet.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the fleet and every change until interrupted
    Watch,
    /// Run checks on robots
    Test {
        ids: Vec<String>,
        #[arg(long)]
        all: bool,
        /// Only these checks, comma separated
        #[arg(long, value_delimiter = ',')]
        checks: Vec<String>,
    },
    /// Reachability sweep
    Online {
        ids: Vec<String>,
        #[arg(long)]
        all: bool,
        /// Bypass the backend's cached probe results
        #[arg(long)]
        force: bool,
    },
    /// Run a remediation and merge its post-fix checks
    Fix {
        fix_id: String,
        ids: Vec<String>,
        #[arg(long)]
        all: bool,
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,
    },
    /// Interactive command session on one robot
    Shell { robot_id: String },
    /// Align the backend monitor with a fleet parallelism
    Monitor {
        #[arg(long)]
        parallelism: usize,
    },
}

struct LogGuard {
    file: Option<Arc<StdMutex<std::fs::File>>>,
}

struct MultiWriter {
    stderr_enabled: bool,
    file: Option<Arc<StdMutex<std::fs::File>>>,
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stderr_enabled {
            let _ = io::stderr().write_all(buf);
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stderr_enabled {
            let _ = io::stderr().flush();
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn init_logging() -> Option<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config::resolve_log_level()));
    let guard = match open_log_file(&config::resolve_log_dir()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let stderr_enabled = config::resolve_log_stdout();
    let make_writer = BoxMakeWriter::new(move || MultiWriter {
        stderr_enabled,
        file: file.clone(),
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

fn open_log_file(dir: &Path) -> io::Result<LogGuard> {
    if dir.as_os_str().is_empty() {
        return Ok(LogGuard { file: None });
    }
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("fleet-console-{}.log", std::process::id()));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(StdMutex::new(file))),
    })
}

fn exit_for(report: &BatchReport) -> ExitCode {
    print_report(report);
    if report.failed.is_empty() && report.cancelled.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let _log_guard = init_logging();

    let overrides = config::Overrides {
        backend_url: cli.backend_url,
        parallelism: cli.parallelism,
        poll_ms: cli.poll_ms,
        config: cli.config,
    };
    let runtime_config = config::load_config(&overrides).context("invalid configuration")?;
    let console = Console::build(&runtime_config)?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(event = "interrupt_received");
                shutdown.cancel();
            }
        }
    });

    let code = match cli.command {
        Commands::Watch => {
            console.watch(&shutdown).await?;
            ExitCode::SUCCESS
        }
        Commands::Test { ids, all, checks } => {
            console.load().await?;
            let targets = console.select_targets(&ids, all)?;
            let checks = (!checks.is_empty()).then_some(checks);
            let task = console.ops.run_tests(targets.clone(), checks);
            let report = console.wait_batch(task, &shutdown).await?;
            console.print_robots(targets, true);
            exit_for(&report)
        }
        Commands::Online { ids, all, force } => {
            console.load().await?;
            let targets = console.select_targets(&ids, all)?;
            let task = console.ops.check_online(targets.clone(), force);
            let report = console.wait_batch(task, &shutdown).await?;
            console.print_robots(targets, false);
            exit_for(&report)
        }
        Commands::Fix {
            fix_id,
            ids,
            all,
            params,
        } => {
            console.load().await?;
            let targets = console.select_targets(&ids, all)?;
            let task = console.ops.run_fix(fix_id, targets.clone(), params_map(params));
            let report = console.wait_batch(task, &shutdown).await?;
            console.print_robots(targets, true);
            exit_for(&report)
        }
        Commands::Shell { robot_id } => {
            console.load().await?;
            shell::run(&console, &robot_id, &shutdown).await?;
            ExitCode::SUCCESS
        }
        Commands::Monitor { parallelism } => match console.ops.set_parallelism(parallelism).await {
            (_, AlignOutcome::Applied(applied)) | (_, AlignOutcome::Unchanged(applied)) => {
                println!("monitor parallelism: {applied}");
                ExitCode::SUCCESS
            }
            (requested, AlignOutcome::Queued) => {
                println!("monitor parallelism {requested} queued");
                ExitCode::SUCCESS
            }
            (requested, AlignOutcome::Failed(reason)) => {
                warn!(event = "monitor_align_failed", requested, reason = %reason);
                eprintln!("could not set monitor parallelism to {requested}: {reason}");
                ExitCode::FAILURE
            }
        },
    };
    console.sessions.release_all(RELEASE_TIMEOUT).await;
    Ok(code)
}
