//! `scanwatch` -- follow scan jobs live from the terminal.
//!
//! `scanwatch watch <job-id>` follows one job until it finishes and its
//! output has gone quiet. `scanwatch list --consumer <id>` keeps a table
//! of every job visible to a consumer.
//!
//! # Environment variables
//!
//! Connection and timing settings come from the environment (a `.env`
//! file is loaded first); see `SyncConfig::from_env`. `RUST_LOG`
//! overrides the log filter and `LOG_FORMAT=json` switches logs to JSON.
//! Logs go to stderr, job output to stdout.
//!
//! # Exit codes
//!
//! | Code  | Meaning                          |
//! |-------|----------------------------------|
//! | `0`   | Job finished                     |
//! | `1`   | Startup error                    |
//! | `2`   | Job does not exist               |
//! | `130` | Interrupted                      |

mod render;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scanwatch_sync::{ListSession, ScanApi, ScanSession, SyncConfig, SyncEvent, WsConnector};

use render::{render_list, JobPrinter};

/// Follow scan jobs live.
#[derive(Parser, Debug)]
#[command(name = "scanwatch", version, long_about = None)]
struct Cli {
    /// REST API base URL (overrides SCANWATCH_API_URL)
    #[arg(long = "api-url", global = true)]
    api_url: Option<String>,

    /// Push endpoint base URL (overrides SCANWATCH_WS_URL)
    #[arg(long = "ws-url", global = true)]
    ws_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow one job until it finishes
    Watch {
        /// Job identifier
        job_id: String,
    },
    /// Keep a live table of every job visible to a consumer
    List {
        /// Consumer identity the push stream is addressed to
        #[arg(long = "consumer")]
        consumer: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "scanwatch failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scanwatch_sync=info,scanwatch=info".into()),
        )
        .with(json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        }))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = SyncConfig::from_env().context("Invalid configuration")?;
    if let Some(api_url) = cli.api_url {
        config.api_url = api_url;
    }
    if let Some(ws_url) = cli.ws_url {
        config.ws_url = ws_url;
    }

    tracing::info!(
        api_url = %config.api_url,
        ws_url = %config.ws_url,
        poll_interval_secs = config.poll_interval.as_secs(),
        "Starting scanwatch",
    );

    let connector = Arc::new(WsConnector::new(config.ws_url.clone()));
    let source = Arc::new(ScanApi::new(config.api_url.clone()));

    match cli.command {
        Command::Watch { job_id } => watch(config, job_id, connector, source).await,
        Command::List { consumer } => list(config, consumer, connector, source).await,
    }
}

async fn watch(
    config: SyncConfig,
    job_id: String,
    connector: Arc<WsConnector>,
    source: Arc<ScanApi>,
) -> anyhow::Result<ExitCode> {
    let mut handle = ScanSession::spawn(config, job_id, connector, source);
    let mut events = handle.events();
    let mut job = handle.subscribe();
    let mut printer = JobPrinter::default();
    let mut job_open = true;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            changed = job.changed(), if job_open => {
                if changed.is_err() {
                    job_open = false;
                    continue;
                }
                let snapshot = job.borrow_and_update().clone();
                print_lines(printer.render(&snapshot));
            }
            event = events.recv() => match event {
                Ok(SyncEvent::TransitionRequested) => {
                    print_lines(printer.render(&handle.job()));
                    println!("[{}] finished: {}", handle.job_id(), handle.job().status);
                    return Ok(ExitCode::SUCCESS);
                }
                Ok(SyncEvent::NotFound) => {
                    eprintln!("scan {} not found", handle.job_id());
                    return Ok(ExitCode::from(2));
                }
                Ok(event) => report(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event receiver lagged");
                }
                Err(RecvError::Closed) => return Ok(ExitCode::SUCCESS),
            },
            _ = &mut ctrl_c => {
                handle.shutdown().await;
                return Ok(ExitCode::from(130));
            }
        }
    }
}

async fn list(
    config: SyncConfig,
    consumer: String,
    connector: Arc<WsConnector>,
    source: Arc<ScanApi>,
) -> anyhow::Result<ExitCode> {
    let mut handle = ListSession::spawn(config, consumer, connector, source);
    let mut events = handle.events();
    let mut jobs = handle.subscribe();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            changed = jobs.changed() => {
                if changed.is_err() {
                    return Ok(ExitCode::SUCCESS);
                }
                let snapshot = jobs.borrow_and_update().clone();
                println!("--- {} jobs", snapshot.len());
                print_lines(render_list(&snapshot));
            }
            event = events.recv() => match event {
                Ok(event) => report(&event),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return Ok(ExitCode::SUCCESS),
            },
            _ = &mut ctrl_c => {
                handle.shutdown().await;
                return Ok(ExitCode::from(130));
            }
        }
    }
}

/// Link indicators on stderr so they never interleave with job output.
fn report(event: &SyncEvent) {
    match event {
        SyncEvent::Reconnecting { attempt, delay } => {
            eprintln!("reconnecting (attempt {attempt}, in {}ms)...", delay.as_millis());
        }
        SyncEvent::Connected => eprintln!("live"),
        SyncEvent::Degraded => {
            eprintln!("!! live updates unavailable, refreshing every poll interval");
        }
        _ => {}
    }
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{line}");
    }
}
