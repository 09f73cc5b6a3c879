//! s3mirror CLI - reliable bulk object mirroring
//!
//! `serve` runs the HTTP API with the transfer workers, `run` mirrors one
//! location to another and waits, `plan` prints what a run would copy.

use clap::Parser;
use s3mirror::api::ApiServer;
use s3mirror::config::{CliArgs, Commands, LogFormat, MirrorConfig};
use s3mirror::error::{MirrorError, Result};
use s3mirror::mirror::{JobHandle, JobStatus, MirrorService, Plan, TransferRequest};
use s3mirror::progress::{ProgressReporter, ProgressSummary, SimpleProgress};
use s3mirror::storage::StorageLocation;
use std::io::IsTerminal;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Parse CLI arguments
    let args = CliArgs::parse();

    init_logging(&args);

    // Handle result
    match run(args).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn init_logging(args: &CliArgs) {
    let level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("s3mirror={}", level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match args.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Returns the process exit code
async fn run(args: CliArgs) -> Result<i32> {
    let config = MirrorConfig::from_cli(&args)?;

    if args.verbose > 0 {
        print_config(&config);
    }

    match &args.command {
        Commands::Serve { .. } => cmd_serve(config).await,
        Commands::Run {
            source,
            destination,
            keys,
            job_id,
            poll_interval,
            no_progress,
        } => {
            let request = transfer_request(source, destination, keys.clone())?;
            let poll_interval = humantime::parse_duration(poll_interval)
                .map_err(|e| MirrorError::config(format!("Invalid poll interval: {}", e)))?;
            let display = if *no_progress || args.quiet {
                Display::Hidden
            } else if std::io::stdout().is_terminal() {
                Display::Bars(ProgressReporter::new())
            } else {
                Display::Lines(SimpleProgress::new())
            };
            cmd_run(config, request, job_id.clone(), poll_interval, display, args.quiet).await
        }
        Commands::Plan {
            source,
            destination,
            keys,
            json,
        } => {
            let request = transfer_request(source, destination, keys.clone())?;
            cmd_plan(config, request, *json).await
        }
    }
}

fn transfer_request(source: &str, destination: &str, keys: Option<Vec<String>>) -> Result<TransferRequest> {
    Ok(TransferRequest {
        source: StorageLocation::parse(source)?,
        destination: StorageLocation::parse(destination)?,
        explicit_keys: keys,
    })
}

async fn cmd_serve(config: MirrorConfig) -> Result<i32> {
    let server_config = config.server.clone();
    let service = MirrorService::open(config).await?;
    let recovered = service.start_workers().await?;
    if recovered > 0 {
        tracing::info!(recovered, "resumed unfinished transfers");
    }

    let server = ApiServer::new(server_config, service.clone());
    let listener = server.bind().await?;
    println!("s3mirror API listening on http://{}", listener.local_addr().map_err(|e| MirrorError::io("listener", e))?);
    println!("Press Ctrl+C to stop.");

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received");
        }
        shutdown.cancel();
    });

    server.serve(listener).await?;
    service.shutdown().await;
    Ok(0)
}

/// How `run` shows progress
enum Display {
    Bars(ProgressReporter),
    Lines(SimpleProgress),
    Hidden,
}

impl Display {
    fn update(&self, status: &JobStatus) {
        match self {
            Self::Bars(reporter) => reporter.update(status),
            Self::Lines(progress) => progress.update(status),
            Self::Hidden => {}
        }
    }

    fn finish(&self, status: &JobStatus) {
        match self {
            Self::Bars(reporter) => reporter.finish(status),
            Self::Lines(progress) => progress.finish(status),
            Self::Hidden => {}
        }
    }
}

async fn cmd_run(
    config: MirrorConfig,
    request: TransferRequest,
    job_id: Option<String>,
    poll_interval: Duration,
    display: Display,
    quiet: bool,
) -> Result<i32> {
    let durable = config.state_dir.is_some();
    let service = MirrorService::open(config).await?;
    let started = Instant::now();

    let job = match job_id {
        Some(id) => {
            service
                .coordinator()
                .start_with_handle(JobHandle::from_string(id), request)
                .await?
        }
        None => service.coordinator().start(request).await?,
    };
    if !quiet {
        eprintln!("Job: {}", job);
    }

    let recovered = service.start_workers().await?;
    tracing::debug!(recovered, job = %job, "workers started");

    let watched = tokio::select! {
        status = service.status().watch(&job, poll_interval, |status| display.update(status)) => Some(status?),
        _ = tokio::signal::ctrl_c() => None,
    };

    let status = match watched {
        Some(status) => status,
        None => {
            service.shutdown().await;
            if durable {
                eprintln!("Interrupted. Resume with: s3mirror run --job-id {} ...", job);
            } else {
                eprintln!("Interrupted.");
            }
            return Ok(130);
        }
    };

    display.finish(&status);
    service.shutdown().await;

    if !quiet {
        println!();
        ProgressSummary::new(&status, started.elapsed()).print();
        for error in &status.errors {
            println!("  {}: {}", error.key, error.error);
        }
    }

    Ok(if status.has_errors() { 1 } else { 0 })
}

async fn cmd_plan(config: MirrorConfig, request: TransferRequest, json: bool) -> Result<i32> {
    let service = MirrorService::open(config).await?;
    let plan = service.coordinator().plan(&request).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print_plan(&request, &plan);
    }
    Ok(0)
}

fn print_plan(request: &TransferRequest, plan: &Plan) {
    println!("=== Plan ===");
    println!("Source:      {}", request.source);
    println!("Destination: {}", request.destination);
    println!("To copy:     {} objects ({})",
        plan.candidates.len(),
        humansize::format_size(plan.total_bytes(), humansize::BINARY)
    );
    println!("Skipped:     {} already present", plan.skipped.len());
    println!();
    for candidate in &plan.candidates {
        println!("{:>6}  {:>10}  {}",
            candidate.index,
            humansize::format_size(candidate.size_bytes, humansize::BINARY),
            candidate.key
        );
    }
}

fn print_config(config: &MirrorConfig) {
    eprintln!("=== Configuration ===");
    eprintln!("Backend:     {}", config.backend);
    match &config.state_dir {
        Some(dir) => eprintln!("State:       {}", dir.display()),
        None => eprintln!("State:       in memory"),
    }
    eprintln!("Concurrency: {} global, {} per worker",
        config.limits.global_concurrency, config.limits.worker_concurrency);
    eprintln!("Parts:       {} x {}",
        config.limits.max_parallel_parts,
        humansize::format_size(config.limits.part_size, humansize::BINARY)
    );
    eprintln!("Attempts:    {} listing, {} transfer",
        config.retry.list_attempts, config.retry.transfer_attempts);
}
