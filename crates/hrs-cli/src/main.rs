use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use hrs_core::TaskStatus;
use hrs_storage::RateBudgetSnapshot;
use hrs_sync::{ChallengeResolver, HotelSelection, QuotaPlan, RunSummary, SamplingPipeline};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "hrs")]
#[command(about = "Stratified hotel review sampler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Probe the site and print the expected hotel breakdown.
    Check,
    /// Materialize and run the hotel quota plan.
    Plan(PlanArgs),
    /// Collect reviews for known hotels.
    Reviews(ReviewArgs),
    /// Task counts by status and type.
    Status,
    /// Re-submit terminally failed tasks and run them.
    RetryFailed,
    /// Cancel pending work for a region.
    Cancel {
        #[arg(long)]
        region: String,
    },
}

#[derive(Debug, Args)]
struct PlanArgs {
    #[arg(long, conflicts_with = "all", required_unless_present = "all")]
    region: Option<String>,
    #[arg(long)]
    all: bool,
    /// Fetch hotel lists only; no review tasks.
    #[arg(long)]
    hotels_only: bool,
    /// Print the plan without running it.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct ReviewArgs {
    #[arg(long, conflicts_with = "all", required_unless_present = "all")]
    hotel_id: Option<String>,
    #[arg(long)]
    all: bool,
}

/// Asks the operator on the terminal to solve the captcha.
struct TerminalResolver;

impl ChallengeResolver for TerminalResolver {
    fn resolve(&self, budget: RateBudgetSnapshot) -> bool {
        let mut stderr = io::stderr().lock();
        let _ = writeln!(
            stderr,
            "\nchallenge detected (seen {}, cooldown x{}). Solve it in a browser, then press Enter to resume or type 'abort': ",
            budget.challenges_seen, budget.cooldown_multiplier
        );
        let _ = stderr.flush();
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => false,
            Ok(_) => !line.trim().eq_ignore_ascii_case("abort"),
        }
    }
}

fn print_plan(plan: &QuotaPlan) {
    println!("expected hotels: {}", plan.allocated());
    for (region, count) in plan.by_region() {
        println!("  {region}: {count}");
    }
}

fn print_summary(summary: &RunSummary) -> ExitCode {
    let report = &summary.report;
    println!(
        "run complete: run_id={} scope={} tasks_created={} hotels={} reviews={} reports={}",
        summary.run_id,
        summary.scope,
        summary.materialized,
        report.hotels_accepted,
        summary.pool.reviews_stored,
        summary.reports_dir
    );
    for status in TaskStatus::ALL {
        let count = report.stats.count(status);
        if count > 0 {
            println!("  {status}: {count}");
        }
    }
    if summary.aborted {
        eprintln!("run aborted; remaining work was cancelled");
    }
    if summary.has_terminal_failures() {
        eprintln!("{} task(s) failed terminally", report.terminal_failures.len());
    }
    if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let pipeline = hrs_sync::pipeline_from_env()
        .await?
        .with_resolver(Arc::new(TerminalResolver));

    let code = match cli.command {
        Commands::Check => {
            let report = pipeline.check().await?;
            match (&report.status, &report.failure) {
                (_, Some(failure)) => println!("{} unreachable: {failure}", report.probe_url),
                (Some(status), None) => println!("{} reachable: HTTP {status} in {}ms", report.probe_url, report.elapsed_ms),
                (None, None) => println!("{} reachable", report.probe_url),
            }
            print_plan(&report.plan);
            if report.reachable {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Commands::Plan(args) => {
            let region = args.region.as_deref().filter(|_| !args.all);
            if args.dry_run {
                let plan = pipeline.plan_preview(region).await?;
                print_plan(&plan);
                for quota in plan.cells.iter().filter(|q| q.target > 0) {
                    println!("  {} -> {} (priority {})", quota.cell, quota.target, quota.priority);
                }
                ExitCode::SUCCESS
            } else {
                print_summary(&pipeline.run_plan(region, args.hotels_only).await?)
            }
        }
        Commands::Reviews(args) => {
            let selection = match args.hotel_id {
                Some(id) if !args.all => HotelSelection::One(id),
                _ => HotelSelection::All,
            };
            print_summary(&pipeline.run_reviews(selection).await?)
        }
        Commands::Status => {
            let stats = pipeline.status().await?;
            println!("tasks: {}", stats.total);
            for (task_type, counts) in &stats.by_type {
                let line = counts
                    .iter()
                    .map(|(status, count)| format!("{status}={count}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                println!("  {task_type}: {line}");
            }
            ExitCode::SUCCESS
        }
        Commands::RetryFailed => print_summary(&pipeline.retry_failed().await?),
        Commands::Cancel { region } => {
            let counts = pipeline.cancel_region(&region).await?;
            println!("cancelled {} pending task(s) in {region}", counts.cancelled);
            ExitCode::SUCCESS
        }
    };
    Ok(code)
}
