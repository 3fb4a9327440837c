use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sheetsync_core::{DateKey, DateRange, DateReport, Outcome, RunStatus};
use sheetsync_sync::{build_service, SweepMode, SyncConfig, SyncService};

#[derive(Debug, Parser)]
#[command(name = "sheetsync-cli")]
#[command(about = "Daily metrics to spreadsheet sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync one date (YYYY-MM-DD) into every sheet.
    SyncDate {
        date: DateKey,
        /// Overwrite write-once rows.
        #[arg(long)]
        reconcile: bool,
    },
    /// Sync today's date in the configured time zone.
    SyncToday,
    /// Sync every date from START to END inclusive.
    Sweep {
        start: DateKey,
        end: DateKey,
        #[arg(long)]
        reconcile: bool,
    },
    /// Write header rows, creating missing sheets.
    SetupHeaders,
    /// Clear duplicate rows for a date, keeping the first.
    ResolveDuplicates {
        date: DateKey,
        #[arg(long)]
        sheet: Option<String>,
    },
    /// HTTP control surface (default).
    Serve,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn,sheetsync=info")),
        )
        .init();
}

fn service(config: &SyncConfig) -> Result<SyncService> {
    build_service(config).context("configuring sync service")
}

fn label(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::Written => "written",
        Outcome::SkippedDuplicate => "skipped_duplicate",
        Outcome::SkippedExisting => "skipped_existing",
        Outcome::Failed { .. } => "failed",
    }
}

fn print_date_report(report: &DateReport) -> Result<()> {
    let sheets = report
        .sheets
        .iter()
        .map(|s| format!("{}={}", s.sheet, label(&s.outcome)))
        .collect::<Vec<_>>();
    println!("{}: {:?} [{}]", report.date, report.outcome, sheets.join(", "));
    if report.outcome.is_failed() {
        bail!("sync for {} failed", report.date);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::SyncDate { date, reconcile } => {
            let report = service(&config)?.sync_date(date, reconcile).await;
            print_date_report(&report)?;
        }
        Commands::SyncToday => {
            let report = service(&config)?.sync_today().await;
            print_date_report(&report)?;
        }
        Commands::Sweep { start, end, reconcile } => {
            let range = DateRange::for_sweep(start, end)?;
            let mode = if reconcile { SweepMode::Reconcile } else { SweepMode::Routine };
            let report = service(&config)?.sweep(range, mode).await;
            let counts = report.counts();
            println!(
                "sweep {}..{}: status={:?} written={} skipped={} failed={}",
                range.start,
                range.end,
                report.status(),
                counts.written,
                counts.skipped,
                counts.failed
            );
            for entry in report.entries.iter().filter(|e| e.outcome.is_failed()) {
                println!("  {}: {:?}", entry.date, entry.outcome);
            }
            if report.status() == RunStatus::Failed {
                bail!("every date in the sweep failed");
            }
        }
        Commands::SetupHeaders => {
            let results = service(&config)?.setup_headers().await;
            for result in &results {
                println!("{}: {:?}", result.sheet, result.outcome);
            }
            if !results.is_empty() && results.iter().all(|r| r.outcome.is_failed()) {
                bail!("header setup failed for every sheet");
            }
        }
        Commands::ResolveDuplicates { date, sheet } => {
            let results = service(&config)?.resolve_duplicates(date, sheet.as_deref()).await?;
            for result in &results {
                match &result.error {
                    Some(err) => println!("{}: error: {err}", result.sheet),
                    None => println!("{}: removed {}", result.sheet, result.removed),
                }
            }
        }
        Commands::Serve => sheetsync_web::serve(config).await?,
    }

    Ok(())
}
