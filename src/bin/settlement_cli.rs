use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;
use stateset_settlement::{config, db, migrator, scheduler::JobKind, AppState};
use std::str::FromStr;
use strum::IntoEnumIterator;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config().context("failed to load configuration")?;
    config::init_tracing(&cfg.log_level, cfg.log_json);

    match cli.command {
        Commands::Migrate => {
            migrator::run_migration(&cfg.database_url).await?;
            println!("Migrations applied to {}", cfg.database_url);
        }
        Commands::Health => {
            let pool = db::establish_connection_from_app_config(&cfg).await?;
            match db::check_connection(&pool).await {
                Ok(()) => println!("Database reachable at {}", cfg.database_url),
                Err(e) => {
                    eprintln!("Database unreachable: {}", e.response_message());
                    std::process::exit(1);
                }
            }
        }
        Commands::RunJob(args) => {
            let (state, _events) = AppState::bootstrap(&cfg).await?;
            let report = state
                .scheduler()
                .trigger(&args.job)
                .await
                .with_context(|| format!("job {} failed", args.job))?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "{}: processed {}, succeeded {}, failed {} in {} ms",
                    report.job, report.processed, report.succeeded, report.failed, report.duration_ms
                );
            }
        }
        Commands::Jobs => {
            for job in JobKind::iter() {
                println!("{} (every {}s)", job, job.interval(&cfg.scheduler).as_secs());
            }
        }
        Commands::Verify(args) => {
            let cashback_id = Uuid::from_str(&args.cashback_id)
                .with_context(|| format!("invalid cashback id: {}", args.cashback_id))?;
            let (state, _events) = AppState::bootstrap(&cfg).await?;
            let verification = state
                .services
                .cashbacks
                .verify_cashback_transaction(cashback_id)
                .await
                .context("verification failed")?;
            if cli.json {
                print_json(&verification)?;
            } else {
                println!(
                    "{} on {}: {} ({} confirmations)",
                    verification.tx_hash,
                    verification.network,
                    if verification.confirmed {
                        "confirmed"
                    } else {
                        "unconfirmed"
                    },
                    verification.confirmations
                );
            }
        }
    }

    Ok(())
}

#[derive(Parser)]
#[command(
    name = "settlement-cli",
    about = "Operate the settlement backend: migrations, reconciliation jobs, on-chain checks",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON when available"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,
    /// Check that the configured database answers
    Health,
    /// Run one reconciliation job now, ignoring the schedule lease
    RunJob(RunJobArgs),
    /// List the reconciliation jobs and their intervals
    Jobs,
    /// Check a cashback's transfer on chain
    Verify(VerifyArgs),
}

#[derive(Args)]
struct RunJobArgs {
    #[arg(help = "Job name, e.g. process-pending-cashbacks")]
    job: String,
}

#[derive(Args)]
struct VerifyArgs {
    #[arg(help = "Cashback id")]
    cashback_id: String,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
