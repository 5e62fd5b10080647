use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scoperival_core::Session;
use scoperival_storage::PgStore;
use scoperival_sync::{build_checker_from_env, maybe_build_scheduler, CheckRunSummary, SyncConfig};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "scoperival-cli")]
#[command(about = "ScopeRival competitor monitor")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the JSON API.
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Check one competitor on behalf of its owner.
    Check {
        #[arg(long)]
        owner: Uuid,
        #[arg(long)]
        competitor: Uuid,
    },
    /// Check every competitor of one owner, or of all owners.
    CheckAll {
        #[arg(long)]
        owner: Option<Uuid>,
    },
    /// Run checks on the configured cron until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "scoperival_cli=info,scoperival_sync=info,scoperival_web=info,scoperival_storage=info,scoperival_adapters=info,tower_http=info"
                    .into()
            }),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => scoperival_web::serve_from_env().await?,
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let url = config
                .database_url
                .context("DATABASE_URL is required for migrate")?;
            PgStore::connect(&url).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Check { owner, competitor } => {
            let config = SyncConfig::from_env();
            let checker = build_checker_from_env(&config).await?;
            let outcome = checker
                .check_by_id(&Session::service(owner), competitor)
                .await?;
            println!("{}", outcome.message());
        }
        Commands::CheckAll { owner } => {
            let config = SyncConfig::from_env();
            let checker = build_checker_from_env(&config).await?;
            let summaries = match owner {
                Some(owner) => vec![checker.check_all(&Session::service(owner)).await?],
                None => checker.check_all_owners().await?,
            };
            for summary in &summaries {
                print_summary(summary);
            }
        }
        Commands::Schedule => {
            let mut config = SyncConfig::from_env();
            config.scheduler_enabled = true;
            let checker = Arc::new(build_checker_from_env(&config).await?);
            let mut sched = maybe_build_scheduler(&config, checker)
                .await?
                .context("scheduler was not built")?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.check_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn print_summary(summary: &CheckRunSummary) {
    println!(
        "check run complete: run_id={} owner={} checked={} changed={} unchanged={} failed={}",
        summary.run_id,
        summary.owner_id,
        summary.checked,
        summary.changed,
        summary.unchanged,
        summary.failed
    );
    for failure in &summary.failures {
        println!("  {} ({}): {}", failure.competitor_name, failure.competitor_id, failure.message);
    }
}
