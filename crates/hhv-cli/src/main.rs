mod menu;

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hhv_store::{DatabaseConfig, IngestSink, PgStore};
use hhv_sync::{build_pipeline, build_store, SyncConfig};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "hhv-cli")]
#[command(about = "Harvest employers and vacancies into PostgreSQL and report on them")]
struct Cli {
    /// YAML file with a `postgresql:` section.
    #[arg(long, global = true)]
    db_config: Option<PathBuf>,
    /// YAML file with harvest settings (pacing, pagination, fallback employers).
    #[arg(long, global = true)]
    harvest_config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest employers and vacancies, then open the report menu.
    Sync,
    /// Create the database and tables if they are missing.
    Migrate,
    /// Open the report menu over stored data.
    Report,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hhv_client=debug,hhv_store=info,hhv_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        error!(error = ?err, "run aborted");
        eprintln!("error: {err:?}");
    }
    println!("Done.");
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let database = DatabaseConfig::load(cli.db_config.as_deref()).context("loading database config")?;
    let store = build_store(&database);

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let config =
                SyncConfig::load(cli.harvest_config.as_deref()).context("loading harvest config")?;
            sync(&config, store).await?;
        }
        Commands::Migrate => {
            store.ensure_schema().await.context("preparing database schema")?;
            println!("schema ready in database {}", database.database);
        }
        Commands::Report => {
            report(&store, false).await?;
        }
    }
    Ok(())
}

async fn sync(config: &SyncConfig, store: PgStore) -> Result<()> {
    let pipeline = build_pipeline(config, store)?;
    let summary = pipeline.run().await?;
    info!(run_id = %summary.run_id, "sync summary ready");
    println!(
        "sync complete: run_id={} organizations={}/{} listings={}/{}{}",
        summary.run_id,
        summary.stored_organizations,
        summary.working_set.len(),
        summary.stored_listings,
        summary.fetched_listings,
        if summary.used_fallback { " (fallback employers)" } else { "" }
    );
    report(pipeline.sink(), summary.is_demo()).await
}

async fn report(store: &PgStore, demo: bool) -> Result<()> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        present(store, demo, &mut menu::TerminalPrompt).await
    } else {
        present(store, demo, &mut menu::LinePrompt::new(stdin.lock())).await
    }
}

async fn present(store: &PgStore, demo: bool, input: &mut impl menu::Prompt) -> Result<()> {
    let mut out = io::stdout();
    if demo {
        menu::run_demo(store, input, &mut out).await?;
    } else {
        menu::run_menu(store, input, &mut out).await?;
    }
    out.flush()?;
    Ok(())
}
