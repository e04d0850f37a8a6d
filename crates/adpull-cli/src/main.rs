use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use adpull_store::InsightStore;
use adpull_sync::{PullConfig, PullPipeline};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "adpull")]
#[command(about = "adpull command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull every configured account once and upsert the results.
    Pull {
        /// Comma-separated account ids; overrides FB_ACCOUNT_IDS when given.
        #[arg(long, value_delimiter = ',')]
        accounts: Vec<String>,
    },
    /// Create the insight table and its natural-key constraint.
    Migrate,
    /// Run the HTTP trigger server (and the cron scheduler when enabled).
    Serve,
}

fn init_tracing() {
    // Default level, still overridable via RUST_LOG.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,reqwest=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Pull { accounts: vec![] }) {
        Commands::Pull { accounts } => {
            let mut config = PullConfig::from_env()?;
            if !accounts.is_empty() {
                config.account_ids = accounts;
            }
            let pipeline = PullPipeline::new(config)?;
            let summary = pipeline.run_once().await?;
            println!(
                "pull complete: run_id={} accounts={} rows={} inserted={} updated={}",
                summary.run_id,
                summary.accounts,
                summary.rows_fetched,
                summary.inserted,
                summary.updated
            );
        }
        Commands::Migrate => {
            let config = PullConfig::from_env()?;
            let store = InsightStore::connect(&config.database_url)
                .await
                .context("connecting to the insight store")?;
            let outcome = store.ensure_schema().await;
            store.close().await;
            outcome.context("applying the insight schema")?;
            println!("schema ready: ad_insights table and natural-key constraint");
        }
        Commands::Serve => {
            let config = PullConfig::from_env()?;
            let pipeline = PullPipeline::new(config)?;
            let _scheduler = match pipeline.maybe_build_scheduler().await? {
                Some(scheduler) => {
                    scheduler.start().await.context("starting scheduler")?;
                    println!("cron scheduler running");
                    Some(scheduler)
                }
                None => None,
            };
            adpull_web::serve_from_env().await?;
        }
    }

    Ok(())
}
