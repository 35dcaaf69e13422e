use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgGroup, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;

use community_health_engine::aggregate::Aggregator;
use community_health_engine::clock::{Clock, SystemClock};
use community_health_engine::config::{init_logging, Config};
use community_health_engine::db::{self, PgStore};
use community_health_engine::engine::{Engine, Stores};
use community_health_engine::error::TracingReporter;
use community_health_engine::geo::GeoPoint;
use community_health_engine::i18n::Catalog;
use community_health_engine::models::Metric;
use community_health_engine::notify::{HttpPushSink, Notifier};
use community_health_engine::runtime::{ActivityOptions, Runtime};
use community_health_engine::report;
use community_health_engine::scoring::{band, Kernel};
use community_health_engine::store::StateStore;

#[derive(Parser)]
#[command(name = "community-health-engine")]
#[command(about = "Community health scores and nudges for nearby accounts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import reports from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Compute a candidate score without saving it
    #[command(group(
        ArgGroup::new("scope")
            .args(["account", "poi"])
            .required(true)
            .multiple(false)
    ))]
    Score {
        #[arg(long)]
        account: Option<String>,
        #[arg(long)]
        poi: Option<String>,
    },
    /// Generate a markdown health summary for one account
    Report {
        #[arg(long)]
        account: String,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Run the score and nudge loops until Ctrl-C
    Worker,
}

fn print_metric(label: &str, metric: &Metric) {
    let details = &metric.details;
    println!(
        "{label}: score {:.1} ({})",
        metric.score,
        band(metric.score).as_str()
    );
    println!(
        "- confirmed {:.1}, symptoms {:.1}, behaviors {:.1}",
        details.confirm.score, details.symptoms.score, details.behaviors.score
    );
    if !details.symptoms.last_spike_list.is_empty() {
        let spiking: Vec<&str> = details
            .symptoms
            .last_spike_list
            .iter()
            .map(String::as_str)
            .collect();
        println!("- spiking: {}", spiking.join(", "));
    }
}

async fn run_worker(config: &Config, store: PgStore) -> anyhow::Result<()> {
    let push = config.push_config()?;
    let catalog = Catalog::load(&config.i18n_dir)
        .with_context(|| format!("failed to load messages from {}", config.i18n_dir.display()))?;
    let sink = HttpPushSink::new(push.api_url.as_deref(), &push.app_id, &push.api_key);
    let runtime = Runtime::new(
        config.worker_concurrency,
        ActivityOptions::default(),
        Arc::new(TracingReporter),
    );

    let engine = Engine::new(
        Stores::shared(store),
        Notifier::new(Arc::new(sink)),
        Arc::new(catalog),
        Arc::new(SystemClock),
        config.settings(),
        runtime.clone(),
    );
    engine.resume().await.context("failed to start loops")?;
    tracing::info!(workers = config.worker_concurrency, "worker running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!(running = runtime.running(), "shutting down");
    runtime.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_logging(config.log_format);

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = PgStore::new(pool.clone());

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let summary = db::import_csv(&store, &csv).await?;
            println!(
                "Inserted {} reports from {} ({} duplicates skipped).",
                summary.inserted,
                csv.display(),
                summary.skipped
            );
        }
        Commands::Score { account, poi } => {
            let (label, location): (String, GeoPoint) = match (account, poi) {
                (Some(id), _) => {
                    let profile = store
                        .get_profile(&id)
                        .await?
                        .with_context(|| format!("no account {id}"))?;
                    let location = profile
                        .location
                        .with_context(|| format!("account {id} has no known location"))?;
                    (format!("account {id}"), location)
                }
                (None, Some(id)) => {
                    let poi = store
                        .get_poi(&id)
                        .await?
                        .with_context(|| format!("no poi {id}"))?;
                    (format!("poi {id}"), poi.location)
                }
                (None, None) => anyhow::bail!("pass --account or --poi"),
            };

            let shared = Arc::new(store);
            let aggregator = Aggregator::new(shared.clone(), shared.clone(), shared);
            let kernel = Kernel::new(config.spike_threshold);
            let now = SystemClock.now();
            let snapshot = aggregator
                .snapshot(location, config.cohort_radius_m, now)
                .await?;
            print_metric(&label, &kernel.metric(&snapshot, now));
        }
        Commands::Report { account, out } => {
            let profile = store
                .get_profile(&account)
                .await?
                .with_context(|| format!("no account {account}"))?;
            let report = report::build_report(&profile, SystemClock.now())
                .context("failed to render report")?;
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
        Commands::Worker => run_worker(&config, store).await?,
    }

    Ok(())
}
