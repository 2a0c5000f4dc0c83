use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod classifier;
mod config;
mod correlation;
mod domain;
mod emails;
mod error;
mod events;
mod extractor;
mod fetcher;
mod harvester;
mod models;
mod planner;
mod processor;
mod scheduler;
mod store;

use crate::config::{Config, ConfigArgs};
use crate::events::{EventBus, HarvestEvent};
use crate::fetcher::HttpFetcher;
use crate::harvester::Harvester;
use crate::models::ReviewRecord;
use crate::scheduler::Scheduler;
use crate::store::{JsonStore, StorefrontStore};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest a single storefront and print the result as JSON
    Harvest {
        /// Storefront URL (scheme optional)
        #[arg(short, long)]
        url: String,

        /// Store name used for logging and classification
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Import review records (JSON array) as storefronts
    Import {
        /// Path to the input JSON file
        #[arg(short, long)]
        input: PathBuf,

        /// App the reviews were collected for; applied to records that name none
        #[arg(short, long)]
        app_name: Option<String>,
    },
    /// Harvest every eligible storefront in the store, then exit
    Run,
    /// Start the API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value_t = 8080)]
        port: u16,
    },
    /// Print store statistics as JSON
    Stats {
        /// Only count storefronts imported for this app
        #[arg(short, long)]
        app_name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = config::build_config(&cli.config)?;

    match cli.command {
        Commands::Harvest { url, name } => {
            let name = name.unwrap_or_else(|| url.clone());
            harvest_one(&config, &url, &name).await?;
        }
        Commands::Import { input, app_name } => {
            info!("Importing storefronts from {}", input.display());
            import_file(&config, input, app_name).await?;
        }
        Commands::Run => {
            run_batch(&config).await?;
        }
        Commands::Serve { port } => {
            let store: Arc<dyn StorefrontStore> = Arc::new(JsonStore::open(&config.store_path).await?);
            let scheduler = build_scheduler(store.clone(), &config)?;
            let admitted = scheduler.top_off().await?;
            info!("Resumed {} pending harvests", admitted);
            api::start_api_server(port, api::ApiState::new(store, scheduler), config.resolution_ttl).await;
        }
        Commands::Stats { app_name } => {
            let store = JsonStore::open(&config.store_path).await?;
            let stats = store.statistics(app_name.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}

fn build_harvester(config: &Config) -> Result<Harvester> {
    let fetcher = HttpFetcher::new(config)?;
    Ok(Harvester::new(Arc::new(fetcher), config))
}

fn build_scheduler(store: Arc<dyn StorefrontStore>, config: &Config) -> Result<Arc<Scheduler>> {
    let harvester = build_harvester(config)?;
    let classifier = classifier::build_classifier(config)?;
    Ok(Scheduler::new(store, harvester, classifier, config, EventBus::default()))
}

async fn harvest_one(config: &Config, url: &str, name: &str) -> Result<()> {
    let harvester = build_harvester(config)?;
    let classifier = classifier::build_classifier(config)?;

    let outcome = processor::harvest_and_classify(
        &harvester,
        classifier.as_deref(),
        config.classifier.timeout,
        url,
        name,
        None,
    )
    .await;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if let Some(error) = outcome.error {
        anyhow::bail!(error);
    }
    Ok(())
}

async fn import_file(config: &Config, input: PathBuf, app_name: Option<String>) -> Result<()> {
    let input_data = tokio::fs::read_to_string(&input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let mut records: Vec<ReviewRecord> = serde_json::from_str(&input_data)
        .with_context(|| format!("Failed to parse review records in {}", input.display()))?;
    info!("Loaded {} review records from {}", records.len(), input.display());

    if let Some(app_name) = &app_name {
        for record in records.iter_mut().filter(|r| r.app_name.is_none()) {
            record.app_name = Some(app_name.clone());
        }
    }

    let store = JsonStore::open(&config.store_path).await?;
    let mut imported = 0;
    for record in &records {
        match store.add_storefront(record).await {
            Ok(_) => imported += 1,
            Err(e) => tracing::warn!("Skipping record '{}': {}", record.store_name, e),
        }
    }

    info!("Imported {} of {} records into {}", imported, records.len(), config.store_path.display());
    Ok(())
}

async fn run_batch(config: &Config) -> Result<()> {
    let store: Arc<dyn StorefrontStore> = Arc::new(JsonStore::open(&config.store_path).await?);
    let pending = store.eligible_storefronts(usize::MAX).await?.len();
    if pending == 0 {
        info!("No storefronts eligible for harvesting");
        return Ok(());
    }

    let scheduler = build_scheduler(store.clone(), config)?;

    let progress_bar = indicatif::ProgressBar::new(pending as u64);
    progress_bar.set_style(
        indicatif::ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("##-"),
    );
    let renderer = tokio::spawn(render_progress(scheduler.events().subscribe(), progress_bar.clone()));

    let admitted = scheduler.top_off().await?;
    info!("Started {} harvests for {} eligible storefronts", admitted, pending);
    scheduler.wait_idle().await;

    progress_bar.finish_with_message("Harvest complete");
    renderer.abort();

    println!("{}", serde_json::to_string_pretty(&store.statistics(None).await?)?);
    Ok(())
}

async fn render_progress(mut events: broadcast::Receiver<HarvestEvent>, progress_bar: indicatif::ProgressBar) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Ok(line) = serde_json::to_string(&event) {
                    tracing::debug!(target: "scheduler", "{}", line);
                }
                match event {
                    HarvestEvent::JobAdmitted { base_url, .. } => progress_bar.set_message(base_url),
                    HarvestEvent::JobFinished {
                        storefront_id,
                        error: Some(error),
                        ..
                    } => {
                        progress_bar.println(format!("storefront {} failed: {}", storefront_id, error));
                        progress_bar.inc(1);
                    }
                    HarvestEvent::JobFinished { .. } => progress_bar.inc(1),
                    _ => {}
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(target: "scheduler", "Progress display skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
