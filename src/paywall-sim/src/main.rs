//! paywall-sim: drives one tracked event through the presentation pipeline
//! against a campaign file and prints the result channel as JSON lines.

mod collaborators;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use paywall_core::collaborators::InMemoryConfigStore;
use paywall_core::config::AppConfig;
use paywall_core::types::{CampaignConfig, Parameters, PresentationEvent};
use paywall_presentation::{
    Dependencies, PaywallAction, PaywallOverrides, PresentationCoordinator,
};
use paywall_triggers::{ExperimentAssigner, InMemoryAssignmentStore};
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::collaborators::{ApprovingStore, FixedSubscription, LoggingRenderer, TracingSink};

#[derive(Parser, Debug)]
#[command(name = "paywall-sim")]
#[command(about = "Simulate paywall presentation for a tracked event")]
#[command(version)]
struct Cli {
    /// Campaign config (JSON)
    #[arg(long, env = "PAYWALL_SIM_CAMPAIGN")]
    campaign: PathBuf,

    /// Event to track
    #[arg(long, default_value = "MyEvent")]
    event: String,

    /// Event parameters as a JSON object
    #[arg(long, default_value = "{}")]
    params: String,

    /// User traits as a JSON object
    #[arg(long, default_value = "{}")]
    traits: String,

    #[arg(long)]
    user_id: Option<String>,

    /// Locale override
    #[arg(long)]
    locale: Option<String>,

    /// Pretend the user already has an active subscription
    #[arg(long, default_value_t = false)]
    subscribed: bool,

    #[arg(long, default_value_t = false)]
    ignore_subscription: bool,

    /// Buy this product once the paywall is ready instead of closing it
    #[arg(long)]
    purchase: Option<String>,

    /// Time the simulated content takes to load
    #[arg(long, default_value_t = 150)]
    load_ms: u64,

    /// Time the simulated user looks at the paywall before closing it
    #[arg(long, default_value_t = 500)]
    close_after_ms: u64,

    /// Seed for variant draws (overrides entropy)
    #[arg(long)]
    seed: Option<u64>,

    /// Cache capacity (overrides config)
    #[arg(long, env = "PAYWALL__CACHE__MAX_UNITS")]
    max_units: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "paywall_sim=info,paywall_presentation=info,paywall_cache=info".into()
            }),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if let Some(max_units) = cli.max_units {
        config.cache.max_units = max_units;
    }

    let raw = std::fs::read_to_string(&cli.campaign)
        .with_context(|| format!("reading campaign file {}", cli.campaign.display()))?;
    let campaign: CampaignConfig =
        serde_json::from_str(&raw).context("parsing campaign config")?;
    let params: Parameters = serde_json::from_str(&cli.params).context("parsing --params")?;
    let traits: Parameters = serde_json::from_str(&cli.traits).context("parsing --traits")?;

    info!(
        triggers = campaign.triggers.len(),
        paywalls = campaign.paywalls.len(),
        max_units = config.cache.max_units,
        watchdog_timeout_ms = config.presentation.watchdog_timeout_ms,
        "Configuration loaded"
    );

    let assignments = Arc::new(InMemoryAssignmentStore::new());
    let assigner = Arc::new(match cli.seed {
        Some(seed) => ExperimentAssigner::with_seed(assignments.clone(), seed),
        None => ExperimentAssigner::new(assignments.clone()),
    });
    let coordinator = PresentationCoordinator::with_assigner(
        Dependencies {
            config_store: Arc::new(InMemoryConfigStore::new(campaign)),
            renderer: Arc::new(LoggingRenderer {
                build_delay: Duration::from_millis(200),
            }),
            subscriptions: Arc::new(FixedSubscription(cli.subscribed)),
            purchases: Arc::new(ApprovingStore { restorable: false }),
            assignments,
            sink: Arc::new(TracingSink),
        },
        assigner,
        config.clone(),
    );

    if let Some(user_id) = &cli.user_id {
        coordinator.identify(user_id.clone());
    }
    coordinator.set_user_traits(traits);

    // Spawn cache maintenance task
    let for_maintenance = coordinator.clone();
    let interval_ms = config.cache.maintenance_interval_ms.max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            interval.tick().await;
            for_maintenance.maintenance().await;
        }
    });

    let channel = coordinator.track(
        cli.event.clone(),
        params,
        PaywallOverrides {
            locale: cli.locale.clone(),
            ignore_subscription_status: cli.ignore_subscription,
            ..Default::default()
        },
    );

    let mut events = channel.stream();
    while let Some(event) = events.next().await {
        println!("{}", serde_json::to_string(&event)?);

        if let PresentationEvent::Presented { info } = &event {
            tokio::time::sleep(Duration::from_millis(cli.load_ms)).await;
            coordinator.handle_action(PaywallAction::ContentLoaded).await?;

            match &cli.purchase {
                Some(product_id) => {
                    if let Err(e) = coordinator
                        .handle_action(PaywallAction::Purchase {
                            product_id: product_id.clone(),
                        })
                        .await
                    {
                        warn!(paywall_id = %info.paywall_id, error = %e, "Purchase failed, closing");
                        coordinator.handle_action(PaywallAction::Close).await?;
                    }
                }
                None => {
                    tokio::time::sleep(Duration::from_millis(cli.close_after_ms)).await;
                    coordinator.handle_action(PaywallAction::Close).await?;
                }
            }
        }
    }

    let evicted = coordinator.shutdown().await;
    info!(evicted, "Simulation finished");
    Ok(())
}
