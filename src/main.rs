use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use property_tracker::config::Config;
use property_tracker::logging::init_logging;
use property_tracker::notifier::{self, format_price};
use property_tracker::runner::{check_watchdog, export_and_sync, Tracker};
use property_tracker::scrapers::RightmoveScraper;
use property_tracker::store::ListingStore;
use property_tracker::sync::{CloudSync, RcloneSync};
use tracing::info;

/// Track property listings: new adverts, price drops, removals
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scrape, detect changes, notify, export and sync (default)
    Run,
    /// Write the active listings CSV and sync it
    Export,
    /// Alert if no run has stored anything recently
    Watchdog,
    /// Manage the watchlist
    Watchlist {
        #[command(subcommand)]
        action: WatchlistAction,
    },
    /// Show the price history of a listing
    History { id: String },
    /// Find the location identifier for a place name
    Lookup { query: String },
}

#[derive(Subcommand, Debug)]
enum WatchlistAction {
    List,
    Add { id: String },
    Remove { id: String },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("Invalid configuration")?;
    init_logging(&config.log_level);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&config).await,
        Command::Export => export(&config).await,
        Command::Watchdog => watchdog(&config).await,
        Command::Watchlist { action } => watchlist(&config, action).await,
        Command::History { id } => history(&config, &id).await,
        Command::Lookup { query } => lookup(&config, &query).await,
    }
}

async fn open_store(config: &Config) -> Result<ListingStore> {
    ListingStore::open(&config.database_path)
        .await
        .with_context(|| format!("Database initialisation failed: {}", config.database_path.display()))
}

async fn run(config: &Config) -> Result<()> {
    info!("🏠 Property Tracker - {} search areas", config.locations.len());

    let store = open_store(config).await?;
    let scraper = RightmoveScraper::new(config.search.clone(), config.scraper.clone())?;
    let notifier = notifier::from_config(&config.notifications)?;
    let rclone = RcloneSync::from_config(&config.sync);

    let tracker = Tracker {
        config,
        store: &store,
        scraper: &scraper,
        notifier: notifier.as_ref(),
        cloud_sync: rclone.as_ref().map(|s| s as &dyn CloudSync),
    };
    tracker.run(Utc::now()).await?;
    Ok(())
}

async fn export(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let rclone = RcloneSync::from_config(&config.sync);
    export_and_sync(&store, &config.csv_path, rclone.as_ref().map(|s| s as &dyn CloudSync)).await;
    Ok(())
}

async fn watchdog(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let notifier = notifier::from_config(&config.notifications)?;
    let status = check_watchdog(&store, notifier.as_ref(), config.watchdog_stale_hours, Utc::now()).await?;
    info!("Watchdog: {:?}", status);
    Ok(())
}

async fn watchlist(config: &Config, action: WatchlistAction) -> Result<()> {
    let store = open_store(config).await?;

    match action {
        WatchlistAction::List => {
            let items = store.watchlist().await?;
            if items.is_empty() {
                println!("Watchlist is empty.");
                return Ok(());
            }
            println!("{:<14} {:>12}  {:>4}  Address", "Listing ID", "Price", "Beds");
            println!("{}", "─".repeat(70));
            for listing in items {
                let status = if listing.is_active { "" } else { " [removed]" };
                let beds = listing.bedrooms.map_or_else(|| "?".to_string(), |b| b.to_string());
                let address: String = listing.address.chars().take(40).collect();
                println!(
                    "{:<14} {:>12}  {:>4}  {}{}",
                    listing.id,
                    format_price(listing.price),
                    beds,
                    address,
                    status
                );
            }
        }
        WatchlistAction::Add { id } => {
            if !store.set_watchlist(&id, true).await? {
                bail!("Listing {id} not found in database");
            }
            println!("Added {id} to watchlist.");
        }
        WatchlistAction::Remove { id } => {
            if !store.set_watchlist(&id, false).await? {
                bail!("Listing {id} not found in database");
            }
            println!("Removed {id} from watchlist.");
        }
    }
    Ok(())
}

async fn history(config: &Config, id: &str) -> Result<()> {
    let store = open_store(config).await?;
    let Some(listing) = store.get(id).await? else {
        bail!("Listing {id} not found in database");
    };

    println!("{} ({})", listing.address, listing.url);
    for point in store.price_history(id).await? {
        println!("  {}  {}", point.recorded_at.format("%Y-%m-%d %H:%M"), format_price(point.price));
    }
    Ok(())
}

async fn lookup(config: &Config, query: &str) -> Result<()> {
    let scraper = RightmoveScraper::new(config.search.clone(), config.scraper.clone())?;
    let suggestions = scraper.lookup_location(query).await?;
    if suggestions.is_empty() {
        println!("No locations found for {query:?}");
    }
    for suggestion in suggestions {
        println!("{:<40} {}", suggestion.display_name, suggestion.identifier);
    }
    Ok(())
}
