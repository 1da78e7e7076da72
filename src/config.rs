use crate::scrapers::types::{SearchArea, SearchCriteria};
use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Everything one run needs to know, read once at startup and passed down
/// explicitly.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub csv_path: PathBuf,
    pub log_level: String,
    pub search: SearchCriteria,
    pub locations: Vec<SearchArea>,
    pub scraper: ScraperConfig,
    pub detector: DetectorConfig,
    pub notifications: NotificationConfig,
    pub sync: SyncConfig,
    pub watchdog_stale_hours: i64,
}

#[derive(Debug, Clone)]
pub struct ScraperConfig {
    pub request_delay: Duration,
    pub request_timeout: Duration,
    pub max_pages_per_area: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorConfig {
    /// Minimum reduction that counts as a price drop. Zero means any decrease.
    pub price_drop_threshold: i64,
    pub stale_listing_days: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationConfig {
    Ntfy { url: String },
    Termux,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub rclone_binary: String,
    /// rclone destination such as `gdrive:property-tracker`; no sync when unset
    pub rclone_remote: Option<String>,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            request_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            max_pages_per_area: 20,
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            price_drop_threshold: 0,
            stale_listing_days: 60,
        }
    }
}

pub fn default_locations() -> Vec<SearchArea> {
    [
        ("Wandsworth", "REGION^93977"),
        ("Lewisham", "REGION^61413"),
        ("Kingston upon Thames", "REGION^93968"),
        ("Richmond upon Thames", "REGION^93937"),
        ("Teddington", "REGION^1321"),
        ("Bermondsey", "REGION^85212"),
    ]
    .into_iter()
    .map(|(name, identifier)| SearchArea::new(name, identifier))
    .collect()
}

impl Config {
    /// Build the configuration from the process environment, after loading
    /// a `.env` file if one exists.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let search = SearchCriteria {
            min_bedrooms: vars.parse("MIN_BEDROOMS", 3)?,
            max_bedrooms: vars.parse("MAX_BEDROOMS", 4)?,
            min_price: vars.parse("MIN_PRICE", 900_000)?,
            max_price: vars.parse("MAX_PRICE", 1_100_000)?,
            property_types: match vars.get("PROPERTY_TYPES") {
                Some(list) => split_list(&list, ','),
                None => SearchCriteria::default().property_types,
            },
            filter_freehold: vars.parse_bool("FILTER_FREEHOLD", true)?,
        };
        if search.min_price > search.max_price {
            bail!("MIN_PRICE ({}) is above MAX_PRICE ({})", search.min_price, search.max_price);
        }
        if search.min_bedrooms > search.max_bedrooms {
            bail!(
                "MIN_BEDROOMS ({}) is above MAX_BEDROOMS ({})",
                search.min_bedrooms,
                search.max_bedrooms
            );
        }

        let locations = match vars.get("SEARCH_LOCATIONS") {
            Some(list) => parse_locations(&list)?,
            None => default_locations(),
        };

        let scraper = ScraperConfig {
            request_delay: Duration::from_secs(vars.parse("REQUEST_DELAY_SECS", 5)?),
            request_timeout: Duration::from_secs(vars.parse("REQUEST_TIMEOUT_SECS", 30)?),
            max_pages_per_area: vars.parse("MAX_PAGES_PER_AREA", 20)?,
        };

        let detector = DetectorConfig {
            price_drop_threshold: vars.parse("PRICE_DROP_THRESHOLD", 0)?,
            stale_listing_days: vars.parse("STALE_LISTING_DAYS", 60)?,
        };
        if detector.price_drop_threshold < 0 {
            bail!("PRICE_DROP_THRESHOLD must not be negative");
        }

        let notifications = match vars.get("NOTIFICATION_BACKEND").as_deref() {
            None | Some("none") | Some("") => NotificationConfig::Disabled,
            Some("termux") => NotificationConfig::Termux,
            Some("ntfy") => NotificationConfig::Ntfy {
                url: vars
                    .get("NTFY_URL")
                    .context("NOTIFICATION_BACKEND=ntfy needs NTFY_URL")?,
            },
            Some(other) => bail!("Unknown NOTIFICATION_BACKEND {other:?} (expected ntfy, termux or none)"),
        };

        let sync = SyncConfig {
            rclone_binary: vars.get("RCLONE_BINARY").unwrap_or_else(|| "rclone".to_string()),
            rclone_remote: vars.get("RCLONE_REMOTE").filter(|r| !r.trim().is_empty()),
        };

        Ok(Config {
            database_path: vars.get("TRACKER_DB_PATH").unwrap_or_else(|| "properties.db".to_string()).into(),
            csv_path: vars.get("TRACKER_CSV_PATH").unwrap_or_else(|| "properties.csv".to_string()).into(),
            log_level: vars.get("TRACKER_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            search,
            locations,
            scraper,
            detector,
            notifications,
            sync,
            watchdog_stale_hours: vars.parse("WATCHDOG_STALE_HOURS", 3)?,
        })
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).map(|v| v.trim().to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid value {raw:?} for {key}: {e}")),
        }
    }

    fn parse_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key).as_deref().map(str::to_ascii_lowercase).as_deref() {
            None => Ok(default),
            Some("1" | "true" | "yes" | "on") => Ok(true),
            Some("0" | "false" | "no" | "off") => Ok(false),
            Some(other) => bail!("Invalid boolean {other:?} for {key}"),
        }
    }
}

fn split_list(list: &str, sep: char) -> Vec<String> {
    list.split(sep)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `Name=IDENTIFIER;Name=IDENTIFIER`
fn parse_locations(list: &str) -> Result<Vec<SearchArea>> {
    let locations = split_list(list, ';')
        .into_iter()
        .map(|entry| match entry.split_once('=') {
            Some((name, identifier)) if !name.trim().is_empty() && !identifier.trim().is_empty() => {
                Ok(SearchArea::new(name.trim(), identifier.trim()))
            }
            _ => bail!("Invalid SEARCH_LOCATIONS entry {entry:?} (expected Name=IDENTIFIER)"),
        })
        .collect::<Result<Vec<_>>>()?;

    if locations.is_empty() {
        bail!("SEARCH_LOCATIONS is set but names no locations");
    }
    Ok(locations)
}
