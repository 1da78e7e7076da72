use crate::config::NotificationConfig;
use crate::detector::RunReport;
use crate::models::Listing;
use crate::store::StaleListing;
use async_trait::async_trait;
use reqwest::Client;
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;
use thousands::Separable;
use tokio::process::Command;
use tracing::{debug, error, info};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("push gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("{command} exited with {status}")]
    Exit { command: String, status: String },
}

/// Channel that delivers a push notification
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, title: &str, body: &str) -> Result<(), NotifyError>;

    fn name(&self) -> &'static str;
}

/// Build the backend selected in the configuration
pub fn from_config(config: &NotificationConfig) -> anyhow::Result<Box<dyn Notifier>> {
    Ok(match config {
        NotificationConfig::Ntfy { url } => Box::new(NtfyNotifier::new(url)?),
        NotificationConfig::Termux => Box::new(TermuxNotifier::default()),
        NotificationConfig::Disabled => Box::new(DisabledNotifier),
    })
}

/// HTTP POST to an ntfy topic
pub struct NtfyNotifier {
    client: Client,
    url: String,
}

impl NtfyNotifier {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(SEND_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for NtfyNotifier {
    async fn send(&self, title: &str, body: &str) -> Result<(), NotifyError> {
        self.client
            .post(&self.url)
            .header("Title", title)
            .header("Priority", "high")
            .header("Tags", "house")
            .body(body.to_string())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ntfy"
    }
}

/// `termux-notification` on an Android phone running Termux:API
pub struct TermuxNotifier {
    command: String,
    notification_id: u32,
}

impl Default for TermuxNotifier {
    fn default() -> Self {
        Self {
            command: "termux-notification".to_string(),
            notification_id: 1001,
        }
    }
}

impl TermuxNotifier {
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Notifier for TermuxNotifier {
    async fn send(&self, title: &str, body: &str) -> Result<(), NotifyError> {
        let mut child = Command::new(&self.command)
            .args(["--title", title, "--content", body])
            .arg("--id")
            .arg(self.notification_id.to_string())
            .args(["--priority", "high", "--led-color", "FF4500"])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|source| NotifyError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        // The Termux:API IPC can outlive the call; a slow exit is not a failure
        match tokio::time::timeout(SEND_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(NotifyError::Exit {
                command: self.command.clone(),
                status: status.to_string(),
            }),
            Ok(Err(source)) => Err(NotifyError::Spawn {
                command: self.command.clone(),
                source,
            }),
            Err(_) => {
                debug!("{} still running in the background", self.command);
                Ok(())
            }
        }
    }

    fn name(&self) -> &'static str {
        "termux"
    }
}

/// Logs instead of sending
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn send(&self, title: &str, body: &str) -> Result<(), NotifyError> {
        debug!("Notifications disabled - would send: [{}] {}", title, body);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

/// Title and body of one push notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub title: String,
    pub body: String,
}

/// `950000` -> `£950,000`
pub fn format_price(price: i64) -> String {
    let grouped = price.unsigned_abs().separate_with_commas();
    if price < 0 {
        format!("-£{grouped}")
    } else {
        format!("£{grouped}")
    }
}

fn bedrooms(listing: &Listing) -> String {
    listing.bedrooms.map_or_else(|| "?".to_string(), |b| b.to_string())
}

pub fn compose_new_listings(listings: &[&Listing]) -> Option<Message> {
    match listings {
        [] => None,
        [listing] => Some(Message {
            title: "New property listed".to_string(),
            body: format!(
                "{}\n{}  ·  {} bed  ·  {}  ·  {}",
                listing.address,
                format_price(listing.price),
                bedrooms(listing),
                listing.property_type,
                listing.area
            ),
        }),
        many => {
            let min = many.iter().map(|l| l.price).min().unwrap_or_default();
            let max = many.iter().map(|l| l.price).max().unwrap_or_default();
            let areas: BTreeSet<&str> = many.iter().map(|l| l.area.as_str()).collect();
            Some(Message {
                title: format!("{} new properties listed", many.len()),
                body: format!(
                    "{} – {}\n{}",
                    format_price(min),
                    format_price(max),
                    areas.into_iter().collect::<Vec<_>>().join(", ")
                ),
            })
        }
    }
}

pub fn compose_price_drops(drops: &[(&Listing, i64, i64)]) -> Option<Message> {
    match drops {
        [] => None,
        [(listing, old_price, new_price)] => Some(Message {
            title: "Price reduction".to_string(),
            body: format!(
                "{}\n{}  →  {}   (↓ {})",
                listing.address,
                format_price(*old_price),
                format_price(*new_price),
                format_price(old_price - new_price)
            ),
        }),
        many => {
            let largest = many.iter().map(|(_, old, new)| old - new).max().unwrap_or_default();
            Some(Message {
                title: format!("{} price reductions", many.len()),
                body: format!(
                    "Largest drop: {}\nAcross {} properties",
                    format_price(largest),
                    many.len()
                ),
            })
        }
    }
}

pub fn compose_stale(stale: &[&StaleListing], min_days: i64) -> Option<Message> {
    match stale {
        [] => None,
        [one] => Some(Message {
            title: "Stale listing".to_string(),
            body: format!(
                "{}\n{}  ·  {} days on market  ·  no price change",
                one.listing.address,
                format_price(one.listing.price),
                one.days_on_market
            ),
        }),
        many => Some(Message {
            title: format!("{} listings now stale", many.len()),
            body: format!(
                "{} properties with no price change for {}+ days",
                many.len(),
                min_days
            ),
        }),
    }
}

/// Send a message, logging instead of failing
pub async fn deliver(notifier: &dyn Notifier, message: &Message) -> bool {
    match notifier.send(&message.title, &message.body).await {
        Ok(()) => {
            info!("Sent {} notification: {}", notifier.name(), message.title);
            true
        }
        Err(e) => {
            error!("{} notification failed: {}", notifier.name(), e);
            false
        }
    }
}

/// Result of [`notify_run`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub new_listings: bool,
    pub price_drops: bool,
    pub stale: bool,
}

/// Send one grouped notification per kind of change in the run. Failures
/// are logged and reported back, never raised.
pub async fn notify_run(notifier: &dyn Notifier, report: &RunReport, stale_days: i64) -> Delivery {
    let mut delivery = Delivery::default();

    if let Some(message) = compose_new_listings(&report.new_listings()) {
        delivery.new_listings = deliver(notifier, &message).await;
    }
    if let Some(message) = compose_price_drops(&report.price_drops()) {
        delivery.price_drops = deliver(notifier, &message).await;
    }
    if let Some(message) = compose_stale(&report.newly_stale(), stale_days) {
        delivery.stale = deliver(notifier, &message).await;
    }

    delivery
}
