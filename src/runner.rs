use crate::config::Config;
use crate::detector::{ChangeDetector, RunReport};
use crate::export::export_active;
use crate::notifier::{deliver, notify_run, Message, Notifier};
use crate::scrapers::ScraperTrait;
use crate::store::ListingStore;
use crate::sync::CloudSync;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::path::Path;
use tracing::{error, info, warn};

/// One scheduled run: scrape every area, detect changes, notify, export
/// and sync.
///
/// Only store failures abort the run. A failing area, notifier, export or
/// sync is logged and the run carries on.
pub struct Tracker<'a> {
    pub config: &'a Config,
    pub store: &'a ListingStore,
    pub scraper: &'a dyn ScraperTrait,
    pub notifier: &'a dyn Notifier,
    pub cloud_sync: Option<&'a dyn CloudSync>,
}

impl Tracker<'_> {
    pub async fn run(&self, now: DateTime<Utc>) -> Result<RunReport> {
        info!("Run started {} via {}", now.format("%Y-%m-%d %H:%M:%S UTC"), self.scraper.source_name());

        let detector = ChangeDetector::new(&self.config.detector);
        let stale_days = self.config.detector.stale_listing_days;
        let mut report = RunReport::default();

        self.scraper.warm_up().await;

        for area in &self.config.locations {
            let batch = match self.scraper.scrape_area(area).await {
                Ok(batch) => batch,
                Err(e) => {
                    error!("Scrape failed for {}: {:#}", area.name, e);
                    report.failed_areas.push(area.name.clone());
                    continue;
                }
            };

            match detector.process_batch(self.store, &batch, now).await {
                Ok(batch_report) => report.batches.push(batch_report),
                Err(e) => {
                    error!("Store failure while processing {}: {}", area.name, e);
                    // Earlier areas are already committed
                    notify_run(self.notifier, &report, stale_days).await;
                    export_and_sync(self.store, &self.config.csv_path, self.cloud_sync).await;
                    return Err(e.into());
                }
            }
        }

        if report.total_seen() == 0 {
            warn!("Scraper returned zero listings; check SEARCH_LOCATIONS and the network connection");
        }

        report.stale = self.store.stale_listings(stale_days, now).await?;

        let delivery = notify_run(self.notifier, &report, stale_days).await;
        if delivery.stale {
            let ids: Vec<String> = report.newly_stale().iter().map(|s| s.listing.id.clone()).collect();
            self.store.mark_stale_notified(&ids).await?;
        }

        export_and_sync(self.store, &self.config.csv_path, self.cloud_sync).await;

        info!(
            "Run complete - {} new | {} price drops | {} stale | {} total | {} failed areas",
            report.new_listings().len(),
            report.price_drops().len(),
            report.stale.len(),
            report.total_seen(),
            report.failed_areas.len()
        );
        Ok(report)
    }
}

/// Export the CSV and push it to cloud storage; both are best effort
pub async fn export_and_sync(store: &ListingStore, path: &Path, cloud_sync: Option<&dyn CloudSync>) {
    if let Err(e) = export_active(store, path).await {
        error!("CSV export failed: {}", e);
        return;
    }

    if let Some(cloud_sync) = cloud_sync {
        if let Err(e) = cloud_sync.sync(path).await {
            error!("Cloud sync failed (will retry next run): {}", e);
        }
    }
}

/// What the watchdog found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogStatus {
    /// Nothing stored yet
    Empty,
    Healthy { age: Duration },
    Stale { age: Duration, alerted: bool },
}

/// Alert when no run has stored anything for longer than `stale_hours`
pub async fn check_watchdog(
    store: &ListingStore,
    notifier: &dyn Notifier,
    stale_hours: i64,
    now: DateTime<Utc>,
) -> Result<WatchdogStatus> {
    let Some(latest) = store.latest_seen().await? else {
        return Ok(WatchdogStatus::Empty);
    };

    let age = now - latest;
    if age <= Duration::hours(stale_hours) {
        info!("Scraper last ran {} min ago - OK", age.num_minutes());
        return Ok(WatchdogStatus::Healthy { age });
    }

    let hours = age.num_minutes() as f64 / 60.0;
    let message = Message {
        title: "Scraper alert".to_string(),
        body: format!("Property tracker silent for {hours:.1}h - check the host"),
    };
    warn!("{}", message.body);
    let alerted = deliver(notifier, &message).await;
    Ok(WatchdogStatus::Stale { age, alerted })
}
