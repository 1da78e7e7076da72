use crate::config::DetectorConfig;
use crate::models::{Batch, Listing};
use crate::store::{ListingStore, StaleListing, StoreResult, UpsertOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// A notify-worthy change found while comparing a batch to the store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ChangeEvent {
    New(Listing),
    PriceDrop {
        listing: Listing,
        old_price: i64,
        new_price: i64,
    },
}

impl ChangeEvent {
    pub fn listing(&self) -> &Listing {
        match self {
            ChangeEvent::New(listing) => listing,
            ChangeEvent::PriceDrop { listing, .. } => listing,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, ChangeEvent::New(_))
    }
}

/// Outcome of processing one area's batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub area: String,
    pub events: Vec<ChangeEvent>,
    /// Distinct valid listing ids in the batch
    pub seen: usize,
    pub rejected: usize,
    pub unchanged: usize,
    pub reactivated: usize,
    pub deactivated: u64,
}

/// Outcome of a whole run across every area
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub batches: Vec<BatchReport>,
    pub failed_areas: Vec<String>,
    pub stale: Vec<StaleListing>,
}

impl RunReport {
    pub fn events(&self) -> impl Iterator<Item = &ChangeEvent> {
        self.batches.iter().flat_map(|b| b.events.iter())
    }

    pub fn new_listings(&self) -> Vec<&Listing> {
        self.events().filter(|e| e.is_new()).map(ChangeEvent::listing).collect()
    }

    /// `(listing, old_price, new_price)` for every drop
    pub fn price_drops(&self) -> Vec<(&Listing, i64, i64)> {
        self.events()
            .filter_map(|e| match e {
                ChangeEvent::PriceDrop {
                    listing,
                    old_price,
                    new_price,
                } => Some((listing, *old_price, *new_price)),
                ChangeEvent::New(_) => None,
            })
            .collect()
    }

    pub fn newly_stale(&self) -> Vec<&StaleListing> {
        self.stale.iter().filter(|s| !s.notified).collect()
    }

    pub fn total_seen(&self) -> usize {
        self.batches.iter().map(|b| b.seen).sum()
    }
}

/// Compares scraped batches with the store and applies the updates
pub struct ChangeDetector {
    price_drop_threshold: i64,
}

impl ChangeDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            price_drop_threshold: config.price_drop_threshold,
        }
    }

    /// A reduction counts once it reaches the threshold; increases never do
    pub fn is_price_drop(&self, old_price: i64, new_price: i64) -> bool {
        new_price < old_price && old_price - new_price >= self.price_drop_threshold
    }

    /// Classify every listing of `batch`, write the results to `store` and
    /// return the events worth notifying about.
    ///
    /// All writes for the batch share one transaction: on error nothing from
    /// this batch is kept. Malformed records are logged and skipped. Only a
    /// complete batch marks absent listings of its area inactive, and that
    /// never produces an event.
    pub async fn process_batch(
        &self,
        store: &ListingStore,
        batch: &Batch,
        now: DateTime<Utc>,
    ) -> StoreResult<BatchReport> {
        let mut report = BatchReport {
            area: batch.area.clone(),
            ..Default::default()
        };
        let mut ids_seen = HashSet::new();
        let mut tx = store.begin().await?;

        for raw in &batch.listings {
            let listing = match raw.validate(&batch.area) {
                Ok(listing) => listing,
                Err(e) => {
                    warn!(area = %batch.area, "Skipping malformed listing: {}", e);
                    report.rejected += 1;
                    continue;
                }
            };

            if !ids_seen.insert(listing.id.clone()) {
                debug!(area = %batch.area, id = %listing.id, "Duplicate listing in batch");
                continue;
            }

            match tx.upsert(&listing, now).await? {
                UpsertOutcome::Inserted => {
                    let stored = tx.fetch(&listing.id).await?;
                    info!(
                        "NEW  {} - £{} ({} beds, {}, {})",
                        stored.address,
                        stored.price,
                        stored.bedrooms.map_or("?".to_string(), |b| b.to_string()),
                        stored.property_type,
                        stored.area
                    );
                    report.events.push(ChangeEvent::New(stored));
                }
                UpsertOutcome::Updated {
                    old_price,
                    new_price,
                    reactivated,
                } => {
                    if reactivated {
                        debug!(id = %listing.id, "Listing reappeared");
                        report.reactivated += 1;
                    }

                    if self.is_price_drop(old_price, new_price) {
                        let stored = tx.fetch(&listing.id).await?;
                        info!(
                            "DROP {} - £{} -> £{} (-£{})",
                            stored.address,
                            old_price,
                            new_price,
                            old_price - new_price
                        );
                        report.events.push(ChangeEvent::PriceDrop {
                            listing: stored,
                            old_price,
                            new_price,
                        });
                    } else {
                        report.unchanged += 1;
                    }
                }
            }
        }

        report.seen = ids_seen.len();

        if batch.complete {
            report.deactivated = tx.mark_inactive(&batch.area, &ids_seen).await?;
        } else {
            warn!(area = %batch.area, "Incomplete batch; not marking missing listings inactive");
        }

        tx.commit().await?;

        info!(
            area = %batch.area,
            events = report.events.len(),
            seen = report.seen,
            rejected = report.rejected,
            deactivated = report.deactivated,
            "Batch processed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawListing;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    fn raw(id: &str, price: i64) -> RawListing {
        RawListing {
            id: id.to_string(),
            price: price.to_string(),
            bedrooms: Some(3),
            address: format!("{id} Manor Avenue, London SE4"),
            property_type: "Terraced".to_string(),
            bathrooms: Some(2),
            tenure: "freehold".to_string(),
            listed_on: None,
            url: format!("https://www.rightmove.co.uk/properties/{id}"),
        }
    }

    fn detector(threshold: i64) -> ChangeDetector {
        ChangeDetector::new(&DetectorConfig {
            price_drop_threshold: threshold,
            ..Default::default()
        })
    }

    async fn seeded(listings: Vec<RawListing>) -> ListingStore {
        let store = ListingStore::open_in_memory().await.unwrap();
        detector(0)
            .process_batch(&store, &Batch::complete("Lewisham", listings), t0())
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn first_run_classifies_everything_new() {
        let store = ListingStore::open_in_memory().await.unwrap();
        let batch = Batch::complete("Lewisham", vec![raw("1", 950_000), raw("2", 1_000_000)]);

        let report = detector(0).process_batch(&store, &batch, t0()).await.unwrap();

        assert_eq!(report.events.len(), 2);
        assert!(report.events.iter().all(ChangeEvent::is_new));
        let active = store.get_active().await.unwrap();
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|l| l.is_active));
    }

    #[tokio::test]
    async fn store_error_mid_batch_rolls_back_the_whole_batch() {
        let store = seeded(vec![raw("2", 950_000)]).await;
        store
            .execute_raw(
                "CREATE TRIGGER reject_three BEFORE INSERT ON listings WHEN NEW.id = '3' \
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END",
            )
            .await
            .unwrap();

        let batch = Batch::complete("Lewisham", vec![raw("1", 990_000), raw("2", 925_000), raw("3", 1_000_000)]);
        let result = detector(0).process_batch(&store, &batch, t0() + Duration::hours(2)).await;

        assert!(result.is_err());
        assert!(store.get("1").await.unwrap().is_none());
        assert!(store.get("3").await.unwrap().is_none());
        let untouched = store.get("2").await.unwrap().unwrap();
        assert_eq!(untouched.price, 950_000);
        assert_eq!(untouched.last_seen_at, t0());
        assert_eq!(store.price_history("2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unchanged_price_refreshes_last_seen_without_event() {
        let store = seeded(vec![raw("1", 950_000)]).await;
        let later = t0() + Duration::hours(2);

        let report = detector(0)
            .process_batch(&store, &Batch::complete("Lewisham", vec![raw("1", 950_000)]), later)
            .await
            .unwrap();

        assert!(report.events.is_empty());
        assert_eq!(report.unchanged, 1);
        assert_eq!(store.get("1").await.unwrap().unwrap().last_seen_at, later);
    }

    #[tokio::test]
    async fn price_drop_with_zero_threshold() {
        let store = seeded(vec![raw("1", 950_000)]).await;

        let report = detector(0)
            .process_batch(
                &store,
                &Batch::complete("Lewisham", vec![raw("1", 925_000)]),
                t0() + Duration::hours(2),
            )
            .await
            .unwrap();

        assert_eq!(report.events.len(), 1);
        match &report.events[0] {
            ChangeEvent::PriceDrop {
                listing,
                old_price,
                new_price,
            } => {
                assert_eq!((*old_price, *new_price), (950_000, 925_000));
                assert_eq!(listing.price, 925_000);
            }
            other => panic!("expected a price drop, got {other:?}"),
        }
        assert_eq!(store.price_history("1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn drops_below_threshold_are_ignored() {
        let store = seeded(vec![raw("1", 950_000), raw("2", 950_000)]).await;

        let report = detector(10_000)
            .process_batch(
                &store,
                &Batch::complete("Lewisham", vec![raw("1", 945_000), raw("2", 940_000)]),
                t0() + Duration::hours(2),
            )
            .await
            .unwrap();

        assert_eq!(report.events.len(), 1);
        assert_eq!(report.events[0].listing().id, "2");
        // Still recorded, just not notified
        assert_eq!(store.get("1").await.unwrap().unwrap().price, 945_000);
    }

    #[tokio::test]
    async fn price_increase_never_notifies() {
        let store = seeded(vec![raw("1", 950_000)]).await;

        let report = detector(0)
            .process_batch(
                &store,
                &Batch::complete("Lewisham", vec![raw("1", 990_000)]),
                t0() + Duration::hours(2),
            )
            .await
            .unwrap();

        assert!(report.events.is_empty());
        assert_eq!(store.price_history("1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn same_batch_twice_only_notifies_once() {
        let store = ListingStore::open_in_memory().await.unwrap();
        let batch = Batch::complete("Lewisham", vec![raw("1", 950_000), raw("2", 975_000)]);
        let detector = detector(0);

        let first = detector.process_batch(&store, &batch, t0()).await.unwrap();
        let second = detector
            .process_batch(&store, &batch, t0() + Duration::minutes(1))
            .await
            .unwrap();

        assert_eq!(first.events.len(), 2);
        assert!(second.events.is_empty());
    }

    #[tokio::test]
    async fn absent_listing_goes_inactive_silently() {
        let store = seeded(vec![raw("1", 950_000), raw("2", 1_000_000)]).await;

        let report = detector(0)
            .process_batch(
                &store,
                &Batch::complete("Lewisham", vec![raw("1", 950_000)]),
                t0() + Duration::hours(2),
            )
            .await
            .unwrap();

        assert!(report.events.is_empty());
        assert_eq!(report.deactivated, 1);
        assert!(!store.get("2").await.unwrap().unwrap().is_active);
        assert!(store.get("1").await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn partial_batch_keeps_missing_listings_active() {
        let store = seeded(vec![raw("1", 950_000), raw("2", 1_000_000)]).await;

        let report = detector(0)
            .process_batch(
                &store,
                &Batch::partial("Lewisham", vec![raw("1", 950_000)]),
                t0() + Duration::hours(2),
            )
            .await
            .unwrap();

        assert_eq!(report.deactivated, 0);
        assert!(store.get("2").await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn other_areas_are_untouched() {
        let store = seeded(vec![raw("1", 950_000)]).await;

        detector(0)
            .process_batch(
                &store,
                &Batch::complete("Wandsworth", vec![raw("9", 950_000)]),
                t0() + Duration::hours(2),
            )
            .await
            .unwrap();

        assert!(store.get("1").await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn reappearing_listing_is_reactivated_without_event() {
        let store = seeded(vec![raw("1", 950_000), raw("2", 1_000_000)]).await;
        let d = detector(0);
        d.process_batch(&store, &Batch::complete("Lewisham", vec![raw("1", 950_000)]), t0() + Duration::hours(2))
            .await
            .unwrap();

        let report = d
            .process_batch(
                &store,
                &Batch::complete("Lewisham", vec![raw("1", 950_000), raw("2", 1_000_000)]),
                t0() + Duration::hours(4),
            )
            .await
            .unwrap();

        assert!(report.events.is_empty());
        assert_eq!(report.reactivated, 1);
        assert!(store.get("2").await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn malformed_records_are_skipped() {
        let store = ListingStore::open_in_memory().await.unwrap();
        let no_id = raw("", 950_000);
        let mut bad_price = raw("3", 0);
        bad_price.price = "Offers in excess of".to_string();

        let batch = Batch::complete("Lewisham", vec![no_id, raw("1", 950_000), bad_price]);
        let report = detector(0).process_batch(&store, &batch, t0()).await.unwrap();

        assert_eq!(report.rejected, 2);
        assert_eq!(report.events.len(), 1);
        assert_eq!(store.all_listings().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_ids_in_a_batch_count_once() {
        let store = ListingStore::open_in_memory().await.unwrap();
        let batch = Batch::complete("Lewisham", vec![raw("1", 950_000), raw("1", 900_000)]);

        let report = detector(0).process_batch(&store, &batch, t0()).await.unwrap();

        assert_eq!(report.events.len(), 1);
        assert_eq!(report.seen, 1);
        assert_eq!(store.get("1").await.unwrap().unwrap().price, 950_000);
    }

    #[test]
    fn threshold_is_inclusive() {
        let d = detector(5_000);
        assert!(d.is_price_drop(950_000, 945_000));
        assert!(!d.is_price_drop(950_000, 945_001));
        assert!(!d.is_price_drop(950_000, 960_000));
        assert!(detector(0).is_price_drop(950_000, 949_999));
        assert!(!detector(0).is_price_drop(950_000, 950_000));
    }
}
