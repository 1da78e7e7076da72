use crate::models::{Listing, PricePoint, ValidListing};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

const LISTING_COLUMNS: &str = "id, price, bedrooms, address, property_type, url, bathrooms, \
     tenure, listed_on, area, first_seen_at, last_seen_at, is_active, watchlist";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to prepare database location: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// What an upsert did to the stored row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated {
        old_price: i64,
        new_price: i64,
        reactivated: bool,
    },
}

/// An active listing whose price never moved since it was first seen
#[derive(Debug, Clone, PartialEq)]
pub struct StaleListing {
    pub listing: Listing,
    pub days_on_market: i64,
    pub notified: bool,
}

#[derive(sqlx::FromRow)]
struct StaleRow {
    #[sqlx(flatten)]
    listing: Listing,
    initial_price: Option<i64>,
    stale_notified: bool,
}

/// SQLite-backed store of every listing ever observed.
///
/// Rows are never deleted: listings that disappear from the site are only
/// flagged inactive, and every price change is appended to `price_history`.
pub struct ListingStore {
    pool: SqlitePool,
}

impl ListingStore {
    /// Open (creating if needed) the database file at `path`
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let store = Self::connect(options).await?;
        info!("Database ready: {}", path.display());
        Ok(store)
    }

    /// Private in-memory database, used by tests and dry runs
    pub async fn open_in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> StoreResult<Self> {
        // One process, one writer. A single long-lived connection also keeps
        // an in-memory database alive for the lifetime of the store.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS listings (
                id             TEXT    PRIMARY KEY,
                price          INTEGER NOT NULL,
                bedrooms       INTEGER,
                address        TEXT    NOT NULL,
                property_type  TEXT    NOT NULL DEFAULT '',
                url            TEXT    NOT NULL DEFAULT '',
                bathrooms      INTEGER,
                tenure         TEXT    NOT NULL DEFAULT 'unknown',
                listed_on      TEXT,
                area           TEXT    NOT NULL,
                first_seen_at  TEXT    NOT NULL,
                last_seen_at   TEXT    NOT NULL,
                is_active      INTEGER NOT NULL DEFAULT 1,
                watchlist      INTEGER NOT NULL DEFAULT 0,
                stale_notified INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS price_history (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                listing_id  TEXT    NOT NULL,
                price       INTEGER NOT NULL,
                recorded_at TEXT    NOT NULL,
                FOREIGN KEY (listing_id) REFERENCES listings(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_listings_area_active ON listings(area, is_active)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_price_history_listing ON price_history(listing_id, id)",
        )
        .execute(&self.pool)
        .await?;

        debug!("Listing schema initialized");
        Ok(())
    }

    /// Start a transaction. Nothing written through the returned handle is
    /// visible until [`StoreTx::commit`]; dropping it rolls back.
    pub async fn begin(&self) -> StoreResult<StoreTx> {
        Ok(StoreTx {
            tx: self.pool.begin().await?,
        })
    }

    /// Insert or update a single listing in its own transaction
    pub async fn upsert(&self, listing: &ValidListing, now: DateTime<Utc>) -> StoreResult<UpsertOutcome> {
        let mut tx = self.begin().await?;
        let outcome = tx.upsert(listing, now).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Flag active listings of `area` that are not in `ids_seen` as inactive
    pub async fn mark_inactive(&self, area: &str, ids_seen: &HashSet<String>) -> StoreResult<u64> {
        let mut tx = self.begin().await?;
        let count = tx.mark_inactive(area, ids_seen).await?;
        tx.commit().await?;
        Ok(count)
    }

    pub async fn get(&self, id: &str) -> StoreResult<Option<Listing>> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = ?");
        let listing = sqlx::query_as::<_, Listing>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(listing)
    }

    pub async fn get_active(&self) -> StoreResult<Vec<Listing>> {
        let sql = format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE is_active = 1 ORDER BY first_seen_at DESC, id"
        );
        Ok(sqlx::query_as::<_, Listing>(&sql).fetch_all(&self.pool).await?)
    }

    pub async fn get_active_in_area(&self, area: &str) -> StoreResult<Vec<Listing>> {
        let sql = format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE is_active = 1 AND area = ? ORDER BY id"
        );
        Ok(sqlx::query_as::<_, Listing>(&sql)
            .bind(area)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Every listing, active first, newest first within each group
    pub async fn all_listings(&self) -> StoreResult<Vec<Listing>> {
        let sql = format!(
            "SELECT {LISTING_COLUMNS} FROM listings ORDER BY is_active DESC, first_seen_at DESC, id"
        );
        Ok(sqlx::query_as::<_, Listing>(&sql).fetch_all(&self.pool).await?)
    }

    /// Price history of one listing, oldest first
    pub async fn price_history(&self, id: &str) -> StoreResult<Vec<PricePoint>> {
        let history = sqlx::query_as::<_, PricePoint>(
            "SELECT recorded_at, price FROM price_history WHERE listing_id = ? ORDER BY id ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(history)
    }

    pub async fn initial_price(&self, id: &str) -> StoreResult<Option<i64>> {
        let price = sqlx::query_scalar::<_, i64>(
            "SELECT price FROM price_history WHERE listing_id = ? ORDER BY id ASC LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(price)
    }

    /// Active listings on the market for at least `min_days` whose price
    /// never changed, oldest first.
    pub async fn stale_listings(&self, min_days: i64, now: DateTime<Utc>) -> StoreResult<Vec<StaleListing>> {
        let sql = format!(
            r#"
            SELECT {LISTING_COLUMNS}, stale_notified,
                (SELECT ph.price FROM price_history ph
                 WHERE ph.listing_id = listings.id
                 ORDER BY ph.id ASC LIMIT 1) AS initial_price
            FROM listings
            WHERE is_active = 1
            "#
        );
        let rows = sqlx::query_as::<_, StaleRow>(&sql).fetch_all(&self.pool).await?;

        let mut stale: Vec<StaleListing> = rows
            .into_iter()
            .filter(|row| row.initial_price.unwrap_or(row.listing.price) == row.listing.price)
            .map(|row| StaleListing {
                days_on_market: (now - row.listing.first_seen_at).num_days(),
                listing: row.listing,
                notified: row.stale_notified,
            })
            .filter(|s| s.days_on_market >= min_days)
            .collect();

        stale.sort_by_key(|s| s.listing.first_seen_at);
        Ok(stale)
    }

    pub async fn mark_stale_notified(&self, ids: &[String]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("UPDATE listings SET stale_notified = 1 WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Returns false when no listing has this id
    pub async fn set_watchlist(&self, id: &str, on: bool) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE listings SET watchlist = ? WHERE id = ?")
            .bind(on)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn watchlist(&self) -> StoreResult<Vec<Listing>> {
        let sql = format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE watchlist = 1 ORDER BY first_seen_at DESC, id"
        );
        Ok(sqlx::query_as::<_, Listing>(&sql).fetch_all(&self.pool).await?)
    }

    /// Most recent `last_seen_at` across all listings, i.e. the time of the
    /// last run that stored anything.
    pub async fn latest_seen(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let latest = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT last_seen_at FROM listings ORDER BY last_seen_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(latest)
    }

    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> StoreResult<()> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }
}

/// Write handle over one store transaction
pub struct StoreTx {
    tx: Transaction<'static, Sqlite>,
}

impl StoreTx {
    /// Insert the listing if its id is unknown, otherwise refresh the stored
    /// row. A changed price is appended to the price history.
    pub async fn upsert(&mut self, listing: &ValidListing, now: DateTime<Utc>) -> StoreResult<UpsertOutcome> {
        let existing = sqlx::query_as::<_, (i64, DateTime<Utc>, bool)>(
            "SELECT price, last_seen_at, is_active FROM listings WHERE id = ?",
        )
        .bind(&listing.id)
        .fetch_optional(&mut *self.tx)
        .await?;

        let Some((old_price, last_seen_at, was_active)) = existing else {
            sqlx::query(
                r#"
                INSERT INTO listings (
                    id, price, bedrooms, address, property_type, url,
                    bathrooms, tenure, listed_on, area,
                    first_seen_at, last_seen_at, is_active
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
                "#,
            )
            .bind(&listing.id)
            .bind(listing.price)
            .bind(listing.bedrooms)
            .bind(&listing.address)
            .bind(&listing.property_type)
            .bind(&listing.url)
            .bind(listing.bathrooms)
            .bind(&listing.tenure)
            .bind(listing.listed_on)
            .bind(&listing.area)
            .bind(now)
            .bind(now)
            .execute(&mut *self.tx)
            .await?;

            self.append_price(&listing.id, listing.price, now).await?;
            return Ok(UpsertOutcome::Inserted);
        };

        // last_seen_at never moves backwards, even if the clock does
        let seen_at = now.max(last_seen_at);

        if listing.price != old_price {
            self.append_price(&listing.id, listing.price, seen_at).await?;
        }

        sqlx::query(
            r#"
            UPDATE listings
            SET price         = ?,
                bedrooms      = ?,
                address       = ?,
                property_type = ?,
                url           = ?,
                bathrooms     = ?,
                tenure        = ?,
                listed_on     = ?,
                area          = ?,
                last_seen_at  = ?,
                is_active     = 1
            WHERE id = ?
            "#,
        )
        .bind(listing.price)
        .bind(listing.bedrooms)
        .bind(&listing.address)
        .bind(&listing.property_type)
        .bind(&listing.url)
        .bind(listing.bathrooms)
        .bind(&listing.tenure)
        .bind(listing.listed_on)
        .bind(&listing.area)
        .bind(seen_at)
        .bind(&listing.id)
        .execute(&mut *self.tx)
        .await?;

        Ok(UpsertOutcome::Updated {
            old_price,
            new_price: listing.price,
            reactivated: !was_active,
        })
    }

    async fn append_price(&mut self, id: &str, price: i64, recorded_at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("INSERT INTO price_history (listing_id, price, recorded_at) VALUES (?, ?, ?)")
            .bind(id)
            .bind(price)
            .bind(recorded_at)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Read a listing through this transaction, seeing its uncommitted writes
    pub async fn fetch(&mut self, id: &str) -> StoreResult<Listing> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = ?");
        let listing = sqlx::query_as::<_, Listing>(&sql)
            .bind(id)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(listing)
    }

    pub async fn mark_inactive(&mut self, area: &str, ids_seen: &HashSet<String>) -> StoreResult<u64> {
        let active: Vec<String> =
            sqlx::query_scalar("SELECT id FROM listings WHERE area = ? AND is_active = 1")
                .bind(area)
                .fetch_all(&mut *self.tx)
                .await?;

        let mut count = 0;
        for id in active.iter().filter(|id| !ids_seen.contains(*id)) {
            let result = sqlx::query("UPDATE listings SET is_active = 0 WHERE id = ?")
                .bind(id)
                .execute(&mut *self.tx)
                .await?;
            count += result.rows_affected();
        }

        if count > 0 {
            info!(area, count, "Marked listings inactive");
        }
        Ok(count)
    }

    pub async fn commit(self) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
    }

    fn listing(id: &str, price: i64, area: &str) -> ValidListing {
        ValidListing {
            id: id.to_string(),
            price,
            bedrooms: Some(3),
            address: format!("{id} Test Road"),
            property_type: "Terraced".to_string(),
            bathrooms: Some(2),
            tenure: "freehold".to_string(),
            listed_on: None,
            url: format!("https://www.rightmove.co.uk/properties/{id}"),
            area: area.to_string(),
        }
    }

    #[tokio::test]
    async fn upsert_inserts_then_updates_same_row() {
        let store = ListingStore::open_in_memory().await.unwrap();

        let first = store.upsert(&listing("1", 950_000, "Lewisham"), at(1, 8)).await.unwrap();
        assert_eq!(first, UpsertOutcome::Inserted);

        let second = store.upsert(&listing("1", 950_000, "Lewisham"), at(1, 10)).await.unwrap();
        assert_eq!(
            second,
            UpsertOutcome::Updated {
                old_price: 950_000,
                new_price: 950_000,
                reactivated: false
            }
        );

        let all = store.all_listings().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].first_seen_at, at(1, 8));
        assert_eq!(all[0].last_seen_at, at(1, 10));
        assert!(all[0].is_active);
        assert_eq!(all[0].bathrooms, Some(2));
        assert_eq!(all[0].tenure, "freehold");
    }

    #[tokio::test]
    async fn upsert_keeps_listing_date_and_latest_tenure() {
        let store = ListingStore::open_in_memory().await.unwrap();
        let listed_on = chrono::NaiveDate::from_ymd_opt(2026, 2, 14);
        let mut first = listing("1", 950_000, "Lewisham");
        first.listed_on = listed_on;
        first.tenure = "unknown".to_string();
        store.upsert(&first, at(1, 8)).await.unwrap();

        let mut second = first.clone();
        second.tenure = "freehold".to_string();
        store.upsert(&second, at(1, 10)).await.unwrap();

        let stored = store.get("1").await.unwrap().unwrap();
        assert_eq!(stored.listed_on, listed_on);
        assert_eq!(stored.tenure, "freehold");
    }

    #[tokio::test]
    async fn price_change_appends_history() {
        let store = ListingStore::open_in_memory().await.unwrap();
        store.upsert(&listing("1", 950_000, "Lewisham"), at(1, 8)).await.unwrap();
        store.upsert(&listing("1", 950_000, "Lewisham"), at(1, 10)).await.unwrap();
        store.upsert(&listing("1", 925_000, "Lewisham"), at(1, 12)).await.unwrap();

        let history = store.price_history("1").await.unwrap();
        assert_eq!(
            history,
            vec![
                PricePoint { recorded_at: at(1, 8), price: 950_000 },
                PricePoint { recorded_at: at(1, 12), price: 925_000 },
            ]
        );
        assert_eq!(store.initial_price("1").await.unwrap(), Some(950_000));
        assert_eq!(store.get("1").await.unwrap().unwrap().price, 925_000);
    }

    #[tokio::test]
    async fn last_seen_never_moves_backwards() {
        let store = ListingStore::open_in_memory().await.unwrap();
        store.upsert(&listing("1", 950_000, "Lewisham"), at(2, 8)).await.unwrap();
        store.upsert(&listing("1", 940_000, "Lewisham"), at(1, 8)).await.unwrap();

        let stored = store.get("1").await.unwrap().unwrap();
        assert_eq!(stored.last_seen_at, at(2, 8));

        let history = store.price_history("1").await.unwrap();
        assert!(history.windows(2).all(|w| w[0].recorded_at <= w[1].recorded_at));
    }

    #[tokio::test]
    async fn mark_inactive_only_touches_the_given_area() {
        let store = ListingStore::open_in_memory().await.unwrap();
        store.upsert(&listing("1", 950_000, "Lewisham"), at(1, 8)).await.unwrap();
        store.upsert(&listing("2", 990_000, "Lewisham"), at(1, 8)).await.unwrap();
        store.upsert(&listing("3", 990_000, "Wandsworth"), at(1, 8)).await.unwrap();

        let seen: HashSet<String> = ["1".to_string()].into_iter().collect();
        let count = store.mark_inactive("Lewisham", &seen).await.unwrap();
        assert_eq!(count, 1);

        let active: Vec<String> = store.get_active().await.unwrap().into_iter().map(|l| l.id).collect();
        assert_eq!(active.len(), 2);
        assert!(active.contains(&"1".to_string()));
        assert!(active.contains(&"3".to_string()));
        assert!(!store.get("2").await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn reappearing_listing_is_reactivated() {
        let store = ListingStore::open_in_memory().await.unwrap();
        store.upsert(&listing("1", 950_000, "Lewisham"), at(1, 8)).await.unwrap();
        store.mark_inactive("Lewisham", &HashSet::new()).await.unwrap();

        let outcome = store.upsert(&listing("1", 950_000, "Lewisham"), at(2, 8)).await.unwrap();
        assert_eq!(
            outcome,
            UpsertOutcome::Updated {
                old_price: 950_000,
                new_price: 950_000,
                reactivated: true
            }
        );
        assert!(store.get("1").await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = ListingStore::open_in_memory().await.unwrap();
        {
            let mut tx = store.begin().await.unwrap();
            tx.upsert(&listing("1", 950_000, "Lewisham"), at(1, 8)).await.unwrap();
            assert_eq!(tx.fetch("1").await.unwrap().price, 950_000);
        }
        assert!(store.get("1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_listings_skip_reduced_and_recent() {
        let store = ListingStore::open_in_memory().await.unwrap();
        store.upsert(&listing("old", 950_000, "Lewisham"), at(1, 8)).await.unwrap();
        store.upsert(&listing("cut", 990_000, "Lewisham"), at(1, 8)).await.unwrap();
        store.upsert(&listing("cut", 980_000, "Lewisham"), at(2, 8)).await.unwrap();
        store.upsert(&listing("new", 990_000, "Lewisham"), at(20, 8)).await.unwrap();

        let stale = store.stale_listings(14, at(25, 8)).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].listing.id, "old");
        assert_eq!(stale[0].days_on_market, 24);
        assert!(!stale[0].notified);

        store.mark_stale_notified(&["old".to_string()]).await.unwrap();
        assert!(store.stale_listings(14, at(25, 8)).await.unwrap()[0].notified);
    }

    #[tokio::test]
    async fn watchlist_toggles_known_ids_only() {
        let store = ListingStore::open_in_memory().await.unwrap();
        store.upsert(&listing("1", 950_000, "Lewisham"), at(1, 8)).await.unwrap();

        assert!(store.set_watchlist("1", true).await.unwrap());
        assert!(!store.set_watchlist("missing", true).await.unwrap());
        assert_eq!(store.watchlist().await.unwrap().len(), 1);

        assert!(store.set_watchlist("1", false).await.unwrap());
        assert!(store.watchlist().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn latest_seen_tracks_most_recent_run() {
        let store = ListingStore::open_in_memory().await.unwrap();
        assert_eq!(store.latest_seen().await.unwrap(), None);

        store.upsert(&listing("1", 950_000, "Lewisham"), at(1, 8)).await.unwrap();
        store.upsert(&listing("2", 950_000, "Lewisham"), at(3, 8)).await.unwrap();
        assert_eq!(store.latest_seen().await.unwrap(), Some(at(3, 8)));
    }

    #[tokio::test]
    async fn open_creates_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("properties.db");
        {
            let store = ListingStore::open(&path).await.unwrap();
            store.upsert(&listing("1", 950_000, "Lewisham"), at(1, 8)).await.unwrap();
        }
        let reopened = ListingStore::open(&path).await.unwrap();
        assert!(reopened.get("1").await.unwrap().is_some());
    }
}
