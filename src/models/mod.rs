use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Listing record as handed over by a scraper, before validation.
///
/// `price` is kept as the scraped text so that malformed values can be
/// rejected per record instead of failing the whole page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawListing {
    pub id: String,
    pub price: String,
    pub bedrooms: Option<u32>,
    pub address: String,
    pub property_type: String,
    pub url: String,
    pub bathrooms: Option<u32>,
    /// `freehold`, `leasehold` or `unknown`
    pub tenure: String,
    /// Date the advert was first listed or last updated by the agent
    pub listed_on: Option<NaiveDate>,
}

/// Reasons a scraped record is rejected before it reaches the store
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ListingError {
    #[error("listing has no id")]
    MissingId,
    #[error("listing {id} has non-numeric price {price:?}")]
    InvalidPrice { id: String, price: String },
}

/// A scraped listing that passed validation, tagged with the search area
/// whose batch reported it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidListing {
    pub id: String,
    pub price: i64,
    pub bedrooms: Option<u32>,
    pub address: String,
    pub property_type: String,
    pub url: String,
    pub bathrooms: Option<u32>,
    pub tenure: String,
    pub listed_on: Option<NaiveDate>,
    pub area: String,
}

impl RawListing {
    pub fn validate(&self, area: &str) -> Result<ValidListing, ListingError> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(ListingError::MissingId);
        }

        let price = parse_price(&self.price).ok_or_else(|| ListingError::InvalidPrice {
            id: id.to_string(),
            price: self.price.clone(),
        })?;

        Ok(ValidListing {
            id: id.to_string(),
            price,
            bedrooms: self.bedrooms,
            address: self.address.trim().to_string(),
            property_type: self.property_type.trim().to_string(),
            url: self.url.trim().to_string(),
            bathrooms: self.bathrooms,
            tenure: match self.tenure.trim().to_lowercase() {
                t if t.is_empty() => "unknown".to_string(),
                t => t,
            },
            listed_on: self.listed_on,
            area: area.to_string(),
        })
    }
}

/// Parse a scraped price such as `"950000"`, `"£950,000"` or `"1 100 000"`.
/// Zero and negative prices ("POA" adverts) are not usable prices.
pub fn parse_price(text: &str) -> Option<i64> {
    let cleaned: String = text
        .trim()
        .trim_start_matches('£')
        .chars()
        .filter(|c| !matches!(c, ',' | '_' | ' ' | '\u{a0}'))
        .collect();

    match cleaned.parse::<i64>() {
        Ok(price) if price > 0 => Some(price),
        _ => None,
    }
}

/// Every listing one scrape of one search area returned
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub area: String,
    pub listings: Vec<RawListing>,
    /// False when some result page could not be fetched. Listings missing
    /// from an incomplete batch are never marked inactive.
    pub complete: bool,
}

impl Batch {
    pub fn complete(area: impl Into<String>, listings: Vec<RawListing>) -> Self {
        Self {
            area: area.into(),
            listings,
            complete: true,
        }
    }

    pub fn partial(area: impl Into<String>, listings: Vec<RawListing>) -> Self {
        Self {
            area: area.into(),
            listings,
            complete: false,
        }
    }
}

/// Latest known state of one property advert
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct Listing {
    pub id: String,
    pub price: i64,
    pub bedrooms: Option<u32>,
    pub address: String,
    pub property_type: String,
    pub url: String,
    pub bathrooms: Option<u32>,
    pub tenure: String,
    pub listed_on: Option<NaiveDate>,
    pub area: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub is_active: bool,
    pub watchlist: bool,
}

/// One entry of a listing's price history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct PricePoint {
    pub recorded_at: DateTime<Utc>,
    pub price: i64,
}
