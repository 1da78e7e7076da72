use crate::models::Batch;
use crate::scrapers::types::SearchArea;
use anyhow::Result;
use async_trait::async_trait;

/// Common trait for listing sources
#[async_trait]
pub trait ScraperTrait: Send + Sync {
    /// Called once per run before the first area is scraped
    async fn warm_up(&self) {}

    /// Scrape every result page of one search area
    async fn scrape_area(&self, area: &SearchArea) -> Result<Batch>;

    /// Get the name of the scraper source
    fn source_name(&self) -> &'static str;
}
