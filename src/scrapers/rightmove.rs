use crate::config::ScraperConfig;
use crate::models::{Batch, RawListing};
use crate::scrapers::traits::ScraperTrait;
use crate::scrapers::types::{LocationSuggestion, SearchArea, SearchCriteria};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, REFERER};
use reqwest::{Client, StatusCode, Url};
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const BASE_URL: &str = "https://www.rightmove.co.uk";
const SEARCH_PATH: &str = "/property-for-sale/find.html";
const TYPEAHEAD_URL: &str = "https://api.rightmove.co.uk/api/typeAhead/uknoauth";
const RESULTS_PER_PAGE: u32 = 24;
const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(60);
const MAX_ATTEMPTS: u32 = 2;
const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.6261.112 Safari/537.36";

/// Rightmove search-results scraper.
///
/// Every results page embeds its data as JSON, either assigned to
/// `window.jsonModel` (server-rendered pages) or inside the Next.js
/// `__NEXT_DATA__` script. That JSON is read instead of the markup.
pub struct RightmoveScraper {
    client: Client,
    criteria: SearchCriteria,
    settings: ScraperConfig,
    requests_made: AtomicBool,
}

impl RightmoveScraper {
    pub fn new(criteria: SearchCriteria, settings: ScraperConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .user_agent(USER_AGENT)
            .cookie_store(true)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            criteria,
            settings,
            requests_made: AtomicBool::new(false),
        })
    }

    /// Sleep the fixed request delay before every request but the first
    async fn pace(&self) {
        if self.requests_made.swap(true, Ordering::Relaxed) {
            debug!("Waiting {:?} before next request", self.settings.request_delay);
            tokio::time::sleep(self.settings.request_delay).await;
        }
    }

    /// GET a page, returning `None` on any failure. A 429 gets one retry
    /// after a long back-off.
    async fn fetch(&self, url: &Url, referer: Option<&str>) -> Option<String> {
        for attempt in 1..=MAX_ATTEMPTS {
            self.pace().await;

            let mut request = self
                .client
                .get(url.clone())
                .header(ACCEPT, "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
                .header(ACCEPT_LANGUAGE, "en-GB,en;q=0.9");
            if let Some(referer) = referer {
                request = request.header(REFERER, referer);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    error!("HTTP error fetching {}: {}", url, e);
                    return None;
                }
            };

            match response.status() {
                StatusCode::TOO_MANY_REQUESTS => match rate_limit_backoff(attempt) {
                    Some(backoff) => {
                        warn!("Rate-limited (429) on attempt {}, backing off {:?}", attempt, backoff);
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    None => {
                        warn!("Rate-limited (429) fetching {}, giving up", url);
                        return None;
                    }
                },
                StatusCode::FORBIDDEN => {
                    warn!("Blocked (403) fetching {}", url);
                    return None;
                }
                status if !status.is_success() => {
                    error!("HTTP {} fetching {}", status, url);
                    return None;
                }
                _ => {}
            }

            return match response.text().await {
                Ok(body) => {
                    debug!("Downloaded {} bytes from {}", body.len(), url);
                    Some(body)
                }
                Err(e) => {
                    error!("Failed to read response body from {}: {}", url, e);
                    None
                }
            };
        }
        None
    }

    /// Query the site's typeahead API for the identifier of a place name
    pub async fn lookup_location(&self, query: &str) -> Result<Vec<LocationSuggestion>> {
        #[derive(Deserialize)]
        struct TypeAhead {
            #[serde(rename = "typeAheadLocations", default)]
            locations: Vec<LocationSuggestion>,
        }

        let response = self
            .client
            .get(TYPEAHEAD_URL)
            .query(&[
                ("query", query),
                ("numberOfSuggestions", "5"),
                ("request_source", "WWW"),
            ])
            .send()
            .await
            .context("Failed to query location typeahead")?
            .error_for_status()
            .context("Location typeahead returned an error status")?;

        let body: TypeAhead = response.json().await.context("Failed to decode typeahead response")?;
        Ok(body.locations)
    }
}

#[async_trait]
impl ScraperTrait for RightmoveScraper {
    /// Visit the home page first to pick up session cookies; without them
    /// the first search request is often intercepted by bot detection.
    async fn warm_up(&self) {
        self.pace().await;
        match self.client.get(BASE_URL).send().await {
            Ok(response) => debug!("Warm-up request: HTTP {}", response.status()),
            Err(e) => warn!("Warm-up request failed (continuing anyway): {}", e),
        }
    }

    async fn scrape_area(&self, area: &SearchArea) -> Result<Batch> {
        info!("Scraping: {} ({})", area.name, area.identifier);

        let referer = format!("{BASE_URL}/property-for-sale/");
        let mut listings = Vec::new();
        let mut page_index: u32 = 0;
        let mut complete = true;

        loop {
            let url = search_url(&self.criteria, &area.identifier, page_index)?;

            let model = match self.fetch(&url, Some(&referer)).await {
                Some(html) => extract_json_model(&html),
                None => None,
            };
            let Some(model) = model else {
                if page_index == 0 {
                    bail!("No listing data for {} on the first results page", area.name);
                }
                warn!("{} - no listing data at index {}; batch is incomplete", area.name, page_index);
                complete = false;
                break;
            };

            if page_index == 0 {
                match result_count(&model) {
                    Some(total) => info!("{} - {} total results", area.name, total),
                    None => info!("{} - unknown total results", area.name),
                }
            }

            let properties = model
                .get("properties")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            if properties.is_empty() {
                debug!("{} - empty properties list at index {}", area.name, page_index);
                break;
            }

            listings.extend(
                properties
                    .iter()
                    .filter_map(|raw| parse_property(raw, self.criteria.filter_freehold)),
            );
            debug!(
                "{} - page {} -> {} listings accumulated",
                area.name,
                page_index / RESULTS_PER_PAGE + 1,
                listings.len()
            );

            let Some(next_index) = next_page_index(&model) else {
                break;
            };
            if next_index <= page_index {
                break;
            }
            if page_cap_reached(next_index, self.settings.max_pages_per_area) {
                warn!(
                    "{} - reached page cap ({} pages); batch is incomplete",
                    area.name, self.settings.max_pages_per_area
                );
                complete = false;
                break;
            }
            page_index = next_index;
        }

        info!("{} - done ({} listings)", area.name, listings.len());

        Ok(if complete {
            Batch::complete(&area.name, listings)
        } else {
            Batch::partial(&area.name, listings)
        })
    }

    fn source_name(&self) -> &'static str {
        "Rightmove"
    }
}

/// Build the results URL for one page of an area search
pub fn search_url(criteria: &SearchCriteria, identifier: &str, index: u32) -> Result<Url> {
    let params = [
        ("locationIdentifier", identifier.to_string()),
        ("minBedrooms", criteria.min_bedrooms.to_string()),
        ("maxBedrooms", criteria.max_bedrooms.to_string()),
        ("minPrice", criteria.min_price.to_string()),
        ("maxPrice", criteria.max_price.to_string()),
        ("propertyTypes", criteria.property_types.join(",")),
        ("mustHave", String::new()),
        ("dontShow", "newHome,sharedOwnership,retirement".to_string()),
        ("furnishTypes", String::new()),
        ("keywords", String::new()),
        ("index", index.to_string()),
    ];
    Url::parse_with_params(&format!("{BASE_URL}{SEARCH_PATH}"), &params).context("Failed to build search URL")
}

/// Pull the search-result JSON out of a results page
pub fn extract_json_model(html: &str) -> Option<Value> {
    if html.contains("We couldn\u{2019}t find the place you were looking for")
        || html.contains("We couldn't find the place you were looking for")
    {
        warn!("Site returned a 'not found' page - location identifier may be stale");
        return None;
    }

    for (pos, marker) in html.match_indices("window.jsonModel") {
        let rest = &html[pos + marker.len()..];
        let Some(after_eq) = rest.trim_start().strip_prefix('=') else {
            continue;
        };
        let body = after_eq.trim_start();
        if !body.starts_with('{') {
            continue;
        }
        let start = html.len() - body.len();
        if let Some(json) = extract_balanced_json(html, start) {
            match serde_json::from_str(json) {
                Ok(model) => return Some(model),
                Err(e) => debug!("window.jsonModel decode failed: {}", e),
            }
        }
    }

    if let Some(model) = extract_next_data(html) {
        return Some(model);
    }

    warn!("Could not extract listing data from page");
    let snippet: String = html.chars().take(300).collect();
    warn!("Page snippet: {}", snippet.replace('\n', " "));
    None
}

fn extract_next_data(html: &str) -> Option<Value> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("script#__NEXT_DATA__").ok()?;
    let text: String = document.select(&selector).next()?.text().collect();

    let next_data: Value = match serde_json::from_str(&text) {
        Ok(data) => data,
        Err(e) => {
            debug!("__NEXT_DATA__ decode failed: {}", e);
            return None;
        }
    };

    let page_props = next_data.pointer("/props/pageProps")?;
    let properties = ["/properties", "/searchResults/properties", "/results/properties"]
        .iter()
        .filter_map(|path| page_props.pointer(path))
        .find(|v| v.is_array());

    let Some(properties) = properties else {
        let keys: Vec<&str> = page_props
            .as_object()
            .map(|o| o.keys().map(String::as_str).take(20).collect())
            .unwrap_or_default();
        warn!("__NEXT_DATA__ found but no properties; pageProps keys: {:?}", keys);
        return None;
    };

    let count = properties.as_array().map(Vec::len).unwrap_or(0);
    Some(json!({
        "properties": properties,
        "pagination": page_props.get("pagination").cloned().unwrap_or(Value::Null),
        "resultCount": page_props.get("resultCount").cloned().unwrap_or_else(|| json!(count)),
    }))
}

/// Return the balanced `{...}` object starting at byte `start`, honouring
/// braces inside string literals.
pub fn extract_balanced_json(text: &str, start: usize) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.get(start..)?.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            _ if in_string => {}
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Convert one raw result into a [`RawListing`]. Returns `None` for
/// non-object entries and, when `filter_freehold` is set, for explicit
/// leaseholds. Missing ids and prices are passed through for validation.
pub fn parse_property(raw: &Value, filter_freehold: bool) -> Option<RawListing> {
    if !raw.is_object() {
        return None;
    }

    let id = value_text(&raw["id"]);

    let tenure = match &raw["tenure"] {
        Value::Object(block) => block
            .get("tenureType")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_lowercase(),
        Value::String(s) => s.to_lowercase(),
        _ => "unknown".to_string(),
    };
    if filter_freehold && tenure == "leasehold" {
        debug!("Skipping leasehold listing {}", id);
        return None;
    }

    let property_type = ["propertySubType", "propertyType"]
        .iter()
        .filter_map(|key| raw[*key].as_str())
        .find(|s| !s.is_empty())
        .unwrap_or_default()
        .to_string();

    let address = raw["displayAddress"]
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("Unknown")
        .to_string();

    let mut url = raw["propertyUrl"].as_str().unwrap_or_default().to_string();
    if !url.is_empty() && !url.starts_with("http") {
        url = format!("{BASE_URL}{url}");
    }

    Some(RawListing {
        id,
        price: value_text(&raw["price"]["amount"]),
        bedrooms: raw["bedrooms"].as_u64().and_then(|b| u32::try_from(b).ok()),
        address,
        property_type,
        url,
        bathrooms: raw["bathrooms"].as_u64().and_then(|b| u32::try_from(b).ok()),
        tenure,
        listed_on: listing_date(raw),
    })
}

/// Agent's last update, else the date the advert first became visible
fn listing_date(raw: &Value) -> Option<NaiveDate> {
    let text = raw["listingUpdate"]["listingUpdateDate"]
        .as_str()
        .filter(|s| !s.is_empty())
        .or_else(|| raw["firstVisibleDate"].as_str())?;
    let day = text.split('T').next().unwrap_or(text);
    NaiveDate::parse_from_str(day.trim(), "%Y-%m-%d").ok()
}

/// Back-off before retrying a rate-limited request, `None` on the last attempt
fn rate_limit_backoff(attempt: u32) -> Option<Duration> {
    (attempt < MAX_ATTEMPTS).then_some(RATE_LIMIT_BACKOFF)
}

fn page_cap_reached(next_index: u32, max_pages: u32) -> bool {
    next_index >= max_pages.saturating_mul(RESULTS_PER_PAGE)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

fn result_count(model: &Value) -> Option<u64> {
    match &model["resultCount"] {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.replace(',', "").trim().parse().ok(),
        _ => None,
    }
}

fn next_page_index(model: &Value) -> Option<u32> {
    match &model["pagination"]["next"] {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
