use crate::models::Listing;
use crate::store::{ListingStore, StoreError};
use chrono::SecondsFormat;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// One CSV row; field order is the column order
#[derive(Debug, Serialize)]
struct ExportRow<'a> {
    id: &'a str,
    address: &'a str,
    price: i64,
    bedrooms: Option<u32>,
    #[serde(rename = "type")]
    property_type: &'a str,
    url: &'a str,
    first_seen: String,
    last_seen: String,
}

impl<'a> From<&'a Listing> for ExportRow<'a> {
    fn from(listing: &'a Listing) -> Self {
        Self {
            id: &listing.id,
            address: &listing.address,
            price: listing.price,
            bedrooms: listing.bedrooms,
            property_type: &listing.property_type,
            url: &listing.url,
            first_seen: listing.first_seen_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            last_seen: listing.last_seen_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Write `listings` as CSV to any writer
pub fn write_csv<W: std::io::Write>(writer: W, listings: &[Listing]) -> Result<(), ExportError> {
    let mut csv = csv::Writer::from_writer(writer);
    if listings.is_empty() {
        // serialize() only emits the header alongside the first row
        csv.write_record(["id", "address", "price", "bedrooms", "type", "url", "first_seen", "last_seen"])?;
    }
    for listing in listings {
        csv.serialize(ExportRow::from(listing))?;
    }
    csv.flush().map_err(csv::Error::from)?;
    Ok(())
}

/// Export every active listing to `path`, one row each.
///
/// The file is written next to the target and renamed into place, so a sync
/// tool never sees a half-written export. Returns the number of rows.
pub async fn export_active(store: &ListingStore, path: &Path) -> Result<usize, ExportError> {
    let listings = store.get_active().await?;

    let tmp_path = path.with_extension("csv.tmp");
    let io_err = |source: std::io::Error| ExportError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut buffer = Vec::new();
    write_csv(&mut buffer, &listings)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    let written = match fs::write(&tmp_path, &buffer).await {
        Ok(()) => fs::rename(&tmp_path, path).await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        if let Err(cleanup) = fs::remove_file(&tmp_path).await {
            debug!("Could not remove {}: {}", tmp_path.display(), cleanup);
        }
        return Err(io_err(e));
    }

    info!("Exported {} listing(s) to {}", listings.len(), path.display());
    Ok(listings.len())
}
