use serde::{Deserialize, Serialize};

/// Criteria shared by every search area
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchCriteria {
    pub min_bedrooms: u32,
    pub max_bedrooms: u32,
    /// Minimum price (GBP)
    pub min_price: i64,
    /// Maximum price (GBP)
    pub max_price: i64,
    /// Site property type filters, e.g. `semi-detached`
    pub property_types: Vec<String>,
    /// Drop listings whose tenure is explicitly leasehold
    pub filter_freehold: bool,
}

impl Default for SearchCriteria {
    fn default() -> Self {
        Self {
            min_bedrooms: 3,
            max_bedrooms: 4,
            min_price: 900_000,
            max_price: 1_100_000,
            property_types: vec![
                "detached".to_string(),
                "semi-detached".to_string(),
                "terraced".to_string(),
            ],
            filter_freehold: true,
        }
    }
}

/// One searched region, e.g. `Lewisham` / `REGION^61413`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchArea {
    pub name: String,
    /// Site location identifier (`REGION^…` or `OUTCODE^…`)
    pub identifier: String,
}

impl SearchArea {
    pub fn new(name: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identifier: identifier.into(),
        }
    }
}

/// A typeahead match for a place name
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocationSuggestion {
    #[serde(rename = "displayName", default)]
    pub display_name: String,
    #[serde(rename = "locationIdentifier", default)]
    pub identifier: String,
}
