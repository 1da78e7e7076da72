pub mod rightmove;
pub mod traits;
pub mod types;

pub use rightmove::RightmoveScraper;
pub use traits::ScraperTrait;
pub use types::{LocationSuggestion, SearchArea, SearchCriteria};
