pub mod config;
pub mod detector;
pub mod export;
pub mod logging;
pub mod models;
pub mod notifier;
pub mod runner;
pub mod scrapers;
pub mod store;
pub mod sync;
