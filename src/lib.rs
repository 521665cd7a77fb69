pub mod app;
pub mod cli;
pub mod config;

pub use app::{open_store, AppContext};
pub use config::{AppConfig, StoreConfig};
