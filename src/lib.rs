pub mod admin;
pub mod category_scanner;
pub mod config;
pub mod cooldown;
pub mod coordinator;
pub mod dedupe;
pub mod detector;
pub mod fetcher;
pub mod models;
pub mod plugins;
pub mod proxy_pool;
pub mod repository;
pub mod scan_lock;
pub mod scheduler;
pub mod sink;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use config::AppConfig;
pub use coordinator::{RunOutcome, ScanCoordinator};
pub use utils::error::AppError;

pub type Result<T> = std::result::Result<T, AppError>;
