pub mod config;
pub mod error;
pub mod types;

pub use config::AppConfig;
pub use error::AppError;
pub use types::{DomainRecord, FilterOptions, RowRange};

/// Current wall-clock time as unix seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
