pub mod capture;
pub mod domain;
pub mod filters;
pub mod query;
pub mod store;

pub use capture::QueryLogger;
pub use domain::{grouping_key, is_same_or_subdomain, normalize};
pub use query::GroupQuery;
pub use store::{BufferedQuery, LogStore};
