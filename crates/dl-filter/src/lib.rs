pub mod classifier;
pub mod matcher;
pub mod sources;

pub use classifier::QueryClassifier;
pub use matcher::DomainMatcher;
