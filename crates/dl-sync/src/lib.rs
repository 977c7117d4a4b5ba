//! Reconciliation between the query log archive and the views built on it.

pub mod archive;
pub mod coordinator;
pub mod observer;
pub mod retention;
pub mod view;

pub use archive::LogArchive;
pub use coordinator::{MIN_SYNC_INTERVAL, OnDone, SyncCoordinator};
pub use observer::{PauseGuard, SubscriptionId, SyncEvent, SyncObserver};
pub use retention::run_retention;
pub use view::{DomainView, NoopDelegate, SortField, ViewChange, ViewDelegate};
