use std::fmt;
use std::sync::{Arc, Mutex};

use dl_common::RowRange;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Receiver of archive changes.
///
/// Callbacks run on whatever task the coordinator is working on. An
/// implementation that needs its own context (a view worker, a UI thread)
/// should hand the event over and return.
pub trait SyncObserver: Send + Sync {
    /// Everything changed; reload from `range` (`None`: nothing in scope).
    fn reset(&self, range: Option<RowRange>);
    /// Rows newly in scope.
    fn insert(&self, range: RowRange);
    /// Rows newly out of scope.
    fn remove(&self, range: RowRange);
    /// Rows for `domain` were deleted from the archive.
    fn partial_remove(&self, domain: &str);
}

/// A single observer notification, as a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncEvent {
    Reset(Option<RowRange>),
    Insert(RowRange),
    Remove(RowRange),
    PartialRemove(String),
}

impl SyncEvent {
    pub fn deliver(&self, observer: &dyn SyncObserver) {
        match self {
            SyncEvent::Reset(range) => observer.reset(*range),
            SyncEvent::Insert(range) => observer.insert(*range),
            SyncEvent::Remove(range) => observer.remove(*range),
            SyncEvent::PartialRemove(domain) => observer.partial_remove(domain),
        }
    }
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncEvent::Reset(Some(range)) => write!(f, "reset {}", range),
            SyncEvent::Reset(None) => write!(f, "reset (empty)"),
            SyncEvent::Insert(range) => write!(f, "insert {}", range),
            SyncEvent::Remove(range) => write!(f, "remove {}", range),
            SyncEvent::PartialRemove(domain) => write!(f, "partial remove {}", domain),
        }
    }
}

/// Token returned by `subscribe`; pass it to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Queued {
    /// Only observers subscribed before the event was emitted receive it.
    before: SubscriptionId,
    event: SyncEvent,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    observers: Vec<(SubscriptionId, Arc<dyn SyncObserver>)>,
    paused: usize,
    queued: Vec<Queued>,
}

/// Observer list plus the pause counter that holds back delivery.
#[derive(Default)]
pub(crate) struct Observers {
    registry: Mutex<Registry>,
}

impl Observers {
    pub(crate) fn subscribe(&self, observer: Arc<dyn SyncObserver>) -> SubscriptionId {
        let mut reg = self.registry.lock().unwrap();
        let id = SubscriptionId(reg.next_id);
        reg.next_id += 1;
        reg.observers.push((id, observer));
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut reg = self.registry.lock().unwrap();
        let before = reg.observers.len();
        reg.observers.retain(|(sid, _)| *sid != id);
        reg.observers.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.registry.lock().unwrap().observers.len()
    }

    /// Deliver `event` now, or queue it while paused.
    pub(crate) fn emit(&self, event: SyncEvent) {
        let targets = {
            let mut reg = self.registry.lock().unwrap();
            if reg.paused > 0 {
                debug!("Paused, queueing {}", event);
                let before = SubscriptionId(reg.next_id);
                reg.queued.push(Queued { before, event });
                return;
            }
            reg.observers.iter().map(|(_, o)| o.clone()).collect::<Vec<_>>()
        };

        debug!("Delivering {} to {} observer(s)", event, targets.len());
        for observer in targets {
            event.deliver(observer.as_ref());
        }
    }

    pub(crate) fn pause(&self) {
        self.registry.lock().unwrap().paused += 1;
    }

    /// Release one pause; the last release flushes the queue in order.
    pub(crate) fn resume(&self) {
        let (queued, observers) = {
            let mut reg = self.registry.lock().unwrap();
            debug_assert!(reg.paused > 0, "continue without pause");
            reg.paused = reg.paused.saturating_sub(1);
            if reg.paused > 0 || reg.queued.is_empty() {
                return;
            }
            (std::mem::take(&mut reg.queued), reg.observers.clone())
        };

        debug!("Resumed, flushing {} queued event(s)", queued.len());
        for Queued { before, event } in queued {
            for (id, observer) in &observers {
                if *id < before {
                    event.deliver(observer.as_ref());
                }
            }
        }
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.registry.lock().unwrap().paused > 0
    }
}

/// Holds delivery and periodic syncing back until dropped.
///
/// Guards nest; updates resume when the last one goes away. Leaking a guard
/// (`std::mem::forget`) suspends updates for good.
#[must_use = "updates resume as soon as the guard is dropped"]
pub struct PauseGuard {
    observers: Arc<Observers>,
}

impl PauseGuard {
    pub(crate) fn new(observers: Arc<Observers>) -> Self {
        observers.pause();
        Self { observers }
    }
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.observers.resume();
    }
}
